// SPDX-License-Identifier: MIT OR Apache-2.0
//! Progress reporting and the retry orchestrator: an ordered map of named
//! steps each tracked through an `Idle -> Running -> {Completed,Cancelled,Failed} -> Running`
//! state machine, published to subscribers on every transition.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::info;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Error;
use crate::settings::RetrySettings;

/// One step's lifecycle:
///
/// ```text
/// Idle --> Skipped
/// |
/// `----> Running --> Completed --> Running
/// |
/// |------> Cancelled --> Running
/// |
/// `------> Failed -----> Running
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status_type", rename_all = "lowercase")]
pub enum StepStatus
{
    Idle
    {
        tries: u32
    },
    Skipped
    {
        tries: u32
    },
    Running
    {
        tries: u32, begin_at: DateTime<Utc>
    },
    Completed
    {
        tries: u32, begin_at: DateTime<Utc>, end_at: DateTime<Utc>
    },
    Cancelled
    {
        tries: u32, begin_at: DateTime<Utc>, end_at: DateTime<Utc>
    },
    Failed
    {
        tries: u32, begin_at: DateTime<Utc>, end_at: DateTime<Utc>
    },
}

impl StepStatus
{
    pub fn idle() -> Self
    {
        StepStatus::Idle { tries: 0 }
    }

    fn run(&self) -> Self
    {
        let tries = match self {
            StepStatus::Idle { tries } => *tries,
            StepStatus::Completed { tries, .. } | StepStatus::Cancelled { tries, .. } | StepStatus::Failed { tries, .. } => *tries,
            _ => unreachable!("run() only called from Idle/Completed/Cancelled/Failed"),
        };
        StepStatus::Running { tries: tries + 1, begin_at: Utc::now() }
    }

    fn skip(&self) -> Self
    {
        StepStatus::Skipped { tries: 0 }
    }

    fn cancel(&self) -> Self
    {
        let StepStatus::Running { tries, begin_at } = self else {
            unreachable!("cancel() only called from Running");
        };
        StepStatus::Cancelled { tries: *tries, begin_at: *begin_at, end_at: Utc::now() }
    }

    fn complete(&self) -> Self
    {
        let StepStatus::Running { tries, begin_at } = self else {
            unreachable!("complete() only called from Running");
        };
        StepStatus::Completed { tries: *tries, begin_at: *begin_at, end_at: Utc::now() }
    }

    fn fail(&self) -> Self
    {
        let StepStatus::Running { tries, begin_at } = self else {
            unreachable!("fail() only called from Running");
        };
        StepStatus::Failed { tries: *tries, begin_at: *begin_at, end_at: Utc::now() }
    }
}

/// Ordered so that a rendered progress display lists steps in declaration order,
/// not insertion-order-after-mutation.
pub type StatusMap = IndexMap<String, StepStatus>;

/// Publishes the full status map on every transition; an "unbounded" broadcast in
/// spirit, implemented as a `watch` channel since only the latest
/// snapshot ever matters to a subscriber.
pub struct ProgressManager
{
    status_map: StatusMap,
    sender: Option<watch::Sender<StatusMap>>,
}

impl ProgressManager
{
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self
    {
        let status_map = names.into_iter().map(|name| (name.into(), StepStatus::idle())).collect();
        Self { status_map, sender: None }
    }

    /// Subscribe to status-map snapshots; the channel immediately carries the current map.
    pub fn subscribe(&mut self) -> watch::Receiver<StatusMap>
    {
        if let Some(sender) = &self.sender {
            return sender.subscribe();
        }
        let (sender, receiver) = watch::channel(self.status_map.clone());
        self.sender = Some(sender);
        receiver
    }

    fn publish(&self)
    {
        if let Some(sender) = &self.sender {
            let _ = sender.send(self.status_map.clone());
        }
    }

    fn transition(&mut self, name: &str, next: impl FnOnce(&StepStatus) -> StepStatus)
    {
        let status = self.status_map.get_mut(name).unwrap_or_else(|| panic!("unknown step {:?}", name));
        *status = next(status);
        self.publish();
    }

    /// Idle/Completed/Cancelled/Failed -> Running.
    fn enter(&mut self, name: &str)
    {
        self.transition(name, StepStatus::run);
    }

    fn cancel(&mut self, name: &str)
    {
        self.transition(name, StepStatus::cancel);
    }

    fn complete(&mut self, name: &str)
    {
        self.transition(name, StepStatus::complete);
    }

    fn fail(&mut self, name: &str)
    {
        self.transition(name, StepStatus::fail);
    }

    /// Idle -> Skipped only.
    pub fn skip(&mut self, name: &str)
    {
        let status = self.status_map.get(name).unwrap_or_else(|| panic!("unknown step {:?}", name));
        if !matches!(status, StepStatus::Idle { .. }) {
            panic!("can only skip step {:?} from the Idle status", name);
        }
        self.transition(name, StepStatus::skip);
    }

    pub fn status(&self, name: &str) -> &StepStatus
    {
        self.status_map.get(name).unwrap_or_else(|| panic!("unknown step {:?}", name))
    }

    pub fn status_map(&self) -> &StatusMap
    {
        &self.status_map
    }

    /// Run `fut` as the named step: publishes `Running` on entry, `Completed` on
    /// success, and `Cancelled` or `Failed` on the two failure paths, shielded from
    /// further cancellation once a terminal status is about to be published.
    ///
    /// Tokio has no cooperative-cancellation signal distinct from "future dropped", so
    /// any early return here is reported as `Failed`; a caller that wants `Cancelled`
    /// semantics (e.g. on SIGINT) should call [`ProgressManager::mark_cancelled`] itself
    /// before dropping the future.
    pub async fn step<F, T>(&mut self, name: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        self.enter(name);
        match fut.await {
            Ok(value) => {
                self.complete(name);
                Ok(value)
            },
            Err(err) => {
                self.fail(name);
                Err(err)
            },
        }
    }

    /// Mark a running step `Cancelled` instead of `Failed` (for a caller that detects
    /// an external cancellation signal around the `step` call).
    pub fn mark_cancelled(&mut self, name: &str)
    {
        self.cancel(name);
    }
}

/// Run `make_fut` under `settings`: skip it outright if disabled, otherwise retry it
/// up to `max_tries` times, logging attempt number and duration on both success and
/// failure, re-raising the last error once the limit is reached.
pub async fn run_step<F, Fut, T>(progress: &mut ProgressManager, name: &str, settings: &RetrySettings, mut make_fut: F) -> Result<Option<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    if !settings.enabled {
        progress.skip(name);
        return Ok(None);
    }
    retry_with(progress, name, settings.max_tries, make_fut).await.map(Some)
}

/// Retry variant that can build a fresh future per attempt: runs
/// `make_fut()` up to `max_tries` times, re-raising the final error once exhausted.
pub async fn retry_with<F, Fut, T>(progress: &mut ProgressManager, name: &str, max_tries: u32, mut make_fut: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut tries = 0u32;
    loop {
        tries += 1;
        let start = Instant::now();
        match progress.step(name, make_fut()).await {
            Ok(value) => {
                info!("step {:?} run {} out of {} completed after {:.0}s", name, tries, max_tries, start.elapsed().as_secs_f64());
                return Ok(value);
            },
            Err(err) => {
                let elapsed = start.elapsed().as_secs_f64();
                info!("step {:?} run {} out of {} failed after {:.0}s with error: {}", name, tries, max_tries, elapsed, err);
                if tries >= max_tries || !crate::error::is_retryable(&err.kind) {
                    return Err(err);
                }
            },
        }
    }
}

/// Per-step wall-clock budget.
pub async fn with_deadline<Fut, T>(name: &str, deadline: Duration, fut: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(crate::error::ErrorKind::Timeout(format!("{:?} exceeded its {:.0}s deadline", name, deadline.as_secs_f64())).error()),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn idle_transitions_to_running_and_back_to_completed()
    {
        let mut manager = ProgressManager::new(["reset_firmware", "reset_data"]);
        assert!(matches!(manager.status("reset_firmware"), StepStatus::Idle { .. }));

        manager.enter("reset_firmware");
        assert!(matches!(manager.status("reset_firmware"), StepStatus::Running { tries: 1, .. }));

        manager.complete("reset_firmware");
        assert!(matches!(manager.status("reset_firmware"), StepStatus::Completed { tries: 1, .. }));

        manager.enter("reset_firmware");
        assert!(matches!(manager.status("reset_firmware"), StepStatus::Running { tries: 2, .. }));
    }

    #[test]
    fn idle_can_be_skipped()
    {
        let mut manager = ProgressManager::new(["reset_config"]);
        manager.skip("reset_config");
        assert!(matches!(manager.status("reset_config"), StepStatus::Skipped { .. }));
    }

    #[test]
    #[should_panic]
    fn running_step_cannot_be_skipped()
    {
        let mut manager = ProgressManager::new(["reset_config"]);
        manager.enter("reset_config");
        manager.skip("reset_config");
    }

    #[tokio::test]
    async fn step_marks_failed_on_error()
    {
        let mut manager = ProgressManager::new(["reset_data"]);
        let result: Result<(), Error> = manager
            .step("reset_data", async { Err(crate::error::ErrorKind::Timeout(String::from("boom")).error()) })
            .await;
        assert!(result.is_err());
        assert!(matches!(manager.status("reset_data"), StepStatus::Failed { tries: 1, .. }));
    }

    #[tokio::test]
    async fn retry_with_exhausts_max_tries_then_returns_last_error()
    {
        let mut manager = ProgressManager::new(["reset_firmware"]);
        let attempts = std::cell::Cell::new(0);
        let result: Result<(), Error> = retry_with(&mut manager, "reset_firmware", 3, || {
            attempts.set(attempts.get() + 1);
            async { Err(crate::error::ErrorKind::Timeout(String::from("still broken")).error()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
        assert!(matches!(manager.status("reset_firmware"), StepStatus::Failed { tries: 3, .. }));
    }

    #[tokio::test]
    async fn run_step_actually_retries_failing_attempts()
    {
        let mut manager = ProgressManager::new(["reset_data"]);
        let settings = RetrySettings { enabled: true, max_tries: 3, deadline_secs: None };
        let attempts = std::cell::Cell::new(0);

        let result: Result<Option<()>, Error> = run_step(&mut manager, "reset_data", &settings, || {
            attempts.set(attempts.get() + 1);
            async {
                if attempts.get() < 3 {
                    Err(crate::error::ErrorKind::Timeout(String::from("not yet")).error())
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.unwrap().is_some());
        assert_eq!(attempts.get(), 3);
        assert!(matches!(manager.status("reset_data"), StepStatus::Completed { tries: 3, .. }));
    }
}
