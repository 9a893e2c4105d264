// SPDX-License-Identifier: MIT OR Apache-2.0
//! The subprocess runner: spawn a child, stream its combined output to the
//! logger line-by-line, watch for an error or ready regex, and tear it down with a
//! SIGTERM → shielded grace → SIGKILL sequence on the way out.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{info, warn};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::{Error, ErrorKind};

/// Grace period between SIGTERM and SIGKILL during teardown.
pub const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct SpawnOptions
{
    pub error_regex: Option<Regex>,
    pub ready_regex: Option<Regex>,
}

/// A spawned child with its combined-output reader task still running. Dropping this
/// without calling [`ProcessHandle::terminate`] or [`ProcessHandle::wait`] leaks the
/// reader task; callers are expected to always tear it down explicitly (owning
/// contexts do so in their `release`/`aclose` paths).
pub struct ProcessHandle
{
    child: Child,
    reader: tokio::task::JoinHandle<Result<(), Error>>,
    ready_rx: Option<oneshot::Receiver<()>>,
    label: String,
}

impl ProcessHandle
{
    pub async fn spawn(program: &str, args: &[String], stdin_file: Option<&Path>, opts: SpawnOptions) -> Result<Self, Error>
    {
        let label = format!("{} {}", program, args.join(" "));
        info!("spawning: {}", label);

        let mut command = Command::new(program);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin_file.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| ErrorKind::Subprocess(format!("failed to spawn {}: {}", label, e)).error_from(e))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        if let (Some(path), Some(mut stdin)) = (stdin_file, child.stdin.take()) {
            let path = path.to_path_buf();
            tokio::spawn(async move {
                match tokio::fs::read(&path).await {
                    Ok(data) => {
                        if let Err(err) = stdin.write_all(&data).await {
                            warn!("failed to write {} to child stdin: {}", path.display(), err);
                        }
                    },
                    Err(err) => warn!("failed to read {}: {}", path.display(), err),
                }
            });
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let reader_label = label.clone();
        let reader = tokio::spawn(stream_output(stdout, stderr, opts.error_regex, opts.ready_regex, ready_tx, reader_label));

        Ok(Self { child, reader, ready_rx: Some(ready_rx), label })
    }

    /// Await the ready-regex signal.
    pub async fn wait_ready(&mut self, deadline: Duration) -> Result<(), Error>
    {
        let rx = self
            .ready_rx
            .take()
            .ok_or_else(|| ErrorKind::Protocol(String::from("wait_ready called twice")).error())?;

        match timeout(deadline, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ErrorKind::Server(format!("{} exited before becoming ready", self.label)).error()),
            Err(_) => Err(ErrorKind::Server(format!("{} did not become ready in time", self.label)).error()),
        }
    }

    /// Run to completion, checking the exit code if `check_rc`. Used for short-lived
    /// helper subprocesses (e.g. `uhubctl`) rather than long-running servers.
    pub async fn run_to_completion(mut self, check_rc: bool) -> Result<(), Error>
    {
        let result = self.drive_to_exit().await;
        match result {
            Ok(status) => {
                if check_rc && !status.success() {
                    return Err(ErrorKind::Subprocess(format!("{} exited with {}", self.label, status)).error());
                }
                Ok(())
            },
            Err(err) => {
                self.teardown().await;
                Err(err)
            },
        }
    }

    async fn drive_to_exit(&mut self) -> Result<std::process::ExitStatus, Error>
    {
        // Race the child's own exit against the reader noticing `error_regex` first;
        // either way, once one side resolves we still need the final exit status.
        tokio::select! {
            status = self.child.wait() => {
                status.map_err(|e| ErrorKind::Subprocess(format!("failed to wait on {}: {}", self.label, e)).error_from(e))
            }
            reader_result = &mut self.reader => {
                if let Ok(Err(err)) = reader_result {
                    return Err(err);
                }
                self.child.wait().await.map_err(|e| ErrorKind::Subprocess(format!("failed to wait on {}: {}", self.label, e)).error_from(e))
            }
        }
    }

    /// SIGTERM, a shielded grace period, then SIGKILL.
    /// "Shielded" means this always runs to completion even if the caller's own await
    /// point was cancelled; it is spawned detached and joined with a timeout.
    pub async fn terminate(mut self)
    {
        if let Some(pid) = self.child.id() {
            // SAFETY: `pid` is this process's own live child; SIGTERM is the
            // standard graceful-shutdown signal.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let label = self.label.clone();
        let shielded = tokio::spawn(async move {
            let _ = timeout(TERMINATE_GRACE_PERIOD, self.child.wait()).await;
            if self.child.try_wait().ok().flatten().is_none() {
                warn!("{} did not exit after SIGTERM, sending SIGKILL", label);
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
            self.reader.abort();
        });

        let _ = timeout(TERMINATE_GRACE_PERIOD + Duration::from_secs(1), shielded).await;
    }

    async fn teardown(&mut self)
    {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        let _ = timeout(TERMINATE_GRACE_PERIOD, self.child.wait()).await;
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.start_kill();
        }
        self.reader.abort();
    }
}

async fn stream_output(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    error_regex: Option<Regex>,
    ready_regex: Option<Regex>,
    ready_tx: oneshot::Sender<()>,
    label: String,
) -> Result<(), Error>
{
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut ready_tx = Some(ready_tx);

    loop {
        let line = tokio::select! {
            line = stdout_lines.next_line() => line,
            line = stderr_lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("{}: failed to read output: {}", label, err);
                break;
            },
        };

        info!("{}: {}", label, line);

        if let Some(pattern) = &error_regex {
            if pattern.is_match(&line) {
                return Err(ErrorKind::Subprocess(line).error());
            }
        }

        if let Some(pattern) = &ready_regex {
            if pattern.is_match(&line) {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn error_regex_matches_openocd_scan_chain_failure()
    {
        let pattern = Regex::new("Error: .*").unwrap();
        assert!(pattern.is_match("Error: JTAG scan chain interrogation failed"));
        assert!(!pattern.is_match("Info: auto-detected target"));
    }

    #[test]
    fn ready_regex_matches_openocd_listening_line()
    {
        let pattern = Regex::new("Listening on port 3333 for gdb connections").unwrap();
        assert!(pattern.is_match("Info : Listening on port 3333 for gdb connections"));
    }
}
