// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-phase retry/deadline configuration.
//!
//! Deserialized with `serde`/`serde_json`, the same pair used elsewhere in this crate
//! for on-disk metadata.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of attempts the retry orchestrator makes for a phase when the
/// caller doesn't override it.
pub const DEFAULT_MAX_TRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings
{
    /// If `false`, the phase is skipped entirely (`ProgressManager::skip`) rather than run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum attempts before the phase's last failure is re-raised.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Deadline override, in seconds, for the `fail_after`-equivalent wrapping the phase.
    /// `None` uses the phase's own built-in deadline.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_enabled() -> bool
{
    true
}

fn default_max_tries() -> u32
{
    DEFAULT_MAX_TRIES
}

impl Default for RetrySettings
{
    fn default() -> Self
    {
        Self {
            enabled: default_enabled(),
            max_tries: default_max_tries(),
            deadline_secs: None,
        }
    }
}

impl RetrySettings
{
    pub fn deadline(&self, builtin: Duration) -> Duration
    {
        self.deadline_secs.map(Duration::from_secs).unwrap_or(builtin)
    }
}

/// Process-wide settings, keyed by phase name (`reset_firmware`, `reset_operating_system`, …).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings
{
    #[serde(default)]
    phases: HashMap<String, RetrySettings>,
}

impl Settings
{
    pub fn get(&self, phase: &str) -> RetrySettings
    {
        self.phases.get(phase).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, phase: impl Into<String>, settings: RetrySettings)
    {
        self.phases.insert(phase.into(), settings);
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error>
    {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn missing_phase_uses_defaults()
    {
        let settings = Settings::default();
        let phase = settings.get("reset_firmware");
        assert!(phase.enabled);
        assert_eq!(phase.max_tries, DEFAULT_MAX_TRIES);
    }

    #[test]
    fn disabled_phase_round_trips_through_json()
    {
        let json = r#"{"phases": {"reset_data": {"enabled": false, "max_tries": 3}}}"#;
        let settings = Settings::from_json(json).unwrap();
        let phase = settings.get("reset_data");
        assert!(!phase.enabled);
        assert_eq!(phase.max_tries, 3);
    }
}
