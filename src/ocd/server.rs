// SPDX-License-Identifier: MIT OR Apache-2.0
//! `Server` spawns the `openocd` binary and waits for it to report readiness on stdout.

use std::env;
use std::path::Path;
use std::time::Duration;

use log::debug;
use regex::Regex;

use crate::error::Error;
use crate::subprocess::{ProcessHandle, SpawnOptions};

/// Overridable via the `RESET_ENGINE_OPENOCD_EXE` environment variable.
fn openocd_exe() -> String
{
    env::var("RESET_ENGINE_OPENOCD_EXE").unwrap_or_else(|_| String::from("openocd"))
}

const READY_REGEX: &str = "Listening on port 3333 for gdb connections";
const ERROR_REGEX: &str = "Error: .*";

/// Deadline budgets for the `LiveUboot` entry's wait on server readiness.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OcdServer
{
    process: Option<ProcessHandle>,
}

impl OcdServer
{
    /// Spawn `openocd --file <config> --command <cmd>... [--debug]` and wait for it to
    /// reach its ready state.
    pub async fn start(config: &Path, commands: &[String], debug: bool) -> Result<Self, Error>
    {
        let mut args = vec![String::from("--file"), config.display().to_string()];
        for command in commands {
            args.push(String::from("--command"));
            args.push(command.clone());
        }
        if debug {
            args.push(String::from("--debug"));
        }

        let opts = SpawnOptions {
            error_regex: Some(Regex::new(ERROR_REGEX)?),
            ready_regex: Some(Regex::new(READY_REGEX)?),
        };

        let mut process = ProcessHandle::spawn(&openocd_exe(), &args, None, opts).await?;
        process.wait_ready(DEFAULT_READY_TIMEOUT).await?;

        debug!("openocd server ready ({})", config.display());
        Ok(Self { process: Some(process) })
    }

    /// SIGTERM, shielded grace, SIGKILL. Idempotent.
    pub async fn terminate(&mut self)
    {
        if let Some(process) = self.process.take() {
            process.terminate().await;
        }
    }
}
