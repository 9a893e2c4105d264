// SPDX-License-Identifier: MIT OR Apache-2.0
//! `DeviceLinux`: the operating system actually installed on the device.
//! Entered via `DeviceUboot` so boot flags (quiet kernel logging) can be set before
//! Linux starts; once up, prefers SSH over serial for running commands.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use tokio::time::timeout;

use crate::context::device_uboot::DeviceUbootContext;
use crate::context::{ContextResources, ExecutionContextKind};
use crate::device::Device;
use crate::error::{Error, ErrorKind};
use crate::ops::linux::{self, FrequencySweep, LinuxTransport, Process};
use crate::serial::line::{self, SerialCommandLine};
use crate::ssh::SshCommandLine;
use crate::work_dir::WorkDir;

/// Time to let the kernel settle before spamming the serial line for the login
/// prompt.
const PRE_LOGIN_DELAY: Duration = Duration::from_secs(80);
const LOGIN_DEADLINE: Duration = Duration::from_secs(100);
const FORCE_PROMPT_DEADLINE: Duration = Duration::from_secs(160);
const LOGIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct DeviceLinuxContext<'d>
{
    device: &'d Device,
    resources: ContextResources,
    exited: bool,
}

impl<'d> DeviceLinuxContext<'d>
{
    /// Enter `DeviceUboot`, optionally quiet the kernel log level, boot to the
    /// installed OS, log in over serial, force the shell prompt, then read the SSH
    /// host key over serial and open an SSH connection.
    pub async fn enter(device: &'d Device, work_dir: WorkDir, kernel_log_level: Option<u32>) -> Result<Self, Error>
    {
        let uboot = DeviceUbootContext::enter(device, work_dir).await?;
        if let Some(level) = kernel_log_level {
            uboot.set_boot_args(&[("loglevel", &level.to_string())]).await?;
        }
        uboot.boot_to_device_os().await?;

        let prompt = format!("\r\n\x1b[1;34mroot@{}\x1b[m$ ", device.communication().hostname);
        let serial = SerialCommandLine::open(&device.communication().tty, prompt.clone(), line::DEFAULT_BAUD_RATE)?;

        tokio::time::sleep(PRE_LOGIN_DELAY).await;
        timeout(LOGIN_DEADLINE, force_log_in(&serial, &prompt))
            .await
            .map_err(|_| ErrorKind::Timeout(String::from("log in over serial")).error())??;

        timeout(FORCE_PROMPT_DEADLINE, serial.force_prompt_default())
            .await
            .map_err(|_| ErrorKind::Timeout(String::from("force_prompt after booting device linux")).error())??;

        info!("read ssh host key over serial");
        let host_key = serial.run("cat /etc/ssh/ssh_host_ed25519_key.pub").await?;

        info!("connect ssh command line");
        let ssh = SshCommandLine::connect(&device.communication().hostname, crate::ssh::DEFAULT_PORT, &host_key, crate::ssh::DEFAULT_USERNAME).await?;

        let mut resources = ContextResources::default();
        resources.serial = Some(serial);
        resources.ssh = Some(ssh);
        device.set_execution_context_marker(ExecutionContextKind::DeviceLinux);
        Ok(Self { device, resources, exited: false })
    }

    /// Prefer SSH once it's up; fall back to serial otherwise.
    fn transport(&self) -> Result<LinuxTransport<'_>, Error>
    {
        crate::context::guard_not_exited(self.exited)?;
        if let Some(ssh) = &self.resources.ssh {
            return Ok(LinuxTransport::Ssh(ssh));
        }
        Ok(LinuxTransport::Serial(self.resources.serial.as_ref().expect("DeviceLinuxContext always owns serial once entered")))
    }

    fn ssh(&self) -> Result<&SshCommandLine, Error>
    {
        crate::context::guard_not_exited(self.exited)?;
        self.resources.ssh.as_ref().ok_or_else(|| ErrorKind::Protocol(String::from("ssh command line not connected")).error())
    }

    /// Stop services, then format the data partition.
    pub async fn reset_data(&self) -> Result<(), Error>
    {
        let transport = self.transport()?;
        linux::stop_services_device(&transport).await?;
        linux::format_data_partition(self.device, &transport).await
    }

    pub async fn get_versions(&self) -> Result<std::collections::HashMap<String, String>, Error>
    {
        linux::get_versions(self.device, &self.transport()?).await
    }

    pub async fn get_date(&self) -> Result<DateTime<Utc>, Error>
    {
        linux::get_date(self.device, &self.transport()?).await
    }

    pub async fn get_processes(&self) -> Result<std::collections::HashMap<u32, Process>, Error>
    {
        linux::get_processes(self.device, self.ssh()?).await
    }

    pub async fn set_electronics_reference(&self) -> Result<FrequencySweep, Error>
    {
        linux::set_electronics_reference(self.device, self.ssh()?).await
    }

    pub async fn exit(mut self)
    {
        self.exited = true;
        self.device.clear_execution_context_marker();
        self.resources.release().await;
    }
}

/// Spam blank lines at the `login:` prompt until it appears, then send `root` and an
/// empty password. Swaps the line's
/// prompt to `"login:"` for the duration and restores `shell_prompt` afterward.
async fn force_log_in(serial: &SerialCommandLine, shell_prompt: &str) -> Result<(), Error>
{
    serial.set_prompt("login:");
    loop {
        serial.write_line("").await?;
        if timeout(LOGIN_POLL_INTERVAL, serial.wait_for_prompt()).await.is_ok() {
            break;
        }
    }
    serial.write_line("root").await?;
    serial.write_line("").await?;
    serial.set_prompt(shell_prompt);
    Ok(())
}
