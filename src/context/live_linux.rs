// SPDX-License-Identifier: MIT OR Apache-2.0
//! `LiveLinux`: a stateless Linux image booted straight from memory via
//! `DeviceUboot`, used for jobs (like formatting the data partition) that don't
//! depend on whatever operating system is actually installed on the device.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::context::device_uboot::DeviceUbootContext;
use crate::context::{ContextResources, ExecutionContextKind};
use crate::device::Device;
use crate::error::{Error, ErrorKind};
use crate::ops::linux::{self, LinuxTransport};
use crate::serial::line::{self, SerialCommandLine};
use crate::work_dir::WorkDir;

/// Settle time after boot, before spamming the serial line for the prompt.
const PRE_PROMPT_DELAY: Duration = Duration::from_secs(15);
const FORCE_PROMPT_DEADLINE: Duration = Duration::from_secs(30);

pub struct LiveLinuxContext<'d>
{
    device: &'d Device,
    resources: ContextResources,
    exited: bool,
}

impl<'d> LiveLinuxContext<'d>
{
    /// Enter `DeviceUboot`, boot the bundled live image, then open serial on the
    /// root shell prompt and wait it out.
    pub async fn enter(device: &'d Device, work_dir: WorkDir, kernel_image: &Path, rootfs_image: &Path) -> Result<Self, Error>
    {
        let uboot = DeviceUbootContext::enter(device, work_dir).await?;
        uboot.boot_to_live_linux(kernel_image, rootfs_image).await?;

        let prompt = format!("\r\nroot@{}:~# ", device.communication().hostname);
        let serial = SerialCommandLine::open(&device.communication().tty, prompt, line::DEFAULT_BAUD_RATE)?;

        tokio::time::sleep(PRE_PROMPT_DELAY).await;
        tokio::time::timeout(FORCE_PROMPT_DEADLINE, serial.force_prompt_default())
            .await
            .map_err(|_| ErrorKind::Timeout(String::from("force_prompt after booting live linux")).error())??;

        let mut resources = ContextResources::default();
        resources.serial = Some(serial);
        device.set_execution_context_marker(ExecutionContextKind::LiveLinux);
        Ok(Self { device, resources, exited: false })
    }

    fn transport(&self) -> Result<LinuxTransport<'_>, Error>
    {
        crate::context::guard_not_exited(self.exited)?;
        Ok(LinuxTransport::Serial(self.resources.serial.as_ref().expect("LiveLinuxContext always owns serial once entered")))
    }

    /// Unmount the overlay mounts that hold the data partition open, then format it.
    pub async fn reset_data(&self) -> Result<(), Error>
    {
        let transport = self.transport()?;
        linux::unbock_data_partition_live(&transport).await?;
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

    pub async fn exit(mut self)
    {
        self.exited = true;
        self.device.clear_execution_context_marker();
        self.resources.release().await;
    }
}
