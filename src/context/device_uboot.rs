// SPDX-License-Identifier: MIT OR Apache-2.0
//! `DeviceUboot`: the U-boot distribution already installed on the device,
//! entered with a plain hard restart (no JTAG strapping). Depends on the device's
//! own flashed firmware, unlike [`crate::context::live_uboot`].

use std::path::Path;
use std::time::Duration;

use crate::context::{ContextResources, ExecutionContextKind};
use crate::device::Device;
use crate::error::{Error, ErrorKind};
use crate::mmc::Partition;
use crate::ops::uboot::UbootOps;
use crate::serial::line::{self, SerialCommandLine};
use crate::work_dir::WorkDir;

const FORCE_PROMPT_DEADLINE: Duration = Duration::from_secs(5);

pub struct DeviceUbootContext<'d>
{
    device: &'d Device,
    resources: ContextResources,
    work_dir: WorkDir,
    exited: bool,
}

impl<'d> DeviceUbootContext<'d>
{
    /// Hard restart, then open serial on `"<devicetype>> "` and force the prompt.
    pub async fn enter(device: &'d Device, work_dir: WorkDir) -> Result<Self, Error>
    {
        device.hard_restart()?;

        let prompt = device.device_type().device_uboot_prompt();
        let serial = SerialCommandLine::open(&device.communication().tty, prompt, line::DEFAULT_BAUD_RATE)?;
        tokio::time::timeout(FORCE_PROMPT_DEADLINE, serial.force_prompt_default())
            .await
            .map_err(|_| ErrorKind::Timeout(String::from("force_prompt after hard restart to uboot")).error())??;

        let mut resources = ContextResources::default();
        resources.serial = Some(serial);
        device.set_execution_context_marker(ExecutionContextKind::DeviceUboot);
        Ok(Self { device, resources, work_dir, exited: false })
    }

    fn serial(&self) -> Result<&SerialCommandLine, Error>
    {
        crate::context::guard_not_exited(self.exited)?;
        Ok(self.resources.serial.as_ref().expect("DeviceUbootContext always owns serial once entered"))
    }

    fn ops(&self) -> Result<UbootOps<'_>, Error>
    {
        let tftp_host = crate::tftp::local_ip()?;
        Ok(UbootOps::new(self.serial()?, &self.work_dir, tftp_host, 0))
    }

    pub async fn set_boot_args(&self, args: &[(&str, &str)]) -> Result<(), Error>
    {
        self.ops()?.set_boot_args(self.device, args).await
    }

    pub async fn write_image_to_mmc(&self, file: &Path, partitions: &[Partition]) -> Result<(), Error>
    {
        self.ops()?.write_image_to_mmc(self.device, file, partitions).await
    }

    /// `gpt write mmc 0 "..."`: U-boot won't
    /// recognize the new partitioning without a restart, so this self-closes the
    /// context immediately afterward. Any further use of `self` fails `ContextExited`.
    pub async fn partition_mmc(mut self) -> Result<(), Error>
    {
        self.ops()?.partition_mmc(self.device).await?;
        self.exited = true;
        self.device.clear_execution_context_marker();
        self.resources.release().await;
        Ok(())
    }

    /// `run dualcopy_mmcboot` without waiting for a prompt, then self-close: this
    /// context is no longer valid once the device starts transferring control away.
    pub async fn boot_to_device_os(mut self) -> Result<(), Error>
    {
        self.ops()?.boot_to_device_os(self.device).await?;
        self.exited = true;
        self.device.clear_execution_context_marker();
        self.resources.release().await;
        Ok(())
    }

    /// Copy the bundled kernel/rootfs to memory and `bootm`, then self-close, same
    /// reasoning as [`DeviceUbootContext::boot_to_device_os`].
    pub async fn boot_to_live_linux(mut self, kernel_image: &Path, rootfs_image: &Path) -> Result<(), Error>
    {
        self.ops()?.boot_to_live_linux(self.device, kernel_image, rootfs_image).await?;
        self.exited = true;
        self.device.clear_execution_context_marker();
        self.resources.release().await;
        Ok(())
    }

    pub async fn exit(mut self)
    {
        self.exited = true;
        self.device.clear_execution_context_marker();
        self.resources.release().await;
    }
}
