// SPDX-License-Identifier: MIT OR Apache-2.0
//! The recipe layer: composes execution contexts and device operations into
//! named, deadline-bounded phases. Each recipe enters exactly the context(s) its entry
//! column names, runs to completion or exits the context on error, and is wrapped in a
//! [`with_deadline`] scope that turns an overrun into a retryable [`Timeout`](crate::error::ErrorKind::Timeout).
//!
//! Per-phase retry/skip is the caller's concern: drive these through
//! [`crate::progress::run_step`]/[`crate::progress::retry_with`] rather than calling them
//! directly from a long-running driver.

use std::path::Path;
use std::time::Duration;

use crate::context::device_linux::DeviceLinuxContext;
use crate::context::device_uboot::DeviceUbootContext;
use crate::context::live_linux::LiveLinuxContext;
use crate::context::live_uboot::{JtagAssets, LiveUbootContext};
use crate::device::Device;
use crate::error::Error;
use crate::mmc::Partition;
use crate::ops::linux::FrequencySweep;
use crate::progress::with_deadline;
use crate::work_dir::WorkDir;

/// Canonical per-recipe deadlines. Source revisions of this bring-up sequence disagree
/// on exact timeouts (e.g. `reset_operating_system` ranges 70s-100s across variants);
/// these five use the longer value, overridable per-phase via
/// [`crate::settings::RetrySettings::deadline`].
pub const RESET_FIRMWARE_DEADLINE: Duration = Duration::from_secs(110);
pub const RESET_OPERATING_SYSTEM_DEADLINE: Duration = Duration::from_secs(100);
pub const RESET_CONFIG_DEADLINE: Duration = Duration::from_secs(60);
pub const RESET_DATA_DEADLINE: Duration = Duration::from_secs(60);
pub const SET_ELECTRONICS_REFERENCE_DEADLINE: Duration = Duration::from_secs(150);

/// Bundled live-Linux kernel/rootfs images that `DeviceUboot::boot_to_live_linux`
/// loads into memory for the `LiveLinux` entry sequence, supplied externally the
/// same way [`JtagAssets`] supplies `LiveUboot`'s bring-up blobs.
pub struct LiveLinuxAssets<'p>
{
    pub kernel_image: &'p Path,
    pub rootfs_image: &'p Path,
}

/// `reset_firmware(device, firmware_path)`: enter `LiveUboot`; erase the whole
/// FLASH; write the given image to it.
pub async fn reset_firmware(device: &Device, work_dir: WorkDir, jtag: &JtagAssets, firmware_image: &Path) -> Result<(), Error>
{
    with_deadline("reset_firmware", RESET_FIRMWARE_DEADLINE, async {
        let uboot = LiveUbootContext::enter(device, work_dir, jtag).await?;
        let result = reset_firmware_body(&uboot, firmware_image).await;
        uboot.exit().await;
        result
    })
    .await
}

async fn reset_firmware_body(uboot: &LiveUbootContext<'_>, firmware_image: &Path) -> Result<(), Error>
{
    uboot.erase_flash().await?;
    uboot.write_image_to_flash(firmware_image).await
}

/// `reset_operating_system(device, os_image_path, version)`: enter `DeviceUboot`;
/// partition the MMC and self-close (U-boot won't recognize the new table without a
/// restart); hard-power-off to force the re-read; re-enter `DeviceUboot`; write the image
/// to both system partitions so there's always a working dual-boot fallback.
///
/// `version` isn't persisted anywhere the engine tracks (`DeviceBundleRef` lives on the
/// caller's `DeviceDescription`, not on the in-flight `Device`); it's logged so the
/// attempt is traceable in the same record as every other step.
pub async fn reset_operating_system(device: &Device, work_dir: WorkDir, os_image: &Path, version: &str) -> Result<(), Error>
{
    with_deadline("reset_operating_system", RESET_OPERATING_SYSTEM_DEADLINE, async {
        log::info!("writing operating system image {} (version {})", os_image.display(), version);

        let uboot = DeviceUbootContext::enter(device, work_dir.clone()).await?;
        uboot.partition_mmc().await?;
        device.hard_power_off()?;

        let uboot = DeviceUbootContext::enter(device, work_dir).await?;
        let result = uboot.write_image_to_mmc(os_image, &[Partition::SYSTEM0, Partition::SYSTEM1]).await;
        uboot.exit().await;
        result
    })
    .await
}

/// `reset_config(device, config_image_path)`: enter `DeviceUboot`; write the
/// single config image to the `config` partition.
pub async fn reset_config(device: &Device, work_dir: WorkDir, config_image: &Path) -> Result<(), Error>
{
    with_deadline("reset_config", RESET_CONFIG_DEADLINE, async {
        let uboot = DeviceUbootContext::enter(device, work_dir).await?;
        let result = uboot.write_image_to_mmc(config_image, &[Partition::CONFIG]).await;
        uboot.exit().await;
        result
    })
    .await
}

/// `reset_data(device)`: enter `LiveLinux` (a stateless image, so whatever's
/// actually installed can't interfere); stop services that hold the data partition
/// open, unmount it, and reformat it.
pub async fn reset_data(device: &Device, work_dir: WorkDir, live_linux: &LiveLinuxAssets<'_>) -> Result<(), Error>
{
    with_deadline("reset_data", RESET_DATA_DEADLINE, async {
        let linux = LiveLinuxContext::enter(device, work_dir, live_linux.kernel_image, live_linux.rootfs_image).await?;
        let result = linux.reset_data().await;
        linux.exit().await;
        result
    })
    .await
}

/// `set_electronics_reference(device)`: enter `DeviceLinux`; run the on-device
/// BBP self-test program to completion; return its captured frequency sweep.
pub async fn set_electronics_reference(device: &Device, work_dir: WorkDir) -> Result<FrequencySweep, Error>
{
    with_deadline("set_electronics_reference", SET_ELECTRONICS_REFERENCE_DEADLINE, async {
        let linux = DeviceLinuxContext::enter(device, work_dir, None).await?;
        let result = linux.set_electronics_reference().await;
        linux.exit().await;
        result
    })
    .await
}
