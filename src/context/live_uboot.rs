// SPDX-License-Identifier: MIT OR Apache-2.0
//! `LiveUboot`: boots a known-good U-boot over JTAG, independent of whatever
//! firmware (or lack thereof) is currently flashed. Ideal for a device straight from
//! the manufacturer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};

use crate::context::{ContextResources, ExecutionContextKind};
use crate::device::Device;
use crate::error::Error;
use crate::hw::boot_mode::BootMode;
use crate::ocd::client::OcdClient;
use crate::ocd::server::OcdServer;
use crate::ops::uboot::UbootOps;
use crate::serial::line::{self, SerialCommandLine};
use crate::subprocess::{ProcessHandle, SpawnOptions};
use crate::tftp::TftpServer;
use crate::work_dir::WorkDir;

/// Time the boot-mode strap must be held for the Zynq's mode check.
const BOOT_MODE_STRAP_TIME: Duration = Duration::from_millis(100);

const FORCE_PROMPT_DEADLINE: Duration = Duration::from_secs(5);

/// The live U-boot's fixed prompt; hard-coded to `"bactobox> "` for every device type,
/// as documented on [`crate::device::description::DeviceType::live_uboot_prompt`].
fn prompt(device: &Device) -> &'static str
{
    device.device_type().live_uboot_prompt()
}

/// Paths to the JTAG bring-up blobs (a tiny bootstrap FSBL, the built-in U-boot, and
/// the OpenOCD board config) supplied externally rather than compiled in: extracting
/// them from a distribution archive is out of scope here, just as bundle extraction
/// is.
#[derive(Debug, Clone)]
pub struct JtagAssets
{
    pub fsbl: PathBuf,
    pub uboot: PathBuf,
    pub openocd_config: PathBuf,
}

pub struct LiveUbootContext<'d>
{
    device: &'d Device,
    resources: ContextResources,
    work_dir: WorkDir,
    exited: bool,
}

impl<'d> LiveUbootContext<'d>
{
    /// Drive the device into a known-good U-boot over JTAG:
    /// strap boot mode to JTAG for 100 ms across a hard restart, extract/locate the
    /// bring-up blobs, bring up the OpenOCD server (retrying once after a USB power
    /// cycle if the JTAG adapter needs resetting), load the FSBL then U-boot over
    /// the OpenOCD TCL RPC connection, then open serial and force the prompt.
    pub async fn enter(device: &'d Device, work_dir: WorkDir, assets: &JtagAssets) -> Result<Self, Error>
    {
        {
            let _scope = device.boot_mode().scoped(BootMode::Jtag)?;
            device.hard_restart()?;
            tokio::time::sleep(BOOT_MODE_STRAP_TIME).await;
        }

        let mut resources = ContextResources::default();
        match jtag_boot_to_uboot(device, assets, &mut resources).await {
            Ok(()) => {},
            Err(err) => {
                resources.release().await;
                return Err(err);
            },
        }

        let serial = match SerialCommandLine::open(&device.communication().tty, prompt(device), line::DEFAULT_BAUD_RATE) {
            Ok(serial) => serial,
            Err(err) => {
                resources.release().await;
                return Err(err);
            },
        };
        let forced = tokio::time::timeout(FORCE_PROMPT_DEADLINE, serial.force_prompt_default())
            .await
            .map_err(|_| crate::error::ErrorKind::Timeout(String::from("force_prompt after jtag boot to uboot")).error());
        if let Err(err) = forced.and_then(|inner| inner) {
            resources.release().await;
            return Err(err);
        }
        resources.serial = Some(serial);

        device.set_execution_context_marker(ExecutionContextKind::LiveUboot);
        Ok(Self { device, resources, work_dir, exited: false })
    }

    fn serial(&self) -> Result<&SerialCommandLine, Error>
    {
        crate::context::guard_not_exited(self.exited)?;
        Ok(self.resources.serial.as_ref().expect("LiveUbootContext always owns serial once entered"))
    }

    fn ops(&self) -> Result<UbootOps<'_>, Error>
    {
        let tftp_host = crate::tftp::local_ip()?;
        let tftp_port = self.resources.tftp.as_ref().map(|t| t.local_addr().port()).unwrap_or(0);
        Ok(UbootOps::new(self.serial()?, &self.work_dir, tftp_host, tftp_port))
    }

    pub async fn erase_flash(&self) -> Result<(), Error>
    {
        self.ops()?.erase_flash(self.device).await
    }

    pub async fn write_image_to_flash(&self, file: &Path) -> Result<(), Error>
    {
        self.ops()?.write_image_to_flash(self.device, file).await
    }

    pub async fn write_image_to_mmc(&self, file: &Path, partitions: &[crate::mmc::Partition]) -> Result<(), Error>
    {
        self.ops()?.write_image_to_mmc(self.device, file, partitions).await
    }

    pub async fn get_env(&self, name: &str) -> Result<String, Error>
    {
        self.ops()?.get_env(name).await
    }

    /// Release resources; idempotent. Doesn't self-close (unlike `DeviceUboot`), since
    /// nothing about a JTAG-booted U-boot session invalidates itself mid-flight.
    pub async fn exit(mut self)
    {
        self.exited = true;
        self.device.clear_execution_context_marker();
        self.resources.release().await;
    }
}

/// Port OpenOCD spawns the TCL RPC server on, if not overridden per-device.
const DEFAULT_OCD_TCL_PORT: u16 = crate::ocd::client::DEFAULT_TCL_PORT;

async fn jtag_boot_to_uboot(device: &Device, assets: &JtagAssets, resources: &mut ContextResources) -> Result<(), Error>
{
    let tftp_root = WorkDir::from_env().subdir("tftp")?;
    let tftp = TftpServer::bind(tftp_root, ([0, 0, 0, 0], 0).into()).await?;
    resources.tftp = Some(tftp);

    info!("start openocd server");
    let server = match start_ocd_server(device, assets).await {
        Ok(server) => server,
        Err(err) => {
            warn!("could not start openocd server: {}", err);
            let Some(search) = device.communication().jtag_usb_serial.as_deref() else {
                warn!("no jtag usb serial recorded for this device; can't power-cycle the adapter");
                return Err(err);
            };
            info!("power cycling usb port to reset the jtag cable");
            power_cycle_usb_ports(search).await?;
            info!("start openocd server once more");
            start_ocd_server(device, assets).await?
        },
    };
    resources.ocd_server = Some(server);

    info!("connect openocd client");
    let tcl_port = device.communication().ocd_tcl_port.unwrap_or(DEFAULT_OCD_TCL_PORT);
    let mut client = OcdClient::connect("127.0.0.1", tcl_port).await?;

    info!("reset and halt cpu");
    client.run("reset halt").await?;
    info!("copy fsbl to device memory");
    client.run(&format!("load_image {} 0 elf", assets.fsbl.display())).await?;
    info!("execute fsbl");
    client.run("resume 0").await?;
    client.run("sleep 4000").await?;
    info!("copy u-boot to device memory");
    client.run("halt").await?;
    client.run(&format!("load_image {} 0x04000000 bin", assets.uboot.display())).await?;
    info!("execute u-boot");
    client.run("resume 0x04000000").await?;

    resources.ocd_client = Some(client);

    Ok(())
}

async fn start_ocd_server(device: &Device, assets: &JtagAssets) -> Result<OcdServer, Error>
{
    let mut commands = Vec::new();
    if let Some(serial) = &device.communication().jtag_usb_serial {
        commands.push(format!("ftdi_serial {}", serial));
    }
    if let Some(port) = device.communication().ocd_tcl_port {
        commands.push(format!("tcl_port {}", port));
    }
    OcdServer::start(&assets.openocd_config, &commands, false).await
}

async fn power_cycle_usb_ports(search: &str) -> Result<(), Error>
{
    let args = vec![String::from("--action"), String::from("cycle"), String::from("--search"), search.to_string()];
    let process = ProcessHandle::spawn("uhubctl", &args, None, SpawnOptions::default()).await?;
    process.run_to_completion(true).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}
