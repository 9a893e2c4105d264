// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-disk device description (`--device <path>`): the CLI-only `serde` shape that gets
//! turned into the library's [`DeviceDescription`], kept out of the library itself since
//! nothing in `reset-engine` needs a device description to round-trip through JSON except
//! this binary.

use std::path::PathBuf;

use color_eyre::eyre::{Context, Result, eyre};
use reset_engine::device::description::{
    DeviceCommunication, DeviceControl, DeviceDescription, DeviceLink, DeviceMetadata, DeviceType,
};
use reset_engine::hw::boot_mode::{BootModeControl, GpioLine};
use reset_engine::hw::power::{PowerControl, RelayChannel};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig
{
    pub i2c_bus: u8,
    pub i2c_address: u8,
    pub relay_index: u8,
}

impl From<RelayConfig> for RelayChannel
{
    fn from(config: RelayConfig) -> Self
    {
        RelayChannel { i2c_bus: config.i2c_bus, i2c_address: config.i2c_address, relay_index: config.relay_index }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BootModeConfig
{
    Gpio
    {
        chip: u8, line: u8
    },
    Relay(RelayConfig),
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig
{
    /// `"zs"` or `"bb"` (`DeviceType::value`).
    pub device_type: String,
    pub version: String,
    pub hostname: String,
    pub tty: PathBuf,
    #[serde(default)]
    pub jtag_usb_serial: Option<String>,
    #[serde(default)]
    pub jtag_usb_hub_location: Option<String>,
    #[serde(default)]
    pub jtag_usb_hub_port: Option<u8>,
    #[serde(default)]
    pub ocd_tcl_port: Option<u16>,
    pub power: RelayConfig,
    pub boot_mode: BootModeConfig,
}

impl DeviceConfig {
    pub fn from_json(data: &str) -> Result<Self>
    {
        serde_json::from_str(data).wrap_err("parsing device description JSON")
    }
}

/// Builds the library's [`DeviceDescription`] from the on-disk shape, running the same
/// hostname/version validation [`DeviceDescription::new`] always runs.
pub fn build_description(config: DeviceConfig) -> Result<DeviceDescription>
{
    let device_type = DeviceType::from_value(&config.device_type)
        .ok_or_else(|| eyre!("unknown device_type {:?}; expected \"zs\" or \"bb\"", config.device_type))?;

    let communication = DeviceCommunication {
        hostname: config.hostname,
        tty: config.tty,
        jtag_usb_serial: config.jtag_usb_serial,
        jtag_usb_hub_location: config.jtag_usb_hub_location,
        jtag_usb_hub_port: config.jtag_usb_hub_port,
        ocd_tcl_port: config.ocd_tcl_port,
    };

    let boot_mode = match config.boot_mode {
        BootModeConfig::Gpio { chip, line } => BootModeControl::Gpio(GpioLine { chip, line }),
        BootModeConfig::Relay(relay) => BootModeControl::Relay(relay.into()),
    };

    let link = DeviceLink {
        control: DeviceControl { power: PowerControl::Relay(config.power.into()), boot_mode },
        communication,
    };

    DeviceDescription::new(device_type, config.version, link, DeviceMetadata::default())
        .map_err(|err| eyre!("{}", err))
        .wrap_err("validating device description")
}
