// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed device identity.

use std::path::PathBuf;

use crate::bundle::DeviceBundleRef;
use crate::condition::DeviceCondition;
use crate::context::ExecutionContextKind;
use crate::device::validation;
use crate::error::Error;
use crate::hw::boot_mode::BootModeControl;
use crate::hw::power::PowerControl;

/// Closed enumeration of product families. Drives hostname-prefix validation and
/// bundle selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType
{
    Zeus,
    BactoBox,
}

impl DeviceType
{
    /// The registry key and hostname prefix for this device type.
    pub fn value(self) -> &'static str
    {
        match self {
            DeviceType::Zeus => "zs",
            DeviceType::BactoBox => "bb",
        }
    }

    pub fn from_value(value: &str) -> Option<Self>
    {
        match value {
            "zs" => Some(DeviceType::Zeus),
            "bb" => Some(DeviceType::BactoBox),
            _ => None,
        }
    }

    /// The live-U-boot prompt used for JTAG bring-up, hard-coded to `bactobox> ` even
    /// for Zeus devices; preserved here deliberately.
    pub fn live_uboot_prompt(self) -> &'static str
    {
        "bactobox> "
    }

    /// The on-device U-boot prompt, `<devicetype>> `.
    pub fn device_uboot_prompt(self) -> String
    {
        format!("{}> ", self.value())
    }
}

/// {bundle?, branding?, condition, execution_context_marker?}.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata
{
    pub bundle: Option<DeviceBundleRef>,
    pub branding: Option<String>,
    pub condition: DeviceCondition,
    pub execution_context_marker: Option<ExecutionContextKind>,
}

/// {hostname, tty path, optional jtag_usb_serial, optional jtag_usb_hub_{location,port},
/// optional ocd_tcl_port}.
#[derive(Debug, Clone)]
pub struct DeviceCommunication
{
    pub hostname: String,
    pub tty: PathBuf,
    pub jtag_usb_serial: Option<String>,
    pub jtag_usb_hub_location: Option<String>,
    pub jtag_usb_hub_port: Option<u8>,
    pub ocd_tcl_port: Option<u16>,
}

/// {power, boot_mode}.
pub struct DeviceControl
{
    pub power: PowerControl,
    pub boot_mode: BootModeControl,
}

/// {DeviceControl, DeviceCommunication}.
pub struct DeviceLink
{
    pub control: DeviceControl,
    pub communication: DeviceCommunication,
}

/// Immutable value: {DeviceType, version, DeviceLink, metadata}.
///
/// Invariant: hostname prefix matches DeviceType; enforced in [`DeviceDescription::new`].
pub struct DeviceDescription
{
    pub device_type: DeviceType,
    pub version: String,
    pub link: DeviceLink,
    pub metadata: DeviceMetadata,
}

impl DeviceDescription
{
    pub fn new(
        device_type: DeviceType,
        version: String,
        link: DeviceLink,
        metadata: DeviceMetadata,
    ) -> Result<Self, Error>
    {
        validation::validate_version(&version)?;
        validation::validate_hostname(&link.communication.hostname, device_type)?;

        Ok(Self { device_type, version, link, metadata })
    }
}
