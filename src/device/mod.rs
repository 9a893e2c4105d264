// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `Device` value and its process-wide registry.

pub mod description;
pub mod registry;
pub mod validation;

use std::cell::RefCell;

use log::{debug, info};

use crate::condition::DeviceCondition;
use crate::context::ExecutionContextKind;
use crate::device::description::{DeviceCommunication, DeviceDescription, DeviceType};
use crate::error::Error;
use crate::hw::boot_mode::{BootMode, BootModeControl};
use crate::hw::power::PowerControl;

/// A single provisioning target. Exclusively owns its [`PowerControl`], [`BootModeControl`],
/// and metadata for its scope. An entered [`crate::context`] borrows this
/// device and exclusively owns the transports for its own lifetime.
pub struct Device
{
    device_type: DeviceType,
    version: String,
    communication: DeviceCommunication,
    power: PowerControl,
    boot_mode: BootModeControl,
    metadata: RefCell<crate::device::description::DeviceMetadata>,
}

impl Device
{
    pub fn from_description(description: DeviceDescription) -> Self
    {
        Self {
            device_type: description.device_type,
            version: description.version,
            communication: description.link.communication,
            power: description.link.control.power,
            boot_mode: description.link.control.boot_mode,
            metadata: RefCell::new(description.metadata),
        }
    }

    pub fn device_type(&self) -> DeviceType
    {
        self.device_type
    }

    pub fn version(&self) -> &str
    {
        &self.version
    }

    pub fn communication(&self) -> &DeviceCommunication
    {
        &self.communication
    }

    pub fn power(&self) -> &PowerControl
    {
        &self.power
    }

    pub fn boot_mode(&self) -> &BootModeControl
    {
        &self.boot_mode
    }

    pub fn condition(&self) -> DeviceCondition
    {
        self.metadata.borrow().condition
    }

    /// Each operation deteriorates the device's condition by `min(current, op_bound)`.
    pub fn degrade_condition(&self, bound: DeviceCondition)
    {
        self.metadata.borrow_mut().condition.degrade(bound);
    }

    /// Explicitly mark the device `Mint`; only completed phases that say so may call this.
    pub fn mark_mint(&self)
    {
        self.metadata.borrow_mut().condition = DeviceCondition::Mint;
    }

    pub fn execution_context_marker(&self) -> Option<ExecutionContextKind>
    {
        self.metadata.borrow().execution_context_marker
    }

    pub fn set_execution_context_marker(&self, kind: ExecutionContextKind)
    {
        self.metadata.borrow_mut().execution_context_marker = Some(kind);
    }

    pub fn clear_execution_context_marker(&self)
    {
        self.metadata.borrow_mut().execution_context_marker = None;
    }

    /// Forces power off and boot-mode back to Qspi, and clears the execution-context marker.
    /// Always called last, shielded, on device scope exit.
    pub fn hard_power_off(&self) -> Result<(), Error>
    {
        debug!("hard_power_off: {}", self.communication.hostname);
        self.power.set_state(false)?;
        self.boot_mode.set_mode(BootMode::Qspi)?;
        self.clear_execution_context_marker();
        Ok(())
    }

    /// `hard_power_off` followed by powering back on. Used by the bring-up sequences of
    /// [`crate::context`]'s U-boot variants to get the device into a known power state
    /// before they drive boot mode themselves.
    pub fn hard_restart(&self) -> Result<(), Error>
    {
        self.hard_power_off()?;
        self.power.set_state(true)?;
        Ok(())
    }
}

impl Drop for Device
{
    fn drop(&mut self)
    {
        if let Err(err) = self.hard_power_off() {
            log::error!("hard_power_off failed during device scope exit: {}", err);
        } else {
            info!("device {} powered off on scope exit", self.communication.hostname);
        }
    }
}
