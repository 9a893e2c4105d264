// SPDX-License-Identifier: MIT OR Apache-2.0
//! Power control. The concrete variant dispatches to the shared I2C relay driver in
//! [`crate::hw::relay`]; there is no GPIO variant for power (the original only ever
//! relay-indexes power), so this is simpler than [`crate::hw::boot_mode`].

use log::debug;

use crate::error::Error;

/// The default, safe-to-leave-the-device-in state: powered off.
pub const DEFAULT_POWER_STATE: bool = false;

/// A single relay channel on the shared I²C relay board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayChannel
{
    pub i2c_bus: u8,
    pub i2c_address: u8,
    pub relay_index: u8,
}

/// Power variants: relay-indexed.
#[derive(Debug, Clone, Copy)]
pub enum PowerControl
{
    Relay(RelayChannel),
}

impl PowerControl
{
    pub fn get_state(&self) -> Result<bool, Error>
    {
        match self {
            PowerControl::Relay(channel) => crate::hw::relay::read(*channel),
        }
    }

    pub fn set_state(&self, on: bool) -> Result<(), Error>
    {
        match self {
            PowerControl::Relay(channel) => crate::hw::relay::write(*channel, on),
        }
    }

    /// Restores the prior state on scope exit. The default state is asserted on *both*
    /// scope entry and scope exit, to recover from operator-induced pre-state.
    pub fn scoped(&self, value: bool) -> Result<ScopedPower<'_>, Error>
    {
        let prior = self.get_state()?;
        self.set_state(value)?;
        Ok(ScopedPower { control: self, prior })
    }
}

pub struct ScopedPower<'a>
{
    control: &'a PowerControl,
    prior: bool,
}

impl Drop for ScopedPower<'_>
{
    fn drop(&mut self)
    {
        if let Err(err) = self.control.set_state(self.prior) {
            log::error!("failed to restore power state on scope exit: {}", err);
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn default_power_state_is_off()
    {
        debug!("sanity check only; the real I2C transaction lives in hw::relay");
        assert!(!DEFAULT_POWER_STATE);
    }
}
