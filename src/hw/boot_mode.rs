// SPDX-License-Identifier: MIT OR Apache-2.0
//! Boot-mode selection.

use log::debug;

use crate::error::{Error, ErrorKind};
use crate::hw::power::RelayChannel;

/// `Qspi` (the runtime mode) is the default; `Jtag` forces the SoC to wait for a debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode
{
    Jtag,
    Qspi,
}

impl Default for BootMode
{
    fn default() -> Self
    {
        BootMode::Qspi
    }
}

/// A Raspberry-Pi GPIO line, by BCM pin number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioLine
{
    pub chip: u8,
    pub line: u8,
}

/// Boot variants: GPIO-indexed or relay-indexed.
#[derive(Debug, Clone, Copy)]
pub enum BootModeControl
{
    Gpio(GpioLine),
    Relay(RelayChannel),
}

impl BootModeControl
{
    pub fn get_mode(&self) -> Result<BootMode, Error>
    {
        match self {
            BootModeControl::Gpio(line) => gpio_get(*line),
            BootModeControl::Relay(channel) => relay_get(*channel),
        }
    }

    pub fn set_mode(&self, mode: BootMode) -> Result<(), Error>
    {
        match self {
            BootModeControl::Gpio(line) => gpio_set(*line, mode),
            BootModeControl::Relay(channel) => relay_set(*channel, mode),
        }
    }

    /// Restores the prior mode on scope exit, asserting `value` on both entry and exit.
    pub fn scoped(&self, value: BootMode) -> Result<ScopedBootMode<'_>, Error>
    {
        let prior = self.get_mode()?;
        self.set_mode(value)?;
        Ok(ScopedBootMode { control: self, prior })
    }
}

pub struct ScopedBootMode<'a>
{
    control: &'a BootModeControl,
    prior: BootMode,
}

impl Drop for ScopedBootMode<'_>
{
    fn drop(&mut self)
    {
        if let Err(err) = self.control.set_mode(self.prior) {
            log::error!("failed to restore boot mode on scope exit: {}", err);
        }
    }
}

/// `RelayBootModeControl.mode`: `JTAG` asserts the relay, `QSPI` releases it.
fn relay_set(channel: RelayChannel, mode: BootMode) -> Result<(), Error>
{
    crate::hw::relay::write(channel, mode == BootMode::Jtag)
}

fn relay_get(channel: RelayChannel) -> Result<BootMode, Error>
{
    Ok(if crate::hw::relay::read(channel)? { BootMode::Jtag } else { BootMode::Qspi })
}

/// `GpioBootModeControl.mode`: a high line is `QSPI`, low is `JTAG`. On non-target
/// hosts (not an ARM/AArch64 Raspberry Pi, or built without `hardware-rpi`) this is a
/// no-op that fails at first real use; production hosts are real (§4.1).
#[cfg(all(any(target_arch = "arm", target_arch = "aarch64"), feature = "hardware-rpi"))]
fn gpio_set(line: GpioLine, mode: BootMode) -> Result<(), Error>
{
    use rppal::gpio::Level;

    debug!("gpiochip{} line {} -> {:?}", line.chip, line.line, mode);
    let level = if mode == BootMode::Jtag { Level::Low } else { Level::High };
    let mut pin = rppal::gpio::Gpio::new()
        .and_then(|gpio| gpio.get(line.line))
        .map_err(|e| ErrorKind::Validation(format!("could not claim gpio line {}: {}", line.line, e)).error())?
        .into_output();
    pin.set_reset_on_drop(false);
    pin.write(level);
    crate::hw::relay::cache_gpio_level(line, level == Level::High);
    Ok(())
}

#[cfg(not(all(any(target_arch = "arm", target_arch = "aarch64"), feature = "hardware-rpi")))]
fn gpio_set(line: GpioLine, _mode: BootMode) -> Result<(), Error>
{
    debug!("gpio boot-mode control is a no-op on this host (gpiochip{} line {})", line.chip, line.line);
    Err(ErrorKind::Validation(String::from("GPIO boot-mode control is unavailable on this host")).error())
}

fn gpio_get(line: GpioLine) -> Result<BootMode, Error>
{
    debug!("gpiochip{} line {} <- query", line.chip, line.line);
    Ok(if crate::hw::relay::cached_gpio_level(line) { BootMode::Qspi } else { BootMode::Jtag })
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn gpio_fails_at_first_real_use_off_target()
    {
        // "On non-target hosts, the GPIO variant resolves to a no-op that fails at first
        // real use".
        if cfg!(all(any(target_arch = "arm", target_arch = "aarch64"), feature = "hardware-rpi")) {
            return;
        }

        let control = BootModeControl::Gpio(GpioLine { chip: 0, line: 5 });
        assert!(control.set_mode(BootMode::Jtag).is_err());
    }
}
