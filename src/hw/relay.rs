// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared I2C relay-board transport for both [`crate::hw::power::PowerControl::Relay`]
//! and [`crate::hw::boot_mode::BootModeControl::Relay`]: both dispatch through the same
//! relay board, identified by `RelayChannel { i2c_bus, i2c_address, relay_index }`. Also
//! carries the process-wide GPIO level cache used by [`crate::hw::boot_mode`]'s
//! `Gpio` variant, since `rppal::gpio::InputPin`/`OutputPin` don't expose a combined
//! "what did I last drive this to" query once a pin is held as an output.
//!
//! Grounded on `original_source/stork/hardware/_power/_relay.py` and
//! `stork/hardware/_boot_mode/_relay.py`, both of which wrap the well-known
//! "Seeed-Studio/Relay_Board" `relay_lib_seeed` script (its body was filtered out of
//! the retrieval pack — only a short docstring survives — but its register layout is
//! publicly documented and widely mirrored across Raspberry-Pi relay-board tutorials):
//! a single write-only mode register at `0x06`, one bit per relay, active-low (a
//! cleared bit turns the relay *on*). The board exposes no read-back register, so
//! `relay_get_port_status` in the original only ever inspects the last byte it wrote,
//! never a fresh I2C read; `read` below does the same against a process-wide cache.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use log::debug;

use crate::error::{Error, ErrorKind};
use crate::hw::boot_mode::GpioLine;
use crate::hw::power::RelayChannel;

const MODE_REGISTER: u8 = 0x06;
const ALL_OFF: u8 = 0xFF;

fn relay_cache() -> &'static Mutex<HashMap<(u8, u8), u8>>
{
    static CACHE: OnceLock<Mutex<HashMap<(u8, u8), u8>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn gpio_cache() -> &'static Mutex<HashMap<(u8, u8), bool>>
{
    static CACHE: OnceLock<Mutex<HashMap<(u8, u8), bool>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Turn `channel`'s relay on or off. A cleared mode-register bit is "on" (active-low).
pub fn write(channel: RelayChannel, on: bool) -> Result<(), Error>
{
    let bit = 1u8 << channel.relay_index;
    let mut guard = relay_cache().lock().unwrap();
    let current = *guard.get(&(channel.i2c_bus, channel.i2c_address)).unwrap_or(&ALL_OFF);
    let next = if on { current & !bit } else { current | bit };

    debug!(
        "relay i2c {}:{:#04x} ch{} -> {} (mode register {:#04x} -> {:#04x})",
        channel.i2c_bus,
        channel.i2c_address,
        channel.relay_index,
        if on { "on" } else { "off" },
        current,
        next
    );
    write_mode_register(channel, next)?;
    guard.insert((channel.i2c_bus, channel.i2c_address), next);
    Ok(())
}

/// `relay_get_port_status`: reports the last value written, not a fresh I2C read.
pub fn read(channel: RelayChannel) -> Result<bool, Error>
{
    let bit = 1u8 << channel.relay_index;
    let guard = relay_cache().lock().unwrap();
    let current = *guard.get(&(channel.i2c_bus, channel.i2c_address)).unwrap_or(&ALL_OFF);
    debug!("relay i2c {}:{:#04x} ch{} <- query", channel.i2c_bus, channel.i2c_address, channel.relay_index);
    Ok(current & bit == 0)
}

/// Records the level last driven onto `line`, for `boot_mode::gpio_get` to read back.
pub fn cache_gpio_level(line: GpioLine, high: bool)
{
    gpio_cache().lock().unwrap().insert((line.chip, line.line), high);
}

/// The level last driven onto `line` by `gpio_set`; defaults to high (`QSPI`, the
/// power-on-reset strap default) if never driven by this process.
pub fn cached_gpio_level(line: GpioLine) -> bool
{
    *gpio_cache().lock().unwrap().get(&(line.chip, line.line)).unwrap_or(&true)
}

#[cfg(feature = "hardware-rpi")]
fn write_mode_register(channel: RelayChannel, value: u8) -> Result<(), Error>
{
    let mut i2c = rppal::i2c::I2c::with_bus(channel.i2c_bus)
        .map_err(|e| ErrorKind::Validation(format!("could not open i2c bus {}: {}", channel.i2c_bus, e)).error())?;
    i2c.set_slave_address(channel.i2c_address as u16)
        .map_err(|e| ErrorKind::Validation(format!("could not address i2c device {:#04x}: {}", channel.i2c_address, e)).error())?;
    i2c.smbus_write_byte(MODE_REGISTER, value)
        .map_err(|e| ErrorKind::Validation(format!("i2c write to relay board {:#04x} failed: {}", channel.i2c_address, e)).error())
}

#[cfg(not(feature = "hardware-rpi"))]
fn write_mode_register(channel: RelayChannel, _value: u8) -> Result<(), Error>
{
    Err(ErrorKind::Validation(format!(
        "relay board i2c {}:{:#04x} is unreachable: this build was not compiled with the `hardware-rpi` feature",
        channel.i2c_bus, channel.i2c_address
    ))
    .error())
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn channel() -> RelayChannel
    {
        RelayChannel { i2c_bus: 9, i2c_address: 0x10, relay_index: 2 }
    }

    #[test]
    fn read_reflects_last_write_without_hardware()
    {
        // Off the `hardware-rpi` feature, `write` still updates the cache before its
        // hardware transaction fails, so a prior successful cache state isn't reachable
        // here; exercise the cache directly the way `read` does.
        let mut guard = relay_cache().lock().unwrap();
        let ch = channel();
        guard.insert((ch.i2c_bus, ch.i2c_address), 0xFF & !(1 << ch.relay_index));
        drop(guard);

        assert!(read(channel()).unwrap());
    }

    #[test]
    fn unknown_channel_reads_as_off()
    {
        let ch = RelayChannel { i2c_bus: 250, i2c_address: 0x77, relay_index: 0 };
        assert!(!read(ch).unwrap());
    }

    #[test]
    fn gpio_cache_round_trips()
    {
        let line = GpioLine { chip: 1, line: 17 };
        cache_gpio_level(line, false);
        assert!(!cached_gpio_level(line));
        cache_gpio_level(line, true);
        assert!(cached_gpio_level(line));
    }

    #[test]
    fn gpio_cache_defaults_to_high()
    {
        let line = GpioLine { chip: 2, line: 99 };
        assert!(cached_gpio_level(line));
    }
}
