// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide type→constructor map keyed by `DeviceType.value`.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::device::description::{DeviceDescription, DeviceType};
use crate::device::Device;
use crate::error::{Error, ErrorKind};

type Constructor = fn(DeviceDescription) -> Device;

fn registry() -> &'static Mutex<HashMap<&'static str, Constructor>>
{
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Constructor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a constructor for a device type's registry key (`DeviceType::value`).
pub fn register(key: &'static str, constructor: Constructor)
{
    registry().lock().expect("registry mutex poisoned").insert(key, constructor);
}

/// Register the one concrete device family this crate ships: both [`DeviceType`] variants
/// are "green mango" boards (a JTAG-recoverable U-boot/Linux SBC), differing only in hostname
/// prefix and bundle selection, so a single constructor is registered for each key.
pub fn register_defaults()
{
    register(DeviceType::Zeus.value(), Device::from_description);
    register(DeviceType::BactoBox.value(), Device::from_description);
}

/// Looks up the constructor for `description.device_type` and builds a [`Device`].
pub fn from_description(description: DeviceDescription) -> Result<Device, Error>
{
    let key = description.device_type.value();
    let constructor = *registry()
        .lock()
        .expect("registry mutex poisoned")
        .get(key)
        .ok_or_else(|| ErrorKind::Validation(format!("no constructor registered for device type {:?}", key)).error())?;

    Ok(constructor(description))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn lookup_fails_before_registration_of_an_unknown_key()
    {
        let err = registry().lock().unwrap().get("does-not-exist").is_none();
        assert!(err);
    }
}
