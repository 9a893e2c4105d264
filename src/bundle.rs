// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parsed result of an SWU archive. Extraction of the archive itself
//! (cpio+gzip+libconfig) is an external collaborator; this module only
//! models the data the core consumes: already-extracted file paths and their metadata.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::device::description::DeviceType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage
{
    pub file: PathBuf,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBundle
{
    pub firmware: DiskImage,
    pub operating_system: DiskImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiBundle
{
    pub checksum: String,
    pub bundles: HashMap<DeviceTypeKey, DeviceBundle>,
}

/// `DeviceType` doesn't implement `Hash`/`Eq` on its own discriminant-free enum form in a way
/// that's convenient as a map key across crate boundaries, so bundle lookups key off the
/// stable string value instead (`DeviceType::value`).
pub type DeviceTypeKey = &'static str;

impl MultiBundle
{
    pub fn bundle_for(&self, device_type: DeviceType) -> Option<&DeviceBundle>
    {
        self.bundles.get(device_type.value())
    }
}

/// A lightweight reference to the bundle a device's metadata currently points at
///, without forcing the whole parsed [`MultiBundle`] to be cloned
/// into every [`crate::device::description::DeviceDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBundleRef
{
    pub checksum: String,
    pub firmware: DiskImage,
    pub operating_system: DiskImage,
}

impl DeviceBundleRef
{
    pub fn from_bundle(checksum: &str, bundle: &DeviceBundle) -> Self
    {
        Self {
            checksum: checksum.to_string(),
            firmware: bundle.firmware.clone(),
            operating_system: bundle.operating_system.clone(),
        }
    }
}
