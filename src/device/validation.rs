// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hostname and version validation.

use regex::Regex;
use std::sync::OnceLock;

use crate::device::description::DeviceType;
use crate::error::{Error, ErrorKind};

const HOSTNAME_LEN: usize = 9;

/// `[0-9][A-Za-z0-9-_.]+`.
fn version_pattern() -> &'static Regex
{
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9][A-Za-z0-9\-_.]+$").expect("static pattern is valid"))
}

pub fn validate_version(version: &str) -> Result<(), Error>
{
    if version_pattern().is_match(version) {
        Ok(())
    } else {
        Err(ErrorKind::Validation(format!("version {:?} does not match [0-9][A-Za-z0-9-_.]+", version)).error())
    }
}

/// Hostname validation enforces 9-character length and a type-specific prefix (`bb`, `zs`);
/// digits 3–4 year (19–40), 5–6 week (1–53), 7–9 id (000–999).
pub fn validate_hostname(hostname: &str, device_type: DeviceType) -> Result<(), Error>
{
    if hostname.len() != HOSTNAME_LEN || !hostname.is_ascii() {
        return Err(invalid(hostname, "must be exactly 9 ASCII characters"));
    }

    let prefix = &hostname[0..2];
    if prefix != device_type.value() {
        return Err(invalid(hostname, &format!("prefix {:?} does not match device type {:?}", prefix, device_type.value())));
    }

    let year: u32 = hostname[2..4].parse().map_err(|_| invalid(hostname, "year field is not numeric"))?;
    if !(19..=40).contains(&year) {
        return Err(invalid(hostname, &format!("year {} out of range 19-40", year)));
    }

    let week: u32 = hostname[4..6].parse().map_err(|_| invalid(hostname, "week field is not numeric"))?;
    if !(1..=53).contains(&week) {
        return Err(invalid(hostname, &format!("week {} out of range 1-53", week)));
    }

    let _id: u32 = hostname[6..9].parse().map_err(|_| invalid(hostname, "id field is not numeric"))?;

    Ok(())
}

fn invalid(hostname: &str, why: &str) -> Error
{
    ErrorKind::Validation(format!("invalid hostname {:?}: {}", hostname, why)).error()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn accepts_valid_week_53()
    {
        // "zs2553000" (week 53 is valid)
        assert!(validate_hostname("zs2553000", DeviceType::Zeus).is_ok());
    }

    #[test]
    fn rejects_week_54()
    {
        // "bb2554000" rejects (week 54 invalid)
        assert!(validate_hostname("bb2554000", DeviceType::BactoBox).is_err());
    }

    #[test]
    fn rejects_unknown_prefix()
    {
        // "xx2301000" rejects (unknown prefix)
        assert!(validate_hostname("xx2301000", DeviceType::BactoBox).is_err());
        assert!(validate_hostname("xx2301000", DeviceType::Zeus).is_err());
    }

    #[test]
    fn rejects_wrong_length()
    {
        assert!(validate_hostname("bb25530001", DeviceType::BactoBox).is_err());
        assert!(validate_hostname("bb255300", DeviceType::BactoBox).is_err());
    }

    #[test]
    fn version_pattern_rejects_leading_letter()
    {
        assert!(validate_version("v1.2.3").is_err());
        assert!(validate_version("1.2.3").is_ok());
    }
}
