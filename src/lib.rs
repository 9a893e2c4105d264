// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod bundle;
pub mod condition;
pub mod context;
pub mod device;
pub mod error;
pub mod hw;
pub mod mmc;
pub mod ocd;
pub mod ops;
pub mod progress;
pub mod recipes;
pub mod serial;
pub mod settings;
pub mod ssh;
pub mod subprocess;
pub mod tftp;
pub mod work_dir;

/// Convenient shorthand for `String::from`, matching call sites throughout this crate.
#[macro_export]
macro_rules! S
{
    ($s:expr) => {
        String::from($s)
    };
}
