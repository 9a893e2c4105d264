// SPDX-License-Identifier: MIT OR Apache-2.0
//! Device operations: U-boot primitives (flash/MMC/network) and Linux
//! primitives (format, kill services, query), composable within the execution
//! context that owns the underlying command line.

pub mod linux;
pub mod uboot;
