// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hardware control: power and boot-mode selection with scoped restore.

pub mod boot_mode;
pub mod power;
pub mod relay;
