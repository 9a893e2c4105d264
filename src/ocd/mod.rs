// SPDX-License-Identifier: MIT OR Apache-2.0
//! The OpenOCD link: a spawned `openocd` server subprocess plus a TCL client
//! socket, used only by the `LiveUboot` context to bring up a bundled bootloader over JTAG.

pub mod client;
pub mod server;
