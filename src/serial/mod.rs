// SPDX-License-Identifier: MIT OR Apache-2.0
//! Serial command line: UART console, prompt detection, and the `run`/`force_prompt`/
//! `wait_for_prompt` protocol shared by every U-boot and Linux execution context.

pub mod line;
