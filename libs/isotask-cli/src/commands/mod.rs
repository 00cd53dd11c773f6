// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod process;
pub mod thread;

use std::time::Duration;

/// Demo workload shared by the process and thread commands.
pub fn sleep_then_double(secs: u64) -> Result<u64, std::convert::Infallible> {
    std::thread::sleep(Duration::from_secs(secs));
    Ok(secs * 2)
}
