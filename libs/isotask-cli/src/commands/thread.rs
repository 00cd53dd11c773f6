// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker-thread demo.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use isotask::{in_thread, ExecConfig};

use super::sleep_then_double;

pub fn sleep(config: ExecConfig, secs: u64) -> Result<()> {
    let task = in_thread(sleep_then_double)
        .with_config(config)
        .with_name("sleep_then_double");

    let start = Instant::now();
    let handle = task.call(secs).context("Failed to start worker thread")?;
    handle.on_complete(|value| tracing::info!("on_complete: {}", value));

    match handle.wait() {
        Some(value) => println!("{} (after {:.2?})", value, start.elapsed()),
        None => bail!("worker thread failed: {:?}", handle.failure()),
    }
    Ok(())
}
