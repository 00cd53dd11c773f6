// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker-process demos.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use isotask::{in_process, ExecConfig, TaskError};

use super::sleep_then_double;

#[derive(Debug, thiserror::Error)]
#[error("{0} is not an acceptable value")]
struct ValueError(i64);

fn raise_value_error(value: i64) -> Result<i64, ValueError> {
    Err(ValueError(value))
}

pub fn sleep(config: ExecConfig, secs: u64) -> Result<()> {
    let task = in_process(sleep_then_double)
        .with_config(config)
        .with_name("sleep_then_double");

    let start = Instant::now();
    let handle = task.call(secs).context("Failed to start worker")?;
    tracing::info!("Worker {:?} started, waiting", handle.worker_pid());

    handle.on_complete(|value| tracing::info!("on_complete: {}", value));

    match handle.wait() {
        Some(value) => println!("{} (after {:.2?})", value, start.elapsed()),
        None => bail!("worker failed: {:?}", handle.failure()),
    }
    Ok(())
}

pub fn fail(config: ExecConfig) -> Result<()> {
    let task = in_process(raise_value_error)
        .with_config(config)
        .with_name("raise_value_error");
    let handle = task.call(-1).context("Failed to start worker")?;

    handle.on_error(|failure| tracing::info!("on_error: {}", failure));
    let value = handle.wait();
    println!("wait() -> {:?}", value);

    let Err(err) = handle.burst();
    match err.failure() {
        Some(failure) => println!("burst() -> {} [{}]", failure.short_type_name(), failure.message),
        None => bail!("expected a captured failure, got: {}", err),
    }
    Ok(())
}

pub fn limit(config: ExecConfig) -> Result<()> {
    let task = in_process(sleep_then_double)
        .with_config(config)
        .with_name("sleep_then_double")
        .max_concurrent(1);

    let first = task.call(1).context("Failed to start first worker")?;
    match task.call(1) {
        Err(TaskError::ConcurrencyLimitExceeded { task, limit }) => {
            println!("second call rejected: '{}' allows {} in flight", task, limit);
        }
        Err(e) => return Err(e).context("Second call failed unexpectedly"),
        Ok(_) => bail!("second call was admitted despite max_concurrent = 1"),
    }

    println!("first call -> {:?}", first.wait());
    Ok(())
}

#[cfg(unix)]
fn return_and_linger(_: ()) -> Result<u32, std::io::Error> {
    // SAFETY: only changes this worker's SIGTERM disposition.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
    isotask::spawn_lingering(|| loop {
        std::thread::sleep(Duration::from_millis(50));
    })?;
    Ok(std::process::id())
}

#[cfg(unix)]
pub fn linger(config: ExecConfig, grace_ms: u64) -> Result<()> {
    let policy = config
        .termination
        .with_grace_period(Duration::from_millis(grace_ms));
    let task = in_process(return_and_linger)
        .with_config(config.with_termination(policy))
        .with_name("return_and_linger")
        .terminate_on_return(true);

    let handle = task.call(()).context("Failed to start worker")?;
    let pid = handle
        .wait_timeout(Duration::from_secs(10))
        .context("Worker never reported")?;

    // The report is recorded once termination finishes, after the value is published.
    let deadline = Instant::now() + policy.max_duration() + Duration::from_secs(1);
    while handle.termination().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    match handle.termination() {
        Some(report) => println!(
            "worker {} -> {} after {:.2?} (escalated: {})",
            pid, report.final_stage, report.elapsed, report.escalated
        ),
        None => println!("worker {} reported but was not terminated", pid),
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn linger(_config: ExecConfig, _grace_ms: u64) -> Result<()> {
    bail!("the linger demo needs Unix signals")
}
