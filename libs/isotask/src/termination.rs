// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Cooperative-then-forceful shutdown of a worker process.

use std::fmt;
use std::time::Duration;

#[cfg(unix)]
use std::time::Instant;

#[cfg(unix)]
use crate::config::TerminationPolicy;
#[cfg(unix)]
use crate::subprocess::WorkerProcess;

/// Where the termination protocol ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationStage {
    Running,
    GracefulStopRequested,
    ForceKillRequested,
    /// The process has exited and was reaped.
    Dead,
    /// Still not reaped after the forced kill and the kill wait.
    Unresponsive,
}

impl fmt::Display for TerminationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationStage::Running => "running",
            TerminationStage::GracefulStopRequested => "graceful-stop-requested",
            TerminationStage::ForceKillRequested => "force-kill-requested",
            TerminationStage::Dead => "dead",
            TerminationStage::Unresponsive => "unresponsive",
        };
        f.write_str(s)
    }
}

/// Result of one run of the termination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationReport {
    pub pid: u32,
    pub final_stage: TerminationStage,
    /// Whether the forced kill was needed.
    pub escalated: bool,
    pub elapsed: Duration,
}

impl TerminationReport {
    pub fn is_dead(&self) -> bool {
        self.final_stage == TerminationStage::Dead
    }
}

/// Stop `worker`: SIGTERM, wait out the grace period, then force kill and
/// wait out the kill wait.
///
/// Safe to call on a worker that already exited. Signal failures are
/// logged and the protocol carries on; nothing is propagated.
#[cfg(unix)]
pub fn terminate(worker: &mut WorkerProcess, policy: &TerminationPolicy) -> TerminationReport {
    let start = Instant::now();
    let pid = worker.pid();
    let report = |final_stage, escalated| TerminationReport {
        pid,
        final_stage,
        escalated,
        elapsed: start.elapsed(),
    };

    if !worker.is_running() {
        tracing::debug!(pid, "Worker already exited, nothing to terminate");
        return report(TerminationStage::Dead, false);
    }

    if let Err(e) = worker.request_stop() {
        tracing::warn!(pid, "Cooperative stop request failed: {}", e);
    }
    tracing::debug!(pid, stage = %TerminationStage::GracefulStopRequested, grace = ?policy.grace_period, "Waiting for worker to stop");

    if wait_reaped(worker, policy.grace_period) {
        tracing::info!(pid, "Worker stopped within grace period");
        return report(TerminationStage::Dead, false);
    }

    tracing::warn!(
        pid,
        stage = %TerminationStage::ForceKillRequested,
        "Worker still alive after {:?} grace period, escalating to forced kill",
        policy.grace_period
    );
    if let Err(e) = worker.force_kill() {
        tracing::error!(pid, "Forced kill failed: {}", e);
    }

    if wait_reaped(worker, policy.kill_wait) {
        tracing::info!(pid, "Worker killed");
        report(TerminationStage::Dead, true)
    } else {
        tracing::error!(pid, "Worker not reaped {:?} after forced kill", policy.kill_wait);
        report(TerminationStage::Unresponsive, true)
    }
}

#[cfg(unix)]
fn wait_reaped(worker: &mut WorkerProcess, timeout: Duration) -> bool {
    match worker.wait_timeout(timeout) {
        Ok(exited) => exited,
        Err(e) => {
            tracing::warn!(pid = worker.pid(), "Failed waiting for worker: {}", e);
            false
        }
    }
}
