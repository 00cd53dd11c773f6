// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Background watcher bridging a worker's outcome into its task handle.
//!
//! One loop runs per handle. Once an outcome arrives it, in order:
//! publishes the terminal state, terminates the worker if configured,
//! fires the registered callback, releases the limiter slot, and reaps the
//! worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::OutcomeReceiver;
use crate::config::{ExecConfig, TerminationPolicy};
use crate::error::{Result, TaskError};
use crate::handle::{TaskHandle, TaskState};
use crate::limiter::ConcurrencyLimiter;
use crate::outcome::{Outcome, TaskFailure};
use crate::termination::TerminationReport;

static SYNC_LOOP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Control over whatever is executing the wrapped function.
pub trait WorkerControl: Send {
    /// OS pid, for workers that are processes.
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Stop the worker. Returns `None` when the worker cannot be stopped
    /// from outside.
    fn terminate(&mut self, policy: &TerminationPolicy) -> Option<TerminationReport>;

    /// Block until the worker is gone and release its OS resources.
    fn reap(&mut self);
}

#[cfg(unix)]
impl WorkerControl for crate::subprocess::WorkerProcess {
    fn pid(&self) -> Option<u32> {
        Some(crate::subprocess::WorkerProcess::pid(self))
    }

    fn is_alive(&mut self) -> bool {
        self.is_running()
    }

    fn terminate(&mut self, policy: &TerminationPolicy) -> Option<TerminationReport> {
        Some(crate::termination::terminate(self, policy))
    }

    fn reap(&mut self) {
        if let Err(e) = self.wait() {
            tracing::error!(pid = self.pid(), "Failed to reap worker: {}", e);
        }
    }
}

struct SyncLoop<T, R, W> {
    handle: TaskHandle<T>,
    receiver: R,
    worker: W,
    limiter: ConcurrencyLimiter,
    config: ExecConfig,
}

/// Start the synchronization loop for `handle` on its own thread.
///
/// On failure the receiver and worker are dropped; the caller still owns
/// the limiter slot.
pub(crate) fn spawn<T, R, W>(
    handle: TaskHandle<T>,
    receiver: R,
    worker: W,
    limiter: ConcurrencyLimiter,
    config: ExecConfig,
) -> Result<()>
where
    T: Send + Sync + 'static,
    R: OutcomeReceiver<T> + 'static,
    W: WorkerControl + 'static,
{
    let n = SYNC_LOOP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let sync_loop = SyncLoop {
        handle,
        receiver,
        worker,
        limiter,
        config,
    };

    std::thread::Builder::new()
        .name(format!("isotask-sync-{}", n))
        .spawn(move || sync_loop.run())
        .map(|_| ())
        .map_err(|e| TaskError::Spawn(format!("Failed to start synchronization thread: {}", e)))
}

impl<T, R, W> SyncLoop<T, R, W>
where
    R: OutcomeReceiver<T>,
    W: WorkerControl,
{
    fn run(mut self) {
        let identity = self.handle.identity();
        tracing::trace!(task = %identity, pid = ?self.worker.pid(), "Synchronization loop started");

        loop {
            match self.receiver.recv_timeout(self.config.poll_interval) {
                Ok(None) => continue,
                Ok(Some(outcome)) => return self.finish(outcome),
                Err(e) => {
                    tracing::error!(
                        task = %identity,
                        pid = ?self.worker.pid(),
                        "Worker lost without an outcome ({}); task stays incomplete",
                        e
                    );
                    self.worker.reap();
                    return;
                }
            }
        }
    }

    fn finish(mut self, outcome: Outcome<T>) {
        let identity = self.handle.identity();
        let pid = self.worker.pid();

        if let Outcome::Failure(failure) = &outcome {
            tracing::info!(task = %identity, ?pid, "Task failed: {}", failure);
        }

        let Some(completion) = self.handle.publish(outcome) else {
            return;
        };
        if completion.state() == TaskState::Success {
            tracing::info!(task = %identity, ?pid, "Task completed");
        }

        if self.config.terminate_on_return && self.worker.is_alive() {
            if let Some(report) = self.worker.terminate(&self.config.termination) {
                tracing::debug!(
                    task = %identity,
                    ?pid,
                    stage = %report.final_stage,
                    escalated = report.escalated,
                    "Termination finished in {:?}",
                    report.elapsed
                );
                self.handle.record_termination(report);
            }
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.handle.fire(completion))) {
            tracing::error!(
                task = %identity,
                "Task callback panicked: {}",
                TaskFailure::from_panic(payload).message
            );
        }

        self.limiter.release(identity);
        self.worker.reap();
        tracing::trace!(task = %identity, ?pid, "Synchronization loop finished");
    }
}
