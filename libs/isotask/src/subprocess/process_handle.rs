// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker process lifecycle management.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use crate::error::{Result, TaskError};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a forked worker process.
///
/// The handle is the only owner allowed to reap the child. Once reaped, the
/// pid is never signalled again, so a recycled pid cannot be hit.
pub struct WorkerProcess {
    pid: libc::pid_t,
    name: String,
    reaped: bool,
    status: Option<ExitStatus>,
}

impl WorkerProcess {
    pub(crate) fn from_pid(pid: libc::pid_t, name: &str) -> Self {
        Self {
            pid,
            name: name.to_string(),
            reaped: false,
            status: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Get the worker name (the task it runs).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exit status, once the worker has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Check if the process is still running. Reaps it if it has exited.
    pub fn is_running(&mut self) -> bool {
        match self.try_reap() {
            Ok(exited) => !exited,
            Err(e) => {
                tracing::warn!("Failed to check worker '{}' (pid {}): {}", self.name, self.pid, e);
                true
            }
        }
    }

    /// Reap the process if it has exited, without blocking.
    ///
    /// Returns `true` once the process is gone.
    pub fn try_reap(&mut self) -> Result<bool> {
        if self.reaped {
            return Ok(true);
        }

        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out-pointer; WNOHANG never blocks.
        let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };

        if rc == 0 {
            return Ok(false);
        }
        if rc == self.pid {
            self.mark_reaped(Some(status));
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Someone else reaped it; there is nothing left to wait for.
            Some(libc::ECHILD) => {
                self.mark_reaped(None);
                Ok(true)
            }
            Some(libc::EINTR) => Ok(false),
            _ => Err(TaskError::Io(err)),
        }
    }

    /// Wait for the process to exit, polling until `timeout` elapses.
    ///
    /// Returns `true` if the process exited (and was reaped) in time.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.try_reap()? {
                return Ok(true);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(false);
            }
            std::thread::sleep(REAP_POLL_INTERVAL.min(timeout - elapsed));
        }
    }

    /// Block until the process exits and reap it.
    pub fn wait(&mut self) -> Result<Option<ExitStatus>> {
        while !self.reaped {
            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer.
            let rc = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if rc == self.pid {
                self.mark_reaped(Some(status));
                break;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECHILD) => self.mark_reaped(None),
                _ => return Err(TaskError::Io(err)),
            }
        }
        Ok(self.status)
    }

    /// Request a cooperative stop (SIGTERM).
    pub fn request_stop(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        tracing::info!("Requesting stop of worker '{}' (pid {})", self.name, self.pid);
        send_signal(self.pid, libc::SIGTERM).map_err(TaskError::Io)
    }

    /// Force kill the process (SIGKILL). Safe to call on a dead process.
    pub fn force_kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        tracing::warn!("Force killing worker '{}' (pid {})", self.name, self.pid);
        super::force_kill_pid(self.pid as u32).map_err(TaskError::Io)
    }

    fn mark_reaped(&mut self, raw_status: Option<libc::c_int>) {
        self.reaped = true;
        self.status = raw_status.map(ExitStatus::from_raw);
        tracing::debug!(
            "Worker '{}' (pid {}) reaped with status {:?}",
            self.name,
            self.pid,
            self.status
        );
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("reaped", &self.reaped)
            .field("status", &self.status)
            .finish()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(
                "WorkerProcess for '{}' (pid {}) dropped while still running, killing",
                self.name,
                self.pid
            );
            self.force_kill().ok();
            self.wait_timeout(Duration::from_secs(1)).ok();
        }
    }
}

/// Send `signal` to `pid`. A process that no longer exists is not an error.
pub(crate) fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}
