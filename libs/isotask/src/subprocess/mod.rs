// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process isolation infrastructure for worker processes.
//!
//! This module provides the pieces the process path is built from:
//!
//! - Launching a worker as a `fork` of the caller, with a result pipe
//! - Tracking the worker's pid, liveness and exit status
//! - Cooperative stop and forced kill
//! - Lingering worker threads that outlive the returned value

#[cfg(unix)]
mod launcher;
#[cfg(unix)]
mod process_handle;

#[cfg(unix)]
pub use launcher::{is_worker_process, launch, spawn_lingering};
#[cfg(unix)]
pub use process_handle::WorkerProcess;

use std::io;

/// Forcefully kill the process `pid`.
///
/// A process that is already gone is not an error.
#[cfg(unix)]
pub fn force_kill_pid(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {} out of range", pid)))?;
    process_handle::send_signal(pid, libc::SIGKILL)
}

/// Forcefully kill the process `pid`.
#[cfg(windows)]
pub fn force_kill_pid(pid: u32) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "taskkill /PID {} /F exited with {}",
            pid, status
        )))
    }
}

/// Forcefully kill the process `pid`.
#[cfg(not(any(unix, windows)))]
pub fn force_kill_pid(pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("no way to kill process {} on this platform", pid),
    ))
}

/// Whether the current process is a forked worker. Always false where
/// worker processes are unavailable.
#[cfg(not(unix))]
pub fn is_worker_process() -> bool {
    false
}

/// Spawn a detached thread. Without worker processes there is nothing to
/// keep alive.
#[cfg(not(unix))]
pub fn spawn_lingering<F>(body: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name("isotask-lingering".to_string())
        .spawn(body)
        .map(|_| ())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_force_kill_pid_rejects_out_of_range_pid() {
        let err = force_kill_pid(u32::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_not_a_worker_in_tests() {
        assert!(!is_worker_process());
    }
}
