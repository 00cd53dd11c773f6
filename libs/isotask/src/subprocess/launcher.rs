// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Fork-based worker launcher.
//!
//! The worker is a `fork` of the calling process: it inherits the wrapped
//! function and its arguments by copy, runs the function once, writes the
//! outcome to the result pipe and exits with `_exit`. It never returns into
//! the caller's code and never logs.
//!
//! # Safety
//! Only the forking thread exists in the child. Locks held by other threads
//! at fork time stay locked forever in the child. The forking thread holds
//! `FORK_LOCK`, stdout and stderr across the fork, so those are free in the
//! child. The worker body itself never logs.

use std::fmt::Display;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;

use super::process_handle::WorkerProcess;
use crate::channel::{result_channel, ResultReceiver, ResultSender};
use crate::error::{Result, TaskError};
use crate::outcome::{Outcome, TaskFailure};

/// Serializes pipe creation, fork, and the parent's close of the write end,
/// so no worker inherits another worker's write end.
static FORK_LOCK: Mutex<()> = Mutex::new(());

static IN_WORKER: AtomicBool = AtomicBool::new(false);

static LINGERING: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

/// Exit codes of the worker process.
const EXIT_OK: libc::c_int = 0;
const EXIT_SEND_FAILED: libc::c_int = 70;
const EXIT_ENCODE_FAILED: libc::c_int = 71;

/// Start `function(args)` in a forked worker process.
///
/// Returns as soon as the child exists; the outcome arrives later on the
/// returned receiver.
pub fn launch<F, A, T, E>(
    name: &str,
    function: &F,
    args: A,
) -> Result<(WorkerProcess, ResultReceiver<T>)>
where
    F: Fn(A) -> std::result::Result<T, E>,
    T: Serialize,
    E: Display,
{
    let guard = FORK_LOCK.lock();
    let (sender, receiver) = result_channel::<T>()?;

    // Reentrant locks owned by this thread, which is the one that survives
    // in the child.
    let stdout = io::stdout().lock();
    let stderr = io::stderr().lock();

    // SAFETY: the child branch only runs `run_worker`, which never returns
    // and exits through `_exit`.
    let pid = unsafe { libc::fork() };
    let fork_error = io::Error::last_os_error();
    drop(stderr);
    drop(stdout);

    match pid {
        -1 => Err(TaskError::Spawn(format!(
            "fork failed for '{}': {}",
            name, fork_error
        ))),
        0 => {
            std::mem::forget(guard);
            // SAFETY: the guard above was copied from the parent, where it is
            // released normally. The child has no other holder of the lock.
            unsafe { FORK_LOCK.force_unlock() };
            drop(receiver);
            run_worker(function, args, sender)
        }
        pid => {
            drop(sender);
            drop(guard);
            tracing::info!(task = name, pid, "Worker process started");
            Ok((WorkerProcess::from_pid(pid, name), receiver))
        }
    }
}

/// Whether the current process is an isotask worker.
pub fn is_worker_process() -> bool {
    IN_WORKER.load(Ordering::Acquire)
}

/// Spawn a thread that keeps the worker process alive after its outcome has
/// been delivered. The worker exits once every such thread has finished, or
/// when it is terminated.
///
/// Outside a worker process the thread simply runs detached.
pub fn spawn_lingering<F>(body: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name("isotask-lingering".to_string())
        .spawn(body)?;

    if is_worker_process() {
        LINGERING.lock().push(handle);
    }
    Ok(())
}

fn run_worker<F, A, T, E>(function: &F, args: A, sender: ResultSender<T>) -> !
where
    F: Fn(A) -> std::result::Result<T, E>,
    T: Serialize,
    E: Display,
{
    IN_WORKER.store(true, Ordering::Release);

    // Handles copied from the parent name threads that do not exist here.
    std::mem::forget(std::mem::take(&mut *LINGERING.lock()));

    // SAFETY: restoring the default disposition is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
    }

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| function(args))) {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(error)) => Outcome::Failure(TaskFailure::from_error(&error)),
        Err(payload) => Outcome::Failure(TaskFailure::from_panic(payload)),
    };

    let code = deliver(sender, outcome);
    join_lingering();

    // SAFETY: terminates the child without running the parent's atexit
    // handlers or destructors.
    unsafe { libc::_exit(code) }
}

fn deliver<T: Serialize>(sender: ResultSender<T>, outcome: Outcome<T>) -> libc::c_int {
    match sender.send(&outcome) {
        Ok(()) => EXIT_OK,
        Err(TaskError::Codec(_)) => EXIT_ENCODE_FAILED,
        Err(_) => EXIT_SEND_FAILED,
    }
}

fn join_lingering() {
    loop {
        let handles = std::mem::take(&mut *LINGERING.lock());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            handle.join().ok();
        }
    }
}
