// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Run ordinary functions asynchronously on a worker thread or in an
//! isolated worker process.
//!
//! Wrapping a function with [`in_process`] or [`in_thread`] gives a [`Task`].
//! Each [`Task::call`](ProcessTask::call) returns a [`TaskHandle`] right away.
//! The handle carries completion/error callbacks, blocking waits and
//! [`burst`](TaskHandle::burst). Every wrapped function has a concurrency
//! limit enforced by a [`ConcurrencyLimiter`].
//!
//! In the process path the worker is a `fork` of the caller. Its single
//! [`Outcome`] travels back over a pipe, and the worker can be terminated
//! once it has reported ([`ExecConfig::terminate_on_return`]).

pub mod channel;
pub mod config;
pub mod error;
pub mod handle;
pub mod limiter;
pub mod outcome;
pub mod subprocess;
pub mod sync_loop;
pub mod task;
pub mod termination;
pub mod thread;

pub use config::{ExecConfig, TerminationPolicy};
pub use error::{Result, TaskError};
pub use handle::{TaskHandle, TaskState};
pub use limiter::{ConcurrencyLimit, ConcurrencyLimiter, TaskIdentity};
pub use outcome::{FailureKind, Outcome, TaskFailure};
pub use subprocess::{is_worker_process, spawn_lingering};
pub use sync_loop::WorkerControl;
pub use task::{in_process, in_thread, ProcessTask, Task, ThreadTask};
pub use termination::{TerminationReport, TerminationStage};
