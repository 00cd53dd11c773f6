// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Caller-side view of one in-flight invocation.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TaskError};
use crate::limiter::TaskIdentity;
use crate::outcome::{Outcome, TaskFailure};
use crate::termination::TerminationReport;

/// Lifecycle state of a task. `Success` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Incomplete,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Incomplete)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Incomplete => "incomplete",
            TaskState::Success => "success",
            TaskState::Error => "error",
        };
        f.write_str(s)
    }
}

type BoxedCallback<V> = Box<dyn FnOnce(&V) + Send>;

/// A registered callback, or nothing.
pub(crate) enum Callback<V> {
    Noop,
    Registered(BoxedCallback<V>),
}

impl<V> Default for Callback<V> {
    fn default() -> Self {
        Callback::Noop
    }
}

impl<V> Callback<V> {
    fn call(self, value: &V) {
        if let Callback::Registered(callback) = self {
            callback(value);
        }
    }
}

/// Terminal value plus the callback that was registered for it when the
/// outcome was published. Fired by the synchronization loop.
pub(crate) enum Completion<T> {
    Success {
        value: Arc<T>,
        callback: Callback<T>,
    },
    Error {
        failure: Arc<TaskFailure>,
        callback: Callback<TaskFailure>,
    },
}

impl<T> Completion<T> {
    pub(crate) fn state(&self) -> TaskState {
        match self {
            Completion::Success { .. } => TaskState::Success,
            Completion::Error { .. } => TaskState::Error,
        }
    }

    pub(crate) fn fire(self) {
        match self {
            Completion::Success { value, callback } => callback.call(&value),
            Completion::Error { failure, callback } => callback.call(&failure),
        }
    }
}

struct HandleState<T> {
    state: TaskState,
    value: Option<Arc<T>>,
    failure: Option<Arc<TaskFailure>>,
    on_complete: Callback<T>,
    on_error: Callback<TaskFailure>,
    /// Set when a callback registered after publish ran in place of the
    /// one handed to the synchronization loop.
    callback_replaced: bool,
    termination: Option<TerminationReport>,
}

struct HandleInner<T> {
    identity: TaskIdentity,
    worker_pid: Option<u32>,
    state: Mutex<HandleState<T>>,
    finished: Condvar,
}

/// Handle to one invocation of a wrapped function.
///
/// Clones refer to the same invocation. The handle never blocks except in
/// [`wait`](Self::wait) and [`wait_timeout`](Self::wait_timeout).
pub struct TaskHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(identity: TaskIdentity, worker_pid: Option<u32>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                identity,
                worker_pid,
                state: Mutex::new(HandleState {
                    state: TaskState::Incomplete,
                    value: None,
                    failure: None,
                    on_complete: Callback::Noop,
                    on_error: Callback::Noop,
                    callback_replaced: false,
                    termination: None,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn identity(&self) -> TaskIdentity {
        self.inner.identity
    }

    /// Pid of the worker process, for tasks run in a process.
    pub fn worker_pid(&self) -> Option<u32> {
        self.inner.worker_pid
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Report of the termination protocol, once it has run for this task.
    pub fn termination(&self) -> Option<TerminationReport> {
        self.inner.state.lock().termination
    }

    /// Register the success callback, replacing any previous one.
    ///
    /// If the task already succeeded the callback runs right away on the
    /// calling thread, and a previously registered callback that has not
    /// been run yet is discarded. It is dropped unused if the task already
    /// failed.
    pub fn on_complete<C>(&self, callback: C) -> &Self
    where
        C: FnOnce(&T) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let current = state.state;
        match current {
            TaskState::Incomplete => state.on_complete = Callback::Registered(Box::new(callback)),
            TaskState::Success => {
                if let Some(value) = state.value.clone() {
                    state.callback_replaced = true;
                    drop(state);
                    callback(&value);
                }
            }
            TaskState::Error => {
                tracing::trace!(task = %self.inner.identity, "Task failed, success callback will not run");
            }
        }
        self
    }

    /// Register the error callback, replacing any previous one.
    ///
    /// If the task already failed the callback runs right away on the
    /// calling thread, and a previously registered callback that has not
    /// been run yet is discarded. It is dropped unused if the task already
    /// succeeded.
    pub fn on_error<C>(&self, callback: C) -> &Self
    where
        C: FnOnce(&TaskFailure) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let current = state.state;
        match current {
            TaskState::Incomplete => state.on_error = Callback::Registered(Box::new(callback)),
            TaskState::Error => {
                if let Some(failure) = state.failure.clone() {
                    state.callback_replaced = true;
                    drop(state);
                    callback(&failure);
                }
            }
            TaskState::Success => {
                tracing::trace!(task = %self.inner.identity, "Task succeeded, error callback will not run");
            }
        }
        self
    }

    /// Block until the task finishes. Returns the value on success and
    /// `None` on failure.
    ///
    /// Blocks forever if the worker is lost without reporting; use
    /// [`wait_timeout`](Self::wait_timeout) when that matters.
    pub fn wait(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut state = self.inner.state.lock();
        while !state.state.is_terminal() {
            self.inner.finished.wait(&mut state);
        }
        state.value.as_deref().cloned()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `None`. Does not cancel the worker.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T>
    where
        T: Clone,
    {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait();
        };

        let mut state = self.inner.state.lock();
        while !state.state.is_terminal() {
            if self.inner.finished.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.value.as_deref().cloned()
    }

    /// The value, if the task succeeded. Never blocks.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.state.lock().value.as_deref().cloned()
    }

    /// The captured failure, if the task failed. Never blocks.
    pub fn failure(&self) -> Option<TaskFailure> {
        self.inner.state.lock().failure.as_deref().cloned()
    }

    /// Surface the captured failure as an error in the caller's context.
    ///
    /// Always returns `Err`: [`TaskError::Failed`] in the error state,
    /// [`TaskError::NoErrorToBurst`] otherwise.
    pub fn burst(&self) -> Result<Infallible> {
        let state = self.inner.state.lock();
        match (state.state, &state.failure) {
            (TaskState::Error, Some(failure)) => Err(TaskError::Failed(TaskFailure::clone(failure))),
            (current, _) => Err(TaskError::NoErrorToBurst { state: current }),
        }
    }

    /// Move to the terminal state matching `outcome` and wake all waiters.
    ///
    /// The callback registered at this moment is handed back to be fired
    /// outside the lock. Returns `None` if the task was already terminal.
    pub(crate) fn publish(&self, outcome: Outcome<T>) -> Option<Completion<T>> {
        let mut state = self.inner.state.lock();
        if state.state.is_terminal() {
            tracing::error!(task = %self.inner.identity, "Ignoring second outcome for a finished task");
            return None;
        }

        let completion = match outcome {
            Outcome::Success(value) => {
                let value = Arc::new(value);
                state.state = TaskState::Success;
                state.value = Some(Arc::clone(&value));
                state.on_error = Callback::Noop;
                Completion::Success {
                    value,
                    callback: std::mem::take(&mut state.on_complete),
                }
            }
            Outcome::Failure(failure) => {
                let failure = Arc::new(failure);
                state.state = TaskState::Error;
                state.failure = Some(Arc::clone(&failure));
                state.on_complete = Callback::Noop;
                Completion::Error {
                    failure,
                    callback: std::mem::take(&mut state.on_error),
                }
            }
        };

        drop(state);
        self.inner.finished.notify_all();
        Some(completion)
    }

    /// Run the callback handed out by [`publish`](Self::publish), unless a
    /// callback registered since then already ran in its place.
    pub(crate) fn fire(&self, completion: Completion<T>) {
        if self.inner.state.lock().callback_replaced {
            tracing::trace!(task = %self.inner.identity, "Published callback was replaced, not running it");
            return;
        }
        completion.fire();
    }

    pub(crate) fn record_termination(&self, report: TerminationReport) {
        self.inner.state.lock().termination = Some(report);
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("identity", &self.inner.identity)
            .field("worker_pid", &self.inner.worker_pid)
            .field("state", &self.state())
            .finish()
    }
}
