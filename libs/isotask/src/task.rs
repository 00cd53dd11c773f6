// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Invocation surface: wrap a function once, call it many times.
//!
//! ```no_run
//! # fn main() -> isotask::Result<()> {
//! fn sleep_then_double(n: u64) -> Result<u64, std::io::Error> {
//!     std::thread::sleep(std::time::Duration::from_secs(n));
//!     Ok(n * 2)
//! }
//!
//! let task = isotask::in_process(sleep_then_double).max_concurrent(4);
//! let handle = task.call(1)?;
//! handle.on_complete(|value| assert_eq!(*value, 2));
//! assert_eq!(handle.wait(), Some(2));
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ExecConfig;
use crate::error::{Result, TaskError};
use crate::handle::TaskHandle;
use crate::limiter::{ConcurrencyLimit, ConcurrencyLimiter, TaskIdentity};
use crate::sync_loop;

/// Marker: run each call in an isolated worker process.
#[derive(Debug, Clone, Copy)]
pub struct Process;

/// Marker: run each call on a worker thread.
#[derive(Debug, Clone, Copy)]
pub struct Thread;

/// A function wrapped for asynchronous execution.
pub struct Task<F, P> {
    function: Arc<F>,
    identity: TaskIdentity,
    config: ExecConfig,
    limiter: ConcurrencyLimiter,
    _path: PhantomData<P>,
}

pub type ProcessTask<F> = Task<F, Process>;
pub type ThreadTask<F> = Task<F, Thread>;

/// Wrap `function` so each call runs in its own worker process.
///
/// Configuration starts from [`ExecConfig::from_env`]; limits are tracked in
/// [`ConcurrencyLimiter::shared`], separately from [`in_thread`] wrappers.
///
/// # Fork safety
/// The worker is a `fork` of the calling process and only the calling
/// thread is copied into it. Stdout and stderr are held across the fork, so
/// the function may print and log. Any other lock that a different thread
/// holds at that moment stays locked in the worker for good: a function
/// that takes such a lock (an application mutex, a connection pool) hangs
/// the worker before it can report.
pub fn in_process<F: 'static>(function: F) -> ProcessTask<F> {
    Task::new(function)
}

/// Wrap `function` so each call runs on its own worker thread.
pub fn in_thread<F: 'static>(function: F) -> ThreadTask<F> {
    Task::new(function)
}

impl<F: 'static, P: 'static> Task<F, P> {
    fn new(function: F) -> Self {
        Self {
            identity: TaskIdentity::for_value(&function).scoped::<P>(),
            function: Arc::new(function),
            config: ExecConfig::from_env(),
            limiter: ConcurrencyLimiter::shared(),
            _path: PhantomData,
        }
    }
}

impl<F, P> Task<F, P> {
    /// Allow at most `max` calls in flight at once.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = ConcurrencyLimit::AtMost(max);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.config.max_concurrent = ConcurrencyLimit::Unbounded;
        self
    }

    /// Terminate the worker process once it has produced its outcome.
    pub fn terminate_on_return(mut self, terminate: bool) -> Self {
        self.config.terminate_on_return = terminate;
        self
    }

    pub fn with_config(mut self, config: ExecConfig) -> Self {
        self.config = config;
        self
    }

    /// Track in-flight calls in `limiter` instead of the shared table.
    pub fn with_limiter(mut self, limiter: ConcurrencyLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Report this task under `name` in logs and errors.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.identity = self.identity.named(name);
        self
    }

    /// Count this task's calls under `key`. Wrappers on the same path that
    /// use the same key share one concurrency limit.
    pub fn with_key(mut self, key: &'static str) -> Self
    where
        P: 'static,
    {
        self.identity = TaskIdentity::keyed(key).scoped::<P>();
        self
    }

    pub fn identity(&self) -> TaskIdentity {
        self.identity
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    fn admit(&self) -> Result<()> {
        if self.limiter.try_admit(self.identity, self.config.max_concurrent) {
            return Ok(());
        }
        let limit = match self.config.max_concurrent {
            ConcurrencyLimit::AtMost(max) => max,
            ConcurrencyLimit::Unbounded => usize::MAX,
        };
        Err(TaskError::ConcurrencyLimitExceeded {
            task: self.identity.to_string(),
            limit,
        })
    }

    /// Run `start` with an admitted slot, giving the slot back if it fails.
    fn start_admitted<T>(&self, start: impl FnOnce() -> Result<TaskHandle<T>>) -> Result<TaskHandle<T>> {
        self.admit()?;
        let started = start();
        if let Err(e) = &started {
            tracing::error!(task = %self.identity, "Failed to start task: {}", e);
            self.limiter.release(self.identity);
        }
        started
    }
}

impl<F> ProcessTask<F> {
    /// Start `function(args)` in a new worker process and return its handle.
    ///
    /// Fails with [`TaskError::ConcurrencyLimitExceeded`] without starting
    /// anything if the limit is reached.
    ///
    /// The calling thread is the only thread copied into the worker; see
    /// [`in_process`] for which locks the function may take.
    #[cfg(unix)]
    pub fn call<A, T, E>(&self, args: A) -> Result<TaskHandle<T>>
    where
        F: Fn(A) -> std::result::Result<T, E>,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Display,
    {
        self.start_admitted(|| {
            let (worker, receiver) =
                crate::subprocess::launch(self.identity.name(), &*self.function, args)?;
            let handle = TaskHandle::new(self.identity, Some(worker.pid()));
            sync_loop::spawn(handle.clone(), receiver, worker, self.limiter.clone(), self.config)?;
            Ok(handle)
        })
    }

    /// Worker processes need `fork`, which this platform lacks.
    #[cfg(not(unix))]
    pub fn call<A, T, E>(&self, _args: A) -> Result<TaskHandle<T>>
    where
        F: Fn(A) -> std::result::Result<T, E>,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Display,
    {
        Err(TaskError::NotSupported(format!(
            "worker processes for '{}' require a Unix platform",
            self.identity
        )))
    }
}

impl<F> ThreadTask<F> {
    /// Start `function(args)` on a new worker thread and return its handle.
    pub fn call<A, T, E>(&self, args: A) -> Result<TaskHandle<T>>
    where
        F: Fn(A) -> std::result::Result<T, E> + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + Sync + 'static,
        E: Display,
    {
        if self.config.terminate_on_return {
            tracing::debug!(task = %self.identity, "terminate_on_return has no effect on worker threads");
        }

        self.start_admitted(|| {
            let (worker, receiver) =
                crate::thread::launch(self.identity.name(), Arc::clone(&self.function), args)?;
            let handle = TaskHandle::new(self.identity, None);
            sync_loop::spawn(handle.clone(), receiver, worker, self.limiter.clone(), self.config)?;
            Ok(handle)
        })
    }
}

impl<F, P> Clone for Task<F, P> {
    fn clone(&self) -> Self {
        Self {
            function: Arc::clone(&self.function),
            identity: self.identity,
            config: self.config,
            limiter: self.limiter.clone(),
            _path: PhantomData,
        }
    }
}

impl<F, P> std::fmt::Debug for Task<F, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish()
    }
}
