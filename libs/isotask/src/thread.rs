// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Thread worker: runs the wrapped function on a parallel thread of the
//! calling process.

use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::channel::{in_process_channel, InProcessReceiver};
use crate::config::TerminationPolicy;
use crate::error::{Result, TaskError};
use crate::outcome::{Outcome, TaskFailure};
use crate::sync_loop::WorkerControl;
use crate::termination::TerminationReport;

/// A worker thread. Threads share memory with the caller and can only be
/// stopped cooperatively, so [`WorkerControl::terminate`] does nothing.
pub struct ThreadWorker {
    name: String,
    thread: Option<JoinHandle<()>>,
}

/// Start `function(args)` on a new thread.
pub fn launch<F, A, T, E>(
    name: &str,
    function: Arc<F>,
    args: A,
) -> Result<(ThreadWorker, InProcessReceiver<T>)>
where
    F: Fn(A) -> std::result::Result<T, E> + Send + Sync + 'static,
    A: Send + 'static,
    T: Send + 'static,
    E: Display,
{
    let (sender, receiver) = in_process_channel();

    let thread = std::thread::Builder::new()
        .name(format!("isotask-worker-{}", short_name(name)))
        .spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| function(args))) {
                Ok(Ok(value)) => Outcome::Success(value),
                Ok(Err(error)) => Outcome::Failure(TaskFailure::from_error(&error)),
                Err(payload) => Outcome::Failure(TaskFailure::from_panic(payload)),
            };
            sender.send(outcome);
        })
        .map_err(|e| TaskError::Spawn(format!("Failed to start worker thread for '{}': {}", name, e)))?;

    tracing::debug!(task = name, "Worker thread started");
    Ok((
        ThreadWorker {
            name: name.to_string(),
            thread: Some(thread),
        },
        receiver,
    ))
}

fn short_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

impl WorkerControl for ThreadWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    fn terminate(&mut self, _policy: &TerminationPolicy) -> Option<TerminationReport> {
        tracing::debug!(task = %self.name, "Worker threads cannot be terminated, leaving it to finish");
        None
    }

    fn reap(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(task = %self.name, "Worker thread panicked outside the wrapped function");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OutcomeReceiver;
    use std::time::Duration;

    fn recv(receiver: &mut InProcessReceiver<i64>) -> Outcome<i64> {
        receiver
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_thread_worker_delivers_value() {
        let (mut worker, mut rx) =
            launch("math::double", Arc::new(|x: i64| Ok::<_, String>(x * 2)), 21).unwrap();
        assert_eq!(recv(&mut rx), Outcome::Success(42));
        worker.reap();
        assert!(!worker.is_alive());
        assert_eq!(worker.pid(), None);
    }

    #[test]
    fn test_thread_worker_captures_error_and_panic() {
        let (mut worker, mut rx) = launch(
            "fails",
            Arc::new(|_: ()| Err::<i64, _>("no luck".to_string())),
            (),
        )
        .unwrap();
        match recv(&mut rx) {
            Outcome::Failure(failure) => assert_eq!(failure.message, "no luck"),
            other => panic!("unexpected {:?}", other),
        }
        worker.reap();

        let (mut worker, mut rx) = launch(
            "panics",
            Arc::new(|_: ()| -> std::result::Result<i64, String> { panic!("kaboom") }),
            (),
        )
        .unwrap();
        match recv(&mut rx) {
            Outcome::Failure(failure) => {
                assert!(failure.is_panic());
                assert_eq!(failure.message, "kaboom");
            }
            other => panic!("unexpected {:?}", other),
        }
        worker.reap();
    }

    #[test]
    fn test_terminate_is_not_available_for_threads() {
        let (mut worker, _rx) =
            launch("noop", Arc::new(|_: ()| Ok::<i64, String>(0)), ()).unwrap();
        assert!(worker.terminate(&TerminationPolicy::default()).is_none());
        worker.reap();
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("my_crate::jobs::resize"), "resize");
        assert_eq!(short_name("plain"), "plain");
    }
}
