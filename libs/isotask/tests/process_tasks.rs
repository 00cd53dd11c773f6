// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process-path tests. Every task here runs in a forked worker.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use isotask::{
    in_process, ConcurrencyLimiter, ExecConfig, FailureKind, TaskError, TaskState,
    TerminationPolicy, TerminationStage,
};
use serial_test::serial;

#[derive(Debug, thiserror::Error)]
#[error("invalid value: {0}")]
struct ValueError(String);

fn sleep_then_double(n: u64) -> Result<u64, ValueError> {
    thread::sleep(Duration::from_secs(n));
    Ok(n * 2)
}

fn raise_value_error(_: ()) -> Result<u64, ValueError> {
    Err(ValueError("nope".to_string()))
}

fn fast_config() -> ExecConfig {
    ExecConfig::default().with_poll_interval(Duration::from_millis(20))
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn test_sleep_then_double_waits_and_returns() {
    let task = in_process(sleep_then_double).with_limiter(ConcurrencyLimiter::new());

    let start = Instant::now();
    let handle = task.call(1).unwrap();
    assert!(start.elapsed() < Duration::from_millis(500), "call must not block");
    assert!(handle.worker_pid().is_some());

    assert_eq!(handle.wait(), Some(2));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(950), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10));

    assert_eq!(handle.state(), TaskState::Success);
    assert_eq!(handle.result(), Some(2));
}

#[test]
fn test_error_is_captured_and_burst() {
    let task = in_process(raise_value_error)
        .with_config(fast_config())
        .with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(()).unwrap();

    assert_eq!(handle.wait(), None);
    assert_eq!(handle.state(), TaskState::Error);

    let Err(err) = handle.burst();
    let failure = err.failure().expect("burst carries the failure").clone();
    assert_eq!(failure.kind, FailureKind::Error);
    assert_eq!(failure.short_type_name(), "ValueError");
    assert_eq!(failure.message, "invalid value: nope");
    assert_eq!(err.to_string(), "Task failed: ValueError: invalid value: nope");
}

#[test]
fn test_second_call_is_rejected_at_limit_one() {
    fn add((a, b): (i32, i32)) -> Result<i32, String> {
        thread::sleep(Duration::from_millis(300));
        Ok(a + b)
    }

    let limiter = ConcurrencyLimiter::new();
    let task = in_process(add)
        .with_config(fast_config())
        .with_limiter(limiter.clone())
        .max_concurrent(1);

    let first = task.call((1, 2)).unwrap();
    let second = task.call((3, 4));
    assert!(matches!(
        second,
        Err(TaskError::ConcurrencyLimitExceeded { limit: 1, .. })
    ));
    assert_eq!(limiter.in_flight(task.identity()), 1);

    assert_eq!(first.wait(), Some(3));

    // The slot comes back once the synchronization loop has finished.
    let deadline = Instant::now() + Duration::from_secs(5);
    while limiter.in_flight(task.identity()) > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(limiter.in_flight(task.identity()), 0);
    let third = task.call((5, 6)).unwrap();
    assert_eq!(third.wait(), Some(11));
}

#[test]
#[serial]
fn test_wrappers_share_the_process_wide_limiter() {
    fn slow(n: u8) -> Result<u8, String> {
        thread::sleep(Duration::from_millis(300));
        Ok(n)
    }

    let a = in_process(slow).with_config(fast_config()).max_concurrent(1);
    let b = in_process(slow).with_config(fast_config()).max_concurrent(1);

    let running = a.call(1).unwrap();
    assert!(matches!(
        b.call(2),
        Err(TaskError::ConcurrencyLimitExceeded { .. })
    ));
    assert_eq!(running.wait(), Some(1));
}

#[test]
fn test_late_callback_fires_once_synchronously() {
    let task = in_process(sleep_then_double).with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(0).unwrap();
    assert_eq!(handle.wait(), Some(0));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    handle.on_complete(move |value| {
        assert_eq!(*value, 0);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_early_callbacks_fire_from_sync_loop() {
    let task = in_process(sleep_then_double)
        .with_config(fast_config())
        .with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(1).unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let errors = Arc::new(AtomicUsize::new(0));
    let seen_errors = Arc::clone(&errors);
    handle
        .on_complete(move |value| {
            tx.send(*value).ok();
        })
        .on_error(move |_| {
            seen_errors.fetch_add(1, Ordering::SeqCst);
        });

    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wait_is_idempotent_and_burst_is_guarded_on_success() {
    let task = in_process(sleep_then_double).with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(0).unwrap();

    assert_eq!(handle.wait(), Some(0));
    let start = Instant::now();
    assert_eq!(handle.wait(), Some(0));
    assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Some(0));
    assert!(start.elapsed() < Duration::from_millis(100));

    let Err(err) = handle.burst();
    assert!(matches!(
        err,
        TaskError::NoErrorToBurst {
            state: TaskState::Success
        }
    ));
}

#[test]
fn test_panic_is_reported_as_panic() {
    fn explode(_: ()) -> Result<u8, String> {
        panic!("worker blew up");
    }

    let task = in_process(explode)
        .with_config(fast_config())
        .with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(()).unwrap();

    assert_eq!(handle.wait(), None);
    let failure = handle.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Panic);
    assert_eq!(failure.message, "worker blew up");
}

#[test]
fn test_worker_lost_without_outcome_stays_incomplete() {
    fn vanish(_: ()) -> Result<u8, String> {
        // SAFETY: exits the forked worker immediately, skipping the report.
        unsafe { libc::_exit(3) }
    }

    let limiter = ConcurrencyLimiter::new();
    let task = in_process(vanish)
        .with_config(fast_config())
        .with_limiter(limiter.clone());
    let handle = task.call(()).unwrap();
    let pid = handle.worker_pid().unwrap();

    assert_eq!(handle.wait_timeout(Duration::from_millis(500)), None);
    assert_eq!(handle.state(), TaskState::Incomplete);
    assert!(handle.failure().is_none());
    // The slot of a lost worker is never given back.
    assert_eq!(limiter.in_flight(task.identity()), 1);

    // The synchronization loop still reaps the dead worker.
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_alive(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!process_alive(pid));
}

#[test]
fn test_large_value_crosses_the_pipe() {
    fn big(len: usize) -> Result<Vec<u8>, String> {
        Ok((0..len).map(|i| (i % 251) as u8).collect())
    }

    let task = in_process(big).with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(1 << 20).unwrap();
    let value = handle.wait_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(value.len(), 1 << 20);
    assert_eq!(value[1000], (1000 % 251) as u8);
}

#[test]
fn test_many_concurrent_workers() {
    fn square(n: u64) -> Result<u64, String> {
        thread::sleep(Duration::from_millis(50));
        Ok(n * n)
    }

    let task = in_process(square)
        .with_config(fast_config())
        .with_limiter(ConcurrencyLimiter::new());
    let handles: Vec<_> = (0..8).map(|n| task.call(n).unwrap()).collect();

    for (n, handle) in handles.iter().enumerate() {
        let n = n as u64;
        assert_eq!(handle.wait_timeout(Duration::from_secs(10)), Some(n * n));
    }
}

fn print_and_double(n: u64) -> Result<u64, ValueError> {
    use std::io::Write;
    let mut out = std::io::stdout().lock();
    writeln!(out, "worker {} doubling {}", std::process::id(), n).ok();
    writeln!(std::io::stderr(), "worker {} done", std::process::id()).ok();
    Ok(n * 2)
}

#[test]
fn test_worker_can_print_while_another_thread_holds_stdout() {
    let task = in_process(print_and_double)
        .with_config(fast_config())
        .with_limiter(ConcurrencyLimiter::new());

    let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
    let holder = thread::spawn(move || {
        let _stdout = std::io::stdout().lock();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(500));
    });
    locked_rx.recv().unwrap();

    let handle = task.call(4).unwrap();
    assert_eq!(handle.wait_timeout(Duration::from_secs(10)), Some(8));
    assert_eq!(handle.state(), TaskState::Success);
    holder.join().unwrap();
}

#[test]
fn test_function_runs_inside_a_worker_process() {
    fn where_am_i(_: ()) -> Result<(bool, u32), String> {
        Ok((isotask::is_worker_process(), std::process::id()))
    }

    let task = in_process(where_am_i).with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(()).unwrap();
    let (in_worker, pid) = handle.wait_timeout(Duration::from_secs(10)).unwrap();

    assert!(in_worker);
    assert_ne!(pid, std::process::id());
    assert_eq!(Some(pid), handle.worker_pid());
    assert!(!isotask::is_worker_process());
}

#[test]
fn test_terminate_on_return_escalates_for_stubborn_worker() {
    fn return_then_spin(_: ()) -> Result<u32, String> {
        // SAFETY: changing the signal disposition inside the worker only.
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
        isotask::spawn_lingering(|| loop {
            std::hint::spin_loop();
        })
        .map_err(|e| e.to_string())?;
        // Leave time for the caller to register its callback.
        thread::sleep(Duration::from_millis(200));
        Ok(7)
    }

    let policy = TerminationPolicy::default()
        .with_grace_period(Duration::from_millis(300))
        .with_kill_wait(Duration::from_secs(2));
    let task = in_process(return_then_spin)
        .with_config(fast_config().with_termination(policy))
        .with_limiter(ConcurrencyLimiter::new())
        .terminate_on_return(true);

    let handle = task.call(()).unwrap();
    let pid = handle.worker_pid().unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    handle.on_complete(move |value| {
        tx.send((*value, process_alive(pid))).ok();
    });

    let (value, alive_in_callback) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(value, 7);
    assert!(!alive_in_callback, "worker must be gone before on_complete fires");

    let report = handle.termination().unwrap();
    assert_eq!(report.pid, pid);
    assert_eq!(report.final_stage, TerminationStage::Dead);
    assert!(report.escalated);
    assert!(report.elapsed <= policy.max_duration() + Duration::from_millis(500));
}

#[test]
fn test_terminate_on_return_cooperative_stop() {
    fn return_and_linger(_: ()) -> Result<u32, String> {
        isotask::spawn_lingering(|| loop {
            thread::sleep(Duration::from_millis(10));
        })
        .map_err(|e| e.to_string())?;
        Ok(1)
    }

    let task = in_process(return_and_linger)
        .with_config(fast_config())
        .with_limiter(ConcurrencyLimiter::new())
        .terminate_on_return(true);
    let handle = task.call(()).unwrap();
    let pid = handle.worker_pid().unwrap();
    assert_eq!(handle.wait_timeout(Duration::from_secs(10)), Some(1));

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.termination().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let report = handle.termination().unwrap();
    assert!(report.is_dead());
    assert!(!report.escalated);
    assert!(!process_alive(pid));
}

#[test]
fn test_without_termination_lingering_worker_runs_to_completion() {
    fn return_then_finish(_: ()) -> Result<u32, String> {
        isotask::spawn_lingering(|| thread::sleep(Duration::from_millis(300)))
            .map_err(|e| e.to_string())?;
        Ok(5)
    }

    let task = in_process(return_then_finish)
        .with_config(fast_config())
        .with_limiter(ConcurrencyLimiter::new());
    let handle = task.call(()).unwrap();
    let pid = handle.worker_pid().unwrap();

    assert_eq!(handle.wait_timeout(Duration::from_secs(10)), Some(5));
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_alive(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!process_alive(pid));
    assert!(handle.termination().is_none());
}
