// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Result channels: the one-shot transport from a worker to its task handle.
//!
//! The process path uses an OS pipe so the outcome can leave the worker's
//! address space. The thread path uses a crossbeam channel. Both are read
//! through [`OutcomeReceiver`] by the synchronization loop.

use std::marker::PhantomData;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::outcome::Outcome;

/// Why a receiver can no longer produce an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    /// Every sender is gone and no outcome was delivered.
    #[error("worker went away without reporting an outcome")]
    Disconnected,

    /// Bytes arrived but did not form a valid outcome.
    #[error("corrupt outcome frame: {0}")]
    Corrupt(String),
}

/// Read side of a result channel.
pub trait OutcomeReceiver<T>: Send {
    /// Wait up to `timeout` for the outcome.
    ///
    /// `Ok(None)` means nothing arrived yet and is not an error.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Outcome<T>>, RecvError>;
}

/// Create an in-process result channel for the thread path.
pub fn in_process_channel<T>() -> (InProcessSender<T>, InProcessReceiver<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (InProcessSender { tx }, InProcessReceiver { rx })
}

/// Sends the single outcome of a thread worker.
pub struct InProcessSender<T> {
    tx: Sender<Outcome<T>>,
}

impl<T> InProcessSender<T> {
    /// Deliver the outcome, consuming the sender.
    ///
    /// Returns `false` when the receiving side was already dropped.
    pub fn send(self, outcome: Outcome<T>) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

pub struct InProcessReceiver<T> {
    rx: Receiver<Outcome<T>>,
}

impl<T: Send> OutcomeReceiver<T> for InProcessReceiver<T> {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Outcome<T>>, RecvError> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RecvError::Disconnected),
        }
    }
}

#[cfg(unix)]
pub use pipe::{result_channel, ResultReceiver, ResultSender};

#[cfg(unix)]
mod pipe {
    use super::*;

    use std::fs::File;
    use std::io::{self, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use crate::error::{Result, TaskError};
    use crate::outcome::{encode_frame, read_frame, TaskFailure};

    /// Create a pipe-backed result channel.
    ///
    /// Both ends are close-on-exec. The sender is meant to be moved into a
    /// forked worker; the parent must drop its copy right after the fork so
    /// the receiver can observe end-of-stream when the worker dies.
    pub fn result_channel<T>() -> Result<(ResultSender<T>, ResultReceiver<T>)> {
        let (read_fd, write_fd) = pipe_cloexec()
            .map_err(|e| TaskError::Channel(format!("Failed to create result pipe: {}", e)))?;

        Ok((
            ResultSender {
                file: File::from(write_fd),
                _marker: PhantomData,
            },
            ResultReceiver {
                file: File::from(read_fd),
                finished: false,
                _marker: PhantomData,
            },
        ))
    }

    /// Write end of a result pipe. Sending consumes it, so a worker can
    /// report at most once.
    pub struct ResultSender<T> {
        file: File,
        _marker: PhantomData<fn(T)>,
    }

    impl<T: Serialize> ResultSender<T> {
        /// Write the outcome as a single frame.
        ///
        /// A success value that cannot be serialized is replaced by a failure
        /// explaining why, so the receiver still gets exactly one outcome.
        pub fn send(mut self, outcome: &Outcome<T>) -> Result<()> {
            let frame = match encode_frame(outcome) {
                Ok(frame) => frame,
                Err(TaskError::Codec(reason)) => {
                    encode_frame::<T>(&Outcome::Failure(TaskFailure::unencodable(reason)))?
                }
                Err(e) => return Err(e),
            };
            self.file.write_all(&frame)?;
            self.file.flush()?;
            Ok(())
        }
    }

    /// Read end of a result pipe.
    pub struct ResultReceiver<T> {
        file: File,
        finished: bool,
        _marker: PhantomData<fn() -> T>,
    }

    impl<T> ResultReceiver<T> {
        /// Block in `poll(2)` until the pipe is readable (data or hang-up)
        /// or `timeout` elapses.
        fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
            let mut pfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

            loop {
                // SAFETY: `pfd` is a valid pollfd for the duration of the call
                // and we pass a count of exactly one.
                let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                return Ok(rc > 0);
            }
        }
    }

    impl<T: DeserializeOwned> OutcomeReceiver<T> for ResultReceiver<T> {
        fn recv_timeout(&mut self, timeout: Duration) -> std::result::Result<Option<Outcome<T>>, RecvError> {
            if self.finished {
                return Err(RecvError::Disconnected);
            }

            match self.wait_readable(timeout) {
                Ok(false) => return Ok(None),
                Ok(true) => {}
                Err(e) => {
                    self.finished = true;
                    return Err(RecvError::Corrupt(format!("poll on result pipe failed: {}", e)));
                }
            }

            // Readable: either a frame is (being) written or every writer hung up.
            let frame = read_frame(&mut self.file);
            self.finished = true;
            match frame {
                Ok(Some(outcome)) => Ok(Some(outcome)),
                Ok(None) => Err(RecvError::Disconnected),
                Err(TaskError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    Err(RecvError::Disconnected)
                }
                Err(e) => Err(RecvError::Corrupt(e.to_string())),
            }
        }
    }

    fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds: [libc::c_int; 2] = [-1, -1];

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
        {
            // SAFETY: `fds` has room for the two descriptors pipe2 writes.
            if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
        {
            // SAFETY: `fds` has room for the two descriptors pipe writes.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                // SAFETY: `fd` was just returned by pipe and is owned by us.
                if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
                    let err = io::Error::last_os_error();
                    // SAFETY: closing descriptors we own and will not reuse.
                    unsafe {
                        libc::close(fds[0]);
                        libc::close(fds[1]);
                    }
                    return Err(err);
                }
            }
        }

        // SAFETY: both descriptors are freshly created, open, and owned by
        // nothing else.
        unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
    }
}
