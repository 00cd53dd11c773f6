// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The single terminal message a worker produces, and its wire framing.
//!
//! A frame is a big-endian `u32` body length followed by the MessagePack
//! encoding of an [`Outcome`].

use std::any::{type_name, Any};
use std::fmt;
use std::io::{self, Read};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// Upper bound on a frame body. Anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Terminal result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome<T> {
    Success(T),
    Failure(TaskFailure),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// How the user function failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The function returned `Err`.
    Error,
    /// The function panicked.
    Panic,
}

/// Transportable representation of a failure raised inside a worker.
///
/// The original error value cannot cross a process boundary, so its type
/// name, message and source chain are captured instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl TaskFailure {
    /// Capture any displayable error value.
    pub fn from_error<E: fmt::Display>(error: &E) -> Self {
        Self {
            kind: FailureKind::Error,
            type_name: type_name::<E>().to_string(),
            message: error.to_string(),
            sources: Vec::new(),
        }
    }

    /// Capture a `std::error::Error`, including its `source()` chain.
    pub fn from_std_error<E: std::error::Error>(error: &E) -> Self {
        let mut sources = Vec::new();
        let mut next = error.source();
        while let Some(source) = next {
            sources.push(source.to_string());
            next = source.source();
        }

        Self {
            sources,
            ..Self::from_error(error)
        }
    }

    /// Capture a panic payload as returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        Self {
            kind: FailureKind::Panic,
            type_name: "panic".to_string(),
            message,
            sources: Vec::new(),
        }
    }

    /// Short type name without the module path (`ValueError` for
    /// `my_crate::errors::ValueError`).
    pub fn short_type_name(&self) -> &str {
        let base = self.type_name.split('<').next().unwrap_or(&self.type_name);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// Stand-in for a value that could not be serialized in the worker.
    pub(crate) fn unencodable(reason: String) -> Self {
        Self {
            kind: FailureKind::Error,
            type_name: "isotask::error::TaskError".to_string(),
            message: format!("outcome could not be encoded: {}", reason),
            sources: Vec::new(),
        }
    }

    pub fn is_panic(&self) -> bool {
        self.kind == FailureKind::Panic
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Panic => write!(f, "worker panicked: {}", self.message)?,
            FailureKind::Error => write!(f, "{}: {}", self.short_type_name(), self.message)?,
        }
        for source in &self.sources {
            write!(f, "\n  caused by: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {}

/// Encode an outcome as a length-prefixed frame.
pub fn encode_frame<T: Serialize>(outcome: &Outcome<T>) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(outcome)
        .map_err(|e| TaskError::Codec(format!("Failed to encode outcome: {}", e)))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(TaskError::Codec(format!(
            "Outcome of {} bytes exceeds the {} byte frame limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (without the length prefix).
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<Outcome<T>> {
    rmp_serde::from_slice(body)
        .map_err(|e| TaskError::Codec(format!("Failed to decode outcome: {}", e)))
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end-of-stream before any byte of the frame
/// arrived. A stream that ends mid-frame is an `UnexpectedEof` I/O error.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<Outcome<T>>> {
    let mut prefix = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TaskError::Codec(format!(
            "Frame length {} exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode_body(&body).map(Some)
}
