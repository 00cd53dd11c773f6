// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use crate::handle::TaskState;
use crate::outcome::TaskFailure;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Concurrency limit exceeded: '{task}' only allows {limit} concurrent execution(s)")]
    ConcurrencyLimitExceeded { task: String, limit: usize },

    #[error("Task failed: {0}")]
    Failed(TaskFailure),

    #[error("Nothing to burst: task is {state}, not in error state")]
    NoErrorToBurst { state: TaskState },

    #[error("Failed to start worker: {0}")]
    Spawn(String),

    #[error("Result channel error: {0}")]
    Channel(String),

    #[error("Outcome encoding error: {0}")]
    Codec(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// The captured worker failure, if this error carries one.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            TaskError::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
