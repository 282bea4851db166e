use std::time::Duration;

use fleet_protocol::{PartitionId, StateTransitionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Partition already held by another worker. Supervisor assignment is
    /// exclusive, so this is a bug and is never retried.
    #[error("Partition {partition} is already held by worker {holder}")]
    ResourceUnavailable { partition: PartitionId, holder: usize },

    #[error("Pipeline crashed: {0}")]
    PipelineCrash(String),

    #[error("Worker {worker} did not stop within {timeout:?}")]
    ShutdownTimeout { worker: usize, timeout: Duration },

    #[error("Failed to launch worker {worker}: {reason}")]
    LaunchFailure { worker: usize, reason: String },

    #[error("Requested {requested} workers but only {available} partitions are available")]
    InsufficientPartitions { requested: usize, available: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transition(#[from] StateTransitionError),
}

impl Error {
    /// Whether the supervisor may retry the failed operation with a new
    /// worker instance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PipelineCrash(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
