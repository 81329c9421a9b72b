//! Error types for Horizon Weft core.

use std::fmt;

use crate::affinity::WorkerId;

/// The main error type for worker-pool and event-queue operations.
#[derive(Debug)]
pub enum CoreError {
    /// The target worker has shut down and its queue no longer accepts events.
    QueueClosed(WorkerId),
    /// The queue's receive half has already been claimed by its worker.
    ReceiverTaken(WorkerId),
    /// The worker pool has been stopped.
    PoolStopped,
    /// A worker thread or its runtime could not be started.
    Spawn(std::io::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueClosed(worker) => {
                write!(f, "event queue for {worker} is closed")
            }
            Self::ReceiverTaken(worker) => {
                write!(f, "receive half of the queue for {worker} was already claimed")
            }
            Self::PoolStopped => write!(f, "worker pool has been stopped"),
            Self::Spawn(err) => write!(f, "failed to start worker: {err}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Spawn(err)
    }
}

/// A specialized Result type for Horizon Weft core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
