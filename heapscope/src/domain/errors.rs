//! Structured error types for heapscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{Address, Target};
use heapscope_common::EngineError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Introspection engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Already connected to {0}; detach first")]
    AlreadyConnected(Target),

    #[error("Session is busy ({0})")]
    Busy(&'static str),

    #[error("No target attached")]
    NotAttached,

    #[error("Session handles are stale (target was detached)")]
    StaleHandles,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session worker has shut down")]
    WorkerGone,

    #[error("Query aborted: {0}")]
    QueryPanicked(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

impl SessionError {
    /// Returns true if retrying the operation may succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SessionError::EngineUnavailable(_) | SessionError::WorkerGone)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    #[error("No type descriptor for object at {0}")]
    MissingType(Address),
}
