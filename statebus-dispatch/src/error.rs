//! Dispatch error types.

use std::time::Duration;
use thiserror::Error;

/// Errors from the dispatch primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("executor is closed")]
    Closed,

    #[error("invocation was dropped before completion")]
    Dropped,

    #[error("timed out after {waited:?} waiting for the dispatch section")]
    TimedOut { waited: Duration },
}
