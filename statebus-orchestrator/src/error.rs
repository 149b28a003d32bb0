//! Orchestrator error types.

use statebus_core::CoreError;
use thiserror::Error;

/// Errors resolved through orchestrated sends.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("machine '{machine}' not found")]
    NotFound { machine: String },

    #[error("machine '{machine}' is disposed")]
    Disposed { machine: String },

    #[error("machine '{machine}' is already registered")]
    AlreadyRegistered { machine: String },

    #[error("queue of machine '{machine}' is full ({capacity} entries)")]
    QueueFull { machine: String, capacity: usize },

    #[error("delivery to '{machine}' was dropped before completion")]
    Dropped { machine: String },

    #[error("orchestrator shutting down")]
    ShuttingDown,

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl OrchestratorError {
    /// Returns an error code suitable for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound { .. } => "MACHINE_NOT_FOUND",
            OrchestratorError::Disposed { .. } => "DISPOSED",
            OrchestratorError::AlreadyRegistered { .. } => "MACHINE_EXISTS",
            OrchestratorError::QueueFull { .. } => "QUEUE_FULL",
            OrchestratorError::Dropped { .. } => "DELIVERY_DROPPED",
            OrchestratorError::ShuttingDown => "SHUTTING_DOWN",
            OrchestratorError::Core(e) => e.error_code(),
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::QueueFull { .. } | OrchestratorError::Dropped { .. }
        )
    }

    /// Maps an interpreter error, folding disposal into [`OrchestratorError::Disposed`].
    pub(crate) fn from_core(err: CoreError) -> Self {
        match err {
            CoreError::Disposed { machine } => OrchestratorError::Disposed { machine },
            other => OrchestratorError::Core(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = OrchestratorError::QueueFull {
            machine: "m1".to_string(),
            capacity: 8,
        };
        assert_eq!(err.error_code(), "QUEUE_FULL");
        assert!(err.is_retryable());

        let err = OrchestratorError::from(CoreError::MicrostepLimit {
            machine: "m1".to_string(),
            limit: 10,
        });
        assert_eq!(err.error_code(), "MICROSTEP_LIMIT");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_disposed_is_folded() {
        let err = OrchestratorError::from_core(CoreError::Disposed {
            machine: "m1".to_string(),
        });
        assert!(matches!(err, OrchestratorError::Disposed { ref machine } if machine == "m1"));
        assert_eq!(err.to_string(), "machine 'm1' is disposed");
    }
}
