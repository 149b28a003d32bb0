//! Core error types.

use thiserror::Error;

/// Errors from chart compilation and the interpreter.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid chart definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("unresolved {kind} '{name}' referenced by state '{state}'")]
    UnresolvedBinding {
        kind: BindingKind,
        name: String,
        state: String,
    },

    #[error("action '{action}' failed in state '{state}' of machine '{machine}': {reason}")]
    ActionFailed {
        machine: String,
        state: String,
        action: String,
        reason: String,
    },

    #[error("machine '{machine}' exceeded {limit} microsteps in one macrostep")]
    MicrostepLimit { machine: String, limit: usize },

    #[error("machine '{machine}' is disposed")]
    Disposed { machine: String },

    #[error("machine '{machine}' has not been started")]
    NotStarted { machine: String },

    #[error("machine '{machine}' was already started")]
    AlreadyStarted { machine: String },

    #[error("service '{service}' needs a tokio runtime but none was available")]
    NoRuntime { service: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What kind of binding a chart name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Action,
    Guard,
    Service,
}

impl std::fmt::Display for BindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingKind::Action => f.write_str("action"),
            BindingKind::Guard => f.write_str("guard"),
            BindingKind::Service => f.write_str("service"),
        }
    }
}

impl CoreError {
    /// Returns whether this error is raised while building a chart.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::InvalidGuard { .. }
                | CoreError::UnresolvedBinding { .. }
                | CoreError::Json(_)
        )
    }

    /// Returns an error code suitable for logs and host-facing results.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidGuard { .. } => "INVALID_DEFINITION",
            CoreError::UnresolvedBinding { .. } => "UNRESOLVED_BINDING",
            CoreError::ActionFailed { .. } => "ACTION_FAILED",
            CoreError::MicrostepLimit { .. } => "MICROSTEP_LIMIT",
            CoreError::Disposed { .. } => "DISPOSED",
            CoreError::NotStarted { .. } => "NOT_STARTED",
            CoreError::AlreadyStarted { .. } => "ALREADY_STARTED",
            CoreError::NoRuntime { .. } => "NO_RUNTIME",
            CoreError::Json(_) => "INVALID_DEFINITION",
        }
    }
}
