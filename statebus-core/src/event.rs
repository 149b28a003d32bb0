//! Events and reserved event names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Name of the pseudo-event reported when a machine starts.
pub const INIT_EVENT: &str = "statebus.init";

/// Raised internally when an action fails.
pub const ERROR_EXECUTION: &str = "error.execution";

const DONE_STATE_PREFIX: &str = "done.state.";
const DONE_INVOKE_PREFIX: &str = "done.invoke.";
const ERROR_PLATFORM_PREFIX: &str = "error.platform.";

/// `done.state.<id>`
pub fn done_state(state_id: &str) -> String {
    format!("{}{}", DONE_STATE_PREFIX, state_id)
}

/// `done.invoke.<id>`
pub fn done_invoke(invoke_id: &str) -> String {
    format!("{}{}", DONE_INVOKE_PREFIX, invoke_id)
}

/// `error.platform.<id>`
pub fn error_platform(invoke_id: &str) -> String {
    format!("{}{}", ERROR_PLATFORM_PREFIX, invoke_id)
}

/// Correlates a running invocation with the events it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "invocation", rename_all = "lowercase")]
pub enum EventOrigin {
    /// Sent by a host or another machine.
    External,
    /// Raised inside a macrostep.
    Internal,
    /// Completion of an invoked service.
    Invocation(InvocationId),
}

/// An event delivered to a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    pub origin: EventOrigin,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            origin: EventOrigin::External,
        }
    }

    pub fn internal(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            origin: EventOrigin::Internal,
        }
    }

    pub fn from_invocation(id: InvocationId, name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            origin: EventOrigin::Invocation(id),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.origin == EventOrigin::Internal
    }
}
