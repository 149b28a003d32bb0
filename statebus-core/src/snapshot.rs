//! Read-only descriptions of a machine.

use crate::chart::{Chart, StateIndex, StateKind};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Interpreter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Constructed,
    Started,
    Running,
    Disposed,
}

impl Lifecycle {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Constructed => 0,
            Lifecycle::Started => 1,
            Lifecycle::Running => 2,
            Lifecycle::Disposed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Constructed,
            1 => Lifecycle::Started,
            2 => Lifecycle::Running,
            _ => Lifecycle::Disposed,
        }
    }
}

/// Result of a dispose call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposeOutcome {
    /// This call disposed the machine and no macrostep was left running.
    Disposed,
    /// Another call got there first.
    AlreadyDisposed,
    /// Disposed, but an in-flight macrostep outlived the timeout.
    TimedOut,
}

/// Point-in-time view of a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub machine_id: String,
    /// Active state ids in document order, root first.
    pub states: Vec<String>,
    /// Active leaf ids in document order.
    pub leaves: Vec<String>,
    /// Nested state value, e.g. `"idle"` or `{"main": {"left": "on", "right": "off"}}`.
    pub value: Value,
    pub context: Value,
    pub lifecycle: Lifecycle,
    pub done: bool,
    /// Whether the call that produced this snapshot took any transition.
    pub changed: bool,
}

impl MachineSnapshot {
    pub(crate) fn capture(
        machine_id: &str,
        chart: &Chart,
        configuration: &BTreeSet<StateIndex>,
        context: &Value,
        lifecycle: Lifecycle,
        done: bool,
        changed: bool,
    ) -> Self {
        let mut states = Vec::with_capacity(configuration.len());
        let mut leaves = Vec::new();
        for &index in configuration {
            let node = chart.node(index);
            states.push(node.id().to_string());
            if node.is_leaf() {
                leaves.push(node.id().to_string());
            }
        }
        let value = if configuration.is_empty() {
            Value::Null
        } else {
            state_value(chart, configuration, chart.root())
        };

        Self {
            machine_id: machine_id.to_string(),
            states,
            leaves,
            value,
            context: context.clone(),
            lifecycle,
            done,
            changed,
        }
    }

    /// Whether the state with this id is active.
    pub fn matches(&self, state_id: &str) -> bool {
        self.states.iter().any(|s| s == state_id)
    }
}

/// Nested value of an active state.
pub(crate) fn state_value(chart: &Chart, configuration: &BTreeSet<StateIndex>, state: StateIndex) -> Value {
    let node = chart.node(state);
    match node.kind() {
        StateKind::Compound => {
            let Some(child) = node.children().iter().copied().find(|c| configuration.contains(c)) else {
                return Value::Null;
            };
            let child_node = chart.node(child);
            if child_node.is_leaf() {
                Value::String(child_node.key().to_string())
            } else {
                let mut map = Map::new();
                map.insert(
                    child_node.key().to_string(),
                    state_value(chart, configuration, child),
                );
                Value::Object(map)
            }
        }
        StateKind::Parallel => Value::Object(
            node.children()
                .iter()
                .map(|&c| (chart.node(c).key().to_string(), state_value(chart, configuration, c)))
                .collect(),
        ),
        StateKind::Atomic | StateKind::Final => Value::Object(Map::new()),
    }
}

/// Published to interpreter subscribers after each committed change.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub machine_id: String,
    pub event: Event,
    pub snapshot: MachineSnapshot,
}
