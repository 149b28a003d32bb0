//! Action-time view of a machine and the deferred-send outbox.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who a deferred send is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendTarget {
    /// The machine whose action made the request.
    Own,
    /// Another machine, by id.
    Machine(String),
}

/// A send requested during a macrostep, delivered after it commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendIntent {
    pub target: SendTarget,
    pub event: Event,
}

impl SendIntent {
    /// Resolves the target against the sending machine's id.
    pub fn into_envelope(self, from: &str) -> Envelope {
        let to = match self.target {
            SendTarget::Own => from.to_string(),
            SendTarget::Machine(id) => id,
        };
        Envelope {
            from: from.to_string(),
            to,
            event: self.event,
        }
    }
}

/// An addressed event on its way to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub event: Event,
}

/// What an action may touch while it runs.
///
/// Actions run with the machine lock held. They can read the event, mutate
/// the context, and request sends; the requests are only delivered once the
/// macrostep has committed and the lock is released. No interpreter is
/// reachable from here.
pub struct ActionContext<'a> {
    machine_id: &'a str,
    state: &'a str,
    action: &'a str,
    event: &'a Event,
    context: &'a mut Value,
    outbox: &'a mut Vec<SendIntent>,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        machine_id: &'a str,
        state: &'a str,
        action: &'a str,
        event: &'a Event,
        context: &'a mut Value,
        outbox: &'a mut Vec<SendIntent>,
    ) -> Self {
        Self {
            machine_id,
            state,
            action,
            event,
            context,
            outbox,
        }
    }

    pub fn machine_id(&self) -> &str {
        self.machine_id
    }

    /// Id of the state the action belongs to (the source state for
    /// transition actions).
    pub fn state(&self) -> &str {
        self.state
    }

    /// Name the action was bound under.
    pub fn action(&self) -> &str {
        self.action
    }

    pub fn event(&self) -> &Event {
        self.event
    }

    pub fn context(&self) -> &Value {
        &*self.context
    }

    pub fn context_mut(&mut self) -> &mut Value {
        &mut *self.context
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Sets a top-level context field.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        if !self.context.is_object() {
            *self.context = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut *self.context {
            map.insert(key.into(), value);
        }
    }

    /// Queues an event for this machine, processed as a later external event.
    pub fn request_self_send(&mut self, name: impl Into<String>, data: Value) {
        self.outbox.push(SendIntent {
            target: SendTarget::Own,
            event: Event::new(name, data),
        });
    }

    /// Queues an event for another machine.
    pub fn request_send(&mut self, target: impl Into<String>, name: impl Into<String>, data: Value) {
        self.outbox.push(SendIntent {
            target: SendTarget::Machine(target.into()),
            event: Event::new(name, data),
        });
    }
}
