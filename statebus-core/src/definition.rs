//! Chart definition types.
//!
//! Charts use a JSON DSL in the XState style:
//!
//! ```json
//! {
//!   "id": "job",
//!   "initial": "idle",
//!   "context": {"count": 0},
//!   "states": {
//!     "idle": {"on": {"START": {"target": "running", "actions": "increment"}}},
//!     "running": {
//!       "invoke": {"src": "fetch", "onDone": "done", "onError": "failed"},
//!       "always": [{"target": "done", "guard": "ctx.count >= 3"}],
//!       "onError": "failed"
//!     },
//!     "failed": {},
//!     "done": {"type": "final"}
//!   }
//! }
//! ```
//!
//! These types are the raw, unvalidated form. [`crate::Chart::compile`]
//! validates them and resolves every name against a binding table.

use crate::error::CoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Atomic,
    Compound,
    Parallel,
    Final,
}

/// Raw state node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDefinition {
    /// Explicit kind; inferred from `states` when absent.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateType>,

    /// Initial child key for compound states (defaults to the first child).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(
        default,
        deserialize_with = "string_or_seq",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub entry: Vec<String>,

    #[serde(
        default,
        deserialize_with = "string_or_seq",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub exit: Vec<String>,

    /// Event name -> candidate transitions, in declaration order.
    #[serde(
        default,
        deserialize_with = "ordered_map",
        serialize_with = "serialize_ordered",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub on: Vec<(String, TransitionsDefinition)>,

    /// Eventless transitions, checked after every microstep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always: Option<TransitionsDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke: Option<InvokeDefinition>,

    /// Taken when an action fails while this state (or a descendant) is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<TransitionsDefinition>,

    /// Taken when this compound/parallel state reaches its final state(s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_done: Option<TransitionsDefinition>,

    /// Child states, in declaration order.
    #[serde(
        default,
        deserialize_with = "ordered_map",
        serialize_with = "serialize_ordered",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub states: Vec<(String, StateDefinition)>,
}

/// Transition shorthand: a bare target, one transition, or several.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionsDefinition {
    Target(String),
    Single(TransitionDefinition),
    Many(Vec<TransitionDefinition>),
}

impl TransitionsDefinition {
    /// Expands the shorthand into an ordered list.
    pub fn to_vec(&self) -> Vec<TransitionDefinition> {
        match self {
            TransitionsDefinition::Target(target) => vec![TransitionDefinition {
                target: Some(target.clone()),
                ..Default::default()
            }],
            TransitionsDefinition::Single(t) => vec![t.clone()],
            TransitionsDefinition::Many(ts) => ts.clone(),
        }
    }
}

/// A single raw transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDefinition {
    /// Target state; absent for targetless (actions-only) transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Named guard or guard expression.
    #[serde(default, alias = "cond", skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(
        default,
        deserialize_with = "string_or_seq",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub actions: Vec<String>,

    /// Internal transitions do not exit the source when the target is a descendant.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
}

/// Raw invoked-service descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeDefinition {
    /// Invocation id used in `done.invoke.<id>`; defaults to the state id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Service name in the binding table.
    pub src: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_done: Option<TransitionsDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<TransitionsDefinition>,
}

/// Raw chart: a root state plus machine-level data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDefinition {
    /// Machine id; also the id of the root state.
    pub id: String,

    /// Initial context. Must be an object (or absent).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,

    #[serde(flatten)]
    pub root: StateDefinition,
}

impl ChartDefinition {
    /// Parses a chart definition from JSON.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(json.clone())?)
    }

    /// Parses a chart definition from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Returns the definition as JSON.
    pub fn to_json(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(self)?)
    }

    /// CRC32C of the canonical JSON encoding.
    pub fn checksum(&self) -> Result<String, CoreError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:08x}", crc32c::crc32c(&bytes)))
    }
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrSeq;

    impl<'de> Visitor<'de> for StringOrSeq {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut names = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                names.push(s);
            }
            Ok(names)
        }
    }

    deserializer.deserialize_any(StringOrSeq)
}

/// Deserializes a JSON object into key/value pairs, keeping document order
/// and rejecting duplicate keys.
fn ordered_map<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    use serde::de::{self, MapAccess, Visitor};
    use std::fmt;
    use std::marker::PhantomData;

    struct OrderedMap<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMap<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an object")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries: Vec<(String, V)> = Vec::new();
            while let Some((key, value)) = map.next_entry::<String, V>()? {
                if entries.iter().any(|(k, _)| *k == key) {
                    return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                }
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedMap(PhantomData))
}

fn serialize_ordered<S, V>(entries: &[(String, V)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    V: Serialize,
{
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> Value {
        json!({
            "id": "job",
            "initial": "idle",
            "context": {"count": 0},
            "states": {
                "idle": {
                    "entry": "logIdle",
                    "on": {
                        "START": {"target": "running", "actions": ["increment", "log"]},
                        "RESET": "idle"
                    }
                },
                "running": {
                    "invoke": {"id": "fetch", "src": "fetchData", "onDone": "done", "onError": "failed"},
                    "always": [{"target": "done", "cond": "ctx.count >= 3"}],
                    "onError": "failed"
                },
                "failed": {},
                "done": {"type": "final"}
            }
        })
    }

    #[test]
    fn test_parse_definition() {
        let def = ChartDefinition::from_json(&sample_definition()).unwrap();

        assert_eq!(def.id, "job");
        assert_eq!(def.root.initial.as_deref(), Some("idle"));
        assert_eq!(def.context, json!({"count": 0}));

        let keys: Vec<&str> = def.root.states.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["idle", "running", "failed", "done"]);
    }

    #[test]
    fn test_transition_shorthands() {
        let def = ChartDefinition::from_json(&sample_definition()).unwrap();
        let (_, idle) = &def.root.states[0];

        assert_eq!(idle.entry, vec!["logIdle".to_string()]);
        let (event, start) = &idle.on[0];
        assert_eq!(event, "START");
        let start = start.to_vec();
        assert_eq!(start[0].target.as_deref(), Some("running"));
        assert_eq!(start[0].actions, vec!["increment", "log"]);

        let (_, reset) = &idle.on[1];
        assert_eq!(reset.to_vec()[0].target.as_deref(), Some("idle"));

        let (_, running) = &def.root.states[1];
        let always = running.always.as_ref().unwrap().to_vec();
        assert_eq!(always[0].guard.as_deref(), Some("ctx.count >= 3"));
        assert_eq!(running.invoke.as_ref().unwrap().src, "fetchData");
        assert!(running.on_error.is_some());
    }

    #[test]
    fn test_state_type() {
        let def = ChartDefinition::from_json(&sample_definition()).unwrap();
        let (_, done) = &def.root.states[3];
        assert_eq!(done.kind, Some(StateType::Final));
    }

    #[test]
    fn test_duplicate_state_key_rejected() {
        let raw = r#"{"id": "m", "states": {"a": {}, "a": {}}}"#;
        let result = ChartDefinition::from_json_str(raw);
        assert!(matches!(result, Err(CoreError::Json(_))));
    }

    #[test]
    fn test_checksum_stable() {
        let a = ChartDefinition::from_json(&sample_definition()).unwrap();
        let b = ChartDefinition::from_json(&sample_definition()).unwrap();
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());

        let c = ChartDefinition::from_json(&json!({"id": "other", "states": {"a": {}}})).unwrap();
        assert_ne!(a.checksum().unwrap(), c.checksum().unwrap());
    }

    #[test]
    fn test_json_roundtrip_keeps_order() {
        let def = ChartDefinition::from_json(&sample_definition()).unwrap();
        let json = def.to_json().unwrap();
        let reparsed = ChartDefinition::from_json(&json).unwrap();
        let keys: Vec<&str> = reparsed.root.states.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["idle", "running", "failed", "done"]);
    }
}
