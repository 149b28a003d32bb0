//! Compiled, immutable state tree.
//!
//! [`Chart::compile`] validates a [`ChartDefinition`] and resolves every
//! target, guard, action and service name once. Nodes live in an arena in
//! document order, so a [`StateIndex`] comparison is a document-order
//! comparison and parents are plain indices.

use crate::binding::{ActionFn, Bindings, GuardContext, GuardFn, ServiceFn};
use crate::definition::{
    ChartDefinition, InvokeDefinition, StateDefinition, StateType, TransitionsDefinition,
};
use crate::error::{BindingKind, CoreError};
use crate::event::{self, Event, ERROR_EXECUTION};
use crate::guard::GuardExpr;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Position of a node in the chart arena. Ordered by document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateIndex(usize);

impl StateIndex {
    pub const ROOT: StateIndex = StateIndex(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
}

/// A resolved action.
#[derive(Clone)]
pub struct Action {
    pub name: String,
    pub(crate) func: ActionFn,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A resolved guard: either a bound closure or a parsed expression.
#[derive(Clone)]
pub enum Guard {
    Named { name: String, func: GuardFn },
    Expr { source: String, expr: GuardExpr },
}

impl Guard {
    pub fn source(&self) -> &str {
        match self {
            Guard::Named { name, .. } => name,
            Guard::Expr { source, .. } => source,
        }
    }

    /// Evaluates the guard. Errors from bound guards count as false.
    pub(crate) fn check(&self, view: &GuardContext<'_>) -> bool {
        match self {
            Guard::Expr { expr, .. } => expr.evaluate(view.context, &view.event.data),
            Guard::Named { name, func } => match func(view) {
                Ok(pass) => pass,
                Err(err) => {
                    tracing::warn!(
                        "[{}] Guard '{}' on state '{}' failed, treating as false: {}",
                        view.machine_id,
                        name,
                        view.state,
                        err
                    );
                    false
                }
            },
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

/// A resolved transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub source: StateIndex,
    /// Absent for targetless transitions.
    pub target: Option<StateIndex>,
    pub guard: Option<Guard>,
    pub actions: Vec<Action>,
    pub internal: bool,
}

/// A resolved invoked service.
#[derive(Clone)]
pub struct Invoke {
    pub id: String,
    pub src: String,
    pub(crate) service: ServiceFn,
}

impl fmt::Debug for Invoke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoke")
            .field("id", &self.id)
            .field("src", &self.src)
            .finish()
    }
}

#[derive(Debug)]
pub struct StateNode {
    id: String,
    key: String,
    kind: StateKind,
    parent: Option<StateIndex>,
    children: Vec<StateIndex>,
    initial: Option<StateIndex>,
    depth: usize,
    entry: Vec<Action>,
    exit: Vec<Action>,
    transitions: HashMap<String, Vec<Transition>>,
    always: Vec<Transition>,
    invoke: Option<Invoke>,
}

impl StateNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn parent(&self) -> Option<StateIndex> {
        self.parent
    }

    pub fn children(&self) -> &[StateIndex] {
        &self.children
    }

    pub fn initial(&self) -> Option<StateIndex> {
        self.initial
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn entry(&self) -> &[Action] {
        &self.entry
    }

    pub fn exit(&self) -> &[Action] {
        &self.exit
    }

    /// Candidates for `event`, in declaration order.
    pub fn transitions_for(&self, event: &str) -> &[Transition] {
        self.transitions.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn always(&self) -> &[Transition] {
        &self.always
    }

    pub fn invoke(&self) -> Option<&Invoke> {
        self.invoke.as_ref()
    }

    /// Atomic and final states are leaves of the configuration.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    /// Events this state has candidates for.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.transitions.keys().map(String::as_str)
    }
}

/// A compiled chart.
#[derive(Debug)]
pub struct Chart {
    id: String,
    nodes: Vec<StateNode>,
    by_id: HashMap<String, StateIndex>,
    context: Value,
    checksum: String,
    definition: ChartDefinition,
}

impl Chart {
    /// Validates `definition` and resolves its names against `bindings`.
    pub fn compile(definition: ChartDefinition, bindings: &Bindings) -> Result<Arc<Chart>, CoreError> {
        let context = match &definition.context {
            Value::Null => Value::Object(Map::new()),
            Value::Object(_) => definition.context.clone(),
            other => {
                return Err(invalid(format!(
                    "context must be an object, got {}",
                    type_name(other)
                )))
            }
        };
        if definition.id.is_empty() {
            return Err(invalid("chart id must not be empty"));
        }
        if definition.root.states.is_empty() {
            return Err(invalid(format!("chart '{}' has no states", definition.id)));
        }

        let mut builder = Builder {
            chart_id: &definition.id,
            nodes: Vec::new(),
            raw: Vec::new(),
            by_id: HashMap::new(),
        };
        builder.add_node(&definition.root, &definition.id, None)?;
        builder.resolve_initials()?;
        builder.resolve_behaviour(bindings)?;

        let Builder { nodes, by_id, .. } = builder;
        let checksum = definition.checksum()?;

        tracing::debug!(
            "Compiled chart '{}' ({} states, checksum {})",
            definition.id,
            nodes.len(),
            checksum
        );

        Ok(Arc::new(Chart {
            id: definition.id.clone(),
            nodes,
            by_id,
            context,
            checksum,
            definition,
        }))
    }

    /// Parses and compiles a JSON chart.
    pub fn from_json(json: &Value, bindings: &Bindings) -> Result<Arc<Chart>, CoreError> {
        Self::compile(ChartDefinition::from_json(json)?, bindings)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> StateIndex {
        StateIndex::ROOT
    }

    pub fn node(&self, index: StateIndex) -> &StateNode {
        &self.nodes[index.0]
    }

    pub fn find(&self, id: &str) -> Option<StateIndex> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All states in document order.
    pub fn states(&self) -> impl Iterator<Item = (StateIndex, &StateNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (StateIndex(i), n))
    }

    /// Initial context handed to every new interpreter.
    pub fn initial_context(&self) -> &Value {
        &self.context
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn definition(&self) -> &ChartDefinition {
        &self.definition
    }

    pub fn has_services(&self) -> bool {
        self.nodes.iter().any(|n| n.invoke.is_some())
    }

    /// Whether `state` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, state: StateIndex, ancestor: StateIndex) -> bool {
        let mut current = self.node(state).parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.node(p).parent;
        }
        false
    }

    /// Proper ancestors of `state`, innermost first, stopping before `until`.
    pub fn ancestors(&self, state: StateIndex, until: Option<StateIndex>) -> Vec<StateIndex> {
        let mut out = Vec::new();
        let mut current = self.node(state).parent;
        while let Some(p) = current {
            if Some(p) == until {
                break;
            }
            out.push(p);
            current = self.node(p).parent;
        }
        out
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidDefinition {
        reason: reason.into(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct Builder<'d> {
    chart_id: &'d str,
    nodes: Vec<StateNode>,
    raw: Vec<&'d StateDefinition>,
    by_id: HashMap<String, StateIndex>,
}

impl<'d> Builder<'d> {
    /// First pass: lay out the arena in document order and check shapes.
    fn add_node(
        &mut self,
        def: &'d StateDefinition,
        key: &str,
        parent: Option<StateIndex>,
    ) -> Result<StateIndex, CoreError> {
        let index = StateIndex(self.nodes.len());
        let (id, depth) = match parent {
            None => (self.chart_id.to_string(), 0),
            Some(p) if p == StateIndex::ROOT => (key.to_string(), 1),
            Some(p) => {
                let parent = &self.nodes[p.0];
                (format!("{}.{}", parent.id, key), parent.depth + 1)
            }
        };
        if parent.is_some() && (key.is_empty() || key.contains('.') || key.starts_with('#')) {
            return Err(invalid(format!("invalid state key '{}'", key)));
        }

        let kind = match def.kind {
            Some(StateType::Atomic) => StateKind::Atomic,
            Some(StateType::Compound) => StateKind::Compound,
            Some(StateType::Parallel) => StateKind::Parallel,
            Some(StateType::Final) => StateKind::Final,
            None if def.states.is_empty() => StateKind::Atomic,
            None => StateKind::Compound,
        };
        match kind {
            StateKind::Atomic if !def.states.is_empty() => {
                return Err(invalid(format!("atomic state '{}' has children", id)));
            }
            StateKind::Compound if def.states.is_empty() => {
                return Err(invalid(format!("compound state '{}' has no children", id)));
            }
            StateKind::Parallel if def.states.is_empty() => {
                return Err(invalid(format!("parallel state '{}' has no regions", id)));
            }
            StateKind::Final => {
                if !def.states.is_empty() {
                    return Err(invalid(format!("final state '{}' has children", id)));
                }
                if !def.on.is_empty() || def.always.is_some() || def.on_done.is_some() {
                    return Err(invalid(format!("final state '{}' has transitions", id)));
                }
            }
            _ => {}
        }
        if parent.is_none() && matches!(kind, StateKind::Atomic | StateKind::Final) {
            return Err(invalid("the root state must be compound or parallel"));
        }
        if def.initial.is_some() && kind != StateKind::Compound {
            return Err(invalid(format!(
                "state '{}' declares an initial state but is not compound",
                id
            )));
        }
        if self.by_id.contains_key(&id) {
            return Err(invalid(format!("duplicate state id '{}'", id)));
        }

        self.by_id.insert(id.clone(), index);
        self.nodes.push(StateNode {
            id,
            key: key.to_string(),
            kind,
            parent,
            children: Vec::new(),
            initial: None,
            depth,
            entry: Vec::new(),
            exit: Vec::new(),
            transitions: HashMap::new(),
            always: Vec::new(),
            invoke: None,
        });
        self.raw.push(def);

        for (child_key, child_def) in &def.states {
            let child = self.add_node(child_def, child_key, Some(index))?;
            self.nodes[index.0].children.push(child);
        }
        Ok(index)
    }

    fn resolve_initials(&mut self) -> Result<(), CoreError> {
        for i in 0..self.nodes.len() {
            if self.nodes[i].kind != StateKind::Compound {
                continue;
            }
            let initial = match &self.raw[i].initial {
                None => self.nodes[i].children[0],
                Some(key) => self.nodes[i]
                    .children
                    .iter()
                    .copied()
                    .find(|c| self.nodes[c.0].key == *key)
                    .ok_or_else(|| {
                        invalid(format!(
                            "initial state '{}' is not a child of '{}'",
                            key, self.nodes[i].id
                        ))
                    })?,
            };
            self.nodes[i].initial = Some(initial);
        }
        Ok(())
    }

    /// Second pass: actions, transitions, guards, services.
    fn resolve_behaviour(&mut self, bindings: &Bindings) -> Result<(), CoreError> {
        for i in 0..self.nodes.len() {
            let source = StateIndex(i);
            let def = self.raw[i];

            let entry = self.actions(&def.entry, source, bindings)?;
            let exit = self.actions(&def.exit, source, bindings)?;

            let mut table: Vec<(String, Vec<Transition>)> = Vec::new();
            for (event, transitions) in &def.on {
                if event.is_empty() {
                    return Err(invalid(format!(
                        "state '{}' has a transition for an empty event name",
                        self.nodes[i].id
                    )));
                }
                let resolved = self.transitions(transitions, source, bindings)?;
                push_candidates(&mut table, event.clone(), resolved);
            }
            if let Some(on_error) = &def.on_error {
                let resolved = self.transitions(on_error, source, bindings)?;
                push_candidates(&mut table, ERROR_EXECUTION.to_string(), resolved);
            }
            if let Some(on_done) = &def.on_done {
                if self.nodes[i].kind == StateKind::Atomic {
                    return Err(invalid(format!(
                        "atomic state '{}' declares onDone",
                        self.nodes[i].id
                    )));
                }
                let resolved = self.transitions(on_done, source, bindings)?;
                push_candidates(&mut table, event::done_state(&self.nodes[i].id), resolved);
            }

            let always = match &def.always {
                Some(always) => self.transitions(always, source, bindings)?,
                None => Vec::new(),
            };

            let invoke = match &def.invoke {
                Some(invoke) => Some(self.invoke(invoke, source, bindings, &mut table)?),
                None => None,
            };

            let node = &mut self.nodes[i];
            node.entry = entry;
            node.exit = exit;
            node.transitions = table.into_iter().collect();
            node.always = always;
            node.invoke = invoke;
        }
        Ok(())
    }

    fn invoke(
        &self,
        def: &InvokeDefinition,
        source: StateIndex,
        bindings: &Bindings,
        table: &mut Vec<(String, Vec<Transition>)>,
    ) -> Result<Invoke, CoreError> {
        let state_id = &self.nodes[source.0].id;
        let service = bindings
            .get_service(&def.src)
            .cloned()
            .ok_or_else(|| CoreError::UnresolvedBinding {
                kind: BindingKind::Service,
                name: def.src.clone(),
                state: state_id.clone(),
            })?;
        let id = def.id.clone().unwrap_or_else(|| state_id.clone());

        if let Some(on_done) = &def.on_done {
            let resolved = self.transitions(on_done, source, bindings)?;
            push_candidates(table, event::done_invoke(&id), resolved);
        }
        if let Some(on_error) = &def.on_error {
            let resolved = self.transitions(on_error, source, bindings)?;
            push_candidates(table, event::error_platform(&id), resolved);
        }

        Ok(Invoke {
            id,
            src: def.src.clone(),
            service,
        })
    }

    fn transitions(
        &self,
        def: &TransitionsDefinition,
        source: StateIndex,
        bindings: &Bindings,
    ) -> Result<Vec<Transition>, CoreError> {
        def.to_vec()
            .into_iter()
            .map(|t| {
                let target = match &t.target {
                    Some(target) => Some(self.resolve_target(target, source)?),
                    None => None,
                };
                let guard = match &t.guard {
                    Some(guard) => Some(self.guard(guard, source, bindings)?),
                    None => None,
                };
                Ok(Transition {
                    source,
                    target,
                    guard,
                    actions: self.actions(&t.actions, source, bindings)?,
                    internal: t.internal,
                })
            })
            .collect()
    }

    /// `#id` first, then `.child`, sibling key, absolute path.
    fn resolve_target(&self, target: &str, source: StateIndex) -> Result<StateIndex, CoreError> {
        let node = &self.nodes[source.0];
        let found = if let Some(absolute) = target.strip_prefix('#') {
            if absolute == self.chart_id {
                Some(StateIndex::ROOT)
            } else {
                let path = absolute
                    .strip_prefix(self.chart_id)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .unwrap_or(absolute);
                self.by_id.get(path).copied()
            }
        } else if let Some(child) = target.strip_prefix('.') {
            self.by_id.get(&self.join(source, child)).copied()
        } else {
            node.parent
                .and_then(|p| self.by_id.get(&self.join(p, target)).copied())
                .or_else(|| self.by_id.get(target).copied())
        };

        found.ok_or_else(|| {
            invalid(format!(
                "unknown target '{}' in transition from '{}'",
                target, node.id
            ))
        })
    }

    fn join(&self, base: StateIndex, path: &str) -> String {
        if base == StateIndex::ROOT {
            path.to_string()
        } else {
            format!("{}.{}", self.nodes[base.0].id, path)
        }
    }

    fn guard(&self, source_text: &str, source: StateIndex, bindings: &Bindings) -> Result<Guard, CoreError> {
        if let Some(func) = bindings.get_guard(source_text) {
            return Ok(Guard::Named {
                name: source_text.to_string(),
                func: func.clone(),
            });
        }
        if GuardExpr::is_expression(source_text) {
            return Ok(Guard::Expr {
                source: source_text.to_string(),
                expr: GuardExpr::parse(source_text)?,
            });
        }
        Err(CoreError::UnresolvedBinding {
            kind: BindingKind::Guard,
            name: source_text.to_string(),
            state: self.nodes[source.0].id.clone(),
        })
    }

    fn actions(&self, names: &[String], source: StateIndex, bindings: &Bindings) -> Result<Vec<Action>, CoreError> {
        names
            .iter()
            .map(|name| {
                bindings
                    .get_action(name)
                    .map(|func| Action {
                        name: name.clone(),
                        func: func.clone(),
                    })
                    .ok_or_else(|| CoreError::UnresolvedBinding {
                        kind: BindingKind::Action,
                        name: name.clone(),
                        state: self.nodes[source.0].id.clone(),
                    })
            })
            .collect()
    }
}

/// Appends candidates, merging with an existing entry for the same event.
fn push_candidates(table: &mut Vec<(String, Vec<Transition>)>, event: String, resolved: Vec<Transition>) {
    match table.iter_mut().find(|(name, _)| *name == event) {
        Some((_, existing)) => existing.extend(resolved),
        None => table.push((event, resolved)),
    }
}

/// Evaluation view for a transition's guard.
pub(crate) fn guard_view<'a>(
    machine_id: &'a str,
    chart: &'a Chart,
    transition: &Transition,
    event: &'a Event,
    context: &'a Value,
) -> GuardContext<'a> {
    GuardContext {
        machine_id,
        state: chart.node(transition.source).id(),
        event,
        context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ServiceError;
    use serde_json::json;

    fn bindings() -> Bindings {
        Bindings::new()
            .action("log", |_| Ok(()))
            .guard("isReady", |g| Ok(g.context["ready"] == json!(true)))
            .service("fetch", |_| async { Ok::<_, ServiceError>(Value::Null) })
    }

    fn nested() -> Value {
        json!({
            "id": "app",
            "initial": "main",
            "states": {
                "main": {
                    "initial": "editing",
                    "states": {
                        "editing": {"on": {"SAVE": "saving", "FOCUS": ".field"}, "states": {"field": {}}},
                        "saving": {
                            "invoke": {"src": "fetch", "onDone": "editing", "onError": "#app.failed"},
                            "on": {"CANCEL": {"target": "editing", "guard": "isReady", "actions": "log"}}
                        }
                    }
                },
                "failed": {"type": "final"}
            }
        })
    }

    #[test]
    fn test_ids_and_document_order() {
        let chart = Chart::from_json(&nested(), &bindings()).unwrap();
        let ids: Vec<&str> = chart.states().map(|(_, n)| n.id()).collect();
        assert_eq!(
            ids,
            vec!["app", "main", "main.editing", "main.editing.field", "main.saving", "failed"]
        );

        let editing = chart.find("main.editing").unwrap();
        assert_eq!(chart.node(editing).kind(), StateKind::Compound);
        assert_eq!(chart.node(editing).initial(), chart.find("main.editing.field"));
        assert_eq!(chart.node(editing).depth(), 2);
        assert!(chart.is_descendant(editing, chart.root()));
        assert!(!chart.is_descendant(chart.root(), editing));
    }

    #[test]
    fn test_target_resolution() {
        let chart = Chart::from_json(&nested(), &bindings()).unwrap();
        let editing = chart.find("main.editing").unwrap();
        let saving = chart.find("main.saving").unwrap();

        // sibling
        let save = &chart.node(editing).transitions_for("SAVE")[0];
        assert_eq!(save.target, Some(saving));
        // .child
        let focus = &chart.node(editing).transitions_for("FOCUS")[0];
        assert_eq!(focus.target, chart.find("main.editing.field"));
        // invoke handlers keyed by the default invoke id, #absolute target
        let node = chart.node(saving);
        assert_eq!(node.invoke().unwrap().id, "main.saving");
        let done = &node.transitions_for("done.invoke.main.saving")[0];
        assert_eq!(done.target, Some(editing));
        let failed = &node.transitions_for("error.platform.main.saving")[0];
        assert_eq!(failed.target, chart.find("failed"));

        let cancel = &node.transitions_for("CANCEL")[0];
        assert_eq!(cancel.guard.as_ref().unwrap().source(), "isReady");
        assert_eq!(cancel.actions[0].name, "log");
    }

    #[test]
    fn test_guard_expression_fallback() {
        let def = json!({
            "id": "m",
            "states": {
                "a": {"on": {"GO": {"target": "b", "guard": "ctx.count > 1"}}},
                "b": {}
            }
        });
        let chart = Chart::from_json(&def, &Bindings::new()).unwrap();
        let a = chart.find("a").unwrap();
        let go = &chart.node(a).transitions_for("GO")[0];
        assert!(matches!(go.guard, Some(Guard::Expr { .. })));
    }

    #[test]
    fn test_on_error_and_on_done_tables() {
        let def = json!({
            "id": "m",
            "states": {
                "work": {
                    "onError": "broken",
                    "onDone": "finished",
                    "states": {"step": {"on": {"NEXT": "end"}}, "end": {"type": "final"}}
                },
                "broken": {},
                "finished": {"type": "final"}
            }
        });
        let chart = Chart::from_json(&def, &Bindings::new()).unwrap();
        let work = chart.node(chart.find("work").unwrap());
        assert_eq!(work.transitions_for(ERROR_EXECUTION).len(), 1);
        assert_eq!(work.transitions_for("done.state.work").len(), 1);
        assert_eq!(chart.initial_context(), &json!({}));
    }

    #[test]
    fn test_unresolved_names() {
        let def = json!({"id": "m", "states": {"a": {"entry": "missing"}}});
        let err = Chart::from_json(&def, &Bindings::new()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnresolvedBinding { kind: BindingKind::Action, ref name, ref state }
                if name == "missing" && state == "a"
        ));

        let def = json!({"id": "m", "states": {"a": {"on": {"GO": {"target": "a", "guard": "isReady"}}}}});
        let err = Chart::from_json(&def, &Bindings::new()).unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedBinding { kind: BindingKind::Guard, .. }));

        let def = json!({"id": "m", "states": {"a": {"invoke": {"src": "nope"}}}});
        let err = Chart::from_json(&def, &Bindings::new()).unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedBinding { kind: BindingKind::Service, .. }));
    }

    #[test]
    fn test_invalid_definitions() {
        let cases = [
            json!({"id": "m", "states": {}}),
            json!({"id": "m", "context": [1], "states": {"a": {}}}),
            json!({"id": "m", "states": {"a": {"on": {"GO": "nowhere"}}}}),
            json!({"id": "m", "initial": "zzz", "states": {"a": {}}}),
            json!({"id": "m", "states": {"p": {"type": "parallel"}}}),
            json!({"id": "m", "states": {"c": {"type": "compound"}}}),
            json!({"id": "m", "states": {"f": {"type": "final", "states": {"x": {}}}}}),
            json!({"id": "m", "states": {"f": {"type": "final", "on": {"GO": "f"}}}}),
            json!({"id": "m", "states": {"a": {"type": "atomic", "states": {"x": {}}}}}),
            json!({"id": "m", "states": {"a.b": {}}}),
            json!({"id": "m", "states": {"a": {"initial": "x"}}}),
            json!({"id": "m", "states": {"a": {"on": {"GO": {"target": "a", "guard": "ctx.a >"}}}}}),
        ];
        for def in cases {
            let err = Chart::from_json(&def, &bindings()).unwrap_err();
            assert!(err.is_configuration_error(), "{} -> {}", def, err);
        }
    }

    #[test]
    fn test_checksum_matches_definition() {
        let def = ChartDefinition::from_json(&nested()).unwrap();
        let expected = def.checksum().unwrap();
        let chart = Chart::compile(def, &bindings()).unwrap();
        assert_eq!(chart.checksum(), expected);
        assert!(chart.has_services());
    }
}
