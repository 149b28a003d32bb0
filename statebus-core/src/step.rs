//! Macrostep execution.
//!
//! A macrostep takes one external event (or the start request) to a settled
//! configuration: one microstep for the event, then eventless transitions and
//! internally raised events until nothing is enabled. The exit and entry sets
//! follow the usual statechart rules: a transition's domain is the innermost
//! compound ancestor containing both source and target, everything active
//! below it is exited innermost-first, and the target path is entered
//! outermost-first.
//!
//! Everything here runs with the machine lock held and never suspends.

use crate::action::{ActionContext, SendIntent};
use crate::chart::{guard_view, Action, Chart, StateIndex, StateKind, Transition};
use crate::error::CoreError;
use crate::event::{self, Event, ERROR_EXECUTION};
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};

/// Mutable machine data guarded by the interpreter lock.
#[derive(Debug, Clone)]
pub(crate) struct MachineState {
    pub configuration: BTreeSet<StateIndex>,
    pub context: Value,
    pub done: bool,
}

impl MachineState {
    pub fn new(context: Value) -> Self {
        Self {
            configuration: BTreeSet::new(),
            context,
            done: false,
        }
    }
}

/// What a successful macrostep leaves for the commit phase.
#[derive(Debug, Default)]
pub(crate) struct StepOutcome {
    pub changed: bool,
    pub outbox: Vec<SendIntent>,
    /// Every state exited during the macrostep, even if re-entered later.
    pub exited: BTreeSet<StateIndex>,
    /// Every state entered during the macrostep, even if exited later.
    pub entered: BTreeSet<StateIndex>,
    pub microsteps: usize,
}

pub(crate) struct Macrostep<'a> {
    chart: &'a Chart,
    machine_id: &'a str,
    state: &'a mut MachineState,
    max_microsteps: usize,
    /// Event visible to guards and actions of the current microstep.
    current: Event,
    internal: VecDeque<Event>,
    outcome: StepOutcome,
}

impl<'a> Macrostep<'a> {
    pub fn new(
        chart: &'a Chart,
        machine_id: &'a str,
        state: &'a mut MachineState,
        max_microsteps: usize,
        trigger: Event,
    ) -> Self {
        Self {
            chart,
            machine_id,
            state,
            max_microsteps,
            current: trigger,
            internal: VecDeque::new(),
            outcome: StepOutcome::default(),
        }
    }

    /// Enters the initial configuration and settles.
    pub fn start(mut self) -> Result<StepOutcome, CoreError> {
        let root = self.chart.root();
        let mut to_enter = BTreeSet::new();
        self.add_descendants(root, &mut to_enter);

        self.count_microstep()?;
        self.outcome.changed = true;
        self.enter_set(to_enter);
        self.settle()?;
        Ok(self.outcome)
    }

    /// Processes the trigger event and settles. A trigger with no enabled
    /// transition leaves everything untouched.
    pub fn run(mut self) -> Result<StepOutcome, CoreError> {
        let name = self.current.name.clone();
        let enabled = self.select(Some(&name));
        if enabled.is_empty() {
            tracing::debug!("[{}] No transition for '{}'", self.machine_id, name);
            return Ok(self.outcome);
        }

        self.microstep(enabled)?;
        self.settle()?;
        Ok(self.outcome)
    }

    /// Eventless transitions first, then one internal event at a time.
    fn settle(&mut self) -> Result<(), CoreError> {
        loop {
            let eventless = self.select(None);
            if !eventless.is_empty() {
                self.microstep(eventless)?;
                continue;
            }

            let Some(event) = self.internal.pop_front() else {
                return Ok(());
            };
            let name = event.name.clone();
            self.current = event;
            let enabled = self.select(Some(&name));
            if enabled.is_empty() {
                if name == ERROR_EXECUTION {
                    return Err(self.unhandled_failure(&self.current));
                }
                continue;
            }
            self.microstep(enabled)?;
        }
    }

    fn count_microstep(&mut self) -> Result<(), CoreError> {
        self.outcome.microsteps += 1;
        if self.outcome.microsteps > self.max_microsteps {
            return Err(CoreError::MicrostepLimit {
                machine: self.machine_id.to_string(),
                limit: self.max_microsteps,
            });
        }
        Ok(())
    }

    fn unhandled_failure(&self, failed: &Event) -> CoreError {
        let field = |name: &str| failed.data[name].as_str().unwrap_or_default().to_string();
        CoreError::ActionFailed {
            machine: self.machine_id.to_string(),
            state: field("state"),
            action: field("action"),
            reason: field("message"),
        }
    }

    /// Enabled transitions for `event` (eventless when `None`).
    ///
    /// Each active leaf, in document order, walks outward until some level
    /// has a candidate whose guard passes. Transitions whose exit sets
    /// overlap an earlier pick are dropped.
    fn select(&self, event: Option<&str>) -> Vec<&'a Transition> {
        let chart = self.chart;
        let mut enabled: Vec<&'a Transition> = Vec::new();

        for &leaf in &self.state.configuration {
            if !chart.node(leaf).is_leaf() {
                continue;
            }
            let levels = std::iter::once(leaf).chain(chart.ancestors(leaf, None));
            'walk: for level in levels {
                let node = chart.node(level);
                let candidates = match event {
                    Some(name) => node.transitions_for(name),
                    None => node.always(),
                };
                for transition in candidates {
                    if self.guard_passes(transition) {
                        if !enabled.iter().any(|t| std::ptr::eq(*t, transition)) {
                            enabled.push(transition);
                        }
                        break 'walk;
                    }
                }
            }
        }

        self.remove_conflicts(enabled)
    }

    fn guard_passes(&self, transition: &Transition) -> bool {
        match &transition.guard {
            None => true,
            Some(guard) => {
                let view = guard_view(
                    self.machine_id,
                    self.chart,
                    transition,
                    &self.current,
                    &self.state.context,
                );
                guard.check(&view)
            }
        }
    }

    fn remove_conflicts(&self, enabled: Vec<&'a Transition>) -> Vec<&'a Transition> {
        let mut kept: Vec<(&'a Transition, BTreeSet<StateIndex>)> = Vec::new();
        for transition in enabled {
            let exits = self.exit_set(transition);
            if kept.iter().any(|(_, other)| !other.is_disjoint(&exits)) {
                tracing::debug!(
                    "[{}] Dropping conflicting transition from '{}'",
                    self.machine_id,
                    self.chart.node(transition.source).id()
                );
                continue;
            }
            kept.push((transition, exits));
        }
        kept.into_iter().map(|(t, _)| t).collect()
    }

    /// The innermost compound ancestor that contains source and target.
    fn domain(&self, transition: &Transition) -> Option<StateIndex> {
        let chart = self.chart;
        let target = transition.target?;
        let source = transition.source;

        if transition.internal
            && chart.node(source).kind() == StateKind::Compound
            && chart.is_descendant(target, source)
        {
            return Some(source);
        }

        chart
            .ancestors(source, None)
            .into_iter()
            .find(|&a| {
                chart.node(a).kind() == StateKind::Compound && chart.is_descendant(target, a)
            })
            .or(Some(chart.root()))
    }

    fn exit_set(&self, transition: &Transition) -> BTreeSet<StateIndex> {
        let Some(domain) = self.domain(transition) else {
            return BTreeSet::new();
        };
        self.state
            .configuration
            .iter()
            .copied()
            .filter(|&s| self.chart.is_descendant(s, domain))
            .collect()
    }

    fn microstep(&mut self, transitions: Vec<&'a Transition>) -> Result<(), CoreError> {
        self.count_microstep()?;
        self.outcome.changed = true;

        tracing::debug!(
            "[{}] Microstep {} on '{}': {} transition(s)",
            self.machine_id,
            self.outcome.microsteps,
            self.current.name,
            transitions.len()
        );

        // Exit, innermost first
        let mut exits = BTreeSet::new();
        for &transition in &transitions {
            exits.extend(self.exit_set(transition));
        }
        for &state in exits.iter().rev() {
            let chart = self.chart;
            self.run_actions(chart.node(state).exit(), state);
            self.state.configuration.remove(&state);
            self.outcome.exited.insert(state);
        }

        for &transition in &transitions {
            self.run_actions(&transition.actions, transition.source);
        }

        let mut to_enter = BTreeSet::new();
        for &transition in &transitions {
            let Some(target) = transition.target else {
                continue;
            };
            self.add_descendants(target, &mut to_enter);
            let domain = self.domain(transition);
            self.add_ancestors(target, domain, &mut to_enter);
        }
        self.enter_set(to_enter);
        Ok(())
    }

    /// Enters states outermost first, raising completion events for finals.
    fn enter_set(&mut self, to_enter: BTreeSet<StateIndex>) {
        let chart = self.chart;
        for state in to_enter {
            if !self.state.configuration.insert(state) {
                continue;
            }
            self.outcome.entered.insert(state);
            self.run_actions(chart.node(state).entry(), state);

            if chart.node(state).kind() == StateKind::Final {
                self.on_final_entered(state);
            }
        }
    }

    fn on_final_entered(&mut self, state: StateIndex) {
        let chart = self.chart;
        let Some(parent) = chart.node(state).parent() else {
            return;
        };
        if parent == chart.root() {
            self.state.done = true;
            tracing::debug!("[{}] Reached top-level final state", self.machine_id);
            return;
        }

        self.raise(event::done_state(chart.node(parent).id()));
        // A completed region can complete every enclosing parallel state
        for ancestor in chart.ancestors(parent, None) {
            let node = chart.node(ancestor);
            if node.kind() != StateKind::Parallel {
                continue;
            }
            if !node.children().iter().all(|&region| self.in_final_state(region)) {
                continue;
            }
            self.raise(event::done_state(node.id()));
            if ancestor == chart.root() {
                self.state.done = true;
            }
        }
    }

    fn in_final_state(&self, state: StateIndex) -> bool {
        let node = self.chart.node(state);
        match node.kind() {
            StateKind::Compound => node.children().iter().any(|c| {
                self.chart.node(*c).kind() == StateKind::Final
                    && self.state.configuration.contains(c)
            }),
            StateKind::Parallel => node.children().iter().all(|&c| self.in_final_state(c)),
            StateKind::Final => self.state.configuration.contains(&state),
            StateKind::Atomic => false,
        }
    }

    fn add_descendants(&self, state: StateIndex, set: &mut BTreeSet<StateIndex>) {
        set.insert(state);
        let node = self.chart.node(state);
        match node.kind() {
            StateKind::Compound => {
                if let Some(initial) = node.initial() {
                    self.add_descendants(initial, set);
                }
            }
            StateKind::Parallel => {
                for &region in node.children() {
                    if !self.covers(set, region) {
                        self.add_descendants(region, set);
                    }
                }
            }
            StateKind::Atomic | StateKind::Final => {}
        }
    }

    fn add_ancestors(&self, state: StateIndex, domain: Option<StateIndex>, set: &mut BTreeSet<StateIndex>) {
        for ancestor in self.chart.ancestors(state, domain) {
            set.insert(ancestor);
            let node = self.chart.node(ancestor);
            if node.kind() == StateKind::Parallel {
                for &region in node.children() {
                    if !self.covers(set, region) {
                        self.add_descendants(region, set);
                    }
                }
            }
        }
    }

    /// Whether `set` already holds `region` or something below it.
    fn covers(&self, set: &BTreeSet<StateIndex>, region: StateIndex) -> bool {
        set.iter()
            .any(|&s| s == region || self.chart.is_descendant(s, region))
    }

    /// Runs one action block. A failure skips the rest of the block and
    /// raises `error.execution`.
    fn run_actions(&mut self, actions: &'a [Action], state: StateIndex) {
        let state_id = self.chart.node(state).id();
        for action in actions {
            let mut ctx = ActionContext::new(
                self.machine_id,
                state_id,
                &action.name,
                &self.current,
                &mut self.state.context,
                &mut self.outcome.outbox,
            );
            let result = (action.func)(&mut ctx);
            if let Err(err) = result {
                tracing::warn!(
                    "[{}] Action '{}' failed in state '{}': {}",
                    self.machine_id,
                    action.name,
                    state_id,
                    err
                );
                self.raise_with(
                    ERROR_EXECUTION.to_string(),
                    json!({
                        "action": action.name,
                        "state": state_id,
                        "message": err.message,
                    }),
                );
                return;
            }
        }
    }

    fn raise(&mut self, name: String) {
        self.raise_with(name, Value::Null);
    }

    fn raise_with(&mut self, name: String, data: Value) {
        tracing::debug!("[{}] Raising internal event '{}'", self.machine_id, name);
        self.internal.push_back(Event::internal(name, data));
    }
}
