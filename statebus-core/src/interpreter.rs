//! Single-machine interpreter.
//!
//! One exclusive lock guards the configuration and context. A send runs the
//! whole macrostep under that lock and then, with the lock released,
//! notifies state-change subscribers and hands the outbox to the sink. An
//! action can therefore never re-enter its own machine: it has no handle to
//! it, and anything it asks to send is delivered only after the lock is gone.

use crate::action::Envelope;
use crate::binding::{ServiceContext, ServiceError};
use crate::chart::{Chart, Invoke, StateIndex};
use crate::error::CoreError;
use crate::event::{self, Event, EventOrigin, InvocationId, INIT_EVENT};
use crate::sink::{EventSink, UnroutedSink};
use crate::snapshot::{DisposeOutcome, Lifecycle, MachineSnapshot, StateChange};
use crate::step::{Macrostep, MachineState, StepOutcome};
use parking_lot::Mutex;
use serde_json::{json, Value};
use statebus_dispatch::{Priority, PriorityHandler, SubscriptionId};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Default bound on microsteps per macrostep.
pub const DEFAULT_MAX_MICROSTEPS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterOptions {
    /// A macrostep taking more microsteps than this fails with
    /// [`CoreError::MicrostepLimit`].
    pub max_microsteps: usize,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
        }
    }
}

/// A running invocation.
struct ServiceHandle {
    state: StateIndex,
    invoke_id: String,
    cancel: watch::Sender<bool>,
}

/// Executes one chart for one machine.
pub struct Interpreter {
    machine_id: String,
    chart: Arc<Chart>,
    options: InterpreterOptions,
    /// The transition lock.
    state: Mutex<MachineState>,
    lifecycle: AtomicU8,
    /// Kept outside the transition lock so dispose can cancel without it.
    services: Mutex<HashMap<InvocationId, ServiceHandle>>,
    sink: Arc<dyn EventSink>,
    listeners: PriorityHandler<StateChange>,
    runtime: Option<Handle>,
}

impl Interpreter {
    /// Creates an interpreter in the `Constructed` state.
    ///
    /// Picks up the current tokio runtime, if any, for invoked services.
    pub fn new(machine_id: impl Into<String>, chart: Arc<Chart>) -> Self {
        let context = chart.initial_context().clone();
        Self {
            machine_id: machine_id.into(),
            chart,
            options: InterpreterOptions::default(),
            state: Mutex::new(MachineState::new(context)),
            lifecycle: AtomicU8::new(Lifecycle::Constructed.as_u8()),
            services: Mutex::new(HashMap::new()),
            sink: Arc::new(UnroutedSink),
            listeners: PriorityHandler::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_options(mut self, options: InterpreterOptions) -> Self {
        self.options = options;
        self
    }

    /// Runtime used to drive invoked services.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn chart(&self) -> &Arc<Chart> {
        &self.chart
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle() == Lifecycle::Disposed
    }

    /// Enters the initial configuration.
    pub fn start(&self) -> Result<MachineSnapshot, CoreError> {
        if self.runtime.is_none() {
            if let Some(invoke) = self.chart.states().find_map(|(_, n)| n.invoke()) {
                return Err(CoreError::NoRuntime {
                    service: invoke.src.clone(),
                });
            }
        }

        let mut state = self.state.lock();
        if let Err(current) = self.lifecycle.compare_exchange(
            Lifecycle::Constructed.as_u8(),
            Lifecycle::Started.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(match Lifecycle::from_u8(current) {
                Lifecycle::Disposed => self.disposed(),
                _ => CoreError::AlreadyStarted {
                    machine: self.machine_id.clone(),
                },
            });
        }

        let trigger = Event::internal(INIT_EVENT, Value::Null);
        let step = Macrostep::new(
            &self.chart,
            &self.machine_id,
            &mut state,
            self.options.max_microsteps,
            trigger.clone(),
        );
        let outcome = match step.start() {
            Ok(outcome) => outcome,
            Err(err) => {
                *state = MachineState::new(self.chart.initial_context().clone());
                let _ = self.lifecycle.compare_exchange(
                    Lifecycle::Started.as_u8(),
                    Lifecycle::Constructed.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                tracing::warn!("[{}] Start failed: {}", self.machine_id, err);
                return Err(err);
            }
        };

        tracing::info!(
            "[{}] Started chart '{}' in {}",
            self.machine_id,
            self.chart.id(),
            crate::snapshot::state_value(&self.chart, &state.configuration, self.chart.root())
        );
        Ok(self.commit(state, trigger, outcome))
    }

    /// Starts on a blocking thread.
    pub async fn start_async(self: &Arc<Self>) -> Result<MachineSnapshot, CoreError> {
        let this = Arc::clone(self);
        self.blocking(move || this.start()).await
    }

    /// Sends an external event and waits for the full macrostep.
    pub fn send(&self, name: impl Into<String>, data: Value) -> Result<MachineSnapshot, CoreError> {
        self.send_event(Event::new(name, data))
    }

    /// Sends on a blocking thread.
    pub async fn send_async(
        self: &Arc<Self>,
        name: impl Into<String>,
        data: Value,
    ) -> Result<MachineSnapshot, CoreError> {
        let this = Arc::clone(self);
        let event = Event::new(name, data);
        self.blocking(move || this.send_event(event)).await
    }

    /// Processes one event.
    ///
    /// Blocks while another macrostep of this machine holds the lock. An
    /// event that enables nothing is a no-op and returns a snapshot with
    /// `changed == false`.
    pub fn send_event(&self, event: Event) -> Result<MachineSnapshot, CoreError> {
        self.check_running()?;
        let mut state = self.state.lock();
        // Disposal may have happened while waiting for the lock
        self.check_running()?;

        let invocation = match event.origin {
            EventOrigin::Invocation(id) => Some(id),
            _ => None,
        };
        if let Some(id) = invocation {
            if !self.services.lock().contains_key(&id) {
                tracing::debug!(
                    "[{}] Discarding '{}' from finished or cancelled invocation {}",
                    self.machine_id,
                    event.name,
                    id
                );
                return Ok(self.capture(&state, false));
            }
        }
        if state.done {
            tracing::debug!(
                "[{}] Ignoring '{}': machine is done",
                self.machine_id,
                event.name
            );
            return Ok(self.capture(&state, false));
        }

        let checkpoint = state.clone();
        let step = Macrostep::new(
            &self.chart,
            &self.machine_id,
            &mut state,
            self.options.max_microsteps,
            event.clone(),
        );
        let outcome = match step.run() {
            Ok(outcome) => outcome,
            Err(err) => {
                *state = checkpoint;
                tracing::warn!(
                    "[{}] Event '{}' abandoned, configuration restored: {}",
                    self.machine_id,
                    event.name,
                    err
                );
                if let Some(id) = invocation {
                    self.restart_service(id, &state);
                }
                return Err(err);
            }
        };
        if let Some(id) = invocation {
            self.services.lock().remove(&id);
        }

        let _ = self.lifecycle.compare_exchange(
            Lifecycle::Started.as_u8(),
            Lifecycle::Running.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(self.commit(state, event, outcome))
    }

    /// Applies service changes, releases the lock, then publishes.
    fn commit(
        &self,
        state: parking_lot::MutexGuard<'_, MachineState>,
        event: Event,
        outcome: StepOutcome,
    ) -> MachineSnapshot {
        let StepOutcome {
            changed,
            outbox,
            exited,
            entered,
            microsteps,
        } = outcome;

        self.cancel_services(|handle| exited.contains(&handle.state));
        if state.done {
            self.cancel_services(|_| true);
        } else if !self.is_disposed() {
            self.start_services(&entered, &state);
        }

        let snapshot = self.capture(&state, changed);
        drop(state);

        if changed {
            tracing::debug!(
                "[{}] '{}' settled after {} microstep(s) in {}",
                self.machine_id,
                event.name,
                microsteps,
                snapshot.value
            );
            self.listeners.invoke(&StateChange {
                machine_id: self.machine_id.clone(),
                event,
                snapshot: snapshot.clone(),
            });
        }

        for intent in outbox {
            let envelope = intent.into_envelope(&self.machine_id);
            tracing::debug!(
                "[{}] Delivering deferred '{}' to {}",
                self.machine_id,
                envelope.event.name,
                envelope.to
            );
            self.sink.deliver(envelope);
        }

        snapshot
    }

    fn start_services(&self, entered: &BTreeSet<StateIndex>, state: &MachineState) {
        for &index in entered {
            if !state.configuration.contains(&index) {
                continue;
            }
            if let Some(invoke) = self.chart.node(index).invoke() {
                self.spawn_service(index, invoke, &state.context);
            }
        }
    }

    fn spawn_service(&self, index: StateIndex, invoke: &Invoke, context: &Value) {
        let Some(runtime) = &self.runtime else {
            tracing::warn!(
                "[{}] No runtime for service '{}', not started",
                self.machine_id,
                invoke.src
            );
            return;
        };

        let id = InvocationId::new();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        {
            // Dispose cancels under this lock, so a service is either seen
            // by that cancellation or never registered.
            let mut services = self.services.lock();
            if self.is_disposed() {
                return;
            }
            services.insert(
                id,
                ServiceHandle {
                    state: index,
                    invoke_id: invoke.id.clone(),
                    cancel: cancel_tx,
                },
            );
        }

        let ctx = ServiceContext::new(
            self.machine_id.clone(),
            self.chart.node(index).id().to_string(),
            invoke.id.clone(),
            id,
            context.clone(),
            cancel_rx.clone(),
        );
        let service = (invoke.service)(ctx);
        let sink = Arc::clone(&self.sink);
        let machine_id = self.machine_id.clone();
        let invoke_id = invoke.id.clone();

        tracing::debug!(
            "[{}] Starting service '{}' as {} ({})",
            machine_id,
            invoke.src,
            invoke_id,
            id
        );

        runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                    tracing::debug!("[{}] Invocation {} cancelled", machine_id, invoke_id);
                    return;
                }
                result = service => result,
            };
            let event = match result {
                Ok(output) => Event::from_invocation(id, event::done_invoke(&invoke_id), output),
                Err(ServiceError::Cancelled) => return,
                Err(ServiceError::Failed(message)) => Event::from_invocation(
                    id,
                    event::error_platform(&invoke_id),
                    json!({ "message": message }),
                ),
            };
            sink.deliver(Envelope {
                from: machine_id.clone(),
                to: machine_id,
                event,
            });
        });
    }

    /// Replaces a finished invocation whose completion was rolled back.
    ///
    /// The checkpoint put its state back in the configuration, and that
    /// state must not sit there without a running service.
    fn restart_service(&self, id: InvocationId, state: &MachineState) {
        let Some(handle) = self.services.lock().remove(&id) else {
            return;
        };
        if !state.configuration.contains(&handle.state) || self.is_disposed() {
            return;
        }
        if let Some(invoke) = self.chart.node(handle.state).invoke() {
            tracing::debug!(
                "[{}] Restarting invocation {} after rollback",
                self.machine_id,
                handle.invoke_id
            );
            self.spawn_service(handle.state, invoke, &state.context);
        }
    }

    fn cancel_services<F>(&self, mut select: F)
    where
        F: FnMut(&ServiceHandle) -> bool,
    {
        let mut services = self.services.lock();
        let ids: Vec<InvocationId> = services
            .iter()
            .filter(|(_, handle)| select(handle))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(handle) = services.remove(&id) {
                tracing::debug!(
                    "[{}] Cancelling invocation {} ({})",
                    self.machine_id,
                    handle.invoke_id,
                    id
                );
                let _ = handle.cancel.send(true);
            }
        }
    }

    /// Number of invocations currently running.
    pub fn active_services(&self) -> usize {
        self.services.lock().len()
    }

    pub fn subscribe<F>(&self, priority: Priority, callback: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(priority, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Current snapshot. Waits for an in-flight macrostep.
    pub fn snapshot(&self) -> MachineSnapshot {
        let state = self.state.lock();
        self.capture(&state, false)
    }

    pub fn state_value(&self) -> Value {
        self.snapshot().value
    }

    pub fn context(&self) -> Value {
        self.state.lock().context.clone()
    }

    /// Whether the state with this id is active.
    pub fn matches(&self, state_id: &str) -> bool {
        let Some(index) = self.chart.find(state_id) else {
            return false;
        };
        self.state.lock().configuration.contains(&index)
    }

    /// Disposes the machine, waiting at most `timeout` for an in-flight
    /// macrostep. Never fails.
    pub fn dispose(&self, timeout: Duration) -> DisposeOutcome {
        if !self.begin_dispose() {
            return DisposeOutcome::AlreadyDisposed;
        }
        match self.state.try_lock_for(timeout) {
            Some(_guard) => DisposeOutcome::Disposed,
            None => {
                tracing::warn!(
                    "[{}] Macrostep still running after {:?} dispose timeout",
                    self.machine_id,
                    timeout
                );
                DisposeOutcome::TimedOut
            }
        }
    }

    /// Async form of [`dispose`](Self::dispose). The lock wait happens on a
    /// blocking thread and the whole wait is bounded by `timeout`.
    pub async fn dispose_async(self: &Arc<Self>, timeout: Duration) -> DisposeOutcome {
        if !self.begin_dispose() {
            return DisposeOutcome::AlreadyDisposed;
        }
        let this = Arc::clone(self);
        let wait = tokio::task::spawn_blocking(move || this.state.try_lock_for(timeout).is_some());
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(true)) => DisposeOutcome::Disposed,
            _ => {
                tracing::warn!(
                    "[{}] Macrostep still running after {:?} dispose timeout",
                    self.machine_id,
                    timeout
                );
                DisposeOutcome::TimedOut
            }
        }
    }

    /// Flips the lifecycle and cancels services. False if already disposed.
    fn begin_dispose(&self) -> bool {
        let previous = self
            .lifecycle
            .swap(Lifecycle::Disposed.as_u8(), Ordering::SeqCst);
        if previous == Lifecycle::Disposed.as_u8() {
            return false;
        }
        self.cancel_services(|_| true);
        tracing::info!("[{}] Disposed", self.machine_id);
        true
    }

    fn check_running(&self) -> Result<(), CoreError> {
        match self.lifecycle() {
            Lifecycle::Disposed => Err(self.disposed()),
            Lifecycle::Constructed => Err(CoreError::NotStarted {
                machine: self.machine_id.clone(),
            }),
            Lifecycle::Started | Lifecycle::Running => Ok(()),
        }
    }

    fn disposed(&self) -> CoreError {
        CoreError::Disposed {
            machine: self.machine_id.clone(),
        }
    }

    fn capture(&self, state: &MachineState, changed: bool) -> MachineSnapshot {
        MachineSnapshot::capture(
            &self.machine_id,
            &self.chart,
            &state.configuration,
            &state.context,
            self.lifecycle(),
            state.done,
            changed,
        )
    }

    async fn blocking<F>(&self, f: F) -> Result<MachineSnapshot, CoreError>
    where
        F: FnOnce() -> Result<MachineSnapshot, CoreError> + Send + 'static,
    {
        match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(self.disposed()),
        }
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("machine_id", &self.machine_id)
            .field("chart", &self.chart.id())
            .field("lifecycle", &self.lifecycle())
            .field("busy", &self.state.is_locked())
            .finish()
    }
}
