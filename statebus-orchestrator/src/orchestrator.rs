//! Many machines, one queue each, a shared worker pool.
//!
//! Every machine owns a FIFO queue drained by its own task. The drain task
//! takes one entry at a time, waits for a pool permit and runs the
//! interpreter send on a blocking thread, so a machine never processes two
//! entries at once while distinct machines progress in parallel up to the
//! pool size. Outboxes come back through [`RouterSink`] after the emitting
//! machine's lock is released and go onto the same queues.

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::metrics::Metrics;
use crate::queue::{self, Command, Delivery, DeliveryResult, QueueEntry, QueueReceiver, QueueSender};
use crate::router::{RouterSink, Source};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde_json::Value;
use statebus_core::{
    Chart, DisposeOutcome, Event, Interpreter, InterpreterOptions, MachineSnapshot,
};
use statebus_dispatch::{Priority, SequentialExecutor, SubscriptionId, SynchronizedHandler};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};

/// A committed transition, as seen by orchestrator observers.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub machine_id: String,
    /// Sender of the entry that caused it.
    pub from: String,
    pub event: Event,
    /// State value before the entry was processed.
    pub previous: Value,
    pub snapshot: MachineSnapshot,
}

/// Observer fan-out and metrics, shared with the drain tasks.
pub(crate) struct Hooks {
    transitions: SynchronizedHandler<TransitionRecord>,
    observers: SequentialExecutor<TransitionRecord>,
    metrics: RwLock<Option<Arc<Metrics>>>,
}

impl Hooks {
    pub(crate) fn metrics(&self) -> Option<Arc<Metrics>> {
        self.metrics.read().clone()
    }
}

struct MachineSlot {
    interpreter: Arc<Interpreter>,
    queue: Arc<QueueSender>,
}

pub(crate) struct Shared {
    config: OrchestratorConfig,
    runtime: Handle,
    pool: Arc<Semaphore>,
    machines: DashMap<String, MachineSlot>,
    /// Disposed ids; sends to them resolve `Disposed` rather than `NotFound`.
    retired: DashSet<String>,
    shutting_down: AtomicBool,
    pub(crate) hooks: Arc<Hooks>,
}

impl Shared {
    fn queue(&self, machine: &str) -> Result<Arc<QueueSender>, OrchestratorError> {
        match self.machines.get(machine) {
            Some(slot) => Ok(slot.queue.clone()),
            None => Err(self.missing(machine)),
        }
    }

    fn missing(&self, machine: &str) -> OrchestratorError {
        if self.retired.contains(machine) {
            OrchestratorError::Disposed {
                machine: machine.to_string(),
            }
        } else {
            OrchestratorError::NotFound {
                machine: machine.to_string(),
            }
        }
    }

    /// Enqueues without waiting for queue capacity.
    pub(crate) fn enqueue(
        &self,
        from: &str,
        to: &str,
        event: Event,
        source: Source,
    ) -> Result<Delivery, OrchestratorError> {
        let queue = self.queue(to)?;
        let (entry, delivery) = QueueEntry::new(from, to, event);
        let (id, name) = (entry.id, entry.event.name.clone());
        let metrics = self.reserve_depth();
        if let Err((_, err)) = queue.try_send(Command::Deliver(entry)) {
            release_depth(metrics);
            return Err(err);
        }
        self.enqueued(to, from, &name, id, source);
        Ok(delivery)
    }

    /// Raises the depth gauge ahead of a send so the drain task can never
    /// lower it first.
    fn reserve_depth(&self) -> Option<Arc<Metrics>> {
        let metrics = self.hooks.metrics();
        if let Some(metrics) = &metrics {
            metrics.queue_depth.inc();
        }
        metrics
    }

    fn enqueued(&self, to: &str, from: &str, name: &str, id: uuid::Uuid, source: Source) {
        tracing::debug!(
            "[{}] Enqueued '{}' from {} ({}, {})",
            to,
            name,
            from,
            source.as_str(),
            id
        );
        if let Some(metrics) = self.hooks.metrics() {
            metrics
                .events_enqueued_total
                .with_label_values(&[source.as_str()])
                .inc();
        }
    }
}

fn release_depth(metrics: Option<Arc<Metrics>>) {
    if let Some(metrics) = metrics {
        metrics.queue_depth.dec();
    }
}

/// Coordinates many interpreters through per-machine queues.
///
/// Cloning is cheap and yields a handle to the same orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Creates an orchestrator on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_handle(config, &Handle::current())
    }

    /// Creates an orchestrator whose tasks and services run on `runtime`.
    pub fn with_handle(config: OrchestratorConfig, runtime: &Handle) -> Self {
        let hooks = Arc::new(Hooks {
            transitions: SynchronizedHandler::new(),
            observers: SequentialExecutor::with_handle(runtime),
            metrics: RwLock::new(None),
        });
        tracing::info!(
            "Orchestrator ready: pool_size={}, queue_capacity={}, drain_on_dispose={}",
            config.pool_size,
            config.queue_capacity,
            config.drain_on_dispose
        );
        Self {
            shared: Arc::new(Shared {
                pool: Arc::new(Semaphore::new(config.pool_size.max(1))),
                config,
                runtime: runtime.clone(),
                machines: DashMap::new(),
                retired: DashSet::new(),
                shutting_down: AtomicBool::new(false),
                hooks,
            }),
        }
    }

    /// Records metrics into `metrics` from now on.
    pub fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
        metrics.machines_active.set(self.shared.machines.len() as f64);
        *self.shared.hooks.metrics.write() = Some(metrics);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> Option<Arc<Metrics>> {
        self.shared.hooks.metrics()
    }

    /// Builds, starts and registers a machine running `chart`.
    ///
    /// Entry actions of the initial configuration run before this returns;
    /// sends they request are queued and processed once the machine's drain
    /// task is up.
    pub async fn spawn_machine(
        &self,
        id: impl Into<String>,
        chart: Arc<Chart>,
    ) -> Result<Arc<Interpreter>, OrchestratorError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let id = id.into();
        let config = &self.shared.config;
        let chart_id = chart.id().to_string();

        let sink = Arc::new(RouterSink::new(Arc::downgrade(&self.shared)));
        let interpreter = Arc::new(
            Interpreter::new(id.clone(), chart)
                .with_sink(sink)
                .with_options(InterpreterOptions {
                    max_microsteps: config.max_microsteps,
                })
                .with_runtime(self.shared.runtime.clone()),
        );
        let (tx, rx) = queue::channel(&id, config.queue_capacity);

        match self.shared.machines.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyRegistered { machine: id });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MachineSlot {
                    interpreter: interpreter.clone(),
                    queue: Arc::new(tx),
                });
            }
        }
        self.shared.retired.remove(&id);

        if let Err(err) = interpreter.start_async().await {
            self.shared.machines.remove(&id);
            tracing::warn!("[{}] Failed to start chart '{}': {}", id, chart_id, err);
            return Err(err.into());
        }

        let worker = Worker {
            machine_id: id.clone(),
            interpreter: interpreter.clone(),
            pool: self.shared.pool.clone(),
            hooks: self.shared.hooks.clone(),
            dispose_timeout: config.dispose_timeout(),
        };
        self.shared.runtime.spawn(worker.run(rx));

        if let Some(metrics) = self.metrics() {
            metrics.machines_active.inc();
        }
        tracing::info!("[{}] Spawned machine running chart '{}'", id, chart_id);
        Ok(interpreter)
    }

    /// Enqueues an event and waits for it and its whole cascade.
    ///
    /// Waits for room when the target's queue is bounded and full.
    pub async fn send_event(
        &self,
        from: &str,
        to: &str,
        event: impl Into<String>,
        data: Value,
    ) -> DeliveryResult {
        let queue = self.shared.queue(to)?;
        let (entry, delivery) = QueueEntry::new(from, to, Event::new(event, data));
        let (id, name) = (entry.id, entry.event.name.clone());
        let metrics = self.shared.reserve_depth();
        if let Err((_, err)) = queue.send(Command::Deliver(entry)).await {
            release_depth(metrics);
            return Err(err);
        }
        self.shared.enqueued(to, from, &name, id, Source::External);
        delivery.wait().await
    }

    /// Enqueues an event without waiting. Failures resolve through the
    /// returned handle.
    pub fn enqueue(&self, from: &str, to: &str, event: impl Into<String>, data: Value) -> Delivery {
        match self
            .shared
            .enqueue(from, to, Event::new(event, data), Source::External)
        {
            Ok(delivery) => delivery,
            Err(err) => Delivery::failed(to, err),
        }
    }

    /// Disposes a machine.
    ///
    /// With `drain_on_dispose` the entries already queued are processed
    /// first; otherwise the interpreter is disposed now and they resolve
    /// `Disposed`. Either way the id stops accepting entries immediately.
    pub async fn dispose_machine(&self, id: &str) -> Result<DisposeOutcome, OrchestratorError> {
        let Some((_, slot)) = self.shared.machines.remove(id) else {
            return if self.shared.retired.contains(id) {
                Ok(DisposeOutcome::AlreadyDisposed)
            } else {
                Err(OrchestratorError::NotFound {
                    machine: id.to_string(),
                })
            };
        };
        self.shared.retired.insert(id.to_string());

        let timeout = self.shared.config.dispose_timeout();
        let outcome = if self.shared.config.drain_on_dispose {
            let (done_tx, done_rx) = oneshot::channel();
            match slot.queue.send(Command::Dispose(done_tx)).await {
                Ok(()) => match done_rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => slot.interpreter.dispose_async(timeout).await,
                },
                Err(_) => slot.interpreter.dispose_async(timeout).await,
            }
        } else {
            slot.interpreter.dispose_async(timeout).await
        };

        if let Some(metrics) = self.metrics() {
            metrics.machines_active.dec();
            metrics
                .disposals_total
                .with_label_values(&[dispose_label(outcome)])
                .inc();
        }
        tracing::info!("[{}] Machine removed ({:?})", id, outcome);
        Ok(outcome)
    }

    /// Disposes every machine and refuses new ones.
    pub async fn shutdown(&self) -> Vec<(String, DisposeOutcome)> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let ids = self.machine_ids();
        tracing::info!("Shutting down {} machine(s)", ids.len());

        let results = futures::future::join_all(ids.into_iter().map(|id| async move {
            let outcome = self.dispose_machine(&id).await;
            (id, outcome)
        }))
        .await;
        results
            .into_iter()
            .filter_map(|(id, outcome)| outcome.ok().map(|o| (id, o)))
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Registers a transition callback.
    ///
    /// Callbacks run on the worker that processed the entry, right after
    /// the machine lock is released. Calls for different machines never
    /// overlap.
    pub fn on_transition<F>(&self, priority: Priority, callback: F) -> SubscriptionId
    where
        F: Fn(&TransitionRecord) + Send + Sync + 'static,
    {
        self.shared.hooks.transitions.subscribe(priority, callback)
    }

    pub fn off_transition(&self, id: SubscriptionId) -> bool {
        self.shared.hooks.transitions.unsubscribe(id)
    }

    /// Registers an async observer. Records are delivered one at a time,
    /// each to every observer, in commit order.
    pub fn observe<F, Fut>(&self, priority: Priority, observer: F) -> SubscriptionId
    where
        F: Fn(TransitionRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.hooks.observers.subscribe(priority, observer)
    }

    pub fn unobserve(&self, id: SubscriptionId) -> bool {
        self.shared.hooks.observers.unsubscribe(id)
    }

    pub fn machine(&self, id: &str) -> Option<Arc<Interpreter>> {
        self.shared
            .machines
            .get(id)
            .map(|slot| slot.interpreter.clone())
    }

    /// Registered machine ids, sorted.
    pub fn machine_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .machines
            .iter()
            .map(|slot| slot.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Current snapshot of a machine. Waits for an in-flight macrostep.
    pub fn snapshot(&self, id: &str) -> Result<MachineSnapshot, OrchestratorError> {
        match self.machine(id) {
            Some(interpreter) => Ok(interpreter.snapshot()),
            None => Err(self.shared.missing(id)),
        }
    }

    /// Entries waiting in a machine's queue.
    pub fn queue_depth(&self, id: &str) -> Option<usize> {
        self.shared.machines.get(id).map(|slot| slot.queue.depth())
    }

    pub fn len(&self) -> usize {
        self.shared.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.machines.is_empty()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("machines", &self.shared.machines.len())
            .field("retired", &self.shared.retired.len())
            .field("pool_size", &self.shared.config.pool_size)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

fn dispose_label(outcome: DisposeOutcome) -> &'static str {
    match outcome {
        DisposeOutcome::Disposed => "disposed",
        DisposeOutcome::AlreadyDisposed => "already_disposed",
        DisposeOutcome::TimedOut => "timed_out",
    }
}

/// Drains one machine's queue.
struct Worker {
    machine_id: String,
    interpreter: Arc<Interpreter>,
    pool: Arc<Semaphore>,
    hooks: Arc<Hooks>,
    dispose_timeout: Duration,
}

impl Worker {
    async fn run(self, mut rx: QueueReceiver) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Deliver(entry) => {
                    if let Some(metrics) = self.hooks.metrics() {
                        metrics.queue_depth.dec();
                    }
                    self.process(entry).await
                }
                Command::Dispose(done) => {
                    let outcome = self.interpreter.dispose_async(self.dispose_timeout).await;
                    rx.close();
                    let _ = done.send(outcome);
                }
            }
        }
        tracing::debug!("[{}] Queue closed, worker stopped", self.machine_id);
    }

    async fn process(&self, entry: QueueEntry) {
        if self.interpreter.is_disposed() {
            let err = self.disposed();
            self.finish(entry.id, &entry.event.name, None, Err(&err));
            entry.resolve(Err(err));
            return;
        }

        let permit = match self.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                entry.resolve(Err(OrchestratorError::ShuttingDown));
                return;
            }
        };

        let QueueEntry {
            id,
            from,
            event,
            completion,
            ..
        } = entry;
        let name = event.name.clone();
        let interpreter = self.interpreter.clone();
        let hooks = self.hooks.clone();

        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let previous = interpreter.state_value();
            let started = Instant::now();
            let result = interpreter.send_event(event.clone());
            let elapsed = started.elapsed();

            if let Ok(snapshot) = &result {
                if snapshot.changed {
                    let record = TransitionRecord {
                        machine_id: interpreter.machine_id().to_string(),
                        from,
                        event,
                        previous,
                        snapshot: snapshot.clone(),
                    };
                    hooks.transitions.invoke(&record);
                    if !hooks.observers.is_empty() {
                        if let Err(err) = hooks.observers.dispatch(record) {
                            tracing::debug!(
                                "[{}] Observer dispatch skipped: {}",
                                interpreter.machine_id(),
                                err
                            );
                        }
                    }
                }
            }
            (result, elapsed)
        });

        let (result, elapsed) = match job.await {
            Ok((result, elapsed)) => (result.map_err(OrchestratorError::from_core), Some(elapsed)),
            Err(err) if err.is_panic() => {
                tracing::error!("[{}] Worker panicked processing '{}'", self.machine_id, name);
                (
                    Err(OrchestratorError::Dropped {
                        machine: self.machine_id.clone(),
                    }),
                    None,
                )
            }
            Err(_) => (Err(OrchestratorError::ShuttingDown), None),
        };

        self.finish(id, &name, elapsed, result.as_ref().map(|s| s.changed));
        let _ = completion.send(result);
    }

    fn finish(
        &self,
        id: uuid::Uuid,
        name: &str,
        elapsed: Option<Duration>,
        result: Result<bool, &OrchestratorError>,
    ) {
        let outcome = match result {
            Ok(true) => "changed",
            Ok(false) => "noop",
            Err(err) => err.error_code(),
        };
        match result {
            Ok(_) => tracing::debug!("[{}] Processed '{}' ({}): {}", self.machine_id, name, id, outcome),
            Err(OrchestratorError::Disposed { .. }) => {
                tracing::debug!("[{}] '{}' ({}) hit a disposed machine", self.machine_id, name, id)
            }
            Err(err) => tracing::warn!("[{}] '{}' ({}) failed: {}", self.machine_id, name, id, err),
        }

        if let Some(metrics) = self.hooks.metrics() {
            metrics
                .events_processed_total
                .with_label_values(&[outcome])
                .inc();
            if let Some(elapsed) = elapsed {
                metrics.macrostep_duration.observe(elapsed.as_secs_f64());
            }
        }
    }

    fn disposed(&self) -> OrchestratorError {
        OrchestratorError::Disposed {
            machine: self.machine_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statebus_core::{ActionContext, ActionError, Bindings, CoreError, ServiceError};
    use tokio::sync::mpsc;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            pool_size: 4,
            dispose_timeout_ms: 1000,
            ..Default::default()
        }
    }

    fn compile(def: Value, bindings: &Bindings) -> Arc<Chart> {
        Chart::from_json(&def, bindings).unwrap()
    }

    /// Appends `event.n` to `ctx.seen` on every PUSH.
    fn recorder() -> Arc<Chart> {
        let bindings = Bindings::new().action("record", |ctx: &mut ActionContext<'_>| {
            let n = ctx.event().data["n"].clone();
            if let Some(Value::Array(seen)) = ctx.context_mut().get_mut("seen") {
                seen.push(n);
            }
            Ok(())
        });
        compile(
            json!({
                "id": "recorder",
                "context": {"seen": []},
                "states": {"ready": {"on": {"PUSH": {"actions": "record"}}}}
            }),
            &bindings,
        )
    }

    /// Sleeps on every WORK, then bumps `ctx.done`.
    fn slow() -> Arc<Chart> {
        let bindings = Bindings::new().action("work", |ctx: &mut ActionContext<'_>| {
            std::thread::sleep(Duration::from_millis(30));
            let done = ctx.get("done").and_then(Value::as_i64).unwrap_or(0);
            ctx.set("done", json!(done + 1));
            Ok(())
        });
        compile(
            json!({
                "id": "slow",
                "context": {"done": 0},
                "states": {"busy": {"on": {"WORK": {"actions": "work"}}}}
            }),
            &bindings,
        )
    }

    async fn wait_for<F>(orch: &Orchestrator, id: &str, predicate: F) -> MachineSnapshot
    where
        F: Fn(&MachineSnapshot) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = orch.snapshot(id).unwrap();
            if predicate(&snapshot) {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting on {}: {}",
                id,
                snapshot.value
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_entries_drain_fifo_per_machine() {
        let orch = Orchestrator::new(config());
        orch.spawn_machine("r1", recorder()).await.unwrap();
        orch.spawn_machine("r2", recorder()).await.unwrap();

        let deliveries: Vec<Delivery> = (0..50)
            .flat_map(|n| {
                [
                    orch.enqueue("test", "r1", "PUSH", json!({"n": n})),
                    orch.enqueue("test", "r2", "PUSH", json!({"n": n})),
                ]
            })
            .collect();
        for delivery in deliveries {
            assert!(delivery.wait().await.unwrap().changed);
        }

        let expected = Value::Array((0..50).map(|n| json!(n)).collect());
        assert_eq!(orch.snapshot("r1").unwrap().context["seen"], expected);
        assert_eq!(orch.snapshot("r2").unwrap().context["seen"], expected);
        assert_eq!(orch.queue_depth("r1"), Some(0));
    }

    #[tokio::test]
    async fn test_three_starts_each_deferring_a_tick() {
        let bindings = Bindings::new()
            .action("requestTick", |ctx: &mut ActionContext<'_>| {
                ctx.request_self_send("TICK", Value::Null);
                Ok(())
            })
            .action("increment", |ctx: &mut ActionContext<'_>| {
                let count = ctx.get("count").and_then(Value::as_i64).unwrap_or(0);
                ctx.set("count", json!(count + 1));
                Ok(())
            });
        let chart = compile(
            json!({
                "id": "counter",
                "initial": "idle",
                "context": {"count": 0},
                "states": {
                    "idle": {
                        "on": {
                            "START": {"actions": "requestTick"},
                            "TICK": {"actions": "increment"}
                        },
                        "always": {"target": "complete", "guard": "ctx.count >= 3"}
                    },
                    "complete": {"type": "final"}
                }
            }),
            &bindings,
        );
        let orch = Orchestrator::new(config());
        orch.spawn_machine("c1", chart).await.unwrap();

        for round in 0..3 {
            let snapshot = orch.send_event("host", "c1", "START", Value::Null).await.unwrap();
            // The tick requested by this START has not run yet
            assert_eq!(snapshot.context["count"], round);
        }

        let snapshot = wait_for(&orch, "c1", |s| s.done).await;
        assert_eq!(snapshot.value, json!("complete"));
        assert_eq!(snapshot.context["count"], 3);
    }

    fn ping_pong() -> (Arc<Chart>, Arc<Chart>) {
        let bindings = Bindings::new()
            .action("hit", |ctx: &mut ActionContext<'_>| {
                let rounds = ctx.get("rounds").and_then(Value::as_i64).unwrap_or(0) + 1;
                ctx.set("rounds", json!(rounds));
                let reply_to = ctx.machine_id().to_string();
                ctx.request_send("pong", "PING", json!({"round": rounds, "reply_to": reply_to}));
                Ok(())
            })
            .action("reply", |ctx: &mut ActionContext<'_>| {
                let returned = ctx.get("returned").and_then(Value::as_i64).unwrap_or(0);
                ctx.set("returned", json!(returned + 1));
                let data = ctx.event().data.clone();
                let reply_to = data["reply_to"].as_str().unwrap_or_default().to_string();
                ctx.request_send(reply_to, "PONG", json!({"round": data["round"]}));
                Ok(())
            });
        let ping = compile(
            json!({
                "id": "ping",
                "initial": "serving",
                "context": {"rounds": 0},
                "states": {
                    "serving": {"on": {
                        "SERVE": {"actions": "hit"},
                        "PONG": [{"target": "finished", "guard": "event.round >= 3"}, {"actions": "hit"}]
                    }},
                    "finished": {"type": "final"}
                }
            }),
            &bindings,
        );
        let pong = compile(
            json!({
                "id": "pong",
                "context": {"returned": 0},
                "states": {"waiting": {"on": {"PING": {"actions": "reply"}}}}
            }),
            &bindings,
        );
        (ping, pong)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cross_machine_exchange() {
        let orch = Orchestrator::new(config());
        let (ping, pong) = ping_pong();
        orch.spawn_machine("ping", ping).await.unwrap();
        orch.spawn_machine("pong", pong).await.unwrap();

        orch.send_event("host", "ping", "SERVE", Value::Null).await.unwrap();
        let snapshot = wait_for(&orch, "ping", |s| s.done).await;
        assert_eq!(snapshot.context["rounds"], 3);
        assert_eq!(orch.snapshot("pong").unwrap().context["returned"], 3);
    }

    #[tokio::test]
    async fn test_unknown_and_disposed_targets() {
        let orch = Orchestrator::new(config());
        let err = orch.send_event("host", "ghost", "X", Value::Null).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { ref machine } if machine == "ghost"));
        assert!(matches!(
            orch.dispose_machine("ghost").await,
            Err(OrchestratorError::NotFound { .. })
        ));

        orch.spawn_machine("r1", recorder()).await.unwrap();
        assert!(matches!(
            orch.spawn_machine("r1", recorder()).await,
            Err(OrchestratorError::AlreadyRegistered { .. })
        ));
        assert_eq!(orch.machine_ids(), vec!["r1"]);

        assert_eq!(orch.dispose_machine("r1").await.unwrap(), DisposeOutcome::Disposed);
        assert_eq!(
            orch.dispose_machine("r1").await.unwrap(),
            DisposeOutcome::AlreadyDisposed
        );
        assert!(orch.machine("r1").is_none());
        assert!(orch.is_empty());

        let err = orch.send_event("host", "r1", "PUSH", json!({"n": 1})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Disposed { .. }));
        let err = orch.enqueue("host", "r1", "PUSH", Value::Null).wait().await.unwrap_err();
        assert_eq!(err.error_code(), "DISPOSED");
        assert!(matches!(orch.snapshot("r1"), Err(OrchestratorError::Disposed { .. })));

        // A retired id can be reused
        orch.spawn_machine("r1", recorder()).await.unwrap();
        assert!(orch.send_event("host", "r1", "PUSH", json!({"n": 1})).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispose_drains_queued_entries() {
        let orch = Orchestrator::new(OrchestratorConfig {
            drain_on_dispose: true,
            ..config()
        });
        let interpreter = orch.spawn_machine("s1", slow()).await.unwrap();

        let deliveries: Vec<_> = (0..3)
            .map(|_| orch.enqueue("host", "s1", "WORK", Value::Null))
            .collect();
        assert_eq!(orch.dispose_machine("s1").await.unwrap(), DisposeOutcome::Disposed);

        for delivery in deliveries {
            assert!(delivery.wait().await.is_ok());
        }
        assert_eq!(interpreter.context()["done"], 3);
        assert!(interpreter.is_disposed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispose_discards_queued_entries() {
        let orch = Orchestrator::new(OrchestratorConfig {
            drain_on_dispose: false,
            ..config()
        });
        let interpreter = orch.spawn_machine("s1", slow()).await.unwrap();

        let deliveries: Vec<_> = (0..3)
            .map(|_| orch.enqueue("host", "s1", "WORK", Value::Null))
            .collect();
        assert_eq!(orch.dispose_machine("s1").await.unwrap(), DisposeOutcome::Disposed);

        let mut results = Vec::new();
        for delivery in deliveries {
            results.push(delivery.wait().await);
        }
        let completed = results.iter().filter(|r| r.is_ok()).count();
        assert!(completed <= 1, "{} entries ran after dispose", completed);
        assert!(matches!(
            results.last(),
            Some(Err(OrchestratorError::Disposed { .. }))
        ));
        assert!(interpreter.context()["done"].as_i64().unwrap_or(0) <= 1);
    }

    #[tokio::test]
    async fn test_action_failure_resolves_through_handle() {
        let bindings = Bindings::new().action("boom", |_: &mut ActionContext<'_>| Err(ActionError::new("kaboom")));
        let chart = compile(
            json!({"id": "fragile", "states": {"a": {"on": {"GO": {"target": "b", "actions": "boom"}}}, "b": {}}}),
            &bindings,
        );
        let orch = Orchestrator::new(config());
        orch.spawn_machine("f1", chart).await.unwrap();

        let err = orch.send_event("host", "f1", "GO", Value::Null).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Core(CoreError::ActionFailed { .. })));
        assert_eq!(err.error_code(), "ACTION_FAILED");
        // The machine stays where it was and keeps accepting events
        assert_eq!(orch.snapshot("f1").unwrap().value, json!("a"));
        assert!(orch.send_event("host", "f1", "NOPE", Value::Null).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_service_completion_routed_back() {
        let bindings = Bindings::new()
            .action("store", |ctx: &mut ActionContext<'_>| {
                let data = ctx.event().data.clone();
                ctx.set("result", data);
                Ok(())
            })
            .service("load", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, ServiceError>(json!({"items": 2}))
            });
        let chart = compile(
            json!({
                "id": "fetcher",
                "initial": "idle",
                "states": {
                    "idle": {"on": {"FETCH": "loading"}},
                    "loading": {"invoke": {"src": "load", "onDone": {"target": "ready", "actions": "store"}}},
                    "ready": {}
                }
            }),
            &bindings,
        );
        let orch = Orchestrator::new(config());
        orch.spawn_machine("f1", chart).await.unwrap();

        let snapshot = orch.send_event("host", "f1", "FETCH", Value::Null).await.unwrap();
        assert_eq!(snapshot.value, json!("loading"));
        let snapshot = wait_for(&orch, "f1", |s| s.matches("ready")).await;
        assert_eq!(snapshot.context["result"], json!({"items": 2}));
    }

    #[tokio::test]
    async fn test_transition_observers() {
        let chart = compile(
            json!({"id": "toggle", "states": {"off": {"on": {"FLIP": "on"}}, "on": {"on": {"FLIP": "off"}}}}),
            &Bindings::new(),
        );
        let orch = Orchestrator::new(config());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            orch.on_transition(0, move |record: &TransitionRecord| {
                seen.lock().push(format!(
                    "{}:{}->{}",
                    record.machine_id, record.previous, record.snapshot.value
                ));
            });
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        orch.observe(0, move |record: TransitionRecord| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((record.from, record.event.name));
            }
        });

        orch.spawn_machine("t1", chart).await.unwrap();
        orch.send_event("host", "t1", "FLIP", Value::Null).await.unwrap();
        orch.send_event("host", "t1", "NOPE", Value::Null).await.unwrap();
        orch.send_event("host", "t1", "FLIP", Value::Null).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec!["t1:\"off\"->\"on\"", "t1:\"on\"->\"off\""]
        );
        for _ in 0..2 {
            let observed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(observed, ("host".to_string(), "FLIP".to_string()));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let bindings = Bindings::new().action("stray", |ctx: &mut ActionContext<'_>| {
            ctx.request_send("ghost", "HELLO", Value::Null);
            Ok(())
        });
        let chart = compile(
            json!({"id": "m", "states": {"a": {"on": {"GO": {"target": "b", "actions": "stray"}}}, "b": {}}}),
            &bindings,
        );
        let metrics = Arc::new(Metrics::new().unwrap());
        let orch = Orchestrator::new(config()).with_metrics(metrics.clone());
        orch.spawn_machine("m1", chart).await.unwrap();

        orch.send_event("host", "m1", "GO", Value::Null).await.unwrap();
        orch.send_event("host", "m1", "GO", Value::Null).await.unwrap();

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("statebus_machines_active 1"));
        assert!(encoded.contains("statebus_events_enqueued_total{source=\"external\"} 2"));
        assert!(encoded.contains("statebus_events_processed_total{outcome=\"changed\"} 1"));
        assert!(encoded.contains("statebus_events_processed_total{outcome=\"noop\"} 1"));
        assert!(encoded.contains("statebus_deferred_sends_total 1"));
        assert!(encoded.contains("statebus_intents_dropped_total{code=\"MACHINE_NOT_FOUND\"} 1"));
        // Rejected routes give their reservation back
        assert!(encoded.contains("statebus_queue_depth 0"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounded_queue_reports_full() {
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = parking_lot::Mutex::new(release_rx);
        let bindings = Bindings::new().action("hold", move |_: &mut ActionContext<'_>| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv();
            Ok(())
        });
        let blocker = compile(
            json!({"id": "blocker", "states": {"a": {"on": {"HOLD": {"actions": "hold"}}}}}),
            &bindings,
        );
        let orch = Orchestrator::new(OrchestratorConfig {
            pool_size: 1,
            queue_capacity: 1,
            ..config()
        });
        orch.spawn_machine("blocker", blocker).await.unwrap();
        orch.spawn_machine("r1", recorder()).await.unwrap();

        let held = orch.enqueue("host", "blocker", "HOLD", Value::Null);
        entered_rx.recv().await.unwrap();

        // The only permit is taken: r1 holds at most one entry in its worker
        // and one in its queue.
        let attempts: Vec<_> = (0..3)
            .map(|n| orch.enqueue("host", "r1", "PUSH", json!({"n": n})))
            .collect();
        release_tx.send(()).unwrap();
        assert!(held.wait().await.is_ok());

        let mut full = 0;
        let mut ok = 0;
        for attempt in attempts {
            match attempt.wait().await {
                Ok(_) => ok += 1,
                Err(err) => {
                    assert!(matches!(err, OrchestratorError::QueueFull { capacity: 1, .. }));
                    assert!(err.is_retryable());
                    full += 1;
                }
            }
        }
        assert!(full >= 1);
        assert!(ok >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_everything() {
        let orch = Orchestrator::new(config());
        orch.spawn_machine("a", recorder()).await.unwrap();
        orch.spawn_machine("b", recorder()).await.unwrap();

        let mut outcomes = orch.shutdown().await;
        outcomes.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            outcomes,
            vec![
                ("a".to_string(), DisposeOutcome::Disposed),
                ("b".to_string(), DisposeOutcome::Disposed),
            ]
        );
        assert!(orch.is_empty());
        assert!(orch.is_shutting_down());
        assert!(matches!(
            orch.spawn_machine("c", recorder()).await,
            Err(OrchestratorError::ShuttingDown)
        ));
    }
}
