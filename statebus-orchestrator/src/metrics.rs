//! Prometheus metrics for the orchestrator.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Macrostep duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Prometheus metrics for the orchestrator.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Entries enqueued by source (external, deferred, invocation).
    pub events_enqueued_total: CounterVec,
    /// Entries processed by outcome (changed, noop, or an error code).
    pub events_processed_total: CounterVec,
    /// Deferred sends routed out of outboxes.
    pub deferred_sends_total: Counter,
    /// Routed envelopes that could not be enqueued, by error code.
    pub intents_dropped_total: CounterVec,
    /// Machines currently registered.
    pub machines_active: Gauge,
    /// Entries waiting across all machine queues.
    pub queue_depth: Gauge,
    /// Macrostep duration, measured around the interpreter send.
    pub macrostep_duration: Histogram,
    /// Dispose calls by outcome.
    pub disposals_total: CounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_enqueued_total = CounterVec::new(
            Opts::new("statebus_events_enqueued_total", "Total events enqueued by source"),
            &["source"],
        )?;
        registry.register(Box::new(events_enqueued_total.clone()))?;

        let events_processed_total = CounterVec::new(
            Opts::new(
                "statebus_events_processed_total",
                "Total events processed by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(events_processed_total.clone()))?;

        let deferred_sends_total = Counter::with_opts(Opts::new(
            "statebus_deferred_sends_total",
            "Total deferred sends routed after lock release",
        ))?;
        registry.register(Box::new(deferred_sends_total.clone()))?;

        let intents_dropped_total = CounterVec::new(
            Opts::new(
                "statebus_intents_dropped_total",
                "Total routed events that could not be enqueued",
            ),
            &["code"],
        )?;
        registry.register(Box::new(intents_dropped_total.clone()))?;

        let machines_active = Gauge::with_opts(Opts::new(
            "statebus_machines_active",
            "Number of registered machines",
        ))?;
        registry.register(Box::new(machines_active.clone()))?;

        let queue_depth = Gauge::with_opts(Opts::new(
            "statebus_queue_depth",
            "Entries waiting across all machine queues",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let macrostep_duration = Histogram::with_opts(
            HistogramOpts::new(
                "statebus_macrostep_duration_seconds",
                "Macrostep duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(macrostep_duration.clone()))?;

        let disposals_total = CounterVec::new(
            Opts::new("statebus_disposals_total", "Total machine disposals by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(disposals_total.clone()))?;

        Ok(Self {
            registry,
            events_enqueued_total,
            events_processed_total,
            deferred_sends_total,
            intents_dropped_total,
            machines_active,
            queue_depth,
            macrostep_duration,
            disposals_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
