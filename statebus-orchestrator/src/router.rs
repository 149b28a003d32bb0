//! Routes committed outboxes and service completions back into the queues.

use crate::orchestrator::Shared;
use statebus_core::{Envelope, EventOrigin, EventSink};
use std::sync::Weak;

/// Where an enqueued entry came from. Used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    External,
    Deferred,
    Invocation,
}

impl Source {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Source::External => "external",
            Source::Deferred => "deferred",
            Source::Invocation => "invocation",
        }
    }
}

/// Sink handed to every interpreter the orchestrator spawns.
///
/// Runs after the emitting machine has released its lock and only ever
/// enqueues, so it cannot deadlock against any machine.
pub(crate) struct RouterSink {
    shared: Weak<Shared>,
}

impl RouterSink {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

impl EventSink for RouterSink {
    fn deliver(&self, envelope: Envelope) {
        let Envelope { from, to, event } = envelope;
        let Some(shared) = self.shared.upgrade() else {
            tracing::warn!(
                "[{}] Dropping '{}' for {}: orchestrator is gone",
                from,
                event.name,
                to
            );
            return;
        };

        let source = match event.origin {
            EventOrigin::Invocation(_) => Source::Invocation,
            _ => Source::Deferred,
        };
        if source == Source::Deferred {
            if let Some(metrics) = shared.hooks.metrics() {
                metrics.deferred_sends_total.inc();
            }
        }

        let name = event.name.clone();
        // Nobody awaits routed deliveries; the worker logs their failures.
        if let Err(err) = shared.enqueue(&from, &to, event, source) {
            tracing::warn!("[{}] Dropping '{}' for {}: {}", from, name, to, err);
            if let Some(metrics) = shared.hooks.metrics() {
                metrics
                    .intents_dropped_total
                    .with_label_values(&[err.error_code()])
                    .inc();
            }
        }
    }
}
