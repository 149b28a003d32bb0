//! Where committed sends and service completions go.

use crate::action::Envelope;
use tokio::sync::mpsc;

/// Receives envelopes after the emitting machine's lock is released.
///
/// Implementations must not block on the emitting machine: the orchestrator
/// implementation only enqueues.
pub trait EventSink: Send + Sync {
    fn deliver(&self, envelope: Envelope);
}

/// Default sink of a standalone interpreter. Logs and drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnroutedSink;

impl EventSink for UnroutedSink {
    fn deliver(&self, envelope: Envelope) {
        tracing::warn!(
            "Dropping '{}' from {} to {}: no router attached",
            envelope.event.name,
            envelope.from,
            envelope.to
        );
    }
}

/// Forwards envelopes into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, envelope: Envelope) {
        if let Err(err) = self.tx.send(envelope) {
            tracing::debug!("Channel sink closed, dropping '{}'", err.0.event.name);
        }
    }
}
