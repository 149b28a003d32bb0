//! Per-machine delivery queues.

use crate::error::OrchestratorError;
use statebus_core::{DisposeOutcome, Event, MachineSnapshot};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Result of one orchestrated delivery.
pub type DeliveryResult = Result<MachineSnapshot, OrchestratorError>;

/// One queued event.
pub struct QueueEntry {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub event: Event,
    pub(crate) completion: oneshot::Sender<DeliveryResult>,
}

impl QueueEntry {
    pub(crate) fn new(from: &str, to: &str, event: Event) -> (Self, Delivery) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let entry = Self {
            id,
            from: from.to_string(),
            to: to.to_string(),
            event,
            completion: tx,
        };
        let delivery = Delivery {
            id,
            machine: to.to_string(),
            rx,
        };
        (entry, delivery)
    }

    /// Resolves the caller's handle. A caller that stopped waiting is ignored.
    pub(crate) fn resolve(self, result: DeliveryResult) {
        let _ = self.completion.send(result);
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("event", &self.event.name)
            .finish()
    }
}

/// Awaitable completion of an enqueued event.
///
/// Resolves once the entry and its whole microstep cascade have been
/// processed, or with the error that prevented it.
#[derive(Debug)]
pub struct Delivery {
    id: Uuid,
    machine: String,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl Delivery {
    /// A delivery that has already failed.
    pub(crate) fn failed(machine: &str, err: OrchestratorError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            id: Uuid::new_v4(),
            machine: machine.to_string(),
            rx,
        }
    }

    /// Correlation id of the queued entry.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub async fn wait(self) -> DeliveryResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Dropped {
                machine: self.machine,
            }),
        }
    }
}

/// What a machine's drain task consumes.
pub(crate) enum Command {
    Deliver(QueueEntry),
    /// Dispose once everything queued ahead has been processed.
    Dispose(oneshot::Sender<DisposeOutcome>),
}

enum Sender {
    Bounded(mpsc::Sender<Command>),
    Unbounded(mpsc::UnboundedSender<Command>),
}

enum Receiver {
    Bounded(mpsc::Receiver<Command>),
    Unbounded(mpsc::UnboundedReceiver<Command>),
}

/// Producer side of a machine queue. Tracks its own depth.
pub(crate) struct QueueSender {
    machine: String,
    capacity: usize,
    inner: Sender,
    depth: Arc<AtomicUsize>,
}

pub(crate) struct QueueReceiver {
    inner: Receiver,
    depth: Arc<AtomicUsize>,
}

/// Creates a machine queue. A capacity of 0 means unbounded.
pub(crate) fn channel(machine: &str, capacity: usize) -> (QueueSender, QueueReceiver) {
    let depth = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (Sender::Unbounded(tx), Receiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (Sender::Bounded(tx), Receiver::Bounded(rx))
    };
    (
        QueueSender {
            machine: machine.to_string(),
            capacity,
            inner: tx,
            depth: depth.clone(),
        },
        QueueReceiver { inner: rx, depth },
    )
}

impl QueueSender {
    /// Enqueues without waiting. A full bounded queue rejects the command.
    pub(crate) fn try_send(&self, command: Command) -> Result<(), (Command, OrchestratorError)> {
        // Counted before the receiver can see it, so depth never underflows
        self.depth.fetch_add(1, Ordering::SeqCst);
        let result = match &self.inner {
            Sender::Unbounded(tx) => tx.send(command).map_err(|e| (e.0, self.disposed())),
            Sender::Bounded(tx) => tx.try_send(command).map_err(|e| match e {
                mpsc::error::TrySendError::Full(command) => (
                    command,
                    OrchestratorError::QueueFull {
                        machine: self.machine.clone(),
                        capacity: self.capacity,
                    },
                ),
                mpsc::error::TrySendError::Closed(command) => (command, self.disposed()),
            }),
        };
        if result.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Enqueues, waiting for room in a bounded queue.
    pub(crate) async fn send(&self, command: Command) -> Result<(), (Command, OrchestratorError)> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        let result = match &self.inner {
            Sender::Unbounded(tx) => tx.send(command).map_err(|e| (e.0, self.disposed())),
            Sender::Bounded(tx) => tx.send(command).await.map_err(|e| (e.0, self.disposed())),
        };
        if result.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn disposed(&self) -> OrchestratorError {
        OrchestratorError::Disposed {
            machine: self.machine.clone(),
        }
    }
}

impl QueueReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Command> {
        let command = match &mut self.inner {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        };
        if command.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        command
    }

    /// Stops accepting commands; already queued ones can still be received.
    pub(crate) fn close(&mut self) {
        match &mut self.inner {
            Receiver::Bounded(rx) => rx.close(),
            Receiver::Unbounded(rx) => rx.close(),
        }
    }
}
