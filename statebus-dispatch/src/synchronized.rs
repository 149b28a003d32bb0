//! Mutually exclusive synchronous fan-out.

use crate::error::DispatchError;
use crate::subscriber::{Priority, SubscriberList, SubscriptionId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type Callback<T> = dyn Fn(&T) + Send + Sync;

/// Runs all subscribers of one invocation inside a single critical section.
///
/// Invocations from different threads exclude each other and the caller
/// blocks until its own subscribers finish. A subscriber must not invoke the
/// same handler again: the section is not reentrant.
pub struct SynchronizedHandler<T> {
    subscribers: SubscriberList<Callback<T>>,
    section: Mutex<()>,
}

impl<T> SynchronizedHandler<T> {
    pub fn new() -> Self {
        Self {
            subscribers: SubscriberList::new(),
            section: Mutex::new(()),
        }
    }

    pub fn subscribe<F>(&self, priority: Priority, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribers.insert(priority, Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    /// Blocks until the section is free, then runs every subscriber.
    pub fn invoke(&self, value: &T) -> usize {
        let _section = self.section.lock();
        self.run(value)
    }

    /// Like [`invoke`](Self::invoke), but gives up if the section stays
    /// busy for longer than `timeout`.
    pub fn try_invoke_for(&self, value: &T, timeout: Duration) -> Result<usize, DispatchError> {
        let _section = self
            .section
            .try_lock_for(timeout)
            .ok_or(DispatchError::TimedOut { waited: timeout })?;
        Ok(self.run(value))
    }

    fn run(&self, value: &T) -> usize {
        let subscribers = self.subscribers.snapshot();
        for subscriber in subscribers.iter() {
            (subscriber.callback)(value);
        }
        subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<T> Default for SynchronizedHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SynchronizedHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedHandler")
            .field("subscribers", &self.subscribers)
            .field("busy", &self.section.is_locked())
            .finish()
    }
}
