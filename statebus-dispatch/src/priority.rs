//! Priority-ordered synchronous fan-out.

use crate::subscriber::{Priority, SubscriberList, SubscriptionId};
use std::fmt;
use std::sync::Arc;

type Callback<T> = dyn Fn(&T) + Send + Sync;

/// Runs every subscriber on the caller's thread in ascending priority order.
///
/// Ordering is the only guarantee: two threads invoking at the same time
/// interleave freely. Use [`crate::SynchronizedHandler`] when invocations
/// must exclude each other.
pub struct PriorityHandler<T> {
    subscribers: SubscriberList<Callback<T>>,
}

impl<T> PriorityHandler<T> {
    pub fn new() -> Self {
        Self {
            subscribers: SubscriberList::new(),
        }
    }

    /// Registers a callback. Equal priorities run in registration order.
    pub fn subscribe<F>(&self, priority: Priority, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribers.insert(priority, Arc::new(callback))
    }

    /// Removes a callback. Returns true if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    /// Invokes all subscribers registered at the time of the call.
    ///
    /// Returns the number of callbacks run.
    pub fn invoke(&self, value: &T) -> usize {
        let subscribers = self.subscribers.snapshot();
        for subscriber in subscribers.iter() {
            (subscriber.callback)(value);
        }
        subscribers.len()
    }

    pub fn clear(&self) {
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<T> Default for PriorityHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PriorityHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityHandler")
            .field("subscribers", &self.subscribers)
            .finish()
    }
}
