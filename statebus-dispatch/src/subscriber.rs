//! Copy-on-write subscriber registry shared by all dispatch primitives.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Subscriber priority. Lower values run first.
pub type Priority = i32;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A registered callback.
pub struct Subscriber<F: ?Sized> {
    pub id: SubscriptionId,
    pub priority: Priority,
    pub callback: Arc<F>,
}

impl<F: ?Sized> Clone for Subscriber<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            priority: self.priority,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Subscribers sorted by (priority, registration order).
///
/// Writers replace the whole vector; readers take an `Arc` snapshot, so a
/// callback that unsubscribes itself mid-dispatch never disturbs the
/// iteration in progress.
pub struct SubscriberList<F: ?Sized> {
    entries: RwLock<Arc<Vec<Subscriber<F>>>>,
    next_id: AtomicU64,
}

impl<F: ?Sized> SubscriberList<F> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a callback after every subscriber with the same or lower priority.
    pub fn insert(&self, priority: Priority, callback: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write();
        let mut next: Vec<Subscriber<F>> = entries.iter().cloned().collect();
        let pos = next.partition_point(|s| s.priority <= priority);
        next.insert(
            pos,
            Subscriber {
                id,
                priority,
                callback,
            },
        );
        *entries = Arc::new(next);
        id
    }

    /// Removes a subscriber. Returns true if it was registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|s| s.id == id) {
            return false;
        }
        let next: Vec<Subscriber<F>> = entries.iter().filter(|s| s.id != id).cloned().collect();
        *entries = Arc::new(next);
        true
    }

    /// Returns the current ordered subscribers.
    pub fn snapshot(&self) -> Arc<Vec<Subscriber<F>>> {
        Arc::clone(&self.entries.read())
    }

    pub fn clear(&self) {
        *self.entries.write() = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<F: ?Sized> Default for SubscriberList<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for SubscriberList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.snapshot();
        f.debug_list()
            .entries(entries.iter().map(|s| (s.id, s.priority)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Cb = dyn Fn() -> u32 + Send + Sync;

    fn cb(n: u32) -> Arc<Cb> {
        Arc::new(move || n)
    }

    #[test]
    fn test_insert_keeps_priority_order() {
        let list: SubscriberList<Cb> = SubscriberList::new();
        list.insert(10, cb(10));
        list.insert(-5, cb(0));
        list.insert(3, cb(3));

        let order: Vec<u32> = list.snapshot().iter().map(|s| (s.callback)()).collect();
        assert_eq!(order, vec![0, 3, 10]);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let list: SubscriberList<Cb> = SubscriberList::new();
        list.insert(1, cb(1));
        list.insert(1, cb(2));
        list.insert(0, cb(0));
        list.insert(1, cb(3));

        let order: Vec<u32> = list.snapshot().iter().map(|s| (s.callback)()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_remove() {
        let list: SubscriberList<Cb> = SubscriberList::new();
        let a = list.insert(1, cb(1));
        let b = list.insert(2, cb(2));

        assert!(list.remove(a));
        assert!(!list.remove(a)); // Already removed
        assert_eq!(list.len(), 1);
        assert_eq!(list.snapshot()[0].id, b);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_writes() {
        let list: SubscriberList<Cb> = SubscriberList::new();
        let a = list.insert(1, cb(1));
        let snapshot = list.snapshot();

        list.remove(a);
        list.insert(0, cb(0));

        assert_eq!(snapshot.len(), 1);
        assert_eq!((snapshot[0].callback)(), 1);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_subscription_id_display() {
        let list: SubscriberList<Cb> = SubscriberList::new();
        let id = list.insert(0, cb(0));
        assert!(id.to_string().starts_with("sub-"));
    }
}
