//! End-to-end serialized async fan-out.

use crate::error::DispatchError;
use crate::subscriber::{Priority, SubscriberList, SubscriptionId};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type Callback<T> = dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync;

/// A queued invocation.
struct Job<T> {
    value: T,
    done: Option<oneshot::Sender<usize>>,
}

/// Serializes whole invocations.
///
/// Any number of callers may invoke concurrently. A single drain task runs
/// every subscriber of one invocation, in priority order and awaiting each,
/// before it starts on the next invocation. Subscribers of two invocations
/// therefore never interleave.
pub struct SequentialExecutor<T> {
    subscribers: Arc<SubscriberList<Callback<T>>>,
    tx: mpsc::UnboundedSender<Job<T>>,
    pending: Arc<AtomicUsize>,
}

impl<T> SequentialExecutor<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an executor whose drain task runs on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(&Handle::current())
    }

    /// Creates an executor whose drain task runs on the given runtime.
    pub fn with_handle(handle: &Handle) -> Self {
        let subscribers = Arc::new(SubscriberList::new());
        let pending = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        handle.spawn(drain(rx, subscribers.clone(), pending.clone()));

        Self {
            subscribers,
            tx,
            pending,
        }
    }

    /// Registers an async callback. Equal priorities run in registration order.
    pub fn subscribe<F, Fut>(&self, priority: Priority, callback: F) -> SubscriptionId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Arc<Callback<T>> = Arc::new(move |value| callback(value).boxed());
        self.subscribers.insert(priority, callback)
    }

    /// Removes a callback. Invocations already running keep their snapshot.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    /// Enqueues an invocation and waits until all of its subscribers finished.
    ///
    /// Returns the number of subscribers run.
    pub async fn invoke(&self, value: T) -> Result<usize, DispatchError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(Job {
            value,
            done: Some(done_tx),
        })?;
        done_rx.await.map_err(|_| DispatchError::Dropped)
    }

    /// Enqueues an invocation without waiting for it.
    pub fn dispatch(&self, value: T) -> Result<(), DispatchError> {
        self.enqueue(Job { value, done: None })
    }

    fn enqueue(&self, job: Job<T>) -> Result<(), DispatchError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            DispatchError::Closed
        })
    }

    /// Number of invocations queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<T> fmt::Debug for SequentialExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialExecutor")
            .field("subscribers", &self.subscribers)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

/// Single consumer: one invocation at a time, subscribers in order.
async fn drain<T>(
    mut rx: mpsc::UnboundedReceiver<Job<T>>,
    subscribers: Arc<SubscriberList<Callback<T>>>,
    pending: Arc<AtomicUsize>,
) where
    T: Clone + Send + 'static,
{
    while let Some(job) = rx.recv().await {
        let snapshot = subscribers.snapshot();
        for subscriber in snapshot.iter() {
            let fut = (subscriber.callback)(job.value.clone());
            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                tracing::error!("Subscriber {} panicked during sequential dispatch", subscriber.id);
            }
        }
        pending.fetch_sub(1, Ordering::SeqCst);
        if let Some(done) = job.done {
            let _ = done.send(snapshot.len());
        }
    }
    tracing::debug!("Sequential executor drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invoke_runs_in_priority_order() {
        let executor = SequentialExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for p in [3, 1, 2] {
            let log = log.clone();
            executor.subscribe(p, move |_: u32| {
                let log = log.clone();
                async move { log.lock().push(p) }
            });
        }

        assert_eq!(executor.invoke(7).await.unwrap(), 3);
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_invocations_never_interleave() {
        let executor = Arc::new(SequentialExecutor::new());
        let log = Arc::new(Mutex::new(Vec::<(u32, &'static str)>::new()));

        for p in 0..3 {
            let log = log.clone();
            executor.subscribe(p, move |inv: u32| {
                let log = log.clone();
                async move {
                    log.lock().push((inv, "start"));
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    tokio::task::yield_now().await;
                    log.lock().push((inv, "end"));
                }
            });
        }

        let mut handles = Vec::new();
        for inv in 0..8u32 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move { executor.invoke(inv).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 3);
        }

        // Each invocation contributes 6 consecutive entries
        let log = log.lock().clone();
        assert_eq!(log.len(), 8 * 6);
        for block in log.chunks(6) {
            let inv = block[0].0;
            assert!(block.iter().all(|(i, _)| *i == inv), "interleaved: {:?}", block);
        }
    }

    #[tokio::test]
    async fn test_dispatch_is_fifo() {
        let executor = SequentialExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = log.clone();
            executor.subscribe(0, move |v: u32| {
                let log = log.clone();
                async move { log.lock().push(v) }
            });
        }

        for v in 0..5 {
            executor.dispatch(v).unwrap();
        }
        // The awaited invocation is queued behind the dispatched ones
        executor.invoke(5).await.unwrap();

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_stop_drain() {
        let executor = SequentialExecutor::new();
        let count = Arc::new(Mutex::new(0));

        executor.subscribe(0, |v: u32| async move {
            if v == 1 {
                panic!("boom");
            }
        });
        {
            let count = count.clone();
            executor.subscribe(1, move |_: u32| {
                let count = count.clone();
                async move { *count.lock() += 1 }
            });
        }

        executor.invoke(1).await.unwrap();
        executor.invoke(2).await.unwrap();
        assert_eq!(*count.lock(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let executor = SequentialExecutor::new();
        let id = executor.subscribe(0, |_: ()| async {});
        assert_eq!(executor.len(), 1);
        assert!(executor.unsubscribe(id));
        assert!(executor.is_empty());
        assert_eq!(executor.invoke(()).await.unwrap(), 0);
    }
}
