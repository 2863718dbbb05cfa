//! Rate-limited, deduplicating work queue
//!
//! FIFO of reconciliation items with the semantics controller workers rely
//! on:
//!
//! - adding an item equal to one already queued is a no-op
//! - an item re-added while in flight is re-queued when [`WorkQueue::done`]
//!   is called, never handed to a second worker concurrently
//! - failed items come back through [`WorkQueue::requeue_with_backoff`] on a
//!   per-item exponential schedule, reset by [`WorkQueue::forget`]
//! - [`WorkQueue::shutdown`] rejects further adds, drains what is queued and
//!   then returns `None` from [`WorkQueue::get`]

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// First retry delay for a failing item.
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Cap on the exponential retry delay.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// A deduplicating FIFO with per-item in-flight exclusion and exponential
/// retry backoff. Clones share the same queue.
///
/// `T` is the full work item; deduplication and exclusion are keyed on the
/// whole value, so e.g. an `update` and a `delete` event for the same
/// resource coexist in the queue and drain in enqueue order.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
    base_delay: Duration,
    max_delay: Duration,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

struct Inner<T> {
    queue: VecDeque<T>,
    /// Items wanting processing: queued, or re-added while in flight.
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    /// Consecutive requeue count per item, cleared by `forget`.
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
            base_delay,
            max_delay,
        }
    }

    /// Enqueue an item. No-op if the queue is shutting down or an equal item
    /// is already waiting. If an equal item is in flight the add is deferred
    /// until its `done`.
    pub fn add(&self, item: T) {
        self.shared.add(item);
    }

    /// Wait for the next item. Returns `None` once the queue has shut down
    /// and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register for a wake-up before re-checking state, so an add
            // racing with the check is not missed.
            notified.as_mut().enable();
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark an item returned by `get` as finished. If the item was re-added
    /// while in flight it goes back on the queue now.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.processing.remove(item);
            if inner.dirty.contains(item) {
                inner.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    /// Drop the retry state for an item that finished cleanly (or that is
    /// malformed and must not come back).
    pub fn forget(&self, item: &T) {
        self.shared.inner.lock().unwrap().failures.remove(item);
    }

    /// Re-enqueue a failed item after an exponential per-item delay.
    pub fn requeue_with_backoff(&self, item: T) {
        let delay = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            let n = *inner
                .failures
                .entry(item.clone())
                .and_modify(|n| *n += 1)
                .or_insert(1);
            // 2^exp saturates well past max_delay; clamp the exponent so the
            // f64 math stays finite.
            let exp = (n - 1).min(64);
            self.base_delay
                .mul_f64(2f64.powi(exp as i32))
                .min(self.max_delay)
        };
        debug!(
            delay_ms = delay.as_millis() as u64,
            "requeueing item with backoff"
        );
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.add(item);
        });
    }

    /// Number of consecutive requeues recorded for an item.
    pub fn requeues(&self, item: &T) -> u32 {
        self.shared
            .inner
            .lock()
            .unwrap()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Reject further adds; queued items drain, then `get` returns `None`.
    pub fn shutdown(&self) {
        self.shared.inner.lock().unwrap().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Shared<T>
where
    T: Clone + Eq + Hash,
{
    fn add(&self, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            if !inner.dirty.insert(item.clone()) {
                return;
            }
            if inner.processing.contains(&item) {
                return;
            }
            inner.queue.push_back(item);
        }
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo_order() {
        let q: WorkQueue<&str> = WorkQueue::new();
        q.add("a");
        q.add("b");
        q.add("c");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert_eq!(q.get().await, Some("c"));
    }

    #[tokio::test]
    async fn test_dedup_while_queued() {
        let q: WorkQueue<&str> = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_items_for_same_key_coexist() {
        // Tuple items dedup on the full value, so (key, update) and
        // (key, delete) both queue and drain in order.
        let q: WorkQueue<(&str, &str)> = WorkQueue::new();
        q.add(("ns/app", "update"));
        q.add(("ns/app", "delete"));
        q.add(("ns/app", "update"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(("ns/app", "update")));
        assert_eq!(q.get().await, Some(("ns/app", "delete")));
    }

    #[tokio::test]
    async fn test_in_flight_item_not_delivered_twice() {
        let q: WorkQueue<&str> = WorkQueue::new();
        q.add("a");
        let item = q.get().await.unwrap();
        assert_eq!(item, "a");

        // Re-added while in flight: must not be handed out until done.
        q.add("a");
        assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());

        q.done(&item);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_done_without_pending_add_does_not_requeue() {
        let q: WorkQueue<&str> = WorkQueue::new();
        q.add("a");
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
        assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());
    }

    #[tokio::test]
    async fn test_requeue_with_backoff_redelivers() {
        let q: WorkQueue<&str> =
            WorkQueue::with_backoff(Duration::from_millis(1), Duration::from_millis(20));
        q.add("a");
        let item = q.get().await.unwrap();
        q.requeue_with_backoff(item);
        q.done(&item);

        let redelivered = timeout(Duration::from_secs(2), q.get()).await;
        assert_eq!(redelivered.unwrap(), Some("a"));
        assert_eq!(q.requeues(&"a"), 1);
    }

    #[tokio::test]
    async fn test_forget_resets_backoff() {
        let q: WorkQueue<&str> =
            WorkQueue::with_backoff(Duration::from_millis(1), Duration::from_millis(20));
        q.add("a");
        let item = q.get().await.unwrap();
        q.requeue_with_backoff(item);
        assert_eq!(q.requeues(&"a"), 1);
        q.forget(&item);
        assert_eq!(q.requeues(&"a"), 0);
        q.done(&item);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_adds_and_drains() {
        let q: WorkQueue<&str> = WorkQueue::new();
        q.add("a");
        q.shutdown();
        q.add("b");

        // Queued item drains before the shutdown signal.
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_workers() {
        let q: WorkQueue<&str> = WorkQueue::new();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        // Give the worker time to block on the empty queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();
        assert_eq!(worker.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_workers_never_overlap_on_same_item() {
        let q: WorkQueue<&str> = WorkQueue::new();
        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            workers.push(tokio::spawn(async move {
                while let Some(item) = q.get().await {
                    let n = in_flight.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    max_seen.fetch_max(n, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    q.done(&item);
                }
            }));
        }

        for _ in 0..20 {
            q.add("same-key");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        q.shutdown();
        for w in workers {
            w.await.unwrap();
        }

        // Only one worker at a time ever held the (single) item.
        assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
