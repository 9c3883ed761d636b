//! Bounded drop-oldest queue used for per-session frame and image buffering.
//!
//! Broadcasting clients produce in bursts; the consumer drains at display
//! cadence. The buffer absorbs bursts up to a fixed capacity, then discards
//! the oldest entries so a stalled consumer always resumes at the freshest
//! screen content instead of replaying stale history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A bounded FIFO shared between one producer path and one consumer path.
///
/// Pops never block; `recv()` is the async variant that waits for the next
/// entry without spinning. Clones share the same underlying queue.
#[derive(Clone)]
pub struct BoundedQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` entries.
    ///
    /// A zero capacity is rounded up to one -- a queue that can never hold an
    /// entry would silently discard everything.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append an entry, evicting the oldest if the queue is full.
    ///
    /// Returns the evicted entry, if any.
    pub fn push(&self, value: T) -> Option<T> {
        let evicted = {
            let mut queue = self.inner.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(value);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        // notify_one stores a permit if no task is waiting, so a push that
        // races a consumer between pop and await is never lost.
        self.notify.notify_one();
        evicted
    }

    /// Pop the oldest entry. Empty queues return `None` -- not an error.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Wait for the next entry.
    ///
    /// Cancellation-safe: dropping the future before it resolves leaves the
    /// queue untouched.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.pop() {
                return value;
            }
            self.notify.notified().await;
        }
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard all buffered entries.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Lock the queue and return the guard, for callers that must clear
    /// several queues without an observable intermediate state.
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, VecDeque<T>> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn push_pop_fifo_order() {
        let queue = BoundedQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = BoundedQueue::new(2);
        assert_eq!(queue.push(1), None);
        assert_eq!(queue.push(2), None);
        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn len_never_exceeds_capacity() {
        let queue = BoundedQueue::new(3);
        for i in 0..10 {
            queue.push(i);
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.dropped(), 7);
    }

    #[test]
    fn zero_capacity_rounds_up_to_one() {
        let queue = BoundedQueue::new(0);
        queue.push(7);
        assert_eq!(queue.pop(), Some(7));
    }

    #[test]
    fn clear_discards_everything() {
        let queue = BoundedQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn clones_share_the_queue() {
        let a = BoundedQueue::new(4);
        let b = a.clone();
        a.push(42);
        assert_eq!(b.pop(), Some(42));
    }

    #[tokio::test]
    async fn recv_returns_buffered_entry_immediately() {
        let queue = BoundedQueue::new(4);
        queue.push(5);
        assert_eq!(queue.recv().await, 5);
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let queue = BoundedQueue::new(4);
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(9);

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("recv should wake on push")
            .unwrap();
        assert_eq!(got, 9);
    }

    #[tokio::test]
    async fn push_before_recv_is_not_lost() {
        // The permit stored by notify_one must survive the gap between the
        // producer's push and the consumer's first await.
        let queue = BoundedQueue::new(4);
        queue.push(1);
        let got = tokio::time::timeout(Duration::from_millis(100), queue.recv())
            .await
            .expect("buffered entry should be delivered without a second push");
        assert_eq!(got, 1);
    }
}
