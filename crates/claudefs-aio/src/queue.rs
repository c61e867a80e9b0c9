//! Bounded hand-off queue between the harvest and dispatch threads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// MPMC FIFO with advisory capacity.
///
/// [`offer`](Self::offer) never blocks: when the queue is at capacity the
/// item is handed back so the producer can deal with it inline.
/// [`take`](Self::take) waits up to a deadline for the first item and then
/// drains a batch.
pub struct HandoffQueue<T> {
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> HandoffQueue<T> {
    /// Creates an empty queue.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        debug!("hand-off queue {} created, capacity {}", name, capacity);
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `item`, or returns it back if the queue is full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            trace!("queue {} full at {}", self.name, items.len());
            return Err(item);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Drains up to `max` items in FIFO order.
    ///
    /// Waits up to `timeout` if the queue is empty; returns an empty batch if
    /// nothing arrived by then.
    pub fn take(&self, max: usize, timeout: Duration) -> Vec<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();

        while items.is_empty() {
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                if items.is_empty() {
                    trace!("queue {} idle for {:?}", self.name, timeout);
                    return Vec::new();
                }
                break;
            }
        }

        let count = max.min(items.len());
        items.drain(..count).collect()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Advisory capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_offer_full_returns_item() {
        let queue = HandoffQueue::new("test", 2);
        assert!(queue.offer(1).is_ok());
        assert!(queue.offer(2).is_ok());
        assert_eq!(queue.offer(3), Err(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_take_preserves_order() {
        let queue = HandoffQueue::new("test", 16);
        for i in 0..5 {
            queue.offer(i).unwrap();
        }
        let batch = queue.take(64, Duration::from_millis(10));
        assert_eq!(batch, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_respects_max() {
        let queue = HandoffQueue::new("test", 16);
        for i in 0..10 {
            queue.offer(i).unwrap();
        }
        assert_eq!(queue.take(4, Duration::from_millis(10)), vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 6);
        assert_eq!(
            queue.take(64, Duration::from_millis(10)),
            vec![4, 5, 6, 7, 8, 9]
        );
    }

    #[test]
    fn test_take_empty_times_out() {
        let queue: HandoffQueue<u32> = HandoffQueue::new("test", 4);
        let timeout = Duration::from_millis(150);
        let start = Instant::now();
        let batch = queue.take(8, timeout);
        assert!(batch.is_empty());
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_take_wakes_on_offer() {
        let queue = Arc::new(HandoffQueue::new("test", 4));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.offer(7u32).unwrap();
            })
        };
        let start = Instant::now();
        let batch = queue.take(8, Duration::from_secs(5));
        assert_eq!(batch, vec![7]);
        assert!(start.elapsed() < Duration::from_secs(5));
        producer.join().unwrap();
    }

    #[test]
    fn test_offer_after_drain_accepted() {
        let queue = HandoffQueue::new("test", 1);
        queue.offer(1).unwrap();
        assert_eq!(queue.offer(2), Err(2));
        queue.take(1, Duration::from_millis(1));
        assert!(queue.offer(2).is_ok());
    }
}
