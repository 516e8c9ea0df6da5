//! Bounded FIFO that evicts the oldest element on overflow instead of
//! blocking or rejecting (spec §4.4): freshness over completeness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct DroppingQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    dropped_count: AtomicU64,
}

impl<T> DroppingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        DroppingQueue {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Never blocks. If the queue is at capacity, discards the oldest
    /// element and counts the drop before appending `item`.
    pub fn put(&self, item: T) {
        {
            let mut queue = self.inner.lock().unwrap();
            if self.capacity > 0 && queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Awaits until the queue is non-empty, then pops the oldest element.
    pub async fn get(&self) -> T {
        loop {
            {
                let mut queue = self.inner.lock().unwrap();
                if let Some(item) = queue.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn reset_dropped_count(&self) -> u64 {
        self.dropped_count.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts_exactly() {
        let queue = DroppingQueue::new(4);
        for i in 0..10 {
            queue.put(i);
        }
        assert_eq!(queue.dropped_count(), 6);
        let mut remaining = Vec::new();
        while !queue.is_empty() {
            remaining.push(queue.get().await);
        }
        assert_eq!(remaining, vec![6, 7, 8, 9]);
    }

    #[test]
    fn reset_dropped_count_zeroes_and_returns_previous() {
        let queue = DroppingQueue::new(2);
        for i in 0..5 {
            queue.put(i);
        }
        assert_eq!(queue.reset_dropped_count(), 3);
        assert_eq!(queue.dropped_count(), 0);
    }

    #[tokio::test]
    async fn get_awaits_until_an_item_arrives() {
        let queue = Arc::new(DroppingQueue::new(8));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.put(42);
        let got = reader.await.unwrap();
        assert_eq!(got, 42);
    }
}
