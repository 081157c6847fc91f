//! Bounded, non-blocking, drop-oldest queue used between pipeline stages.
//!
//! `push` never waits. When the queue is full the oldest item that is not
//! protected is evicted; protected items (critical alerts) are never evicted,
//! so a queue holding only protected items grows past its capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Outcome of a push.
#[derive(Debug, PartialEq, Eq)]
pub enum Pushed<T> {
    /// Stored without eviction
    Queued,
    /// Stored; the returned item was evicted to make room
    Evicted(T),
    /// Not stored: the queue is full of protected items or closed
    Rejected(T),
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Single-consumer drop-oldest queue.
pub struct DropOldestQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    protect: fn(&T) -> bool,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    /// Create a queue where every item may be evicted.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_protection(capacity, |_| false)
    }

    /// Create a queue whose `protect`ed items are never evicted.
    #[must_use]
    pub fn with_protection(capacity: usize, protect: fn(&T) -> bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            protect,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking.
    pub fn push(&self, item: T) -> Pushed<T> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return Pushed::Rejected(item);
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                Pushed::Queued
            } else if let Some(pos) = inner.items.iter().position(|i| !(self.protect)(i)) {
                let evicted = inner.items.remove(pos);
                inner.items.push_back(item);
                match evicted {
                    Some(evicted) => Pushed::Evicted(evicted),
                    None => Pushed::Queued,
                }
            } else if (self.protect)(&item) {
                inner.items.push_back(item);
                Pushed::Queued
            } else {
                Pushed::Rejected(item)
            }
        };

        match &outcome {
            Pushed::Queued => self.notify.notify_one(),
            Pushed::Evicted(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            Pushed::Rejected(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Wait for the next item. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take an item if one is ready.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Stop accepting items; the consumer drains what is left.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted or rejected since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drops_oldest_when_full() {
        let queue = DropOldestQueue::new(2);
        assert_eq!(queue.push(1), Pushed::Queued);
        assert_eq!(queue.push(2), Pushed::Queued);
        assert_eq!(queue.push(3), Pushed::Evicted(1));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_protected_items_survive() {
        // Negative numbers stand in for critical items.
        let queue = DropOldestQueue::with_protection(2, |i: &i32| *i < 0);
        queue.push(-1);
        queue.push(2);
        assert_eq!(queue.push(3), Pushed::Evicted(2));
        assert_eq!(queue.push(-4), Pushed::Evicted(3));

        // Full of protected items: more protected items still get in.
        assert_eq!(queue.push(-5), Pushed::Queued);
        assert_eq!(queue.len(), 3);
        // ...but unprotected ones are turned away.
        assert_eq!(queue.push(6), Pushed::Rejected(6));

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![-1, -4, -5]);
    }

    #[tokio::test]
    async fn test_pop_waits_and_close_drains() {
        let queue = Arc::new(DropOldestQueue::new(8));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop().await {
                    seen.push(item);
                }
                seen
            })
        };

        for i in 0..5 {
            queue.push(i);
            tokio::task::yield_now().await;
        }
        queue.close();
        assert_eq!(queue.push(99), Pushed::Rejected(99));

        let seen = consumer.await.unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
