//! Bounded forwarding queue between a connection's bus-receive task and its
//! socket-write task.
//!
//! When the viewer falls behind and the queue is full, the oldest queued
//! message is evicted to make room. The producer never waits on the socket.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Single-producer, single-consumer queue with a drop-oldest overflow policy
pub struct ForwardQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    notify: Notify,
    dropped: AtomicU64,
}

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Queued after evicting the oldest message
    Evicted,
    /// Queue closed, message discarded
    Closed,
}

impl<T> ForwardQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> Pushed {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Pushed::Closed;
            }

            let mut outcome = Pushed::Queued;
            while inner.items.len() >= self.capacity {
                inner.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                outcome = Pushed::Evicted;
            }
            inner.items.push_back(item);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Next message in arrival order. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting messages; already queued ones can still be popped.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
