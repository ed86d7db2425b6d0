//! Bounded hand-off between the capture task and the analysis loop.
//!
//! The channel favours recency: when it is full, `put` discards the oldest
//! held item to make room. Neither side ever blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Why the producer side stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// Producer shut down on request.
    Finished,
    /// Producer lost its source and gave up.
    Failed(String),
}

struct Slots<T> {
    queue: VecDeque<T>,
    closure: Option<Closure>,
}

pub struct FrameChannel<T> {
    slots: Mutex<Slots<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> FrameChannel<T> {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                queue: VecDeque::with_capacity(capacity),
                closure: None,
            }),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        // The critical sections never panic midway, so a poisoned lock still
        // holds a consistent queue.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `item`, evicting the oldest held item if the channel is full.
    ///
    /// Returns `true` when an older item was discarded. Items offered after
    /// `close` are dropped.
    pub fn put(&self, item: T) -> bool {
        let mut slots = self.lock();
        if slots.closure.is_some() {
            debug!("channel closed, discarding item");
            return false;
        }
        let mut displaced = false;
        while slots.queue.len() >= self.capacity {
            slots.queue.pop_front();
            displaced = true;
        }
        slots.queue.push_back(item);
        drop(slots);

        if displaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        displaced
    }

    /// Remove and return the oldest held item, or `None` if the channel is empty.
    pub fn take_nonblocking(&self) -> Option<T> {
        self.lock().queue.pop_front()
    }

    /// Mark the producer side as finished. The first closure reason wins.
    pub fn close(&self, closure: Closure) {
        let mut slots = self.lock();
        if slots.closure.is_none() {
            slots.closure = Some(closure);
        }
    }

    pub fn closure(&self) -> Option<Closure> {
        self.lock().closure.clone()
    }

    /// Discard anything still held.
    pub fn clear(&self) -> usize {
        let mut slots = self.lock();
        let n = slots.queue.len();
        slots.queue.clear();
        n
    }

    /// Total items discarded by overwrite since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
