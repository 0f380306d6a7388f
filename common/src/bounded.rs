//! Bounded FIFO queues
//!
//! `BoundedQueue` is the single fixed-capacity ring used by every buffer in
//! the pipeline. `SharedQueue` wraps it in one lock and two condition
//! variables for cross-thread hand-off.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Returned by a push into a full queue, handing the item back
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// Queue at capacity
    Full(T),
}

impl<T> PushError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) => item,
        }
    }
}

/// Fixed-capacity FIFO ring
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Append at the tail, or hand the item back when full
    pub fn try_push(&mut self, item: T) -> Result<(), PushError<T>> {
        if self.is_full() {
            return Err(PushError::Full(item));
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Append at the tail, evicting the oldest entry when full
    pub fn push_overwrite(&mut self, item: T) -> Option<T> {
        let evicted = if self.is_full() {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Return an entry to the head, ahead of everything queued
    pub fn push_front(&mut self, item: T) -> Result<(), PushError<T>> {
        if self.is_full() {
            return Err(PushError::Full(item));
        }
        self.items.push_front(item);
        Ok(())
    }

    /// Remove the oldest entry
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Oldest entry without removing it
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Lock + condition variable wrapper around `BoundedQueue`
#[derive(Debug)]
pub struct SharedQueue<T> {
    queue: Mutex<BoundedQueue<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    overwritten: AtomicU64,
}

impl<T> SharedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(BoundedQueue::new(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            overwritten: AtomicU64::new(0),
        }
    }

    /// Non-blocking push
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut queue = self.queue.lock();
        queue.try_push(item)?;
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, waiting at most `wait` for room; past that the oldest unread
    /// entry is overwritten and returned
    pub fn push_timeout(&self, item: T, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        let mut queue = self.queue.lock();
        while queue.is_full() {
            if self.not_full.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        let evicted = queue.push_overwrite(item);
        drop(queue);

        if evicted.is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.not_empty.notify_one();
        evicted
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<T> {
        let item = self.queue.lock().pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pop, blocking up to `wait` for an entry
    pub fn pop_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        let item = queue.pop();
        drop(queue);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Block up to `wait` until the queue holds something; returns whether it does
    pub fn wait_non_empty(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        !queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.lock().capacity()
    }

    /// Entries lost to overwrite-on-full
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    /// Wake every blocked producer and consumer
    pub fn notify_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
