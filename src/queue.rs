//! Bounded single-producer/single-consumer handoff with lifecycle gates.
//!
//! Capacity is rounded up to a power of two. `startup()` opens the queue and
//! `shutdown()` releases any blocked producer; after shutdown every
//! operation fails until the next `startup()`, so workers draining a dead
//! queue fall through instead of hanging.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct Inner<T> {
    buf: VecDeque<T>,
    open: bool,
}

pub struct SpscQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    capacity: usize,
}

impl<T: Copy> SpscQueue<T> {
    /// Create a closed queue; call `startup()` before use.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                open: false,
            }),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open the queue, discarding anything left from a previous run.
    pub fn startup(&self) {
        let mut g = self.inner.lock();
        g.buf.clear();
        g.open = true;
    }

    /// Close the queue, dropping its contents and releasing any blocked
    /// producer.
    pub fn shutdown(&self) {
        let mut g = self.inner.lock();
        g.open = false;
        g.buf.clear();
        self.not_full.notify_all();
    }

    /// Append an element, blocking while the queue is full. Returns false
    /// if the queue is (or becomes) shut down.
    pub fn push(&self, value: T) -> bool {
        let mut g = self.inner.lock();
        loop {
            if !g.open {
                return false;
            }
            if g.buf.len() < self.capacity {
                g.buf.push_back(value);
                return true;
            }
            self.not_full.wait(&mut g);
        }
    }

    /// Remove and return the head, if any. Never blocks.
    pub fn try_pop(&self) -> Option<T> {
        let mut g = self.inner.lock();
        if !g.open {
            return None;
        }
        let v = g.buf.pop_front();
        if v.is_some() {
            self.not_full.notify_one();
        }
        v
    }

    /// Return the head without consuming it.
    pub fn peek(&self) -> Option<T> {
        let g = self.inner.lock();
        if !g.open {
            return None;
        }
        g.buf.front().copied()
    }

    /// Approximate depth, for metrics only.
    pub fn guess_size(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guess_size() == 0
    }
}
