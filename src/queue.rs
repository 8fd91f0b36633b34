//! Bounded-free MPMC FIFO with a blocking pop and a coarse lock-handoff API.
//!
//! The handoff API (`acquire_thread`/`unsafe_pop`/`unsafe_push`/`release_thread`)
//! exists so a caller (the work-stealer) can scan past several messages
//! without releasing the lock between operations. In Rust this needs no
//! `unsafe` at all: the "lock" is just a `MutexGuard` the caller holds across
//! several deque operations.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

pub struct ThreadQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> ThreadQueue<T> {
    pub fn new() -> Self {
        ThreadQueue {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue `item`, waking one waiter on `wait_pop`.
    pub fn push(&self, item: T) {
        let mut guard = self.inner.lock().expect("queue mutex poisoned");
        guard.push_back(item);
        self.not_empty.notify_one();
    }

    /// Block until the queue is non-empty, then pop the front item.
    pub fn wait_pop(&self) -> T {
        let mut guard = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = guard.pop_front() {
                return item;
            }
            guard = self
                .not_empty
                .wait(guard)
                .expect("queue condvar wait poisoned");
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().expect("queue mutex poisoned");
        guard.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the queue's lock for a handoff sequence of `unsafe_pop`/`unsafe_push`
    /// calls. The returned guard must be passed back into those calls and
    /// finally released with [`release_thread`](Self::release_thread).
    pub fn acquire_thread(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().expect("queue mutex poisoned")
    }

    pub fn unsafe_pop(&self, guard: &mut MutexGuard<'_, VecDeque<T>>) -> Option<T> {
        guard.pop_front()
    }

    pub fn unsafe_push(&self, guard: &mut MutexGuard<'_, VecDeque<T>>, item: T) {
        guard.push_back(item);
    }

    pub fn release_thread(&self, guard: MutexGuard<'_, VecDeque<T>>) {
        drop(guard);
        self.not_empty.notify_all();
    }
}

impl<T> Default for ThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
