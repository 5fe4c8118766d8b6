//! Per-worker work queue: a mutex-protected FIFO of [`Payload`]s with a
//! condition variable and a terminal `done` flag.
//!
//! This favors a plain `Mutex` over a lock-free deque because `try_push`/
//! `try_pop` need *try-lock* semantics (an attempt that can fail under
//! contention and leaves the payload with the caller), which a wait-free
//! deque doesn't model the same way. See DESIGN.md for the full writeup.

use crate::payload::Payload;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner {
    queue: VecDeque<Payload>,
    done: bool,
}

/// A single worker's FIFO. Producers (the pool's `submit`, or other workers
/// during a future retry) and the owning worker share it through an `Arc`.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                done: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `payload`, blocking until the lock is free. Wakes one waiter.
    pub fn push(&self, payload: Payload) {
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.queue.push_back(payload);
        self.not_empty.notify_one();
    }

    /// Attempts to append `*payload` without blocking.
    ///
    /// On success, `*payload` is left empty (its contents moved into the
    /// queue) and `true` is returned. On failure (the lock is contended),
    /// `*payload` is left untouched and `false` is returned, so a caller
    /// retrying against the next queue in a round-robin scan doesn't need
    /// to reconstruct anything. This by-reference, non-consuming-on-failure
    /// shape is intentional and must not be "simplified" into a by-value
    /// `Option<Payload>` return.
    pub fn try_push(&self, payload: &mut Payload) -> bool {
        match self.inner.try_lock() {
            Ok(mut inner) => {
                inner.queue.push_back(std::mem::take(payload));
                self.not_empty.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    /// Blocks until the queue is non-empty or `done()` has been called and
    /// the queue has drained, returning `None` in the latter case.
    pub fn pop(&self) -> Option<Payload> {
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        loop {
            if let Some(payload) = inner.queue.pop_front() {
                return Some(payload);
            }
            if inner.done {
                return None;
            }
            inner = self
                .not_empty
                .wait(inner)
                .expect("work queue condvar poisoned");
        }
    }

    /// Attempts to pop without blocking. Returns `None` on contention or if
    /// the queue happens to be empty at the moment the lock is taken.
    pub fn try_pop(&self) -> Option<Payload> {
        let mut inner = self.inner.try_lock().ok()?;
        inner.queue.pop_front()
    }

    /// Marks the queue terminal and wakes every blocked `pop`. Idempotent;
    /// once set, stays set. Items enqueued before this call are still
    /// delivered by `try_pop`/`pop` until the queue drains.
    pub fn done(&self) {
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.done = true;
        self.not_empty.notify_all();
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn push_then_pop_is_fifo() {
        let q = WorkQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            q.push(Payload::new(move || order.lock().unwrap().push(i)).unwrap());
        }
        for _ in 0..3 {
            q.pop().unwrap().call();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn try_push_leaves_payload_on_failed_lock() {
        let q = WorkQueue::new();
        // Hold the lock on another thread to force try_lock to fail.
        let guard = q.inner.lock().unwrap();
        let mut payload = Payload::new(|| {}).unwrap();
        assert!(!q.try_push(&mut payload));
        assert!(!payload.is_empty());
        drop(guard);
        assert!(q.try_push(&mut payload));
        assert!(payload.is_empty());
    }

    #[test]
    fn try_pop_on_empty_queue_returns_none() {
        let q = WorkQueue::new();
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn pop_after_done_drains_then_returns_none() {
        let q = WorkQueue::new();
        q.push(Payload::new(|| {}).unwrap());
        q.done();
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }

    /// Test: a blocked `pop` wakes once another thread pushes.
    /// Validates: the condvar wiring, not just the non-blocking paths.
    #[test]
    fn blocked_pop_wakes_on_push() {
        let q = Arc::new(WorkQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let q2 = Arc::clone(&q);
        let ran2 = Arc::clone(&ran);
        let handle = std::thread::spawn(move || {
            q2.pop().unwrap().call();
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.push(Payload::new(|| {}).unwrap());
        handle.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocked_pop_returns_none_on_done_with_empty_queue() {
        let q = Arc::new(WorkQueue::new());
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.pop());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.done();
        assert!(handle.join().unwrap().is_none());
    }
}
