//! The process-wide main-thread queue and the main-thread scheduler built on
//! top of it.
//!
//! The queue itself is a lazily-initialized `'static` via `once_cell::sync`,
//! for "construct before any main-thread scheduler, never destroyed" global
//! state. It is never waited on: an external event loop is assumed to
//! already have its own loop, and pushing onto this queue must never stall it.

use crate::alloc::{Global, TaskAllocator};
use crate::error::SubmitError;
use crate::payload::Payload;
use crate::scheduler::Scheduler;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A process-wide FIFO of payloads, read only by whatever drives the main
/// thread's event loop.
pub struct MainThreadQueue {
    inner: Mutex<VecDeque<Payload>>,
}

impl MainThreadQueue {
    /// Appends `payload`. Never blocks on emptiness (there is nothing to
    /// wait for; only `try_pop` observes the queue).
    pub fn push(&self, payload: Payload) {
        self.inner
            .lock()
            .expect("main thread queue mutex poisoned")
            .push_back(payload);
    }

    /// Pops the oldest payload, if any, without blocking.
    pub fn try_pop(&self) -> Option<Payload> {
        self.inner
            .lock()
            .expect("main thread queue mutex poisoned")
            .pop_front()
    }

    /// Drops every pending payload without invoking them. Called from a
    /// [`MainThreadScheduler`]'s destructor, since an external event loop
    /// may never get around to delivering them once the scheduler that
    /// pushed them is gone.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("main thread queue mutex poisoned")
            .clear();
    }
}

static MAIN_THREAD_QUEUE: Lazy<MainThreadQueue> = Lazy::new(|| MainThreadQueue {
    inner: Mutex::new(VecDeque::new()),
});

/// The single process-wide main-thread queue. Outlives every
/// [`MainThreadScheduler`] that references it.
pub fn main_thread_queue() -> &'static MainThreadQueue {
    &MAIN_THREAD_QUEUE
}

/// Pops and invokes at most one pending payload. Intended to be called by
/// the trampoline a platform's main-thread signal wakes: for every
/// successful push there is at least one corresponding delivery attempt
/// that calls `try_pop` exactly once and, on success, invokes the popped
/// payload on the main thread. Returns whether a payload was found and run.
///
/// # Panics
///
/// Panics if a popped payload's closure panics. This function must itself
/// be called from the main thread, and a panicking task is not this
/// function's responsibility to firewall.
pub fn drive_main_thread_queue() -> bool {
    match main_thread_queue().try_pop() {
        Some(payload) => {
            payload.call();
            true
        }
        None => false,
    }
}

/// A submit-only scheduler that hands work to the main-thread queue and
/// signals an external event loop once per successful push.
///
/// On `Drop`, unregisters from the event loop (if an unregister hook was
/// given) and clears the main-thread queue of anything this scheduler may
/// have pushed but that will now never be delivered.
pub struct MainThreadScheduler {
    signal: Box<dyn Fn() + Send + Sync>,
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl MainThreadScheduler {
    /// `signal` is called exactly once per successful `submit`, and should
    /// cause the host event loop to eventually call
    /// [`drive_main_thread_queue`] on the main thread.
    pub fn new(signal: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            signal: Box::new(signal),
            unregister: None,
        }
    }

    /// As [`MainThreadScheduler::new`], but also runs `unregister` once,
    /// before clearing the queue, when this scheduler is dropped.
    pub fn with_unregister(
        signal: impl Fn() + Send + Sync + 'static,
        unregister: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            signal: Box::new(signal),
            unregister: Some(Box::new(unregister)),
        }
    }
}

impl Scheduler for MainThreadScheduler {
    const AVAILABLE: bool = true;

    fn submit<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_in(Global, f)
    }

    fn submit_in<A, F>(&self, alloc: A, f: F) -> Result<(), SubmitError>
    where
        A: TaskAllocator,
        F: FnOnce() + Send + 'static,
    {
        let payload = Payload::new_in(alloc, f)?;
        main_thread_queue().push(payload);
        (self.signal)();
        Ok(())
    }
}

impl Drop for MainThreadScheduler {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
        main_thread_queue().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAllocator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // These tests share the process-wide queue singleton, so they must not
    // run concurrently with each other within this process.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn submit_in_uses_the_given_allocator() {
        let _guard = TEST_LOCK.lock().unwrap();
        while drive_main_thread_queue() {}

        let alloc = CountingAllocator::new();
        let scheduler = MainThreadScheduler::new(|| {});
        let big = [0u8; 400];
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        scheduler
            .submit_in(alloc.clone(), move || {
                let _ = big.len();
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(alloc.allocations_outstanding(), 1);
        assert!(drive_main_thread_queue());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(alloc.bytes_outstanding(), 0);
    }

    /// Test: push three payloads while the event loop is idle, drive it
    /// three times, observe three invocations in FIFO order.
    #[test]
    fn fifo_delivery_across_drive_calls() {
        let _guard = TEST_LOCK.lock().unwrap();
        // Drain any stragglers from a previous test before asserting order.
        while drive_main_thread_queue() {}

        let signal_count = Arc::new(AtomicUsize::new(0));
        let sc = Arc::clone(&signal_count);
        let scheduler = MainThreadScheduler::new(move || {
            sc.fetch_add(1, Ordering::SeqCst);
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            scheduler.submit(move || order.lock().unwrap().push(i)).unwrap();
        }
        assert_eq!(signal_count.load(Ordering::SeqCst), 3);

        assert!(drive_main_thread_queue());
        assert!(drive_main_thread_queue());
        assert!(drive_main_thread_queue());
        assert!(!drive_main_thread_queue());

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn drop_clears_undelivered_payloads() {
        let _guard = TEST_LOCK.lock().unwrap();
        while drive_main_thread_queue() {}

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = MainThreadScheduler::new(|| {});
            let r = Arc::clone(&ran);
            scheduler
                .submit(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            // Dropped here without ever driving the queue.
        }
        assert!(!drive_main_thread_queue());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_runs_unregister_hook() {
        let _guard = TEST_LOCK.lock().unwrap();
        let unregistered = Arc::new(AtomicUsize::new(0));
        let u = Arc::clone(&unregistered);
        let scheduler = MainThreadScheduler::with_unregister(|| {}, move || {
            u.fetch_add(1, Ordering::SeqCst);
        });
        drop(scheduler);
        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
    }
}
