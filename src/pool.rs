//! The background thread pool: `N` worker threads, each backed by its own
//! [`WorkQueue`], submitting via round-robin-plus-try-push and working via a
//! bounded steal loop before blocking on its own queue.
//!
//! Architecturally this is a fixed worker-thread pool, each thread running
//! "try to find work across every queue, then block" over a mutex/condvar
//! [`WorkQueue`] rather than a lock-free deque; see DESIGN.md for why.

use crate::alloc::{Global, TaskAllocator};
use crate::error::{PoolBuildError, SubmitError};
use crate::payload::Payload;
use crate::queue::WorkQueue;
use crate::scheduler::Scheduler;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Default number of non-blocking steal rounds a worker makes over every
/// queue before falling back to a blocking pop on its own.
pub const DEFAULT_STEAL_ROUNDS: usize = 8;

/// Adapts each worker thread before its body runs, e.g. to attach it to a
/// host-language runtime. `queue` is the worker's own queue, handed to the
/// factory for bookkeeping/logging; the factory isn't required to use it.
pub trait ThreadFactory: Send + Sync {
    fn spawn(
        &self,
        index: usize,
        queue: Arc<WorkQueue>,
        worker_fn: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

/// Spawns a plain OS thread named `schedulers-worker-{index}`.
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(
        &self,
        index: usize,
        _queue: Arc<WorkQueue>,
        worker_fn: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("schedulers-worker-{index}"))
            .spawn(worker_fn)
    }
}

/// Configuration for a [`ThreadPool`].
pub struct PoolBuilder {
    num_threads: usize,
    thread_factory: Box<dyn ThreadFactory>,
    steal_rounds: usize,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get().max(1),
            thread_factory: Box::new(DefaultThreadFactory),
            steal_rounds: DEFAULT_STEAL_ROUNDS,
        }
    }
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamped to at least 1.
    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n.max(1);
        self
    }

    pub fn thread_factory(mut self, factory: impl ThreadFactory + 'static) -> Self {
        self.thread_factory = Box::new(factory);
        self
    }

    /// Clamped to at least 1.
    pub fn steal_rounds(mut self, rounds: usize) -> Self {
        self.steal_rounds = rounds.max(1);
        self
    }

    pub fn build(self) -> Result<ThreadPool, PoolBuildError> {
        ThreadPool::from_builder(self)
    }
}

/// A fixed-size pool of worker threads sharing no state but their queues.
///
/// `N` is set once at construction and never changes. The destructor joins
/// every worker thread; it must not be invoked from a thread owned by the
/// pool itself (that deadlocks: the thread would wait to join itself).
pub struct ThreadPool {
    queues: Vec<Arc<WorkQueue>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl ThreadPool {
    /// Builds a pool with `num_threads` workers and the default thread factory.
    pub fn new(num_threads: usize) -> Result<Self, PoolBuildError> {
        PoolBuilder::new().num_threads(num_threads).build()
    }

    fn from_builder(builder: PoolBuilder) -> Result<Self, PoolBuildError> {
        let n = builder.num_threads.max(1);
        let queues: Vec<Arc<WorkQueue>> = (0..n).map(|_| Arc::new(WorkQueue::new())).collect();
        let steal_rounds = builder.steal_rounds;
        let mut handles = Vec::with_capacity(n);

        for i in 0..n {
            let worker_queues = queues.clone();
            let worker_fn: Box<dyn FnOnce() + Send + 'static> =
                Box::new(move || worker_loop(i, worker_queues, steal_rounds));
            match builder
                .thread_factory
                .spawn(i, Arc::clone(&queues[i]), worker_fn)
            {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    log::error!("thread factory failed to start worker {i}: {source}");
                    for q in &queues {
                        q.done();
                    }
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(PoolBuildError::ThreadSpawnFailed { index: i, source });
                }
            }
        }

        log::debug!("thread pool started with {n} workers");
        Ok(Self {
            queues,
            handles,
            next: AtomicUsize::new(0),
        })
    }

    /// Number of worker threads (fixed for the pool's lifetime).
    pub fn num_threads(&self) -> usize {
        self.queues.len()
    }

    /// Wraps `f` with the global allocator and submits it.
    pub fn submit<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_in(Global, f)
    }

    /// Wraps `f` with `alloc` and submits it.
    ///
    /// Reads-and-increments the round-robin counter, then attempts a
    /// non-blocking push on each of the `N` queues starting there; if every
    /// attempt is contended, falls back to a blocking push on the starting
    /// queue (guaranteeing liveness).
    pub fn submit_in<A, F>(&self, alloc: A, f: F) -> Result<(), SubmitError>
    where
        A: TaskAllocator,
        F: FnOnce() + Send + 'static,
    {
        let mut payload = Payload::new_in(alloc, f)?;
        let n = self.queues.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;

        for k in 0..n {
            let idx = (start + k) % n;
            if self.queues[idx].try_push(&mut payload) {
                return Ok(());
            }
        }
        self.queues[start].push(payload);
        Ok(())
    }
}

impl Scheduler for ThreadPool {
    const AVAILABLE: bool = true;

    fn submit<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        ThreadPool::submit(self, f)
    }

    fn submit_in<A, F>(&self, alloc: A, f: F) -> Result<(), SubmitError>
    where
        A: TaskAllocator,
        F: FnOnce() + Send + 'static,
    {
        ThreadPool::submit_in(self, alloc, f)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        log::debug!("thread pool shutting down ({} workers)", self.queues.len());
        for q in &self.queues {
            q.done();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(index: usize, queues: Vec<Arc<WorkQueue>>, steal_rounds: usize) {
    log::trace!("worker {index} starting");
    let n = queues.len();

    'outer: loop {
        let mut found: Option<Payload> = None;

        'steal: for _round in 0..steal_rounds {
            for j in 0..n {
                let idx = (index + j) % n;
                if let Some(payload) = queues[idx].try_pop() {
                    found = Some(payload);
                    break 'steal;
                }
            }
        }

        let payload = match found {
            Some(payload) => payload,
            None => match queues[index].pop() {
                Some(payload) => payload,
                None => break 'outer,
            },
        };

        payload.call();
    }

    log::trace!("worker {index} exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    /// Test: 1,000 submissions to a 4-worker pool each increment a shared
    /// atomic exactly once; after teardown the counter equals 1,000. No
    /// double-consumption, no leak.
    #[test]
    fn thousand_tasks_all_run_exactly_once() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    /// Test: enqueue a large batch then destroy the pool immediately.
    /// Validates bounded-time teardown: all threads joined, no hang, no
    /// matter how many tasks are still in flight.
    #[test]
    fn large_batch_then_immediate_teardown_terminates() {
        let pool = ThreadPool::new(num_cpus::get().max(2) - 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100_000 {
            let c = Arc::clone(&counter);
            let _ = pool.submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        drop(pool);
        // No assertion on the final count: tasks may be destroyed without
        // running at teardown. The property under test is that `drop` above
        // returned (joined every worker).
    }

    #[test]
    fn self_submission_from_a_worker_is_not_deadlocking() {
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let pool2 = Arc::clone(&pool);
        let c2 = Arc::clone(&counter);
        let barrier = Arc::new(Barrier::new(2));
        let b2 = Arc::clone(&barrier);
        pool.submit(move || {
            pool2
                .submit(move || {
                    c2.fetch_add(1, Ordering::SeqCst);
                    b2.wait();
                })
                .unwrap();
        })
        .unwrap();
        barrier.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn round_robin_distributes_across_queues() {
        let pool = ThreadPool::new(4).unwrap();
        let seen: Arc<std::sync::Mutex<Vec<usize>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(5));
        for i in 0..4 {
            let seen = Arc::clone(&seen);
            let barrier = Arc::clone(&barrier);
            pool.submit(move || {
                seen.lock().unwrap().push(i);
                barrier.wait();
            })
            .unwrap();
        }
        barrier.wait();
        assert_eq!(seen.lock().unwrap().len(), 4);
    }
}
