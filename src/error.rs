//! Error types surfaced by submission and pool construction.
//!
//! Once a task is accepted the library makes no further promise beyond
//! "will run, or will be destroyed at tear-down". These types only cover
//! the two points where things can fail *before* that: wrapping a closure
//! into a [`crate::payload::Payload`]/C-callback node, and building a
//! [`crate::pool::ThreadPool`].

use thiserror::Error;

/// Failure constructing a [`crate::payload::Payload`] or C-callback node.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The backing allocator returned `None` for the requested layout.
    #[error("allocator failed to satisfy the requested layout")]
    AllocFailed,
}

/// Failure constructing a [`crate::pool::ThreadPool`].
#[derive(Debug, Error)]
pub enum PoolBuildError {
    /// The thread factory failed to spin up worker index `index`.
    #[error("thread factory failed to start worker {index}: {source}")]
    ThreadSpawnFailed {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}
