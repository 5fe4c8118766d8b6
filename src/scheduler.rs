//! The `Scheduler` contract shared by every backend: background pool,
//! main-thread queue, and (not implemented here) platform dispatch wrappers.
//!
//! Each backend exposes an availability flag so client code can pick a
//! backend at build time via type-level conditionals rather than
//! preprocessor branches. In Rust, that's an associated `const AVAILABLE:
//! bool`, checkable with `if Backend::AVAILABLE { .. }` in a `const`
//! context, or simply read at runtime where a `const` branch isn't needed.

use crate::alloc::TaskAllocator;
use crate::error::SubmitError;

/// A scheduler: something that accepts a `FnOnce() + Send` closure and
/// arranges for its later execution.
pub trait Scheduler {
    /// Compile-time flag: whether this backend can be constructed and
    /// submitted to on the current build target. A scheduler whose
    /// `AVAILABLE` is `false` can still be named (so generic code can refer
    /// to its type), but submitting to it is a programmer error.
    const AVAILABLE: bool;

    /// Submits `f` for later execution on this scheduler's backend, using
    /// the global allocator to build its payload.
    fn submit<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static;

    /// As [`Scheduler::submit`], but builds the payload through `alloc`
    /// instead of the global allocator.
    fn submit_in<A, F>(&self, alloc: A, f: F) -> Result<(), SubmitError>
    where
        A: TaskAllocator,
        F: FnOnce() + Send + 'static;
}

/// Platform dispatch backends (Apple's GCD global queue, the Win32 default
/// thread pool, a web-runtime asynchronous callback, Android's `ALooper`)
/// are external collaborators outside this crate's scope. A concrete
/// backend crate only needs to implement [`Scheduler`] and report its
/// [`Scheduler::AVAILABLE`] truthfully for the current target; nothing else
/// in this crate depends on how it gets there (FFI, a vendored C shim, …).
/// Build-time selection of a "default scheduler" among those backends is
/// left to the consuming crate; this module only states the contract, not
/// a `cfg`-based chooser.
pub mod platform {}
