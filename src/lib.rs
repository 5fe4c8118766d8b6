//! A small, composable library of task schedulers.
//!
//! - [`pool::ThreadPool`]: a fixed-size, work-stealing background thread
//!   pool.
//! - [`main_thread`]: a process-wide queue plus [`main_thread::MainThreadScheduler`]
//!   for handing work to an external main-thread event loop.
//! - [`payload::Payload`]: the move-only, small-buffer-optimized closure
//!   container both schedulers build on.
//! - [`callback`]: packages an owned closure as a C-style
//!   `(fn_ptr, data_ptr)` pair for FFI boundaries.
//! - [`scheduler::Scheduler`]: the trait implemented by every backend above,
//!   so calling code can be generic over "some scheduler".
//!
//! Every backend accepts allocator-aware construction (`submit_in`,
//! `package_as_c_callback_in`, …) through [`alloc::TaskAllocator`]; the
//! single-argument forms (`submit`, `package_as_c_callback`, …) use
//! [`alloc::Global`].

pub mod alloc;
pub mod callback;
pub mod error;
pub mod main_thread;
pub mod payload;
pub mod pool;
pub mod queue;
pub mod scheduler;

pub use alloc::{Global, TaskAllocator};
pub use callback::{
    package_as_c_callback, package_as_c_callback_as, package_as_c_callback_in,
    package_as_c_callback_in_as, package_as_c_callback_ref, package_as_c_callback_ref_as,
    CCallback, CCallbackFnPtr, CFnPtr,
};
pub use error::{PoolBuildError, SubmitError};
pub use main_thread::{drive_main_thread_queue, main_thread_queue, MainThreadQueue, MainThreadScheduler};
pub use payload::Payload;
pub use pool::{PoolBuilder, ThreadPool};
pub use queue::WorkQueue;
pub use scheduler::Scheduler;
