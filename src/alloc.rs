//! Allocator-awareness for the task payload and C-callback packager.
//!
//! Rust's generic `Allocator` trait lives behind the unstable `allocator_api`
//! feature, so heap-backed storage in this crate goes through a small,
//! first-party trait instead. [`Global`] is the default and simply forwards
//! to `std::alloc`; tests use [`CountingAllocator`] to assert the
//! zero-allocation and exactly-one-allocation properties the payload and
//! packager promise.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};

/// An allocator a [`crate::payload::Payload`] or [`crate::callback`] node can
/// embed a copy of, so the node can free itself without an external
/// allocator reference.
///
/// # Safety
///
/// Implementors must return a pointer to a live allocation of at least
/// `layout.size()` bytes, aligned to `layout.align()`, from `alloc`, and
/// `dealloc` must be called with the same `layout` used to allocate `ptr`
/// at most once.
pub unsafe trait TaskAllocator: Clone + Send + 'static {
    /// Allocates memory described by `layout`. Returns `None` on failure.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Deallocates memory previously returned by `alloc` with the same layout.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior call to `self.alloc(layout)`
    /// (or an allocator considered equivalent to `self`) and not already
    /// deallocated.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process-wide global allocator, used when a caller doesn't supply one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Global;

unsafe impl TaskAllocator for Global {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return NonNull::new(layout.align() as *mut u8);
        }
        // Safety: layout is non-zero-sized, checked above.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // Safety: caller upholds the `TaskAllocator::dealloc` contract.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Test/benchmark allocator tracking outstanding bytes and allocation count.
///
/// Cloning shares the same counters via an inner `Arc`, so a handle kept
/// alongside the clones passed into a payload or packager can still be
/// asserted on after that payload drops.
#[derive(Clone)]
pub struct CountingAllocator {
    inner: std::sync::Arc<CountingAllocatorState>,
}

#[derive(Default)]
struct CountingAllocatorState {
    bytes_outstanding: AtomicIsize,
    allocations: AtomicIsize,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(CountingAllocatorState::default()),
        }
    }

    /// Bytes currently allocated and not yet deallocated through this allocator.
    pub fn bytes_outstanding(&self) -> isize {
        self.inner.bytes_outstanding.load(Ordering::SeqCst)
    }

    /// Net allocation count (allocations minus deallocations).
    pub fn allocations_outstanding(&self) -> isize {
        self.inner.allocations.load(Ordering::SeqCst)
    }
}

impl Default for CountingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl TaskAllocator for CountingAllocator {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = Global.alloc(layout)?;
        self.inner
            .bytes_outstanding
            .fetch_add(layout.size() as isize, Ordering::SeqCst);
        self.inner.allocations.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: forwarded from caller, who upholds the same contract for us.
        unsafe { Global.dealloc(ptr, layout) };
        self.inner
            .bytes_outstanding
            .fetch_sub(layout.size() as isize, Ordering::SeqCst);
        self.inner.allocations.fetch_sub(1, Ordering::SeqCst);
    }
}
