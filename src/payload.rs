//! The task payload: a move-only, small-buffer-optimized container for one
//! `FnOnce() + Send` closure.
//!
//! A `Payload` is either empty, holding its closure inline (no allocation),
//! or holding it behind a single heap allocation made through a
//! [`TaskAllocator`]. Which one is chosen is decided once, at construction,
//! by comparing the closure's size and alignment against a fixed two-word
//! inline buffer; nothing branches on it again afterwards; a vtable captured
//! at construction (`call`, `drop`) already knows how to reach the value.
//!
//! Moving a `Payload` out of a queue is an ordinary Rust move (a bitwise
//! copy of this struct, with the source binding made inaccessible by the
//! borrow checker), so there is no "leave the source empty" step to write
//! by hand; the compiler already forbids using it.

use crate::alloc::{Global, TaskAllocator};
use crate::error::SubmitError;
use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;

/// Two pointer-widths: fits a closure capturing up to two pointer-sized
/// values (one or two captured references/handles, the common case).
const INLINE_CAP: usize = 2 * mem::size_of::<usize>();
/// Conservative alignment covering both 32- and 64-bit pointer alignment.
const INLINE_ALIGN: usize = 8;

#[repr(align(8))]
struct InlineBuf([MaybeUninit<u8>; INLINE_CAP]);

impl InlineBuf {
    const fn uninit() -> Self {
        Self([const { MaybeUninit::uninit() }; INLINE_CAP])
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr() as *mut u8
    }
}

enum Storage {
    Inline(InlineBuf),
    Heap(NonNull<u8>),
}

struct VTable {
    /// Consumes and invokes the closure at `ptr`, releasing any backing
    /// allocation. Must be called at most once, and only through `Payload::call`.
    call: unsafe fn(*mut u8),
    /// Drops the closure at `ptr` without invoking it, releasing any backing
    /// allocation. Must be called at most once.
    drop: unsafe fn(*mut u8),
}

unsafe fn call_inline<F: FnOnce() + Send + 'static>(ptr: *mut u8) {
    // Safety: `ptr` was written by `Payload::new_in`'s inline branch for
    // exactly this `F`, and this is the only read of it.
    let f = unsafe { ptr.cast::<F>().read() };
    f();
}

unsafe fn drop_inline<F: Send + 'static>(ptr: *mut u8) {
    // Safety: see `call_inline`.
    unsafe { std::ptr::drop_in_place(ptr.cast::<F>()) };
}

struct HeapNode<A: TaskAllocator, F> {
    alloc: A,
    value: F,
}

unsafe fn call_heap<A: TaskAllocator, F: FnOnce() + Send + 'static>(ptr: *mut u8) {
    let layout = Layout::new::<HeapNode<A, F>>();
    // Safety: `ptr` points at a live `HeapNode<A, F>` allocated in
    // `Payload::new_in`'s heap branch, and this is the only read of it.
    let HeapNode { alloc, value } = unsafe { ptr.cast::<HeapNode<A, F>>().read() };
    // Safety: `ptr` was returned by `alloc.alloc(layout)` and not yet freed.
    unsafe { alloc.dealloc(NonNull::new_unchecked(ptr), layout) };
    value();
}

unsafe fn drop_heap<A: TaskAllocator, F: Send + 'static>(ptr: *mut u8) {
    let layout = Layout::new::<HeapNode<A, F>>();
    // Safety: see `call_heap`.
    let HeapNode { alloc, value } = unsafe { ptr.cast::<HeapNode<A, F>>().read() };
    drop(value);
    // Safety: see `call_heap`.
    unsafe { alloc.dealloc(NonNull::new_unchecked(ptr), layout) };
}

fn vtable_inline<F: FnOnce() + Send + 'static>() -> &'static VTable {
    struct Holder<F>(PhantomData<F>);
    impl<F: FnOnce() + Send + 'static> Holder<F> {
        const VTABLE: VTable = VTable {
            call: call_inline::<F>,
            drop: drop_inline::<F>,
        };
    }
    &Holder::<F>::VTABLE
}

fn vtable_heap<A: TaskAllocator, F: FnOnce() + Send + 'static>() -> &'static VTable {
    struct Holder<A, F>(PhantomData<(A, F)>);
    impl<A: TaskAllocator, F: FnOnce() + Send + 'static> Holder<A, F> {
        const VTABLE: VTable = VTable {
            call: call_heap::<A, F>,
            drop: drop_heap::<A, F>,
        };
    }
    &Holder::<A, F>::VTABLE
}

/// A one-shot, move-only container for a single `FnOnce() + Send` closure.
///
/// Default-constructed as empty. Consumed by [`Payload::call`]; dropping a
/// non-empty, never-called payload destroys the closure without running it.
pub struct Payload {
    vtable: Option<&'static VTable>,
    storage: Storage,
}

// Safety: a `Payload` only ever wraps an `F: Send`, and the raw pointer
// inside `Storage::Heap` is never aliased; ownership transfers wholesale
// with the `Payload` itself.
unsafe impl Send for Payload {}

impl Default for Payload {
    fn default() -> Self {
        Self {
            vtable: None,
            storage: Storage::Inline(InlineBuf::uninit()),
        }
    }
}

impl Payload {
    /// Wraps `f`, choosing inline or heap storage (via `alloc`) depending on
    /// whether `f` fits the inline buffer.
    pub fn new_in<A, F>(alloc: A, f: F) -> Result<Self, SubmitError>
    where
        A: TaskAllocator,
        F: FnOnce() + Send + 'static,
    {
        if mem::size_of::<F>() <= INLINE_CAP && mem::align_of::<F>() <= INLINE_ALIGN {
            let mut buf = InlineBuf::uninit();
            // Safety: size/align checked above; the slot is uninitialized
            // and owned by this `Payload` from here on.
            unsafe { buf.as_mut_ptr().cast::<F>().write(f) };
            Ok(Self {
                vtable: Some(vtable_inline::<F>()),
                storage: Storage::Inline(buf),
            })
        } else {
            let layout = Layout::new::<HeapNode<A, F>>();
            let ptr = alloc.alloc(layout).ok_or(SubmitError::AllocFailed)?;
            // Safety: `ptr` is freshly allocated for exactly this layout.
            unsafe {
                ptr.as_ptr()
                    .cast::<HeapNode<A, F>>()
                    .write(HeapNode { alloc, value: f })
            };
            Ok(Self {
                vtable: Some(vtable_heap::<A, F>()),
                storage: Storage::Heap(ptr),
            })
        }
    }

    /// Wraps `f` using the global allocator.
    pub fn new<F>(f: F) -> Result<Self, SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_in(Global, f)
    }

    /// True iff this payload holds a closure.
    pub fn is_empty(&self) -> bool {
        self.vtable.is_none()
    }

    fn storage_ptr(&mut self) -> *mut u8 {
        match &mut self.storage {
            Storage::Inline(buf) => buf.as_mut_ptr(),
            Storage::Heap(ptr) => ptr.as_ptr(),
        }
    }

    /// Consumes and invokes the wrapped closure.
    ///
    /// # Panics
    ///
    /// Panics if the payload is empty.
    pub fn call(mut self) {
        let vtable = self.vtable.take().expect("call on empty payload");
        let ptr = self.storage_ptr();
        // The vtable's `call` already runs the closure's drop glue (by
        // moving it out and invoking it) and frees any heap node; running
        // our own `Drop` afterwards would double-free/double-invoke.
        mem::forget(self);
        // Safety: `vtable` and `ptr` were produced together by `new_in` for
        // the same concrete `F`/`A`, and this is the one and only call.
        unsafe { (vtable.call)(ptr) };
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(vtable) = self.vtable.take() {
            let ptr = self.storage_ptr();
            // Safety: see `Payload::call`; this path destroys without invoking.
            unsafe { (vtable.drop)(ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAllocator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn default_is_empty() {
        let p = Payload::default();
        assert!(p.is_empty());
    }

    #[test]
    fn inline_closure_runs_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let payload = Payload::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(!payload.is_empty());
        payload.call();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    /// Test: a closure whose captures exceed the inline buffer allocates
    /// exactly once via the supplied allocator and frees exactly once.
    #[test]
    fn oversized_closure_allocates_once_and_frees() {
        let alloc = CountingAllocator::new();
        let big = [0u8; 400];
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let payload = Payload::new_in(alloc.clone(), move || {
            let _ = big.len();
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(alloc.allocations_outstanding(), 1);
        payload.call();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(alloc.bytes_outstanding(), 0);
        assert_eq!(alloc.allocations_outstanding(), 0);
    }

    #[test]
    fn inline_closure_performs_zero_allocations() {
        let alloc = CountingAllocator::new();
        let payload = Payload::new_in(alloc.clone(), move || {}).unwrap();
        assert_eq!(alloc.allocations_outstanding(), 0);
        payload.call();
        assert_eq!(alloc.allocations_outstanding(), 0);
    }

    #[test]
    fn dropping_without_calling_still_frees_heap_storage() {
        let alloc = CountingAllocator::new();
        let big = [0u8; 400];
        let payload = Payload::new_in(alloc.clone(), move || {
            let _ = big.len();
        })
        .unwrap();
        assert_eq!(alloc.allocations_outstanding(), 1);
        drop(payload);
        assert_eq!(alloc.bytes_outstanding(), 0);
        assert_eq!(alloc.allocations_outstanding(), 0);
    }

    #[test]
    fn dropping_without_calling_does_not_invoke() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let payload = Payload::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        drop(payload);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    /// Test: moving a payload (e.g. out of a queue) preserves its observable
    /// effect and is just an ordinary Rust move.
    #[test]
    fn move_preserves_effect() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let payload = Payload::new(move || {
            c.fetch_add(7, Ordering::SeqCst);
        })
        .unwrap();
        let moved = payload;
        moved.call();
        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }
}
