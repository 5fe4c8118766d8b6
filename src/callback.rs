//! The C-callback packager: turns an owned closure into a
//! `(extern "C" fn(*mut c_void), *mut c_void)` pair suitable for any
//! C-style callback API, with RAII ownership that releases exactly once:
//! on [`CCallback`]'s destructor, or when the callback fires.
//!
//! Three strategies, picked once at construction: a **reference** to an
//! existing callable (no allocation, nothing owned), an **elidable**
//! bit-copy into the pointer-sized `data_ptr` slot itself (no allocation),
//! or an **allocated** node holding `(allocator, closure)` for anything too
//! big to elide. Rust's moves can't throw, so (as with
//! [`crate::payload::Payload`]) the elidable/allocated split collapses to a
//! pure size/alignment check rather than also requiring "trivially
//! copyable"; see DESIGN.md.
//!
//! [`CCallback`] is generic over the function-pointer type it hands back
//! (`FP`, defaulting to [`CFnPtr`]), so a target C API that declares its own
//! named callback typedef can be given a matching Rust type instead of
//! [`CFnPtr`] itself; see [`CCallbackFnPtr`] and the `_as` constructors.

use crate::alloc::{Global, TaskAllocator};
use crate::error::SubmitError;
use std::alloc::Layout;
use std::ffi::c_void;
use std::mem;
use std::ptr::NonNull;

/// A C callback function pointer: the first half of the pair `get()`/
/// `release()` hand back.
pub type CFnPtr = unsafe extern "C" fn(*mut c_void);

/// A function-pointer type ABI-compatible with [`CFnPtr`]: same argument
/// list, same calling convention, pointer-sized. [`package_as_c_callback_as`]
/// and [`package_as_c_callback_in_as`] are generic over this, so a caller
/// can get back whatever named callback type their target C API declares
/// instead of this crate's own [`CFnPtr`] alias.
///
/// # Safety
///
/// `from_c_fn_ptr` must return a value that, called with a `*mut c_void`
/// argument, runs exactly the code the given [`CFnPtr`] would. [`CFnPtr`]
/// itself satisfies this trivially; a `#[repr(transparent)]` newtype
/// wrapping a [`CFnPtr`] does too.
pub unsafe trait CCallbackFnPtr: Copy + 'static {
    fn from_c_fn_ptr(f: CFnPtr) -> Self;
}

unsafe impl CCallbackFnPtr for CFnPtr {
    fn from_c_fn_ptr(f: CFnPtr) -> Self {
        f
    }
}

#[derive(Clone, Copy)]
enum Cleanup {
    /// Nothing owned (the reference and elidable strategies).
    Nothing,
    /// An allocated node at `data_ptr`; drop it without invoking.
    Allocated(unsafe fn(*mut c_void)),
}

/// An owning `(fn_ptr, data_ptr)` pair. Exactly one of {drop, `release`,
/// `call`} ends this value's lifetime and releases its resource, never
/// both, never neither. Calling the raw `fn_ptr` returned by `get`/`release`
/// more than once is undefined, same as the contract it's extracted from.
pub struct CCallback<FP = CFnPtr> {
    fn_ptr: FP,
    data_ptr: *mut c_void,
    cleanup: Cleanup,
    released: bool,
}

// Safety: `data_ptr` either points at heap memory owned exclusively by this
// `CCallback` (Allocated), at caller-guaranteed-Sync borrowed memory
// (Reference), or carries no real indirection at all (Elidable, the bits
// of an `F: Send`). Ownership transfers wholesale with the value.
unsafe impl<FP> Send for CCallback<FP> {}

impl<FP: Copy> CCallback<FP> {
    /// Inspects the pair without transferring ownership of the release
    /// obligation; the `CCallback` still releases it on drop unless
    /// `release`/`call` is used afterwards.
    pub fn get(&self) -> (FP, *mut c_void) {
        (self.fn_ptr, self.data_ptr)
    }

    /// Hands the release obligation to the caller: the returned `fn_ptr`
    /// must now be invoked with `data_ptr` exactly once to release (and,
    /// for the allocated/elidable strategies, invoke) the wrapped closure.
    pub fn release(mut self) -> (FP, *mut c_void) {
        self.released = true;
        (self.fn_ptr, self.data_ptr)
    }
}

impl CCallback<CFnPtr> {
    /// Equivalent to `release()` followed by calling the returned pair.
    pub fn call(self) {
        let (fn_ptr, data_ptr) = self.release();
        // Safety: `fn_ptr`/`data_ptr` were produced together by this
        // `CCallback`'s constructor and this is the only invocation.
        unsafe { fn_ptr(data_ptr) };
    }
}

impl<FP> Drop for CCallback<FP> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Cleanup::Allocated(drop_fn) = self.cleanup {
            // Safety: `data_ptr` points at a live node this `CCallback`
            // exclusively owns, allocated by the matching constructor.
            unsafe { drop_fn(self.data_ptr) };
        }
    }
}

unsafe extern "C" fn trampoline_ref<F: Fn() + Sync>(data: *mut c_void) {
    // Safety: `data` is the address of a `F` this `CCallback` borrowed for
    // at least as long as itself, per `package_as_c_callback_ref`'s bound.
    let f = unsafe { &*data.cast::<F>() };
    f();
}

unsafe extern "C" fn trampoline_elidable<F: FnOnce() + Send + 'static>(data: *mut c_void) {
    // Safety: the bytes of `data` itself (not what it points to) were
    // written by `package_as_c_callback_in`'s elidable branch for this `F`.
    let f: F = unsafe { std::ptr::read((&raw const data).cast::<F>()) };
    f();
}

struct CallbackNode<A: TaskAllocator, F> {
    alloc: A,
    value: F,
}

unsafe extern "C" fn trampoline_allocated<A: TaskAllocator, F: FnOnce() + Send + 'static>(
    data: *mut c_void,
) {
    let layout = Layout::new::<CallbackNode<A, F>>();
    let ptr = data.cast::<CallbackNode<A, F>>();
    // Safety: `data` points at a live `CallbackNode<A, F>` allocated by
    // `package_as_c_callback_in`'s allocated branch, and this is its only read.
    let CallbackNode { alloc, value } = unsafe { ptr.read() };
    // Safety: `data` was returned by `alloc.alloc(layout)` and not yet freed.
    // Freeing before invoking `value` means the resource releases even if
    // `value` panics (the panic propagates out of this function normally).
    unsafe { alloc.dealloc(NonNull::new_unchecked(data.cast::<u8>()), layout) };
    value();
}

unsafe fn drop_allocated<A: TaskAllocator, F: Send + 'static>(data: *mut c_void) {
    let layout = Layout::new::<CallbackNode<A, F>>();
    let ptr = data.cast::<CallbackNode<A, F>>();
    // Safety: see `trampoline_allocated`.
    let CallbackNode { alloc, value } = unsafe { ptr.read() };
    drop(value);
    // Safety: see `trampoline_allocated`.
    unsafe { alloc.dealloc(NonNull::new_unchecked(data.cast::<u8>()), layout) };
}

/// Packages a borrowed callable. No allocation regardless of `F`'s size:
/// `data_ptr` is simply `callable`'s address. The caller must keep
/// `callable` alive at least as long as the returned `CCallback` (and any
/// `fn_ptr`/`data_ptr` pair released or extracted from it).
pub fn package_as_c_callback_ref<F: Fn() + Sync>(callable: &F) -> CCallback {
    package_as_c_callback_ref_as::<CFnPtr, F>(callable)
}

/// As [`package_as_c_callback_ref`], handing back `FP` instead of [`CFnPtr`].
pub fn package_as_c_callback_ref_as<FP: CCallbackFnPtr, F: Fn() + Sync>(
    callable: &F,
) -> CCallback<FP> {
    CCallback {
        fn_ptr: FP::from_c_fn_ptr(trampoline_ref::<F>),
        data_ptr: (callable as *const F).cast_mut().cast::<c_void>(),
        cleanup: Cleanup::Nothing,
        released: false,
    }
}

/// Packages an owned callable using the global allocator.
pub fn package_as_c_callback<F>(callable: F) -> Result<CCallback, SubmitError>
where
    F: FnOnce() + Send + 'static,
{
    package_as_c_callback_in(Global, callable)
}

/// As [`package_as_c_callback`], handing back `FP` instead of [`CFnPtr`].
pub fn package_as_c_callback_as<FP, F>(callable: F) -> Result<CCallback<FP>, SubmitError>
where
    FP: CCallbackFnPtr,
    F: FnOnce() + Send + 'static,
{
    package_as_c_callback_in_as(Global, callable)
}

/// Packages an owned callable using `alloc` if it doesn't fit the elidable
/// bit-copy slot.
pub fn package_as_c_callback_in<A, F>(alloc: A, callable: F) -> Result<CCallback, SubmitError>
where
    A: TaskAllocator,
    F: FnOnce() + Send + 'static,
{
    package_as_c_callback_in_as::<CFnPtr, A, F>(alloc, callable)
}

/// As [`package_as_c_callback_in`], handing back `FP` instead of [`CFnPtr`].
pub fn package_as_c_callback_in_as<FP, A, F>(
    alloc: A,
    callable: F,
) -> Result<CCallback<FP>, SubmitError>
where
    FP: CCallbackFnPtr,
    A: TaskAllocator,
    F: FnOnce() + Send + 'static,
{
    const SLOT_SIZE: usize = mem::size_of::<*mut c_void>();
    const SLOT_ALIGN: usize = mem::align_of::<*mut c_void>();

    if mem::size_of::<F>() <= SLOT_SIZE && mem::align_of::<F>() <= SLOT_ALIGN {
        let mut data: *mut c_void = std::ptr::null_mut();
        // Safety: size/align checked above; `data`'s own storage is
        // pointer-sized and about to be overwritten wholesale with `F`'s bytes.
        unsafe { (&raw mut data).cast::<F>().write(callable) };
        return Ok(CCallback {
            fn_ptr: FP::from_c_fn_ptr(trampoline_elidable::<F>),
            data_ptr: data,
            cleanup: Cleanup::Nothing,
            released: false,
        });
    }

    let layout = Layout::new::<CallbackNode<A, F>>();
    let ptr = alloc.alloc(layout).ok_or(SubmitError::AllocFailed)?;
    // Safety: `ptr` is freshly allocated for exactly this layout.
    unsafe {
        ptr.as_ptr()
            .cast::<CallbackNode<A, F>>()
            .write(CallbackNode { alloc, value: callable })
    };
    Ok(CCallback {
        fn_ptr: FP::from_c_fn_ptr(trampoline_allocated::<A, F>),
        data_ptr: ptr.as_ptr().cast::<c_void>(),
        cleanup: Cleanup::Allocated(drop_allocated::<A, F>),
        released: false,
    })
}
