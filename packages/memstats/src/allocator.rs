//! The global allocator wrapper that observes every allocation of the process.

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;

use crate::lifecycle;

/// A memory allocator that records allocations and deallocations for later reports.
///
/// This allocator wraps any [`GlobalAlloc`] implementation. Every request is first forwarded
/// to the wrapped allocator; the outcome is returned unchanged. Only successful requests are
/// recorded, and only while instrumentation is enabled both process-wide and for the calling
/// thread.
///
/// Installing the allocator is all that is needed to get a report at process exit.
///
/// # Examples
///
/// ```
/// use memstats::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .finish()
    }
}

impl Allocator<System> {
    /// Creates an instrumented allocator on top of the system's default allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates an instrumented allocator on top of the provided allocator.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

// SAFETY: We delegate all allocation operations to the underlying allocator and return its
// results unchanged. Recording never touches the memory being allocated.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc(layout) };

        if !ptr.is_null() {
            lifecycle::record(layout.size());
        }

        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(ptr, layout) }

        lifecycle::record(0);
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };

        if !ptr.is_null() {
            lifecycle::record(layout.size());
        }

        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };

        // A failed reallocation leaves the original block untouched, so nothing happened.
        if !new_ptr.is_null() {
            lifecycle::record(0);
            lifecycle::record(new_size);
        }

        new_ptr
    }
}
