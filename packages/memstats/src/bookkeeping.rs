//! The allocation channel used for our own bookkeeping.
//!
//! Memory for recorded events must never be requested through the global allocator: the
//! interceptor would observe the request and try to record it, growing the log again. All
//! bookkeeping storage therefore comes straight from the system allocator, which the
//! interceptor never wraps.

use std::alloc::{GlobalAlloc, Layout, System, handle_alloc_error};
use std::mem::MaybeUninit;
use std::ptr::NonNull;

/// Allocates uninitialized storage for one `T` from the system allocator.
///
/// If the system allocator is exhausted, this diverges via [`handle_alloc_error()`], the same
/// way an ordinary allocation would.
pub(crate) fn allocate<T>() -> NonNull<MaybeUninit<T>> {
    let layout = Layout::new::<T>();
    assert!(layout.size() != 0, "bookkeeping types are never zero-sized");

    // SAFETY: The layout has a non-zero size, as asserted above.
    let ptr = unsafe { System.alloc(layout) };

    NonNull::new(ptr.cast::<MaybeUninit<T>>()).unwrap_or_else(|| handle_alloc_error(layout))
}

/// Returns storage obtained from [`allocate()`] to the system allocator.
///
/// The value is not dropped; the caller is responsible for any cleanup of the contents.
///
/// # Safety
///
/// `ptr` must have been returned by `allocate::<T>()` and must not be used afterwards.
pub(crate) unsafe fn free<T>(ptr: NonNull<T>) {
    // SAFETY: Forwarding the caller's guarantee that the pointer came from `allocate::<T>()`,
    // which used exactly this layout with the system allocator.
    unsafe {
        System.dealloc(ptr.as_ptr().cast::<u8>(), Layout::new::<T>());
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_aligned_writable_storage() {
        let mut ptr = allocate::<[u64; 16]>();

        assert!(ptr.as_ptr().is_aligned());

        // SAFETY: We own the freshly allocated storage and initialize it before reading.
        let value = unsafe { ptr.as_mut().write([7; 16]) };
        assert_eq!(value.iter().sum::<u64>(), 7 * 16);

        // SAFETY: The pointer came from `allocate()` and is not used after this.
        unsafe {
            free(ptr);
        }
    }
}
