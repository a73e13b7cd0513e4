use std::{
    alloc::{GlobalAlloc, Layout},
    cmp, mem,
    ptr::{self, NonNull},
};

use allocator_api2::alloc::AllocError;
use libc::size_t;

use crate::{alloc::RawAllocator, util::hint::cold};

// With the `interpose` feature we export `malloc()` & co. ourselves, so the
// platform allocator has to be reached through glibc's internal names.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod c {
    use libc::{c_void, size_t};

    extern "C" {
        #[link_name = "__libc_malloc"]
        pub fn malloc(size: size_t) -> *mut c_void;
        #[link_name = "__libc_calloc"]
        pub fn calloc(count: size_t, size: size_t) -> *mut c_void;
        #[link_name = "__libc_realloc"]
        pub fn realloc(data: *mut c_void, size: size_t) -> *mut c_void;
        #[link_name = "__libc_free"]
        pub fn free(data: *mut c_void);
        #[link_name = "__libc_memalign"]
        pub fn memalign(align: size_t, size: size_t) -> *mut c_void;
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod c {
    pub use libc::{calloc, free, malloc, realloc};
    use libc::{c_void, size_t};

    pub unsafe fn memalign(align: size_t, size: size_t) -> *mut c_void {
        let mut data = std::ptr::null_mut();
        if libc::posix_memalign(&mut data, align, size) != 0 {
            return std::ptr::null_mut();
        }
        data
    }
}

/// Everything `malloc()` hands out is at least this aligned
pub const SYSTEM_MIN_ALIGN: usize = mem::align_of::<libc::max_align_t>();

/// The platform allocator. This is where the tracking front-end falls back to,
/// and what it uses for its own bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    /// Safe version of `calloc(1, size)`.
    pub fn calloc(&self, size: usize) -> *mut u8 {
        // SAFETY: `calloc()` has no preconditions
        unsafe { c::calloc(1, size.max(1) as size_t).cast() }
    }

    /// Safe version of `malloc()`.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: `malloc()` has no preconditions
        unsafe { c::malloc(size.max(1) as size_t).cast() }
    }

    /// # Safety
    ///
    /// `data` must be null or a live allocation of the platform allocator.
    pub unsafe fn realloc(&self, data: *mut u8, size: usize) -> *mut u8 {
        unsafe { c::realloc(data.cast(), size.max(1) as size_t).cast() }
    }

    /// # Safety
    ///
    /// `data` must be null or a live allocation of the platform allocator, and
    /// must not be used again.
    pub unsafe fn free(&self, data: *mut u8) {
        unsafe { c::free(data.cast()) }
    }

    fn memalign(&self, layout: Layout) -> *mut u8 {
        // `posix_memalign()` wants at least pointer alignment
        let align = cmp::max(layout.align(), mem::size_of::<usize>());
        // SAFETY: `align` is a power of two (it came from a `Layout`)
        unsafe { c::memalign(align as size_t, layout.size().max(1) as size_t).cast::<u8>() }
    }
}

// SAFETY: Allocations come straight from the platform allocator, which owns
//         them until they're handed back to `free()`.
unsafe impl RawAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        NonNull::new(self.calloc(size)).ok_or(AllocError)
    }

    unsafe fn reallocate(&self, data: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: Caller guarantees `data` is ours
        NonNull::new(unsafe { self.realloc(data.as_ptr(), size) }).ok_or(AllocError)
    }

    unsafe fn free(&self, data: NonNull<u8>) {
        // SAFETY: Caller guarantees `data` is ours
        unsafe { SystemAllocator::free(self, data.as_ptr()) }
    }
}

unsafe impl GlobalAlloc for SystemAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SYSTEM_MIN_ALIGN && layout.align() <= layout.size() {
            self.malloc(layout.size())
        } else {
            cold(|| self.memalign(layout))
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SYSTEM_MIN_ALIGN && layout.align() <= layout.size() {
            self.calloc(layout.size())
        } else {
            cold(|| {
                let data = self.memalign(layout);
                if !data.is_null() {
                    // SAFETY: `memalign()` gave us at least `layout.size()`
                    //         bytes
                    unsafe { data.write_bytes(0, layout.size()) };
                }
                data
            })
        }
    }

    unsafe fn dealloc(&self, data: *mut u8, _: Layout) {
        // SAFETY: Identical contract to the caller's
        unsafe { SystemAllocator::free(self, data) }
    }

    unsafe fn realloc(&self, data: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= SYSTEM_MIN_ALIGN && layout.align() <= new_size {
            // SAFETY: Caller guarantees `data` came from us
            return unsafe { SystemAllocator::realloc(self, data, new_size) };
        }
        cold(|| {
            // SAFETY: `new_size` and the alignment come from a valid layout, by
            //         the caller's contract
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let new_data = self.memalign(new_layout);
            if !new_data.is_null() {
                // SAFETY:
                // - Both allocations are at least `min(old, new)` bytes
                // - They're distinct live allocations, so they don't overlap
                unsafe {
                    ptr::copy_nonoverlapping(data, new_data, cmp::min(layout.size(), new_size));
                    SystemAllocator::free(self, data);
                }
            }
            new_data
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_zeroed_and_reallocatable() {
        let data = SystemAllocator.allocate(64).unwrap();
        // SAFETY: 64 live bytes
        let bytes = unsafe { std::slice::from_raw_parts_mut(data.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[63] = 7;
        // SAFETY: `data` is ours, and isn't used again
        let data = unsafe { SystemAllocator.reallocate(data, 4096) }.unwrap();
        // SAFETY: 4096 live bytes, the first 64 copied over
        assert_eq!(unsafe { *data.as_ptr().add(63) }, 7);
        unsafe { RawAllocator::free(&SystemAllocator, data) };
    }

    #[test]
    fn over_aligned_layouts_use_memalign() {
        let layout = Layout::from_size_align(100, 4096).unwrap();
        // SAFETY: `layout` has a non-zero size
        let data = unsafe { SystemAllocator.alloc_zeroed(layout) };
        assert!(!data.is_null());
        assert_eq!(data as usize % 4096, 0);
        // SAFETY: `data` was allocated with `layout` just now
        let data = unsafe { GlobalAlloc::realloc(&SystemAllocator, data, layout, 8000) };
        assert_eq!(data as usize % 4096, 0);
        unsafe { SystemAllocator.dealloc(data, Layout::from_size_align(8000, 4096).unwrap()) };
    }
}
