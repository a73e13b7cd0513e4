//! C entry points.
//!
//! `memtrack_malloc()` & co. are always exported. With the `interpose`
//! feature the plain `malloc()` family is exported as well, so that a
//! preloaded build of this crate sees every allocation in the process. Those
//! only use block stores when `MEMTRACK_OVERRIDE_SYSTEM_MALLOC` is set.

use std::ptr::{self, NonNull};

use libc::{c_void, size_t};

use crate::alloc::{
    context::ReentrancyGuard, global::TrackingAlloc, system::SystemAllocator, AllocatorContext,
    RawAllocator,
};

/// The process-wide allocator behind the C entry points
pub static MEMTRACK: TrackingAlloc = TrackingAlloc::new();

/// `None` if this call has to go to the platform allocator
fn context() -> Option<&'static AllocatorContext> {
    if ReentrancyGuard::is_active() {
        return None;
    }
    Some(MEMTRACK.context().as_ref())
}

fn allocate(size: usize) -> *mut c_void {
    let data = match context() {
        Some(context) => context.allocate(size),
        None => SystemAllocator.allocate(size),
    };
    data.map_or(ptr::null_mut(), |data| data.as_ptr().cast())
}

unsafe fn reallocate(data: *mut c_void, size: usize) -> *mut c_void {
    let Some(old) = NonNull::new(data.cast::<u8>()) else {
        return allocate(size);
    };
    if size == 0 {
        // SAFETY: Identical contract to the caller's
        unsafe { free(data) };
        return ptr::null_mut();
    }
    let moved = match context() {
        // SAFETY: Identical contract to the caller's
        Some(context) => unsafe { context.reallocate(old, size) },
        // SAFETY: Identical contract to the caller's
        None => unsafe { SystemAllocator.reallocate(old, size) },
    };
    moved.map_or(ptr::null_mut(), |moved| moved.as_ptr().cast())
}

unsafe fn free(data: *mut c_void) {
    let Some(data) = NonNull::new(data.cast::<u8>()) else {
        return;
    };
    match MEMTRACK.try_context() {
        // SAFETY: Identical contract to the caller's. The context passes
        //         pointers it doesn't own on to the platform allocator.
        Some(context) if !ReentrancyGuard::is_active() => unsafe { context.free(data) },
        // SAFETY: Identical contract to the caller's
        _ => unsafe { RawAllocator::free(&SystemAllocator, data) },
    }
}

#[no_mangle]
pub extern "C" fn memtrack_malloc(size: size_t) -> *mut c_void {
    allocate(size)
}

#[no_mangle]
pub extern "C" fn memtrack_calloc(count: size_t, size: size_t) -> *mut c_void {
    match count.checked_mul(size) {
        Some(total) => allocate(total),
        None => ptr::null_mut(),
    }
}

/// # Safety
///
/// `data` must be null or a live allocation from these functions (or the
/// platform allocator).
#[no_mangle]
pub unsafe extern "C" fn memtrack_realloc(data: *mut c_void, size: size_t) -> *mut c_void {
    // SAFETY: Identical contract to the caller's
    unsafe { reallocate(data, size) }
}

/// # Safety
///
/// `data` must be null or a live allocation from these functions (or the
/// platform allocator), and must not be used again.
#[no_mangle]
pub unsafe extern "C" fn memtrack_free(data: *mut c_void) {
    // SAFETY: Identical contract to the caller's
    unsafe { free(data) }
}

#[cfg(feature = "interpose")]
mod interpose {
    use super::*;

    fn overriding() -> bool {
        !ReentrancyGuard::is_active() && MEMTRACK.context().config().override_system_malloc
    }

    #[no_mangle]
    pub extern "C" fn malloc(size: size_t) -> *mut c_void {
        if overriding() {
            allocate(size)
        } else {
            SystemAllocator.malloc(size).cast()
        }
    }

    #[no_mangle]
    pub extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        if overriding() {
            allocate(total)
        } else {
            SystemAllocator.calloc(total).cast()
        }
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(data: *mut c_void, size: size_t) -> *mut c_void {
        // A store pointer has to go through the context whatever the setting,
        // so only pure platform traffic skips it
        let owned = MEMTRACK
            .try_context()
            .is_some_and(|context| context.store_for_address(data.cast()).is_some());
        if overriding() || owned {
            // SAFETY: Identical contract to the caller's
            unsafe { reallocate(data, size) }
        } else {
            // SAFETY: Identical contract to the caller's
            unsafe { SystemAllocator.realloc(data.cast(), size).cast() }
        }
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(data: *mut c_void) {
        // SAFETY: Identical contract to the caller's
        unsafe { super::free(data) }
    }
}
