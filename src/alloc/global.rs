//! [`GlobalAlloc`] on top of an [`AllocatorContext`].
//!
//! ```no_run
//! use memtrack::alloc::TrackingAlloc;
//!
//! #[global_allocator]
//! static GLOBAL: TrackingAlloc = TrackingAlloc::new();
//! ```
//!
//! The context is created on first use, from [`Config::from_env()`] unless
//! another config function is given. Until tracking is switched on every
//! request goes straight to the platform allocator.

use std::{
    alloc::{GlobalAlloc, Layout},
    cmp,
    ptr::{self, NonNull},
    sync::Arc,
};

use once_cell::sync::OnceCell;

use crate::{
    alloc::{
        block::BLOCK_SIZE,
        context::{AllocatorContext, ReentrancyGuard},
        system::{SystemAllocator, SYSTEM_MIN_ALIGN},
        RawAllocator,
    },
    config::Config,
    util::hint::cold,
};

pub struct TrackingAlloc {
    context: OnceCell<Arc<AllocatorContext>>,
    config: fn() -> Config,
}

impl TrackingAlloc {
    pub const fn new() -> Self {
        Self::with_config(Config::from_env)
    }

    pub const fn with_config(config: fn() -> Config) -> Self {
        Self {
            context: OnceCell::new(),
            config,
        }
    }

    /// The context behind this allocator, created if this is the first call
    pub fn context(&self) -> &Arc<AllocatorContext> {
        // building the config allocates, and those allocations must not come
        // back here while the cell is being initialised
        let _guard = ReentrancyGuard::enter();
        self.context
            .get_or_init(|| Arc::new(AllocatorContext::new((self.config)())))
    }

    /// The context, if anything has created it yet
    pub fn try_context(&self) -> Option<&Arc<AllocatorContext>> {
        self.context.get()
    }

    /// `None` when the request should go to the platform allocator untouched
    fn tracking_context(&self, layout: Layout) -> Option<&Arc<AllocatorContext>> {
        if layout.align() > BLOCK_SIZE || ReentrancyGuard::is_active() {
            return None;
        }
        let context = self.context();
        context.is_tracking().then_some(context)
    }

    fn allocate(&self, layout: Layout, zeroed: bool) -> *mut u8 {
        let Some(context) = self.tracking_context(layout) else {
            // SAFETY: Identical contract to the caller's
            return unsafe {
                if zeroed {
                    SystemAllocator.alloc_zeroed(layout)
                } else {
                    SystemAllocator.alloc(layout)
                }
            };
        };
        let Ok(data) = context.allocate(layout.size()) else {
            return ptr::null_mut();
        };
        if data.as_ptr() as usize % layout.align() == 0 {
            return data.as_ptr();
        }
        // the platform allocator took it and only guarantees `max_align_t`
        cold(|| {
            // SAFETY: Handed out just now, and not used again
            unsafe { context.free(data) };
            // SAFETY: Identical contract to the caller's
            unsafe { SystemAllocator.alloc_zeroed(layout) }
        })
    }
}

impl Default for TrackingAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TrackingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout, false)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout, true)
    }

    unsafe fn dealloc(&self, data: *mut u8, layout: Layout) {
        let (Some(context), Some(data)) = (self.context.get(), NonNull::new(data)) else {
            // SAFETY: Nothing can be in a store before the context exists
            return unsafe { SystemAllocator.dealloc(data, layout) };
        };
        if ReentrancyGuard::is_active() {
            // SAFETY: Anything allocated inside the allocator came from the
            //         platform allocator
            return unsafe { SystemAllocator.dealloc(data.as_ptr(), layout) };
        }
        // SAFETY: The context sends pointers it doesn't own to `free()`
        unsafe { context.free(data) }
    }

    unsafe fn realloc(&self, data: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let (Some(context), Some(old)) = (self.context.get(), NonNull::new(data)) else {
            // SAFETY: Identical contract to the caller's
            return unsafe { GlobalAlloc::realloc(&SystemAllocator, data, layout, new_size) };
        };
        if ReentrancyGuard::is_active() || layout.align() > BLOCK_SIZE {
            // SAFETY: Identical contract to the caller's
            return unsafe { GlobalAlloc::realloc(&SystemAllocator, data, layout, new_size) };
        }
        if layout.align() <= SYSTEM_MIN_ALIGN {
            // SAFETY: Identical contract to the caller's
            return match unsafe { context.reallocate(old, new_size) } {
                Ok(moved) => moved.as_ptr(),
                Err(_) => ptr::null_mut(),
            };
        }
        cold(|| {
            // SAFETY: The caller guarantees this is a valid layout
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let moved = self.allocate(new_layout, false);
            if !moved.is_null() {
                // SAFETY:
                // - Both allocations are at least `min(old, new)` bytes
                // - Distinct live allocations don't overlap
                unsafe {
                    ptr::copy_nonoverlapping(data, moved, cmp::min(layout.size(), new_size));
                    self.dealloc(data, layout);
                }
            }
            moved
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GiveBack;

    fn tracking_config() -> Config {
        Config::default()
            .with_tracking(true)
            .with_store_size(1 << 20)
            .with_give_back(GiveBack::Keep)
    }

    #[test]
    fn requests_land_in_stores() {
        let alloc = TrackingAlloc::with_config(tracking_config);
        let layout = Layout::from_size_align(100, 64).unwrap();
        unsafe {
            let data = alloc.alloc(layout);
            assert!(!data.is_null());
            assert_eq!(data as usize % 64, 0);
            assert!(alloc.context().store_for_address(data).is_some());
            data.write_bytes(0x5a, 100);

            let data = alloc.realloc(data, layout, 1000);
            assert_eq!(*data.add(99), 0x5a);
            alloc.dealloc(data, Layout::from_size_align(1000, 64).unwrap());
        }
        alloc.context().validate().unwrap();
    }

    #[test]
    fn disabled_tracking_passes_through() {
        let alloc = TrackingAlloc::with_config(Config::default);
        let layout = Layout::new::<[u64; 4]>();
        unsafe {
            let data = alloc.alloc_zeroed(layout);
            assert!(!data.is_null());
            assert_eq!(alloc.context().store_for_address(data), None);
            alloc.dealloc(data, layout);
        }
        assert_eq!(alloc.context().number_of_stores(), 0);
    }

    #[test]
    fn over_aligned_requests_pass_through() {
        let alloc = TrackingAlloc::with_config(tracking_config);
        let layout = Layout::from_size_align(256, 4096).unwrap();
        unsafe {
            let data = alloc.alloc(layout);
            assert_eq!(data as usize % 4096, 0);
            assert_eq!(alloc.context().store_for_address(data), None);
            alloc.dealloc(data, layout);
        }
    }
}
