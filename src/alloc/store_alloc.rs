use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
    sync::Arc,
};

use allocator_api2::alloc::{AllocError, Allocator};

use crate::alloc::{
    block::BLOCK_SIZE,
    context::{AllocatorContext, StoreId},
    system::SystemAllocator,
    RawAllocator,
};

/// An [`Allocator`] that puts everything in one block store, for collections
/// that should be accounted separately from the rest of the heap. Requests the
/// store can't take (or can't align) go to the platform allocator.
#[derive(Clone)]
pub struct StoreAllocator {
    context: Arc<AllocatorContext>,
    store: StoreId,
    name: Option<&'static str>,
}

impl StoreAllocator {
    pub fn new(context: Arc<AllocatorContext>, store: StoreId) -> Self {
        Self {
            context,
            store,
            name: None,
        }
    }

    /// Tag every allocation with `name` in its block header
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn context(&self) -> &Arc<AllocatorContext> {
        &self.context
    }
}

unsafe impl Allocator for StoreAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // SAFETY: Alignments are never zero
            let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        let data = if layout.align() <= BLOCK_SIZE {
            match self.context.allocate_in(self.store, layout.size(), self.name) {
                Ok(data) => data,
                Err(err) => {
                    log::debug!("store allocator falling back to the platform allocator: {err}");
                    // SAFETY: `layout` has a non-zero size
                    NonNull::new(unsafe { SystemAllocator.alloc_zeroed(layout) }).ok_or(AllocError)?
                }
            }
        } else {
            // SAFETY: `layout` has a non-zero size
            NonNull::new(unsafe { SystemAllocator.alloc_zeroed(layout) }).ok_or(AllocError)?
        };
        Ok(NonNull::slice_from_raw_parts(data, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // Both the store and `free()` can take anything either side handed
        // out, the context works out which it was from the address
        // SAFETY: Identical contract to the caller's
        unsafe { self.context.free(ptr) };
    }
}

impl std::fmt::Debug for StoreAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAllocator")
            .field("store", &self.store)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GiveBack};

    fn allocator(dir: &std::path::Path) -> StoreAllocator {
        let context = Arc::new(AllocatorContext::new(
            Config::default()
                .with_allocation_map_dir(dir)
                .with_validation(true)
                .with_give_back(GiveBack::Keep),
        ));
        let store = context.create_store("metrics", 1 << 20).unwrap();
        StoreAllocator::new(context, store).with_name("test")
    }

    #[test]
    fn collections_live_in_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path());
        let mut v = allocator_api2::vec::Vec::new_in(alloc.clone());
        v.extend_from_slice(&[1u64, 2, 3]);
        let id = alloc.context().store_for_address(v.as_ptr().cast());
        assert_eq!(id, Some(alloc.store()));
        let names = alloc
            .context()
            .with_store(alloc.store(), |store| {
                store.allocations().map(|a| a.name.map(str::to_owned)).collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(names, [Some("test".to_owned())]);
        drop(v);
        let count = alloc
            .context()
            .with_store(alloc.store(), |store| store.number_of_allocations())
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn over_aligned_requests_skip_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path());
        let layout = Layout::from_size_align(64, 4096).unwrap();
        let data = alloc.allocate(layout).unwrap().cast::<u8>();
        assert_eq!(data.as_ptr() as usize % 4096, 0);
        assert_eq!(alloc.context().store_for_address(data.as_ptr()), None);
        unsafe { alloc.deallocate(data, layout) };

        let empty = alloc.allocate(Layout::new::<()>()).unwrap();
        assert_eq!(empty.len(), 0);
    }
}
