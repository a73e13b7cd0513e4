//! Block stores and the allocator front-end built on them.
//!
//! Bottom up: [`block`] is the on-file header protocol, [`page_table`] the
//! best-fit page heap, [`file_map`] the two combined, [`store`] a named
//! [`file_map::FileMap`], and [`context`] the tracking allocator that routes
//! requests between stores and the platform allocator.

use std::ptr::NonNull;

use allocator_api2::alloc::AllocError;

pub mod block;
pub mod context;
pub mod file_map;
pub mod global;
pub mod page_table;
pub mod store;
pub mod store_alloc;
pub mod system;

pub use context::{AllocatorContext, DefaultStoreGuard, StoreId};
pub use global::TrackingAlloc;
pub use store::{BlockStore, BlockStoreStats};
pub use store_alloc::StoreAllocator;
pub use system::SystemAllocator;

/// An untyped, `malloc()`-shaped allocator.
///
/// # Safety
///
/// Implementors must hand out pointers to at least `size` zeroed bytes,
/// aligned to at least `align_of::<libc::max_align_t>()`, that stay valid
/// until passed back to [`RawAllocator::free()`] or
/// [`RawAllocator::reallocate()`].
pub unsafe trait RawAllocator {
    /// Zeroed storage for `size` bytes
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Resize `data` to `size` bytes, moving it if needed. A `size` of zero
    /// is treated as one. On error, `data` is left as it was.
    ///
    /// # Safety
    ///
    /// `data` must be a live allocation of this allocator, and must not be
    /// used after a successful call other than through the returned pointer.
    unsafe fn reallocate(&self, data: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `data` must be a live allocation of this allocator, and must not be
    /// used again.
    unsafe fn free(&self, data: NonNull<u8>);

    /// A fresh allocation holding a copy of `bytes`
    fn copy(&self, bytes: &[u8]) -> Result<NonNull<u8>, AllocError> {
        let data = self.allocate(bytes.len())?;
        // SAFETY:
        // - `data` has room for `bytes.len()` bytes
        // - A fresh allocation can't overlap a slice the caller holds
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len()) };
        Ok(data)
    }
}
