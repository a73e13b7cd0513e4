//! The tracking allocator front-end.
//!
//! An [`AllocatorContext`] owns a set of block stores and routes allocations
//! to them:
//!
//! - Small requests go to the calling thread's default store: whatever was
//!   last pushed with [`AllocatorContext::push_default_store()`], or else a
//!   per-thread `thread-<tid>` store created on first use.
//! - Requests at or above the dedicated threshold get a store of their own
//!   (while under the store cap), which is torn down once it's empty again.
//! - Anything the stores can't take goes to the platform allocator.
//!
//! Two locks guard the state: the registry lock (store creation, teardown and
//! address lookup) and the allocations lock (everything that touches a
//! store). When both are needed they are taken in that order.

use std::{
    cell::{Cell, RefCell},
    marker::PhantomData,
    path::Path,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use allocator_api2::alloc::AllocError;

use crate::{
    alloc::{
        store::{current_thread_name, BlockStore, BlockStoreStats},
        system::SystemAllocator,
        RawAllocator,
    },
    config::Config,
    error::{CorruptionError, Error},
    metrics::stack_trace::StackTrace,
    sync::FutexMutex,
    util::{hint::cold, print::putstr},
};

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Set while this thread is inside the allocator
    static IN_ALLOCATOR: Cell<bool> = const { Cell::new(false) };

    /// `(context id, store)` pairs, innermost last
    static DEFAULT_STORES: RefCell<Vec<(usize, StoreId)>> = const { RefCell::new(Vec::new()) };
}

/// Marks the calling thread as inside the allocator until dropped. While it
/// is held, [`crate::alloc::global::TrackingAlloc`] hands every request
/// straight to the platform allocator, so our own bookkeeping never recurses
/// into the stores (or into a lock we already hold).
pub(crate) struct ReentrancyGuard {
    entered: bool,
}

impl ReentrancyGuard {
    pub(crate) fn enter() -> Self {
        let entered = IN_ALLOCATOR
            .try_with(|inside| !inside.replace(true))
            .unwrap_or(false);
        Self { entered }
    }

    /// Also `true` once thread-locals are gone, since we can't track anything
    /// at that point anyway
    pub(crate) fn is_active() -> bool {
        IN_ALLOCATOR.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        if self.entered {
            _ = IN_ALLOCATOR.try_with(|inside| inside.set(false));
        }
    }
}

/// Names a store within its [`AllocatorContext`]. Ids of destroyed stores are
/// never handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    store: Option<BlockStore>,
}

struct StoreSlab {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
}

impl StoreSlab {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    fn insert(&mut self, store: BlockStore) -> StoreId {
        match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.store = Some(store);
                StoreId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    store: Some(store),
                });
                StoreId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn slot_mut(&mut self, id: StoreId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    fn get(&self, id: StoreId) -> Option<&BlockStore> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?
            .store
            .as_ref()
    }

    fn get_mut(&mut self, id: StoreId) -> Option<&mut BlockStore> {
        self.slot_mut(id)?.store.as_mut()
    }

    fn remove(&mut self, id: StoreId) -> Option<BlockStore> {
        let slot = self.slot_mut(id)?;
        let store = slot.store.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        Some(store)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (StoreId, &mut BlockStore)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.store.as_mut().map(|store| {
                (
                    StoreId {
                        index: index as u32,
                        generation,
                    },
                    store,
                )
            })
        })
    }
}

struct StoreRange {
    start: usize,
    end: usize,
    id: StoreId,
}

struct Registry {
    ranges: Vec<StoreRange>,
    dedicated_counter: usize,
}

pub struct AllocatorContext {
    id: usize,
    config: Config,
    registry: FutexMutex<Registry>,
    stores: FutexMutex<StoreSlab>,
}

/// Aborts the process. Corrupt block stores can't be trusted with another
/// allocation, and unwinding would need one.
#[cold]
fn corrupted(err: CorruptionError) -> ! {
    log::error!("block store corruption: {err}");
    putstr("memtrack: block store corruption detected, aborting\n");
    std::process::abort()
}

impl AllocatorContext {
    pub fn new(config: Config) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            registry: FutexMutex::new(Registry {
                ranges: Vec::new(),
                dedicated_counter: 0,
            }),
            stores: FutexMutex::new(StoreSlab::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_tracking(&self) -> bool {
        self.config.track_allocations
    }

    fn register(&self, registry: &mut Registry, store: BlockStore) -> StoreId {
        let (start, end) = store.address_range();
        let id = self.stores.lock().insert(store);
        registry.ranges.push(StoreRange { start, end, id });
        id
    }

    /// Open a named store of `size` bytes and register it with this context
    pub fn create_store(&self, name: &str, size: usize) -> Result<StoreId, Error> {
        let _guard = ReentrancyGuard::enter();
        let mut registry = self.registry.lock();
        let store = BlockStore::open(&self.config, name, size)?;
        Ok(self.register(&mut registry, store))
    }

    fn create_dedicated_store(&self, size: usize) -> Result<StoreId, Error> {
        let mut registry = self.registry.lock();
        let max = self.config.max_allocation_block_stores;
        if registry.ranges.len() >= max {
            return Err(Error::TooManyStores { max });
        }
        let counter = registry.dedicated_counter;
        registry.dedicated_counter += 1;

        let name = format!("allocation-{size}-{counter}");
        let store_size = size.max(self.config.allocation_block_store_size / 10);
        let mut store = BlockStore::open(&self.config, &name, store_size)?;
        store.set_dedicated(true);
        store.set_stack_trace(StackTrace::capture(4, 5, " -> "));
        Ok(self.register(&mut registry, store))
    }

    fn create_thread_default_store(&self) -> Result<StoreId, Error> {
        let mut registry = self.registry.lock();
        let mut store = BlockStore::open(
            &self.config,
            &current_thread_name(),
            self.config.allocation_block_store_size,
        )?;
        store.set_thread_default(true);
        store.set_stack_trace(StackTrace::capture(4, 5, " -> "));
        Ok(self.register(&mut registry, store))
    }

    /// Unregister and close a store, removing its files. Anything still
    /// allocated in it is gone.
    pub fn destroy_store(&self, id: StoreId) -> Result<(), Error> {
        let _guard = ReentrancyGuard::enter();
        let store = {
            let mut registry = self.registry.lock();
            let store = self.stores.lock().remove(id).ok_or(Error::UnknownStore)?;
            registry.ranges.retain(|range| range.id != id);
            store
        };
        drop(store);
        Ok(())
    }

    /// Destroy `id` if it is a dedicated store with nothing left in it. The
    /// count is checked again under both locks, since an allocation could
    /// have slipped in since the caller looked.
    fn destroy_store_if_empty(&self, id: StoreId) {
        let store = {
            let mut registry = self.registry.lock();
            let mut stores = self.stores.lock();
            match stores.get(id) {
                Some(store) if store.is_dedicated() && store.number_of_allocations() == 0 => {}
                _ => return,
            }
            registry.ranges.retain(|range| range.id != id);
            stores.remove(id)
        };
        if let Some(store) = store {
            log::debug!("dedicated store {} is empty, tearing it down", store.name());
        }
    }

    /// Which store owns the address `data`, if any
    pub fn store_for_address(&self, data: *const u8) -> Option<StoreId> {
        let addr = data as usize;
        self.registry
            .lock()
            .ranges
            .iter()
            .find(|range| (range.start..range.end).contains(&addr))
            .map(|range| range.id)
    }

    pub fn number_of_stores(&self) -> usize {
        self.registry.lock().ranges.len()
    }

    /// Make `id` the calling thread's default store until the guard is
    /// dropped
    pub fn push_default_store(&self, id: StoreId) -> DefaultStoreGuard<'_> {
        let _guard = ReentrancyGuard::enter();
        _ = DEFAULT_STORES.try_with(|stack| stack.borrow_mut().push((self.id, id)));
        DefaultStoreGuard {
            context: self,
            id,
            _not_send: PhantomData,
        }
    }

    /// The calling thread's current default store, creating the per-thread
    /// one if nothing has been pushed. `None` if there's no way to get one.
    pub fn thread_default_store(&self) -> Option<StoreId> {
        let top = DEFAULT_STORES
            .try_with(|stack| {
                let stack = stack.try_borrow().ok()?;
                Some(
                    stack
                        .iter()
                        .rev()
                        .find(|(context, _)| *context == self.id)
                        .map(|(_, id)| *id),
                )
            })
            .ok()
            .flatten()?;
        if top.is_some() {
            return top;
        }

        let _guard = ReentrancyGuard::enter();
        let id = match self.create_thread_default_store() {
            Ok(id) => id,
            Err(err) => {
                log::warn!("could not create a default block store for this thread: {err}");
                return None;
            }
        };
        let pushed = DEFAULT_STORES
            .try_with(|stack| match stack.try_borrow_mut() {
                // underneath anything pushed in the meantime
                Ok(mut stack) => {
                    stack.insert(0, (self.id, id));
                    true
                }
                Err(_) => false,
            })
            .unwrap_or(false);
        pushed.then_some(id)
    }

    /// Run `f` on the store `id` under the allocations lock
    pub fn with_store<R>(&self, id: StoreId, f: impl FnOnce(&mut BlockStore) -> R) -> Result<R, Error> {
        let _guard = ReentrancyGuard::enter();
        let mut stores = self.stores.lock();
        let store = stores.get_mut(id).ok_or(Error::UnknownStore)?;
        Ok(f(store))
    }

    /// Allocate straight from store `id`, with no fallback
    pub fn allocate_in(&self, id: StoreId, size: usize, name: Option<&str>) -> Result<NonNull<u8>, Error> {
        self.with_store(id, |store| store.allocate(size, name))?
    }

    fn recover<T>(&self, result: Result<T, Error>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(Error::Corruption(err)) => corrupted(err),
            Err(err) => cold(|| {
                log::debug!("falling back to the platform allocator: {err}");
                None
            }),
        }
    }

    fn allocate_dedicated(&self, size: usize, name: Option<&str>) -> Option<NonNull<u8>> {
        let id = match self.create_dedicated_store(size) {
            Ok(id) => id,
            Err(err) => {
                log::debug!("no dedicated store for {size} bytes: {err}");
                return None;
            }
        };
        let result = self.allocate_in(id, size, name);
        if result.is_err() {
            self.destroy_store_if_empty(id);
        }
        self.recover(result)
    }

    fn allocate_tracked(&self, size: usize, name: Option<&str>) -> Option<NonNull<u8>> {
        let default_store = self.thread_default_store()?;
        if size >= self.config.dedicated_allocation_block_store_threshold {
            if let Some(data) = self.allocate_dedicated(size, name) {
                return Some(data);
            }
        }
        self.recover(self.allocate_in(default_store, size, name))
    }

    /// Zeroed storage for `size` bytes, from a store if we're tracking and
    /// one has room, from the platform allocator otherwise
    pub fn allocate_with_name(&self, size: usize, name: Option<&str>) -> Result<NonNull<u8>, AllocError> {
        if self.config.track_allocations {
            let _guard = ReentrancyGuard::enter();
            if let Some(data) = self.allocate_tracked(size, name) {
                return Ok(data);
            }
        }
        SystemAllocator.allocate(size)
    }

    /// Per-store summaries, in no particular order
    pub fn stats(&self) -> Vec<BlockStoreStats> {
        let _guard = ReentrancyGuard::enter();
        let mut stores = self.stores.lock();
        stores.iter_mut().map(|(_, store)| store.stats()).collect()
    }

    pub fn store_ids(&self) -> Vec<StoreId> {
        let _guard = ReentrancyGuard::enter();
        let mut stores = self.stores.lock();
        stores.iter_mut().map(|(id, _)| id).collect()
    }

    /// Run the full consistency check over every store
    pub fn validate(&self) -> Result<(), CorruptionError> {
        let _guard = ReentrancyGuard::enter();
        let mut stores = self.stores.lock();
        let result = stores.iter_mut().try_for_each(|(_, store)| store.validate());
        result
    }

    pub fn write_allocation_list(&self, id: StoreId, path: &Path) -> Result<(), Error> {
        Ok(self.with_store(id, |store| store.write_allocation_list(path))??)
    }

    /// `None` if `data` isn't a live allocation in one of our stores
    pub fn payload_size(&self, data: NonNull<u8>) -> Option<usize> {
        let id = self.store_for_address(data.as_ptr())?;
        self.with_store(id, |store| store.payload_size(data)).ok()?
    }
}

// SAFETY:
// - Store payloads are 128 byte aligned and the platform allocator's are
//   `max_align_t` aligned
// - Every pointer is freed by whoever owns its address, so handing any of
//   them back to `free()` is fine
unsafe impl RawAllocator for AllocatorContext {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with_name(size, None)
    }

    unsafe fn reallocate(&self, data: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError> {
        let _guard = ReentrancyGuard::enter();
        let Some(id) = self.store_for_address(data.as_ptr()) else {
            // SAFETY: Not ours, so it's the platform allocator's
            return unsafe { SystemAllocator.reallocate(data, size) };
        };
        let size = size.max(1);
        // SAFETY: The caller's contract covers `data`
        let result = self.with_store(id, |store| unsafe { store.reallocate(data, size) });
        match result.and_then(|result| result) {
            Ok(Some(moved)) => Ok(moved),
            Ok(None) => Err(AllocError),
            Err(Error::Corruption(err)) => corrupted(err),
            Err(err @ Error::NoSpace { .. }) => cold(|| {
                log::debug!("moving {data:p} to the platform allocator: {err}");
                let moved = SystemAllocator.allocate(size)?;
                let len = self.payload_size(data).unwrap_or(0).min(size);
                // SAFETY:
                // - `data` has at least `len` live bytes, `moved` has `size`
                // - A fresh allocation doesn't overlap a live one
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), moved.as_ptr(), len);
                    self.free(data);
                }
                Ok(moved)
            }),
            Err(err) => {
                log::warn!("could not reallocate {data:p}: {err}");
                Err(AllocError)
            }
        }
    }

    unsafe fn free(&self, data: NonNull<u8>) {
        let _guard = ReentrancyGuard::enter();
        let Some(id) = self.store_for_address(data.as_ptr()) else {
            // SAFETY: Not ours, so it's the platform allocator's
            unsafe { RawAllocator::free(&SystemAllocator, data) };
            return;
        };
        let emptied = {
            let mut stores = self.stores.lock();
            let Some(store) = stores.get_mut(id) else {
                log::warn!("{data:p} belongs to a store that is already gone");
                return;
            };
            // SAFETY: The caller's contract covers `data`
            match unsafe { store.deallocate(data) } {
                Ok(()) => store.is_dedicated() && store.number_of_allocations() == 0,
                Err(Error::Corruption(err)) => {
                    drop(stores);
                    corrupted(err)
                }
                Err(err) => {
                    log::warn!("ignoring free of {data:p}: {err}");
                    false
                }
            }
        };
        if emptied {
            self.destroy_store_if_empty(id);
        }
    }
}

/// Keeps a store pushed as the calling thread's default. Pops it on drop,
/// unwinding included.
pub struct DefaultStoreGuard<'a> {
    context: &'a AllocatorContext,
    id: StoreId,
    _not_send: PhantomData<*const ()>,
}

impl DefaultStoreGuard<'_> {
    pub fn store(&self) -> StoreId {
        self.id
    }
}

impl Drop for DefaultStoreGuard<'_> {
    fn drop(&mut self) {
        let entry = (self.context.id, self.id);
        _ = DEFAULT_STORES.try_with(|stack| {
            if let Ok(mut stack) = stack.try_borrow_mut() {
                if let Some(index) = stack.iter().rposition(|pushed| *pushed == entry) {
                    stack.remove(index);
                }
            }
        });
    }
}
