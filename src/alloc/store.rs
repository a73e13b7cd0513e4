use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    ptr::NonNull,
};

use serde::Serialize;

use crate::{
    alloc::{
        block::{blocks_needed_for_size, BLOCK_SIZE, NAME_SIZE},
        file_map::FileMap,
    },
    config::Config,
    error::{CorruptionError, Error},
    metrics::stack_trace::StackTrace,
};

/// A named arena of 128 byte blocks, backed by a pair of mapped files.
pub struct BlockStore {
    name: String,
    thread_name: String,
    file_map: FileMap,
    stack_trace: Option<StackTrace>,
    is_dedicated: bool,
    is_thread_default: bool,
}

/// A point-in-time summary of a [`BlockStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockStoreStats {
    pub name: String,
    pub thread_name: String,
    pub number_of_allocations: usize,
    pub total_bytes_allocated: usize,
    pub number_of_pages: usize,
    pub max_number_of_pages: usize,
    pub heap_size: usize,
    pub is_dedicated: bool,
    pub is_thread_default: bool,
    pub stack_trace: Option<String>,
}

/// One live allocation, as seen from the outside
#[derive(Debug, Clone, Copy)]
pub struct AllocationInfo<'a> {
    pub payload: NonNull<u8>,
    pub payload_size: usize,
    pub name: Option<&'a str>,
}

/// `thread-<tid>`, the name of the calling thread's default store
pub fn current_thread_name() -> String {
    // SAFETY: `gettid()` has no preconditions
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    format!("thread-{tid}")
}

/// `<dir>/user-<uid>-for-pid-<pid>-<name>`
pub fn data_path(dir: &Path, name: &str) -> PathBuf {
    // SAFETY: `getuid()` has no preconditions
    let uid = unsafe { libc::getuid() };
    let name: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    dir.join(format!("user-{uid}-for-pid-{}-{name}", std::process::id()))
}

impl BlockStore {
    /// Map a store big enough for a `size` byte allocation, in
    /// `config.allocation_map_dir`.
    ///
    /// # Errors
    /// - [`Error::Map`] if either file can't be created or mapped
    pub fn open(config: &Config, name: &str, size: usize) -> Result<Self, Error> {
        let data_path = data_path(&config.allocation_map_dir, name);
        let mut page_table_path = data_path.clone().into_os_string();
        page_table_path.push("-page-table");
        let file_map = FileMap::open(config, &data_path, Path::new(&page_table_path), size)?;
        log::debug!(
            "opened block store {name} ({} pages) at {}",
            file_map.page_table().max_number_of_pages(),
            data_path.display()
        );
        Ok(Self {
            name: name.to_owned(),
            thread_name: current_thread_name(),
            file_map,
            stack_trace: None,
            is_dedicated: false,
            is_thread_default: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn is_dedicated(&self) -> bool {
        self.is_dedicated
    }

    pub fn set_dedicated(&mut self, dedicated: bool) {
        self.is_dedicated = dedicated;
    }

    pub fn is_thread_default(&self) -> bool {
        self.is_thread_default
    }

    pub fn set_thread_default(&mut self, thread_default: bool) {
        self.is_thread_default = thread_default;
    }

    pub fn stack_trace(&mut self) -> Option<&mut StackTrace> {
        self.stack_trace.as_mut()
    }

    pub fn set_stack_trace(&mut self, stack_trace: StackTrace) {
        self.stack_trace = Some(stack_trace);
    }

    pub fn file_map(&self) -> &FileMap {
        &self.file_map
    }

    pub fn number_of_allocations(&self) -> usize {
        self.file_map.number_of_allocations()
    }

    pub fn total_bytes_allocated(&self) -> usize {
        self.file_map.total_bytes_allocated()
    }

    /// The address range the store hands out pointers from
    pub fn address_range(&self) -> (usize, usize) {
        let map = self.file_map.arena().map();
        let start = map.as_ptr() as usize;
        (start, start + map.len())
    }

    /// Zeroed storage for `size` bytes, tagged with `name` for debugging.
    /// Zero-sized requests still get a unique pointer.
    pub fn allocate(&mut self, size: usize, name: Option<&str>) -> Result<NonNull<u8>, Error> {
        let number_of_blocks = blocks_needed_for_size(size.max(1));
        let block = self.file_map.allocate(number_of_blocks, name)?;
        let arena = self.file_map.arena_mut();
        arena.fill_payload(block, number_of_blocks, 0)?;
        Ok(arena.payload(block)?)
    }

    /// A fresh allocation holding a copy of `data`
    pub fn copy(&mut self, data: &[u8], name: Option<&str>) -> Result<NonNull<u8>, Error> {
        let copy = self.allocate(data.len(), name)?;
        // SAFETY:
        // - `copy` was just allocated with room for `data.len()` bytes
        // - A fresh allocation can't overlap a slice the caller holds
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), copy.as_ptr(), data.len());
        }
        Ok(copy)
    }

    /// The header block for a live allocation's payload pointer
    fn block_for(&self, data: NonNull<u8>) -> Result<usize, Error> {
        let arena = self.file_map.arena();
        let foreign = || Error::ForeignPointer(data.as_ptr() as usize);
        let block = arena.block_for_payload(data.as_ptr()).ok_or_else(foreign)?;
        let header = arena.header(block)?;
        if !header.is_allocated() {
            return Err(CorruptionError::NotAllocated { block }.into());
        }
        Ok(block)
    }

    /// Resize the allocation at `data`. `Ok(None)` means `size` was zero and
    /// the allocation is gone.
    ///
    /// If there's no room for the new size the old allocation is left as it
    /// was, and [`Error::NoSpace`] is returned.
    ///
    /// # Safety
    ///
    /// `data` must not be used after a successful call, other than through the
    /// returned pointer (which may be the same).
    pub unsafe fn reallocate(
        &mut self,
        data: NonNull<u8>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, Error> {
        if size == 0 {
            // SAFETY: Passed on to the caller
            unsafe { self.deallocate(data)? };
            return Ok(None);
        }
        let block = self.block_for(data)?;
        let old_number_of_blocks = self.file_map.arena().header(block)?.number_of_blocks();
        let number_of_blocks = blocks_needed_for_size(size);

        if number_of_blocks == old_number_of_blocks {
            return Ok(Some(data));
        }
        if number_of_blocks < old_number_of_blocks {
            self.file_map.shrink(block, number_of_blocks)?;
            return Ok(Some(data));
        }
        if self.file_map.grow(block, number_of_blocks)? {
            return Ok(Some(data));
        }

        let old_size = (old_number_of_blocks - 1) * BLOCK_SIZE;
        // the header gets rewritten by the release, so take a copy
        let mut name_buf = [0; NAME_SIZE];
        let name_len = match self.file_map.arena().header(block)?.name() {
            Some(name) => {
                name_buf[..name.len()].copy_from_slice(name.as_bytes());
                name.len()
            }
            None => 0,
        };
        let name = std::str::from_utf8(&name_buf[..name_len])
            .ok()
            .filter(|name| !name.is_empty());
        let moved = match self.file_map.allocate(number_of_blocks, name) {
            Ok(moved) => moved,
            Err(err) => {
                // grow may have swallowed free blocks before giving up
                let grown = self.file_map.arena().header(block)?.number_of_blocks();
                if grown > old_number_of_blocks {
                    self.file_map.shrink(block, old_number_of_blocks)?;
                }
                return Err(err);
            }
        };
        let arena = self.file_map.arena_mut();
        arena.copy_payload(block, moved, old_size.min(size))?;
        self.file_map.release(block)?;
        Ok(Some(self.file_map.arena().payload(moved)?))
    }

    /// # Safety
    ///
    /// `data` must not be used again.
    pub unsafe fn deallocate(&mut self, data: NonNull<u8>) -> Result<(), Error> {
        let block = self.block_for(data)?;
        self.file_map.release(block)
    }

    /// Does `data` point into this store's mapping at all?
    pub fn has_allocation(&self, data: *const u8) -> bool {
        self.file_map.arena().contains(data)
    }

    /// Usable bytes behind the payload pointer `data`
    pub fn payload_size(&self, data: NonNull<u8>) -> Option<usize> {
        let block = self.block_for(data).ok()?;
        let header = self.file_map.arena().header(block).ok()?;
        Some((header.number_of_blocks() - 1) * BLOCK_SIZE)
    }

    pub fn validate(&self) -> Result<(), CorruptionError> {
        self.file_map.validate()
    }

    pub fn allocations(&self) -> impl Iterator<Item = AllocationInfo<'_>> {
        let arena = self.file_map.arena();
        self.file_map.allocations().filter_map(move |(block, header)| {
            Some(AllocationInfo {
                payload: arena.payload(block).ok()?,
                payload_size: (header.number_of_blocks() - 1) * BLOCK_SIZE,
                name: header.name(),
            })
        })
    }

    pub fn for_each_allocation(&self, mut f: impl FnMut(AllocationInfo<'_>)) {
        for allocation in self.allocations() {
            f(allocation);
        }
    }

    /// One line per live allocation: its debug name, or `(unknown)`
    pub fn write_allocation_list(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for allocation in self.allocations() {
            writeln!(out, "{}", allocation.name.unwrap_or("(unknown)"))?;
        }
        out.flush()
    }

    /// Needs `&mut` to render (and cache) the stack trace
    pub fn stats(&mut self) -> BlockStoreStats {
        let page_table = self.file_map.page_table();
        BlockStoreStats {
            name: self.name.clone(),
            thread_name: self.thread_name.clone(),
            number_of_allocations: self.file_map.number_of_allocations(),
            total_bytes_allocated: self.file_map.total_bytes_allocated(),
            number_of_pages: page_table.number_of_pages(),
            max_number_of_pages: page_table.max_number_of_pages(),
            heap_size: page_table.heap_size(),
            is_dedicated: self.is_dedicated,
            is_thread_default: self.is_thread_default,
            stack_trace: self.stack_trace.as_mut().map(|trace| trace.output().to_owned()),
        }
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        log::debug!(
            "closing block store {} with {} live allocations",
            self.name,
            self.number_of_allocations()
        );
    }
}
