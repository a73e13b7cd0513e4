//! The block protocol. A block store's data mapping is an array of 128 byte
//! blocks. An allocation is a run of blocks, the first of which is a header
//! describing the run, followed by the payload:
//!
//! ```text
//! | header | payload ... | header | payload | header | (free) ... |
//!  \________ run ______/  \___ run ______/  \____ run _________/
//! ```
//!
//! Runs are linked backwards by *block index*, never by address, so that the
//! mapping can live at a different address in a different process and still
//! make sense. Every index read out of the mapping is bounds-checked before we
//! use it to find another header.

use std::{mem, ptr::NonNull};

use bytemuck::{Pod, Zeroable};

use crate::{error::CorruptionError, os::mem::MapFile, util::num::units_for};

pub const BLOCK_SIZE: usize = 128;
pub const NAME_SIZE: usize = 64;

/// How many blocks does a `size`-byte allocation take, including its header?
pub fn blocks_needed_for_size(size: usize) -> usize {
    1 + units_for(size, BLOCK_SIZE)
}

/// The in-place header at the start of each run.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BlockHeader {
    /// Debug name, NUL terminated
    name: [u8; NAME_SIZE],
    is_allocated: u32,
    _reserved: u32,
    number_of_blocks: u64,
    /// Index + 1 of the previous header in the same page, 0 for none (so that
    /// a zeroed file decodes as "no back-pointer")
    previous_block: u64,
}

const _: () = assert!(mem::size_of::<BlockHeader>() <= BLOCK_SIZE);

impl BlockHeader {
    /// A fresh free run of `number_of_blocks` blocks
    pub fn free(number_of_blocks: usize, previous_block: Option<usize>) -> Self {
        let mut header = Self::zeroed();
        header.number_of_blocks = number_of_blocks as u64;
        header.set_previous_block(previous_block);
        header
    }

    pub fn is_allocated(&self) -> bool {
        self.is_allocated != 0
    }

    pub(crate) fn raw_allocation_flag(&self) -> u32 {
        self.is_allocated
    }

    pub fn set_allocated(&mut self, allocated: bool) {
        self.is_allocated = allocated as u32;
    }

    pub fn number_of_blocks(&self) -> usize {
        self.number_of_blocks as usize
    }

    pub fn set_number_of_blocks(&mut self, number_of_blocks: usize) {
        self.number_of_blocks = number_of_blocks as u64;
    }

    pub fn previous_block(&self) -> Option<usize> {
        self.previous_block.checked_sub(1).map(|index| index as usize)
    }

    pub fn set_previous_block(&mut self, previous_block: Option<usize>) {
        self.previous_block = previous_block.map_or(0, |index| index as u64 + 1);
    }

    /// The debug name, up to the first NUL. `None` if it was never set or
    /// isn't valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        if len == 0 {
            return None;
        }
        std::str::from_utf8(&self.name[..len]).ok()
    }

    /// Copy in `name`, truncated to fit (at a char boundary) with room for the
    /// NUL.
    pub fn set_name(&mut self, name: Option<&str>) {
        self.name = [0; NAME_SIZE];
        let Some(name) = name else { return };
        let mut len = name.len().min(NAME_SIZE - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }
}

/// A bounds-checked view of the data mapping as an array of blocks.
pub struct BlockArena {
    map: MapFile,
    number_of_blocks: usize,
}

impl BlockArena {
    pub fn new(map: MapFile) -> Self {
        let number_of_blocks = map.len() / BLOCK_SIZE;
        Self {
            map,
            number_of_blocks,
        }
    }

    pub fn number_of_blocks(&self) -> usize {
        self.number_of_blocks
    }

    pub fn map(&self) -> &MapFile {
        &self.map
    }

    pub fn check(&self, block: usize) -> Result<(), CorruptionError> {
        if block < self.number_of_blocks {
            Ok(())
        } else {
            Err(CorruptionError::BlockOutOfBounds {
                block,
                number_of_blocks: self.number_of_blocks,
            })
        }
    }

    pub fn header(&self, block: usize) -> Result<&BlockHeader, CorruptionError> {
        self.check(block)?;
        // SAFETY:
        // - `block < number_of_blocks`, so the header lies inside the mapping
        // - The mapping is page aligned, so every block is 128 byte aligned,
        //   which is plenty for `BlockHeader`
        // - Every bit pattern is a valid `BlockHeader` (it's `Pod`)
        // - We only ever hand out references into header blocks, and callers
        //   only ever get pointers to payload blocks, so these don't alias
        Ok(unsafe { &*self.block_ptr(block).cast::<BlockHeader>() })
    }

    pub fn header_mut(&mut self, block: usize) -> Result<&mut BlockHeader, CorruptionError> {
        self.check(block)?;
        // SAFETY: As for `header()`, and `&mut self` makes this unique.
        Ok(unsafe { &mut *self.block_ptr(block).cast::<BlockHeader>() })
    }

    pub fn write_header(&mut self, block: usize, header: BlockHeader) -> Result<(), CorruptionError> {
        *self.header_mut(block)? = header;
        Ok(())
    }

    fn block_ptr(&self, block: usize) -> *mut u8 {
        debug_assert!(block < self.number_of_blocks);
        // SAFETY: Callers have checked `block` against the arena size
        unsafe { self.map.as_ptr().add(block * BLOCK_SIZE) }
    }

    /// Pointer to the payload of the run whose header is at `block`
    pub fn payload(&self, block: usize) -> Result<NonNull<u8>, CorruptionError> {
        self.check(block + 1)?;
        // SAFETY: `block + 1` is in bounds, so this is a non-null pointer into
        //         the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.block_ptr(block + 1)) })
    }

    /// Find the header block for the payload pointer `ptr`. `None` if `ptr`
    /// isn't the start of a payload in this arena.
    pub fn block_for_payload(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.map.as_ptr() as usize)?;
        if offset % BLOCK_SIZE != 0 || offset < BLOCK_SIZE {
            return None;
        }
        let block = offset / BLOCK_SIZE - 1;
        (block + 1 < self.number_of_blocks).then_some(block)
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.map.contains(ptr as usize)
    }

    /// Fill the payload blocks of the run at `block` with `byte`
    pub fn fill_payload(&mut self, block: usize, number_of_blocks: usize, byte: u8) -> Result<(), CorruptionError> {
        if number_of_blocks <= 1 {
            return Ok(());
        }
        self.check(block + number_of_blocks - 1)?;
        // SAFETY: The whole run is in bounds (checked above) and is ours to
        //         scribble on; nobody holds a reference into payload blocks.
        unsafe {
            self.block_ptr(block + 1)
                .write_bytes(byte, (number_of_blocks - 1) * BLOCK_SIZE);
        }
        Ok(())
    }

    /// Copy `len` payload bytes from the run at `from` to the run at `to`.
    pub fn copy_payload(&mut self, from: usize, to: usize, len: usize) -> Result<(), CorruptionError> {
        if len == 0 {
            return Ok(());
        }
        let blocks = units_for(len, BLOCK_SIZE);
        self.check(from + blocks)?;
        self.check(to + blocks)?;
        // SAFETY:
        // - Both ranges are in bounds (checked above)
        // - Distinct live runs never overlap
        unsafe {
            std::ptr::copy_nonoverlapping(self.block_ptr(from + 1), self.block_ptr(to + 1), len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_in_a_block() {
        assert_eq!(mem::size_of::<BlockHeader>(), 88);
        assert_eq!(blocks_needed_for_size(0), 1);
        assert_eq!(blocks_needed_for_size(40), 2);
        assert_eq!(blocks_needed_for_size(128), 2);
        assert_eq!(blocks_needed_for_size(129), 3);
    }

    #[test]
    fn zeroed_header_has_no_back_pointer() {
        let mut header = BlockHeader::zeroed();
        assert_eq!(header.previous_block(), None);
        header.set_previous_block(Some(0));
        assert_eq!(header.previous_block(), Some(0));
        header.set_previous_block(None);
        assert_eq!(header.previous_block(), None);
    }

    #[test]
    fn names_are_truncated_at_char_boundaries() {
        let mut header = BlockHeader::zeroed();
        assert_eq!(header.name(), None);
        header.set_name(Some("hello"));
        assert_eq!(header.name(), Some("hello"));
        let long = "é".repeat(40);
        header.set_name(Some(&long));
        let name = header.name().unwrap();
        assert!(name.len() <= NAME_SIZE - 1);
        assert!(name.chars().all(|c| c == 'é'));
    }
}
