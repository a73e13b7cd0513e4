use std::{io, path::PathBuf};

use thiserror::Error;

/// Everything the block stores can fail with. Resource and capacity failures
/// are recoverable (the front-end falls back to the platform allocator),
/// [`Error::Corruption`] is not.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("could not map `{path}`")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no space left for a run of {blocks} blocks")]
    NoSpace { blocks: usize },
    #[error("pointer {0:#x} is not a live allocation of this block store")]
    ForeignPointer(usize),
    #[error("block store does not exist (anymore)")]
    UnknownStore,
    #[error("already at the limit of {max} block stores")]
    TooManyStores { max: usize },
    #[error("metrics row has {actual} columns, `{file}` expects {expected}")]
    ColumnCount {
        file: String,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

/// A violated block-store invariant. Each variant names the invariant, and
/// carries enough indices to find the offending header in a debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CorruptionError {
    #[error("block {block} is outside the arena of {number_of_blocks} blocks")]
    BlockOutOfBounds {
        block: usize,
        number_of_blocks: usize,
    },
    #[error("page {page} is outside the page table of {number_of_pages} pages")]
    PageOutOfBounds { page: usize, number_of_pages: usize },
    #[error("live header at block {block} has a run length of zero")]
    EmptyHeader { block: usize },
    #[error("header at block {block} has allocation flag {value}")]
    InvalidAllocationFlag { block: usize, value: u32 },
    #[error("block {block} is not allocated")]
    NotAllocated { block: usize },
    #[error("block {block} points back to {previous}, which does not end at it")]
    BrokenBackPointer { block: usize, previous: usize },
    #[error("block {next} after block {block} does not point back at it")]
    BrokenForwardLink { block: usize, next: usize },
    #[error("run at block {block} is {blocks} blocks, not enough for {needed}")]
    RunTooShort {
        block: usize,
        blocks: usize,
        needed: usize,
    },
    #[error("page {page} has run length {actual}, expected {expected}")]
    RunLength {
        page: usize,
        expected: usize,
        actual: i64,
    },
    #[error("page {page} records {recorded} allocated blocks, but {scanned} were found")]
    PageAccounting {
        page: usize,
        recorded: usize,
        scanned: usize,
    },
    #[error("block store records {recorded} allocations, but {scanned} were found")]
    AllocationCount { recorded: usize, scanned: usize },
    #[error("heap parent page {parent} is less full than child page {child}")]
    HeapOrder { parent: usize, child: usize },
    #[error("page {page} has heap index {heap_index}, which does not refer back to it")]
    HeapIndex { page: usize, heap_index: i64 },
    #[error("heap holds page {page} past the end of the page table")]
    HeapEntryOutOfBounds { page: usize },
}
