//! Block-level allocation on top of a [`BlockArena`] and its [`PageTable`].
//!
//! Small runs (at most a page of blocks) live in single-page runs and are
//! chained together by their headers; a page's chain always starts at its
//! first block and covers the whole page. Runs bigger than a page own a run
//! of pages outright and are handed back to the page table wholesale.

use std::path::Path;

use crate::{
    alloc::{
        block::{blocks_needed_for_size, BlockArena, BlockHeader, BLOCK_SIZE},
        page_table::PageTable,
    },
    config::{Config, GiveBack},
    error::{CorruptionError, Error},
    os::mem::{Advice, MapFile, PAGE_SIZE},
    util::num::round_up,
};

pub struct FileMap {
    arena: BlockArena,
    page_table: PageTable,
    number_of_allocations: usize,
    total_bytes_allocated: usize,
    give_back: GiveBack,
    validate_blocks: bool,
    validate_heap: bool,
}

impl FileMap {
    /// Map enough blocks for a `size` byte allocation (rounded up to whole
    /// pages), plus a page table with a slot for every page.
    pub fn open(
        config: &Config,
        data_path: &Path,
        page_table_path: &Path,
        size: usize,
    ) -> Result<Self, Error> {
        let data_size = round_up(blocks_needed_for_size(size) * BLOCK_SIZE, *PAGE_SIZE);
        let data = MapFile::open(data_path, data_size, config.map_file_mode).map_err(|source| {
            Error::Map {
                path: data_path.to_owned(),
                source,
            }
        })?;
        let page_table = PageTable::open(
            page_table_path,
            data_size / *PAGE_SIZE,
            config.map_file_mode,
            config.allocated_blocks_threshold,
            config.give_back_deallocated_pages,
        )
        .map_err(|source| Error::Map {
            path: page_table_path.to_owned(),
            source,
        })?;
        Ok(Self {
            arena: BlockArena::new(data),
            page_table,
            number_of_allocations: 0,
            total_bytes_allocated: 0,
            give_back: config.give_back_deallocated_pages,
            validate_blocks: config.validate_allocation_blocks,
            validate_heap: config.validate_heap,
        })
    }

    pub fn arena(&self) -> &BlockArena {
        &self.arena
    }

    pub(crate) fn arena_mut(&mut self) -> &mut BlockArena {
        &mut self.arena
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn number_of_allocations(&self) -> usize {
        self.number_of_allocations
    }

    pub fn total_bytes_allocated(&self) -> usize {
        self.total_bytes_allocated
    }

    fn blocks_per_page(&self) -> usize {
        self.page_table.blocks_per_page()
    }

    /// Claim a run of `number_of_blocks` blocks (header included), returning
    /// the header's block index.
    ///
    /// # Errors
    /// - [`Error::NoSpace`] if neither the heap nor the page table can fit it
    /// - [`Error::Corruption`] if the bookkeeping doesn't add up
    pub fn allocate(&mut self, number_of_blocks: usize, name: Option<&str>) -> Result<usize, Error> {
        let number_of_pages = self.page_table.pages_for_blocks(number_of_blocks);

        let page = match self
            .page_table
            .find_pages_for_blocks(&self.arena, number_of_blocks)?
        {
            Some(page) => {
                let run = self.page_table.run_length(page);
                if run > number_of_pages {
                    // hand back what we don't need, but keep the head of the
                    // run in the table: we're about to use it
                    let extra = page + number_of_pages;
                    self.page_table.remove_page_from_heap(page);
                    self.page_table.set_run_length(page, number_of_pages);
                    self.page_table.set_run_length(extra, run - number_of_pages);
                    self.page_table
                        .deallocate_pages(&mut self.arena, extra, run - number_of_pages, false)?;
                }
                page
            }
            None => self
                .page_table
                .allocate_pages(number_of_pages)
                .ok_or(Error::NoSpace {
                    blocks: number_of_blocks,
                })?,
        };

        if self.page_table.page(page).number_of_allocated_blocks() == 0 {
            let first = self.page_table.first_block_in_page(page);
            if self.give_back != GiveBack::Keep {
                self.arena
                    .map()
                    .advise(page * *PAGE_SIZE, number_of_pages * *PAGE_SIZE, Advice::Normal);
            }
            let run = number_of_blocks.max(self.blocks_per_page());
            self.arena.write_header(first, BlockHeader::free(run, None))?;
            self.page_table.set_run_of_free_blocks(page, Some(first));
        }

        let block = self.best_fit_in_page(page, number_of_blocks)?;
        self.claim(page, block)?;
        if self.arena.header(block)?.number_of_blocks() > number_of_blocks {
            self.shrink(block, number_of_blocks)?;
        }
        self.arena.header_mut(block)?.set_name(name);

        if self.validate_blocks {
            self.validate_block(block)?;
        }
        if self.validate_heap {
            self.page_table.validate_heap()?;
        }
        log::trace!("claimed {number_of_blocks} blocks at block {block} (page {page})");
        Ok(block)
    }

    /// The smallest free run in `page` that can hold `number_of_blocks`. The
    /// heap only knows about a page's largest run, so a page it hands us
    /// always has at least one.
    fn best_fit_in_page(&self, page: usize, number_of_blocks: usize) -> Result<usize, Error> {
        let tracked = self.page_table.page(page).run_of_free_blocks();
        let last = self.page_table.last_block_in_page(page);
        let mut best: Option<(usize, usize)> = None;
        let mut block = self.page_table.first_block_in_page(page);
        while block <= last {
            let header = self.arena.header(block)?;
            let run = header.number_of_blocks();
            if run == 0 {
                return Err(CorruptionError::EmptyHeader { block }.into());
            }
            if !header.is_allocated()
                && run >= number_of_blocks
                && best.map_or(true, |(_, best_run)| run < best_run)
            {
                best = Some((block, run));
            }
            block += run;
        }
        match (best, tracked) {
            (Some((block, _)), _) => Ok(block),
            (None, Some(block)) => Err(CorruptionError::RunTooShort {
                block,
                blocks: self.arena.header(block)?.number_of_blocks(),
                needed: number_of_blocks,
            }
            .into()),
            (None, None) => Err(CorruptionError::RunTooShort {
                block: self.page_table.first_block_in_page(page),
                blocks: 0,
                needed: number_of_blocks,
            }
            .into()),
        }
    }

    fn claim(&mut self, page: usize, block: usize) -> Result<(), Error> {
        let header = self.arena.header_mut(block)?;
        header.set_allocated(true);
        let number_of_blocks = header.number_of_blocks();

        self.total_bytes_allocated += number_of_blocks * BLOCK_SIZE;
        self.number_of_allocations += 1;
        self.page_table
            .increase_page_allocation(page, number_of_blocks);

        if self.page_table.page(page).run_of_free_blocks() == Some(block) {
            let run = self.find_run_of_free_blocks(page)?;
            self.page_table.set_run_of_free_blocks(page, run);
        }
        Ok(())
    }

    /// Consolidate every free run in `page` and return the biggest
    fn find_run_of_free_blocks(&mut self, page: usize) -> Result<Option<usize>, Error> {
        if self.page_table.page(page).number_of_allocated_blocks() >= self.blocks_per_page() {
            return Ok(None);
        }
        let last = self.page_table.last_block_in_page(page);
        let mut biggest: Option<(usize, usize)> = None;
        let mut block = self.page_table.first_block_in_page(page);
        while block <= last {
            let header = self.arena.header(block)?;
            if header.number_of_blocks() == 0 {
                return Err(CorruptionError::EmptyHeader { block }.into());
            }
            if !header.is_allocated() {
                self.consolidate_consecutive_blocks(page, block, usize::MAX)?;
                let run = self.arena.header(block)?.number_of_blocks();
                if biggest.map_or(true, |(_, biggest_run)| run > biggest_run) {
                    biggest = Some((block, run));
                }
            }
            block += self.arena.header(block)?.number_of_blocks();
        }
        Ok(biggest.map(|(block, _)| block))
    }

    /// Merge free runs following `block` (within its page) into it, until it
    /// is at least `number_of_blocks` long or we hit an allocated run.
    fn consolidate_consecutive_blocks(
        &mut self,
        page: usize,
        block: usize,
        number_of_blocks: usize,
    ) -> Result<(), Error> {
        let last = self.page_table.last_block_in_page(page);
        let mut run = self.arena.header(block)?.number_of_blocks();
        while run < number_of_blocks {
            let next = block + run;
            if next > last {
                break;
            }
            let next_header = self.arena.header(next)?;
            if next_header.is_allocated() {
                break;
            }
            let next_run = next_header.number_of_blocks();
            if next_run == 0 {
                return Err(CorruptionError::EmptyHeader { block: next }.into());
            }
            if self.page_table.page(page).run_of_free_blocks() == Some(next) {
                self.page_table.set_run_of_free_blocks(page, None);
            }
            run += next_run;
        }
        self.arena.header_mut(block)?.set_number_of_blocks(run);

        let after = block + run;
        if after <= last {
            self.arena.header_mut(after)?.set_previous_block(Some(block));
        }
        Ok(())
    }

    /// Make `start` the page's tracked free run if it is bigger than the
    /// current one
    fn track_free_run(&mut self, page: usize, start: usize) -> Result<(), Error> {
        let run = self.arena.header(start)?.number_of_blocks();
        let replace = match self.page_table.page(page).run_of_free_blocks() {
            None => true,
            Some(current) if current == start => false,
            Some(current) => {
                let current = self.arena.header(current)?;
                current.is_allocated() || current.number_of_blocks() < run
            }
        };
        if replace {
            self.page_table.set_run_of_free_blocks(page, Some(start));
        }
        Ok(())
    }

    /// Cut the run at `block` down to `number_of_blocks`, handing the rest
    /// back: whole pages go back to the page table, the remainder becomes a
    /// free run right after the allocation.
    pub fn shrink(&mut self, block: usize, number_of_blocks: usize) -> Result<(), Error> {
        let page = self.page_table.page_for_block(block);
        let old_number_of_blocks = self.arena.header(block)?.number_of_blocks();
        if number_of_blocks >= old_number_of_blocks {
            return Ok(());
        }
        let old_pages = self.page_table.run_length(page);
        let new_pages = self.page_table.pages_for_blocks(number_of_blocks);

        self.arena
            .header_mut(block)?
            .set_number_of_blocks(number_of_blocks);
        self.total_bytes_allocated -= (old_number_of_blocks - number_of_blocks) * BLOCK_SIZE;

        let mut blocks_left = old_number_of_blocks - number_of_blocks;
        if old_pages > new_pages {
            let tail = page + new_pages;
            let tail_pages = old_pages - new_pages;
            let tail_allocated: usize = (tail..tail + tail_pages)
                .map(|page| self.page_table.page(page).number_of_allocated_blocks())
                .sum();
            blocks_left -= tail_allocated.min(blocks_left);
            self.page_table.set_run_length(page, new_pages);
            self.page_table.set_run_length(tail, tail_pages);
            self.page_table
                .deallocate_pages(&mut self.arena, tail, tail_pages, true)?;
        }
        if blocks_left == 0 {
            return Ok(());
        }

        self.page_table
            .decrease_page_allocation(&mut self.arena, page, blocks_left)?;
        let next = block + number_of_blocks;
        self.arena
            .write_header(next, BlockHeader::free(blocks_left, Some(block)))?;

        if new_pages == 1 {
            let after = next + blocks_left;
            if after <= self.page_table.last_block_in_page(page) {
                self.arena.header_mut(after)?.set_previous_block(Some(next));
            }
            self.consolidate_consecutive_blocks(page, next, usize::MAX)?;
            self.track_free_run(page, next)?;
        }
        Ok(())
    }

    /// Try to extend the run at `block` to `number_of_blocks` in place, by
    /// swallowing free runs after it. `false` means the caller has to move the
    /// allocation (the run may still have grown a bit).
    pub fn grow(&mut self, block: usize, number_of_blocks: usize) -> Result<bool, Error> {
        let page = self.page_table.page_for_block(block);
        let old_number_of_blocks = self.arena.header(block)?.number_of_blocks();
        if old_number_of_blocks > self.blocks_per_page() {
            return Ok(false);
        }

        self.consolidate_consecutive_blocks(page, block, number_of_blocks)?;
        let grown = self.arena.header(block)?.number_of_blocks();
        if grown > old_number_of_blocks {
            self.total_bytes_allocated += (grown - old_number_of_blocks) * BLOCK_SIZE;
            self.page_table
                .increase_page_allocation(page, grown - old_number_of_blocks);
        }
        if grown > number_of_blocks {
            self.shrink(block, number_of_blocks)?;
        }
        if self.page_table.page(page).run_of_free_blocks().is_none() {
            let run = self.find_run_of_free_blocks(page)?;
            self.page_table.set_run_of_free_blocks(page, run);
        }

        if self.validate_blocks {
            self.validate_block(block)?;
        }
        if self.validate_heap {
            self.page_table.validate_heap()?;
        }
        Ok(self.arena.header(block)?.number_of_blocks() == number_of_blocks)
    }

    /// Free the run at `block`, merging it with free neighbours in its page
    pub fn release(&mut self, block: usize) -> Result<(), Error> {
        let header = self.arena.header(block)?;
        if !header.is_allocated() {
            return Err(CorruptionError::NotAllocated { block }.into());
        }
        if self.validate_blocks {
            if let Some(previous) = header.previous_block() {
                self.validate_block(previous)?;
            }
            self.validate_block(block)?;
        }
        let number_of_blocks = header.number_of_blocks();
        let page = self.page_table.page_for_block(block);

        self.arena.header_mut(block)?.set_allocated(false);
        self.total_bytes_allocated = self
            .total_bytes_allocated
            .saturating_sub(number_of_blocks * BLOCK_SIZE);
        self.number_of_allocations = self.number_of_allocations.saturating_sub(1);

        if number_of_blocks > self.blocks_per_page() {
            let run = self.page_table.run_length(page);
            self.page_table
                .deallocate_pages(&mut self.arena, page, run, true)?;
        } else {
            self.page_table
                .decrease_page_allocation(&mut self.arena, page, number_of_blocks)?;
            if page < self.page_table.number_of_pages()
                && self.page_table.page(page).number_of_allocated_blocks() > 0
            {
                self.consolidate_consecutive_blocks(page, block, usize::MAX)?;
                let mut start = block;
                if let Some(previous) = self.arena.header(block)?.previous_block() {
                    if !self.arena.header(previous)?.is_allocated() {
                        self.consolidate_consecutive_blocks(page, previous, usize::MAX)?;
                        start = previous;
                    }
                }
                self.track_free_run(page, start)?;
                if self.validate_blocks {
                    self.validate_block(start)?;
                }
            }
        }

        if self.validate_heap {
            self.page_table.validate_heap()?;
        }
        log::trace!("released {number_of_blocks} blocks at block {block}");
        Ok(())
    }

    /// Check the header at `block` against its neighbours and its page
    pub fn validate_block(&self, block: usize) -> Result<(), CorruptionError> {
        let header = self.arena.header(block)?;
        let flag = header.raw_allocation_flag();
        if flag > 1 {
            return Err(CorruptionError::InvalidAllocationFlag { block, value: flag });
        }
        let run = header.number_of_blocks();
        if run == 0 {
            return Err(CorruptionError::EmptyHeader { block });
        }
        self.arena.check(block + run - 1)?;

        if let Some(previous) = header.previous_block() {
            let previous_run = self.arena.header(previous)?.number_of_blocks();
            if previous_run == 0 {
                return Err(CorruptionError::EmptyHeader { block: previous });
            }
            if previous + previous_run != block {
                return Err(CorruptionError::BrokenBackPointer { block, previous });
            }
        }

        let page = self.page_table.page_for_block(block);
        if run <= self.blocks_per_page() {
            let next = block + run;
            if next <= self.page_table.last_block_in_page(page) {
                let next_header = self.arena.header(next)?;
                if next_header.number_of_blocks() == 0 {
                    return Err(CorruptionError::EmptyHeader { block: next });
                }
                if next_header.previous_block() != Some(block) {
                    return Err(CorruptionError::BrokenForwardLink { block, next });
                }
            }
        }

        if block == self.page_table.first_block_in_page(page) {
            if let Some(actual) = self.page_table.page(page).number_of_pages_in_run() {
                let expected = self.page_table.pages_for_blocks(run);
                if actual != expected {
                    return Err(CorruptionError::RunLength {
                        page,
                        expected,
                        actual: actual as i64,
                    });
                }
            }
        }
        Ok(())
    }

    /// The full consistency pass: the heap, every block chain, and that the
    /// page accounting matches what's actually allocated.
    pub fn validate(&self) -> Result<(), CorruptionError> {
        self.page_table.validate_heap()?;

        let mut allocations = 0;
        let mut page = 0;
        while page < self.page_table.number_of_pages() {
            let Some(run) = self.page_table.page(page).number_of_pages_in_run() else {
                return Err(CorruptionError::RunLength {
                    page,
                    expected: 1,
                    actual: -1,
                });
            };
            if page + run > self.page_table.number_of_pages() {
                return Err(CorruptionError::PageOutOfBounds {
                    page: page + run - 1,
                    number_of_pages: self.page_table.number_of_pages(),
                });
            }
            let recorded: usize = (page..page + run)
                .map(|page| self.page_table.page(page).number_of_allocated_blocks())
                .sum();

            let mut scanned = 0;
            if recorded > 0 {
                let last = self.page_table.last_block_in_page(page);
                let mut block = self.page_table.first_block_in_page(page);
                while block <= last {
                    self.validate_block(block)?;
                    let header = self.arena.header(block)?;
                    if header.is_allocated() {
                        scanned += header.number_of_blocks();
                        allocations += 1;
                    }
                    if header.number_of_blocks() > self.blocks_per_page() {
                        break;
                    }
                    block += header.number_of_blocks();
                }
            }
            if scanned != recorded {
                return Err(CorruptionError::PageAccounting {
                    page,
                    recorded,
                    scanned,
                });
            }
            page += run;
        }

        if allocations != self.number_of_allocations {
            return Err(CorruptionError::AllocationCount {
                recorded: self.number_of_allocations,
                scanned: allocations,
            });
        }
        Ok(())
    }

    /// Every live allocation, as `(header block, header)`
    pub fn allocations(&self) -> Allocations<'_> {
        Allocations {
            file_map: self,
            page: 0,
            block: None,
        }
    }
}

/// Walks live allocations page by page. Stops early (rather than erroring)
/// if it runs into a broken chain; use [`FileMap::validate()`] to find out
/// why.
pub struct Allocations<'a> {
    file_map: &'a FileMap,
    page: usize,
    block: Option<usize>,
}

impl<'a> Iterator for Allocations<'a> {
    type Item = (usize, &'a BlockHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let page_table = &self.file_map.page_table;
        loop {
            if self.page >= page_table.number_of_pages() {
                return None;
            }
            let run = page_table.run_length(self.page);
            let block = match self.block {
                Some(block) => block,
                None if page_table.page(self.page).number_of_allocated_blocks() == 0 => {
                    self.page += run;
                    continue;
                }
                None => page_table.first_block_in_page(self.page),
            };
            if block > page_table.last_block_in_page(self.page) {
                self.page += run;
                self.block = None;
                continue;
            }

            let header = self.file_map.arena.header(block).ok()?;
            let blocks = header.number_of_blocks();
            if blocks == 0 {
                return None;
            }
            if blocks > page_table.blocks_per_page() {
                self.page += run;
                self.block = None;
            } else {
                self.block = Some(block + blocks);
            }
            if header.is_allocated() {
                return Some((block, header));
            }
        }
    }
}
