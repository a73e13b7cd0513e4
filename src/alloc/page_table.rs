//! Page-level bookkeeping for a block arena, and the best-fit heap.
//!
//! The page table file is laid out as
//!
//! ```text
//! | heap: [u64; max_number_of_pages] | pages: [Page; max_number_of_pages] |
//! ```
//!
//! The heap holds page indices (not pages), ordered so that every entry is at
//! least as full as its children. Pages know their own heap slot, so we can
//! pull an arbitrary page out of the heap in O(log n).

use std::{cmp::Ordering, mem, path::Path};

use bytemuck::{Pod, Zeroable};

use crate::{
    alloc::block::{BlockArena, BlockHeader},
    config::{GiveBack, MapFileMode},
    error::CorruptionError,
    os::mem::{Advice, MapFile, PAGE_SIZE},
};

/// One page of blocks. `-1` means "none" for every signed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Page {
    /// Index of the largest (known) free run in the page
    run_of_free_blocks: i64,
    number_of_allocated_blocks: u64,
    /// Only set on the first page of a run, -1 on the rest
    number_of_pages_in_run: i64,
    heap_index: i64,
}

fn to_raw(index: Option<usize>) -> i64 {
    index.map_or(-1, |index| index as i64)
}

fn from_raw(raw: i64) -> Option<usize> {
    usize::try_from(raw).ok()
}

impl Page {
    fn fresh(number_of_pages_in_run: Option<usize>) -> Self {
        Page {
            run_of_free_blocks: -1,
            number_of_allocated_blocks: 0,
            number_of_pages_in_run: to_raw(number_of_pages_in_run),
            heap_index: -1,
        }
    }

    pub fn run_of_free_blocks(&self) -> Option<usize> {
        from_raw(self.run_of_free_blocks)
    }

    pub fn number_of_allocated_blocks(&self) -> usize {
        self.number_of_allocated_blocks as usize
    }

    /// `None` unless this is the first page of a run
    pub fn number_of_pages_in_run(&self) -> Option<usize> {
        from_raw(self.number_of_pages_in_run).filter(|&n| n > 0)
    }

    pub fn heap_index(&self) -> Option<usize> {
        from_raw(self.heap_index)
    }

    pub fn is_in_heap(&self) -> bool {
        self.heap_index >= 0
    }
}

pub struct PageTable {
    map: MapFile,
    max_number_of_pages: usize,
    number_of_pages: usize,
    heap_size: usize,
    blocks_per_page: usize,
    allocated_blocks_threshold: usize,
    give_back: GiveBack,
}

impl PageTable {
    pub fn open(
        path: &Path,
        max_number_of_pages: usize,
        mode: MapFileMode,
        allocated_blocks_threshold: usize,
        give_back: GiveBack,
    ) -> std::io::Result<Self> {
        let size = max_number_of_pages * (mem::size_of::<u64>() + mem::size_of::<Page>());
        let map = MapFile::open(path, size, mode)?;
        Ok(Self {
            map,
            max_number_of_pages,
            number_of_pages: 0,
            heap_size: 0,
            blocks_per_page: *PAGE_SIZE / super::block::BLOCK_SIZE,
            allocated_blocks_threshold,
            give_back,
        })
    }

    pub fn blocks_per_page(&self) -> usize {
        self.blocks_per_page
    }

    pub fn number_of_pages(&self) -> usize {
        self.number_of_pages
    }

    pub fn max_number_of_pages(&self) -> usize {
        self.max_number_of_pages
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn allocated_blocks_threshold(&self) -> usize {
        self.allocated_blocks_threshold
    }

    fn heap_bytes(&self) -> usize {
        self.max_number_of_pages * mem::size_of::<u64>()
    }

    fn page_bytes(&self) -> usize {
        self.max_number_of_pages * mem::size_of::<Page>()
    }

    fn heap(&self) -> &[u64] {
        bytemuck::cast_slice(&self.map.as_slice()[..self.heap_bytes()])
    }

    fn heap_mut(&mut self) -> &mut [u64] {
        let end = self.heap_bytes();
        bytemuck::cast_slice_mut(&mut self.map.as_mut_slice()[..end])
    }

    fn pages(&self) -> &[Page] {
        let start = self.heap_bytes();
        bytemuck::cast_slice(&self.map.as_slice()[start..start + self.page_bytes()])
    }

    fn pages_mut(&mut self) -> &mut [Page] {
        let start = self.heap_bytes();
        let end = start + self.page_bytes();
        bytemuck::cast_slice_mut(&mut self.map.as_mut_slice()[start..end])
    }

    /// # Panics
    /// - If `page` is past `max_number_of_pages`
    pub fn page(&self, page: usize) -> &Page {
        &self.pages()[page]
    }

    fn page_mut(&mut self, page: usize) -> &mut Page {
        &mut self.pages_mut()[page]
    }

    /// Heap entries in heap order (root first)
    pub fn heap_entries(&self) -> impl Iterator<Item = usize> + '_ {
        self.heap()[..self.heap_size].iter().map(|&page| page as usize)
    }

    pub fn page_for_block(&self, block: usize) -> usize {
        block / self.blocks_per_page
    }

    pub fn first_block_in_page(&self, page: usize) -> usize {
        page * self.blocks_per_page
    }

    pub fn last_block_in_page(&self, page: usize) -> usize {
        (page + 1) * self.blocks_per_page - 1
    }

    /// How many pages a run of `number_of_blocks` blocks covers
    pub fn pages_for_blocks(&self, number_of_blocks: usize) -> usize {
        number_of_blocks.div_ceil(self.blocks_per_page).max(1)
    }

    /// Run length of `page`, treating "not the first page" as 1
    pub fn run_length(&self, page: usize) -> usize {
        self.page(page).number_of_pages_in_run().unwrap_or(1)
    }

    pub(crate) fn set_run_length(&mut self, page: usize, number_of_pages: usize) {
        self.page_mut(page).number_of_pages_in_run = number_of_pages as i64;
    }

    pub(crate) fn set_run_of_free_blocks(&mut self, page: usize, block: Option<usize>) {
        self.page_mut(page).run_of_free_blocks = to_raw(block);
    }

    fn allocated_blocks_in_run(&self, page: usize) -> usize {
        let run = self.run_length(page);
        self.pages()[page..page + run]
            .iter()
            .map(Page::number_of_allocated_blocks)
            .sum()
    }

    /// "Fullness" order: more allocated blocks is fuller, and on a tie the run
    /// with fewer pages wins.
    fn compare_pages(&self, a: usize, b: usize) -> Ordering {
        self.allocated_blocks_in_run(a)
            .cmp(&self.allocated_blocks_in_run(b))
            .then_with(|| self.run_length(b).cmp(&self.run_length(a)))
    }

    /// Free blocks available in the run starting at `page`: all of them if the
    /// run is empty, otherwise the size of its tracked free run.
    pub fn free_blocks_for_pages(
        &self,
        arena: &BlockArena,
        page: usize,
    ) -> Result<usize, CorruptionError> {
        let descriptor = self.page(page);
        if descriptor.number_of_allocated_blocks() == 0 {
            return Ok(self.blocks_per_page * self.run_length(page));
        }
        match descriptor.run_of_free_blocks() {
            Some(block) => {
                let header = arena.header(block)?;
                Ok(if header.is_allocated() {
                    0
                } else {
                    header.number_of_blocks()
                })
            }
            None => Ok(0),
        }
    }

    fn swap_heap_entries(&mut self, i: usize, j: usize) {
        let heap = self.heap_mut();
        heap.swap(i, j);
        let (page_i, page_j) = (heap[i] as usize, heap[j] as usize);
        self.page_mut(page_i).heap_index = i as i64;
        self.page_mut(page_j).heap_index = j as i64;
    }

    fn sift_up(&mut self, page: usize) {
        while let Some(index) = self.page(page).heap_index() {
            if index == 0 {
                break;
            }
            let parent_index = (index - 1) / 2;
            let parent = self.heap()[parent_index] as usize;
            if self.compare_pages(parent, page) != Ordering::Less {
                break;
            }
            self.swap_heap_entries(index, parent_index);
        }
    }

    fn sift_down(&mut self, page: usize) {
        while let Some(index) = self.page(page).heap_index() {
            let fullest_child = [2 * index + 1, 2 * index + 2]
                .into_iter()
                .filter(|&child| child < self.heap_size)
                .map(|child| (child, self.heap()[child] as usize))
                .max_by(|(_, a), (_, b)| self.compare_pages(*a, *b));
            let Some((child_index, child)) = fullest_child else {
                break;
            };
            if self.compare_pages(child, page) != Ordering::Greater {
                break;
            }
            self.swap_heap_entries(index, child_index);
        }
    }

    pub fn add_page_to_heap(&mut self, page: usize) {
        if page >= self.number_of_pages || self.page(page).is_in_heap() {
            debug_assert!(false, "page {page} cannot be added to the heap");
            return;
        }
        let index = self.heap_size;
        self.heap_mut()[index] = page as u64;
        self.page_mut(page).heap_index = index as i64;
        self.heap_size += 1;
        self.sift_up(page);
    }

    pub fn remove_page_from_heap(&mut self, page: usize) {
        let Some(index) = self.page(page).heap_index() else {
            return;
        };
        let last = self.heap_size - 1;
        if index != last {
            self.swap_heap_entries(index, last);
        }
        self.heap_size -= 1;
        self.page_mut(page).heap_index = -1;
        if index < self.heap_size {
            let moved = self.heap()[index] as usize;
            self.sift_down(moved);
            self.sift_up(moved);
        }
    }

    /// Best-fit search. Returns the first page of a run with at least
    /// `number_of_blocks` free blocks, preferring the root, then the tightest
    /// fit found below it.
    pub fn find_pages_for_blocks(
        &self,
        arena: &BlockArena,
        number_of_blocks: usize,
    ) -> Result<Option<usize>, CorruptionError> {
        if self.heap_size == 0 {
            return Ok(None);
        }
        let root = self.heap()[0] as usize;
        if self.free_blocks_for_pages(arena, root)? >= number_of_blocks {
            return Ok(Some(root));
        }
        Ok(self
            .find_child_pages_for_blocks(arena, 0, number_of_blocks)?
            .map(|(page, _)| page))
    }

    fn find_child_pages_for_blocks(
        &self,
        arena: &BlockArena,
        index: usize,
        number_of_blocks: usize,
    ) -> Result<Option<(usize, usize)>, CorruptionError> {
        let mut best: Option<(usize, usize)> = None;
        for child_index in [2 * index + 1, 2 * index + 2] {
            if child_index >= self.heap_size {
                continue;
            }
            let child = self.heap()[child_index] as usize;
            let free = self.free_blocks_for_pages(arena, child)?;
            let candidate = if free >= number_of_blocks {
                Some((child, free))
            } else {
                self.find_child_pages_for_blocks(arena, child_index, number_of_blocks)?
            };
            best = match (best, candidate) {
                (Some(current), Some(candidate)) if candidate.1 < current.1 => Some(candidate),
                (None, candidate) => candidate,
                (best, _) => best,
            };
        }
        Ok(best)
    }

    /// Append a run of `number_of_pages` fresh pages to the table, returning
    /// the first. `None` if the table is full.
    pub fn allocate_pages(&mut self, number_of_pages: usize) -> Option<usize> {
        if self.number_of_pages + number_of_pages > self.max_number_of_pages {
            return None;
        }
        let first = self.number_of_pages;
        self.pages_mut()[first] = Page::fresh(Some(number_of_pages));
        for page in first + 1..first + number_of_pages {
            self.pages_mut()[page] = Page::fresh(None);
        }
        self.number_of_pages += number_of_pages;
        log::trace!("page table grew to {} pages", self.number_of_pages);
        Some(first)
    }

    /// Drop trailing pages with nothing allocated in them
    pub fn truncate_empty_pages(&mut self) {
        while let Some(last) = self.number_of_pages.checked_sub(1) {
            if self.page(last).number_of_allocated_blocks() != 0 {
                break;
            }
            self.remove_page_from_heap(last);
            self.number_of_pages -= 1;
        }
    }

    /// Hand a run of pages back: one free header covering the lot, allocation
    /// counts zeroed, memory given back to the kernel per policy. If
    /// `truncate` is set, trailing empty pages are dropped from the table.
    pub fn deallocate_pages(
        &mut self,
        arena: &mut BlockArena,
        first: usize,
        number_of_pages: usize,
        truncate: bool,
    ) -> Result<(), CorruptionError> {
        self.remove_page_from_heap(first);

        let advice = match self.give_back {
            GiveBack::Keep => None,
            GiveBack::Remove => Some(Advice::Remove),
            GiveBack::DontNeed => Some(Advice::DontNeed),
        };
        if let Some(advice) = advice {
            arena
                .map()
                .advise(first * *PAGE_SIZE, number_of_pages * *PAGE_SIZE, advice);
        }

        let first_block = self.first_block_in_page(first);
        arena.write_header(
            first_block,
            BlockHeader::free(number_of_pages * self.blocks_per_page, None),
        )?;

        for page in first..first + number_of_pages {
            let descriptor = self.page_mut(page);
            descriptor.number_of_allocated_blocks = 0;
            descriptor.run_of_free_blocks = -1;
            descriptor.number_of_pages_in_run = -1;
        }
        let descriptor = self.page_mut(first);
        descriptor.run_of_free_blocks = first_block as i64;
        descriptor.number_of_pages_in_run = number_of_pages as i64;

        if truncate {
            self.truncate_empty_pages();
        }
        if first < self.number_of_pages {
            self.add_page_to_heap(first);
        }
        Ok(())
    }

    /// Account `number_of_blocks` more allocated blocks to the run at `page`,
    /// filling its pages front to back.
    pub fn increase_page_allocation(&mut self, page: usize, number_of_blocks: usize) {
        self.remove_page_from_heap(page);
        let run = self.run_length(page);
        let mut left = number_of_blocks;
        for page in page..page + run {
            if left == 0 {
                break;
            }
            let added = left.min(self.blocks_per_page);
            self.page_mut(page).number_of_allocated_blocks += added as u64;
            left -= added;
        }
        if run == 1 && self.page(page).number_of_allocated_blocks() <= self.allocated_blocks_threshold
        {
            self.add_page_to_heap(page);
        }
    }

    /// Account `number_of_blocks` fewer allocated blocks to the run at `page`,
    /// emptying its pages back to front. Trailing pages that end up empty are
    /// split off and deallocated.
    pub fn decrease_page_allocation(
        &mut self,
        arena: &mut BlockArena,
        page: usize,
        number_of_blocks: usize,
    ) -> Result<(), CorruptionError> {
        self.remove_page_from_heap(page);
        let run = self.run_length(page);
        let mut left = number_of_blocks;
        for page in (page..page + run).rev() {
            let descriptor = self.page_mut(page);
            let removed = left.min(descriptor.number_of_allocated_blocks());
            descriptor.number_of_allocated_blocks -= removed as u64;
            left -= removed;
        }

        let empty_tail = self.pages()[page..page + run]
            .iter()
            .rev()
            .take_while(|descriptor| descriptor.number_of_allocated_blocks() == 0)
            .count();
        if empty_tail == run {
            self.deallocate_pages(arena, page, run, true)?;
        } else if empty_tail > 0 {
            let split = page + run - empty_tail;
            self.set_run_length(page, run - empty_tail);
            self.set_run_length(split, empty_tail);
            self.deallocate_pages(arena, split, empty_tail, true)?;
        }

        if page < self.number_of_pages
            && self.run_length(page) == 1
            && self.page(page).number_of_allocated_blocks() <= self.allocated_blocks_threshold
            && !self.page(page).is_in_heap()
        {
            self.add_page_to_heap(page);
        }
        Ok(())
    }

    /// Check heap order and that heap slots and pages agree with each other
    pub fn validate_heap(&self) -> Result<(), CorruptionError> {
        for (index, page) in self.heap_entries().enumerate() {
            if page >= self.number_of_pages {
                return Err(CorruptionError::HeapEntryOutOfBounds { page });
            }
            let heap_index = self.page(page).heap_index;
            if heap_index != index as i64 {
                return Err(CorruptionError::HeapIndex { page, heap_index });
            }
            if index > 0 {
                let parent = self.heap()[(index - 1) / 2] as usize;
                if self.compare_pages(parent, page) == Ordering::Less {
                    return Err(CorruptionError::HeapOrder {
                        parent,
                        child: page,
                    });
                }
            }
        }
        for page in 0..self.number_of_pages {
            if let Some(index) = self.page(page).heap_index() {
                if index >= self.heap_size || self.heap()[index] as usize != page {
                    return Err(CorruptionError::HeapIndex {
                        page,
                        heap_index: index as i64,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::block::BLOCK_SIZE;

    struct Fixture {
        _dir: tempfile::TempDir,
        arena: BlockArena,
        table: PageTable,
    }

    fn fixture(max_pages: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data = MapFile::open(
            &dir.path().join("data"),
            max_pages * *PAGE_SIZE,
            MapFileMode::SharedUnlinked,
        )
        .unwrap();
        let table = PageTable::open(
            &dir.path().join("page-table"),
            max_pages,
            MapFileMode::SharedUnlinked,
            28,
            GiveBack::Keep,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            arena: BlockArena::new(data),
            table,
        }
    }

    fn bpp() -> usize {
        *PAGE_SIZE / BLOCK_SIZE
    }

    #[test]
    fn allocate_pages_respects_capacity() {
        let mut f = fixture(4);
        assert_eq!(f.table.allocate_pages(3), Some(0));
        assert_eq!(f.table.page(0).number_of_pages_in_run(), Some(3));
        assert_eq!(f.table.page(1).number_of_pages_in_run(), None);
        assert_eq!(f.table.allocate_pages(2), None);
        assert_eq!(f.table.allocate_pages(1), Some(3));
        assert_eq!(f.table.number_of_pages(), 4);
    }

    #[test]
    fn heap_keeps_fullest_page_on_top() {
        let mut f = fixture(8);
        for (page, blocks) in [3, 20, 7, 12, 1, 25].into_iter().enumerate() {
            assert_eq!(f.table.allocate_pages(1), Some(page));
            f.table.increase_page_allocation(page, blocks);
            f.table.validate_heap().unwrap();
        }
        assert_eq!(f.table.heap_entries().next(), Some(5));
        f.table.remove_page_from_heap(5);
        f.table.validate_heap().unwrap();
        assert_eq!(f.table.heap_entries().next(), Some(1));
        f.table.remove_page_from_heap(2);
        f.table.validate_heap().unwrap();
        assert_eq!(f.table.heap_size(), 4);
        assert!(!f.table.page(2).is_in_heap());
    }

    #[test]
    fn pages_over_the_threshold_leave_the_heap() {
        let mut f = fixture(2);
        f.table.allocate_pages(1);
        f.table.increase_page_allocation(0, 28);
        assert!(f.table.page(0).is_in_heap());
        f.table.increase_page_allocation(0, 1);
        assert!(!f.table.page(0).is_in_heap());
        f.table.decrease_page_allocation(&mut f.arena, 0, 1).unwrap();
        assert!(f.table.page(0).is_in_heap());
    }

    #[test]
    fn ties_prefer_shorter_runs() {
        let mut f = fixture(4);
        f.table.allocate_pages(1);
        f.table.allocate_pages(2);
        f.table.allocate_pages(1);
        f.table.deallocate_pages(&mut f.arena, 1, 2, false).unwrap();
        f.table.deallocate_pages(&mut f.arena, 0, 1, false).unwrap();
        f.table.validate_heap().unwrap();
        assert_eq!(f.table.heap_entries().next(), Some(0));
    }

    #[test]
    fn search_returns_tightest_fit_below_root() {
        let mut f = fixture(4);
        for page in 0..3 {
            f.table.allocate_pages(1);
            let first = f.table.first_block_in_page(page);
            f.arena
                .write_header(first, BlockHeader::free(bpp(), None))
                .unwrap();
            f.table.set_run_of_free_blocks(page, Some(first));
            f.table.increase_page_allocation(page, 1);
        }
        // root has the most allocated blocks and the fewest free
        let set_free = |f: &mut Fixture, page: usize, allocated: usize| {
            let first = f.table.first_block_in_page(page);
            let header = f.arena.header_mut(first).unwrap();
            header.set_number_of_blocks(bpp() - allocated);
            f.table.remove_page_from_heap(page);
            f.table.page_mut(page).number_of_allocated_blocks = allocated as u64;
            f.table.add_page_to_heap(page);
        };
        set_free(&mut f, 0, 20);
        set_free(&mut f, 1, 10);
        set_free(&mut f, 2, 5);
        f.table.validate_heap().unwrap();
        assert_eq!(f.table.heap_entries().next(), Some(0));

        let found = f.table.find_pages_for_blocks(&f.arena, 4).unwrap();
        assert_eq!(found, Some(0));
        let found = f.table.find_pages_for_blocks(&f.arena, 15).unwrap();
        assert_eq!(found, Some(1));
        let found = f.table.find_pages_for_blocks(&f.arena, 25).unwrap();
        assert_eq!(found, Some(2));
        let found = f.table.find_pages_for_blocks(&f.arena, bpp()).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn deallocating_trailing_pages_truncates() {
        let mut f = fixture(4);
        f.table.allocate_pages(1);
        f.table.increase_page_allocation(0, 4);
        f.table.allocate_pages(2);
        f.table.increase_page_allocation(1, bpp() + 1);
        assert_eq!(f.table.number_of_pages(), 3);
        f.table
            .decrease_page_allocation(&mut f.arena, 1, bpp() + 1)
            .unwrap();
        assert_eq!(f.table.number_of_pages(), 1);
        f.table.validate_heap().unwrap();
    }

    #[test]
    fn decrease_splits_off_empty_tail() {
        let mut f = fixture(4);
        f.table.allocate_pages(3);
        f.table.allocate_pages(1);
        f.table.increase_page_allocation(3, 1);
        f.table.increase_page_allocation(0, 2 * bpp() + 5);
        f.table.decrease_page_allocation(&mut f.arena, 0, bpp()).unwrap();
        assert_eq!(f.table.run_length(0), 2);
        assert_eq!(f.table.page(2).number_of_pages_in_run(), Some(1));
        assert!(f.table.page(2).is_in_heap());
        assert_eq!(
            f.table.free_blocks_for_pages(&f.arena, 2).unwrap(),
            bpp()
        );
        f.table.validate_heap().unwrap();
    }
}
