use std::{path::Path, ptr::NonNull};

use memtrack::{
    alloc::{block::BLOCK_SIZE, BlockStore},
    config::{Config, GiveBack},
    os::mem::PAGE_SIZE,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn open(dir: &Path, pages: usize) -> BlockStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config::default()
        .with_allocation_map_dir(dir)
        .with_validation(true)
        .with_give_back(GiveBack::Keep);
    BlockStore::open(&config, "scenario", pages * *PAGE_SIZE - BLOCK_SIZE).unwrap()
}

fn blocks_per_page() -> usize {
    *PAGE_SIZE / BLOCK_SIZE
}

/// Allocated blocks as the page table records them
fn recorded_blocks(store: &BlockStore) -> usize {
    let page_table = store.file_map().page_table();
    (0..page_table.number_of_pages())
        .map(|page| page_table.page(page).number_of_allocated_blocks())
        .sum()
}

/// Allocated blocks as a walk over the headers finds them
fn scanned_blocks(store: &BlockStore) -> usize {
    store
        .allocations()
        .map(|allocation| allocation.payload_size / BLOCK_SIZE + 1)
        .sum()
}

fn fill(data: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        // SAFETY: `len` live bytes
        unsafe { data.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
    }
}

fn check(data: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        // SAFETY: `len` live bytes
        let byte = unsafe { data.as_ptr().add(i).read() };
        assert_eq!(byte, seed.wrapping_add(i as u8), "byte {i} changed");
    }
}

#[test]
fn freed_run_is_reused_without_growing() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(dir.path(), 1);
    let first = store.allocate(40, Some("first")).unwrap();
    let second = store.allocate(40, Some("second")).unwrap();
    let third = store.allocate(40, Some("third")).unwrap();
    assert_eq!(store.file_map().page_table().number_of_pages(), 1);

    unsafe { store.deallocate(second).unwrap() };
    let fourth = store.allocate(40, Some("fourth")).unwrap();
    assert_eq!(fourth, second);
    assert_eq!(store.file_map().page_table().number_of_pages(), 1);

    let names: Vec<_> = store.allocations().map(|a| a.name).collect();
    assert_eq!(names, [Some("first"), Some("fourth"), Some("third")]);
    assert!(first < fourth && fourth < third);
    store.validate().unwrap();
}

#[test]
fn objects_bigger_than_a_page_own_whole_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(dir.path(), 8);
    let size = *PAGE_SIZE + 4 * BLOCK_SIZE;
    let big = store.allocate(size, None).unwrap();

    let page_table = store.file_map().page_table();
    let first_page = page_table.page_for_block(
        store.file_map().arena().block_for_payload(big.as_ptr()).unwrap(),
    );
    assert_eq!(page_table.run_length(first_page), size.div_ceil(*PAGE_SIZE));
    for page in first_page..first_page + page_table.run_length(first_page) {
        assert!(!page_table.page(page).is_in_heap());
    }

    // shrinking hands the tail pages back and keeps the head
    let small = unsafe { store.reallocate(big, 100) }.unwrap().unwrap();
    assert_eq!(small, big);
    let page_table = store.file_map().page_table();
    assert_eq!(page_table.run_length(first_page), 1);
    assert_eq!(page_table.page(first_page).number_of_allocated_blocks(), 2);
    store.validate().unwrap();

    unsafe { store.deallocate(small).unwrap() };
    assert_eq!(store.file_map().page_table().number_of_pages(), 0);
}

#[test]
fn shrink_then_grow_keeps_the_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(dir.path(), 16);
    let mut rng = StdRng::seed_from_u64(7);
    let _pin = store.allocate(10, None).unwrap();

    for round in 0..50u8 {
        let size = rng.gen_range(1..3 * *PAGE_SIZE);
        let smaller = rng.gen_range(1..=size);
        let data = store.allocate(size, None).unwrap();
        fill(data, size, round);

        let shrunk = unsafe { store.reallocate(data, smaller) }.unwrap().unwrap();
        check(shrunk, smaller, round);
        let grown = unsafe { store.reallocate(shrunk, size + rng.gen_range(0..1000)) }
            .unwrap()
            .unwrap();
        check(grown, smaller, round);
        store.validate().unwrap();
        unsafe { store.deallocate(grown).unwrap() };
    }
}

#[test]
fn accounting_survives_random_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(dir.path(), 4096);
    let mut rng = StdRng::seed_from_u64(0xb10c);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for step in 0..2000usize {
        let seed = step as u8;
        match rng.gen_range(0..10) {
            0..=4 => {
                let size = if rng.gen_bool(0.05) {
                    rng.gen_range(*PAGE_SIZE..4 * *PAGE_SIZE)
                } else {
                    rng.gen_range(1..600)
                };
                let data = store.allocate(size, None).unwrap();
                fill(data, size, seed);
                live.push((data, size, seed));
            }
            5..=7 if !live.is_empty() => {
                let (data, size, seed) = live.swap_remove(rng.gen_range(0..live.len()));
                check(data, size, seed);
                unsafe { store.deallocate(data).unwrap() };
            }
            8..=9 if !live.is_empty() => {
                let index = rng.gen_range(0..live.len());
                let (data, size, seed) = live[index];
                let new_size = rng.gen_range(1..2 * *PAGE_SIZE);
                let moved = unsafe { store.reallocate(data, new_size) }.unwrap().unwrap();
                check(moved, size.min(new_size), seed);
                fill(moved, new_size, seed);
                live[index] = (moved, new_size, seed);
            }
            _ => {}
        }
        if step % 50 == 0 {
            store.validate().unwrap();
            assert_eq!(recorded_blocks(&store), scanned_blocks(&store));
        }
    }

    assert_eq!(store.number_of_allocations(), live.len());
    for (data, size, seed) in live.drain(..) {
        check(data, size, seed);
        unsafe { store.deallocate(data).unwrap() };
    }
    store.validate().unwrap();
    assert_eq!(recorded_blocks(&store), 0);
    assert_eq!(store.file_map().page_table().number_of_pages(), 0);
}

#[test]
fn free_then_allocate_restores_page_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(dir.path(), 4);
    let _a = store.allocate(200, None).unwrap();
    let b = store.allocate(500, None).unwrap();
    let _c = store.allocate(50, None).unwrap();
    let page = 0;
    let before = *store.file_map().page_table().page(page);

    unsafe { store.deallocate(b).unwrap() };
    let again = store.allocate(500, None).unwrap();
    assert_eq!(again, b);
    assert_eq!(*store.file_map().page_table().page(page), before);
    assert_eq!(store.file_map().page_table().number_of_pages(), 1);
    assert!(before.number_of_allocated_blocks() < blocks_per_page());
}
