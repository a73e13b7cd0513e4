use std::{
    panic::{self, AssertUnwindSafe},
    path::Path,
    ptr::NonNull,
    sync::Arc,
};

use allocator_api2::vec::Vec as StoreVec;
use memtrack::{
    alloc::{AllocatorContext, RawAllocator, StoreAllocator},
    config::{Config, GiveBack},
    Error,
};

fn config(dir: &Path) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config::default()
        .with_tracking(true)
        .with_allocation_map_dir(dir)
        .with_store_size(1 << 20)
        .with_dedicated_threshold(8192)
        .with_validation(true)
        .with_give_back(GiveBack::Keep)
}

fn write_bytes(data: NonNull<u8>, bytes: &[u8]) {
    // SAFETY: Callers allocate at least `bytes.len()`
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len()) };
}

fn read_bytes(data: NonNull<u8>, len: usize) -> Vec<u8> {
    // SAFETY: Callers allocate at least `len`
    unsafe { std::slice::from_raw_parts(data.as_ptr(), len) }.to_vec()
}

#[test]
fn pushed_stores_take_allocations_until_popped() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()));
    let scratch = context.create_store("scratch", 1 << 20).unwrap();

    let inside = {
        let guard = context.push_default_store(scratch);
        assert_eq!(guard.store(), scratch);
        assert_eq!(context.thread_default_store(), Some(scratch));
        context.allocate(100).unwrap()
    };
    assert_eq!(context.store_for_address(inside.as_ptr()), Some(scratch));

    let outside = context.allocate(100).unwrap();
    let thread_store = context.store_for_address(outside.as_ptr()).unwrap();
    assert_ne!(thread_store, scratch);

    unsafe {
        context.free(inside);
        context.free(outside);
    }
    // named stores stay until they're destroyed, even when empty
    assert_eq!(context.number_of_stores(), 2);
    context.destroy_store(scratch).unwrap();
    assert!(matches!(
        context.with_store(scratch, |_| ()),
        Err(Error::UnknownStore)
    ));
    assert!(matches!(
        context.destroy_store(scratch),
        Err(Error::UnknownStore)
    ));
}

#[test]
fn default_store_guard_pops_on_unwind() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()));
    let scratch = context.create_store("scratch", 1 << 16).unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _guard = context.push_default_store(scratch);
        panic!("unwinding through a pushed store");
    }));
    assert!(result.is_err());
    assert_ne!(context.thread_default_store(), Some(scratch));
}

#[test]
fn nested_pushes_restore_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()));
    let outer = context.create_store("outer", 1 << 16).unwrap();
    let inner = context.create_store("inner", 1 << 16).unwrap();

    let _outer = context.push_default_store(outer);
    {
        let _inner = context.push_default_store(inner);
        assert_eq!(context.thread_default_store(), Some(inner));
    }
    assert_eq!(context.thread_default_store(), Some(outer));
}

#[test]
fn big_allocations_get_a_dedicated_store() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()));
    let small = context.allocate(10).unwrap();
    let big = context.allocate(16 * 1024).unwrap();

    let id = context.store_for_address(big.as_ptr()).unwrap();
    assert_ne!(Some(id), context.store_for_address(small.as_ptr()));
    let name = context.with_store(id, |store| store.name().to_owned()).unwrap();
    assert_eq!(name, "allocation-16384-0");
    let stats = context.stats();
    let dedicated = stats.iter().find(|stats| stats.is_dedicated).unwrap();
    assert!(dedicated.stack_trace.is_some());
    assert_eq!(context.number_of_stores(), 2);

    // the last free tears it down
    unsafe { context.free(big) };
    assert_eq!(context.number_of_stores(), 1);
    assert!(context.with_store(id, |_| ()).is_err());
    unsafe { context.free(small) };
    context.validate().unwrap();
}

#[test]
fn store_cap_sends_big_allocations_to_the_default_store() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()).with_max_stores(1));
    let big = context.allocate(16 * 1024).unwrap();
    let id = context.store_for_address(big.as_ptr()).unwrap();
    assert_eq!(context.thread_default_store(), Some(id));
    assert_eq!(context.number_of_stores(), 1);

    // too big for the default store too
    let huge = context.allocate(4 << 20).unwrap();
    assert_eq!(context.store_for_address(huge.as_ptr()), None);
    unsafe {
        context.free(huge);
        context.free(big);
    }
}

#[test]
fn reallocate_moves_out_of_a_full_store() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()));
    let data = context.copy(b"kept across the move").unwrap();
    assert!(context.store_for_address(data.as_ptr()).is_some());

    let grown = unsafe { context.reallocate(data, 1000) }.unwrap();
    assert_eq!(read_bytes(grown, 20), b"kept across the move");

    let moved = unsafe { context.reallocate(grown, 4 << 20) }.unwrap();
    assert_eq!(context.store_for_address(moved.as_ptr()), None);
    assert_eq!(read_bytes(moved, 20), b"kept across the move");
    let thread_store = context.thread_default_store().unwrap();
    let left = context
        .with_store(thread_store, |store| store.number_of_allocations())
        .unwrap();
    assert_eq!(left, 0);
    unsafe { context.free(moved) };
}

#[test]
fn platform_pointers_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()).with_tracking(false));
    let data = context.allocate(64).unwrap();
    write_bytes(data, b"platform");
    let moved = unsafe { context.reallocate(data, 4096) }.unwrap();
    assert_eq!(read_bytes(moved, 8), b"platform");
    assert_eq!(context.number_of_stores(), 0);
    unsafe { context.free(moved) };
}

#[test]
fn store_allocator_backs_collections() {
    let dir = tempfile::tempdir().unwrap();
    let context = Arc::new(AllocatorContext::new(config(dir.path())));
    let store = context.create_store("vectors", 1 << 20).unwrap();
    let alloc = StoreAllocator::new(Arc::clone(&context), store).with_name("numbers");

    let mut numbers = StoreVec::new_in(alloc);
    numbers.extend(0..1000u64);
    assert_eq!(context.store_for_address(numbers.as_ptr().cast()), Some(store));
    let names: Vec<_> = context
        .with_store(store, |store| {
            store
                .allocations()
                .map(|a| a.name.map(str::to_owned))
                .collect::<Vec<_>>()
        })
        .unwrap();
    assert_eq!(names, [Some("numbers".to_owned())]);
    drop(numbers);
    let left = context
        .with_store(store, |store| store.number_of_allocations())
        .unwrap();
    assert_eq!(left, 0);
}

#[test]
fn every_thread_gets_its_own_store() {
    let dir = tempfile::tempdir().unwrap();
    let context = AllocatorContext::new(config(dir.path()));

    let stores: Vec<_> = crossbeam::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let context = &context;
                scope.spawn(move |_| {
                    let mut live = Vec::new();
                    for n in 0..200 {
                        let data = context.allocate(16 + n % 300).unwrap();
                        write_bytes(data, &[i as u8; 16]);
                        live.push(data);
                    }
                    let store = context.store_for_address(live[0].as_ptr()).unwrap();
                    for data in live {
                        assert_eq!(read_bytes(data, 16), [i as u8; 16]);
                        assert_eq!(context.store_for_address(data.as_ptr()), Some(store));
                        unsafe { context.free(data) };
                    }
                    store
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    })
    .unwrap();

    let mut unique = stores.clone();
    unique.sort_by_key(|id| format!("{id:?}"));
    unique.dedup();
    assert_eq!(unique.len(), 4);
    // thread stores outlive their threads
    assert_eq!(context.number_of_stores(), 4);
    context.validate().unwrap();
}
