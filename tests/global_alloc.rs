//! Runs the whole test binary on top of the tracking allocator.

use std::{alloc::Layout, collections::HashMap, env};

use memtrack::{
    alloc::TrackingAlloc,
    config::{Config, GiveBack},
};

fn config() -> Config {
    Config::default()
        .with_tracking(true)
        .with_allocation_map_dir(env::temp_dir())
        .with_store_size(64 << 20)
        .with_dedicated_threshold(64 << 10)
        .with_give_back(GiveBack::Keep)
}

#[global_allocator]
static GLOBAL: TrackingAlloc = TrackingAlloc::with_config(config);

#[test]
fn boxes_and_vectors_land_in_stores() {
    let boxed = Box::new([7u8; 100]);
    let context = GLOBAL.context();
    assert!(context.store_for_address(boxed.as_ptr()).is_some());

    let mut numbers: Vec<u64> = Vec::new();
    for n in 0..10_000 {
        numbers.push(n);
    }
    assert!(context.store_for_address(numbers.as_ptr().cast()).is_some());
    assert_eq!(numbers.iter().sum::<u64>(), 49_995_000);

    let text: String = (0..500).map(|n| n.to_string()).collect();
    assert!(text.starts_with("012345"));
    context.validate().unwrap();
}

#[test]
fn big_buffers_get_dedicated_stores_and_give_them_back() {
    let context = GLOBAL.context();
    let buffer = vec![1u8; 256 << 10];
    let id = context.store_for_address(buffer.as_ptr()).unwrap();
    assert!(context.with_store(id, |store| store.is_dedicated()).unwrap());
    drop(buffer);
    assert!(context.with_store(id, |_| ()).is_err());
}

#[test]
fn over_aligned_layouts_still_work() {
    let layout = Layout::from_size_align(100, 4096).unwrap();
    // SAFETY: Non-zero size
    let data = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!data.is_null());
    assert_eq!(data as usize % 4096, 0);
    assert_eq!(GLOBAL.context().store_for_address(data), None);
    // SAFETY: Allocated above with the same layout
    unsafe { std::alloc::dealloc(data, layout) };
}

#[test]
fn threads_and_maps_churn_cleanly() {
    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                let mut map = HashMap::new();
                for n in 0..5_000u32 {
                    map.insert(n, format!("{t}-{n}"));
                    if n % 3 == 0 {
                        map.remove(&(n / 2));
                    }
                }
                map.len()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap() > 0);
    }
    GLOBAL.context().validate().unwrap();
}
