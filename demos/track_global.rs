//! Run a small workload on the tracking allocator with metrics collection
//! switched on, then dump what the block stores look like.
//!
//! ```sh
//! MEMTRACK_ENABLE=1 MEMTRACK_COLLECTION_INTERVAL=1 cargo run --example track_global
//! ```

use std::{collections::BTreeMap, sync::Arc, thread, time::Duration};

use memtrack::{
    alloc::TrackingAlloc,
    metrics::{Collector, Metrics},
};

#[global_allocator]
static GLOBAL: TrackingAlloc = TrackingAlloc::new();

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let context = Arc::clone(GLOBAL.context());
    let metrics = Arc::new(Metrics::new(context)?);

    let mut counter = metrics.new_counter();
    metrics.start_timeout(move |metrics| {
        counter.start_record();
        for stats in metrics.context().stats() {
            counter.add_instances(
                &stats.name,
                None,
                stats.number_of_allocations,
                stats.total_bytes_allocated,
            );
        }
        counter.end_record();
        for (name, numbers) in counter.iter().iter() {
            println!(
                "{name}: {} allocations ({:+}), {} bytes",
                numbers.instance_count, numbers.instance_change, numbers.total_memory_usage
            );
            if counter.is_interesting(name) {
                println!("  ^ still growing");
            }
        }
    })?;
    let collector = Collector::start(Arc::clone(&metrics))?;

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || {
                    let mut words = BTreeMap::new();
                    for n in 0..50_000u32 {
                        words.insert(n, format!("worker {worker} word {n}"));
                        if n % 4 == 0 {
                            words.remove(&(n / 2));
                        }
                    }
                    let big = vec![worker as u8; 1 << 20];
                    thread::sleep(Duration::from_millis(1500));
                    words.len() + big.len()
                })
        })
        .collect::<Result<_, _>>()?;
    for worker in workers {
        let _ = worker.join();
    }
    drop(collector);

    let stats = GLOBAL.context().stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
