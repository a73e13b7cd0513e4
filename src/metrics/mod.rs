//! Periodic metrics collection.
//!
//! [`Metrics`] owns a block store named `metrics` that every metrics
//! container allocates from, so that collecting numbers about the heap
//! doesn't move them. Handlers registered with [`Metrics::start_timeout()`]
//! run once per collection interval, on the [`Collector`] thread.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use memtrack::{alloc::AllocatorContext, config::Config, metrics::{Collector, Metrics}};
//!
//! let context = Arc::new(AllocatorContext::new(Config::from_env()));
//! let metrics = Arc::new(Metrics::new(context)?);
//! let mut counter = metrics.new_counter();
//! metrics.start_timeout(move |_| {
//!     counter.start_record();
//!     counter.add_instance("Widget", 64);
//!     counter.end_record();
//!     for (name, numbers) in counter.iter().iter() {
//!         log::info!("{name}: {} ({:+})", numbers.instance_count, numbers.instance_change);
//!     }
//! })?;
//! let _collector = Collector::start(metrics)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod collector;
pub mod counter;
pub mod file;
pub mod list;
pub mod sampler;
pub mod stack_trace;
pub mod table;
pub mod text;

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use once_cell::sync::OnceCell;

pub use collector::Collector;
pub use counter::InstanceCounter;
pub use file::MetricsFile;
pub use list::MetricsList;
pub use sampler::StackTraceSampler;
pub use stack_trace::StackTrace;
pub use table::MetricsTable;
pub use text::MetricsString;

use crate::{
    alloc::{AllocatorContext, StoreAllocator, StoreId},
    config::{list_tokens, Config},
    error::Error,
    metrics::collector::TimerFd,
    sync::FutexMutex,
};

pub const METRICS_STORE_NAME: &str = "metrics";

/// A shared collection counter. Every clone sees the same value.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Move on to the next generation, returning it
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub type TimeoutHandler = Box<dyn FnMut(&Metrics) + Send>;

pub struct Metrics {
    context: Arc<AllocatorContext>,
    store: StoreId,
    alloc: StoreAllocator,
    generation: Generation,
    timer: OnceCell<TimerFd>,
    handlers: FutexMutex<MetricsList<TimeoutHandler, StoreAllocator>>,
    builtins: Once,
}

impl Metrics {
    /// Open the `metrics` store in `context`
    pub fn new(context: Arc<AllocatorContext>) -> Result<Self, Error> {
        let size = context.config().allocation_block_store_size;
        let store = context.create_store(METRICS_STORE_NAME, size)?;
        let alloc = StoreAllocator::new(Arc::clone(&context), store).with_name("metrics");
        Ok(Self {
            handlers: FutexMutex::new(MetricsList::new_in(alloc.clone())),
            context,
            store,
            alloc,
            generation: Generation::new(),
            timer: OnceCell::new(),
            builtins: Once::new(),
        })
    }

    pub fn context(&self) -> &Arc<AllocatorContext> {
        &self.context
    }

    pub fn config(&self) -> &Config {
        self.context.config()
    }

    /// The store metrics containers live in
    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn allocator(&self) -> &StoreAllocator {
        &self.alloc
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Whether the metric called `name` should be collected. The include
    /// list wins over the skip list.
    pub fn requested(&self, name: &str) -> bool {
        let config = self.config();
        if !config.metrics_enabled {
            return false;
        }
        if list_tokens(&config.included_metrics).any(|token| token == name) {
            return true;
        }
        !list_tokens(&config.skipped_metrics).any(|token| token == name)
    }

    /// The caller's stack, `stack_trace_size` frames deep
    pub fn stack_trace(&self) -> MetricsString<StoreAllocator> {
        let mut trace = StackTrace::capture_in(
            2,
            self.config().stack_trace_size,
            " -> ",
            self.alloc.clone(),
        );
        MetricsString::from_str_in(trace.output(), self.alloc.clone())
    }

    pub fn new_table<R>(&self) -> MetricsTable<R, StoreAllocator> {
        MetricsTable::new_in(self.alloc.clone())
    }

    pub fn new_list<T>(&self) -> MetricsList<T, StoreAllocator> {
        MetricsList::new_in(self.alloc.clone())
    }

    pub fn new_counter(&self) -> InstanceCounter<StoreAllocator> {
        InstanceCounter::new_in(self.config(), self.generation.clone(), self.alloc.clone())
    }

    pub fn new_sampler(&self) -> StackTraceSampler<StoreAllocator> {
        StackTraceSampler::new_in(self.config(), self.alloc.clone())
    }

    /// `<log_dir>/<name>.csv.gz`, with `columns` after the generation and
    /// timestamp
    pub fn create_file(
        &self,
        name: &str,
        columns: &[&str],
    ) -> Result<MetricsFile<StoreAllocator>, Error> {
        MetricsFile::create_in(
            &self.config().log_dir,
            name,
            columns,
            self.generation.clone(),
            self.alloc.clone(),
        )
    }

    pub(crate) fn start_timer(&self) -> io::Result<&TimerFd> {
        let interval = self.config().collection_interval;
        self.timer.get_or_try_init(|| TimerFd::new(interval))
    }

    /// Run `handler` every collection. The first handler starts the timer.
    ///
    /// Handlers run with the handler list locked, so they must not call this.
    pub fn start_timeout(&self, handler: impl FnMut(&Metrics) + Send + 'static) -> Result<(), Error> {
        self.handlers.lock().push(Box::new(handler));
        self.start_timer()?;
        Ok(())
    }

    pub(crate) fn wait_for_timer(&self, timeout: Duration) -> io::Result<bool> {
        match self.timer.get() {
            Some(timer) => timer.wait(timeout),
            None => {
                std::thread::sleep(timeout);
                Ok(false)
            }
        }
    }

    /// One collection: every handler, then on to the next generation
    pub fn run_timeout_handlers(&self) {
        if let Some(timer) = self.timer.get() {
            if let Err(err) = timer.drain() {
                log::warn!("could not read the metrics timer: {err}");
            }
        }
        self.builtins.call_once(|| self.register_builtins());

        self.handlers.lock().for_each_mut(|handler| handler(self));
        let generation = self.generation.advance();
        log::trace!("metrics generation {generation}");
        collector::clear_flush_request();
    }

    fn register_builtins(&self) {
        if self.requested("allocation-block-stores") {
            let columns = [
                "name",
                "thread name",
                "number of allocations",
                "total size",
                "stack trace",
            ];
            let registered = self
                .create_file("allocation-block-stores", &columns)
                .and_then(|mut file| {
                    self.start_timeout(move |metrics| {
                        if let Err(err) = metrics.write_store_stats(&mut file) {
                            log::warn!("could not collect allocation-block-stores: {err}");
                        }
                    })
                });
            if let Err(err) = registered {
                log::warn!("allocation-block-stores metrics disabled: {err}");
            }
        }

        if self.requested("metrics-allocations") {
            let registered = self.start_timeout(|metrics| {
                if let Err(err) = metrics.write_allocation_list() {
                    log::warn!("could not list metrics allocations: {err}");
                }
            });
            if let Err(err) = registered {
                log::warn!("metrics-allocations disabled: {err}");
            }
        }
    }

    fn write_store_stats(&self, file: &mut MetricsFile<StoreAllocator>) -> Result<(), Error> {
        let stats = self.context.stats();
        file.start_record();
        for store in &stats {
            file.add_row(&[
                &store.name,
                &store.thread_name,
                &store.number_of_allocations,
                &store.total_bytes_allocated,
                &store.stack_trace.as_deref().unwrap_or(""),
            ])?;
        }
        if collector::flush_requested() {
            let path = self.config().log_dir.join("allocation-block-stores.json");
            let mut out = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut out, &stats).map_err(io::Error::from)?;
            out.flush()?;
        }
        file.end_record()
    }

    /// `<log_dir>/metrics-allocations.list`: what the metrics store holds
    pub fn write_allocation_list(&self) -> Result<(), Error> {
        let log_dir = &self.config().log_dir;
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{METRICS_STORE_NAME}-allocations.list"));
        self.context.write_allocation_list(self.store, &path)
    }
}
