//! Allocator and metrics configuration.
//!
//! Configuration can be set programmatically or loaded from the environment.
//!
//! # Environment Variables
//!
//! All environment variables use the `MEMTRACK_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MEMTRACK_ENABLE` | Enable metrics collection | false |
//! | `MEMTRACK_COMMAND` | Only enable for an executable with this name (`*` = any) | any |
//! | `MEMTRACK_TRACK_ALLOCATIONS` | Serve front-end allocations from block stores | `MEMTRACK_ENABLE` |
//! | `MEMTRACK_OVERRIDE_SYSTEM_MALLOC` | Let interposed `malloc()` & co. use block stores | false |
//! | `MEMTRACK_LOG_DIR` | Where metrics files go | `$XDG_CACHE_HOME/metrics/<pid>` |
//! | `MEMTRACK_ALLOCATION_MAP_DIR` | Where block store files go | temp dir |
//! | `MEMTRACK_INCLUDE` | Metrics to collect even if skipped | "" |
//! | `MEMTRACK_SKIP` | Metrics not to collect | see [`DEFAULT_SKIPPED_METRICS`] |
//! | `MEMTRACK_MAX_ALLOCATION_BLOCK_STORES` | Store count cap for dedicated stores | 256 |
//! | `MEMTRACK_DEFAULT_ALLOCATION_BLOCK_STORE_SIZE` | Store size in KiB | 10485760 (10GiB) |
//! | `MEMTRACK_DEDICATED_ALLOCATION_BLOCK_STORE_THRESHOLD` | Dedicated store threshold in bytes | min(8192, page size) |
//! | `MEMTRACK_ALLOCATED_BLOCKS_THRESHOLD` | Max allocated blocks for a page to stay in the best-fit heap | 28 |
//! | `MEMTRACK_VALIDATE_ALLOCATION_BLOCKS` | Check block headers after each operation | false |
//! | `MEMTRACK_VALIDATE_HEAP` | Check heap order after each operation | false |
//! | `MEMTRACK_USE_MAP_FILES` | 0 = private, 1 = shared + unlinked, 2 = shared + kept | 1 |
//! | `MEMTRACK_GIVE_BACK_DEALLOCATED_PAGES` | 0 = no, 1 = `MADV_REMOVE`, 2 = `MADV_DONTNEED` | 1 |
//! | `MEMTRACK_COLLECTION_INTERVAL` | Seconds between collections | 10 |
//! | `MEMTRACK_COLLECTION_NUMBER_OF_PRELOAD_INTERVALS` | Generations before averages start | 10 |
//! | `MEMTRACK_COLLECTION_AVERAGE_WINDOW_THRESHOLD` | Averaging window (samples) | 10 |
//! | `MEMTRACK_COLLECTION_INSTANCE_COUNT` | Number of interesting instances | 10 |
//! | `MEMTRACK_COLLECTION_INSTANCE_IGNORE_LIST` | Names never interesting | "" |
//! | `MEMTRACK_COLLECTION_INSTANCE_INCLUDE_LIST` | Names always interesting | "" |
//! | `MEMTRACK_STACK_TRACE_SAMPLE_INTERVAL` | Sample one in this many | 1 |
//! | `MEMTRACK_STACK_TRACE_SIZE` | Frames per stack trace | 15 |
//! | `MEMTRACK_STACK_TRACE_ANNOTATION_SIZE` | Max annotation bytes | 512 |
//!
//! ```no_run
//! use memtrack::config::Config;
//!
//! let config = Config::from_env()
//!     .with_store_size(64 * 1024 * 1024)
//!     .with_validation(true);
//! ```

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use serde::Serialize;

pub const ENV_PREFIX: &str = "MEMTRACK_";

pub const DEFAULT_SKIPPED_METRICS: &str =
    "arrays lists metrics-allocations objects-by-type ptr-arrays signals";

/// How block store files are mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MapFileMode {
    /// `MAP_PRIVATE`, file unlinked straight away
    Private,
    /// `MAP_SHARED`, file unlinked straight away
    SharedUnlinked,
    /// `MAP_SHARED`, file kept around (for poking at with a hex editor) until
    /// the store is closed
    Shared,
}

impl MapFileMode {
    fn from_level(level: u64) -> Self {
        match level {
            0 => Self::Private,
            1 => Self::SharedUnlinked,
            _ => Self::Shared,
        }
    }

    pub fn is_shared(self) -> bool {
        !matches!(self, Self::Private)
    }
}

/// What to tell the kernel about pages that no longer hold allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GiveBack {
    Keep,
    /// `MADV_REMOVE`: punch a hole in the backing file
    Remove,
    /// `MADV_DONTNEED`
    DontNeed,
}

impl GiveBack {
    fn from_level(level: u64) -> Self {
        match level {
            0 => Self::Keep,
            1 => Self::Remove,
            _ => Self::DontNeed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub metrics_enabled: bool,
    pub track_allocations: bool,
    pub override_system_malloc: bool,
    pub log_dir: PathBuf,
    pub allocation_map_dir: PathBuf,
    pub included_metrics: String,
    pub skipped_metrics: String,

    pub max_allocation_block_stores: usize,
    /// In bytes
    pub allocation_block_store_size: usize,
    pub dedicated_allocation_block_store_threshold: usize,
    pub allocated_blocks_threshold: usize,
    pub validate_allocation_blocks: bool,
    pub validate_heap: bool,
    pub map_file_mode: MapFileMode,
    pub give_back_deallocated_pages: GiveBack,

    pub collection_interval: Duration,
    pub generations_to_settle: u64,
    pub generations_to_reset_average_window: u64,
    pub number_of_interesting_instances: usize,
    pub collection_ignore_list: String,
    pub collection_include_list: String,
    pub stack_trace_sample_interval: u32,
    pub stack_trace_size: usize,
    pub stack_trace_annotation_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            track_allocations: false,
            override_system_malloc: false,
            log_dir: default_log_dir(),
            allocation_map_dir: env::temp_dir(),
            included_metrics: String::new(),
            skipped_metrics: DEFAULT_SKIPPED_METRICS.to_owned(),
            max_allocation_block_stores: 256,
            allocation_block_store_size: 10 * 1024 * 1024 * 1024,
            dedicated_allocation_block_store_threshold: 8192.min(page_size::get()),
            allocated_blocks_threshold: 28,
            validate_allocation_blocks: false,
            validate_heap: false,
            map_file_mode: MapFileMode::SharedUnlinked,
            give_back_deallocated_pages: GiveBack::Remove,
            collection_interval: Duration::from_secs(10),
            generations_to_settle: 10,
            generations_to_reset_average_window: 10,
            number_of_interesting_instances: 10,
            collection_ignore_list: String::new(),
            collection_include_list: String::new(),
            stack_trace_sample_interval: 1,
            stack_trace_size: 15,
            stack_trace_annotation_size: 512,
        }
    }
}

impl Config {
    /// Load the configuration from `MEMTRACK_*` variables, using the defaults
    /// for anything unset. Values that don't parse are warned about and
    /// ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let metrics_enabled =
            env_flag("ENABLE").unwrap_or(defaults.metrics_enabled) && command_matches();
        Self {
            metrics_enabled,
            track_allocations: env_flag("TRACK_ALLOCATIONS").unwrap_or(metrics_enabled),
            override_system_malloc: env_flag("OVERRIDE_SYSTEM_MALLOC")
                .unwrap_or(defaults.override_system_malloc),
            log_dir: env_var("LOG_DIR").map_or(defaults.log_dir, PathBuf::from),
            allocation_map_dir: env_var("ALLOCATION_MAP_DIR")
                .map_or(defaults.allocation_map_dir, PathBuf::from),
            included_metrics: env_var("INCLUDE").unwrap_or(defaults.included_metrics),
            skipped_metrics: env_var("SKIP").unwrap_or(defaults.skipped_metrics),
            max_allocation_block_stores: env_parse("MAX_ALLOCATION_BLOCK_STORES")
                .unwrap_or(defaults.max_allocation_block_stores),
            allocation_block_store_size: env_parse::<usize>("DEFAULT_ALLOCATION_BLOCK_STORE_SIZE")
                .map_or(defaults.allocation_block_store_size, |kib| {
                    kib.saturating_mul(1024)
                }),
            dedicated_allocation_block_store_threshold: env_parse(
                "DEDICATED_ALLOCATION_BLOCK_STORE_THRESHOLD",
            )
            .map_or(defaults.dedicated_allocation_block_store_threshold, |threshold: usize| {
                threshold.min(page_size::get())
            }),
            allocated_blocks_threshold: env_parse("ALLOCATED_BLOCKS_THRESHOLD")
                .unwrap_or(defaults.allocated_blocks_threshold),
            validate_allocation_blocks: env_flag("VALIDATE_ALLOCATION_BLOCKS")
                .unwrap_or(defaults.validate_allocation_blocks),
            validate_heap: env_flag("VALIDATE_HEAP").unwrap_or(defaults.validate_heap),
            map_file_mode: env_parse("USE_MAP_FILES")
                .map_or(defaults.map_file_mode, MapFileMode::from_level),
            give_back_deallocated_pages: env_parse("GIVE_BACK_DEALLOCATED_PAGES")
                .map_or(defaults.give_back_deallocated_pages, GiveBack::from_level),
            collection_interval: env_parse("COLLECTION_INTERVAL")
                .map_or(defaults.collection_interval, Duration::from_secs),
            generations_to_settle: env_parse("COLLECTION_NUMBER_OF_PRELOAD_INTERVALS")
                .unwrap_or(defaults.generations_to_settle),
            generations_to_reset_average_window: env_parse("COLLECTION_AVERAGE_WINDOW_THRESHOLD")
                .unwrap_or(defaults.generations_to_reset_average_window),
            number_of_interesting_instances: env_parse("COLLECTION_INSTANCE_COUNT")
                .unwrap_or(defaults.number_of_interesting_instances),
            collection_ignore_list: env_var("COLLECTION_INSTANCE_IGNORE_LIST")
                .unwrap_or(defaults.collection_ignore_list),
            collection_include_list: env_var("COLLECTION_INSTANCE_INCLUDE_LIST")
                .unwrap_or(defaults.collection_include_list),
            stack_trace_sample_interval: env_parse("STACK_TRACE_SAMPLE_INTERVAL")
                .unwrap_or(defaults.stack_trace_sample_interval),
            stack_trace_size: env_parse("STACK_TRACE_SIZE").unwrap_or(defaults.stack_trace_size),
            stack_trace_annotation_size: env_parse("STACK_TRACE_ANNOTATION_SIZE")
                .unwrap_or(defaults.stack_trace_annotation_size),
        }
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn with_tracking(mut self, track: bool) -> Self {
        self.track_allocations = track;
        self
    }

    pub fn with_override_system_malloc(mut self, override_malloc: bool) -> Self {
        self.override_system_malloc = override_malloc;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_allocation_map_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.allocation_map_dir = dir.into();
        self
    }

    /// Store size in bytes (the environment variable is in KiB)
    pub fn with_store_size(mut self, bytes: usize) -> Self {
        self.allocation_block_store_size = bytes;
        self
    }

    pub fn with_max_stores(mut self, max: usize) -> Self {
        self.max_allocation_block_stores = max;
        self
    }

    pub fn with_dedicated_threshold(mut self, bytes: usize) -> Self {
        self.dedicated_allocation_block_store_threshold = bytes;
        self
    }

    pub fn with_allocated_blocks_threshold(mut self, blocks: usize) -> Self {
        self.allocated_blocks_threshold = blocks;
        self
    }

    /// Turn both block and heap validation on or off
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_allocation_blocks = validate;
        self.validate_heap = validate;
        self
    }

    pub fn with_map_file_mode(mut self, mode: MapFileMode) -> Self {
        self.map_file_mode = mode;
        self
    }

    pub fn with_give_back(mut self, give_back: GiveBack) -> Self {
        self.give_back_deallocated_pages = give_back;
        self
    }

    pub fn with_included_metrics(mut self, names: impl Into<String>) -> Self {
        self.included_metrics = names.into();
        self
    }

    pub fn with_skipped_metrics(mut self, names: impl Into<String>) -> Self {
        self.skipped_metrics = names.into();
        self
    }

    pub fn with_collection_interval(mut self, interval: Duration) -> Self {
        self.collection_interval = interval;
        self
    }

    pub fn with_generations_to_settle(mut self, generations: u64) -> Self {
        self.generations_to_settle = generations;
        self
    }

    pub fn with_average_window(mut self, samples: u64) -> Self {
        self.generations_to_reset_average_window = samples;
        self
    }

    pub fn with_interesting_instances(mut self, count: usize) -> Self {
        self.number_of_interesting_instances = count;
        self
    }

    pub fn with_instance_lists(
        mut self,
        include: impl Into<String>,
        ignore: impl Into<String>,
    ) -> Self {
        self.collection_include_list = include.into();
        self.collection_ignore_list = ignore.into();
        self
    }

    pub fn with_stack_trace_sample_interval(mut self, interval: u32) -> Self {
        self.stack_trace_sample_interval = interval;
        self
    }
}

/// Split a name list on whitespace and commas
pub fn list_tokens(list: &str) -> impl Iterator<Item = &str> {
    list.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
}

/// `$XDG_CACHE_HOME/metrics/<pid>`, falling back to `$HOME/.cache`
fn default_log_dir() -> PathBuf {
    let cache = env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(env::temp_dir);
    cache.join("metrics").join(std::process::id().to_string())
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = env_var(name)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring {ENV_PREFIX}{name}={value:?}: not a valid value");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env_var(name)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            log::warn!("ignoring {ENV_PREFIX}{name}={value:?}: expected a boolean");
            None
        }
    }
}

/// `MEMTRACK_COMMAND` restricts collection to one executable
fn command_matches() -> bool {
    let Some(command) = env_var("COMMAND") else {
        return true;
    };
    if command == "*" {
        return true;
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|name| name.to_string_lossy() == command))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_allocation_block_stores, 256);
        assert_eq!(config.allocated_blocks_threshold, 28);
        assert_eq!(config.allocation_block_store_size, 10 << 30);
        assert!(config.dedicated_allocation_block_store_threshold <= 8192);
        assert_eq!(config.map_file_mode, MapFileMode::SharedUnlinked);
        assert_eq!(config.give_back_deallocated_pages, GiveBack::Remove);
        assert!(config.log_dir.ends_with(std::process::id().to_string()));
    }

    #[test]
    fn list_tokens_splits_on_spaces_and_commas() {
        let tokens: Vec<_> = list_tokens(" arrays,lists  signals ,").collect();
        assert_eq!(tokens, ["arrays", "lists", "signals"]);
    }

    #[test]
    fn dedicated_threshold_is_capped_at_a_page() {
        let name = "MEMTRACK_DEDICATED_ALLOCATION_BLOCK_STORE_THRESHOLD";
        std::env::set_var(name, "65536");
        let big = Config::from_env().dedicated_allocation_block_store_threshold;
        std::env::set_var(name, "256");
        let small = Config::from_env().dedicated_allocation_block_store_threshold;
        std::env::remove_var(name);
        assert_eq!(big, 65536.min(page_size::get()));
        assert_eq!(small, 256);
    }

    #[test]
    fn levels_map_to_modes() {
        assert_eq!(MapFileMode::from_level(0), MapFileMode::Private);
        assert_eq!(MapFileMode::from_level(2), MapFileMode::Shared);
        assert_eq!(GiveBack::from_level(0), GiveBack::Keep);
        assert_eq!(GiveBack::from_level(2), GiveBack::DontNeed);
    }
}
