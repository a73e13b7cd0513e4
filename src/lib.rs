//! Allocation tracking on top of file-backed block stores, plus the metrics
//! collection that reports on them.

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
pub mod metrics;
pub mod os;
pub mod sync;
pub mod util;

pub use config::Config;
pub use error::{CorruptionError, Error};
