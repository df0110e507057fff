//! Shrinkwatch Daemon Library
//!
//! Long-running service around the shrinkwatch registry: configuration,
//! background compaction and maintenance loops, metrics.

pub mod config;
pub mod daemon;
pub mod metrics;

pub use crate::config::{ConfigManager, DaemonConfig};
pub use crate::daemon::{Daemon, DaemonEvent, DaemonStats};
pub use crate::metrics::{MetricsCollector, MetricsStats, PassKind};
