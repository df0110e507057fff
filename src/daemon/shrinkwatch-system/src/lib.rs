//! Shrinkwatch System Integration
//!
//! SQLite and filesystem side of shrinkwatch: the connection factory, the
//! watch registry of possibly-active database files, and the compaction
//! and maintenance passes the daemon runs over it.

pub mod access;
pub mod compactor;
pub mod connection;
pub mod registry;

pub use access::{DbAccess, TrackingOptions};
pub use compactor::{
    compact, compact_bounded, maintenance_pass, CompactOutcome, CompactionPolicy, Compactor,
    EntryOutcome, EntryReport, EvictReason, PassReport, SkipReason,
};
pub use connection::{database_exists, open_with_retry, ConnectionFactory, DbHandle};
pub use registry::WatchRegistry;
pub use shrinkwatch_core::{ConnectionConfig, ShrinkError, ShrinkResult};
