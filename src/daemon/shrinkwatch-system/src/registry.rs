//! Watch registry
//!
//! The process-wide, ordered, duplicate-free set of database paths under
//! observation. Entries come from runtime activity only; the registry is
//! never persisted and never filled by scanning directories.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use shrinkwatch_core::is_trackable;
use tracing::debug;

#[derive(Default)]
struct Entries {
    order: Vec<PathBuf>,
    members: HashSet<PathBuf>,
}

/// Registry of possibly-active database files
#[derive(Default)]
pub struct WatchRegistry {
    entries: Mutex<Entries>,
    registrations: AtomicU64,
    evictions: AtomicU64,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `path` unless it is already tracked or is a side-car file.
    /// Returns whether the path was added.
    pub fn register<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        if !is_trackable(path) {
            return false;
        }

        let mut entries = self.entries.lock();
        if entries.members.contains(path) {
            return false;
        }

        entries.members.insert(path.to_path_buf());
        entries.order.push(path.to_path_buf());
        self.registrations.fetch_add(1, Ordering::Relaxed);

        debug!(path = %path.display(), "Registered database file");
        true
    }

    /// Remove the entry at `index`. Out-of-range indexes are ignored, since
    /// the registry may have shrunk since the index was computed.
    pub fn evict(&self, index: usize) -> Option<PathBuf> {
        let mut entries = self.entries.lock();
        if index >= entries.order.len() {
            return None;
        }

        let path = entries.order.remove(index);
        entries.members.remove(&path);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Some(path)
    }

    /// Remove `path` if present.
    pub fn evict_path<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        let mut entries = self.entries.lock();
        if !entries.members.remove(path) {
            return false;
        }

        entries.order.retain(|p| p != path);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Copy of the tracked paths, in registration order
    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.entries.lock().order.clone()
    }

    pub fn contains<P: AsRef<Path>>(&self, path: P) -> bool {
        self.entries.lock().members.contains(path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total successful registrations since creation
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Total evictions since creation
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("entries", &self.snapshot())
            .finish()
    }
}
