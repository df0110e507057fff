//! Compaction and registry maintenance passes
//!
//! A pass copies the registry once, walks the copy and evicts by value, so
//! concurrent registrations and the other daemon never invalidate its
//! position. The clock is passed in explicitly.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use rusqlite::{ErrorCode, InterruptHandle};
use shrinkwatch_core::{
    classify_activity, idle_for, is_trackable, Activity, ShrinkError, ShrinkResult,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::ConnectionFactory;
use crate::registry::WatchRegistry;

/// Why a compaction request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Empty or side-car path
    NotTrackable,
    /// The file is gone
    Missing,
    /// The caller stopped waiting before the statement started
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompactOutcome {
    Compacted { duration: Duration },
    Skipped(SkipReason),
}

/// Compact one database file with a dedicated short-lived handle.
///
/// Runs `VACUUM` and then truncates the write-ahead log so the primary
/// file actually shrinks in WAL mode.
pub fn compact<P: AsRef<Path>>(
    factory: &ConnectionFactory,
    path: P,
) -> ShrinkResult<CompactOutcome> {
    compact_with(factory, path.as_ref(), None, |_| true)
}

/// VM instructions between deadline checks
const PROGRESS_OPS: i32 = 1_000;

/// `on_open` receives the interrupt handle before the statement starts and
/// returns whether to go ahead. With a deadline, the engine aborts the
/// statement at the first progress check past it, even when the statement
/// only starts after the deadline.
fn compact_with<F>(
    factory: &ConnectionFactory,
    path: &Path,
    deadline: Option<(Instant, Duration)>,
    on_open: F,
) -> ShrinkResult<CompactOutcome>
where
    F: FnOnce(InterruptHandle) -> bool,
{
    if !is_trackable(path) {
        return Ok(CompactOutcome::Skipped(SkipReason::NotTrackable));
    }

    match std::fs::metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CompactOutcome::Skipped(SkipReason::Missing));
        }
        Err(e) => return Err(e.into()),
    }

    let handle = factory.open_existing(path)?;
    if let Some((at, _)) = deadline {
        handle.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= at));
    }
    if !on_open(handle.get_interrupt_handle()) {
        return Ok(CompactOutcome::Skipped(SkipReason::Abandoned));
    }

    let started = Instant::now();
    if let Err(e) = handle.execute_batch("VACUUM;") {
        return Err(match deadline {
            Some((at, limit)) if is_interrupted(&e) && Instant::now() >= at => {
                ShrinkError::Timeout(limit)
            }
            _ => e.into(),
        });
    }

    if let Err(e) = handle.query_row("pragma wal_checkpoint(truncate);", [], |row| {
        row.get::<_, i64>(0)
    }) {
        debug!(path = %path.display(), "WAL truncate after vacuum failed: {}", e);
    }

    handle.close()?;
    Ok(CompactOutcome::Compacted {
        duration: started.elapsed(),
    })
}

fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted
    )
}

/// Compact on the blocking pool, interrupting the statement if it runs
/// past `limit`.
pub async fn compact_bounded(
    factory: Arc<ConnectionFactory>,
    path: PathBuf,
    limit: Duration,
) -> ShrinkResult<CompactOutcome> {
    let (interrupt_tx, mut interrupt_rx) = oneshot::channel::<InterruptHandle>();
    let deadline = Instant::now() + limit;

    let mut task = tokio::task::spawn_blocking(move || {
        compact_with(&factory, &path, Some((deadline, limit)), |interrupt| {
            interrupt_tx.send(interrupt).is_ok()
        })
    });

    match tokio::time::timeout(limit, &mut task).await {
        Ok(joined) => joined.map_err(|e| ShrinkError::Join(e.to_string()))?,
        Err(_) => {
            // Closing first means a handle sent from here on is refused,
            // and the blocking side skips the statement.
            interrupt_rx.close();
            if let Ok(interrupt) = interrupt_rx.try_recv() {
                interrupt.interrupt();
            }
            Err(ShrinkError::Timeout(limit))
        }
    }
}

/// Timing knobs for the compaction daemon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPolicy {
    /// Files modified more recently than this are left alone
    pub idle_threshold: Duration,
    /// Pause between registry entries
    pub entry_pause: Duration,
    /// Upper bound for one compaction statement
    pub statement_timeout: Duration,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(15 * 60),
            entry_pause: Duration::from_millis(100),
            statement_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Why an entry left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictReason {
    Missing,
    Unreadable,
    /// Untouched for longer than the maintenance retention window
    Retired,
}

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::Missing => "missing",
            EvictReason::Unreadable => "unreadable",
            EvictReason::Retired => "retired",
        }
    }
}

/// What a pass did with one registry entry
#[derive(Debug)]
pub enum EntryOutcome {
    Evicted(EvictReason),
    /// Recently written; left for a later pass
    Active,
    /// Idle, but untouched since this daemon last compacted it
    AlreadyCompacted,
    Compacted(Duration),
    Skipped(SkipReason),
    Failed(ShrinkError),
    /// Kept by the maintenance pass
    Retained,
}

#[derive(Debug)]
pub struct EntryReport {
    pub path: PathBuf,
    pub outcome: EntryOutcome,
}

/// Result of one walk over the registry
#[derive(Debug, Default)]
pub struct PassReport {
    pub entries: Vec<EntryReport>,
    /// The pass stopped early because of cancellation
    pub cancelled: bool,
}

impl PassReport {
    fn push(&mut self, path: PathBuf, outcome: EntryOutcome) {
        self.entries.push(EntryReport { path, outcome });
    }

    pub fn compacted(&self) -> Vec<&Path> {
        self.paths_where(|o| matches!(o, EntryOutcome::Compacted(_)))
    }

    pub fn evicted(&self) -> Vec<&Path> {
        self.paths_where(|o| matches!(o, EntryOutcome::Evicted(_)))
    }

    pub fn failed(&self) -> Vec<&Path> {
        self.paths_where(|o| matches!(o, EntryOutcome::Failed(_)))
    }

    pub fn outcome(&self, path: &Path) -> Option<&EntryOutcome> {
        self.entries
            .iter()
            .find(|e| e.path == path)
            .map(|e| &e.outcome)
    }

    fn paths_where(&self, pred: impl Fn(&EntryOutcome) -> bool) -> Vec<&Path> {
        self.entries
            .iter()
            .filter(|e| pred(&e.outcome))
            .map(|e| e.path.as_path())
            .collect()
    }
}

enum FileState {
    Missing,
    Unreadable(std::io::Error),
    Modified(SystemTime),
}

async fn probe(path: &Path) -> FileState {
    match tokio::fs::metadata(path).await {
        Ok(meta) => match meta.modified() {
            Ok(modified) => FileState::Modified(modified),
            Err(e) => FileState::Unreadable(e),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileState::Missing,
        Err(e) => FileState::Unreadable(e),
    }
}

/// Compaction pass logic over the shared registry
pub struct Compactor {
    factory: Arc<ConnectionFactory>,
    registry: Arc<WatchRegistry>,
    /// Modification time observed right after our own compaction
    compacted_at: DashMap<PathBuf, SystemTime>,
}

impl Compactor {
    pub fn new(factory: Arc<ConnectionFactory>, registry: Arc<WatchRegistry>) -> Self {
        Self {
            factory,
            registry,
            compacted_at: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Evaluate every registry entry once: evict missing or unreadable
    /// files, skip active ones and compact the idle ones.
    pub async fn run_pass(
        &self,
        policy: &CompactionPolicy,
        now: SystemTime,
        cancel: &CancellationToken,
    ) -> PassReport {
        let snapshot = self.registry.snapshot();
        {
            let live: HashSet<&PathBuf> = snapshot.iter().collect();
            self.compacted_at.retain(|path, _| live.contains(path));
        }

        let mut report = PassReport::default();
        for (i, path) in snapshot.into_iter().enumerate() {
            if i > 0 && !policy.entry_pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(policy.entry_pause) => {}
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = self.evaluate(&path, policy, now).await;
            report.push(path, outcome);
        }

        report
    }

    async fn evaluate(&self, path: &Path, policy: &CompactionPolicy, now: SystemTime) -> EntryOutcome {
        let modified = match probe(path).await {
            FileState::Missing => return self.evict(path, EvictReason::Missing),
            FileState::Unreadable(e) => {
                debug!(path = %path.display(), "Status lookup failed: {}", e);
                return self.evict(path, EvictReason::Unreadable);
            }
            FileState::Modified(modified) => modified,
        };

        if classify_activity(modified, now, policy.idle_threshold) == Activity::Active {
            return EntryOutcome::Active;
        }

        let untouched = self
            .compacted_at
            .get(path)
            .is_some_and(|at| *at == modified);
        if untouched {
            return EntryOutcome::AlreadyCompacted;
        }

        let result = compact_bounded(
            Arc::clone(&self.factory),
            path.to_path_buf(),
            policy.statement_timeout,
        )
        .await;

        match result {
            Ok(CompactOutcome::Compacted { duration }) => {
                if let FileState::Modified(after) = probe(path).await {
                    self.compacted_at.insert(path.to_path_buf(), after);
                }
                info!(path = %path.display(), ?duration, "Compacted database");
                EntryOutcome::Compacted(duration)
            }
            Ok(CompactOutcome::Skipped(SkipReason::Missing)) => {
                self.evict(path, EvictReason::Missing)
            }
            Ok(CompactOutcome::Skipped(reason)) => EntryOutcome::Skipped(reason),
            Err(e) => EntryOutcome::Failed(e),
        }
    }

    fn evict(&self, path: &Path, reason: EvictReason) -> EntryOutcome {
        self.registry.evict_path(path);
        self.compacted_at.remove(path);
        debug!(path = %path.display(), reason = reason.as_str(), "Evicted from registry");
        EntryOutcome::Evicted(reason)
    }
}

/// Bound registry growth: evict entries whose file is gone, cannot be
/// inspected, or has been untouched for longer than `retention`.
pub async fn maintenance_pass(
    registry: &WatchRegistry,
    retention: Duration,
    now: SystemTime,
    cancel: &CancellationToken,
) -> PassReport {
    let mut report = PassReport::default();

    for path in registry.snapshot() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let reason = match probe(&path).await {
            FileState::Missing => Some(EvictReason::Missing),
            FileState::Unreadable(_) => Some(EvictReason::Unreadable),
            FileState::Modified(modified) if idle_for(modified, now) >= retention => {
                Some(EvictReason::Retired)
            }
            FileState::Modified(_) => None,
        };

        let outcome = match reason {
            Some(reason) => {
                registry.evict_path(&path);
                debug!(path = %path.display(), reason = reason.as_str(), "Maintenance eviction");
                EntryOutcome::Evicted(reason)
            }
            None => EntryOutcome::Retained,
        };
        report.push(path, outcome);
    }

    report
}
