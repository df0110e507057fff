//! Shrinkwatch Core - shared types for SQLite file lifecycle management
//!
//! This crate holds everything that does not touch a database or the
//! filesystem: the error taxonomy, side-car file classification, pragma
//! normalization and the idle policy used by the background daemons.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while opening, querying or compacting a database file
#[derive(Error, Debug)]
pub enum ShrinkError {
    #[error("database is locked: {path}")]
    Locked {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("file is not a database: {0}")]
    NotADatabase(PathBuf),
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database file does not exist: {0}")]
    Missing(PathBuf),
    #[error("not a trackable database file: {0}")]
    NotTrackable(PathBuf),
    #[error("statement length {len} exceeded max length of {max} bytes")]
    StatementTooLarge { len: usize, max: usize },
    #[error("no connection slot for {0} within the acquire timeout")]
    PoolExhausted(PathBuf),
    #[error("statement did not finish within {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl ShrinkError {
    /// Whether this error stems from lock contention on the database file
    pub fn is_locked(&self) -> bool {
        match self {
            ShrinkError::Locked { .. } => true,
            ShrinkError::Sqlite(err) => is_lock_error(err),
            _ => false,
        }
    }
}

pub type ShrinkResult<T> = Result<T, ShrinkError>;

/// True when the engine reports the file as exclusively held.
pub fn is_lock_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

/// True when the engine rejects the file contents as not being a database.
pub fn is_not_a_database(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.code == ErrorCode::NotADatabase,
        _ => false,
    }
}

/// Suffixes of the engine's companion files (rollback journal, shared memory, WAL)
pub const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-shm", "-wal"];

/// A path is a trackable primary database file unless it is empty or one
/// of the side-car companion files.
pub fn is_trackable<P: AsRef<Path>>(path: P) -> bool {
    let lowered = path.as_ref().to_string_lossy().to_lowercase();
    if lowered.trim().is_empty() {
        return false;
    }

    !SIDECAR_SUFFIXES
        .iter()
        .any(|suffix| lowered.ends_with(suffix))
}

pub const DEFAULT_DRIVER: &str = "sqlite3";
pub const DEFAULT_CHECKPOINT: &str = "pragma wal_checkpoint(passive);";
/// Rough upper bound for a single statement (see sqlite.org/limits.html)
pub const DEFAULT_MAX_STATEMENT_LEN: usize = 1_000_000_000;

/// Default pragma set, applied when none is configured.
///
/// Auto-vacuum stays off: it only truncates freelist pages and can make
/// fragmentation worse, so files are compacted with `VACUUM` instead.
pub fn default_pragmas() -> Vec<String> {
    vec![
        "PRAGMA auto_vacuum = NONE;".to_string(),
        "PRAGMA journal_mode = WAL;".to_string(),
        "PRAGMA wal_checkpoint(PASSIVE);".to_string(),
    ]
}

/// Connection settings shared by every handle the factory opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Driver identifier (only `sqlite3` is supported)
    pub driver_name: String,
    /// Pragma statements applied, in order, to every new handle
    pub pragmas: Vec<String>,
    /// Prepared statements kept cached per handle
    pub max_idle_conns: usize,
    /// Handles that may be open at once through one factory
    pub max_open_conns: usize,
    /// How long the engine waits on a locked file before reporting it busy
    pub busy_timeout_ms: u64,
    /// How long a caller waits for a free handle slot
    pub acquire_timeout_ms: u64,
    /// Statements longer than this are rejected before reaching the engine
    pub max_statement_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER.to_string(),
            pragmas: default_pragmas(),
            max_idle_conns: 1,
            max_open_conns: 1,
            busy_timeout_ms: 1000,
            acquire_timeout_ms: 30_000,
            max_statement_len: DEFAULT_MAX_STATEMENT_LEN,
        }
    }
}

impl ConnectionConfig {
    /// Apply defaults and normalize the pragma text. Called once when a
    /// factory is built.
    pub fn normalized(mut self) -> Self {
        if self.pragmas.iter().all(|p| p.trim().is_empty()) {
            self.pragmas = default_pragmas();
        }
        if self.driver_name.trim().is_empty() {
            self.driver_name = DEFAULT_DRIVER.to_string();
        }
        self.max_idle_conns = self.max_idle_conns.max(1);
        self.max_open_conns = self.max_open_conns.max(1);
        self.pragmas = normalize_pragmas(&self.pragmas);
        self
    }

    /// Files need periodic compaction unless the pragma set already asks
    /// the engine for continuous auto-vacuuming.
    pub fn needs_compaction(&self) -> bool {
        !self.pragmas.iter().any(|p| requests_full_auto_vacuum(p))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn requests_full_auto_vacuum(pragma: &str) -> bool {
    let pragma = pragma.to_lowercase().replace(' ', "");
    pragma.contains("auto_vacuum=full") || pragma.contains("auto_vacuum=1;")
}

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static PRAGMA_KEYWORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^pragma\s*").unwrap());
static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*=\s*").unwrap());

/// Normalize pragma statements: trimmed, single-spaced, lower-cased,
/// semicolon-terminated. A WAL journal-mode statement is always followed
/// directly by its checkpoint statement.
pub fn normalize_pragmas<S: AsRef<str>>(pragmas: &[S]) -> Vec<String> {
    let statements = pragmas
        .iter()
        .filter_map(|raw| {
            let collapsed = WHITESPACE.replace_all(raw.as_ref().trim(), " ").to_lowercase();
            let body = collapsed
                .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
                .trim();
            if body.is_empty() {
                return None;
            }
            let body = PRAGMA_KEYWORD.replace(body, "pragma ");
            let body = ASSIGNMENT.replace_all(&body, " = ");
            Some(format!("{body};"))
        })
        .collect();

    order_wal_checkpoint(statements)
}

fn is_wal_journal_mode(statement: &str) -> bool {
    statement.contains("journal_mode = wal")
}

fn is_checkpoint(statement: &str) -> bool {
    statement.contains("wal_checkpoint")
}

fn order_wal_checkpoint(statements: Vec<String>) -> Vec<String> {
    let Some(wal_pos) = statements.iter().position(|s| is_wal_journal_mode(s)) else {
        return statements;
    };

    let checkpoint = statements
        .iter()
        .find(|s| is_checkpoint(s))
        .cloned()
        .unwrap_or_else(|| DEFAULT_CHECKPOINT.to_string());

    let mut ordered = Vec::with_capacity(statements.len() + 1);
    for (i, statement) in statements.into_iter().enumerate() {
        if is_checkpoint(&statement) {
            continue;
        }
        ordered.push(statement);
        if i == wal_pos {
            ordered.push(checkpoint.clone());
        }
    }
    ordered
}

/// Activity of a database file relative to an idle threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Written more recently than the threshold
    Active,
    /// Untouched for at least the threshold
    Idle,
}

/// Time elapsed since `modified`. Modification times in the future count
/// as zero.
pub fn idle_for(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

pub fn classify_activity(modified: SystemTime, now: SystemTime, threshold: Duration) -> Activity {
    if idle_for(modified, now) >= threshold {
        Activity::Idle
    } else {
        Activity::Active
    }
}
