//! Connection factory
//!
//! Every query, write and compaction goes through here for a short-lived
//! handle. A handle is opened, used and dropped within one unit of work so
//! the wrapper never becomes the source of a lingering lock.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use shrinkwatch_core::{
    is_lock_error, is_not_a_database, ConnectionConfig, ShrinkError, ShrinkResult,
};
use tracing::debug;

/// Opens configured SQLite handles, retrying once on lock contention
pub struct ConnectionFactory {
    config: ConnectionConfig,
    slots: Arc<Slots>,
}

impl ConnectionFactory {
    /// Build a factory; the configuration is normalized once, here.
    pub fn new(config: ConnectionConfig) -> Self {
        let config = config.normalized();
        let slots = Arc::new(Slots::new(config.max_open_conns));

        debug!(
            driver = %config.driver_name,
            pragmas = ?config.pragmas,
            max_open = config.max_open_conns,
            "Created connection factory"
        );

        Self { config, slots }
    }

    /// The normalized configuration in effect
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether the configured pragma set leaves compaction to the daemon
    pub fn needs_compaction(&self) -> bool {
        self.config.needs_compaction()
    }

    /// Number of handles currently open through this factory
    pub fn open_handles(&self) -> usize {
        *self.slots.open.lock()
    }

    /// Open `path`, creating the database file if it does not exist yet.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> ShrinkResult<DbHandle> {
        self.open_with_flags(path.as_ref(), OpenFlags::default())
    }

    /// Open an existing database file; never creates one.
    pub fn open_existing<P: AsRef<Path>>(&self, path: P) -> ShrinkResult<DbHandle> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        self.open_with_flags(path.as_ref(), flags)
    }

    fn open_with_flags(&self, path: &Path, flags: OpenFlags) -> ShrinkResult<DbHandle> {
        let slot = self
            .slots
            .acquire(self.config.acquire_timeout())
            .ok_or_else(|| ShrinkError::PoolExhausted(path.to_path_buf()))?;

        let conn = open_with_retry(path, || self.attempt_open(path, flags))?;

        self.apply_pragmas(&conn, path);
        conn.set_prepared_statement_cache_capacity(self.config.max_idle_conns);

        Ok(DbHandle {
            conn,
            path: path.to_path_buf(),
            _slot: slot,
        })
    }

    /// One open attempt. SQLite opens lazily, so the file is probed to
    /// surface lock contention and non-database contents right away.
    fn attempt_open(&self, path: &Path, flags: OpenFlags) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(self.config.busy_timeout())?;
        conn.query_row("pragma schema_version;", [], |row| row.get::<_, i64>(0))?;
        Ok(conn)
    }

    /// Pragmas are best effort: a failing statement is logged and skipped.
    fn apply_pragmas(&self, conn: &Connection, path: &Path) {
        for pragma in &self.config.pragmas {
            if let Err(e) = run_pragma(conn, pragma) {
                debug!(path = %path.display(), pragma = %pragma, "Pragma failed: {}", e);
            }
        }
    }
}

fn run_pragma(conn: &Connection, pragma: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(pragma)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

/// Run `attempt`; if the engine reports the file locked, run it exactly
/// once more. The previous caller's handle may just have been released.
pub fn open_with_retry<T, F>(path: &Path, mut attempt: F) -> ShrinkResult<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    match attempt() {
        Ok(value) => Ok(value),
        Err(err) if is_lock_error(&err) => {
            debug!(path = %path.display(), "Database locked, retrying open once");
            attempt().map_err(|err| classify_open_error(path, err))
        }
        Err(err) => Err(classify_open_error(path, err)),
    }
}

fn classify_open_error(path: &Path, err: rusqlite::Error) -> ShrinkError {
    if is_lock_error(&err) {
        ShrinkError::Locked {
            path: path.to_path_buf(),
            source: err,
        }
    } else if is_not_a_database(&err) {
        ShrinkError::NotADatabase(path.to_path_buf())
    } else {
        ShrinkError::Open {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

/// Check existence of a database file. Empty paths never exist.
pub fn database_exists<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return false;
    }

    match std::fs::metadata(path) {
        Ok(_) => true,
        Err(e) => e.kind() != std::io::ErrorKind::NotFound,
    }
}

/// An open, configured connection to one database file.
///
/// Dropping the handle closes the connection and frees its slot.
pub struct DbHandle {
    conn: Connection,
    path: PathBuf,
    _slot: SlotGuard,
}

impl DbHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close explicitly, surfacing any error from the engine.
    pub fn close(self) -> ShrinkResult<()> {
        let DbHandle { conn, _slot, .. } = self;
        conn.close().map_err(|(_, e)| ShrinkError::Sqlite(e))
    }
}

impl Deref for DbHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for DbHandle {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle").field("path", &self.path).finish()
    }
}

/// Counting gate over concurrently open handles
struct Slots {
    open: Mutex<usize>,
    released: Condvar,
    max: usize,
}

impl Slots {
    fn new(max: usize) -> Self {
        Self {
            open: Mutex::new(0),
            released: Condvar::new(),
            max: max.max(1),
        }
    }

    fn acquire(self: &Arc<Self>, timeout: Duration) -> Option<SlotGuard> {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();

        while *open >= self.max {
            if self.released.wait_until(&mut open, deadline).timed_out() && *open >= self.max {
                return None;
            }
        }

        *open += 1;
        Some(SlotGuard {
            slots: Arc::clone(self),
        })
    }
}

struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut open = self.slots.open.lock();
        *open = open.saturating_sub(1);
        self.slots.released.notify_one();
    }
}
