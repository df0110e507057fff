//! Query/write access
//!
//! Thin statement helpers over the connection factory. Each call opens a
//! handle, runs, and closes it again; writes register the file with the
//! watch registry so the compaction daemon picks it up.

use std::path::Path;
use std::sync::Arc;

use rusqlite::types::Value;
use shrinkwatch_core::{ShrinkError, ShrinkResult};
use tracing::debug;

use crate::compactor::{self, CompactOutcome};
use crate::connection::{self, ConnectionFactory};
use crate::registry::WatchRegistry;

/// Which operations register their file with the watch registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingOptions {
    /// Register files touched by writes
    pub writes: bool,
    /// Also register files touched by reads; a long write may have
    /// finished without a later write to report it
    pub reads: bool,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            writes: true,
            reads: true,
        }
    }
}

/// Statement execution against database files by path
pub struct DbAccess {
    factory: Arc<ConnectionFactory>,
    registry: Arc<WatchRegistry>,
    tracking: TrackingOptions,
}

impl DbAccess {
    pub fn new(
        factory: Arc<ConnectionFactory>,
        registry: Arc<WatchRegistry>,
        tracking: TrackingOptions,
    ) -> Self {
        Self {
            factory,
            registry,
            tracking,
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    /// Whether the database file exists
    pub fn database_exists<P: AsRef<Path>>(&self, path: P) -> bool {
        connection::database_exists(path)
    }

    /// Execute a write inside a transaction, rolled back on failure.
    /// Returns the rows changed by the last statement.
    pub fn execute_non_query<P: AsRef<Path>>(&self, sql: &str, path: P) -> ShrinkResult<i64> {
        let path = path.as_ref();
        self.track_write(path);

        self.check_statement(sql)?;
        let mut handle = self.factory.open(path)?;

        let tx = handle.transaction()?;
        tx.execute_batch(sql)?;
        let changed = tx.changes() as i64;
        tx.commit()?;

        handle.close()?;
        Ok(changed)
    }

    /// Execute a write without a transaction.
    pub fn execute_non_query_no_tx<P: AsRef<Path>>(&self, sql: &str, path: P) -> ShrinkResult<i64> {
        let path = path.as_ref();
        self.track_write(path);

        self.check_statement(sql)?;
        let handle = self.factory.open(path)?;

        handle.execute_batch(sql)?;
        let changed = handle.changes() as i64;

        handle.close()?;
        Ok(changed)
    }

    /// First column of the first row, `None` for no rows or NULL.
    pub fn execute_scalar<P: AsRef<Path>>(&self, sql: &str, path: P) -> ShrinkResult<Option<Value>> {
        let path = path.as_ref();
        if self.tracking.reads {
            self.registry.register(path);
        }

        let handle = self.factory.open(path)?;
        let value = {
            let mut stmt = handle.prepare(sql)?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => row.get::<_, Value>(0)?,
                None => Value::Null,
            }
        };
        handle.close()?;

        Ok(match value {
            Value::Null => None,
            value => Some(value),
        })
    }

    /// Row count of `table`
    pub fn table_count<P: AsRef<Path>>(&self, table: &str, path: P) -> ShrinkResult<i64> {
        let sql = format!("select count(*) from {};", quote_identifier(table));
        match self.execute_scalar(&sql, path)? {
            Some(Value::Integer(count)) => Ok(count),
            _ => Ok(0),
        }
    }

    /// Column names of `table`, in declaration order
    pub fn column_names<P: AsRef<Path>>(&self, path: P, table: &str) -> ShrinkResult<Vec<String>> {
        let path = path.as_ref();
        if self.tracking.reads {
            self.registry.register(path);
        }

        let handle = self.factory.open(path)?;
        let names = {
            let sql = format!("pragma table_info({});", quote_identifier(table));
            let mut stmt = handle.prepare(&sql)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };
        handle.close()?;

        Ok(names)
    }

    /// Compact `path` right away through the factory.
    pub fn compact<P: AsRef<Path>>(&self, path: P) -> ShrinkResult<CompactOutcome> {
        compactor::compact(&self.factory, path)
    }

    fn track_write(&self, path: &Path) {
        if self.tracking.writes && self.registry.register(path) {
            debug!(path = %path.display(), "Tracking database for compaction");
        }
    }

    /// Enforce the statement length limit. The text reaches the engine
    /// unchanged; literals and comments may span lines.
    fn check_statement(&self, sql: &str) -> ShrinkResult<()> {
        let max = self.factory.config().max_statement_len;
        if sql.len() > max {
            return Err(ShrinkError::StatementTooLarge {
                len: sql.len(),
                max,
            });
        }
        Ok(())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrinkwatch_core::ConnectionConfig;
    use tempfile::TempDir;

    fn access(config: ConnectionConfig, tracking: TrackingOptions) -> DbAccess {
        let factory = Arc::new(ConnectionFactory::new(ConnectionConfig {
            busy_timeout_ms: 0,
            ..config
        }));
        DbAccess::new(factory, Arc::new(WatchRegistry::new()), tracking)
    }

    const SCHEMA: &str = "
        create table if not exists dbtest (
            id integer not null primary key autoincrement,
            message text not null
        );
        create unique index if not exists inx_dbtest_message on dbtest (message);
        insert into dbtest (message) values ('hello world');
    ";

    #[test]
    fn test_write_registers_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.sqlite");
        let db = access(ConnectionConfig::default(), TrackingOptions::default());

        let changed = db.execute_non_query(SCHEMA, &path).unwrap();
        assert_eq!(changed, 1);
        assert!(db.database_exists(&path));
        assert_eq!(db.registry().snapshot(), vec![path.clone()]);

        db.execute_non_query("insert into dbtest (message) values ('again');", &path)
            .unwrap();
        assert_eq!(db.registry().len(), 1);
        assert_eq!(db.table_count("dbtest", &path).unwrap(), 2);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rollback.sqlite");
        let db = access(ConnectionConfig::default(), TrackingOptions::default());
        db.execute_non_query(SCHEMA, &path).unwrap();

        let result = db.execute_non_query(
            "insert into dbtest (message) values ('new'); insert into dbtest (message) values ('hello world');",
            &path,
        );
        assert!(result.is_err());
        assert_eq!(db.table_count("dbtest", &path).unwrap(), 1);
    }

    #[test]
    fn test_no_tx_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notx.sqlite");
        let db = access(ConnectionConfig::default(), TrackingOptions::default());
        db.execute_non_query(SCHEMA, &path).unwrap();

        let changed = db
            .execute_non_query_no_tx("update dbtest set message = 'changed';", &path)
            .unwrap();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_scalar_and_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scalar.sqlite");
        let db = access(
            ConnectionConfig::default(),
            TrackingOptions {
                writes: false,
                reads: false,
            },
        );
        db.execute_non_query(SCHEMA, &path).unwrap();

        let message = db
            .execute_scalar("select message from dbtest where id = 1;", &path)
            .unwrap();
        assert_eq!(message, Some(Value::Text("hello world".to_string())));

        let missing = db
            .execute_scalar("select message from dbtest where id = 99;", &path)
            .unwrap();
        assert_eq!(missing, None);

        assert_eq!(
            db.column_names(&path, "dbtest").unwrap(),
            vec!["id".to_string(), "message".to_string()]
        );
        assert!(db.registry().is_empty());
    }

    #[test]
    fn test_read_tracking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reads.sqlite");
        let db = access(
            ConnectionConfig::default(),
            TrackingOptions {
                writes: false,
                reads: true,
            },
        );

        db.execute_non_query(SCHEMA, &path).unwrap();
        assert!(db.registry().is_empty());

        db.execute_scalar("select count(*) from dbtest;", &path).unwrap();
        assert!(db.registry().contains(&path));
    }

    #[test]
    fn test_oversized_statement_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.sqlite");
        let db = access(
            ConnectionConfig {
                max_statement_len: 16,
                ..Default::default()
            },
            TrackingOptions::default(),
        );

        let err = db
            .execute_non_query("insert into t values ('this is far too long');", &path)
            .unwrap_err();
        assert!(matches!(err, ShrinkError::StatementTooLarge { max: 16, .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_statement_text_kept_verbatim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lines.sqlite");
        let db = access(ConnectionConfig::default(), TrackingOptions::default());

        db.execute_non_query("create table t (\n\tx text\n);", &path)
            .unwrap();
        db.execute_non_query(
            "insert into t values ('a\nb'); -- seed\ninsert into t values ('c\td');",
            &path,
        )
        .unwrap();

        assert_eq!(db.table_count("t", &path).unwrap(), 2);
        assert_eq!(
            db.execute_scalar("select x from t where rowid = 1;", &path)
                .unwrap(),
            Some(Value::Text("a\nb".to_string()))
        );
        assert_eq!(
            db.execute_scalar("select x from t where rowid = 2;", &path)
                .unwrap(),
            Some(Value::Text("c\td".to_string()))
        );
    }

    #[test]
    fn test_compact_tracked_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compact.sqlite");
        let db = access(ConnectionConfig::default(), TrackingOptions::default());
        db.execute_non_query(SCHEMA, &path).unwrap();

        let outcome = db.compact(&path).unwrap();
        assert!(matches!(outcome, CompactOutcome::Compacted { .. }));
        assert_eq!(db.table_count("dbtest", &path).unwrap(), 1);
        assert_eq!(
            db.compact(dir.path().join("compact.sqlite-wal")).unwrap(),
            CompactOutcome::Skipped(crate::compactor::SkipReason::NotTrackable)
        );
    }
}
