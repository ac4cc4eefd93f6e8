//! SQLite-backed index store: the transactional row-store backend.
//!
//! Grounded on the original's `indexSQLite.py`: a single connection opened
//! with `isolation_level="DEFERRED"`, committing every `COMMIT_AFTER_CNT`
//! writes rather than after each one.

use super::store::IndexStore;
use crate::error::IndexError;
use rusqlite::Connection;

/// Commits the pending batch after this many `insert_offset` calls,
/// matching the original's `COMMIT_AFTER_CNT`.
pub const COMMIT_AFTER_CNT: usize = 10;

pub struct SqliteIndexStore {
    conn: Connection,
    pending: usize,
}

impl SqliteIndexStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| IndexError::Open {
            path: path.display().to_string(),
            source: e.into(),
        })?;
        let mut store = Self { conn, pending: 0 };
        store.create_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory().map_err(|e| IndexError::Open {
            path: ":memory:".to_string(),
            source: e.into(),
        })?;
        let mut store = Self { conn, pending: 0 };
        store.create_schema()?;
        Ok(store)
    }

    /// Open a second, read-only handle against the same file. Backs the
    /// worker-side cache client's DCP-bypassing reads (§9 open question).
    pub fn open_read_only(path: impl AsRef<std::path::Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| IndexError::Open {
            path: path.display().to_string(),
            source: e.into(),
        })?;
        Ok(Self { conn, pending: 0 })
    }
}

impl IndexStore for SqliteIndexStore {
    fn create_schema(&mut self) -> Result<(), IndexError> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS OffsetIndex (documentHash TEXT PRIMARY KEY, offset INTEGER)",
                [],
            )
            .map_err(|e| IndexError::Write(e.into()))?;
        Ok(())
    }

    fn insert_offset(&mut self, hash: &str, offset: u64) -> Result<(), IndexError> {
        if self.pending == 0 {
            self.conn
                .execute_batch("BEGIN DEFERRED")
                .map_err(|e| IndexError::Write(e.into()))?;
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO OffsetIndex (documentHash, offset) VALUES (?1, ?2)",
                rusqlite::params![hash, offset as i64],
            )
            .map_err(|e| IndexError::Write(e.into()))?;

        self.pending += 1;
        if self.pending >= COMMIT_AFTER_CNT {
            self.flush()?;
        }
        Ok(())
    }

    fn read_offset(&self, hash: &str) -> Result<Option<u64>, IndexError> {
        self.conn
            .query_row(
                "SELECT offset FROM OffsetIndex WHERE documentHash = ?1",
                [hash],
                |row| row.get::<_, i64>(0),
            )
            .map(|offset| Some(offset as u64))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(IndexError::Read(other.into())),
            })
    }

    fn flush(&mut self) -> Result<(), IndexError> {
        if self.pending == 0 {
            return Ok(());
        }
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| IndexError::Flush(e.into()))?;
        self.pending = 0;
        Ok(())
    }

    fn count(&self) -> Result<u64, IndexError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM OffsetIndex", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| IndexError::Read(e.into()))
    }

    fn supports_direct_read(&self) -> bool {
        true
    }
}
