//! Time-series storage for the Pulse recorder service
//!
//! This module persists one row per sampling tick across three related
//! tables — the sample timeline plus its CPU and memory readings — and
//! enforces the retention horizon by trimming aged rows on every append.
//! The logical three-table shape is part of the external contract and
//! must survive storage engine changes.

use std::fs;
use std::path::Path;

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// DDL for the sample timeline and its readings.
///
/// `time_id` is `AUTOINCREMENT` so ids stay strictly increasing with
/// insertion order even across retention deletes; readings cascade with
/// their parent sample.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS time (
    time_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_time_timestamp ON time (timestamp);

CREATE TABLE IF NOT EXISTS cpus (
    time_id INTEGER NOT NULL,
    load    REAL NOT NULL,
    FOREIGN KEY (time_id) REFERENCES time (time_id) ON UPDATE CASCADE ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_cpus_time_id ON cpus (time_id);

CREATE TABLE IF NOT EXISTS memory (
    time_id INTEGER NOT NULL,
    free    REAL NOT NULL,
    total   REAL NOT NULL,
    FOREIGN KEY (time_id) REFERENCES time (time_id) ON UPDATE CASCADE ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_memory_time_id ON memory (time_id);

CREATE TABLE IF NOT EXISTS options (
    name  TEXT UNIQUE,
    value REAL,
    unit  TEXT
);
";

/// One joined row of the store: a sample and both its readings
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRow {
    /// Sample timestamp in epoch milliseconds
    pub timestamp: i64,

    /// Aggregate CPU load percentage (0-100)
    pub cpu_load: f64,

    /// Free memory in GiB
    pub mem_free: f64,

    /// Total memory in GiB
    pub mem_total: f64,
}

/// SQLite-backed time-series store for host metrics.
///
/// The sampling loop is the only writer; trimming happens inside every
/// append transaction rather than in a background sweep, so the store
/// never exceeds its horizon even under irregular sampling intervals.
pub struct MetricsStore {
    conn: Connection,
    horizon_ms: i64,
}

impl MetricsStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path, history_days: u32) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| StoreError::DirectoryCreationFailed {
                path: parent.to_string_lossy().to_string(),
            })?;
        }

        let conn = Connection::open(path)?;
        Self::initialize(conn, history_days)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(history_days: u32) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, history_days)
    }

    fn initialize(conn: Connection, history_days: u32) -> StoreResult<Self> {
        if history_days == 0 {
            return Err(StoreError::Schema {
                reason: "retention horizon must be positive".to_string(),
            });
        }

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;

        let horizon_ms = i64::from(history_days) * 24 * 3600 * 1000;
        conn.execute(
            "INSERT OR REPLACE INTO options (name, value, unit) VALUES ('history', ?1, 'ms')",
            params![horizon_ms],
        )?;

        Ok(Self { conn, horizon_ms })
    }

    /// Retention horizon in milliseconds
    pub fn horizon_ms(&self) -> i64 {
        self.horizon_ms
    }

    /// Append one sample with its CPU and memory readings.
    ///
    /// All three inserts and the retention trim happen in one
    /// transaction: either the full row lands or nothing does. Returns
    /// the new monotonic `time_id`.
    pub fn append(
        &mut self,
        timestamp: i64,
        cpu_load: f64,
        mem_free: f64,
        mem_total: f64,
    ) -> StoreResult<i64> {
        let tx = self.conn.transaction()?;

        tx.execute("INSERT INTO time (timestamp) VALUES (?1)", params![timestamp])?;
        let time_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO cpus (time_id, load) VALUES (?1, ?2)",
            params![time_id, cpu_load],
        )?;
        tx.execute(
            "INSERT INTO memory (time_id, free, total) VALUES (?1, ?2, ?3)",
            params![time_id, mem_free, mem_total],
        )?;

        let trimmed = tx.execute(
            "DELETE FROM time WHERE timestamp < ?1",
            params![timestamp - self.horizon_ms],
        )?;

        tx.commit()?;

        if trimmed > 0 {
            debug!(trimmed, time_id, "trimmed aged samples on append");
        }

        Ok(time_id)
    }

    /// Return up to `count` most recent rows with `timestamp <= end_time`,
    /// ascending by timestamp.
    ///
    /// Fewer rows than requested is a normal partial result once
    /// retention has evicted the older part of the window.
    pub fn query_window(&self, end_time: i64, count: usize) -> StoreResult<Vec<MetricsRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.timestamp, c.load, m.free, m.total \
             FROM time t \
             JOIN cpus c ON c.time_id = t.time_id \
             JOIN memory m ON m.time_id = t.time_id \
             WHERE t.timestamp <= ?1 \
             ORDER BY t.timestamp DESC \
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![end_time, count as i64], |row| {
            Ok(MetricsRow {
                timestamp: row.get(0)?,
                cpu_load: row.get(1)?,
                mem_free: row.get(2)?,
                mem_total: row.get(3)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        result.reverse();
        Ok(result)
    }

    /// Number of samples currently retained
    pub fn sample_count(&self) -> StoreResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM time", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Timestamp of the most recent sample, if any
    pub fn latest_timestamp(&self) -> StoreResult<Option<i64>> {
        let latest: Option<i64> = self
            .conn
            .query_row("SELECT MAX(timestamp) FROM time", [], |row| row.get(0))?;
        Ok(latest)
    }

    #[cfg(test)]
    fn table_count(&self, table: &str) -> u64 {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0)).unwrap();
        count as u64
    }
}

impl std::fmt::Debug for MetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStore")
            .field("horizon_ms", &self.horizon_ms)
            .finish_non_exhaustive()
    }
}
