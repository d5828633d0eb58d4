//! Downstream storage for forwarded glucose values.
//!
//! [`GlucoseStore`] is the single call the forwarder makes per accepted
//! reading. [`SqliteStore`] is the production implementation.
//!
//! # Schema
//! - `glucose_values`: one row per reading, unique on `timestamp_ms`.
//!   Re-inserting an existing timestamp is a no-op.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=NORMAL.
//! PRAGMA integrity_check runs at open; returns error if it fails.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bg_protocol::{GlucoseValue, TrendArrow};
use rusqlite::{Connection, OptionalExtension, params};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("store worker failed: {0}")]
    Worker(String),
    #[error("insert rejected: {0}")]
    Rejected(String),
}

/// Where accepted readings end up.
pub trait GlucoseStore: Send + Sync + 'static {
    fn insert(&self, value: GlucoseValue) -> impl Future<Output = Result<(), StoreError>> + Send;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS glucose_values (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ms  INTEGER NOT NULL UNIQUE,
    value_mgdl    REAL    NOT NULL,
    raw           REAL,
    noise         REAL,
    trend_arrow   TEXT    NOT NULL,
    source_sensor TEXT    NOT NULL,
    is_valid      INTEGER NOT NULL,
    inserted_at   TEXT    NOT NULL
);
";

/// SQLite-backed glucose store. Clones share one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        run_integrity_check(&conn)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Worker("connection mutex poisoned".to_owned()))
    }

    /// Insert one value. Returns false when the timestamp already existed.
    pub fn insert_blocking(&self, value: &GlucoseValue) -> Result<bool, StoreError> {
        if !value.value.is_finite() {
            return Err(StoreError::Rejected(format!(
                "non-finite value at {}",
                value.timestamp
            )));
        }
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO glucose_values
                (timestamp_ms, value_mgdl, raw, noise, trend_arrow, source_sensor, is_valid, inserted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                value.timestamp,
                value.value,
                value.raw,
                value.noise,
                value.trend_arrow.as_str(),
                value.source_sensor,
                value.is_valid,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM glucose_values", [], |row| {
            row.get(0)
        })?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// The value with the highest timestamp.
    pub fn latest(&self) -> Result<Option<GlucoseValue>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT timestamp_ms, value_mgdl, raw, noise, trend_arrow, source_sensor, is_valid
                 FROM glucose_values ORDER BY timestamp_ms DESC LIMIT 1",
                [],
                map_value,
            )
            .optional()?;
        Ok(row)
    }
}

impl GlucoseStore for SqliteStore {
    fn insert(&self, value: GlucoseValue) -> impl Future<Output = Result<(), StoreError>> + Send {
        let store = self.clone();
        async move {
            let inserted = tokio::task::spawn_blocking(move || store.insert_blocking(&value))
                .await
                .map_err(|e| StoreError::Worker(e.to_string()))??;
            if !inserted {
                tracing::debug!("glucose value already stored, ignored");
            }
            Ok(())
        }
    }
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn parse_arrow(text: &str) -> TrendArrow {
    match text {
        "DOUBLE_UP" => TrendArrow::DoubleUp,
        "SINGLE_UP" => TrendArrow::SingleUp,
        "FORTY_FIVE_UP" => TrendArrow::FortyFiveUp,
        "FLAT" => TrendArrow::Flat,
        "FORTY_FIVE_DOWN" => TrendArrow::FortyFiveDown,
        "SINGLE_DOWN" => TrendArrow::SingleDown,
        "DOUBLE_DOWN" => TrendArrow::DoubleDown,
        _ => TrendArrow::Unknown,
    }
}

fn map_value(row: &rusqlite::Row<'_>) -> Result<GlucoseValue, rusqlite::Error> {
    let arrow: String = row.get(4)?;
    Ok(GlucoseValue {
        timestamp: row.get(0)?,
        value: row.get(1)?,
        raw: row.get(2)?,
        noise: row.get(3)?,
        trend_arrow: parse_arrow(&arrow),
        source_sensor: row.get(5)?,
        is_valid: row.get(6)?,
    })
}
