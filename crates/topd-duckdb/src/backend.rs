use std::sync::Arc;

use anyhow::Result;
use chrono_tz::Tz;
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::schema::init_sql;

/// A DuckDB backend for topd.
///
/// DuckDB is single-writer: concurrent reads are fine, but concurrent writes
/// cause contention. The connection sits behind `Arc<Mutex<_>>`; in practice
/// every write comes from the keeper task, so the lock is uncontended.
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
    /// Timezone the `top_data.day` column is computed in.
    pub(crate) timezone: Tz,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"` or `"512MB"`.
    /// Runs the schema init SQL so all tables exist before the first query.
    pub fn open(path: &str, memory_limit: &str, timezone: Tz) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(
            "DuckDB opened at {} with memory_limit={}, threads=2",
            path, memory_limit
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timezone,
        })
    }

    /// Open an **in-memory** DuckDB database in UTC.
    ///
    /// Intended for tests only. Data is discarded when the struct is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("1GB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timezone: chrono_tz::UTC,
        })
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    ///
    /// Called by the `/health` endpoint. Returns an error if the connection
    /// is unavailable (file locked, disk full, etc.).
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the DuckDB connection lock for direct queries.
    ///
    /// Intended for integration tests that need to verify stored data.
    /// Production code should use the typed methods.
    pub async fn conn_for_test(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
