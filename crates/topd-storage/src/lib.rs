use async_trait::async_trait;

use topd_core::history::HistoryRecord;
use topd_core::site::{Site, SiteId};

pub mod memory;

pub use memory::MemoryBackend;

/// Durable store behind the counting cache.
///
/// The server only ever talks to this trait, so DuckDB and the in-memory
/// catalogue are interchangeable at startup. Implementations are called from
/// the keeper task only; request handlers never wait on them.
#[async_trait]
pub trait PersistenceBackend: Send + Sync + 'static {
    /// Sites with `id > since_id`, ascending by id.
    ///
    /// Must not return the same id twice across calls with a non-decreasing
    /// `since_id`: the site table overwrites whatever it already holds.
    async fn populate(&self, since_id: SiteId) -> anyhow::Result<Vec<Site>>;

    /// Upsert the counters of `sites`. All-or-nothing per call.
    async fn update_sites(&self, sites: &[Site]) -> anyhow::Result<()>;

    /// Append `records`. All-or-nothing per call; an empty slice is a no-op.
    async fn save_data(&self, records: &[HistoryRecord]) -> anyhow::Result<()>;

    /// Lightweight liveness probe used by `/health`.
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
