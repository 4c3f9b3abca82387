use async_trait::async_trait;

use topd_core::history::HistoryRecord;
use topd_core::site::{Site, SiteId};
use topd_storage::PersistenceBackend;

use crate::DuckDbBackend;

#[async_trait]
impl PersistenceBackend for DuckDbBackend {
    async fn populate(&self, since_id: SiteId) -> anyhow::Result<Vec<Site>> {
        DuckDbBackend::populate(self, since_id).await
    }

    async fn update_sites(&self, sites: &[Site]) -> anyhow::Result<()> {
        DuckDbBackend::update_sites(self, sites).await
    }

    async fn save_data(&self, records: &[HistoryRecord]) -> anyhow::Result<()> {
        DuckDbBackend::save_data(self, records).await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        DuckDbBackend::ping(self).await
    }
}
