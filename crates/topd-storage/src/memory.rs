use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use topd_core::history::HistoryRecord;
use topd_core::site::{Site, SiteId};

use crate::PersistenceBackend;

#[derive(Default)]
struct Inner {
    sites: BTreeMap<SiteId, Site>,
    history: Vec<HistoryRecord>,
}

/// In-process [`PersistenceBackend`] for development and tests.
///
/// Keeps a site catalogue and an append-only history log in memory. Nothing
/// survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    /// Empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue with two sites (ids 1 and 2, digits shown), matching the
    /// fixtures a fresh DuckDB database is seeded with.
    pub fn seeded() -> Self {
        Self::with_sites([Site::new(1, 1, true), Site::new(2, 2, true)])
    }

    pub fn with_sites(sites: impl IntoIterator<Item = Site>) -> Self {
        let backend = Self::new();
        backend
            .lock()
            .sites
            .extend(sites.into_iter().map(|s| (s.id, s)));
        backend
    }

    /// Register a site created after startup; the next populate picks it up.
    pub fn add_site(&self, site: Site) {
        self.lock().sites.insert(site.id, site);
    }

    pub fn site(&self, id: SiteId) -> Option<Site> {
        self.lock().sites.get(&id).cloned()
    }

    /// Everything saved so far, in save order.
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn populate(&self, since_id: SiteId) -> anyhow::Result<Vec<Site>> {
        let inner = self.lock();
        Ok(inner
            .sites
            .range(since_id.saturating_add(1)..)
            .filter(|(id, _)| **id > since_id)
            .map(|(_, site)| site.clone())
            .collect())
    }

    async fn update_sites(&self, sites: &[Site]) -> anyhow::Result<()> {
        let mut inner = self.lock();
        for site in sites {
            inner
                .sites
                .entry(site.id)
                .and_modify(|stored| {
                    stored.hits = site.hits;
                    stored.unique_hosts = site.unique_hosts;
                })
                .or_insert_with(|| site.clone());
        }
        Ok(())
    }

    async fn save_data(&self, records: &[HistoryRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            debug!(
                site_id = record.site_id,
                session = %record.session_token,
                page = %record.page,
                country = %record.country_code,
                city = record.city_id,
                "history record"
            );
        }
        self.lock().history.extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use topd_core::history::RawVisitEvent;

    use super::*;

    fn record(site_id: SiteId) -> HistoryRecord {
        HistoryRecord::from_event(
            RawVisitEvent {
                page: "/".to_string(),
                referrer: String::new(),
                geo_tag: "0".to_string(),
                session_token: "s".to_string(),
                user_agent: "ua".to_string(),
                source_ip: None,
                site_id,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn populate_returns_only_sites_above_watermark() {
        let backend = MemoryBackend::seeded();
        let first = backend.populate(0).await.unwrap();
        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(backend.populate(2).await.unwrap().is_empty());

        backend.add_site(Site::new(3, 1, false));
        let next = backend.populate(2).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, 3);
    }

    #[tokio::test]
    async fn populate_at_max_id_is_empty() {
        let backend = MemoryBackend::with_sites([Site::new(SiteId::MAX, 1, true)]);
        assert!(backend.populate(SiteId::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_sites_overwrites_counters_only() {
        let backend = MemoryBackend::seeded();
        let mut site = Site::new(1, 9, false);
        site.hits = 10;
        site.unique_hosts = 4;
        backend.update_sites(&[site]).await.unwrap();

        let stored = backend.site(1).unwrap();
        assert_eq!((stored.hits, stored.unique_hosts), (10, 4));
        assert_eq!(stored.counter_image_id, 1);
        assert!(stored.show_digits);
    }

    #[tokio::test]
    async fn save_data_appends_in_order() {
        let backend = MemoryBackend::new();
        backend.save_data(&[record(1), record(2)]).await.unwrap();
        backend.save_data(&[]).await.unwrap();
        backend.save_data(&[record(3)]).await.unwrap();
        let ids: Vec<_> = backend.history().iter().map(|r| r.site_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
