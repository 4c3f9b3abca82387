use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use tracing::{debug, info};

use topd_core::site::{Site, SiteId};
use topd_storage::PersistenceBackend;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    hits: u64,
    unique_hosts: u64,
}

/// One site's metadata plus its own counter lock.
struct SiteEntry {
    id: SiteId,
    counter_image_id: u32,
    show_digits: bool,
    counters: Mutex<Counters>,
}

impl SiteEntry {
    fn from_site(site: Site) -> Self {
        Self {
            id: site.id,
            counter_image_id: site.counter_image_id,
            show_digits: site.show_digits,
            counters: Mutex::new(Counters {
                hits: site.hits,
                unique_hosts: site.unique_hosts,
            }),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot(&self) -> Site {
        let counters = *self.counters();
        Site {
            id: self.id,
            counter_image_id: self.counter_image_id,
            hits: counters.hits,
            unique_hosts: counters.unique_hosts,
            show_digits: self.show_digits,
        }
    }
}

#[derive(Default)]
struct Table {
    sites: HashMap<SiteId, Arc<SiteEntry>>,
    /// Highest site id already loaded from the backend.
    last_seen_id: SiteId,
}

/// In-memory site counters, filled incrementally from a [`PersistenceBackend`].
///
/// The table lock guards structure (which sites exist, the watermark). Each
/// site's counters have their own lock, so increments on different sites
/// never contend and the table lock is only held long enough to clone an
/// `Arc`.
pub struct SiteCounterTable {
    table: RwLock<Table>,
    backend: Arc<dyn PersistenceBackend>,
}

impl SiteCounterTable {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            backend,
        }
    }

    pub fn get(&self, site_id: SiteId) -> Option<Site> {
        self.entry(site_id).map(|entry| entry.snapshot())
    }

    /// Bump the counters of `site_id` and return the updated snapshot.
    ///
    /// Returns `None` for unknown sites; nothing is counted.
    pub fn increment(&self, site_id: SiteId, count_host: bool, count_hit: bool) -> Option<Site> {
        let entry = self.entry(site_id)?;
        {
            let mut counters = entry.counters();
            if count_host {
                counters.unique_hosts += 1;
            }
            if count_hit {
                counters.hits += 1;
            }
        }
        Some(entry.snapshot())
    }

    /// Zero every site's counters in place. Sites and the watermark stay.
    pub fn reset_counters(&self) {
        let table = self.read();
        for entry in table.sites.values() {
            *entry.counters() = Counters::default();
        }
        info!(sites = table.sites.len(), "Site counters reset");
    }

    /// Pull sites created since the last call and merge them in.
    ///
    /// Each returned site is inserted, or overwrites the in-memory entry with
    /// the same id. The backend must return every id at most once (see
    /// [`PersistenceBackend::populate`]), otherwise live counts of a
    /// re-returned site are replaced by the stored ones.
    ///
    /// Returns the number of sites merged.
    pub async fn reconcile(&self) -> Result<usize> {
        let since_id = self.last_seen_id();
        let sites = self.backend.populate(since_id).await?;
        if sites.is_empty() {
            return Ok(0);
        }

        let merged = sites.len();
        let mut table = self.write();
        for site in sites {
            if site.id > table.last_seen_id {
                table.last_seen_id = site.id;
            }
            table
                .sites
                .insert(site.id, Arc::new(SiteEntry::from_site(site)));
        }
        info!(
            merged,
            last_seen_id = table.last_seen_id,
            "Reconciled sites from storage"
        );
        Ok(merged)
    }

    /// Persist the counters of every site with at least one host.
    ///
    /// The snapshot is taken under the locks and released before the
    /// backend call, so handlers keep counting while it runs.
    pub async fn keep_state(&self) -> Result<()> {
        let snapshot = self.touched_sites();
        debug!(sites = snapshot.len(), "Persisting site counters");
        self.backend.update_sites(&snapshot).await
    }

    /// Point-in-time copy of all sites with `unique_hosts > 0`.
    pub fn touched_sites(&self) -> Vec<Site> {
        let entries: Vec<Arc<SiteEntry>> = self.read().sites.values().cloned().collect();
        let mut sites: Vec<Site> = entries
            .iter()
            .map(|entry| entry.snapshot())
            .filter(Site::is_touched)
            .collect();
        sites.sort_by_key(|s| s.id);
        sites
    }

    pub fn last_seen_id(&self) -> SiteId {
        self.read().last_seen_id
    }

    pub fn len(&self) -> usize {
        self.read().sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, site_id: SiteId) -> Option<Arc<SiteEntry>> {
        self.read().sites.get(&site_id).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(|p| p.into_inner())
    }
}
