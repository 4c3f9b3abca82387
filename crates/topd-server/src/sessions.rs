use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use topd_core::site::SiteId;

type SessionsBySite = HashMap<SiteId, HashSet<String>>;

/// Per-site set of session tokens already counted as a unique host this period.
///
/// Lookups share the read lock; only the first sighting of a `(site, token)`
/// pair takes the write lock, and only for the insert.
#[derive(Default)]
pub struct SessionDedup {
    sessions: RwLock<SessionsBySite>,
}

impl SessionDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `(site_id, token)` was already registered, so the
    /// caller must not count a new host. Otherwise registers it and returns
    /// `false`.
    ///
    /// Exactly one of any number of concurrent first calls for the same pair
    /// observes `false`.
    pub fn check_and_register(&self, site_id: SiteId, token: &str) -> bool {
        if self
            .read()
            .get(&site_id)
            .is_some_and(|tokens| tokens.contains(token))
        {
            return true;
        }

        // Another caller may have inserted between the two locks; `insert`
        // reports which of us got there first.
        let inserted = self
            .write()
            .entry(site_id)
            .or_default()
            .insert(token.to_string());
        !inserted
    }

    /// Forget every registered session.
    ///
    /// The old table is swapped out under the lock and dropped after it is
    /// released.
    pub fn reset(&self) {
        let old = std::mem::take(&mut *self.write());
        drop(old);
    }

    /// Number of sessions registered for `site_id` this period.
    ///
    /// Test support: lets integration tests observe a period reset.
    #[doc(hidden)]
    pub fn sessions_for(&self, site_id: SiteId) -> usize {
        self.read().get(&site_id).map_or(0, HashSet::len)
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionsBySite> {
        self.sessions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionsBySite> {
        self.sessions.write().unwrap_or_else(|p| p.into_inner())
    }
}
