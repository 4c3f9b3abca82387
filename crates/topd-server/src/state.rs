use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use topd_core::config::Config;
use topd_storage::PersistenceBackend;

use crate::bot_detection::BotList;
use crate::history::{HistoryBuffer, HistoryQueue};
use crate::keeper::Keeper;
use crate::sessions::SessionDedup;
use crate::sites::SiteCounterTable;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
///
/// Owns the three pieces of mutable counting state (site table, session
/// dedup, history buffer) and hands `Arc`s of them to the keeper, so there
/// is no state outside this struct.
pub struct AppState {
    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    pub backend: Arc<dyn PersistenceBackend>,

    pub sites: Arc<SiteCounterTable>,

    pub sessions: Arc<SessionDedup>,

    /// Records materialized by the queue consumer, drained by the keeper.
    pub history: Arc<HistoryBuffer>,

    /// Fire-and-forget path from handlers into `history`.
    pub queue: HistoryQueue,

    pub bots: BotList,
}

impl AppState {
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: Config, bots: BotList) -> Self {
        let history = Arc::new(HistoryBuffer::new());
        let queue = HistoryQueue::new(config.history_queue_capacity, Arc::clone(&history));
        Self {
            sites: Arc::new(SiteCounterTable::new(Arc::clone(&backend))),
            sessions: Arc::new(SessionDedup::new()),
            history,
            queue,
            backend,
            config: Arc::new(config),
            bots,
        }
    }

    /// Load the site catalogue and start the history consumer.
    ///
    /// Must complete before the listener accepts requests: until then every
    /// site is unknown and every history write fails.
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let loaded = self.sites.reconcile().await?;
        info!(sites = loaded, "Site catalogue loaded");
        Ok(self.queue.start(cancel)?)
    }

    /// A keeper wired to this state's counters, sessions and history.
    pub fn keeper(&self) -> Keeper {
        Keeper::new(
            Arc::clone(&self.sites),
            Arc::clone(&self.sessions),
            Arc::clone(&self.history),
            Arc::clone(&self.backend),
            self.config.flush_interval(),
        )
    }
}
