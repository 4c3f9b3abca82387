use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use topd_storage::PersistenceBackend;

use crate::history::HistoryBuffer;
use crate::sessions::SessionDedup;
use crate::sites::SiteCounterTable;

/// Operator requests delivered to the keeper's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Flush, then start a new counting period (SIGHUP).
    Reload,
    /// Flush one last time and stop (SIGINT / SIGTERM).
    Terminate,
}

/// Why [`Keeper::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The service-wide cancellation token fired. No flush was attempted.
    Cancelled,
    /// A [`ControlEvent::Terminate`] arrived and the final flush ran.
    Terminated,
}

/// Background reconciler between the in-memory counting state and storage.
///
/// Every tick it flushes history and counters and pulls new sites; a reload
/// flushes and then resets the period; a terminate flushes and stops. Backend
/// failures are logged and retried on the next natural tick: nothing here
/// ends the process.
pub struct Keeper {
    sites: Arc<SiteCounterTable>,
    sessions: Arc<SessionDedup>,
    history: Arc<HistoryBuffer>,
    backend: Arc<dyn PersistenceBackend>,
    period: Duration,
}

impl Keeper {
    pub fn new(
        sites: Arc<SiteCounterTable>,
        sessions: Arc<SessionDedup>,
        history: Arc<HistoryBuffer>,
        backend: Arc<dyn PersistenceBackend>,
        period: Duration,
    ) -> Self {
        Self {
            sites,
            sessions,
            history,
            backend,
            period,
        }
    }

    /// Run until cancelled or terminated.
    ///
    /// `done` fires once, after the terminate flush. It is dropped unsent
    /// when the loop ends through cancellation.
    pub async fn run(
        self,
        cancel: CancellationToken,
        mut events: mpsc::Receiver<ControlEvent>,
        done: oneshot::Sender<()>,
    ) -> StopReason {
        let mut done = Some(done);
        let mut events_open = true;
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "Keeper started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Keeper cancelled");
                    return StopReason::Cancelled;
                }
                event = events.recv(), if events_open => match event {
                    Some(ControlEvent::Reload) => self.reload().await,
                    Some(ControlEvent::Terminate) => {
                        self.terminate().await;
                        if let Some(done) = done.take() {
                            if done.send(()).is_err() {
                                warn!("Shutdown listener went away before terminate completed");
                            }
                        }
                        return StopReason::Terminated;
                    }
                    None => {
                        warn!("Control channel closed, keeper continues on timer only");
                        events_open = false;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// Periodic work: flush, then pick up sites created since the last tick.
    pub async fn tick(&self) {
        self.flush().await;
        if let Err(e) = self.sites.reconcile().await {
            error!(
                since_id = self.sites.last_seen_id(),
                error = %e,
                "Site reconcile failed"
            );
        }
    }

    /// Flush, then start a new counting period.
    pub async fn reload(&self) {
        info!("Reload requested");
        self.flush().await;
        self.sites.reset_counters();
        self.history.clear().await;
        self.sessions.reset();
        info!("Counting period reset");
    }

    /// Final flush before shutdown.
    pub async fn terminate(&self) {
        info!("Terminate requested, flushing");
        self.flush().await;
    }

    /// Persist accumulated history and current counters. Failures are logged
    /// and the affected batch is not retried.
    pub async fn flush(&self) {
        let records = self.history.take().await;
        let count = records.len();
        match self.backend.save_data(&records).await {
            Ok(()) if count > 0 => info!(count, "History flushed"),
            Ok(()) => {}
            Err(e) => error!(count, error = %e, "History flush failed, records dropped"),
        }

        if let Err(e) = self.sites.keep_state().await {
            error!(error = %e, "Persisting site counters failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use topd_core::history::{HistoryRecord, RawVisitEvent};
    use topd_core::site::{Site, SiteId};

    use super::*;
    use crate::history::HistoryQueue;

    const PERIOD: Duration = Duration::from_secs(10);

    /// Captures every call; `populate` serves `catalogue` above the watermark.
    #[derive(Default)]
    struct RecordingBackend {
        catalogue: Mutex<Vec<Site>>,
        saves: Mutex<Vec<Vec<HistoryRecord>>>,
        updates: Mutex<Vec<Vec<Site>>>,
        fail_saves: bool,
    }

    impl RecordingBackend {
        fn with_sites(sites: Vec<Site>) -> Self {
            Self {
                catalogue: Mutex::new(sites),
                ..Self::default()
            }
        }

        fn saves(&self) -> Vec<Vec<HistoryRecord>> {
            self.saves.lock().unwrap().clone()
        }

        fn updates(&self) -> Vec<Vec<Site>> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistenceBackend for RecordingBackend {
        async fn populate(&self, since_id: SiteId) -> anyhow::Result<Vec<Site>> {
            Ok(self
                .catalogue
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.id > since_id)
                .cloned()
                .collect())
        }

        async fn update_sites(&self, sites: &[Site]) -> anyhow::Result<()> {
            self.updates.lock().unwrap().push(sites.to_vec());
            Ok(())
        }

        async fn save_data(&self, records: &[HistoryRecord]) -> anyhow::Result<()> {
            self.saves.lock().unwrap().push(records.to_vec());
            if self.fail_saves {
                return Err(anyhow!("storage unavailable"));
            }
            Ok(())
        }
    }

    struct Fixture {
        backend: Arc<RecordingBackend>,
        sites: Arc<SiteCounterTable>,
        sessions: Arc<SessionDedup>,
        history: Arc<HistoryBuffer>,
    }

    impl Fixture {
        async fn new(backend: RecordingBackend) -> Self {
            let backend = Arc::new(backend);
            let sites = Arc::new(SiteCounterTable::new(backend.clone()));
            sites.reconcile().await.unwrap();
            Self {
                backend,
                sites,
                sessions: Arc::new(SessionDedup::new()),
                history: Arc::new(HistoryBuffer::new()),
            }
        }

        fn keeper(&self) -> Keeper {
            Keeper::new(
                Arc::clone(&self.sites),
                Arc::clone(&self.sessions),
                Arc::clone(&self.history),
                self.backend.clone(),
                PERIOD,
            )
        }
    }

    fn visit(site_id: SiteId, session: &str) -> RawVisitEvent {
        RawVisitEvent {
            page: "/".to_string(),
            referrer: String::new(),
            geo_tag: "RU1234".to_string(),
            session_token: session.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            source_ip: None,
            site_id,
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn tick_flushes_queued_history_once() {
        let fx = Fixture::new(RecordingBackend::with_sites(vec![Site::new(1, 1, true)])).await;
        let queue = HistoryQueue::new(8, Arc::clone(&fx.history));
        let cancel = CancellationToken::new();
        queue.start(cancel.clone()).unwrap();

        for session in ["a", "b", "c"] {
            queue.write(visit(1, session)).await.unwrap();
        }
        while fx.history.len().await < 3 {
            tokio::task::yield_now().await;
        }

        let keeper = fx.keeper();
        keeper.tick().await;
        let saves = fx.backend.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].len(), 3);

        keeper.tick().await;
        let saves = fx.backend.saves();
        assert_eq!(saves.len(), 2);
        assert!(saves[1].is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn tick_reconciles_new_sites() {
        let fx = Fixture::new(RecordingBackend::with_sites(vec![Site::new(1, 1, true)])).await;
        fx.backend
            .catalogue
            .lock()
            .unwrap()
            .push(Site::new(2, 1, false));

        fx.keeper().tick().await;

        assert_eq!(fx.sites.last_seen_id(), 2);
        assert!(fx.sites.get(2).is_some());
    }

    #[tokio::test]
    async fn reload_flushes_then_resets_period() {
        let fx = Fixture::new(RecordingBackend::with_sites(vec![Site::new(1, 1, true)])).await;
        assert!(!fx.sessions.check_and_register(1, "s1"));
        assert!(!fx.sessions.check_and_register(1, "s2"));
        for i in 0..10 {
            fx.sites.increment(1, i < 4, true);
        }
        fx.history.push(HistoryRecord::from(visit(1, "s1"))).await;

        fx.keeper().reload().await;

        let saves = fx.backend.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].len(), 1);
        let updates = fx.backend.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 1);
        assert_eq!((updates[0][0].hits, updates[0][0].unique_hosts), (10, 4));

        let site = fx.sites.get(1).unwrap();
        assert_eq!((site.hits, site.unique_hosts), (0, 0));
        assert!(fx.history.is_empty().await);
        assert!(!fx.sessions.check_and_register(1, "s1"));
        assert!(!fx.sessions.check_and_register(1, "s2"));
    }

    #[tokio::test]
    async fn failed_save_does_not_stop_counter_flush() {
        let backend = RecordingBackend {
            fail_saves: true,
            ..RecordingBackend::with_sites(vec![Site::new(1, 1, true)])
        };
        let fx = Fixture::new(backend).await;
        fx.sites.increment(1, true, true);
        fx.history.push(HistoryRecord::from(visit(1, "s"))).await;

        fx.keeper().tick().await;

        assert_eq!(fx.backend.saves().len(), 1);
        assert_eq!(fx.backend.updates().len(), 1);
        // Best effort: the failed batch is not retried.
        assert!(fx.history.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_timer() {
        let fx = Fixture::new(RecordingBackend::with_sites(vec![Site::new(1, 1, true)])).await;
        let (_events_tx, events_rx) = mpsc::channel(4);
        let (done_tx, _done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(fx.keeper().run(cancel.clone(), events_rx, done_tx));

        fx.history.push(HistoryRecord::from(visit(1, "a"))).await;
        settle().await;
        assert!(fx.backend.saves().is_empty());

        tokio::time::advance(PERIOD).await;
        settle().await;
        assert_eq!(fx.backend.saves().len(), 1);
        assert_eq!(fx.backend.saves()[0].len(), 1);

        cancel.cancel();
        assert_eq!(run.await.unwrap(), StopReason::Cancelled);
        assert_eq!(fx.backend.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_flushes_signals_once_and_stops() {
        let fx = Fixture::new(RecordingBackend::with_sites(vec![Site::new(1, 1, true)])).await;
        fx.sites.increment(1, true, true);
        let (events_tx, events_rx) = mpsc::channel(4);
        let (done_tx, done_rx) = oneshot::channel();
        let run = tokio::spawn(fx.keeper().run(CancellationToken::new(), events_rx, done_tx));

        events_tx.send(ControlEvent::Terminate).await.unwrap();
        // Queued behind terminate; must never be handled.
        let _ = events_tx.send(ControlEvent::Reload).await;

        done_rx.await.unwrap();
        assert_eq!(run.await.unwrap(), StopReason::Terminated);
        assert_eq!(fx.backend.saves().len(), 1);
        assert_eq!(fx.backend.updates().len(), 1);

        tokio::time::advance(PERIOD * 3).await;
        settle().await;
        assert_eq!(fx.backend.saves().len(), 1);
        assert_eq!(fx.sites.get(1).unwrap().hits, 1);
        assert!(events_tx.send(ControlEvent::Reload).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_keeps_loop_running() {
        let fx = Fixture::new(RecordingBackend::with_sites(vec![Site::new(1, 1, true)])).await;
        fx.sites.increment(1, true, true);
        let (events_tx, events_rx) = mpsc::channel(4);
        let (done_tx, _done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(fx.keeper().run(cancel.clone(), events_rx, done_tx));

        events_tx.send(ControlEvent::Reload).await.unwrap();
        settle().await;
        assert_eq!(fx.sites.get(1).unwrap().hits, 0);
        assert!(!run.is_finished());

        tokio::time::advance(PERIOD).await;
        settle().await;
        assert_eq!(fx.backend.saves().len(), 2);

        cancel.cancel();
        assert_eq!(run.await.unwrap(), StopReason::Cancelled);
    }
}
