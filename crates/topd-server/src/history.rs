use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use topd_core::history::{HistoryRecord, RawVisitEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("history queue not started")]
    QueueNotStarted,

    #[error("history queue already started")]
    AlreadyStarted,

    #[error("history queue full")]
    QueueFull,

    #[error("history queue closed")]
    QueueClosed,
}

/// Append-only accumulation of history records between two flushes.
///
/// Lock, take, release: [`HistoryBuffer::take`] swaps the whole `Vec` for a
/// fresh one under the lock, so a record pushed concurrently lands either in
/// the taken batch or in the new buffer, never in both and never nowhere.
#[derive(Default)]
pub struct HistoryBuffer {
    records: tokio::sync::Mutex<Vec<HistoryRecord>>,
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, record: HistoryRecord) {
        self.records.lock().await.push(record);
    }

    /// Hand the accumulated records to the caller and start a new buffer.
    pub async fn take(&self) -> Vec<HistoryRecord> {
        let mut records = self.records.lock().await;
        std::mem::take(&mut *records)
    }

    /// Drop everything accumulated so far.
    pub async fn clear(&self) {
        let dropped = self.take().await;
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "History buffer cleared");
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Bounded queue between request handlers and the history buffer.
///
/// Handlers enqueue raw visits; a single consumer task turns each into a
/// [`HistoryRecord`] and appends it to the shared [`HistoryBuffer`]. Storage
/// latency never reaches the handler: the worst it sees is a full channel.
pub struct HistoryQueue {
    tx: mpsc::Sender<RawVisitEvent>,
    rx: Mutex<Option<mpsc::Receiver<RawVisitEvent>>>,
    started: AtomicBool,
    buffer: Arc<HistoryBuffer>,
}

impl HistoryQueue {
    /// `capacity` must be greater than zero.
    pub fn new(capacity: usize, buffer: Arc<HistoryBuffer>) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
            buffer,
        }
    }

    /// Spawn the consumer task. It runs until `cancel` fires, then processes
    /// whatever is already queued and exits.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, HistoryError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(HistoryError::AlreadyStarted)?;

        let buffer = Arc::clone(&self.buffer);
        let handle = tokio::spawn(consume(rx, buffer, cancel));
        self.started.store(true, Ordering::Release);
        info!(capacity = self.tx.max_capacity(), "History queue started");
        Ok(handle)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Enqueue a visit, waiting for room if the channel is momentarily full.
    pub async fn write(&self, event: RawVisitEvent) -> Result<(), HistoryError> {
        if !self.is_started() {
            return Err(HistoryError::QueueNotStarted);
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| HistoryError::QueueClosed)
    }

    /// Enqueue a visit without waiting; a full channel is reported as
    /// [`HistoryError::QueueFull`] so the caller can drop or degrade.
    pub fn try_write(&self, event: RawVisitEvent) -> Result<(), HistoryError> {
        if !self.is_started() {
            return Err(HistoryError::QueueNotStarted);
        }
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => HistoryError::QueueFull,
            TrySendError::Closed(_) => HistoryError::QueueClosed,
        })
    }
}

async fn consume(
    mut rx: mpsc::Receiver<RawVisitEvent>,
    buffer: Arc<HistoryBuffer>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => buffer.push(HistoryRecord::from(event)).await,
                None => return,
            },
        }
    }

    // Refuse new events, then finish the ones already in flight.
    rx.close();
    let mut drained = 0usize;
    while let Some(event) = rx.recv().await {
        buffer.push(HistoryRecord::from(event)).await;
        drained += 1;
    }
    info!(drained, "History queue stopped");
}
