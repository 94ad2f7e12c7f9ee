//! Application state shared across handlers and the aggregation consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tempstat_core::TimezoneLocator;
use tempstat_store::{StatWrite, Store};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, watch};

use crate::config::Config;
use crate::queue::ReadingPublisher;

/// Shared application state.
pub struct AppState {
    /// The data store. Every write path serializes on this lock.
    pub store: Mutex<Store>,
    pub config: Config,
    /// Producer half of the reading queue.
    pub publisher: Arc<dyn ReadingPublisher>,
    /// Resolves a device's timezone at enrollment.
    pub locator: Arc<dyn TimezoneLocator>,
    pub consumer: ConsumerState,
}

impl AppState {
    pub fn new(
        store: Store,
        config: Config,
        publisher: Arc<dyn ReadingPublisher>,
        locator: Arc<dyn TimezoneLocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            config,
            publisher,
            locator,
            consumer: ConsumerState::new(),
        })
    }
}

/// Run state and counters for the aggregation consumer.
pub struct ConsumerState {
    running: AtomicBool,
    /// Unix timestamp of the last start, 0 if never started.
    started_at: AtomicU64,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    received: AtomicU64,
    processed: AtomicU64,
    rebuilt: AtomicU64,
    dropped: AtomicU64,
    last_error: RwLock<Option<ConsumerError>>,
}

/// The most recent reading the consumer had to drop.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerError {
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Snapshot of [`ConsumerState`] for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub running: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub received: u64,
    pub processed: u64,
    /// Processed readings whose daily aggregate had to be rebuilt from the log.
    pub rebuilt: u64,
    pub dropped: u64,
    pub last_error: Option<ConsumerError>,
}

impl ConsumerState {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            running: AtomicBool::new(false),
            started_at: AtomicU64::new(0),
            stop_tx,
            stop_rx,
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            rebuilt: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if running {
            let now = OffsetDateTime::now_utc().unix_timestamp() as u64;
            self.started_at.store(now, Ordering::SeqCst);
        }
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        let ts = self.started_at.load(Ordering::SeqCst);
        if ts == 0 {
            None
        } else {
            OffsetDateTime::from_unix_timestamp(ts as i64).ok()
        }
    }

    /// Get a receiver for the stop signal.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    /// Signal the consumer to stop after the message in flight.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, write: StatWrite) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if write == StatWrite::Rebuilt {
            self.rebuilt.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn record_dropped(&self, reason: impl Into<String>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().await = Some(ConsumerError {
            message: reason.into(),
            at: OffsetDateTime::now_utc(),
        });
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            running: self.is_running(),
            started_at: self.started_at(),
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed(),
            rebuilt: self.rebuilt.load(Ordering::Relaxed),
            dropped: self.dropped(),
            last_error: self.last_error.read().await.clone(),
        }
    }
}

impl Default for ConsumerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_state_running() {
        let state = ConsumerState::new();
        assert!(!state.is_running());
        assert!(state.started_at().is_none());

        state.set_running(true);
        assert!(state.is_running());
        assert!(state.started_at().is_some());

        state.set_running(false);
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let state = ConsumerState::new();
        let mut rx = state.subscribe_stop();
        assert!(!*rx.borrow());

        state.signal_stop();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_counters() {
        let state = ConsumerState::new();
        state.record_received();
        state.record_received();
        state.record_received();
        state.record_processed(StatWrite::Inserted);
        state.record_processed(StatWrite::Rebuilt);
        state.record_dropped("bad payload").await;

        let status = state.status().await;
        assert_eq!(status.received, 3);
        assert_eq!(status.processed, 2);
        assert_eq!(status.rebuilt, 1);
        assert_eq!(status.dropped, 1);
        assert_eq!(status.last_error.unwrap().message, "bad payload");
    }

    #[tokio::test]
    async fn test_status_serialization() {
        let state = ConsumerState::new();
        let json = serde_json::to_value(state.status().await).unwrap();
        assert_eq!(json["running"], false);
        assert!(json["started_at"].is_null());
        assert!(json["last_error"].is_null());
    }
}
