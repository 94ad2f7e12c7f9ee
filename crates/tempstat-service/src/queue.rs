//! Reading queue between the ingestion endpoint and the aggregation consumer.
//!
//! Messages travel as [`ReadingMessage`] JSON. The ingestion side only sees a
//! [`ReadingPublisher`]; the consumer only sees a [`ReadingSource`]. The
//! in-process [`MemoryQueue`] is the default backend, and the `mqtt` feature
//! adds a broker-backed one with at-least-once delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempstat_core::ReadingMessage;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::config::{QueueBackend, QueueConfig};

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue is full")]
    Full,
    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid broker URL: {0}")]
    InvalidBroker(String),
    #[error("queue backend '{0}' is not available in this build")]
    BackendUnavailable(&'static str),
    #[cfg(feature = "mqtt")]
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

/// Producer half of the reading queue.
#[async_trait]
pub trait ReadingPublisher: Send + Sync {
    /// Enqueue one reading.
    async fn publish(&self, message: &ReadingMessage) -> Result<(), QueueError>;

    /// Stop accepting readings and release the transport.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Consumer half of the reading queue.
#[async_trait]
pub trait ReadingSource: Send {
    /// Next raw payload, or `None` once the queue is closed and drained.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// Release the transport. Called once when the consumer stops.
    async fn close(&mut self) {}
}

/// How long a publish may wait for room in a full queue by default.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded in-process queue on a tokio channel.
pub struct MemoryQueue;

impl MemoryQueue {
    /// Create a queue holding at most `capacity` undelivered readings.
    pub fn bounded(capacity: usize) -> (MemoryPublisher, MemorySource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            MemoryPublisher {
                tx: RwLock::new(Some(tx)),
                publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            },
            MemorySource { rx },
        )
    }
}

/// Publisher for [`MemoryQueue`].
///
/// Publishing waits up to the publish timeout for room, then fails with
/// [`QueueError::Full`].
pub struct MemoryPublisher {
    tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    publish_timeout: Duration,
}

impl MemoryPublisher {
    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

#[async_trait]
impl ReadingPublisher for MemoryPublisher {
    async fn publish(&self, message: &ReadingMessage) -> Result<(), QueueError> {
        let payload = message.to_json()?;
        let tx = self.tx.read().await.clone().ok_or(QueueError::Closed)?;
        tx.send_timeout(payload, self.publish_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => QueueError::Full,
                SendTimeoutError::Closed(_) => QueueError::Closed,
            })?;
        debug!(device_id = %message.device_id, "Queued reading");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.tx.write().await.take().is_some() {
            info!("Memory queue closed");
        }
        Ok(())
    }
}

/// Source for [`MemoryQueue`].
pub struct MemorySource {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl ReadingSource for MemorySource {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Refuse further readings. Those already buffered can still be received.
    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Both halves of a connected queue.
pub type QueueHandles = (Arc<dyn ReadingPublisher>, Box<dyn ReadingSource>);

/// Connect the backend selected in the configuration.
pub async fn connect(config: &QueueConfig) -> Result<QueueHandles, QueueError> {
    match config.backend {
        QueueBackend::Memory => {
            let (publisher, source) = MemoryQueue::bounded(config.capacity);
            let publisher = publisher.with_publish_timeout(config.publish_timeout());
            info!("Using in-process reading queue (capacity {})", config.capacity);
            Ok((Arc::new(publisher), Box::new(source)))
        }
        #[cfg(feature = "mqtt")]
        QueueBackend::Mqtt => {
            let source = crate::mqtt::MqttSource::connect(config).await?;
            let publisher = crate::mqtt::MqttPublisher::connect(config)?;
            Ok((Arc::new(publisher), Box::new(source)))
        }
        #[cfg(not(feature = "mqtt"))]
        QueueBackend::Mqtt => Err(QueueError::BackendUnavailable("mqtt")),
    }
}
