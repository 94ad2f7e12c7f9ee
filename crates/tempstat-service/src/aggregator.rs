//! Aggregation consumer.
//!
//! Pulls readings off the queue one at a time, resolves each to its
//! device-local day bucket and folds it into the daily statistics. A reading
//! that cannot be processed is logged, counted and dropped; the loop keeps
//! going.
//!
//! On shutdown the publisher is closed first and the consumer drains whatever
//! is still queued, so every reading acknowledged with 202 is recorded. The
//! stop signal is only a fallback; even then the source is closed and its
//! buffered readings are drained before the task ends.

use std::sync::Arc;
use std::time::Duration;

use tempstat_core::{DayBucket, ReadingMessage, validate_temperature};
use tempstat_store::RecordedReading;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueBackend;
use crate::queue::ReadingSource;
use crate::retry::{RetryConfig, with_retry};
use crate::state::AppState;

/// Why a queued reading was dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Malformed reading payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid reading: {0}")]
    Invalid(tempstat_core::Error),

    #[error("Device not found: {0} - reading must come from an enrolled device!")]
    UnknownDevice(String),

    #[error("Cannot resolve day bucket: {0}")]
    Resolve(tempstat_core::Error),

    #[error("Failed to record reading: {0}")]
    Store(#[from] tempstat_store::Error),
}

impl ProcessError {
    /// Whether the message itself is bad, as opposed to the service failing on it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProcessError::Decode(_) | ProcessError::Invalid(_) | ProcessError::UnknownDevice(_)
        )
    }
}

/// Single consumer of the reading queue.
pub struct Aggregator {
    state: Arc<AppState>,
    source: Box<dyn ReadingSource>,
    retry: RetryConfig,
}

impl Aggregator {
    pub fn new(state: Arc<AppState>, source: Box<dyn ReadingSource>) -> Self {
        let retry = state.config.aggregation.retry_config();
        Self {
            state,
            source,
            retry,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run the consumer on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume until the queue closes or the stop signal is raised.
    pub async fn run(self) {
        let Aggregator {
            state,
            mut source,
            retry,
        } = self;
        let mut stop_rx = state.consumer.subscribe_stop();

        state.consumer.set_running(true);
        info!("Aggregation consumer started");

        while !*stop_rx.borrow() {
            tokio::select! {
                payload = source.recv() => match payload {
                    Some(payload) => handle_payload(&state, &payload, &retry).await,
                    None => {
                        info!("Reading queue closed, stopping aggregation consumer");
                        break;
                    }
                },
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        source.close().await;
        let mut drained = 0u64;
        while let Some(payload) = source.recv().await {
            handle_payload(&state, &payload, &retry).await;
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "Drained buffered readings before stopping");
        }

        state.consumer.set_running(false);
        info!("Aggregation consumer stopped");
    }
}

/// Stop the consumer without losing queued readings.
///
/// Closes the publisher so no new readings are accepted, then waits up to
/// `grace` for the consumer to drain the queue. If it has not finished by
/// then, the stop signal is raised and the consumer stops once the readings
/// already delivered to it are recorded.
pub async fn shutdown(state: &AppState, mut handle: JoinHandle<()>, grace: Duration) {
    if let Err(e) = state.publisher.close().await {
        warn!("Failed to close reading queue: {}", e);
    }

    // A broker subscription never ends on its own.
    if state.config.queue.backend == QueueBackend::Mqtt {
        state.consumer.signal_stop();
    }

    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => {
            warn!("Aggregation consumer task failed: {}", e);
            return;
        }
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "Aggregation consumer did not drain in time, signalling stop"
            );
            state.consumer.signal_stop();
        }
    }

    if let Err(e) = handle.await {
        warn!("Aggregation consumer task failed: {}", e);
    }
}

async fn handle_payload(state: &AppState, payload: &[u8], retry: &RetryConfig) {
    state.consumer.record_received();

    match process_payload(state, payload, retry).await {
        Ok(recorded) => {
            state.consumer.record_processed(recorded.write);
            debug!(
                device_id = %recorded.reading.device_id,
                temperature = recorded.reading.temperature,
                count = recorded.stat.reading_count,
                "Processed temperature reading"
            );
        }
        Err(e) => {
            if e.is_rejection() {
                warn!("Dropping reading: {}", e);
            } else {
                error!("Dropping reading: {}", e);
            }
            state.consumer.record_dropped(e.to_string()).await;
        }
    }
}

/// Decode, validate and record one queued reading.
pub async fn process_payload(
    state: &AppState,
    payload: &[u8],
    retry: &RetryConfig,
) -> Result<RecordedReading, ProcessError> {
    let message = ReadingMessage::from_json(payload)?;
    validate_temperature(message.temperature).map_err(ProcessError::Invalid)?;

    let device = state
        .store
        .lock()
        .await
        .get_device(&message.device_id)?
        .ok_or_else(|| ProcessError::UnknownDevice(message.device_id.clone()))?;

    let tz = device.timezone().map_err(ProcessError::Resolve)?;
    let bucket = DayBucket::for_instant(message.timestamp, &tz).map_err(ProcessError::Resolve)?;

    let store = &state.store;
    let device_id = message.device_id.as_str();
    let (temperature, at) = (message.temperature, message.timestamp);
    let bucket = &bucket;
    let recorded = with_retry(retry, "record_reading", || async move {
        store
            .lock()
            .await
            .record_reading(device_id, temperature, at, bucket)
    })
    .await?;

    Ok(recorded)
}
