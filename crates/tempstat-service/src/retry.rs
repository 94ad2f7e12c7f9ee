//! Retry with exponential backoff for transient storage failures.
//!
//! SQLite reports `SQLITE_BUSY`/`SQLITE_LOCKED` when another connection holds
//! the write lock. Those errors clear on their own, so the aggregation
//! consumer retries them before giving up on a reading.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that may succeed if the operation is simply tried again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for tempstat_store::Error {
    fn is_transient(&self) -> bool {
        tempstat_store::Error::is_transient(self)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 means no retries).
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 doubles the delay each attempt).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            capped_delay * (1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Run `operation`, retrying transient failures according to `config`.
///
/// Non-transient errors are returned immediately. After the last attempt the
/// final error is returned.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
