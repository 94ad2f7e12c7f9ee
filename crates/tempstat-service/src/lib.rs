//! Temperature ingestion, daily statistics aggregation and HTTP REST API.
//!
//! This crate provides a service that:
//! - Enrolls devices and derives each device's timezone from its coordinates
//! - Accepts temperature readings and queues them for aggregation
//! - Runs a single consumer that folds readings into per-device daily
//!   high/low/average statistics, bucketed by the device-local day
//! - Exposes a REST API for querying devices, readings and statistics
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check (no auth required)
//! - `GET /api/status` - Consumer counters and store totals
//! - `POST /api/devices` - Enroll one device (object body) or several (array body)
//! - `GET /api/devices` - List enrolled devices
//! - `GET /api/devices/{id}` - Get one device
//! - `GET /api/devices/{id}/readings` - Logged readings, paginated
//! - `GET /api/devices/{id}/daily-stats?date=MM-DD-YYYY` - Statistics for one local day
//! - `GET /api/devices/{id}/daily-stats/history` - Most recent daily statistics
//! - `POST /api/readings` - Submit a reading
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/tempstat/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! path = "~/.local/share/tempstat/data.db"
//!
//! [queue]
//! backend = "mqtt"            # or "memory" (default)
//! broker = "mqtt://localhost:1883"
//! topic = "temperature-readings"
//!
//! publish_timeout_ms = 1000  # 503 when the queue stays full this long
//!
//! [aggregation]
//! max_retries = 3
//! drain_timeout_secs = 30    # shutdown waits this long for the queue to drain
//!
//! [security]
//! # Require X-API-Key header for all requests (except /api/health)
//! api_key_enabled = true
//! api_key = "your-secure-random-key-at-least-16-chars"
//! ```

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod aggregator;
pub mod api;
pub mod config;
pub mod enrollment;
pub mod middleware;
pub mod queue;
pub mod retry;
pub mod state;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use aggregator::{Aggregator, ProcessError, process_payload, shutdown};
pub use config::{
    AggregationConfig, Config, ConfigError, QueueBackend, QueueConfig, SecurityConfig,
    ServerConfig, StorageConfig,
};
pub use enrollment::{EnrollmentError, EnrollmentRequest, TzfLocator, enroll};
pub use queue::{MemoryQueue, QueueError, ReadingPublisher, ReadingSource};
pub use retry::RetryConfig;
pub use state::{AppState, ConsumerStatus};

/// Build the full application: API routes behind API key authentication,
/// request tracing and permissive CORS.
pub fn app(state: Arc<AppState>) -> Router {
    let security = Arc::new(state.config.security.clone());

    Router::new()
        .merge(api::router())
        .layer(axum::middleware::from_fn_with_state(
            security,
            middleware::api_key_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
