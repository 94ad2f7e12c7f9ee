//! REST API endpoints.
//!
//! # Lock Acquisition
//!
//! Handlers hold `state.store` only for the database calls themselves. The
//! ingestion handler releases it before publishing to the queue, so a slow
//! broker never blocks the aggregation consumer.
//!
//! # Error Handling
//!
//! All endpoints return `{"error": message}` bodies via [`AppError`]. Store
//! errors map to HTTP 500. A reading queue that stays full maps to HTTP 503.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tempstat_core::{
    DayBucket, MIN_TEMPERATURE, ReadingMessage, format_iso_date, local_date, parse_query_date,
    validate_temperature,
};
use tempstat_store::{ReadingQuery, StoredDailyStat, StoredDevice, StoredReading};
use time::OffsetDateTime;
use tracing::error;
use uuid::Uuid;

use crate::config::QueueBackend;
use crate::enrollment::{EnrollmentBody, EnrollmentError, enroll};
use crate::queue::QueueError;
use crate::state::{AppState, ConsumerStatus};

const UNENROLLED_DEVICE: &str = "Invalid input - reading must come from an enrolled device!";
const DEFAULT_HISTORY_LIMIT: u32 = 30;
const MAX_HISTORY_LIMIT: u32 = 1000;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        // Devices
        .route("/api/devices", get(list_devices).post(enroll_devices))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/devices/{id}/readings", get(get_readings))
        .route("/api/devices/{id}/daily-stats", get(get_daily_stats))
        .route(
            "/api/devices/{id}/daily-stats/history",
            get(get_daily_stats_history),
        )
        // Ingestion
        .route("/api/readings", post(ingest_reading))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub queue: QueueBackend,
    pub consumer: ConsumerStatus,
    pub devices: u64,
    pub readings: u64,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let (devices, readings) = {
        let store = state.store.lock().await;
        (store.count_devices()?, store.count_readings(None)?)
    };

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
        queue: state.config.queue.backend,
        consumer: state.consumer.status().await,
        devices,
        readings,
    }))
}

/// Enroll one device (object body) or several (array body).
///
/// Responds 201 with the enrolled device, or the array of devices, in the
/// same shape as the request.
async fn enroll_devices(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EnrollmentBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let batch = body.is_batch();
    let requests = body.into_requests();

    let mut devices = {
        let mut store = state.store.lock().await;
        enroll(
            &mut store,
            state.locator.as_ref(),
            &requests,
            OffsetDateTime::now_utc(),
        )?
    };

    if batch {
        return Ok((StatusCode::CREATED, Json(devices)).into_response());
    }
    match devices.pop() {
        Some(device) => Ok((StatusCode::CREATED, Json(device)).into_response()),
        None => Err(AppError::Internal("Enrollment returned no device".to_string())),
    }
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredDevice>>, AppError> {
    let store = state.store.lock().await;
    Ok(Json(store.list_devices()?))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StoredDevice>, AppError> {
    let id = parse_device_id(&id)?;
    let store = state.store.lock().await;
    let device = store.get_device(&id)?.ok_or_else(device_not_found)?;
    Ok(Json(device))
}

/// Reading submission.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    pub temperature: f64,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
}

/// Validate a reading and queue it for aggregation.
///
/// Responds 202 once the reading is queued; daily statistics are updated
/// asynchronously by the consumer. Responds 503 when the queue stays full for
/// the configured publish timeout.
async fn ingest_reading(
    State(state): State<Arc<AppState>>,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let Json(request) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let device_id = match request.device_id.as_deref() {
        Some(id) if !id.is_empty() => parse_device_id(id)?,
        _ => return Err(AppError::BadRequest(UNENROLLED_DEVICE.to_string())),
    };

    let temperature = validate_temperature(request.temperature).map_err(|_| {
        AppError::BadRequest(if request.temperature < MIN_TEMPERATURE {
            "Temperature cannot be below absolute zero".to_string()
        } else {
            "Temperature is unreasonably high - devices do not operate above 2000 degrees"
                .to_string()
        })
    })?;

    {
        let store = state.store.lock().await;
        if store.get_device(&device_id)?.is_none() {
            return Err(AppError::BadRequest(UNENROLLED_DEVICE.to_string()));
        }
    }

    let message = ReadingMessage::new(device_id, temperature, OffsetDateTime::now_utc());
    state.publisher.publish(&message).await.map_err(|e| {
        error!("Error queuing temperature reading: {}", e);
        let message = format!("An error occurred while queuing temperature reading: {}", e);
        match e {
            QueueError::Full => AppError::Unavailable(message),
            _ => AppError::Internal(message),
        }
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            status: "Message queued for processing",
        }),
    ))
}

/// Query parameters for the daily statistics endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct DailyStatsQuery {
    /// `MM-DD-YYYY`; defaults to today in the device's timezone.
    pub date: Option<String>,
}

/// Daily statistics for one device-local day.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatsResponse {
    /// Local calendar date, `YYYY-MM-DD`.
    pub date: String,
    pub high_temp: f64,
    pub low_temp: f64,
    pub avg_temp: f64,
}

impl From<StoredDailyStat> for DailyStatsResponse {
    fn from(stat: StoredDailyStat) -> Self {
        Self {
            date: format_iso_date(stat.local_date),
            high_temp: stat.high_temp,
            low_temp: stat.low_temp,
            avg_temp: stat.avg_temp,
        }
    }
}

/// Get the statistics for one local day.
///
/// # Errors
///
/// - 400 for a malformed device ID, a malformed or impossible date, or a date
///   after today in the device's timezone
/// - 404 if the device is unknown or has no readings on that day
async fn get_daily_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<DailyStatsQuery>,
) -> Result<Json<DailyStatsResponse>, AppError> {
    let id = parse_device_id(&id)?;
    let requested = params
        .date
        .as_deref()
        .map(parse_query_date)
        .transpose()
        .map_err(|e| match e {
            tempstat_core::Error::InvalidDateFormat(_) => AppError::BadRequest(e.to_string()),
            _ => AppError::BadRequest("Invalid date".to_string()),
        })?;

    let store = state.store.lock().await;
    let device = store.get_device(&id)?.ok_or_else(device_not_found)?;
    let tz = device
        .timezone()
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let today =
        local_date(OffsetDateTime::now_utc(), &tz).map_err(|e| AppError::Internal(e.to_string()))?;
    let date = requested.unwrap_or(today);
    if date > today {
        return Err(AppError::BadRequest(
            "Date cannot be in the future".to_string(),
        ));
    }

    let bucket =
        DayBucket::for_local_date(date, &tz).map_err(|e| AppError::Internal(e.to_string()))?;
    let stat = store
        .get_daily_stat(&id, bucket.start)?
        .ok_or_else(|| AppError::NotFound("No data found for the specified date".to_string()))?;

    Ok(Json(stat.into()))
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

/// Most recent daily statistics for a device, newest first.
async fn get_daily_stats_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<StoredDailyStat>>, AppError> {
    let id = parse_device_id(&id)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    let store = state.store.lock().await;
    if store.get_device(&id)?.is_none() {
        return Err(device_not_found());
    }
    Ok(Json(store.list_daily_stats(&id, Some(limit))?))
}

/// Query parameters for readings.
#[derive(Debug, Deserialize, Default)]
pub struct ReadingsQuery {
    /// Unix timestamp, inclusive.
    pub since: Option<i64>,
    /// Unix timestamp, exclusive.
    pub until: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ReadingsQuery {
    /// Returns an error if `since > until`.
    pub fn validate(&self) -> Result<(), AppError> {
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(AppError::BadRequest(format!(
                "Invalid time range: 'since' ({}) must be less than or equal to 'until' ({})",
                since, until
            )));
        }
        Ok(())
    }
}

/// Paginated response wrapper with metadata.
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PaginationMeta,
}

#[derive(Debug, Serialize)]
pub struct PaginationMeta {
    /// Number of items returned.
    pub count: usize,
    pub offset: u32,
    pub limit: Option<u32>,
    /// Whether there are more items available.
    pub has_more: bool,
}

/// Get logged readings for a device, newest first.
async fn get_readings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<PaginatedResponse<StoredReading>>, AppError> {
    let id = parse_device_id(&id)?;
    params.validate()?;

    let mut query = ReadingQuery::new().device(&id);
    if let Some(since) = params.since {
        query = query.since(unix_timestamp(since)?);
    }
    if let Some(until) = params.until {
        query = query.until(unix_timestamp(until)?);
    }

    // One extra row tells us whether there is another page.
    if let Some(limit) = params.limit {
        query = query.limit(limit.saturating_add(1));
    }
    if let Some(offset) = params.offset {
        query = query.offset(offset);
    }

    let store = state.store.lock().await;
    if store.get_device(&id)?.is_none() {
        return Err(device_not_found());
    }
    let mut readings = store.query_readings(&query)?;

    let has_more = params.limit.is_some_and(|l| readings.len() > l as usize);
    if has_more {
        readings.pop();
    }

    Ok(Json(PaginatedResponse {
        pagination: PaginationMeta {
            count: readings.len(),
            offset: params.offset.unwrap_or(0),
            limit: params.limit,
            has_more,
        },
        data: readings,
    }))
}

/// Parse a device ID and return it in canonical (lowercase, hyphenated) form.
fn parse_device_id(id: &str) -> Result<String, AppError> {
    Uuid::parse_str(id)
        .map(|uuid| uuid.hyphenated().to_string())
        .map_err(|_| AppError::BadRequest("Invalid device ID format".to_string()))
}

fn unix_timestamp(seconds: i64) -> Result<OffsetDateTime, AppError> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| AppError::BadRequest(format!("Invalid timestamp: {}", seconds)))
}

fn device_not_found() -> AppError {
    AppError::NotFound("Device not found".to_string())
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Store(tempstat_store::Error),
    /// The reading queue cannot take more work right now.
    Unavailable(String),
    Internal(String),
}

impl From<tempstat_store::Error> for AppError {
    fn from(e: tempstat_store::Error) -> Self {
        AppError::Store(e)
    }
}

impl From<EnrollmentError> for AppError {
    fn from(e: EnrollmentError) -> Self {
        match e {
            EnrollmentError::Store(e) => AppError::Store(e),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Store(e) => {
                error!("Store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tempstat_core::FixedLocator;
    use tempstat_store::Store;
    use time::macros::datetime;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::queue::{MemoryQueue, MemorySource, ReadingPublisher, ReadingSource};

    fn create_test_state() -> (Arc<AppState>, MemorySource) {
        let (publisher, source) = MemoryQueue::bounded(16);
        let state = AppState::new(
            Store::open_in_memory().unwrap(),
            Config::default(),
            Arc::new(publisher),
            Arc::new(FixedLocator::new("America/New_York")),
        );
        (state, source)
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get(state: &Arc<AppState>, uri: &str) -> Response {
        router()
            .with_state(Arc::clone(state))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post_json(state: &Arc<AppState>, uri: &str, body: &str) -> Response {
        router()
            .with_state(Arc::clone(state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn enroll_one(state: &Arc<AppState>, serial: &str) -> String {
        let body = format!(r#"{{"serial":"{serial}","latitude":40.7128,"longitude":-74.006}}"#);
        let response = post_json(state, "/api/devices", &body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn record(state: &Arc<AppState>, device_id: &str, value: f64, at: OffsetDateTime) {
        let mut store = state.store.lock().await;
        let tz = store.get_device(device_id).unwrap().unwrap().timezone().unwrap();
        let bucket = DayBucket::for_instant(at, &tz).unwrap();
        store.record_reading(device_id, value, at, &bucket).unwrap();
    }

    async fn assert_error(response: Response, status: StatusCode, message: &str) {
        assert_eq!(response.status(), status);
        assert_eq!(response_json(response).await["error"], message);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _source) = create_test_state();
        let response = get(&state, "/api/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (state, _source) = create_test_state();
        enroll_one(&state, "SN-1").await;

        let json = response_json(get(&state, "/api/status").await).await;
        assert_eq!(json["queue"], "memory");
        assert_eq!(json["devices"], 1);
        assert_eq!(json["readings"], 0);
        assert_eq!(json["consumer"]["running"], false);
        assert_eq!(json["consumer"]["processed"], 0);
    }

    #[tokio::test]
    async fn test_enroll_single_device() {
        let (state, _source) = create_test_state();
        let response = post_json(
            &state,
            "/api/devices",
            r#"{"serial":"SN-1","latitude":40.7128,"longitude":-74.006}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = response_json(response).await;
        assert_eq!(json["serial"], "SN-1");
        assert_eq!(json["timeZone"], "America/New_York");
        assert!(Uuid::parse_str(json["id"].as_str().unwrap()).is_ok());
        assert!(json["enrolledAt"].is_string());
    }

    #[tokio::test]
    async fn test_enroll_batch() {
        let (state, _source) = create_test_state();
        let response = post_json(
            &state,
            "/api/devices",
            r#"[{"serial":"SN-1","latitude":1,"longitude":2},{"serial":"SN-2","latitude":3,"longitude":4}]"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = response_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);

        let list = response_json(get(&state, "/api/devices").await).await;
        assert_eq!(list.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enroll_duplicate_serials() {
        let (state, _source) = create_test_state();
        enroll_one(&state, "SN-1").await;
        enroll_one(&state, "SN-2").await;

        let response = post_json(
            &state,
            "/api/devices",
            r#"[{"serial":"SN-1","latitude":1,"longitude":2},{"serial":"SN-2","latitude":3,"longitude":4},{"serial":"SN-3","latitude":3,"longitude":4}]"#,
        )
        .await;
        assert_error(
            response,
            StatusCode::BAD_REQUEST,
            "Devices with the following serial numbers already exist: SN-1, SN-2",
        )
        .await;
    }

    #[tokio::test]
    async fn test_enroll_invalid_bodies() {
        let (state, _source) = create_test_state();
        for body in [
            "{ invalid json }",
            "[]",
            r#"{"serial":"SN-1","latitude":"north","longitude":2}"#,
            r#"{"serial":"SN-1","latitude":95,"longitude":2}"#,
            r#"{"serial":"","latitude":1,"longitude":2}"#,
        ] {
            let response = post_json(&state, "/api/devices", body).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn test_get_device() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;

        let response = get(&state, &format!("/api/devices/{}", id.to_uppercase())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["serial"], "SN-1");

        let response = get(&state, "/api/devices/00000000-0000-4000-8000-000000000000").await;
        assert_error(response, StatusCode::NOT_FOUND, "Device not found").await;

        let response = get(&state, "/api/devices/not-a-uuid").await;
        assert_error(response, StatusCode::BAD_REQUEST, "Invalid device ID format").await;
    }

    #[tokio::test]
    async fn test_ingest_reading_queues_message() {
        let (state, mut source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;

        let body = format!(r#"{{"deviceId":"{id}","temperature":21.5}}"#);
        let response = post_json(&state, "/api/readings", &body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            response_json(response).await["status"],
            "Message queued for processing"
        );

        let message = ReadingMessage::from_json(&source.recv().await.unwrap()).unwrap();
        assert_eq!(message.device_id, id);
        assert_eq!(message.temperature, 21.5);
        assert!(OffsetDateTime::now_utc() - message.timestamp < time::Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_ingest_reading_validation() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;

        let cases = [
            (
                r#"{"deviceId":"abc","temperature":20}"#.to_string(),
                "Invalid device ID format",
            ),
            (r#"{"temperature":20}"#.to_string(), UNENROLLED_DEVICE),
            (
                r#"{"deviceId":"00000000-0000-4000-8000-000000000000","temperature":20}"#
                    .to_string(),
                UNENROLLED_DEVICE,
            ),
            (
                format!(r#"{{"deviceId":"{id}","temperature":-300}}"#),
                "Temperature cannot be below absolute zero",
            ),
            (
                format!(r#"{{"deviceId":"{id}","temperature":2000.5}}"#),
                "Temperature is unreasonably high - devices do not operate above 2000 degrees",
            ),
        ];

        for (body, message) in cases {
            let response = post_json(&state, "/api/readings", &body).await;
            assert_error(response, StatusCode::BAD_REQUEST, message).await;
        }

        let response = post_json(
            &state,
            "/api/readings",
            &format!(r#"{{"deviceId":"{id}","temperature":"hot"}}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = post_json(&state, "/api/readings", "not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ingest_reading_queue_failure() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;
        state.publisher.close().await.unwrap();

        let body = format!(r#"{{"deviceId":"{id}","temperature":20}}"#);
        let response = post_json(&state, "/api/readings", &body).await;
        assert_error(
            response,
            StatusCode::INTERNAL_SERVER_ERROR,
            "An error occurred while queuing temperature reading: queue is closed",
        )
        .await;
    }

    #[tokio::test]
    async fn test_ingest_reading_full_queue_is_unavailable() {
        let (publisher, _source) = MemoryQueue::bounded(1);
        let state = AppState::new(
            Store::open_in_memory().unwrap(),
            Config::default(),
            Arc::new(publisher.with_publish_timeout(Duration::from_millis(20))),
            Arc::new(FixedLocator::new("America/New_York")),
        );
        let id = enroll_one(&state, "SN-1").await;
        let body = format!(r#"{{"deviceId":"{id}","temperature":20}}"#);

        let response = post_json(&state, "/api/readings", &body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            post_json(&state, "/api/readings", &body),
        )
        .await
        .expect("publish to a full queue should not block");
        assert_error(
            response,
            StatusCode::SERVICE_UNAVAILABLE,
            "An error occurred while queuing temperature reading: queue is full",
        )
        .await;
    }

    #[tokio::test]
    async fn test_daily_stats_for_date() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;

        for (value, at) in [
            (25.0, datetime!(2024-03-15 14:00 UTC)),
            (15.0, datetime!(2024-03-15 18:00 UTC)),
            (20.0, datetime!(2024-03-15 22:00 UTC)),
        ] {
            record(&state, &id, value, at).await;
        }

        let response = get(&state, &format!("/api/devices/{id}/daily-stats?date=03-15-2024")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let stats: DailyStatsResponse =
            serde_json::from_value(response_json(response).await).unwrap();
        assert_eq!(stats.date, "2024-03-15");
        assert_eq!(stats.high_temp, 25.0);
        assert_eq!(stats.low_temp, 15.0);
        assert!((stats.avg_temp - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_daily_stats_bucketed_by_device_local_day() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;

        // 02:00 UTC on July 1 is still June 30 in New York.
        record(&state, &id, 22.0, datetime!(2024-07-01 02:00 UTC)).await;

        let response = get(&state, &format!("/api/devices/{id}/daily-stats?date=06-30-2024")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["date"], "2024-06-30");

        let response = get(&state, &format!("/api/devices/{id}/daily-stats?date=7-1-2024")).await;
        assert_error(
            response,
            StatusCode::NOT_FOUND,
            "No data found for the specified date",
        )
        .await;
    }

    #[tokio::test]
    async fn test_daily_stats_defaults_to_local_today() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;
        record(&state, &id, 18.0, OffsetDateTime::now_utc()).await;

        let response = get(&state, &format!("/api/devices/{id}/daily-stats")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["highTemp"], 18.0);
    }

    #[tokio::test]
    async fn test_daily_stats_errors() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;

        let cases = [
            (
                "/api/devices/not-a-uuid/daily-stats".to_string(),
                StatusCode::BAD_REQUEST,
                "Invalid device ID format",
            ),
            (
                format!("/api/devices/{id}/daily-stats?date=2024-07-01"),
                StatusCode::BAD_REQUEST,
                "Invalid date format. Use MM-DD-YYYY",
            ),
            (
                format!("/api/devices/{id}/daily-stats?date=02-30-2024"),
                StatusCode::BAD_REQUEST,
                "Invalid date",
            ),
            (
                format!("/api/devices/{id}/daily-stats?date=12-31-2999"),
                StatusCode::BAD_REQUEST,
                "Date cannot be in the future",
            ),
            (
                "/api/devices/00000000-0000-4000-8000-000000000000/daily-stats?date=01-01-2024"
                    .to_string(),
                StatusCode::NOT_FOUND,
                "Device not found",
            ),
            (
                format!("/api/devices/{id}/daily-stats?date=01-01-2024"),
                StatusCode::NOT_FOUND,
                "No data found for the specified date",
            ),
        ];

        for (uri, status, message) in cases {
            assert_error(get(&state, &uri).await, status, message).await;
        }
    }

    #[tokio::test]
    async fn test_daily_stats_history() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;
        for day in 1..=3 {
            let at = datetime!(2024-05-01 16:00 UTC) + time::Duration::days(day);
            record(&state, &id, 10.0 + day as f64, at).await;
        }

        let json = response_json(
            get(&state, &format!("/api/devices/{id}/daily-stats/history?limit=2")).await,
        )
        .await;
        let history = json.as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["localDate"], "2024-05-04");
        assert_eq!(history[0]["readingCount"], 1);
        assert_eq!(history[1]["localDate"], "2024-05-03");
    }

    #[tokio::test]
    async fn test_get_readings_paginated() {
        let (state, _source) = create_test_state();
        let id = enroll_one(&state, "SN-1").await;
        for minute in 0..3 {
            let at = datetime!(2024-05-01 16:00 UTC) + time::Duration::minutes(minute);
            record(&state, &id, 20.0 + minute as f64, at).await;
        }

        let json =
            response_json(get(&state, &format!("/api/devices/{id}/readings?limit=2")).await).await;
        assert_eq!(json["pagination"]["count"], 2);
        assert_eq!(json["pagination"]["has_more"], true);
        assert_eq!(json["data"][0]["temperature"], 22.0);

        let response = get(
            &state,
            &format!("/api/devices/{id}/readings?since=200&until=100"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unavailable("x".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Internal("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::from(EnrollmentError::Empty).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_parse_device_id_canonicalizes() {
        assert_eq!(
            parse_device_id("6F1C9A2E-3B4D-4E5F-8A9B-0C1D2E3F4A5B").unwrap(),
            "6f1c9a2e-3b4d-4e5f-8a9b-0c1d2e3f4a5b"
        );
        assert!(parse_device_id("6f1c9a2e").is_err());
    }
}
