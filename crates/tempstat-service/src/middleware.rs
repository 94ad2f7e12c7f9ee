//! API key authentication.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::SecurityConfig;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Reject requests without a valid `X-API-Key` header.
///
/// Does nothing when `api_key_enabled` is false. `/api/health` is always open
/// so monitoring works without credentials.
pub async fn api_key_auth(
    State(config): State<Arc<SecurityConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if !config.api_key_enabled || request.uri().path() == "/api/health" {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let valid = match (&config.api_key, provided) {
        (Some(expected), Some(provided)) => keys_match(expected, provided),
        _ => false,
    };

    if valid {
        next.run(request).await
    } else {
        warn!("API key authentication failed for {}", request.uri().path());
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "Invalid or missing API key",
            })),
        )
            .into_response()
    }
}

fn keys_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}
