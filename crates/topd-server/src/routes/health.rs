use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /health`: liveness check.
///
/// Returns `200 OK` when the persistence backend answers its ping, and
/// `503 Service Unavailable` otherwise.
///
/// Response shape:
/// ```json
/// { "status": "ok", "version": "0.1.0", "sites": 2 }
/// ```
#[tracing::instrument(skip(state))]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sites = state.sites.len();
    match state.backend.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "sites": sites,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Health check: storage unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "version": env!("CARGO_PKG_VERSION"),
                    "sites": sites,
                })),
            )
                .into_response()
        }
    }
}
