use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{error::AppError, routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// `TraceLayer` wraps every route for structured request/response logging.
/// Anything not routed below answers with the JSON `not_found` error.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/top", get(routes::counter::counter))
        .route("/top/", get(routes::counter::counter))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found(uri: axum::http::Uri) -> AppError {
    AppError::NotFound(format!("no route for {}", uri.path()))
}
