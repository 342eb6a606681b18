//! HTTP handlers for the rollcache server
//!
//! Every cache operation goes through a single command endpoint that accepts
//! a JSON [`Request`] and answers with a JSON [`Response`].

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use rollcache::config::Config;
use rollcache::worker::{Request, Response, Worker};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

// =============================================================================
// Application State
// =============================================================================

/// Shared application state
pub struct AppState {
    /// Dispatches commands to the registry
    pub worker: Worker,
    /// Effective configuration
    pub config: Config,
}

// =============================================================================
// Response Types
// =============================================================================

/// Health check body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub backend: String,
    pub collections: usize,
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.worker.registry();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        backend: registry.backend().backend_id().to_string(),
        collections: registry.len(),
    })
}

/// Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    match rollcache::metrics::gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        },
    }
}

/// Run one cache command
///
/// Failures are reported in the body; the HTTP status only distinguishes
/// bad input (400) and missing collections (404) from backend trouble (503).
pub async fn command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Request>,
) -> (StatusCode, Json<Response>) {
    debug!(command = request.command(), "Command received");
    let response = state.worker.handle(request).await;
    let status = match response.error.as_ref().map(|e| e.kind.as_str()) {
        None => StatusCode::OK,
        Some("validation") | Some("serialization") => StatusCode::BAD_REQUEST,
        Some("not_found") => StatusCode::NOT_FOUND,
        Some("backend") => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(response))
}
