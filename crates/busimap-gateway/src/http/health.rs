use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;

use crate::app::AppState;

/// GET /health: probe every registered dependency concurrently.
///
/// 200 when all mandatory services are healthy, 503 otherwise. The body
/// always carries the per-service breakdown.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let report = state.health.aggregate().await;
    let status =
        StatusCode::from_u16(report.status_code()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(report.to_body(&state.config.gateway.api_version)))
}
