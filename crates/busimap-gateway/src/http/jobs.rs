//! Job endpoints: submit on demand, inspect the registry and instance
//! records, and the two-phase archive/purge of finished instances.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use busimap_scheduler::{InstanceId, SchedulerError};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;

type ApiError = (StatusCode, Json<Value>);

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;
const MAX_DELAY_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    /// Run no earlier than this many seconds from now.
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub archived: bool,
}

/// POST /jobs/{name}
///
/// The body, if any, is the JSON payload handed to the handler; an empty
/// body means `{}`. Returns 202 with the new instance id.
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<SubmitParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let payload: Value = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            warn!(job = %name, error = %e, "invalid JSON payload");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid JSON body", "code": "INVALID_PAYLOAD"})),
            )
        })?
    };

    let id = match params.delay_secs {
        Some(secs) if secs > MAX_DELAY_SECS => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("delay_secs must not exceed {MAX_DELAY_SECS}"),
                    "code": "INVALID_DELAY",
                })),
            ));
        }
        Some(secs) => {
            let due = Utc::now() + chrono::Duration::seconds(secs as i64);
            state.scheduler.submit_at(&name, payload, due)
        }
        None => state.scheduler.submit(&name, payload),
    }
    .map_err(scheduler_error)?;

    info!(job = %name, instance_id = %id, "job submitted over http");
    Ok((StatusCode::ACCEPTED, Json(json!({ "instance_id": id }))))
}

/// GET /jobs: registered jobs with their schedule and next fire time.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let scheduler = &state.scheduler;
    let jobs: Vec<Value> = scheduler
        .registry()
        .definitions()
        .iter()
        .map(|def| {
            json!({
                "name": def.name,
                "schedule": def.schedule,
                "next_fire": scheduler.next_fire(&def.name),
                "reentrant": def.reentrant,
                "requires": def.requires,
                "max_retries": def.retry.max_retries,
                "soft_timeout_secs": def.soft_timeout.map(|d| d.as_secs()),
                "hard_timeout_secs": def.hard_timeout.map(|d| d.as_secs()),
            })
        })
        .collect();
    Json(json!({ "jobs": jobs }))
}

/// GET /jobs/instances?limit=&archived=
pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let instances = state
        .scheduler
        .list_instances(limit, params.archived)
        .map_err(scheduler_error)?;
    Ok(Json(json!({ "instances": instances })))
}

/// GET /jobs/instances/{id}
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let instance = state.scheduler.instance(id).map_err(scheduler_error)?;
    Ok(Json(json!(instance)))
}

/// DELETE /jobs/instances/{id}: archive a finished instance.
pub async fn archive_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let instance = state.scheduler.archive(id).map_err(scheduler_error)?;
    Ok(Json(json!(instance)))
}

/// POST /jobs/instances/{id}/restore
pub async fn restore_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let instance = state.scheduler.restore(id).map_err(scheduler_error)?;
    Ok(Json(json!(instance)))
}

/// DELETE /jobs/instances/{id}/purge: only archived instances can be purged.
pub async fn purge_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.scheduler.purge(id).map_err(scheduler_error)?;
    info!(instance_id = %id, "instance purged");
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str) -> Result<InstanceId, ApiError> {
    raw.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid instance id: {raw}"), "code": "INVALID_ID"})),
        )
    })
}

fn scheduler_error(e: SchedulerError) -> ApiError {
    let status = match e {
        SchedulerError::UnknownJob { .. } | SchedulerError::InstanceNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::NotTerminal { .. }
        | SchedulerError::NotArchived { .. }
        | SchedulerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SchedulerError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
        _ => {
            warn!(error = %e, "scheduler request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({"error": e.to_string(), "code": e.code()})),
    )
}
