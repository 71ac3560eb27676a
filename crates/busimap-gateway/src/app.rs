use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use busimap_core::config::BusimapConfig;
use busimap_health::HealthAggregator;
use busimap_scheduler::Scheduler;
use tower_http::trace::TraceLayer;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: BusimapConfig,
    pub health: Arc<HealthAggregator>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(
        config: BusimapConfig,
        health: Arc<HealthAggregator>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            health,
            scheduler,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{health, jobs};

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{name}", post(jobs::submit_job))
        .route("/jobs/instances", get(jobs::list_instances))
        .route(
            "/jobs/instances/{id}",
            get(jobs::get_instance).delete(jobs::archive_instance),
        )
        .route("/jobs/instances/{id}/restore", post(jobs::restore_instance))
        .route("/jobs/instances/{id}/purge", delete(jobs::purge_instance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use busimap_health::probes::DatastoreProbe;
    use busimap_health::ProbeSpec;
    use busimap_scheduler::{handler_fn, InstanceStore, JobDefinition, JobRegistry};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state_with(health: HealthAggregator) -> Arc<AppState> {
        let config = BusimapConfig::default();
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new(
                "echo",
                handler_fn(|ctx| async move { Ok(ctx.payload) }),
            ))
            .unwrap();
        let store = Arc::new(InstanceStore::in_memory().unwrap());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(registry),
            store,
            &config.scheduler,
        ));
        Arc::new(AppState::new(config, Arc::new(health), scheduler))
    }

    fn state() -> Arc<AppState> {
        state_with(HealthAggregator::builder().build().unwrap())
    }

    async fn send(router: Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
        let res = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok_with_no_failing_probes() {
        let (status, body) = send(build_router(state()), "GET", "/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], "1.0");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn failing_mandatory_probe_returns_503() {
        let health = HealthAggregator::builder()
            .probe(ProbeSpec::new(
                Arc::new(DatastoreProbe::new("/nonexistent/dir/busimap.db")),
                Duration::from_secs(1),
            ))
            .build()
            .unwrap();
        let (status, body) =
            send(build_router(state_with(health)), "GET", "/health", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["services"]["database"]["status"], "unhealthy");
        assert!(body["services"]["database"]["error"].is_string());
    }

    #[tokio::test]
    async fn submitted_job_is_pending_until_dispatched() {
        let state = state();
        let (status, body) = send(
            build_router(state.clone()),
            "POST",
            "/jobs/echo",
            Body::from(json!({"hello": "world"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["instance_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            build_router(state),
            "GET",
            &format!("/jobs/instances/{id}"),
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "pending");
        assert_eq!(body["payload"], json!({"hello": "world"}));
        assert_eq!(body["attempt_count"], 0);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (status, body) =
            send(build_router(state()), "POST", "/jobs/nope", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_JOB");
    }

    #[tokio::test]
    async fn malformed_payload_is_400() {
        let (status, body) = send(
            build_router(state()),
            "POST",
            "/jobs/echo",
            Body::from("{not json"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn bad_instance_id_is_400() {
        let (status, body) = send(
            build_router(state()),
            "GET",
            "/jobs/instances/not-a-uuid",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_ID");
    }

    #[tokio::test]
    async fn unfinished_instance_cannot_be_archived_or_purged() {
        let state = state();
        let id = state.scheduler.submit("echo", json!({})).unwrap();

        let (status, body) = send(
            build_router(state.clone()),
            "DELETE",
            &format!("/jobs/instances/{id}"),
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NOT_TERMINAL");

        let (status, body) = send(
            build_router(state),
            "DELETE",
            &format!("/jobs/instances/{id}/purge"),
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NOT_ARCHIVED");
    }

    #[tokio::test]
    async fn registry_and_instances_are_listed() {
        let state = state();
        state.scheduler.submit("echo", json!({"n": 1})).unwrap();

        let (status, body) = send(build_router(state.clone()), "GET", "/jobs", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"][0]["name"], "echo");
        assert!(body["jobs"][0]["schedule"].is_null());

        let (status, body) = send(
            build_router(state),
            "GET",
            "/jobs/instances?limit=10",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instances"].as_array().unwrap().len(), 1);
    }
}
