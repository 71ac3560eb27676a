//! Built-in jobs and the beat table that schedules them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use busimap_core::config::SchedulerConfig;
use busimap_health::HealthAggregator;
use busimap_scheduler::{
    handler_fn, InstanceStore, JobDefinition, JobRegistry, RetryPolicy, SchedulerError,
};
use chrono::Utc;
use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::{info, warn};

pub const ADD_NUMBERS: &str = "common.add_numbers";
pub const CACHE_ROUNDTRIP: &str = "common.cache_roundtrip";
pub const HEALTH_SNAPSHOT: &str = "common.health_snapshot";
pub const PURGE_ARCHIVED: &str = "maintenance.purge_archived";

const ROUNDTRIP_KEY: &str = "cache_roundtrip_test";
const ROUNDTRIP_VALUE: &str = "success";
const ROUNDTRIP_TTL_SECS: u64 = 300;

/// Shared handles the built-in handlers close over.
#[derive(Clone)]
pub struct JobDeps {
    pub store: Arc<InstanceStore>,
    pub health: Arc<HealthAggregator>,
    pub cache_url: String,
    pub api_version: String,
}

/// Register every built-in job, applying the config defaults and then the
/// matching beat entry, if any.
///
/// A beat entry naming a job that does not exist is a startup error.
pub fn register_builtin(
    registry: &mut JobRegistry,
    config: &SchedulerConfig,
    deps: &JobDeps,
) -> busimap_scheduler::Result<()> {
    let mut defs: HashMap<String, JobDefinition> = builtin(deps, config)
        .into_iter()
        .map(|def| (def.name.clone(), with_defaults(def, config)))
        .collect();

    let mut beat: Vec<_> = config.beat.iter().collect();
    beat.sort_by(|a, b| a.0.cmp(b.0));
    for (name, entry) in beat {
        let def = defs
            .remove(name)
            .ok_or_else(|| SchedulerError::UnknownJob { name: name.clone() })?;

        let mut def = def
            .schedule(entry.schedule.clone())
            .reentrant(entry.reentrant);
        if let Some(max_retries) = entry.max_retries {
            let backoff = def.retry.backoff_base;
            def = def.retry(RetryPolicy::new(max_retries, backoff));
        }
        for service in &entry.requires {
            if !def.requires.contains(service) {
                def.requires.push(service.clone());
            }
        }
        registry.register(def)?;
    }

    for def in defs.into_values() {
        registry.register(def)?;
    }
    info!(count = registry.len(), "built-in jobs registered");
    Ok(())
}

fn with_defaults(def: JobDefinition, config: &SchedulerConfig) -> JobDefinition {
    let mut def = def.retry(RetryPolicy::new(
        config.max_retries,
        Duration::from_secs(config.retry_backoff_secs),
    ));
    // 0 disables the corresponding timeout
    if config.soft_timeout_secs > 0 {
        def = def.soft_timeout(Duration::from_secs(config.soft_timeout_secs));
    }
    if config.hard_timeout_secs > 0 {
        def = def.hard_timeout(Duration::from_secs(config.hard_timeout_secs));
    }
    def
}

fn builtin(deps: &JobDeps, config: &SchedulerConfig) -> Vec<JobDefinition> {
    let cache_url = deps.cache_url.clone();
    let health = Arc::clone(&deps.health);
    let api_version = deps.api_version.clone();
    let store = Arc::clone(&deps.store);
    let retention = chrono::Duration::days(i64::from(config.archive_retention_days));

    vec![
        JobDefinition::new(
            ADD_NUMBERS,
            handler_fn(|ctx| async move { add_numbers(&ctx.payload) }),
        ),
        JobDefinition::new(
            CACHE_ROUNDTRIP,
            handler_fn(move |_| {
                let url = cache_url.clone();
                async move { cache_roundtrip(&url).await }
            }),
        )
        .requires(["redis"]),
        JobDefinition::new(
            HEALTH_SNAPSHOT,
            handler_fn(move |_| {
                let health = Arc::clone(&health);
                let version = api_version.clone();
                async move {
                    let report = health.aggregate().await;
                    if !report.is_healthy() {
                        warn!(unhealthy = ?report.unhealthy_services(), "health snapshot: degraded");
                    }
                    Ok(report.to_body(&version))
                }
            }),
        ),
        JobDefinition::new(
            PURGE_ARCHIVED,
            handler_fn(move |_| {
                let store = Arc::clone(&store);
                async move {
                    let cutoff = Utc::now() - retention;
                    let purged = tokio::task::spawn_blocking(move || store.purge_archived_before(cutoff))
                        .await
                        .context("purge task failed")??;
                    info!(purged, %cutoff, "archived instances purged");
                    Ok(json!({ "purged": purged }))
                }
            }),
        ),
    ]
}

/// `{"x": .., "y": ..}` → their sum. Integers stay integers unless the sum
/// overflows.
fn add_numbers(payload: &Value) -> anyhow::Result<Value> {
    let (x, y) = (&payload["x"], &payload["y"]);
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(json!(sum));
        }
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => anyhow::bail!("payload must contain numeric \"x\" and \"y\""),
    }
}

/// Write a key to the cache, read it back and report whether it matched.
/// Connection errors fail the attempt so the retry policy applies.
async fn cache_roundtrip(url: &str) -> anyhow::Result<Value> {
    let client = redis::Client::open(url).context("invalid cache url")?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .context("cache connection failed")?;

    let _: () = conn
        .set_ex(ROUNDTRIP_KEY, ROUNDTRIP_VALUE, ROUNDTRIP_TTL_SECS)
        .await
        .context("cache write failed")?;
    let value: Option<String> = conn.get(ROUNDTRIP_KEY).await.context("cache read failed")?;

    let working = value.as_deref() == Some(ROUNDTRIP_VALUE);
    if !working {
        warn!(?value, "cache round trip returned an unexpected value");
    }
    Ok(json!({
        "status": "SUCCESS",
        "redis_connection": if working { "working" } else { "failed" },
        "message": if working { "Cache round trip completed" } else { "Cache value mismatch" },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use busimap_core::config::BeatEntry;
    use busimap_core::types::Schedule;
    use busimap_scheduler::{InstanceId, JobContext};

    fn ctx(job: &str, payload: Value) -> JobContext {
        JobContext {
            instance_id: InstanceId::new(),
            job_name: job.to_string(),
            payload,
            attempt: 1,
            cancel: Default::default(),
        }
    }

    fn deps() -> JobDeps {
        JobDeps {
            store: Arc::new(InstanceStore::in_memory().unwrap()),
            health: Arc::new(HealthAggregator::builder().build().unwrap()),
            cache_url: "redis://127.0.0.1:1/0".to_string(),
            api_version: "1.0".to_string(),
        }
    }

    #[test]
    fn default_beat_schedules_builtins() {
        let mut reg = JobRegistry::new();
        register_builtin(&mut reg, &SchedulerConfig::default(), &deps()).unwrap();

        assert_eq!(reg.len(), 4);
        let snapshot = reg.resolve(HEALTH_SNAPSHOT).unwrap();
        assert!(matches!(
            snapshot.schedule,
            Some(Schedule::Interval { every_secs: 300 })
        ));
        assert_eq!(snapshot.soft_timeout, Some(Duration::from_secs(300)));
        assert_eq!(snapshot.hard_timeout, Some(Duration::from_secs(360)));
        assert!(reg.resolve(ADD_NUMBERS).unwrap().schedule.is_none());
        assert_eq!(reg.resolve(CACHE_ROUNDTRIP).unwrap().requires, vec!["redis"]);
    }

    #[test]
    fn beat_entry_overrides_defaults() {
        let mut config = SchedulerConfig::default();
        config.soft_timeout_secs = 0;
        let mut entry = BeatEntry::new(Schedule::Interval { every_secs: 60 });
        entry.max_retries = Some(1);
        entry.reentrant = true;
        entry.requires = vec!["redis".into(), "database".into()];
        config.beat.insert(CACHE_ROUNDTRIP.into(), entry);

        let mut reg = JobRegistry::new();
        register_builtin(&mut reg, &config, &deps()).unwrap();

        let def = reg.resolve(CACHE_ROUNDTRIP).unwrap();
        assert_eq!(def.retry.max_retries, 1);
        assert_eq!(def.retry.backoff_base, Duration::from_secs(60));
        assert!(def.reentrant);
        assert_eq!(def.requires, vec!["redis", "database"]);
        assert!(def.soft_timeout.is_none());
    }

    #[test]
    fn beat_entry_for_unknown_job_is_rejected() {
        let mut config = SchedulerConfig::default();
        config.beat.insert(
            "reports.daily".into(),
            BeatEntry::new(Schedule::Daily { hour: 1, minute: 0 }),
        );
        let mut reg = JobRegistry::new();
        let err = register_builtin(&mut reg, &config, &deps()).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_JOB");
    }

    #[test]
    fn add_numbers_keeps_integers() {
        assert_eq!(add_numbers(&json!({"x": 2, "y": 40})).unwrap(), json!(42));
        assert_eq!(add_numbers(&json!({"x": 1.5, "y": 1})).unwrap(), json!(2.5));
        assert_eq!(
            add_numbers(&json!({"x": i64::MAX, "y": 1})).unwrap(),
            json!(i64::MAX as f64 + 1.0)
        );
        assert!(add_numbers(&json!({"x": "a"})).is_err());
    }

    #[tokio::test]
    async fn add_numbers_runs_through_handler() {
        let mut reg = JobRegistry::new();
        register_builtin(&mut reg, &SchedulerConfig::default(), &deps()).unwrap();
        let def = reg.resolve(ADD_NUMBERS).unwrap();
        let out = def
            .handler
            .run(ctx(ADD_NUMBERS, json!({"x": 3, "y": 4})))
            .await
            .unwrap();
        assert_eq!(out, json!(7));
    }

    #[tokio::test]
    async fn cache_roundtrip_fails_when_unreachable() {
        let err = cache_roundtrip("redis://127.0.0.1:1/0").await.unwrap_err();
        assert!(format!("{err:#}").contains("cache connection failed"));
    }

    #[tokio::test]
    async fn health_snapshot_reports_body() {
        let mut reg = JobRegistry::new();
        register_builtin(&mut reg, &SchedulerConfig::default(), &deps()).unwrap();
        let def = reg.resolve(HEALTH_SNAPSHOT).unwrap();
        let body = def.handler.run(ctx(HEALTH_SNAPSHOT, json!({}))).await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], "1.0");
    }

    #[tokio::test]
    async fn purge_job_reports_count() {
        let mut reg = JobRegistry::new();
        register_builtin(&mut reg, &SchedulerConfig::default(), &deps()).unwrap();
        let def = reg.resolve(PURGE_ARCHIVED).unwrap();
        let out = def.handler.run(ctx(PURGE_ARCHIVED, json!({}))).await.unwrap();
        assert_eq!(out, json!({"purged": 0}));
    }
}
