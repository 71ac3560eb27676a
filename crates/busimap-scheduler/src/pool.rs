use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::handler::JobContext;
use crate::registry::JobDefinition;
use crate::types::{JobInstance, Outcome};

/// Bounded set of execution slots.
///
/// A slot is taken with [`acquire`](Self::acquire) before dispatch and given
/// back when [`execute`](Self::execute) returns, including after a hard
/// timeout, so a stuck handler never holds a slot forever.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed")
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `def`'s handler for `instance` while holding `permit`.
    ///
    /// Never fails: handler errors and panics become [`Outcome::Failed`],
    /// the hard timeout becomes [`Outcome::TimedOut`].
    pub async fn execute(
        &self,
        permit: OwnedSemaphorePermit,
        instance: &JobInstance,
        def: &JobDefinition,
    ) -> Outcome {
        let cancel = CancellationToken::new();
        let ctx = JobContext {
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            payload: instance.payload.clone(),
            attempt: instance.attempt_count + 1,
            cancel: cancel.clone(),
        };

        let handler = Arc::clone(&def.handler);
        let mut task = tokio::spawn(async move { handler.run(ctx).await });
        let started = Instant::now();

        let soft = deadline(def.soft_timeout);
        let hard = deadline(def.hard_timeout);
        tokio::pin!(soft, hard);
        let mut soft_fired = false;

        let joined = loop {
            tokio::select! {
                res = &mut task => break res,
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    warn!(
                        job = %instance.job_name,
                        instance_id = %instance.id,
                        "soft timeout reached, requesting cancellation"
                    );
                    cancel.cancel();
                }
                _ = &mut hard => {
                    task.abort();
                    let after = started.elapsed();
                    error!(
                        job = %instance.job_name,
                        instance_id = %instance.id,
                        after_ms = after.as_millis() as u64,
                        "hard timeout reached, handler aborted"
                    );
                    drop(permit);
                    return Outcome::TimedOut { after };
                }
            }
        };
        drop(permit);

        match joined {
            Ok(Ok(value)) => {
                debug!(job = %instance.job_name, instance_id = %instance.id, "handler succeeded");
                Outcome::Succeeded(value)
            }
            Ok(Err(_)) if soft_fired => Outcome::TimedOut {
                after: started.elapsed(),
            },
            Ok(Err(e)) => Outcome::Failed {
                error: format!("{e:#}"),
            },
            Err(join_err) if join_err.is_panic() => Outcome::Failed {
                error: format!("handler panicked: {join_err}"),
            },
            Err(join_err) => Outcome::Failed {
                error: format!("handler cancelled: {join_err}"),
            },
        }
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn instance() -> JobInstance {
        JobInstance::new("test", json!({"n": 2}), Utc::now())
    }

    #[tokio::test]
    async fn success_carries_value() {
        let pool = WorkerPool::new(1);
        let def = JobDefinition::new(
            "test",
            handler_fn(|ctx| async move { Ok(json!(ctx.payload["n"].as_i64().unwrap_or(0) * 2)) }),
        );
        let permit = pool.acquire().await;
        assert_eq!(pool.available(), 0);
        let out = pool.execute(permit, &instance(), &def).await;
        assert_eq!(out, Outcome::Succeeded(json!(4)));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn error_maps_to_failed() {
        let pool = WorkerPool::new(1);
        let def = JobDefinition::new(
            "test",
            handler_fn(|_| async { Err(anyhow::anyhow!("connection refused")) }),
        );
        let out = pool.execute(pool.acquire().await, &instance(), &def).await;
        assert_eq!(
            out,
            Outcome::Failed {
                error: "connection refused".into()
            }
        );
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let pool = WorkerPool::new(1);
        let def = JobDefinition::new(
            "test",
            handler_fn(|_| async {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            }),
        );
        let out = pool.execute(pool.acquire().await, &instance(), &def).await;
        match out {
            Outcome::Failed { error } => assert!(error.contains("panicked")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn hard_timeout_aborts_and_frees_slot() {
        let pool = WorkerPool::new(1);
        let def = JobDefinition::new(
            "test",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }),
        )
        .hard_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let out = pool.execute(pool.acquire().await, &instance(), &def).await;
        assert!(matches!(out, Outcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn soft_timeout_signals_handler() {
        let pool = WorkerPool::new(1);
        let def = JobDefinition::new(
            "test",
            handler_fn(|ctx| async move {
                ctx.cancelled().await;
                Ok(json!("wound down"))
            }),
        )
        .soft_timeout(Duration::from_millis(50))
        .hard_timeout(Duration::from_secs(5));

        let out = pool.execute(pool.acquire().await, &instance(), &def).await;
        assert_eq!(out, Outcome::Succeeded(json!("wound down")));
    }

    #[tokio::test]
    async fn failure_after_soft_timeout_is_timed_out() {
        let pool = WorkerPool::new(1);
        let def = JobDefinition::new(
            "test",
            handler_fn(|ctx| async move {
                ctx.cancelled().await;
                Err(anyhow::anyhow!("gave up"))
            }),
        )
        .soft_timeout(Duration::from_millis(50));

        let out = pool.execute(pool.acquire().await, &instance(), &def).await;
        assert!(matches!(out, Outcome::TimedOut { .. }));
    }

    #[test]
    fn zero_size_pool_still_has_one_slot() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        assert!(pool.try_acquire().is_some());
    }
}
