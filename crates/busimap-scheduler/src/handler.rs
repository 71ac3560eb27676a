use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::InstanceId;

/// Everything a handler gets to see about the instance it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub instance_id: InstanceId,
    pub job_name: String,
    pub payload: Value,
    /// 1 on the first attempt, 2 on the first retry, and so on.
    pub attempt: u32,
    /// Triggered when the soft timeout expires.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the soft timeout has fired.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Executable body of a registered job.
///
/// Errors are mapped to a `failed` instance and fed to the retry policy.
/// Long CPU-bound or blocking work should go through
/// `tokio::task::spawn_blocking`, otherwise the hard timeout cannot
/// interrupt it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```ignore
/// let h = handler_fn(|ctx| async move { Ok(ctx.payload) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(payload: Value) -> JobContext {
        JobContext {
            instance_id: InstanceId::new(),
            job_name: "echo".into(),
            payload,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn closure_handler_sees_payload() {
        let h = handler_fn(|ctx| async move { Ok(ctx.payload) });
        let out = h.run(ctx(json!({"a": 1}))).await.unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn cancellation_is_observable() {
        let c = ctx(Value::Null);
        assert!(!c.is_cancelled());
        c.cancel.cancel();
        assert!(c.is_cancelled());
        c.cancelled().await;
    }
}
