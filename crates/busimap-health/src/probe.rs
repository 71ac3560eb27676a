use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

use crate::error::{HealthError, Result};
use crate::types::{HealthCheckResult, HealthStatus};

/// A single external-dependency check.
///
/// Implementations should be read-only against the service they probe.
/// Blocking work must be moved off the runtime (`spawn_blocking`) so the
/// timeout in [`check`] can fire.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Service name used as the key in health reports.
    fn name(&self) -> &str;

    async fn check(&self) -> Result<()>;
}

/// Whether a probe's result counts toward the overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Mandatory,
    /// Reported but informational only.
    Optional,
}

/// A probe registered with its timeout. Read-only after startup.
#[derive(Clone)]
pub struct ProbeSpec {
    pub probe: Arc<dyn Probe>,
    pub timeout: Duration,
    pub criticality: Criticality,
}

impl ProbeSpec {
    /// A mandatory probe.
    pub fn new(probe: Arc<dyn Probe>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            criticality: Criticality::Mandatory,
        }
    }

    pub fn optional(mut self) -> Self {
        self.criticality = Criticality::Optional;
        self
    }

    pub fn name(&self) -> &str {
        self.probe.name()
    }

    pub fn is_mandatory(&self) -> bool {
        self.criticality == Criticality::Mandatory
    }
}

impl std::fmt::Debug for ProbeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSpec")
            .field("name", &self.name())
            .field("timeout", &self.timeout)
            .field("criticality", &self.criticality)
            .finish()
    }
}

/// Run `spec` within `spec.timeout` and report the outcome.
///
/// The probe runs on its own task: a hung probe is aborted at the deadline
/// and a panicking one is reported as unhealthy. This function never fails.
pub async fn check(spec: &ProbeSpec) -> HealthCheckResult {
    let name = spec.name().to_string();
    let started = Instant::now();

    let probe = Arc::clone(&spec.probe);
    let mut task = tokio::spawn(async move { probe.check().await });

    let outcome = match tokio::time::timeout(spec.timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HealthError::Failure(format!("probe panicked: {join_err}"))),
        Err(_elapsed) => {
            task.abort();
            Err(HealthError::Timeout {
                ms: spec.timeout.as_millis() as u64,
            })
        }
    };
    let response_time_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(()) => {
            debug!(service = %name, response_time_ms, "health check passed");
            HealthCheckResult {
                service_name: name,
                status: HealthStatus::Healthy,
                detail: None,
                checked_at: Utc::now(),
                response_time_ms,
                mandatory: spec.is_mandatory(),
            }
        }
        Err(e) => {
            error!(service = %name, error = %e, "health check failed");
            HealthCheckResult {
                service_name: name,
                status: HealthStatus::Unhealthy,
                detail: Some(e.to_string()),
                checked_at: Utc::now(),
                response_time_ms,
                mandatory: spec.is_mandatory(),
            }
        }
    }
}
