use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Health classification of a single service or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of one probe run. Recomputed on every aggregation, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub service_name: String,
    pub status: HealthStatus,
    /// Error text when unhealthy.
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub response_time_ms: u64,
    /// Whether this result counts toward the overall status.
    pub mandatory: bool,
}

/// Combined result of one aggregation call.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub services: BTreeMap<String, HealthCheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Classify a set of results: unhealthy if any mandatory result is unhealthy.
    pub fn from_results(results: impl IntoIterator<Item = HealthCheckResult>) -> Self {
        let services: BTreeMap<String, HealthCheckResult> = results
            .into_iter()
            .map(|r| (r.service_name.clone(), r))
            .collect();
        let overall = if services
            .values()
            .any(|r| r.mandatory && !r.status.is_healthy())
        {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        Self {
            overall,
            services,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall.is_healthy()
    }

    /// HTTP status for the external interface: 200 when healthy, 503 otherwise.
    pub fn status_code(&self) -> u16 {
        match self.overall {
            HealthStatus::Healthy => 200,
            HealthStatus::Unhealthy => 503,
        }
    }

    /// Names of services whose result is unhealthy, mandatory or not.
    pub fn unhealthy_services(&self) -> Vec<String> {
        self.services
            .values()
            .filter(|r| !r.status.is_healthy())
            .map(|r| r.service_name.clone())
            .collect()
    }

    /// Response body served by `GET /health`.
    pub fn to_body(&self, version: &str) -> Value {
        let mut services = Map::new();
        for (name, result) in &self.services {
            let mut entry = json!({
                "status": result.status,
                "response_time_ms": result.response_time_ms,
            });
            if let Some(ref detail) = result.detail {
                entry["error"] = Value::String(detail.clone());
            }
            services.insert(name.clone(), entry);
        }
        json!({
            "status": self.overall,
            "timestamp": self.checked_at.to_rfc3339(),
            "version": version,
            "services": services,
        })
    }
}
