use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{info, instrument, warn};

use crate::error::{HealthError, Result};
use crate::probe::{check, ProbeSpec};
use crate::types::{HealthCheckResult, HealthReport, HealthStatus};

const DEFAULT_MARGIN: Duration = Duration::from_millis(500);

/// Runs every registered probe concurrently and classifies the result.
///
/// The probe set is fixed at build time, so the aggregator can be shared
/// behind an `Arc` without locking.
#[derive(Debug, Clone)]
pub struct HealthAggregator {
    probes: Vec<ProbeSpec>,
    margin: Duration,
}

impl HealthAggregator {
    pub fn builder() -> HealthAggregatorBuilder {
        HealthAggregatorBuilder::default()
    }

    /// Names of registered probes in registration order.
    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Wall-clock bound for one [`aggregate`](Self::aggregate) call:
    /// the slowest probe timeout plus a fixed margin.
    pub fn budget(&self) -> Duration {
        let slowest = self
            .probes
            .iter()
            .map(|p| p.timeout)
            .max()
            .unwrap_or_default();
        slowest + self.margin
    }

    /// Check every registered service.
    #[instrument(skip(self), fields(probes = self.probes.len()))]
    pub async fn aggregate(&self) -> HealthReport {
        let report = self.run(self.probes.iter().collect()).await;
        if report.is_healthy() {
            info!("all services healthy");
        } else {
            warn!(unhealthy = ?report.unhealthy_services(), "health check failed");
        }
        report
    }

    /// Check only the named services. Names with no registered probe are
    /// reported unhealthy so callers gating on them fail closed.
    pub async fn aggregate_only(&self, names: &[String]) -> HealthReport {
        let selected: Vec<&ProbeSpec> = self
            .probes
            .iter()
            .filter(|p| names.iter().any(|n| n == p.name()))
            .collect();

        let mut report = self.run(selected).await;
        for name in names {
            if !report.services.contains_key(name) {
                report.services.insert(
                    name.clone(),
                    HealthCheckResult {
                        service_name: name.clone(),
                        status: HealthStatus::Unhealthy,
                        detail: Some("no probe registered".to_string()),
                        checked_at: Utc::now(),
                        response_time_ms: 0,
                        mandatory: true,
                    },
                );
                report.overall = HealthStatus::Unhealthy;
            }
        }
        report
    }

    async fn run(&self, probes: Vec<&ProbeSpec>) -> HealthReport {
        let names: Vec<(String, bool)> = probes
            .iter()
            .map(|p| (p.name().to_string(), p.is_mandatory()))
            .collect();
        let budget = self.budget();

        let checks = join_all(probes.into_iter().map(check));
        match tokio::time::timeout(budget, checks).await {
            Ok(results) => HealthReport::from_results(results),
            // Each probe is individually bounded, so this only fires if the
            // runtime is starved. Fail closed.
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "aggregate budget exceeded");
                let now = Utc::now();
                HealthReport::from_results(names.into_iter().map(|(name, mandatory)| {
                    HealthCheckResult {
                        service_name: name,
                        status: HealthStatus::Unhealthy,
                        detail: Some("aggregate budget exceeded".to_string()),
                        checked_at: now,
                        response_time_ms: budget.as_millis() as u64,
                        mandatory,
                    }
                }))
            }
        }
    }
}

#[derive(Debug)]
pub struct HealthAggregatorBuilder {
    probes: Vec<ProbeSpec>,
    margin: Duration,
}

impl Default for HealthAggregatorBuilder {
    fn default() -> Self {
        Self {
            probes: Vec::new(),
            margin: DEFAULT_MARGIN,
        }
    }
}

impl HealthAggregatorBuilder {
    pub fn probe(mut self, spec: ProbeSpec) -> Self {
        self.probes.push(spec);
        self
    }

    /// Register `spec` only when the service is configured.
    pub fn probe_if_configured(self, spec: Option<ProbeSpec>) -> Self {
        match spec {
            Some(spec) => self.probe(spec),
            None => self,
        }
    }

    pub fn margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn build(self) -> Result<HealthAggregator> {
        let mut seen = HashSet::new();
        for p in &self.probes {
            if !seen.insert(p.name().to_string()) {
                return Err(HealthError::DuplicateProbe(p.name().to_string()));
            }
        }
        Ok(HealthAggregator {
            probes: self.probes,
            margin: self.margin,
        })
    }
}
