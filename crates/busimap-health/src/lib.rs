//! `busimap-health`: dependency probes and health aggregation.
//!
//! A [`probe::Probe`] checks one external service. [`probe::check`] runs it
//! under its timeout and always produces a [`types::HealthCheckResult`];
//! failures, hangs and panics become `unhealthy` results, never errors.
//!
//! [`aggregator::HealthAggregator`] runs every registered probe concurrently
//! within a bounded wall-clock budget and classifies the overall status:
//!
//! | Probe kind | Unhealthy result                    |
//! |------------|-------------------------------------|
//! | Mandatory  | overall `unhealthy` (HTTP 503)      |
//! | Optional   | reported, overall unaffected        |
//! | Not configured | absent from the report          |

pub mod aggregator;
pub mod error;
pub mod probe;
pub mod probes;
pub mod types;

pub use aggregator::{HealthAggregator, HealthAggregatorBuilder};
pub use error::{HealthError, Result};
pub use probe::{check, Criticality, Probe, ProbeSpec};
pub use types::{HealthCheckResult, HealthReport, HealthStatus};
