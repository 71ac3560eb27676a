use thiserror::Error;

/// Errors produced while probing a dependency.
///
/// Probe errors never escape [`crate::probe::check`]; they are rendered into
/// the `detail` of an unhealthy result.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The probe did not answer within its timeout.
    #[error("Probe timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The probe ran and reported a failure.
    #[error("{0}")]
    Failure(String),

    /// Two probes were registered under the same service name.
    #[error("Duplicate probe: {0}")]
    DuplicateProbe(String),
}

impl HealthError {
    pub fn failure(e: impl std::fmt::Display) -> Self {
        HealthError::Failure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HealthError>;
