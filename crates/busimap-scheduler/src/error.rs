use thiserror::Error;

use crate::types::InstanceState;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job with this name is already registered.
    #[error("Duplicate job: {name}")]
    DuplicateJob { name: String },

    /// No job with this name is registered.
    #[error("Unknown job: {name}")]
    UnknownJob { name: String },

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The state machine does not allow this edge.
    #[error("Instance {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("Instance not found: {id}")]
    InstanceNotFound { id: String },

    /// Only finished instances can be archived.
    #[error("Instance {id} is {state}, not finished")]
    NotTerminal { id: String, state: InstanceState },

    /// Restore and purge apply to archived instances only.
    #[error("Instance {id} is not archived")]
    NotArchived { id: String },

    /// Configuration could not be loaded or applied.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A persisted row could not be decoded.
    #[error("Corrupt instance record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::DuplicateJob { .. } => "DUPLICATE_JOB",
            Self::UnknownJob { .. } => "UNKNOWN_JOB",
            Self::InvalidSchedule(_) => "INVALID_SCHEDULE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::NotTerminal { .. } => "NOT_TERMINAL",
            Self::NotArchived { .. } => "NOT_ARCHIVED",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<busimap_core::BusimapError> for SchedulerError {
    fn from(e: busimap_core::BusimapError) -> Self {
        match e {
            busimap_core::BusimapError::InvalidSchedule(msg) => Self::InvalidSchedule(msg),
            busimap_core::BusimapError::Config(msg) => Self::Config(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
