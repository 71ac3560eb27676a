use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusimapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl BusimapError {
    /// Short error code string returned to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            BusimapError::Config(_) => "CONFIG_ERROR",
            BusimapError::InvalidSchedule(_) => "INVALID_SCHEDULE",
        }
    }
}

pub type Result<T> = std::result::Result<T, BusimapError>;
