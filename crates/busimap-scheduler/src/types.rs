use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use busimap_core::types::{SoftDeletable, SoftDelete, Timestamped, Timestamps};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

// ---------------------------------------------------------------------------
// InstanceId
// ---------------------------------------------------------------------------

/// Time-ordered unique identifier of a job instance (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// InstanceState
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`JobInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    /// Retries exhausted, or the job is no longer registered.
    Dead,
}

impl InstanceState {
    /// `succeeded` and `dead` are final; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }

    /// Edges allowed during normal operation.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Failed, Pending)
                | (Failed, Dead)
                | (TimedOut, Pending)
                | (TimedOut, Dead)
        )
    }

    /// Extra edges allowed only while reloading persisted instances.
    pub fn can_recover_to(self, to: InstanceState) -> bool {
        use InstanceState::*;
        matches!((self, to), (Running, Pending) | (Pending, Dead))
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown instance state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// JobInstance
// ---------------------------------------------------------------------------

/// One concrete execution of a registered job, including its retries.
#[derive(Debug, Clone, Serialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub job_name: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest instant the instance may be dispatched.
    pub due_at: DateTime<Utc>,
    /// Number of retries already made; 0 on the first attempt.
    pub attempt_count: u32,
    pub state: InstanceState,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    #[serde(flatten)]
    pub timestamps: Timestamps,
    #[serde(flatten)]
    pub deletion: SoftDelete,
}

impl JobInstance {
    /// A new pending instance due at `now`.
    pub fn new(job_name: impl Into<String>, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::new(),
            job_name: job_name.into(),
            payload,
            enqueued_at: now,
            due_at: now,
            attempt_count: 0,
            state: InstanceState::Pending,
            last_error: None,
            result: None,
            timestamps: Timestamps::new(now),
            deletion: SoftDelete::default(),
        }
    }

    pub fn transition(&mut self, to: InstanceState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    /// Apply one of the recovery-only edges.
    pub fn recover_to(&mut self, to: InstanceState) -> Result<()> {
        if !self.state.can_recover_to(to) {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    fn invalid(&self, to: InstanceState) -> SchedulerError {
        SchedulerError::InvalidTransition {
            id: self.id.to_string(),
            from: self.state,
            to,
        }
    }
}

impl Timestamped for JobInstance {
    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }
    fn timestamps_mut(&mut self) -> &mut Timestamps {
        &mut self.timestamps
    }
}

impl SoftDeletable for JobInstance {
    fn deletion(&self) -> &SoftDelete {
        &self.deletion
    }
    fn deletion_mut(&mut self) -> &mut SoftDelete {
        &mut self.deletion
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy / Outcome
// ---------------------------------------------------------------------------

/// How many times a failed instance is re-queued and how long it waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retries
    }

    /// `backoff_base * 2^attempt_count`, saturating.
    pub fn backoff_for(&self, attempt_count: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// What the worker pool observed when a handler finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(Value),
    /// The handler returned an error or panicked.
    Failed { error: String },
    /// The hard timeout fired, or the handler failed after the soft timeout.
    TimedOut { after: Duration },
}

impl Outcome {
    pub fn state(&self) -> InstanceState {
        match self {
            Self::Succeeded(_) => InstanceState::Succeeded,
            Self::Failed { .. } => InstanceState::Failed,
            Self::TimedOut { .. } => InstanceState::TimedOut,
        }
    }
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enqueued,
    /// A required service was unhealthy; the instance was pushed back.
    Deferred,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
    Retrying,
    Dead,
    /// Reloaded from the store after a restart.
    Recovered,
}

/// Emitted on every instance state change.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub instance_id: InstanceId,
    pub job_name: String,
    pub state: InstanceState,
    pub attempt_count: u32,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: EventKind, instance: &JobInstance) -> Self {
        Self {
            kind,
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            state: instance.state,
            attempt_count: instance.attempt_count,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
