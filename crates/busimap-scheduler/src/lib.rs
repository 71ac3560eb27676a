//! `busimap-scheduler`: background job registry, scheduler and worker pool.
//!
//! # Overview
//!
//! Jobs are registered by name in a [`registry::JobRegistry`] at one explicit
//! startup point. The [`engine::Scheduler`] owns the queue of
//! [`types::JobInstance`]s: every tick it fires due periodic jobs, admits
//! queued instances whose required services are healthy, and hands them to
//! the bounded [`pool::WorkerPool`]. Instance state is written to SQLite
//! before the handler starts and again after it finishes, so an instance
//! that was running when the process died is redelivered on restart.
//!
//! # Instance lifecycle
//!
//! ```text
//! pending ──► running ──► succeeded
//!    ▲           │
//!    │           ├──► failed ────┐
//!    │           └──► timed_out ─┤
//!    └──── retry (backoff) ◄─────┤
//!                                └──► dead
//! ```
//!
//! # Schedule variants
//!
//! | Variant    | First fire                 | Next fire                      |
//! |------------|----------------------------|--------------------------------|
//! | `Once`     | at the instant, if future  | never                          |
//! | `Interval` | on the first tick          | N seconds after the fire tick  |
//! | `Daily`    | next HH:MM UTC             | next HH:MM UTC                 |
//! | `Weekly`   | next weekday HH:MM UTC     | seven days later               |
//! | `Cron`     | next matching instant      | next matching instant          |
//!
//! Missed fire times are never backfilled.

pub mod db;
pub mod engine;
pub mod error;
pub mod gate;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use gate::DependencyGate;
pub use handler::{handler_fn, JobContext, JobHandler};
pub use pool::WorkerPool;
pub use registry::{JobDefinition, JobRegistry};
pub use store::InstanceStore;
pub use types::{EventKind, InstanceId, InstanceState, JobEvent, JobInstance, Outcome, RetryPolicy};
