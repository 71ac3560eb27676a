use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use busimap_core::types::Schedule;
use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::handler::JobHandler;
use crate::schedule;
use crate::types::RetryPolicy;

/// A named unit of background work. Immutable once registered.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
    /// `None` for jobs that only run when submitted.
    pub schedule: Option<Schedule>,
    pub soft_timeout: Option<Duration>,
    pub hard_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Allow more than one active instance at a time.
    pub reentrant: bool,
    /// Probe names that must report healthy before an instance is admitted.
    pub requires: Vec<String>,
}

impl JobDefinition {
    /// An on-demand job with no timeouts and no retries.
    pub fn new(name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            schedule: None,
            soft_timeout: None,
            hard_timeout: None,
            retry: RetryPolicy::default(),
            reentrant: false,
            requires: Vec::new(),
        }
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn soft_timeout(mut self, d: Duration) -> Self {
        self.soft_timeout = Some(d);
        self
    }

    pub fn hard_timeout(mut self, d: Duration) -> Self {
        self.hard_timeout = Some(d);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    pub fn requires<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = services.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("soft_timeout", &self.soft_timeout)
            .field("hard_timeout", &self.hard_timeout)
            .field("retry", &self.retry)
            .field("reentrant", &self.reentrant)
            .field("requires", &self.requires)
            .finish()
    }
}

/// Name → definition map, filled once at startup and then shared read-only.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. Names are unique; schedules are validated here so
    /// the scheduler never meets an unparseable one.
    pub fn register(&mut self, def: JobDefinition) -> Result<()> {
        if self.jobs.contains_key(&def.name) {
            return Err(SchedulerError::DuplicateJob { name: def.name });
        }
        if let Some(ref s) = def.schedule {
            schedule::validate(s)?;
        }
        info!(job = %def.name, periodic = def.schedule.is_some(), "job registered");
        self.jobs.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<JobDefinition>> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// All definitions sorted by name.
    pub fn definitions(&self) -> Vec<Arc<JobDefinition>> {
        let mut defs: Vec<_> = self.jobs.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::Value;

    fn noop(name: &str) -> JobDefinition {
        JobDefinition::new(name, handler_fn(|_| async { Ok(Value::Null) }))
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = JobRegistry::new();
        reg.register(noop("ping")).unwrap();
        let err = reg.register(noop("ping")).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob { ref name } if name == "ping"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unknown_name_fails_to_resolve() {
        let reg = JobRegistry::new();
        let err = reg.resolve("missing").unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_JOB");
    }

    #[test]
    fn invalid_schedule_is_rejected_at_registration() {
        let mut reg = JobRegistry::new();
        let def = noop("bad").schedule(Schedule::Interval { every_secs: 0 });
        assert!(matches!(
            reg.register(def),
            Err(SchedulerError::InvalidSchedule(_))
        ));
        assert!(!reg.contains("bad"));
    }

    #[test]
    fn out_of_range_interval_is_rejected_at_registration() {
        let mut reg = JobRegistry::new();
        for (name, every_secs) in [("big", 10_000_000_000_000_000), ("max", u64::MAX)] {
            let def = noop(name).schedule(Schedule::Interval { every_secs });
            let err = reg.register(def).unwrap_err();
            assert_eq!(err.code(), "INVALID_SCHEDULE");
            assert!(!reg.contains(name));
        }
    }

    #[test]
    fn definitions_are_sorted() {
        let mut reg = JobRegistry::new();
        reg.register(noop("b")).unwrap();
        reg.register(noop("a")).unwrap();
        let names: Vec<_> = reg.definitions().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
