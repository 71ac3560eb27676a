use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use busimap_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::gate::DependencyGate;
use crate::pool::WorkerPool;
use crate::registry::{JobDefinition, JobRegistry};
use crate::schedule::{compute_next_run, first_fire};
use crate::store::InstanceStore;
use crate::types::{EventKind, InstanceId, InstanceState, JobEvent, JobInstance, Outcome};

/// Process-wide job scheduler.
///
/// Built once at startup and shared as `Arc<Scheduler>` with everything that
/// submits or inspects jobs. All queue and instance-state mutations go
/// through one internal mutex; handlers run on the [`WorkerPool`] and report
/// back through [`complete`](Self::complete).
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    store: Arc<InstanceStore>,
    pool: WorkerPool,
    gate: Option<Arc<dyn DependencyGate>>,
    events: Option<mpsc::Sender<JobEvent>>,
    tick_interval: Duration,
    admission_retry: Duration,
    wake: Notify,
    /// Cancelled once shutdown is requested; stops dispatch mid-tick.
    stop: CancellationToken,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    /// Next fire time per periodic job. Absent until the first tick arms it.
    periodic: HashMap<String, FireState>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    /// Every non-terminal instance, pending or running.
    active: HashMap<InstanceId, JobInstance>,
    /// Instances dispatched or reserved for dispatch, per job.
    running: HashMap<String, usize>,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
enum FireState {
    Next(DateTime<Utc>),
    Exhausted,
}

/// Ordered by due time, then by enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    due_at: DateTime<Utc>,
    seq: u64,
    id: InstanceId,
}

impl QueueState {
    fn push(&mut self, due_at: DateTime<Utc>, id: InstanceId) {
        self.seq += 1;
        self.queue.push(Reverse(QueueEntry {
            due_at,
            seq: self.seq,
            id,
        }));
    }

    fn enqueue(&mut self, instance: JobInstance) {
        self.push(instance.due_at, instance.id);
        self.active.insert(instance.id, instance);
    }

    fn has_active(&self, job: &str) -> bool {
        self.active.values().any(|i| i.job_name == job)
    }

    fn running_count(&self, job: &str) -> usize {
        self.running.get(job).copied().unwrap_or(0)
    }

    fn reserve(&mut self, job: &str) {
        *self.running.entry(job.to_string()).or_default() += 1;
    }

    fn release(&mut self, job: &str) {
        if let Some(n) = self.running.get_mut(job) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.running.remove(job);
            }
        }
    }
}

impl Scheduler {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<InstanceStore>, config: &SchedulerConfig) -> Self {
        Self {
            registry,
            store,
            pool: WorkerPool::new(config.workers),
            gate: None,
            events: None,
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            admission_retry: Duration::from_secs(config.admission_retry_secs),
            wake: Notify::new(),
            stop: CancellationToken::new(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Consult `gate` before admitting jobs that declare required services.
    pub fn with_gate(mut self, gate: Arc<dyn DependencyGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Send a [`JobEvent`] to `tx` on every state change. Sending never
    /// blocks; events are dropped with a warning when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<JobEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("scheduler state lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Queue one run of `job_name` for the next tick.
    pub fn submit(&self, job_name: &str, payload: Value) -> Result<InstanceId> {
        self.submit_at(job_name, payload, Utc::now())
    }

    /// Queue one run of `job_name` that is not dispatched before `due_at`.
    #[instrument(skip(self, payload))]
    pub fn submit_at(&self, job_name: &str, payload: Value, due_at: DateTime<Utc>) -> Result<InstanceId> {
        self.registry.resolve(job_name)?;

        let mut instance = JobInstance::new(job_name, payload, Utc::now());
        instance.due_at = due_at;
        self.store.save(&mut instance)?;

        let id = instance.id;
        self.emit(JobEvent::new(EventKind::Enqueued, &instance));
        self.state().enqueue(instance);
        self.wake.notify_one();
        info!(instance_id = %id, "job submitted");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Fire due periodic jobs and dispatch every admitted instance with
    /// `due_at <= now`. Returns the instances moved to `running`.
    ///
    /// Waits for a free pool slot before each dispatch, so a saturated pool
    /// holds the tick back rather than piling up work. Once shutdown is
    /// requested the wait is abandoned and undispatched instances go back
    /// to the queue.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<JobInstance>> {
        let candidates = {
            let mut st = self.state();
            self.fire_periodic(&mut st, now)?;
            self.take_due(&mut st, now)
        };

        let mut dispatched = Vec::with_capacity(candidates.len());
        // Service availability, asked of the gate at most once per tick.
        let mut service_up = HashMap::new();
        let mut candidates = candidates.into_iter();
        while let Some((id, def)) = candidates.next() {
            if !self.admit(id, &def, now, &mut service_up).await {
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                permit = self.pool.acquire() => Some(permit),
            };
            let Some(permit) = permit else {
                self.requeue(std::iter::once((id, def)).chain(candidates));
                debug!("shutdown requested, remaining instances left queued");
                break;
            };
            match self.start(id, &def, permit) {
                Ok(Some(instance)) => dispatched.push(instance),
                Ok(None) => {}
                Err(e) => error!(job = %def.name, instance_id = %id, "dispatch failed: {e}"),
            }
        }
        Ok(dispatched)
    }

    fn fire_periodic(&self, st: &mut QueueState, now: DateTime<Utc>) -> Result<()> {
        for def in self.registry.definitions() {
            let Some(ref schedule) = def.schedule else {
                continue;
            };
            let due = match st.periodic.get(&def.name) {
                None => first_fire(schedule, now),
                Some(FireState::Next(t)) => Some(*t),
                Some(FireState::Exhausted) => continue,
            };
            let Some(due) = due else {
                st.periodic.insert(def.name.clone(), FireState::Exhausted);
                continue;
            };
            if due > now {
                st.periodic.insert(def.name.clone(), FireState::Next(due));
                continue;
            }

            // Computed from `now`, so fire times missed while down are skipped.
            let next = compute_next_run(schedule, now);
            st.periodic.insert(
                def.name.clone(),
                next.map_or(FireState::Exhausted, FireState::Next),
            );

            if !def.reentrant && st.has_active(&def.name) {
                debug!(job = %def.name, "previous instance still active, skipping periodic fire");
                continue;
            }

            let mut instance = JobInstance::new(def.name.as_str(), json!({}), now);
            self.store.save(&mut instance)?;
            debug!(job = %def.name, instance_id = %instance.id, next = ?next, "periodic job fired");
            self.emit(JobEvent::new(EventKind::Enqueued, &instance));
            st.enqueue(instance);
        }
        Ok(())
    }

    /// Pop due entries and reserve a run slot for each one that may start.
    fn take_due(
        &self,
        st: &mut QueueState,
        now: DateTime<Utc>,
    ) -> Vec<(InstanceId, Arc<JobDefinition>)> {
        let mut held = Vec::new();
        let mut out = Vec::new();

        while st.queue.peek().is_some_and(|Reverse(e)| e.due_at <= now) {
            let Some(Reverse(entry)) = st.queue.pop() else {
                break;
            };
            let Some(instance) = st.active.get(&entry.id) else {
                continue;
            };
            if instance.state != InstanceState::Pending {
                continue;
            }
            let job_name = instance.job_name.clone();

            let def = match self.registry.resolve(&job_name) {
                Ok(def) => def,
                Err(e) => {
                    if let Err(e) = self.bury_unregistered(st, entry.id, &e) {
                        error!(instance_id = %entry.id, "failed to bury instance: {e}");
                    }
                    continue;
                }
            };

            if !def.reentrant && st.running_count(&job_name) > 0 {
                held.push(entry);
                continue;
            }
            st.reserve(&job_name);
            out.push((entry.id, def));
        }

        for entry in held {
            st.queue.push(Reverse(entry));
        }
        out
    }

    /// Drop the run reservations taken by [`take_due`](Self::take_due) and
    /// put the instances back in the queue.
    fn requeue(&self, candidates: impl IntoIterator<Item = (InstanceId, Arc<JobDefinition>)>) {
        let mut st = self.state();
        for (id, def) in candidates {
            st.release(&def.name);
            if let Some(due_at) = st.active.get(&id).map(|i| i.due_at) {
                st.push(due_at, id);
            }
        }
    }

    /// Returns false and pushes the instance back when a required service
    /// is down. `service_up` caches gate answers for the current tick.
    async fn admit(
        &self,
        id: InstanceId,
        def: &JobDefinition,
        now: DateTime<Utc>,
        service_up: &mut HashMap<String, bool>,
    ) -> bool {
        if def.requires.is_empty() {
            return true;
        }
        let Some(ref gate) = self.gate else {
            return true;
        };

        let unchecked: Vec<String> = def
            .requires
            .iter()
            .filter(|s| !service_up.contains_key(s.as_str()))
            .cloned()
            .collect();
        if !unchecked.is_empty() {
            let unavailable = gate.unavailable(&unchecked).await;
            for service in unchecked {
                let up = !unavailable.contains(&service);
                service_up.insert(service, up);
            }
        }

        let down: Vec<String> = def
            .requires
            .iter()
            .filter(|s| service_up.get(s.as_str()) == Some(&false))
            .cloned()
            .collect();
        if down.is_empty() {
            return true;
        }

        let retry_at = later(now, self.admission_retry);
        let mut st = self.state();
        st.release(&def.name);
        if let Some(instance) = st.active.get_mut(&id) {
            instance.due_at = retry_at;
            if let Err(e) = self.store.save(instance) {
                error!(instance_id = %id, "failed to persist deferral: {e}");
            }
            let detail = format!("waiting for {}", down.join(", "));
            warn!(job = %def.name, instance_id = %id, %detail, "dispatch deferred");
            self.emit(JobEvent::new(EventKind::Deferred, instance).with_detail(detail));
        }
        st.push(retry_at, id);
        false
    }

    /// Persist the `running` state, then hand the instance to the pool.
    fn start(
        self: &Arc<Self>,
        id: InstanceId,
        def: &Arc<JobDefinition>,
        permit: OwnedSemaphorePermit,
    ) -> Result<Option<JobInstance>> {
        let running = {
            let mut st = self.state();
            let Some(mut running) = st.active.get(&id).cloned() else {
                st.release(&def.name);
                return Ok(None);
            };
            if let Err(e) = running.transition(InstanceState::Running) {
                st.release(&def.name);
                return Err(e);
            }
            if let Err(e) = self.store.save(&mut running) {
                // Not durably running yet; leave it pending for the next tick.
                st.release(&def.name);
                st.push(running.due_at, id);
                return Err(e);
            }
            st.active.insert(id, running.clone());
            running
        };

        info!(
            job = %running.job_name,
            instance_id = %id,
            attempt = running.attempt_count + 1,
            "job dispatched"
        );
        self.emit(JobEvent::new(EventKind::Dispatched, &running));

        let this = Arc::clone(self);
        let def = Arc::clone(def);
        let instance = running.clone();
        tokio::spawn(async move {
            let outcome = this.pool.execute(permit, &instance, &def).await;
            if let Err(e) = this.complete(instance.id, outcome) {
                error!(instance_id = %instance.id, "failed to record job completion: {e}");
            }
        });

        Ok(Some(running))
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Record the outcome of a running instance and apply the retry policy.
    ///
    /// Success is persisted only here, after the handler returned, so an
    /// instance lost with its worker is still `running` in the store and
    /// gets redelivered by [`recover`](Self::recover).
    ///
    /// The in-memory queue always moves on, even when persisting fails: the
    /// error is returned, the stored row stays `running`, and the instance
    /// is redelivered after a restart.
    pub fn complete(&self, id: InstanceId, outcome: Outcome) -> Result<JobInstance> {
        let now = Utc::now();
        let mut st = self.state();
        let mut instance = st
            .active
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::InstanceNotFound { id: id.to_string() })?;
        instance.transition(outcome.state())?;
        st.release(&instance.job_name);

        match outcome {
            Outcome::Succeeded(value) => {
                instance.result = Some(value);
                instance.last_error = None;
                let saved = self.store.save(&mut instance);
                st.active.remove(&id);
                info!(job = %instance.job_name, instance_id = %id, "job succeeded");
                self.emit(JobEvent::new(EventKind::Succeeded, &instance));
                saved.map(|()| instance)
            }
            Outcome::Failed { error } => {
                warn!(job = %instance.job_name, instance_id = %id, %error, "job failed");
                instance.last_error = Some(error.clone());
                self.emit(JobEvent::new(EventKind::Failed, &instance).with_detail(error));
                self.retry_or_bury(&mut st, instance, now)
            }
            Outcome::TimedOut { after } => {
                let error = format!("timed out after {}ms", after.as_millis());
                warn!(job = %instance.job_name, instance_id = %id, %error, "job timed out");
                instance.last_error = Some(error.clone());
                self.emit(JobEvent::new(EventKind::TimedOut, &instance).with_detail(error));
                self.retry_or_bury(&mut st, instance, now)
            }
        }
    }

    fn retry_or_bury(
        &self,
        st: &mut QueueState,
        mut instance: JobInstance,
        now: DateTime<Utc>,
    ) -> Result<JobInstance> {
        let id = instance.id;
        let retry = self
            .registry
            .resolve(&instance.job_name)
            .map(|d| d.retry)
            .unwrap_or_default();

        if retry.should_retry(instance.attempt_count) {
            let backoff = retry.backoff_for(instance.attempt_count);
            instance.attempt_count += 1;
            instance.transition(InstanceState::Pending)?;
            instance.due_at = later(now, backoff);
            let saved = self.store.save(&mut instance);
            warn!(
                job = %instance.job_name,
                instance_id = %id,
                attempt = instance.attempt_count,
                backoff_secs = backoff.as_secs(),
                "job will be retried"
            );
            self.emit(
                JobEvent::new(EventKind::Retrying, &instance)
                    .with_detail(format!("retry in {}s", backoff.as_secs())),
            );
            st.push(instance.due_at, id);
            st.active.insert(id, instance.clone());
            self.wake.notify_one();
            saved?;
        } else {
            instance.transition(InstanceState::Dead)?;
            let saved = self.store.save(&mut instance);
            st.active.remove(&id);
            error!(
                job = %instance.job_name,
                instance_id = %id,
                attempts = instance.attempt_count + 1,
                error = instance.last_error.as_deref().unwrap_or(""),
                "job dead, retries exhausted"
            );
            let mut event = JobEvent::new(EventKind::Dead, &instance);
            event.detail = instance.last_error.clone();
            self.emit(event);
            saved?;
        }
        Ok(instance)
    }

    fn bury_unregistered(&self, st: &mut QueueState, id: InstanceId, cause: &SchedulerError) -> Result<()> {
        let Some(mut instance) = st.active.remove(&id) else {
            return Ok(());
        };
        if instance.state == InstanceState::Running {
            instance.recover_to(InstanceState::Pending)?;
        }
        instance.recover_to(InstanceState::Dead)?;
        instance.last_error = Some(cause.to_string());
        self.store.save(&mut instance)?;
        error!(job = %instance.job_name, instance_id = %id, "job no longer registered, instance dead");
        self.emit(JobEvent::new(EventKind::Dead, &instance).with_detail(cause.to_string()));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery and main loop
    // -----------------------------------------------------------------------

    /// Reload unfinished instances from the store after a restart.
    ///
    /// Instances that were `running` are redelivered immediately; instances of
    /// jobs that are no longer registered are moved to `dead`. Returns the
    /// number of instances put back in the queue.
    pub fn recover(&self) -> Result<usize> {
        let now = Utc::now();
        let unfinished = self.store.load_unfinished()?;
        let mut st = self.state();
        let mut requeued = 0;

        for mut instance in unfinished {
            if st.active.contains_key(&instance.id) {
                continue;
            }
            if let Err(e) = self.registry.resolve(&instance.job_name) {
                let id = instance.id;
                st.active.insert(id, instance);
                self.bury_unregistered(&mut st, id, &e)?;
                continue;
            }
            if instance.state == InstanceState::Running {
                instance.recover_to(InstanceState::Pending)?;
                instance.due_at = now;
                self.store.save(&mut instance)?;
                warn!(
                    job = %instance.job_name,
                    instance_id = %instance.id,
                    "redelivering instance interrupted by shutdown"
                );
            }
            self.emit(JobEvent::new(EventKind::Recovered, &instance));
            st.enqueue(instance);
            requeued += 1;
        }

        if requeued > 0 {
            info!(count = requeued, "unfinished instances recovered");
        }
        Ok(requeued)
    }

    /// Main loop: recover, then tick every `tick_interval_secs` (or as soon
    /// as a job is submitted) until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.pool.size(), jobs = self.registry.len(), "scheduler started");
        if let Err(e) = self.recover() {
            error!("instance recovery failed: {e}");
        }

        // A tick blocked on a saturated pool still sees the shutdown request.
        let stop = self.stop.clone();
        tokio::spawn(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            stop.cancel();
        });

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.tick(Utc::now()).await {
                error!("scheduler tick error: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inspection and two-phase deletion
    // -----------------------------------------------------------------------

    /// Next fire time of a periodic job, once the first tick has armed it.
    pub fn next_fire(&self, job_name: &str) -> Option<DateTime<Utc>> {
        match self.state().periodic.get(job_name) {
            Some(FireState::Next(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn instance(&self, id: InstanceId) -> Result<JobInstance> {
        if let Some(instance) = self.state().active.get(&id) {
            return Ok(instance.clone());
        }
        self.store
            .get(id)?
            .ok_or_else(|| SchedulerError::InstanceNotFound { id: id.to_string() })
    }

    pub fn list_instances(&self, limit: usize, include_archived: bool) -> Result<Vec<JobInstance>> {
        self.store.list(limit, include_archived)
    }

    /// Reversibly hide a finished instance record.
    pub fn archive(&self, id: InstanceId) -> Result<JobInstance> {
        self.store.mark_deleted(id, Utc::now())
    }

    pub fn restore(&self, id: InstanceId) -> Result<JobInstance> {
        self.store.restore(id)
    }

    /// Irreversibly delete an archived instance record.
    pub fn purge(&self, id: InstanceId) -> Result<()> {
        self.store.purge(id)
    }

    pub fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.store.purge_archived_before(cutoff)
    }

    fn emit(&self, event: JobEvent) {
        if let Some(ref tx) = self.events {
            if tx.try_send(event).is_err() {
                warn!("job event channel full or closed, event dropped");
            }
        }
    }
}

fn later(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::types::RetryPolicy;
    use busimap_core::types::Schedule;
    use chrono::TimeZone;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            workers: 2,
            admission_retry_secs: 30,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(defs: Vec<JobDefinition>) -> Arc<Scheduler> {
        let mut reg = JobRegistry::new();
        for d in defs {
            reg.register(d).unwrap();
        }
        Arc::new(Scheduler::new(
            Arc::new(reg),
            Arc::new(InstanceStore::in_memory().unwrap()),
            &config(),
        ))
    }

    fn noop(name: &str) -> JobDefinition {
        JobDefinition::new(name, handler_fn(|_| async { Ok(Value::Null) }))
    }

    #[test]
    fn submit_unknown_job_fails() {
        let s = scheduler(vec![]);
        let err = s.submit("nope", Value::Null).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownJob { ref name } if name == "nope"));
    }

    #[test]
    fn submitted_instance_is_pending_and_persisted() {
        let s = scheduler(vec![noop("echo")]);
        let id = s.submit("echo", json!({"a": 1})).unwrap();
        let i = s.instance(id).unwrap();
        assert_eq!(i.state, InstanceState::Pending);
        assert_eq!(s.list_instances(10, false).unwrap().len(), 1);
    }

    #[test]
    fn complete_on_pending_instance_is_rejected() {
        let s = scheduler(vec![noop("echo")]);
        let id = s.submit("echo", Value::Null).unwrap();
        let err = s.complete(id, Outcome::Succeeded(Value::Null)).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn stopped_tick_returns_candidates_to_the_queue() {
        let s = scheduler(vec![noop("echo").reentrant(true)]);
        let _a = s.pool().acquire().await;
        let _b = s.pool().acquire().await;
        let ids = [
            s.submit("echo", Value::Null).unwrap(),
            s.submit("echo", Value::Null).unwrap(),
        ];

        s.stop.cancel();
        assert!(s.tick(Utc::now()).await.unwrap().is_empty());

        let st = s.state();
        assert_eq!(st.running_count("echo"), 0);
        assert_eq!(st.queue.len(), 2);
        for id in ids {
            assert_eq!(st.active[&id].state, InstanceState::Pending);
        }
    }

    #[tokio::test]
    async fn future_submission_waits_for_due_time() {
        let s = scheduler(vec![noop("echo")]);
        let t0 = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        s.submit_at("echo", Value::Null, t0).unwrap();
        assert!(s.tick(t0 - chrono::Duration::seconds(1)).await.unwrap().is_empty());
        assert_eq!(s.tick(t0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn once_schedule_fires_a_single_time() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
        let s = scheduler(vec![noop("once")
            .schedule(Schedule::Once { at })
            .reentrant(true)]);
        assert!(s.tick(at - chrono::Duration::minutes(1)).await.unwrap().is_empty());
        assert_eq!(s.next_fire("once"), Some(at));
        assert_eq!(s.tick(at).await.unwrap().len(), 1);
        assert!(s.tick(at + chrono::Duration::days(1)).await.unwrap().is_empty());
        assert_eq!(s.next_fire("once"), None);
    }

    #[tokio::test]
    async fn non_reentrant_queue_runs_one_at_a_time() {
        let s = scheduler(vec![JobDefinition::new(
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        )]);
        s.submit("slow", Value::Null).unwrap();
        s.submit("slow", Value::Null).unwrap();

        let now = Utc::now();
        assert_eq!(s.tick(now).await.unwrap().len(), 1);
        // The second one stays queued while the first is running.
        assert!(s.tick(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_uses_exponential_backoff() {
        let s = scheduler(vec![noop("flaky").retry(RetryPolicy::new(3, Duration::from_secs(60)))]);
        let id = s.submit("flaky", Value::Null).unwrap();
        {
            // Move to running by hand so the handler does not race the test.
            let mut st = s.state();
            let i = st.active.get_mut(&id).unwrap();
            i.transition(InstanceState::Running).unwrap();
            st.queue.clear();
            st.reserve("flaky");
        }

        let before = Utc::now();
        let i = s
            .complete(id, Outcome::Failed { error: "boom".into() })
            .unwrap();
        assert_eq!(i.state, InstanceState::Pending);
        assert_eq!(i.attempt_count, 1);
        assert_eq!(i.last_error.as_deref(), Some("boom"));
        assert!(i.due_at >= before + chrono::Duration::seconds(60));
        assert!(i.due_at <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[test]
    fn later_saturates() {
        let now = Utc::now();
        assert_eq!(later(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(later(now, Duration::from_secs(1)), now + chrono::Duration::seconds(1));
    }
}
