use std::sync::Mutex;

use busimap_core::types::{SoftDelete, Timestamped, Timestamps};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{InstanceId, InstanceState, JobInstance};

const COLUMNS: &str = "id, job_name, payload, state, attempt_count, enqueued_at, due_at,
     last_error, result, created_at, updated_at, deleted_at";

/// SQLite-backed record of every job instance.
///
/// The scheduler writes through on each state change; the store is the
/// source of truth after a restart.
pub struct InstanceStore {
    db: Mutex<Connection>,
}

impl InstanceStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// A private in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Insert or update `instance`, bumping `updated_at`.
    pub fn save(&self, instance: &mut JobInstance) -> Result<()> {
        instance.touch();
        let payload = serde_json::to_string(&instance.payload)?;
        let result = instance
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO job_instances
             (id, job_name, payload, state, attempt_count, enqueued_at, due_at,
              last_error, result, created_at, updated_at, deleted_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                attempt_count = excluded.attempt_count,
                due_at = excluded.due_at,
                last_error = excluded.last_error,
                result = excluded.result,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at",
            params![
                instance.id.to_string(),
                instance.job_name,
                payload,
                instance.state.to_string(),
                instance.attempt_count as i64,
                ts(instance.enqueued_at),
                ts(instance.due_at),
                instance.last_error,
                result,
                ts(instance.timestamps.created_at),
                ts(instance.timestamps.updated_at),
                instance.deletion.deleted_at.map(ts),
            ],
        )?;
        debug!(instance_id = %instance.id, state = %instance.state, "instance saved");
        Ok(())
    }

    pub fn get(&self, id: InstanceId) -> Result<Option<JobInstance>> {
        let db = self.db.lock().unwrap();
        let raw = db
            .query_row(
                &format!("SELECT {COLUMNS} FROM job_instances WHERE id = ?1"),
                [id.to_string()],
                RawInstance::from_row,
            )
            .optional()?;
        raw.map(RawInstance::decode).transpose()
    }

    fn require(&self, id: InstanceId) -> Result<JobInstance> {
        self.get(id)?.ok_or_else(|| SchedulerError::InstanceNotFound {
            id: id.to_string(),
        })
    }

    /// Pending and running instances that are not archived, oldest due first.
    pub fn load_unfinished(&self) -> Result<Vec<JobInstance>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM job_instances
                 WHERE state IN ('pending', 'running') AND deleted_at IS NULL
                 ORDER BY due_at, id"
            ),
            params![],
        )
    }

    /// Most recently enqueued first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: usize, include_archived: bool) -> Result<Vec<JobInstance>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM job_instances
                 WHERE ?1 OR deleted_at IS NULL
                 ORDER BY enqueued_at DESC, id DESC
                 LIMIT ?2"
            ),
            params![include_archived, limit as i64],
        )
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<JobInstance>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawInstance::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawInstance::decode).collect()
    }

    // --- two-phase deletion ------------------------------------------------

    /// Archive a finished instance. Archiving twice is a no-op.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn mark_deleted(&self, id: InstanceId, at: DateTime<Utc>) -> Result<JobInstance> {
        let mut instance = self.require(id)?;
        if !instance.state.is_terminal() {
            return Err(SchedulerError::NotTerminal {
                id: id.to_string(),
                state: instance.state,
            });
        }
        if instance.deletion.mark(at) {
            self.save(&mut instance)?;
            info!("instance archived");
        }
        Ok(instance)
    }

    /// Undo [`mark_deleted`](Self::mark_deleted).
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn restore(&self, id: InstanceId) -> Result<JobInstance> {
        let mut instance = self.require(id)?;
        if !instance.deletion.restore() {
            return Err(SchedulerError::NotArchived { id: id.to_string() });
        }
        self.save(&mut instance)?;
        info!("instance restored");
        Ok(instance)
    }

    /// Irreversibly remove an archived instance.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn purge(&self, id: InstanceId) -> Result<()> {
        let instance = self.require(id)?;
        if !instance.deletion.is_deleted() {
            return Err(SchedulerError::NotArchived { id: id.to_string() });
        }
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM job_instances WHERE id = ?1", [id.to_string()])?;
        info!("instance purged");
        Ok(())
    }

    /// Remove every instance archived before `cutoff`. Returns the row count.
    pub fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM job_instances WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            [ts(cutoff)],
        )?;
        if n > 0 {
            info!(count = n, "archived instances purged");
        }
        Ok(n)
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Column values exactly as stored, decoded after the statement is done.
struct RawInstance {
    id: String,
    job_name: String,
    payload: String,
    state: String,
    attempt_count: i64,
    enqueued_at: String,
    due_at: String,
    last_error: Option<String>,
    result: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl RawInstance {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_name: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            attempt_count: row.get(4)?,
            enqueued_at: row.get(5)?,
            due_at: row.get(6)?,
            last_error: row.get(7)?,
            result: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            deleted_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<JobInstance> {
        let id = self.id.clone();
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            id: id.clone(),
            reason,
        };
        let time = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp {s:?}: {e}")))
        };

        Ok(JobInstance {
            id: self.id.parse().map_err(|e| corrupt(format!("bad id: {e}")))?,
            job_name: self.job_name,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| corrupt(format!("bad payload: {e}")))?,
            state: self.state.parse::<InstanceState>().map_err(corrupt)?,
            attempt_count: self.attempt_count as u32,
            enqueued_at: time(self.enqueued_at.as_str())?,
            due_at: time(self.due_at.as_str())?,
            last_error: self.last_error,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .map_err(|e| corrupt(format!("bad result: {e}")))?,
            timestamps: Timestamps {
                created_at: time(self.created_at.as_str())?,
                updated_at: time(self.updated_at.as_str())?,
            },
            deletion: SoftDelete {
                deleted_at: self.deleted_at.as_deref().map(time).transpose()?,
            },
        })
    }
}
