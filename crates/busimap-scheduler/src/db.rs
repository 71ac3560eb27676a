use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job instance schema in `conn`.
///
/// Safe to call on every startup. Timestamps are fixed-width RFC 3339 UTC
/// strings so that text comparison matches time order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_instances (
            id            TEXT    NOT NULL PRIMARY KEY,
            job_name      TEXT    NOT NULL,
            payload       TEXT    NOT NULL,   -- JSON
            state         TEXT    NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            enqueued_at   TEXT    NOT NULL,
            due_at        TEXT    NOT NULL,
            last_error    TEXT,
            result        TEXT,               -- JSON or NULL
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL,
            deleted_at    TEXT                -- set when archived
        ) STRICT;

        -- Recovery scan: unfinished, not archived.
        CREATE INDEX IF NOT EXISTS idx_job_instances_state
            ON job_instances (state, deleted_at);
        CREATE INDEX IF NOT EXISTS idx_job_instances_enqueued
            ON job_instances (enqueued_at DESC);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM job_instances", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
