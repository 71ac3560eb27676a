use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};

use crate::error::{HealthError, Result};
use crate::probe::Probe;

/// Opens the primary SQLite store read-only and runs `SELECT 1`.
pub struct DatastoreProbe {
    path: PathBuf,
}

impl DatastoreProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Probe for DatastoreProbe {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(HealthError::failure)?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(HealthError::failure)?;
            Ok(())
        })
        .await
        .map_err(HealthError::failure)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_database_passes() {
        let path = std::env::temp_dir().join(format!("busimap-probe-{}.db", std::process::id()));
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE IF NOT EXISTS t (x INTEGER);")
            .unwrap();

        let result = DatastoreProbe::new(&path).check().await;
        let _ = std::fs::remove_file(&path);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_database_fails() {
        let probe = DatastoreProbe::new("/nonexistent/dir/busimap.db");
        assert!(probe.check().await.is_err());
    }
}
