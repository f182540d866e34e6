//! Checkpoints kept in the tracking database instead of on the remote project

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::SCHEMA;
use crate::source::{CheckpointError, CheckpointStore};

pub struct SqliteCheckpoints {
    conn: Mutex<Connection>,
}

impl SqliteCheckpoints {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CheckpointError> {
        self.conn
            .lock()
            .map_err(|_| CheckpointError::Store("checkpoint connection poisoned".to_string()))
    }
}

fn store_error(e: rusqlite::Error) -> CheckpointError {
    CheckpointError::Store(e.to_string())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpoints {
    async fn get_checkpoint(&self, project_id: &str) -> Result<Option<i64>, CheckpointError> {
        self.conn()?
            .query_row(
                "SELECT value FROM checkpoints WHERE project_id = ?",
                params![project_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_error)
    }

    async fn set_checkpoint(
        &self,
        project_id: &str,
        timestamp: i64,
    ) -> Result<(), CheckpointError> {
        self.conn()?
            .execute(
                r#"INSERT INTO checkpoints (project_id, value, updated_at)
                   VALUES (?, ?, datetime('now'))
                   ON CONFLICT(project_id) DO UPDATE SET
                       value = excluded.value,
                       updated_at = datetime('now')"#,
                params![project_id, timestamp],
            )
            .map_err(store_error)?;
        Ok(())
    }
}
