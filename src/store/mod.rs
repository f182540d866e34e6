//! Tracking database with SQLite
//!
//! Holds the tracking table the reconciler merges into, the run log, and
//! (for the local backend) per-project checkpoints.

mod checkpoint;
mod schema;

use anyhow::{bail, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::detect::Status;
use crate::reconcile::{KeyMode, MergePlan, TrackingRow};

pub use checkpoint::SqliteCheckpoints;
pub use schema::SCHEMA;

pub struct TrackingStore {
    conn: Connection,
}

impl TrackingStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening tracking database {}", path.display()))?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ============================================
    // META
    // ============================================

    /// Record the key mode on first use and refuse to mix modes afterwards
    pub fn ensure_key_mode(&self, mode: KeyMode) -> Result<()> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'key_mode'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(existing) if existing == mode.as_str() => Ok(()),
            Some(existing) => bail!(
                "tracking table uses key_mode '{}' but '{}' is configured",
                existing,
                mode.as_str()
            ),
            None => {
                self.conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('key_mode', ?)",
                    params![mode.as_str()],
                )?;
                debug!(key_mode = mode.as_str(), "recorded key mode");
                Ok(())
            }
        }
    }

    // ============================================
    // TRACKING ROWS
    // ============================================

    /// Full snapshot of the tracking table
    pub fn read_all(&self) -> Result<Vec<TrackingRow>> {
        self.select_rows(None, None)
    }

    /// Dedup digests of every recorded row
    pub fn recorded_digests(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT row_digest FROM tracking_rows")?;
        let digests = stmt.query_map([], |row| row.get(0))?;
        digests.collect::<Result<HashSet<_>, _>>().map_err(Into::into)
    }

    /// Rows filtered by project and/or status, most recent change first
    pub fn list_rows(&self, project: Option<&str>, status: Option<Status>) -> Result<Vec<TrackingRow>> {
        self.select_rows(project, status)
    }

    fn select_rows(&self, project: Option<&str>, status: Option<Status>) -> Result<Vec<TrackingRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT project_id, project_name, entity_id, name, fingerprint, version,
                      node_type, changed_on, contributor_id, contributor, status, annotations
               FROM tracking_rows
               WHERE (?1 IS NULL OR project_id = ?1)
                 AND (?2 IS NULL OR status = ?2)
               ORDER BY changed_on DESC, entity_id"#,
        )?;

        let rows = stmt.query_map(params![project, status.map(|s| s.as_str())], |row| {
            let status: String = row.get(10)?;
            let status = status.parse::<Status>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(10, Type::Text, e.into())
            })?;
            let annotations: String = row.get(11)?;
            let annotations: BTreeMap<String, String> = serde_json::from_str(&annotations)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

            Ok(TrackingRow {
                project_id: row.get(0)?,
                project_name: row.get(1)?,
                entity_id: row.get(2)?,
                name: row.get(3)?,
                fingerprint: row.get(4)?,
                version: row.get(5)?,
                node_type: row.get(6)?,
                changed_on: row.get(7)?,
                contributor_id: row.get(8)?,
                contributor: row.get(9)?,
                status,
                annotations,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Apply a merge plan as one delete-then-insert transaction.
    ///
    /// Any failure rolls the whole plan back.
    pub fn apply(&self, plan: &MergePlan, mode: KeyMode) -> Result<MergeStats> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("starting merge transaction")?;

        let mut stats = MergeStats::default();
        for row in &plan.deletes {
            stats.deleted += tx
                .execute(
                    "DELETE FROM tracking_rows WHERE pk = ?",
                    params![row.primary_key(mode).encode()],
                )
                .with_context(|| format!("deleting tracking row for {}", row.entity_id))?;
        }

        for row in &plan.inserts {
            let annotations = serde_json::to_string(&row.annotations)?;
            tx.execute(
                r#"INSERT INTO tracking_rows
                   (pk, row_digest, project_id, project_name, entity_id, name, fingerprint,
                    version, node_type, changed_on, contributor_id, contributor, status, annotations)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    row.primary_key(mode).encode(),
                    row.dedup_key(mode).digest(),
                    row.project_id,
                    row.project_name,
                    row.entity_id,
                    row.name,
                    row.fingerprint,
                    row.version,
                    row.node_type,
                    row.changed_on,
                    row.contributor_id,
                    row.contributor,
                    row.status.as_str(),
                    annotations,
                ],
            )
            .with_context(|| format!("inserting tracking row for {}", row.entity_id))?;
            stats.inserted += 1;
        }

        tx.commit().context("committing merge")?;
        info!(
            deleted = stats.deleted,
            inserted = stats.inserted,
            "tracking table updated"
        );
        Ok(stats)
    }

    // ============================================
    // RUN LOG
    // ============================================

    pub fn begin_run(&self, run_id: &str, projects: &[String], started_at: i64, dry_run: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_runs (id, started_at, dry_run, projects) VALUES (?, ?, ?, ?)",
            params![run_id, started_at, dry_run, serde_json::to_string(projects)?],
        )?;
        Ok(())
    }

    pub fn finish_run(&self, run_id: &str, outcome: &RunOutcome) -> Result<()> {
        let updated = self.conn.execute(
            r#"UPDATE audit_runs
               SET finished_at = ?, status = ?, entity_count = ?, new_count = ?,
                   updated_count = ?, inserted = ?, deleted = ?, failures = ?, error = ?
               WHERE id = ?"#,
            params![
                outcome.finished_at,
                outcome.status.as_str(),
                outcome.entity_count as i64,
                outcome.new_count as i64,
                outcome.updated_count as i64,
                outcome.merge.inserted as i64,
                outcome.merge.deleted as i64,
                serde_json::to_string(&outcome.failures)?,
                outcome.error,
                run_id,
            ],
        )?;
        if updated == 0 {
            bail!("no run with id {}", run_id);
        }
        Ok(())
    }

    /// Most recent runs first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, started_at, finished_at, status, dry_run, projects, entity_count,
                      new_count, updated_count, inserted, deleted, failures, error
               FROM audit_runs
               ORDER BY started_at DESC
               LIMIT ?"#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                started_at: row.get(1)?,
                finished_at: row.get(2)?,
                status: row.get(3)?,
                dry_run: row.get(4)?,
                projects: json_list(row, 5)?,
                entity_count: row.get(6)?,
                new_count: row.get(7)?,
                updated_count: row.get(8)?,
                inserted: row.get(9)?,
                deleted: row.get(10)?,
                failures: json_list(row, 11)?,
                error: row.get(12)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn json_list(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ============================================
// ROW TYPES
// ============================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub deleted: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    /// Finished, but some projects failed
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub finished_at: i64,
    pub status: RunStatus,
    pub entity_count: usize,
    pub new_count: usize,
    pub updated_count: usize,
    pub merge: MergeStats,
    pub failures: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RunRow {
    pub id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: String,
    pub dry_run: bool,
    pub projects: Vec<String>,
    pub entity_count: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub inserted: i64,
    pub deleted: i64,
    pub failures: Vec<String>,
    pub error: Option<String>,
}
