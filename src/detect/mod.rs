//! Change detector
//!
//! One pass over one project:
//!   1. prepare - resolve the project's display name and effective checkpoint
//!   2. scan    - query everything past the checkpoint, drop structure and
//!                unidentifiable rows, classify the rest
//!   3. advance - persist the pass start as the new checkpoint (optional)
//!
//! Passes over different projects share nothing but the read-only
//! [`TrackingIndex`]; [`pool`] runs them side by side.

mod checkpoint;
mod classify;
mod entity;
pub mod pool;

pub use checkpoint::{
    days_before, days_to_ms, next_checkpoint, resolve, CheckpointOrigin, CheckpointOutcome, ResolvedCheckpoint,
    DAY_MS,
};
pub use classify::{Status, TrackingIndex};
pub use entity::{Entity, Fingerprint, NodeType};

use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::reconcile::TrackingRow;
use crate::source::{
    CheckpointError, CheckpointStore, EntityQuery, EntitySource, ProjectInfo, SourceError,
    TimestampField,
};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("reading checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("project query timed out after {0:?}")]
    Timeout(Duration),
}

impl DetectError {
    pub fn is_transient(&self) -> bool {
        match self {
            DetectError::Source(e) => e.is_transient(),
            DetectError::Checkpoint(CheckpointError::Source(e)) => e.is_transient(),
            DetectError::Checkpoint(_) => false,
            DetectError::Timeout(_) => true,
        }
    }

    /// Wait the repository asked for before the next request, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DetectError::Source(SourceError::RateLimited { retry_after_secs })
            | DetectError::Checkpoint(CheckpointError::Source(SourceError::RateLimited {
                retry_after_secs,
            })) => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

/// Detection policy shared by every pass of a run
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    pub field: TimestampField,
    pub lookback_ms: i64,
    pub annotation_fields: Vec<String>,
    pub ignore_names: Vec<String>,
    pub update_checkpoint: bool,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            field: TimestampField::Modified,
            lookback_ms: days_to_ms(1.1),
            annotation_fields: Vec::new(),
            ignore_names: Vec::new(),
            update_checkpoint: false,
        }
    }
}

/// A project pass that has resolved its checkpoint but not scanned yet
#[derive(Debug, Clone)]
pub struct Pass {
    pub project: ProjectInfo,
    pub started_at: i64,
    pub checkpoint: ResolvedCheckpoint,
}

/// One classified entity, carrying its project for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEntity {
    pub project_id: String,
    pub project_name: String,
    pub entity: Entity,
    pub status: Status,
    /// Display name of the acting principal, or its raw id when unresolvable
    pub contributor: String,
}

impl ClassifiedEntity {
    pub fn to_tracking_row(&self) -> TrackingRow {
        TrackingRow {
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            entity_id: self.entity.id.clone(),
            name: self.entity.name.clone(),
            fingerprint: self.entity.fingerprint.to_string(),
            version: self.entity.version,
            node_type: self.entity.node_type.as_str().to_string(),
            changed_on: self.entity.changed_on,
            contributor_id: self.entity.changed_by.clone(),
            contributor: self.contributor.clone(),
            status: self.status,
            annotations: self.entity.annotations.clone(),
        }
    }

    /// Change time as `Mar/15/2016 00:00` (UTC)
    pub fn change_time(&self) -> String {
        format_millis(self.entity.changed_on, "%b/%d/%Y %H:%M")
    }
}

pub fn format_millis(millis: i64, fmt: &str) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format(fmt).to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Output of a finished pass
#[derive(Debug, Clone)]
pub struct ProjectDelta {
    pub pass: Pass,
    pub entries: Vec<ClassifiedEntity>,
    /// Rows dropped as structural, ignored or unidentifiable
    pub skipped: usize,
    pub checkpoint: CheckpointOutcome,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct Detector {
    source: Arc<dyn EntitySource>,
    checkpoints: Arc<dyn CheckpointStore>,
    index: Arc<TrackingIndex>,
    options: DetectorOptions,
}

impl Detector {
    pub fn new(
        source: Arc<dyn EntitySource>,
        checkpoints: Arc<dyn CheckpointStore>,
        index: Arc<TrackingIndex>,
        options: DetectorOptions,
    ) -> Self {
        Self {
            source,
            checkpoints,
            index,
            options,
        }
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }

    /// Full pass over one project: prepare, scan, then advance the checkpoint
    pub async fn detect(
        &self,
        project_id: &str,
        checkpoint: Option<i64>,
    ) -> Result<ProjectDelta, DetectError> {
        let pass = self.prepare(project_id, checkpoint).await?;
        let mut delta = self.scan(&pass).await?;
        delta.checkpoint = self.advance(&delta.pass).await;
        Ok(delta)
    }

    pub async fn prepare(
        &self,
        project_id: &str,
        override_at: Option<i64>,
    ) -> Result<Pass, DetectError> {
        let started_at = now_millis();
        let project = self.source.project(project_id).await?;

        let stored = match self.checkpoints.get_checkpoint(project_id).await {
            Ok(stored) => stored,
            // The stored value only guards monotonicity when an override
            // window is given, so losing it is not fatal there
            Err(e) if override_at.is_some() => {
                warn!(project = %project_id, error = %e, "could not read stored checkpoint");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint = resolve(override_at, stored, started_at, self.options.lookback_ms);
        info!(
            project = %project_id,
            name = %project.name,
            checkpoint = checkpoint.value,
            origin = checkpoint.origin.as_str(),
            window_days = (started_at - checkpoint.value) as f64 / DAY_MS as f64,
            "resolved checkpoint"
        );

        Ok(Pass {
            project,
            started_at,
            checkpoint,
        })
    }

    pub async fn scan(&self, pass: &Pass) -> Result<ProjectDelta, DetectError> {
        let query = EntityQuery {
            project_id: pass.project.id.clone(),
            field: self.options.field,
            after: pass.checkpoint.value,
            annotation_fields: self.options.annotation_fields.clone(),
        };
        let rows = self.source.query(&query).await?;

        let mut users: HashMap<String, String> = HashMap::new();
        let mut entries = Vec::with_capacity(rows.len());
        let mut skipped = 0;

        for raw in &rows {
            let Some(entity) =
                Entity::from_raw(raw, self.options.field, &self.options.annotation_fields)
            else {
                warn!(project = %pass.project.id, name = ?raw.name, "skipping entity without id");
                skipped += 1;
                continue;
            };
            if entity.node_type.is_structural() {
                skipped += 1;
                continue;
            }
            if self.options.ignore_names.iter().any(|n| *n == entity.name) {
                debug!(entity = %entity.id, name = %entity.name, "ignored by name");
                skipped += 1;
                continue;
            }

            let contributor = match entity.changed_by.as_deref() {
                Some(principal) => self.contributor(principal, &mut users).await,
                None => String::new(),
            };
            let status = self.index.classify(&pass.project.id, &entity);
            debug!(entity = %entity.id, status = %status, fingerprint = %entity.fingerprint, "classified");

            entries.push(ClassifiedEntity {
                project_id: pass.project.id.clone(),
                project_name: pass.project.name.clone(),
                entity,
                status,
                contributor,
            });
        }

        info!(
            project = %pass.project.id,
            rows = rows.len(),
            tracked = entries.len(),
            skipped,
            "scanned project"
        );

        Ok(ProjectDelta {
            pass: pass.clone(),
            entries,
            skipped,
            checkpoint: CheckpointOutcome::NotRequested,
        })
    }

    /// Persist the pass start as the project's checkpoint.
    ///
    /// Never fails the run: a write conflict is logged and skipped, anything
    /// else is logged as an error and reported back.
    pub async fn advance(&self, pass: &Pass) -> CheckpointOutcome {
        if !self.options.update_checkpoint {
            return CheckpointOutcome::NotRequested;
        }
        let Some(next) = next_checkpoint(pass.checkpoint.stored, pass.started_at) else {
            return CheckpointOutcome::Unchanged;
        };

        match self.checkpoints.set_checkpoint(&pass.project.id, next).await {
            Ok(()) => {
                info!(project = %pass.project.id, checkpoint = next, "checkpoint advanced");
                CheckpointOutcome::Advanced(next)
            }
            Err(e) if e.is_conflict() => {
                warn!(project = %pass.project.id, error = %e, "checkpoint write conflict, leaving it for the next run");
                CheckpointOutcome::Conflict
            }
            Err(e) => {
                error!(project = %pass.project.id, error = %e, "checkpoint write failed");
                CheckpointOutcome::Failed(e.to_string())
            }
        }
    }

    async fn contributor(&self, principal: &str, cache: &mut HashMap<String, String>) -> String {
        if let Some(name) = cache.get(principal) {
            return name.clone();
        }
        let name = match self.source.user_name(principal).await {
            Ok(name) => name,
            Err(e) => {
                debug!(principal, error = %e, "falling back to principal id");
                principal.to_string()
            }
        };
        cache.insert(principal.to_string(), name.clone());
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::{file, MockCheckpoints, MockSource};
    use crate::source::RawEntity;

    fn detector(
        source: MockSource,
        checkpoints: Arc<MockCheckpoints>,
        rows: &[TrackingRow],
        update_checkpoint: bool,
    ) -> Detector {
        Detector::new(
            Arc::new(source),
            checkpoints,
            Arc::new(TrackingIndex::new(rows, Default::default())),
            DetectorOptions {
                ignore_names: vec!["Project Monitoring".into()],
                update_checkpoint,
                ..Default::default()
            },
        )
    }

    fn recent() -> i64 {
        now_millis() - 60_000
    }

    #[tokio::test]
    async fn new_file_in_empty_table() {
        let source = MockSource::new()
            .with_project("syn0", "Demo", vec![file("syn1", "f.txt", "abc", recent())])
            .with_user("100", "alice");
        let det = detector(source, Arc::new(MockCheckpoints::new()), &[], false);

        let delta = det.detect("syn0", None).await.unwrap();
        assert_eq!(delta.entries.len(), 1);
        let entry = &delta.entries[0];
        assert_eq!(entry.status, Status::New);
        assert_eq!(entry.project_name, "Demo");
        assert_eq!(entry.contributor, "alice");
        assert_eq!(delta.checkpoint, CheckpointOutcome::NotRequested);
    }

    #[tokio::test]
    async fn structural_and_ignored_entities_are_dropped() {
        let mut folder = file("syn2", "raw", "", recent());
        folder.node_type = Some("folder".into());
        let mut project = file("syn0", "Demo", "", recent());
        project.node_type = Some("project".into());
        let table = file("syn3", "Project Monitoring", "", recent());
        let orphan = RawEntity {
            name: Some("orphan".into()),
            modified_on: Some(recent()),
            ..Default::default()
        };
        let source = MockSource::new().with_project(
            "syn0",
            "Demo",
            vec![folder, project, table, orphan, file("syn1", "f.txt", "abc", recent())],
        );
        let det = detector(source, Arc::new(MockCheckpoints::new()), &[], false);

        let delta = det.detect("syn0", None).await.unwrap();
        assert_eq!(delta.skipped, 4);
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(delta.entries[0].entity.id, "syn1");
    }

    #[tokio::test]
    async fn unresolvable_user_falls_back_to_principal() {
        let source =
            MockSource::new().with_project("syn0", "Demo", vec![file("syn1", "f.txt", "abc", recent())]);
        let det = detector(source, Arc::new(MockCheckpoints::new()), &[], false);

        let delta = det.detect("syn0", None).await.unwrap();
        assert_eq!(delta.entries[0].contributor, "100");
    }

    #[tokio::test]
    async fn default_lookback_excludes_older_entities() {
        let old = now_millis() - 2 * DAY_MS;
        let source = MockSource::new().with_project(
            "syn0",
            "Demo",
            vec![file("syn1", "old.txt", "abc", old), file("syn2", "new.txt", "def", recent())],
        );
        let det = detector(source, Arc::new(MockCheckpoints::new()), &[], false);

        let delta = det.detect("syn0", None).await.unwrap();
        assert_eq!(delta.pass.checkpoint.origin, CheckpointOrigin::Lookback);
        let lookback = delta.pass.started_at - delta.pass.checkpoint.value;
        assert_eq!(lookback, days_to_ms(1.1));
        let ids: Vec<_> = delta.entries.iter().map(|e| e.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["syn2"]);
    }

    #[tokio::test]
    async fn stored_checkpoint_used_and_advanced() {
        let stored = now_millis() - 10 * DAY_MS;
        let checkpoints = Arc::new(MockCheckpoints::new().with_value("syn0", stored));
        let source = MockSource::new().with_project(
            "syn0",
            "Demo",
            vec![file("syn1", "f.txt", "abc", now_millis() - 5 * DAY_MS)],
        );
        let det = detector(source, checkpoints.clone(), &[], true);

        let delta = det.detect("syn0", None).await.unwrap();
        assert_eq!(delta.pass.checkpoint.origin, CheckpointOrigin::Stored);
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(
            delta.checkpoint,
            CheckpointOutcome::Advanced(delta.pass.started_at)
        );
        assert_eq!(checkpoints.value("syn0"), Some(delta.pass.started_at));
    }

    #[tokio::test]
    async fn override_window_beats_stored_checkpoint() {
        let checkpoints = Arc::new(MockCheckpoints::new().with_value("syn0", now_millis()));
        let source = MockSource::new().with_project(
            "syn0",
            "Demo",
            vec![file("syn1", "f.txt", "abc", now_millis() - 3 * DAY_MS)],
        );
        let det = detector(source, checkpoints, &[], false);

        let delta = det
            .detect("syn0", Some(now_millis() - 7 * DAY_MS))
            .await
            .unwrap();
        assert_eq!(delta.pass.checkpoint.origin, CheckpointOrigin::Override);
        assert_eq!(delta.entries.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_conflict_is_not_fatal() {
        let checkpoints = Arc::new(MockCheckpoints::new().conflicting());
        let source =
            MockSource::new().with_project("syn0", "Demo", vec![file("syn1", "f.txt", "abc", recent())]);
        let det = detector(source, checkpoints.clone(), &[], true);

        let delta = det.detect("syn0", None).await.unwrap();
        assert_eq!(delta.checkpoint, CheckpointOutcome::Conflict);
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(checkpoints.value("syn0"), None);
    }

    #[tokio::test]
    async fn unexpected_checkpoint_error_is_surfaced_not_fatal() {
        let checkpoints = Arc::new(MockCheckpoints::new().broken());
        let source =
            MockSource::new().with_project("syn0", "Demo", vec![file("syn1", "f.txt", "abc", recent())]);
        let det = detector(source, checkpoints, &[], true);

        let delta = det.detect("syn0", None).await.unwrap();
        assert!(matches!(delta.checkpoint, CheckpointOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn failed_query_leaves_checkpoint_alone() {
        let checkpoints = Arc::new(MockCheckpoints::new());
        let source = MockSource::new()
            .with_project("syn0", "Demo", vec![])
            .fail_next(
                "syn0",
                SourceError::Api {
                    status: 500,
                    message: "down".into(),
                },
            );
        let det = detector(source, checkpoints.clone(), &[], true);

        let err = det.detect("syn0", None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(checkpoints.value("syn0"), None);
    }

    #[tokio::test]
    async fn every_entity_gets_exactly_one_status() {
        let tracked = vec![
            TrackingRow {
                project_id: "syn0".into(),
                entity_id: "syn1".into(),
                name: "f.txt".into(),
                fingerprint: "abc".into(),
                ..Default::default()
            },
            TrackingRow {
                project_id: "syn0".into(),
                entity_id: "syn2".into(),
                name: "g.txt".into(),
                fingerprint: "abc".into(),
                ..Default::default()
            },
        ];
        let source = MockSource::new().with_project(
            "syn0",
            "Demo",
            vec![
                file("syn1", "f.txt", "def", recent()),
                file("syn2", "g.txt", "abc", recent()),
                file("syn3", "h.txt", "abc", recent()),
            ],
        );
        let det = detector(source, Arc::new(MockCheckpoints::new()), &tracked, false);

        let delta = det.detect("syn0", None).await.unwrap();
        let statuses: Vec<_> = delta.entries.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![Status::Updated, Status::Existing, Status::New]
        );
    }

    #[test]
    fn change_time_is_formatted_in_utc() {
        let entry = ClassifiedEntity {
            project_id: "syn0".into(),
            project_name: "Demo".into(),
            entity: Entity {
                id: "syn1".into(),
                name: "f.txt".into(),
                node_type: NodeType::File,
                version: None,
                fingerprint: Fingerprint::Missing,
                changed_on: 1_458_000_000_000,
                changed_by: None,
                annotations: Default::default(),
            },
            status: Status::New,
            contributor: String::new(),
        };
        assert_eq!(entry.change_time(), "Mar/15/2016 00:00");
        let row = entry.to_tracking_row();
        assert_eq!(row.fingerprint, "NA");
        assert_eq!(row.node_type, "file");
    }
}
