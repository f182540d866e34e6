//! One audit run, end to end
//!
//! Order matters here. Detection fans out over all projects, then the
//! whole delta is merged into the tracking table in one transaction, and
//! only after that commit are project checkpoints advanced. A run that fails
//! to merge leaves every checkpoint where it was, so the next run sees the
//! same changes again. Rendering and notification come last and never touch
//! the table.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::detect::pool::{detect_all, PoolOptions, ProjectFailure};
use crate::detect::{
    days_before, days_to_ms, now_millis, CheckpointOutcome, ClassifiedEntity, Detector,
    DetectorOptions, Status, TrackingIndex,
};
use crate::notify::{Message, Notifier};
use crate::reconcile::{apply_plan, reconcile_recorded, TrackingRow};
use crate::report::{self, Links};
use crate::source::{CheckpointStore, EntitySource, TimestampField};
use crate::store::{MergeStats, RunOutcome, RunStatus, TrackingStore};

/// What the operator asked for
#[derive(Debug, Clone, Default)]
pub struct AuditRequest {
    pub projects: Vec<String>,
    /// Look back this many days instead of using stored checkpoints
    pub days: Option<f64>,
    pub update_checkpoint: bool,
    pub subject: Option<String>,
    pub recipient: Option<String>,
    pub digest_path: Option<PathBuf>,
    /// Detect and render only; the table, checkpoints and outbox are left alone
    pub dry_run: bool,
    pub timestamp_field: Option<TimestampField>,
}

#[derive(Debug)]
pub struct AuditSummary {
    pub run_id: String,
    pub started_at: i64,
    pub entries: Vec<ClassifiedEntity>,
    pub failures: Vec<ProjectFailure>,
    pub merge: MergeStats,
    pub checkpoints: Vec<(String, CheckpointOutcome)>,
    /// Where the notification went, if one was sent
    pub notified: Option<String>,
    pub digest: Option<PathBuf>,
    pub dry_run: bool,
}

impl AuditSummary {
    pub fn count(&self, status: Status) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn changes(&self) -> impl Iterator<Item = &ClassifiedEntity> {
        self.entries.iter().filter(|e| e.status.is_change())
    }
}

pub struct Monitor {
    config: Config,
    source: Arc<dyn EntitySource>,
    checkpoints: Arc<dyn CheckpointStore>,
    notifier: Option<Arc<dyn Notifier>>,
    store: TrackingStore,
}

impl Monitor {
    pub fn new(
        config: Config,
        source: Arc<dyn EntitySource>,
        checkpoints: Arc<dyn CheckpointStore>,
        notifier: Option<Arc<dyn Notifier>>,
        store: TrackingStore,
    ) -> Self {
        Self {
            config,
            source,
            checkpoints,
            notifier,
            store,
        }
    }

    pub fn store(&self) -> &TrackingStore {
        &self.store
    }

    /// Run one audit. Once the run is logged, any error marks it failed.
    pub async fn run(&self, request: &AuditRequest) -> Result<AuditSummary> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = now_millis();
        let override_at = match request.days {
            Some(days) => Some(
                days_before(started_at, days)
                    .ok_or_else(|| anyhow!("lookback must be a non-negative number of days, got {days}"))?,
            ),
            None => None,
        };

        self.store.ensure_key_mode(self.config.audit.key_mode)?;
        self.store
            .begin_run(&run_id, &request.projects, started_at, request.dry_run)?;
        info!(run = %run_id, projects = request.projects.len(), dry_run = request.dry_run, "audit started");

        let mut outcome = RunOutcome {
            finished_at: started_at,
            status: RunStatus::Failed,
            entity_count: 0,
            new_count: 0,
            updated_count: 0,
            merge: MergeStats::default(),
            failures: Vec::new(),
            error: None,
        };
        match self
            .audit(run_id.clone(), started_at, override_at, request, &mut outcome)
            .await
        {
            Ok(summary) => Ok(summary),
            Err(e) => {
                outcome.finished_at = now_millis();
                outcome.status = RunStatus::Failed;
                outcome.error = Some(format!("{e:#}"));
                if let Err(log_err) = self.store.finish_run(&run_id, &outcome) {
                    warn!(run = %run_id, error = %log_err, "could not record failed run");
                }
                Err(e)
            }
        }
    }

    /// Body of a logged run; `outcome` collects what is known so far
    async fn audit(
        &self,
        run_id: String,
        started_at: i64,
        override_at: Option<i64>,
        request: &AuditRequest,
        outcome: &mut RunOutcome,
    ) -> Result<AuditSummary> {
        let mode = self.config.audit.key_mode;
        let existing = self.store.read_all().context("reading tracking table")?;
        let recorded = self.store.recorded_digests().context("reading tracking table")?;
        let detector = Arc::new(Detector::new(
            self.source.clone(),
            self.checkpoints.clone(),
            Arc::new(TrackingIndex::new(&existing, mode)),
            self.detector_options(request),
        ));

        let mut fan_in = detect_all(
            detector.clone(),
            &request.projects,
            override_at,
            &self.pool_options(),
        )
        .await;

        outcome.entity_count = fan_in.entry_count();
        outcome.failures = fan_in.failures.iter().map(|f| f.project_id.clone()).collect();

        let rows: Vec<TrackingRow> = fan_in.entries().map(|e| e.to_tracking_row()).collect();
        let plan = reconcile_recorded(&existing, &recorded, rows, mode);

        let merge = if request.dry_run {
            info!(
                deletes = plan.deletes.len(),
                inserts = plan.inserts.len(),
                "dry run, tracking table left untouched"
            );
            MergeStats::default()
        } else {
            self.store
                .apply(&plan, mode)
                .context("merging tracking table")?
        };

        let mut checkpoints = Vec::with_capacity(fan_in.deltas.len());
        for delta in &mut fan_in.deltas {
            delta.checkpoint = detector.advance(&delta.pass).await;
            checkpoints.push((delta.pass.project.id.clone(), delta.checkpoint.clone()));
        }

        let digest = match &request.digest_path {
            Some(path) => {
                let table = if request.dry_run {
                    apply_plan(&existing, &plan, mode)
                } else {
                    self.store.read_all().context("reading tracking table")?
                };
                self.write_digest(path, &table, started_at).await
            }
            None => None,
        };

        let entries: Vec<ClassifiedEntity> =
            fan_in.deltas.into_iter().flat_map(|d| d.entries).collect();
        let mut summary = AuditSummary {
            run_id,
            started_at,
            entries,
            failures: fan_in.failures,
            merge,
            checkpoints,
            notified: None,
            digest,
            dry_run: request.dry_run,
        };

        if !request.dry_run {
            summary.notified = self.notify(request, &summary).await;
        }

        let status = if summary.failures.is_empty() {
            RunStatus::Ok
        } else {
            RunStatus::Partial
        };
        *outcome = RunOutcome {
            finished_at: now_millis(),
            status,
            entity_count: summary.entries.len(),
            new_count: summary.count(Status::New),
            updated_count: summary.count(Status::Updated),
            merge: summary.merge,
            failures: summary.failures.iter().map(|f| f.project_id.clone()).collect(),
            error: None,
        };
        self.store.finish_run(&summary.run_id, outcome)?;

        info!(
            run = %summary.run_id,
            status = status.as_str(),
            new = summary.count(Status::New),
            updated = summary.count(Status::Updated),
            failed = summary.failures.len(),
            "audit finished"
        );
        Ok(summary)
    }

    fn detector_options(&self, request: &AuditRequest) -> DetectorOptions {
        let audit = &self.config.audit;
        DetectorOptions {
            field: request.timestamp_field.unwrap_or(audit.timestamp_field),
            lookback_ms: days_to_ms(audit.lookback_days),
            annotation_fields: audit.annotation_fields.clone(),
            ignore_names: audit.ignore_names.clone(),
            update_checkpoint: request.update_checkpoint && !request.dry_run,
        }
    }

    fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            concurrency: self.config.audit.concurrency,
            timeout: self.config.query_timeout(),
            max_attempts: self.config.audit.max_attempts,
            ..Default::default()
        }
    }

    async fn write_digest(&self, path: &Path, table: &[TrackingRow], now: i64) -> Option<PathBuf> {
        let report_config = &self.config.report;
        let markdown = report::render_digest(
            table,
            &report::buckets(now, &report_config.bucket_days),
            report_config.digest_limit,
            &Links::new(report_config),
        );
        match tokio::fs::write(path, markdown).await {
            Ok(()) => {
                info!(path = %path.display(), "digest written");
                Some(path.to_path_buf())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not write digest");
                None
            }
        }
    }

    /// Best effort; returns where the message went
    async fn notify(&self, request: &AuditRequest, summary: &AuditSummary) -> Option<String> {
        let changes: Vec<&ClassifiedEntity> = summary.changes().collect();
        if changes.is_empty() && self.config.notify.only_when_changed {
            info!("no new or updated entities, skipping notification");
            return None;
        }
        let Some(notifier) = &self.notifier else {
            info!("no notifier configured, skipping notification");
            return None;
        };

        let recipient = match request
            .recipient
            .clone()
            .or_else(|| self.config.notify.recipient.clone())
        {
            Some(r) => r,
            None => match self.source.current_user().await {
                Ok(me) => me,
                Err(e) => {
                    warn!(error = %e, "could not resolve default recipient");
                    return None;
                }
            },
        };
        let subject = request
            .subject
            .clone()
            .unwrap_or_else(|| self.config.notify.subject.clone());
        let body = report::render_email(
            &changes,
            &summary.failures,
            summary.started_at,
            &Links::new(&self.config.report),
        );

        match notifier.send(&Message::html(recipient.clone(), subject, body)).await {
            Ok(location) => {
                info!(recipient = %recipient, changes = changes.len(), to = %location, "notification sent");
                Some(location)
            }
            Err(e) => {
                warn!(recipient = %recipient, error = %e, "notification failed");
                None
            }
        }
    }
}
