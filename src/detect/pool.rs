//! Bounded fan-out of project passes
//!
//! Each project gets its own task behind a semaphore. Every attempt of a
//! pass (prepare + scan) runs under a timeout, and transient failures are
//! retried for that project alone with exponential backoff, waiting at
//! least as long as a rate-limited response asks. A project that never succeeds shows up
//! in [`FanIn::failures`]; everyone else's results are kept.

use backon::{ExponentialBuilder, Retryable};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{ClassifiedEntity, DetectError, Detector, Pass, ProjectDelta};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
    /// First retry delay, doubled on each further attempt
    pub retry_backoff: Duration,
    /// Ceiling on any single wait, including one asked for by a rate limit
    pub max_retry_wait: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency: 6,
            timeout: Duration::from_secs(120),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(500),
            max_retry_wait: Duration::from_secs(300),
        }
    }
}

/// A project whose pass could not be completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFailure {
    pub project_id: String,
    pub attempts: u32,
    pub error: String,
}

/// Concatenated results of every project pass in a run
#[derive(Debug, Default)]
pub struct FanIn {
    /// In the order the projects were requested
    pub deltas: Vec<ProjectDelta>,
    pub failures: Vec<ProjectFailure>,
}

impl FanIn {
    pub fn entries(&self) -> impl Iterator<Item = &ClassifiedEntity> {
        self.deltas.iter().flat_map(|d| d.entries.iter())
    }

    pub fn entry_count(&self) -> usize {
        self.deltas.iter().map(|d| d.entries.len()).sum()
    }
}

/// Run one pass per project, at most `options.concurrency` at a time.
///
/// Checkpoints are not advanced here; callers do that once the delta has
/// been merged.
pub async fn detect_all(
    detector: Arc<Detector>,
    projects: &[String],
    override_at: Option<i64>,
    options: &PoolOptions,
) -> FanIn {
    let mut seen = HashSet::new();
    let projects: Vec<String> = projects
        .iter()
        .filter(|p| seen.insert(p.as_str()))
        .cloned()
        .collect();

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut set = JoinSet::new();

    for (idx, project_id) in projects.iter().enumerate() {
        let detector = detector.clone();
        let semaphore = semaphore.clone();
        let project_id = project_id.clone();
        let options = options.clone();
        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (idx, Err((0, "worker pool closed".to_string())));
            };
            let result = run_with_retry(&detector, &project_id, override_at, &options).await;
            (idx, result)
        });
    }

    let mut slots: Vec<Option<Result<ProjectDelta, (u32, String)>>> =
        (0..projects.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, result)) => slots[idx] = Some(result),
            Err(e) => warn!(error = %e, "project task aborted"),
        }
    }

    let mut fan_in = FanIn::default();
    for (project_id, slot) in projects.into_iter().zip(slots) {
        match slot {
            Some(Ok(delta)) => fan_in.deltas.push(delta),
            Some(Err((attempts, error))) => fan_in.failures.push(ProjectFailure {
                project_id,
                attempts,
                error,
            }),
            None => fan_in.failures.push(ProjectFailure {
                project_id,
                attempts: 0,
                error: "task aborted".to_string(),
            }),
        }
    }

    info!(
        projects = fan_in.deltas.len() + fan_in.failures.len(),
        failed = fan_in.failures.len(),
        entities = fan_in.entry_count(),
        "detection finished"
    );
    fan_in
}

async fn run_with_retry(
    detector: &Detector,
    project_id: &str,
    override_at: Option<i64>,
    options: &PoolOptions,
) -> Result<ProjectDelta, (u32, String)> {
    let retries = options.max_attempts.max(1) - 1;
    let backoff = ExponentialBuilder::default()
        .with_min_delay(options.retry_backoff)
        .with_max_delay(options.max_retry_wait)
        .with_max_times(retries as usize);
    let timeout = options.timeout;
    let max_wait = options.max_retry_wait;

    // The pass start (and so the next checkpoint) is fixed by the first
    // successful prepare, retries never move it forward
    let prepared: Mutex<Option<Pass>> = Mutex::new(None);
    let attempts = AtomicU32::new(0);
    let (prepared, attempts) = (&prepared, &attempts);

    let result = (move || async move {
        attempts.fetch_add(1, Ordering::Relaxed);
        let attempt = async {
            let cached = prepared.lock().await.clone();
            let pass = match cached {
                Some(pass) => pass,
                None => {
                    let pass = detector.prepare(project_id, override_at).await?;
                    *prepared.lock().await = Some(pass.clone());
                    pass
                }
            };
            detector.scan(&pass).await
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DetectError::Timeout(timeout)),
        }
    })
    .retry(backoff)
    .when(DetectError::is_transient)
    .adjust(move |error: &DetectError, delay| {
        // never come back sooner than a rate limit allows
        delay.map(|d| match error.retry_after() {
            Some(wait) => d.max(wait.min(max_wait)),
            None => d,
        })
    })
    .notify(|error: &DetectError, delay: Duration| {
        warn!(
            project = %project_id,
            attempt = attempts.load(Ordering::Relaxed),
            error = %error,
            delay = ?delay,
            "retrying project pass"
        );
    })
    .await;

    let attempt = attempts.load(Ordering::Relaxed);
    result.map_err(|error| {
        warn!(project = %project_id, attempt, error = %error, "project pass failed");
        (attempt, error.to_string())
    })
}
