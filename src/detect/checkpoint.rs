//! Effective checkpoint resolution

/// One day in epoch millis
pub const DAY_MS: i64 = 86_400_000;

/// Where the effective checkpoint of a pass came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOrigin {
    /// Operator-supplied window
    Override,
    /// Project's persisted `lastAuditTimeStamp`
    Stored,
    /// Never audited: `now - lookback`
    Lookback,
}

impl CheckpointOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointOrigin::Override => "override",
            CheckpointOrigin::Stored => "stored",
            CheckpointOrigin::Lookback => "lookback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCheckpoint {
    pub value: i64,
    pub origin: CheckpointOrigin,
    /// Persisted value at resolution time, if any
    pub stored: Option<i64>,
}

/// Explicit override > stored checkpoint > `now - lookback`
pub fn resolve(
    override_at: Option<i64>,
    stored: Option<i64>,
    now: i64,
    lookback_ms: i64,
) -> ResolvedCheckpoint {
    let (value, origin) = match (override_at, stored) {
        (Some(at), _) => (at, CheckpointOrigin::Override),
        (None, Some(at)) => (at, CheckpointOrigin::Stored),
        (None, None) => (now.saturating_sub(lookback_ms), CheckpointOrigin::Lookback),
    };
    ResolvedCheckpoint {
        value,
        origin,
        stored,
    }
}

/// Convert a lookback in (fractional) days to millis
pub fn days_to_ms(days: f64) -> i64 {
    (days * DAY_MS as f64).round() as i64
}

/// Epoch millis `days` before `now`.
///
/// `None` unless `days` is finite and not negative.
pub fn days_before(now: i64, days: f64) -> Option<i64> {
    (days.is_finite() && days >= 0.0).then(|| now.saturating_sub(days_to_ms(days)))
}

/// Checkpoint value a finished pass should persist, if it moves forward.
///
/// Never returns a value at or below the stored one, so the persisted
/// checkpoint only ever grows.
pub fn next_checkpoint(stored: Option<i64>, pass_started_at: i64) -> Option<i64> {
    match stored {
        Some(current) if current >= pass_started_at => None,
        _ => Some(pass_started_at),
    }
}

/// What happened to a project's checkpoint after the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Progress is not being persisted for this run
    NotRequested,
    /// Stored value was already at or past the pass start
    Unchanged,
    Advanced(i64),
    /// Someone else wrote the annotation; next run rescans a wider window
    Conflict,
    /// Unexpected write error, surfaced in the run summary
    Failed(String),
}

impl CheckpointOutcome {
    pub fn describe(&self) -> String {
        match self {
            CheckpointOutcome::NotRequested => "not updated".to_string(),
            CheckpointOutcome::Unchanged => "unchanged".to_string(),
            CheckpointOutcome::Advanced(at) => format!("advanced to {at}"),
            CheckpointOutcome::Conflict => "write conflict (skipped)".to_string(),
            CheckpointOutcome::Failed(e) => format!("write failed: {e}"),
        }
    }
}
