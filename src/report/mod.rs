//! Report rendering
//!
//! - [`html`]: the per-run audit email (one table row per changed entity)
//! - [`digest`]: Markdown activity digest over the tracking table, split
//!   into date buckets (trailing week, prior week, older by default)

pub mod digest;
pub mod html;

pub use digest::render_digest;
pub use html::render_email;

use crate::config::ReportConfig;
use crate::detect::{format_millis, DAY_MS};

/// A half-open window of change times, `[start, end)`; `None` is unbounded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub label: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl Bucket {
    pub fn contains(&self, millis: i64) -> bool {
        self.start.map_or(true, |s| millis >= s) && self.end.map_or(true, |e| millis < e)
    }
}

/// Consecutive buckets ending at `now`, newest first, plus one open-ended
/// bucket for everything older.
///
/// The newest bucket's end is exclusive of `now + 1`, so changes stamped
/// exactly at `now` still land in it.
pub fn buckets(now: i64, bucket_days: &[u32]) -> Vec<Bucket> {
    let mut out = Vec::with_capacity(bucket_days.len() + 1);
    let mut end = now + 1;

    for days in bucket_days.iter().filter(|d| **d > 0) {
        let start = end - i64::from(*days) * DAY_MS;
        out.push(Bucket {
            label: format!("{} to {}", date(start), date(end - 1)),
            start: Some(start),
            end: Some(end),
        });
        end = start;
    }

    let label = if out.is_empty() {
        "All activity".to_string()
    } else {
        format!("Before {}", date(end))
    };
    out.push(Bucket {
        label,
        start: None,
        end: Some(end),
    });
    out
}

fn date(millis: i64) -> String {
    format_millis(millis, "%b/%d/%Y")
}

/// Links into the repository's web UI
#[derive(Debug, Clone)]
pub struct Links {
    entity_url: String,
    profile_url: String,
}

impl Links {
    pub fn new(config: &ReportConfig) -> Self {
        Self {
            entity_url: config.entity_url.clone(),
            profile_url: config.profile_url.clone(),
        }
    }

    pub fn entity(&self, id: &str) -> String {
        self.entity_url.replace("{id}", id)
    }

    pub fn profile(&self, principal_id: &str) -> String {
        self.profile_url.replace("{id}", principal_id)
    }
}
