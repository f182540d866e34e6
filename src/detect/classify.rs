//! Classification against the tracking table snapshot

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::entity::Entity;
use crate::reconcile::{KeyMode, TrackingRow};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    New,
    Updated,
    Existing,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "New",
            Status::Updated => "Updated",
            Status::Existing => "Existing",
        }
    }

    /// New and Updated entries are reported; Existing ones are not
    pub fn is_change(&self) -> bool {
        !matches!(self, Status::Existing)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Status::New),
            "updated" => Ok(Status::Updated),
            "existing" | "unchanged" => Ok(Status::Existing),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
struct Seen {
    fingerprint: String,
    name: String,
    changed_on: i64,
}

/// Read-only lookup of what the tracking table last recorded per entity.
///
/// Joined by entity id; in shared multi-project tables the join is scoped
/// to the owning project as well.
#[derive(Debug, Default)]
pub struct TrackingIndex {
    mode: KeyMode,
    seen: HashMap<(Option<String>, String), Seen>,
}

impl TrackingIndex {
    pub fn new(rows: &[TrackingRow], mode: KeyMode) -> Self {
        let mut seen: HashMap<(Option<String>, String), Seen> = HashMap::new();
        for row in rows {
            let key = (Self::scope(mode, &row.project_id), row.entity_id.clone());
            let candidate = Seen {
                fingerprint: row.fingerprint.clone(),
                name: row.name.clone(),
                changed_on: row.changed_on,
            };
            // A renamed entity can leave several rows in composite-key
            // tables; the latest one is what we compare against
            match seen.get(&key) {
                Some(current) if current.changed_on > candidate.changed_on => {}
                _ => {
                    seen.insert(key, candidate);
                }
            }
        }
        Self { mode, seen }
    }

    fn scope(mode: KeyMode, project_id: &str) -> Option<String> {
        match mode {
            KeyMode::Entity => None,
            KeyMode::ProjectEntityName => Some(project_id.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Exactly one status for every entity
    pub fn classify(&self, project_id: &str, entity: &Entity) -> Status {
        let key = (Self::scope(self.mode, project_id), entity.id.clone());
        match self.seen.get(&key) {
            None => Status::New,
            Some(prev) => {
                let fingerprint = entity.fingerprint.to_string();
                if prev.fingerprint != fingerprint || prev.name != entity.name {
                    Status::Updated
                } else {
                    Status::Existing
                }
            }
        }
    }
}
