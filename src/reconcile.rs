//! Tracking table reconciler
//!
//! Plans the merge of one run's classified rows into the tracking table.
//! Every row has a primary key (entity id, or project + entity id + name for
//! shared tables) and a dedup key (primary key + fingerprint + name + change
//! time), recorded as its SHA-256 digest. Incoming rows whose digest is
//! already recorded are dropped;
//! the rest are inserted, and whatever existing row holds the same primary
//! key is deleted first. Applying the plan twice is the same as once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::detect::Status;

/// Which fields make up a tracking row's primary key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// One row per entity id
    #[default]
    Entity,
    /// One row per (project, entity id, name), for tables shared by projects
    ProjectEntityName,
}

impl KeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::Entity => "entity",
            KeyMode::ProjectEntityName => "project_entity_name",
        }
    }
}

/// One durable record in the tracking table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingRow {
    pub project_id: String,
    pub project_name: String,
    pub entity_id: String,
    pub name: String,
    pub fingerprint: String,
    pub version: Option<i64>,
    pub node_type: String,
    /// Epoch millis
    pub changed_on: i64,
    pub contributor_id: Option<String>,
    pub contributor: String,
    pub status: Status,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimaryKey(Vec<String>);

impl PrimaryKey {
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// Stable text form for the store, a JSON array of the fields
    pub fn encode(&self) -> String {
        serde_json::Value::from(self.0.clone()).to_string()
    }
}

/// Identity of a row's recorded state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub primary: PrimaryKey,
    pub fingerprint: String,
    pub name: String,
    pub changed_on: i64,
}

impl DedupKey {
    /// SHA-256 over a length-prefixed encoding of every field
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };
        for part in self.primary.fields() {
            field(part.as_bytes());
        }
        field(self.fingerprint.as_bytes());
        field(self.name.as_bytes());
        field(&self.changed_on.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl TrackingRow {
    pub fn primary_key(&self, mode: KeyMode) -> PrimaryKey {
        match mode {
            KeyMode::Entity => PrimaryKey(vec![self.entity_id.clone()]),
            KeyMode::ProjectEntityName => PrimaryKey(vec![
                self.project_id.clone(),
                self.entity_id.clone(),
                self.name.clone(),
            ]),
        }
    }

    pub fn dedup_key(&self, mode: KeyMode) -> DedupKey {
        DedupKey {
            primary: self.primary_key(mode),
            fingerprint: self.fingerprint.clone(),
            name: self.name.clone(),
            changed_on: self.changed_on,
        }
    }
}

/// Effect of one reconciliation: delete these, then insert those
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub deletes: Vec<TrackingRow>,
    pub inserts: Vec<TrackingRow>,
    /// Incoming rows already recorded as-is
    pub unchanged: usize,
    /// Incoming rows shadowed by a later row with the same primary key
    pub superseded: usize,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }
}

/// Plan the merge of `new_rows` into `existing`.
///
/// Within `new_rows` the latest change per primary key wins (ties go to the
/// later row), so the plan never inserts two rows under one key.
pub fn reconcile(existing: &[TrackingRow], new_rows: Vec<TrackingRow>, mode: KeyMode) -> MergePlan {
    let recorded: HashSet<String> = existing.iter().map(|r| r.dedup_key(mode).digest()).collect();
    reconcile_recorded(existing, &recorded, new_rows, mode)
}

/// As [`reconcile`], against the dedup digests the store already holds
pub fn reconcile_recorded(
    existing: &[TrackingRow],
    recorded: &HashSet<String>,
    new_rows: Vec<TrackingRow>,
    mode: KeyMode,
) -> MergePlan {
    let mut by_key: HashMap<PrimaryKey, Vec<&TrackingRow>> = HashMap::new();
    for row in existing {
        by_key.entry(row.primary_key(mode)).or_default().push(row);
    }

    let mut plan = MergePlan::default();

    let mut collapsed: Vec<TrackingRow> = Vec::with_capacity(new_rows.len());
    let mut slot: HashMap<PrimaryKey, usize> = HashMap::new();
    for row in new_rows {
        let key = row.primary_key(mode);
        match slot.get(&key) {
            Some(&idx) => {
                plan.superseded += 1;
                if row.changed_on >= collapsed[idx].changed_on {
                    collapsed[idx] = row;
                }
            }
            None => {
                slot.insert(key, collapsed.len());
                collapsed.push(row);
            }
        }
    }

    for row in collapsed {
        if recorded.contains(&row.dedup_key(mode).digest()) {
            plan.unchanged += 1;
            continue;
        }
        if let Some(stale) = by_key.get(&row.primary_key(mode)) {
            plan.deletes.extend(stale.iter().map(|r| (*r).clone()));
        }
        plan.inserts.push(row);
    }

    tracing::debug!(
        key_mode = mode.as_str(),
        deletes = plan.deletes.len(),
        inserts = plan.inserts.len(),
        unchanged = plan.unchanged,
        superseded = plan.superseded,
        "planned merge"
    );
    plan
}

/// Table contents after applying `plan` to `existing`
pub fn apply_plan(existing: &[TrackingRow], plan: &MergePlan, mode: KeyMode) -> Vec<TrackingRow> {
    let deleted: HashSet<PrimaryKey> = plan.deletes.iter().map(|r| r.primary_key(mode)).collect();
    existing
        .iter()
        .filter(|r| !deleted.contains(&r.primary_key(mode)))
        .cloned()
        .chain(plan.inserts.iter().cloned())
        .collect()
}
