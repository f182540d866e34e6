//! Remote entity source and checkpoint store
//!
//! Both are consumed, never implemented, by the detector: it only sees the
//! two traits below and a typed [`RawEntity`] per query row. The REST client
//! in [`rest`] speaks the repository's legacy entity-query API and keeps the
//! per-project `lastAuditTimeStamp` annotation.

mod error;
mod http;
mod rest;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{CheckpointError, SourceError};
pub use rest::RestClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation on the remote project that holds its checkpoint
pub const CHECKPOINT_ANNOTATION: &str = "lastAuditTimeStamp";

/// Which timestamp the checkpoint is compared against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampField {
    #[default]
    Modified,
    Created,
}

impl TimestampField {
    pub fn column(&self) -> &'static str {
        match self {
            TimestampField::Modified => "modifiedOn",
            TimestampField::Created => "createdOn",
        }
    }

    pub fn principal_column(&self) -> &'static str {
        match self {
            TimestampField::Modified => "modifiedByPrincipalId",
            TimestampField::Created => "createdByPrincipalId",
        }
    }
}

/// Project-like container being audited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
}

/// Filtered listing: everything under `project_id` whose `field` timestamp
/// is strictly after `after` (epoch millis)
#[derive(Debug, Clone, PartialEq)]
pub struct EntityQuery {
    pub project_id: String,
    pub field: TimestampField,
    pub after: i64,
    pub annotation_fields: Vec<String>,
}

/// One query row as returned by the source, every field optional.
///
/// Annotation values are normalized to lists at the source boundary; a
/// scalar becomes a one-element list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntity {
    pub id: Option<String>,
    pub name: Option<String>,
    pub node_type: Option<String>,
    pub version_number: Option<i64>,
    pub checksum: Option<String>,
    pub modified_on: Option<i64>,
    pub modified_by: Option<String>,
    pub created_on: Option<i64>,
    pub created_by: Option<String>,
    pub annotations: BTreeMap<String, Vec<String>>,
}

impl RawEntity {
    pub fn timestamp(&self, field: TimestampField) -> Option<i64> {
        match field {
            TimestampField::Modified => self.modified_on,
            TimestampField::Created => self.created_on,
        }
    }

    pub fn principal(&self, field: TimestampField) -> Option<&str> {
        match field {
            TimestampField::Modified => self.modified_by.as_deref(),
            TimestampField::Created => self.created_by.as_deref(),
        }
    }
}

/// Queryable remote repository
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn project(&self, project_id: &str) -> Result<ProjectInfo, SourceError>;

    async fn query(&self, query: &EntityQuery) -> Result<Vec<RawEntity>, SourceError>;

    /// Display name of a principal
    async fn user_name(&self, principal_id: &str) -> Result<String, SourceError>;

    /// Principal id of the authenticated caller
    async fn current_user(&self) -> Result<String, SourceError>;
}

/// Per-project persisted low-water mark
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` when the project has never been audited
    async fn get_checkpoint(&self, project_id: &str) -> Result<Option<i64>, CheckpointError>;

    async fn set_checkpoint(&self, project_id: &str, timestamp: i64)
        -> Result<(), CheckpointError>;
}
