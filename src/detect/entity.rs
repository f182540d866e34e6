//! Typed entity snapshot built from a raw query row

use std::collections::BTreeMap;
use std::fmt;

use crate::source::{RawEntity, TimestampField};

/// Entity kind; projects and folders are structure, not content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeType {
    Project,
    Folder,
    File,
    Table,
    Other(String),
}

impl NodeType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "project" => NodeType::Project,
            "folder" => NodeType::Folder,
            "file" => NodeType::File,
            "table" => NodeType::Table,
            other => NodeType::Other(other.to_string()),
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, NodeType::Project | NodeType::Folder)
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Project => "project",
            NodeType::Folder => "folder",
            NodeType::File => "file",
            NodeType::Table => "table",
            NodeType::Other(s) => s.as_str(),
        }
    }
}

/// Content identity of an entity: checksum, else version, else nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Checksum(String),
    Version(i64),
    Missing,
}

impl Fingerprint {
    pub fn resolve(checksum: Option<&str>, version: Option<i64>) -> Self {
        match (checksum.map(str::trim).filter(|c| !c.is_empty()), version) {
            (Some(c), _) => Fingerprint::Checksum(c.to_string()),
            (None, Some(v)) => Fingerprint::Version(v),
            (None, None) => Fingerprint::Missing,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Checksum(c) => f.write_str(c),
            Fingerprint::Version(v) => write!(f, "{v}"),
            Fingerprint::Missing => f.write_str("NA"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub version: Option<i64>,
    pub fingerprint: Fingerprint,
    /// Epoch millis of the audited timestamp (modified or created)
    pub changed_on: i64,
    pub changed_by: Option<String>,
    /// First value of each requested annotation, `""` when absent or empty
    pub annotations: BTreeMap<String, String>,
}

impl Entity {
    /// `None` when the row carries no id
    pub fn from_raw(raw: &RawEntity, field: TimestampField, annotation_fields: &[String]) -> Option<Self> {
        let id = raw.id.as_deref().map(str::trim).filter(|id| !id.is_empty())?;

        let changed_on = raw
            .timestamp(field)
            .or(raw.modified_on)
            .or(raw.created_on)
            .unwrap_or_default();

        let annotations = annotation_fields
            .iter()
            .map(|key| {
                let value = raw
                    .annotations
                    .get(key)
                    .and_then(|values| values.first())
                    .cloned()
                    .unwrap_or_default();
                (key.clone(), value)
            })
            .collect();

        Some(Self {
            id: id.to_string(),
            name: raw.name.clone().unwrap_or_default(),
            node_type: raw
                .node_type
                .as_deref()
                .map(NodeType::parse)
                .unwrap_or_else(|| NodeType::Other(String::new())),
            version: raw.version_number,
            fingerprint: Fingerprint::resolve(raw.checksum.as_deref(), raw.version_number),
            changed_on,
            changed_by: raw.principal(field).map(str::to_string),
            annotations,
        })
    }
}
