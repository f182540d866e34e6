//! Configuration management with YAML support

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::source::TimestampField;
use crate::reconcile::KeyMode;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Remote repository endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding a pre-issued bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Where per-project checkpoints live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    /// `lastAuditTimeStamp` annotation on the remote project
    Remote,
    /// `checkpoints` table next to the tracking table
    Local,
}

/// Change detection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub timestamp_field: TimestampField,

    /// Lookback used when a project has never been audited
    #[serde(default = "default_lookback_days")]
    pub lookback_days: f64,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub annotation_fields: Vec<String>,

    #[serde(default)]
    pub key_mode: KeyMode,

    /// Entity names never tracked (the monitoring table itself, etc.)
    #[serde(default = "default_ignore_names")]
    pub ignore_names: Vec<String>,

    #[serde(default = "default_checkpoint_backend")]
    pub checkpoint_backend: CheckpointBackend,
}

/// Report rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Widths of the digest buckets, newest first; everything older falls
    /// into a final open-ended bucket
    #[serde(default = "default_bucket_days")]
    pub bucket_days: Vec<u32>,

    #[serde(default = "default_digest_limit")]
    pub digest_limit: usize,

    /// `{id}` is replaced with the entity or project id
    #[serde(default = "default_entity_url")]
    pub entity_url: String,

    /// `{id}` is replaced with the principal id
    #[serde(default = "default_profile_url")]
    pub profile_url: String,
}

/// Notification delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Principal id of the recipient; defaults to the authenticated user
    #[serde(default)]
    pub recipient: Option<String>,

    #[serde(default = "default_subject")]
    pub subject: String,

    /// Rendered messages are written here; delivery is skipped when unset
    #[serde(default)]
    pub outbox_dir: Option<String>,

    #[serde(default = "default_enabled")]
    pub only_when_changed: bool,
}

// Default value functions
fn default_base_url() -> String {
    "https://repo-prod.prod.sagebase.org/repo/v1".to_string()
}

fn default_token_env() -> String {
    "SYNAPSE_AUTH_TOKEN".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    500
}

fn default_database_path() -> String {
    "~/.local/share/repowatch/tracking.db".to_string()
}

fn default_lookback_days() -> f64 {
    1.1
}

fn default_concurrency() -> usize {
    6
}

fn default_query_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    2
}

fn default_ignore_names() -> Vec<String> {
    vec!["Project Monitoring".to_string()]
}

fn default_checkpoint_backend() -> CheckpointBackend {
    CheckpointBackend::Remote
}

fn default_bucket_days() -> Vec<u32> {
    vec![7, 7]
}

fn default_digest_limit() -> usize {
    5
}

fn default_entity_url() -> String {
    "https://www.synapse.org/#!Synapse:{id}".to_string()
}

fn default_profile_url() -> String {
    "https://www.synapse.org/#!Profile:{id}".to_string()
}

fn default_subject() -> String {
    "Updated Synapse Files".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_env: default_token_env(),
            timeout_secs: default_http_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            timestamp_field: TimestampField::default(),
            lookback_days: default_lookback_days(),
            concurrency: default_concurrency(),
            query_timeout_secs: default_query_timeout_secs(),
            max_attempts: default_max_attempts(),
            annotation_fields: Vec::new(),
            key_mode: KeyMode::default(),
            ignore_names: default_ignore_names(),
            checkpoint_backend: default_checkpoint_backend(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            bucket_days: default_bucket_days(),
            digest_limit: default_digest_limit(),
            entity_url: default_entity_url(),
            profile_url: default_profile_url(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            subject: default_subject(),
            outbox_dir: None,
            only_when_changed: true,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./repowatch.yaml (current directory)
    /// 3. ~/.config/repowatch/repowatch.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "repowatch.yaml".to_string(),
            shellexpand::tilde("~/.config/repowatch/repowatch.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)
                    .with_context(|| format!("failed to read {search_path}"))?;
                let config: Config = serde_yaml::from_str(&content)
                    .with_context(|| format!("invalid config file {search_path}"))?;
                tracing::debug!(path = %search_path, "loaded configuration");
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.database.path).to_string();
        PathBuf::from(expanded)
    }

    pub fn outbox_path(&self) -> Option<PathBuf> {
        self.notify
            .outbox_dir
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
    }

    /// Bearer token read from the configured environment variable
    pub fn auth_token(&self) -> Option<String> {
        std::env::var(&self.source.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.audit.query_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audit.concurrency, 6);
        assert_eq!(config.audit.lookback_days, 1.1);
        assert_eq!(config.audit.timestamp_field, TimestampField::Modified);
        assert_eq!(config.audit.key_mode, KeyMode::Entity);
        assert_eq!(config.audit.checkpoint_backend, CheckpointBackend::Remote);
        assert_eq!(config.report.bucket_days, vec![7, 7]);
        assert!(config.notify.only_when_changed);
        assert!(config.outbox_path().is_none());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
database:
  path: ~/.local/share/repowatch/test.db

audit:
  timestamp_field: created
  lookback_days: 180
  annotation_fields: [center, fileType, dataType]
  key_mode: project_entity_name
  checkpoint_backend: local

report:
  bucket_days: [6, 24]

notify:
  recipient: "3345868"
  outbox_dir: /tmp/outbox
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database.path, "~/.local/share/repowatch/test.db");
        assert_eq!(config.audit.timestamp_field, TimestampField::Created);
        assert_eq!(config.audit.lookback_days, 180.0);
        assert_eq!(config.audit.annotation_fields.len(), 3);
        assert_eq!(config.audit.key_mode, KeyMode::ProjectEntityName);
        assert_eq!(config.audit.checkpoint_backend, CheckpointBackend::Local);
        // untouched fields keep their defaults
        assert_eq!(config.audit.concurrency, 6);
        assert_eq!(config.audit.ignore_names, vec!["Project Monitoring"]);
        assert_eq!(config.report.bucket_days, vec![6, 24]);
        assert_eq!(config.notify.recipient.as_deref(), Some("3345868"));
        assert_eq!(config.outbox_path(), Some(PathBuf::from("/tmp/outbox")));
    }

    #[test]
    fn test_query_timeout_never_zero() {
        let mut config = Config::default();
        config.audit.query_timeout_secs = 0;
        assert_eq!(config.query_timeout(), Duration::from_secs(1));
    }
}
