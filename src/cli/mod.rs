//! Command implementations

pub mod audit;
pub mod checkpoint;
pub mod list;
pub mod runs;

use anyhow::Result;
use std::sync::Arc;

use crate::config::{CheckpointBackend, Config};
use crate::source::{CheckpointStore, RestClient};
use crate::store::SqliteCheckpoints;

/// The checkpoint backend selected in the config
pub fn checkpoint_store(config: &Config, client: Arc<RestClient>) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match config.audit.checkpoint_backend {
        CheckpointBackend::Remote => client,
        CheckpointBackend::Local => Arc::new(SqliteCheckpoints::open(&config.database_path())?),
    };
    Ok(store)
}
