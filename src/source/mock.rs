//! In-memory source and checkpoint store for tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    CheckpointError, CheckpointStore, EntityQuery, EntitySource, ProjectInfo, RawEntity,
    SourceError,
};

#[derive(Default)]
pub struct MockSource {
    projects: HashMap<String, String>,
    entities: HashMap<String, Vec<RawEntity>>,
    users: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    pub queries: Mutex<Vec<EntityQuery>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, id: &str, name: &str, entities: Vec<RawEntity>) -> Self {
        self.projects.insert(id.to_string(), name.to_string());
        self.entities.insert(id.to_string(), entities);
        self
    }

    pub fn with_user(mut self, principal: &str, name: &str) -> Self {
        self.users.insert(principal.to_string(), name.to_string());
        self
    }

    /// Every query against `project` sleeps this long first
    pub fn with_delay(mut self, project: &str, delay: Duration) -> Self {
        self.delays.insert(project.to_string(), delay);
        self
    }

    /// The next query against `project` fails with `error`
    pub fn fail_next(self, project: &str, error: SourceError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(project.to_string())
            .or_default()
            .push_back(error);
        self
    }

    pub fn query_count(&self, project: &str) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.project_id == project)
            .count()
    }
}

/// File entity modified at `modified_on` by principal "100"
pub fn file(id: &str, name: &str, md5: &str, modified_on: i64) -> RawEntity {
    RawEntity {
        id: Some(id.to_string()),
        name: Some(name.to_string()),
        node_type: Some("file".to_string()),
        version_number: Some(1),
        checksum: Some(md5.to_string()),
        modified_on: Some(modified_on),
        modified_by: Some("100".to_string()),
        created_on: Some(modified_on),
        created_by: Some("100".to_string()),
        annotations: Default::default(),
    }
}

#[async_trait]
impl EntitySource for MockSource {
    async fn project(&self, project_id: &str) -> Result<ProjectInfo, SourceError> {
        self.projects
            .get(project_id)
            .map(|name| ProjectInfo {
                id: project_id.to_string(),
                name: name.clone(),
            })
            .ok_or_else(|| SourceError::NotFound(project_id.to_string()))
    }

    async fn query(&self, query: &EntityQuery) -> Result<Vec<RawEntity>, SourceError> {
        self.queries.lock().unwrap().push(query.clone());
        if let Some(delay) = self.delays.get(&query.project_id) {
            tokio::time::sleep(*delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&query.project_id)
            .and_then(|q| q.pop_front());
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(self
            .entities
            .get(&query.project_id)
            .map(|all| {
                all.iter()
                    .filter(|e| e.timestamp(query.field).map_or(true, |t| t > query.after))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn user_name(&self, principal_id: &str) -> Result<String, SourceError> {
        self.users
            .get(principal_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(principal_id.to_string()))
    }

    async fn current_user(&self) -> Result<String, SourceError> {
        Ok("100".to_string())
    }
}

#[derive(Default)]
pub struct MockCheckpoints {
    pub values: Mutex<HashMap<String, i64>>,
    conflict: bool,
    broken: bool,
}

impl MockCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, project: &str, value: i64) -> Self {
        self.values
            .lock()
            .unwrap()
            .insert(project.to_string(), value);
        self
    }

    /// Writes fail with a remote write conflict
    pub fn conflicting(mut self) -> Self {
        self.conflict = true;
        self
    }

    /// Writes fail with an unexpected store error
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn value(&self, project: &str) -> Option<i64> {
        self.values.lock().unwrap().get(project).copied()
    }
}

#[async_trait]
impl CheckpointStore for MockCheckpoints {
    async fn get_checkpoint(&self, project_id: &str) -> Result<Option<i64>, CheckpointError> {
        Ok(self.value(project_id))
    }

    async fn set_checkpoint(
        &self,
        project_id: &str,
        timestamp: i64,
    ) -> Result<(), CheckpointError> {
        if self.conflict {
            return Err(CheckpointError::Conflict(project_id.to_string()));
        }
        if self.broken {
            return Err(CheckpointError::Store("disk full".to_string()));
        }
        self.values
            .lock()
            .unwrap()
            .insert(project_id.to_string(), timestamp);
        Ok(())
    }
}
