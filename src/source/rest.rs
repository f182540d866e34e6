//! REST client for the repository's legacy entity-query API
//!
//! Endpoints used (all relative to `source.base_url`):
//!   - GET  /entity/{id}                 - project name
//!   - GET  /query?query=...             - paged entity listing
//!   - GET  /userProfile[/{principal}]   - user names, caller id
//!   - GET/PUT /entity/{id}/annotations  - `lastAuditTimeStamp` checkpoint
//!
//! Query rows come back as flat maps keyed `entity.<column>`, with
//! annotation columns (and sometimes plain columns) wrapped in lists.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

use super::error::{CheckpointError, SourceError};
use super::http::check_response;
use super::{
    CheckpointStore, EntityQuery, EntitySource, ProjectInfo, RawEntity, CHECKPOINT_ANNOTATION,
};
use crate::config::SourceConfig;

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct EntityHeader {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    /// Absent on some deployments; paging then stops on a short page
    #[serde(rename = "totalNumberOfResults", default)]
    total: Option<usize>,
    #[serde(default)]
    results: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct UserProfile {
    #[serde(rename = "ownerId")]
    owner_id: String,
    #[serde(rename = "userName")]
    user_name: Option<String>,
}

impl RestClient {
    pub fn new(config: &SourceConfig, token: Option<String>) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SourceError::Config(format!("invalid auth token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("repowatch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let resp = check_response(self.http.get(self.url(path)).send().await?).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SourceError::Parse(format!("{path}: {e}")))
    }

    async fn annotations(&self, project_id: &str) -> Result<Value, SourceError> {
        self.get_json(&format!(
            "/entity/{}/annotations",
            urlencoding::encode(project_id)
        ))
        .await
    }
}

/// Build the listing query for one project
pub(crate) fn entity_query_text(query: &EntityQuery) -> String {
    let mut columns: Vec<&str> = vec![
        "id",
        "name",
        "versionNumber",
        "md5",
        query.field.column(),
        query.field.principal_column(),
        "nodeType",
    ];
    for field in &query.annotation_fields {
        if !columns.contains(&field.as_str()) {
            columns.push(field);
        }
    }
    format!(
        "select {} from entity where projectId=='{}' and {}>{}",
        columns.join(", "),
        query.project_id.replace('\'', ""),
        query.field.column(),
        query.after
    )
}

fn column<'a>(row: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    row.get(&format!("entity.{name}")).or_else(|| row.get(name))
}

/// Lists collapse to their first element
fn scalar(value: &Value) -> Option<&Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => items.first().and_then(scalar),
        other => Some(other),
    }
}

fn as_string(value: &Value) -> Option<String> {
    match scalar(value)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match scalar(value)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(as_string).collect(),
        other => as_string(other).into_iter().collect(),
    }
}

/// Map one query row onto the typed record
pub(crate) fn raw_entity_from_row(row: &Map<String, Value>, annotation_fields: &[String]) -> RawEntity {
    let text = |name: &str| column(row, name).and_then(as_string);
    let number = |name: &str| column(row, name).and_then(as_i64);

    let annotations = annotation_fields
        .iter()
        .filter_map(|field| column(row, field).map(|v| (field.clone(), as_list(v))))
        .collect();

    RawEntity {
        id: text("id"),
        name: text("name"),
        node_type: text("nodeType"),
        version_number: number("versionNumber"),
        checksum: text("md5"),
        modified_on: number("modifiedOn"),
        modified_by: text("modifiedByPrincipalId"),
        created_on: number("createdOn"),
        created_by: text("createdByPrincipalId"),
        annotations,
    }
}

/// First element of the checkpoint annotation list
pub(crate) fn checkpoint_from_annotations(annotations: &Value) -> Option<i64> {
    annotations
        .get("longAnnotations")
        .and_then(|a| a.get(CHECKPOINT_ANNOTATION))
        .or_else(|| annotations.get(CHECKPOINT_ANNOTATION))
        .and_then(as_i64)
}

#[async_trait]
impl EntitySource for RestClient {
    async fn project(&self, project_id: &str) -> Result<ProjectInfo, SourceError> {
        let header: EntityHeader = self
            .get_json(&format!("/entity/{}", urlencoding::encode(project_id)))
            .await?;
        Ok(ProjectInfo {
            id: header.id,
            name: header.name,
        })
    }

    async fn query(&self, query: &EntityQuery) -> Result<Vec<RawEntity>, SourceError> {
        let text = entity_query_text(query);
        let mut entities = Vec::new();
        // The legacy query service counts offsets from 1
        let mut offset = 1usize;

        loop {
            let paged = format!("{text} limit {} offset {offset}", self.page_size);
            let path = format!("/query?query={}", urlencoding::encode(&paged));
            let page: QueryResponse = self.get_json(&path).await?;
            let fetched = page.results.len();

            entities.extend(
                page.results
                    .iter()
                    .map(|row| raw_entity_from_row(row, &query.annotation_fields)),
            );
            tracing::debug!(
                project = %query.project_id,
                offset,
                fetched,
                total = ?page.total,
                "query page"
            );

            let exhausted = match page.total {
                Some(total) => entities.len() >= total,
                None => fetched < self.page_size,
            };
            if fetched == 0 || exhausted {
                break;
            }
            offset += fetched;
        }

        Ok(entities)
    }

    async fn user_name(&self, principal_id: &str) -> Result<String, SourceError> {
        let profile: UserProfile = self
            .get_json(&format!("/userProfile/{}", urlencoding::encode(principal_id)))
            .await?;
        profile
            .user_name
            .ok_or_else(|| SourceError::Parse(format!("profile {principal_id} has no userName")))
    }

    async fn current_user(&self) -> Result<String, SourceError> {
        let profile: UserProfile = self.get_json("/userProfile").await?;
        Ok(profile.owner_id)
    }
}

#[async_trait]
impl CheckpointStore for RestClient {
    async fn get_checkpoint(&self, project_id: &str) -> Result<Option<i64>, CheckpointError> {
        let annotations = self.annotations(project_id).await?;
        Ok(checkpoint_from_annotations(&annotations))
    }

    async fn set_checkpoint(
        &self,
        project_id: &str,
        timestamp: i64,
    ) -> Result<(), CheckpointError> {
        // Read-modify-write carrying the etag; a concurrent writer makes the
        // PUT fail with 409/412
        let mut annotations = self.annotations(project_id).await?;
        let body = annotations
            .as_object_mut()
            .ok_or_else(|| CheckpointError::Store("annotations are not an object".into()))?;
        let longs = body
            .entry("longAnnotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(longs) = longs.as_object_mut() {
            longs.insert(
                CHECKPOINT_ANNOTATION.to_string(),
                Value::Array(vec![Value::from(timestamp)]),
            );
        }

        let url = self.url(&format!(
            "/entity/{}/annotations",
            urlencoding::encode(project_id)
        ));
        let resp = self
            .http
            .put(url)
            .json(&annotations)
            .send()
            .await
            .map_err(SourceError::from)?;

        match check_response(resp).await {
            Ok(_) => Ok(()),
            Err(SourceError::Api { status, .. }) if status == 409 || status == 412 => {
                Err(CheckpointError::Conflict(project_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{CheckpointOutcome, Detector, DetectorOptions, TrackingIndex};
    use crate::source::TimestampField;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUERY_FIXTURE: &str = r#"{
        "totalNumberOfResults": 2,
        "results": [
            {
                "entity.id": "syn5874301",
                "entity.name": "data_clinical.txt",
                "entity.versionNumber": 3,
                "entity.modifiedOn": 1458000000000,
                "entity.modifiedByPrincipalId": ["3324230"],
                "entity.nodeType": "file",
                "entity.center": ["MSK", "DFCI"],
                "entity.fileType": []
            },
            {
                "entity.id": "syn5874302",
                "entity.name": "raw",
                "entity.versionNumber": "1",
                "entity.md5": "d41d8cd98f00b204e9800998ecf8427e",
                "entity.modifiedOn": "1458000000001",
                "entity.modifiedByPrincipalId": 3324230,
                "entity.nodeType": "folder"
            }
        ]
    }"#;

    fn annotation_fields() -> Vec<String> {
        vec!["center".into(), "fileType".into(), "organism".into()]
    }

    #[test]
    fn parse_query_rows() {
        let page: QueryResponse = serde_json::from_str(QUERY_FIXTURE).unwrap();
        assert_eq!(page.total, Some(2));

        let first = raw_entity_from_row(&page.results[0], &annotation_fields());
        assert_eq!(first.id.as_deref(), Some("syn5874301"));
        assert_eq!(first.version_number, Some(3));
        assert_eq!(first.checksum, None);
        assert_eq!(first.modified_by.as_deref(), Some("3324230"));
        assert_eq!(first.annotations["center"], vec!["MSK", "DFCI"]);
        assert!(first.annotations["fileType"].is_empty());
        assert!(!first.annotations.contains_key("organism"));

        let second = raw_entity_from_row(&page.results[1], &annotation_fields());
        assert_eq!(second.version_number, Some(1));
        assert_eq!(second.modified_on, Some(1_458_000_000_001));
        assert_eq!(second.modified_by.as_deref(), Some("3324230"));
        assert_eq!(
            second.checksum.as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert_eq!(second.node_type.as_deref(), Some("folder"));
    }

    #[test]
    fn row_without_id_stays_unidentified() {
        let row = json!({"entity.name": "orphan"});
        let raw = raw_entity_from_row(row.as_object().unwrap(), &[]);
        assert!(raw.id.is_none());
        assert_eq!(raw.name.as_deref(), Some("orphan"));
    }

    #[test]
    fn query_text_uses_timestamp_policy() {
        let query = EntityQuery {
            project_id: "syn3380222".into(),
            field: TimestampField::Created,
            after: 1_458_000_000_000,
            annotation_fields: vec!["center".into(), "name".into()],
        };
        let text = entity_query_text(&query);
        assert_eq!(
            text,
            "select id, name, versionNumber, md5, createdOn, createdByPrincipalId, nodeType, center \
             from entity where projectId=='syn3380222' and createdOn>1458000000000"
        );
    }

    #[test]
    fn checkpoint_is_first_list_element() {
        let annotations = json!({
            "id": "syn3380222",
            "etag": "abc",
            "longAnnotations": {"lastAuditTimeStamp": [1458000000000_i64, 1]}
        });
        assert_eq!(
            checkpoint_from_annotations(&annotations),
            Some(1_458_000_000_000)
        );
        assert_eq!(checkpoint_from_annotations(&json!({"id": "syn1"})), None);
        let empty = json!({"longAnnotations": {"lastAuditTimeStamp": []}});
        assert_eq!(checkpoint_from_annotations(&empty), None);
    }

    #[test]
    fn client_builds_with_token() {
        let client = RestClient::new(&SourceConfig::default(), Some("abc".into())).unwrap();
        assert_eq!(client.url("/entity/syn1"), format!("{}/entity/syn1", client.base_url));
    }

    fn client_for(server: &MockServer, page_size: usize) -> RestClient {
        let config = SourceConfig {
            base_url: server.uri(),
            page_size,
            ..SourceConfig::default()
        };
        RestClient::new(&config, None).unwrap()
    }

    fn listing(project_id: &str) -> EntityQuery {
        EntityQuery {
            project_id: project_id.into(),
            field: TimestampField::Modified,
            after: 1_458_000_000_000,
            annotation_fields: Vec::new(),
        }
    }

    fn rows(ids: &[&str]) -> Vec<Value> {
        ids.iter()
            .map(|id| json!({"entity.id": id, "entity.name": format!("{id}.txt"), "entity.nodeType": "file"}))
            .collect()
    }

    async fn mount_page(server: &MockServer, query: &EntityQuery, offset: usize, body: Value) {
        let text = format!("{} limit 2 offset {offset}", entity_query_text(query));
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("query", text))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn query_pages_from_offset_one_until_total() {
        let server = MockServer::start().await;
        let query = listing("syn3380222");
        mount_page(&server, &query, 1, json!({"totalNumberOfResults": 3, "results": rows(&["syn1", "syn2"])})).await;
        mount_page(&server, &query, 3, json!({"totalNumberOfResults": 3, "results": rows(&["syn3"])})).await;

        let entities = client_for(&server, 2).query(&query).await.unwrap();

        let ids: Vec<_> = entities.iter().filter_map(|e| e.id.as_deref()).collect();
        assert_eq!(ids, vec!["syn1", "syn2", "syn3"]);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn query_without_total_stops_on_short_page() {
        let server = MockServer::start().await;
        let query = listing("syn3380222");
        mount_page(&server, &query, 1, json!({"results": rows(&["syn1", "syn2"])})).await;
        mount_page(&server, &query, 3, json!({"results": rows(&["syn3"])})).await;

        let entities = client_for(&server, 2).query(&query).await.unwrap();

        assert_eq!(entities.len(), 3);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    async fn mount_project(server: &MockServer, put_status: u16) {
        Mock::given(method("GET"))
            .and(path("/entity/syn3380222"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "syn3380222", "name": "GENIE"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/entity/syn3380222/annotations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "syn3380222",
                "etag": "etag-1",
                "longAnnotations": {"lastAuditTimeStamp": [1458000000000_i64]}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"totalNumberOfResults": 0, "results": []})))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/entity/syn3380222/annotations"))
            .and(body_partial_json(json!({"etag": "etag-1"})))
            .respond_with(ResponseTemplate::new(put_status))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn checkpoint_write_carries_etag_and_new_value() {
        let server = MockServer::start().await;
        mount_project(&server, 200).await;

        let client = client_for(&server, 2);
        client.set_checkpoint("syn3380222", 1_459_000_000_000).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let put = requests.iter().find(|r| r.method.as_str() == "PUT").unwrap();
        let body: Value = serde_json::from_slice(&put.body).unwrap();
        assert_eq!(body["longAnnotations"]["lastAuditTimeStamp"], json!([1_459_000_000_000_i64]));
        assert_eq!(body["etag"], "etag-1");
    }

    #[tokio::test]
    async fn stale_etag_on_write_is_a_conflict() {
        let server = MockServer::start().await;
        mount_project(&server, 412).await;

        let client = client_for(&server, 2);
        let err = client.set_checkpoint("syn3380222", 1_459_000_000_000).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
    }

    #[tokio::test]
    async fn detector_reports_conflict_when_annotation_moved() {
        let server = MockServer::start().await;
        mount_project(&server, 409).await;

        let client = Arc::new(client_for(&server, 2));
        let detector = Detector::new(
            client.clone(),
            client,
            Arc::new(TrackingIndex::default()),
            DetectorOptions {
                update_checkpoint: true,
                ..DetectorOptions::default()
            },
        );

        let delta = detector.detect("syn3380222", None).await.unwrap();
        assert!(delta.entries.is_empty());
        assert_eq!(delta.checkpoint, CheckpointOutcome::Conflict);
    }
}
