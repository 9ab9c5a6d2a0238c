//! Meilisearch-backed [`SearchIndex`].
//!
//! Talks to the Meilisearch HTTP API directly with `reqwest`. Every write
//! is asynchronous on the server side: the client enqueues a task, then
//! polls `GET /tasks/{uid}` until it reaches a terminal status.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | health | `GET /health` |
//! | add | `POST /indexes/{uid}/documents?primaryKey=id` |
//! | delete by id | `POST /indexes/{uid}/documents/delete-batch` |
//! | delete by filter | `POST /indexes/{uid}/documents/delete` |
//! | page / lookup | `POST /indexes/{uid}/documents/fetch` |
//! | vector search | `POST /indexes/{uid}/search` |
//! | lifecycle | `GET`/`DELETE /indexes/{uid}`, `POST /indexes`, settings |
//!
//! Chunk vectors are stored under `_vectors.<embedder>` for a
//! `userProvided` embedder whose dimensionality is fixed at creation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use super::{Filter, QueryOptions, SearchIndex};
use crate::config::IndexConfig;
use crate::embedding::{embed_query, Embedder, EmbeddingSize};
use crate::models::{DocumentChunk, SearchHit, PATH_FIELD};
use crate::retry::poll_until;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Enqueued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Handle returned when Meilisearch accepts a write.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedTask {
    pub task_uid: u64,
    #[serde(default)]
    pub index_uid: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub uid: u64,
    #[serde(default)]
    pub index_uid: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub error: Option<TaskError>,
    /// ISO-8601 duration, e.g. `PT0.012S`.
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
    code: String,
}

#[derive(Deserialize)]
struct Health {
    status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest {
    offset: usize,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    retrieve_vectors: bool,
}

#[derive(Deserialize)]
struct FetchResponse {
    results: Vec<Value>,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Vec<Value>,
}

pub struct MeiliIndex {
    client: reqwest::Client,
    host: String,
    uid: String,
    api_key: Option<String>,
    embedder: String,
    size: EmbeddingSize,
    query_embedder: Arc<dyn Embedder>,
    poll_interval: Duration,
    task_timeout: Duration,
}

impl MeiliIndex {
    /// `size` is both the dimensionality of the index embedder and the size
    /// requested when embedding search queries.
    pub fn new(
        config: &IndexConfig,
        size: EmbeddingSize,
        query_embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            uid: config.uid.clone(),
            api_key: config.resolved_api_key(),
            embedder: config.embedder.clone(),
            size,
            query_embedder,
            poll_interval: Duration::from_millis(config.task_poll_ms),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.host, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn index_path(&self, suffix: &str) -> String {
        format!("/indexes/{}{}", self.uid, suffix)
    }

    async fn enqueue(&self, builder: RequestBuilder, what: &str) -> Result<EnqueuedTask> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("{} request failed", what))?;
        let response = check(response, what).await?;
        let task: EnqueuedTask = response
            .json()
            .await
            .with_context(|| format!("invalid task response for {}", what))?;
        debug!(task = task.task_uid, kind = %task.kind, "{} enqueued", what);
        Ok(task)
    }

    async fn get_task(&self, task_uid: u64) -> Result<Task> {
        let response = self
            .request(Method::GET, &format!("/tasks/{}", task_uid))
            .send()
            .await
            .context("task status request failed")?;
        let response = check(response, "task status").await?;
        Ok(response.json().await.context("invalid task status response")?)
    }

    /// Poll a task until it reaches a terminal status.
    pub async fn wait_for_task(&self, task_uid: u64) -> Result<Task> {
        let poll = poll_until(
            move || async move {
                let task = self.get_task(task_uid).await?;
                Ok::<_, anyhow::Error>(task.status.is_terminal().then_some(task))
            },
            self.poll_interval,
        );
        tokio::time::timeout(self.task_timeout, poll)
            .await
            .map_err(|_| anyhow!("timed out waiting for task {}", task_uid))?
    }

    /// Wait for a task, log its outcome and fail unless it succeeded.
    async fn handle_task(&self, enqueued: EnqueuedTask) -> Result<Task> {
        let task = self.wait_for_task(enqueued.task_uid).await?;
        log_task(&task);
        if task.status != TaskStatus::Succeeded {
            let reason = task
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("{:?}", task.status));
            bail!("task {} ({}) did not succeed: {}", task.uid, task.kind, reason);
        }
        Ok(task)
    }

    fn to_document(&self, chunk: &DocumentChunk) -> Result<Value> {
        let mut value = serde_json::to_value(chunk)?;
        if let (Some(vector), Value::Object(map)) = (&chunk.vector, &mut value) {
            let mut vectors = Map::new();
            vectors.insert(self.embedder.clone(), json!(vector));
            map.insert("_vectors".to_string(), Value::Object(vectors));
        }
        Ok(value)
    }

    fn from_document(&self, mut value: Value) -> Result<DocumentChunk> {
        let vectors = value
            .as_object_mut()
            .and_then(|map| map.remove("_vectors"));
        let mut chunk: DocumentChunk =
            serde_json::from_value(value).context("invalid document in index")?;
        chunk.vector = vectors
            .as_ref()
            .and_then(|v| v.get(&self.embedder))
            .and_then(parse_vector);
        Ok(chunk)
    }
}

/// Accepts `[..]`, `[[..], ..]` or `{"embeddings": .., "regenerate": ..}`.
fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    match value {
        Value::Object(map) => map.get("embeddings").and_then(parse_vector),
        Value::Array(items) => match items.first() {
            Some(Value::Array(_)) => parse_vector(&items[0]),
            _ => items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect(),
        },
        _ => None,
    }
}

async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| format!("{} ({})", e.message, e.code))
        .unwrap_or(body);
    bail!("{} failed with {}: {}", what, status, message)
}

fn log_task(task: &Task) {
    let index = task.index_uid.as_deref().unwrap_or("-");
    let duration = task.duration.as_deref().unwrap_or("-");
    match task.status {
        TaskStatus::Succeeded => info!(
            index,
            task = %task.kind,
            started = ?task.started_at,
            finished = ?task.finished_at,
            took = duration,
            "task succeeded"
        ),
        status => error!(
            index,
            task = %task.kind,
            status = ?status,
            started = ?task.started_at,
            finished = ?task.finished_at,
            took = duration,
            error = task.error.as_ref().map(|e| e.message.as_str()).unwrap_or("-"),
            "task did not succeed"
        ),
    }
}

#[async_trait]
impl SearchIndex for MeiliIndex {
    async fn add(&self, entries: &[DocumentChunk]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let documents = entries
            .iter()
            .map(|chunk| self.to_document(chunk))
            .collect::<Result<Vec<_>>>()?;
        let builder = self
            .request(Method::POST, &self.index_path("/documents"))
            .query(&[("primaryKey", "id")])
            .json(&documents);
        let task = self.enqueue(builder, "add documents").await?;
        self.handle_task(task).await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let builder = self
            .request(Method::POST, &self.index_path("/documents/delete-batch"))
            .json(ids);
        let task = self.enqueue(builder, "delete documents").await?;
        self.handle_task(task).await?;
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &Filter) -> Result<()> {
        let builder = self
            .request(Method::POST, &self.index_path("/documents/delete"))
            .json(&json!({ "filter": filter.to_string() }));
        let task = self.enqueue(builder, "delete by filter").await?;
        self.handle_task(task).await?;
        Ok(())
    }

    async fn fetch_page(&self, options: &QueryOptions) -> Result<Vec<DocumentChunk>> {
        let fields = if options.fields.is_empty() {
            None
        } else {
            let mut fields = options.fields.clone();
            for required in ["id", "metadata"] {
                if !fields.iter().any(|f| f == required) {
                    fields.push(required.to_string());
                }
            }
            Some(fields)
        };
        let body = FetchRequest {
            offset: options.offset,
            limit: options.limit,
            fields,
            filter: options.filter.as_ref().map(Filter::to_string),
            retrieve_vectors: options.with_vectors,
        };
        let response = self
            .request(Method::POST, &self.index_path("/documents/fetch"))
            .json(&body)
            .send()
            .await
            .context("fetch documents request failed")?;
        let response = check(response, "fetch documents").await?;
        let page: FetchResponse = response.json().await.context("invalid fetch response")?;

        page.results
            .into_iter()
            .map(|value| self.from_document(value))
            .collect()
    }

    async fn healthy(&self) -> bool {
        let response = match self.request(Method::GET, "/health").send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), "health check failed");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "health check failed");
                return false;
            }
        };
        match response.json::<Health>().await {
            Ok(health) => health.status == "available",
            Err(_) => false,
        }
    }

    async fn index_exists(&self) -> Result<bool> {
        let response = self
            .request(Method::GET, &self.index_path(""))
            .send()
            .await
            .context("get index request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<ApiError>(&body) {
                Ok(e) if e.code == "index_not_found" => Ok(false),
                _ => bail!("get index failed with 404: {}", body),
            };
        }
        check(response, "get index").await?;
        Ok(true)
    }

    async fn create_index(&self) -> Result<bool> {
        if self.index_exists().await? {
            return Ok(false);
        }

        let mut embedders = Map::new();
        embedders.insert(
            self.embedder.clone(),
            json!({ "source": "userProvided", "dimensions": self.size.dims() }),
        );

        let create = self
            .request(Method::POST, "/indexes")
            .json(&json!({ "uid": self.uid, "primaryKey": "id" }));
        let filterable = self
            .request(
                Method::PUT,
                &self.index_path("/settings/filterable-attributes"),
            )
            .json(&[PATH_FIELD]);
        let embedder = self
            .request(Method::PATCH, &self.index_path("/settings/embedders"))
            .json(&Value::Object(embedders));

        let mut enqueued = Vec::with_capacity(3);
        enqueued.push(self.enqueue(create, "create index").await?);
        enqueued.push(self.enqueue(filterable, "update filterable attributes").await?);
        enqueued.push(self.enqueue(embedder, "update embedders").await?);

        for task in enqueued {
            match self.wait_for_task(task.task_uid).await {
                Ok(task) => log_task(&task),
                Err(e) => error!(task = task.task_uid, kind = %task.kind, "{:#}", e),
            }
        }
        info!(index = %self.uid, "index created");
        Ok(true)
    }

    async fn delete_index(&self) -> Result<()> {
        let builder = self.request(Method::DELETE, &self.index_path(""));
        let task = self.enqueue(builder, "delete index").await?;
        self.handle_task(task).await?;
        Ok(())
    }

    async fn vector_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let vector = match embed_query(self.query_embedder.as_ref(), query, self.size).await {
            Ok(vector) => vector,
            Err(e) => {
                error!(kind = %e.kind, "query embedding failed: {}", e.message);
                return Err(e.into());
            }
        };

        let body = json!({
            "vector": vector,
            "hybrid": { "embedder": self.embedder, "semanticRatio": 1.0 },
            "limit": limit,
            "showRankingScore": true,
        });
        let response = self
            .request(Method::POST, &self.index_path("/search"))
            .json(&body)
            .send()
            .await
            .context("search request failed")?;
        let response = check(response, "search").await?;
        let results: SearchResponse = response.json().await.context("invalid search response")?;

        results
            .hits
            .into_iter()
            .map(|mut hit| {
                let score = hit
                    .as_object_mut()
                    .and_then(|map| map.remove("_rankingScore"))
                    .and_then(|v| v.as_f64());
                Ok(SearchHit {
                    chunk: self.from_document(hit)?,
                    score,
                })
            })
            .collect()
    }
}
