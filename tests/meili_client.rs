//! HTTP-level tests for the Meilisearch index client against a mock server.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use vault_sync::chunk::ChunkParams;
use vault_sync::config::IndexConfig;
use vault_sync::embedding::{Embedder, EmbeddingOptions, EmbeddingSize, EmbeddingTask};
use vault_sync::index::meili::MeiliIndex;
use vault_sync::index::{Filter, SearchIndex};
use vault_sync::models::{
    ChunkMetadata, DocumentChunk, EmbeddingsError, FileDescriptor, LineSpan, Loc,
};
use vault_sync::sync::{SyncEngine, SyncSettings};
use wiremock::matchers::{body_json, body_partial_json, header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        options: EmbeddingOptions,
    ) -> Result<Vec<Vec<f32>>, EmbeddingsError> {
        Ok(vec![vec![0.5; options.size.dims()]; texts.len()])
    }
}

fn index_for(server: &MockServer) -> MeiliIndex {
    let config = IndexConfig {
        host: server.uri(),
        api_key: Some("secret".to_string()),
        task_poll_ms: 5,
        task_timeout_secs: 5,
        ..IndexConfig::default()
    };
    MeiliIndex::new(&config, EmbeddingSize::D32, Arc::new(FixedEmbedder)).unwrap()
}

fn enqueued(uid: u64, kind: &str) -> Value {
    json!({
        "taskUid": uid,
        "indexUid": "vault-sync",
        "status": "enqueued",
        "type": kind,
        "enqueuedAt": "2024-05-01T10:00:00Z"
    })
}

fn task(uid: u64, status: &str) -> Value {
    let mut task = json!({
        "uid": uid,
        "indexUid": "vault-sync",
        "status": status,
        "type": "documentAdditionOrUpdate",
        "duration": "PT0.004S",
        "enqueuedAt": "2024-05-01T10:00:00Z",
        "startedAt": "2024-05-01T10:00:00.001Z",
        "finishedAt": "2024-05-01T10:00:00.005Z"
    });
    if status == "failed" {
        task["error"] = json!({
            "message": "Document identifier `a b` is invalid.",
            "code": "invalid_document_id",
            "type": "invalid_request",
            "link": "https://docs.meilisearch.com/errors#invalid_document_id"
        });
    }
    task
}

fn chunk(id: &str, path: &str) -> DocumentChunk {
    DocumentChunk {
        id: id.to_string(),
        page_content: "hello".to_string(),
        metadata: ChunkMetadata {
            document_id: "doc-1".to_string(),
            filename: path.to_string(),
            path: path.to_string(),
            extension: "md".to_string(),
            loc: Loc {
                lines: LineSpan { from: 1, to: 3 },
            },
            hash: "abc".to_string(),
        },
        vector: Some(vec![0.1, 0.2]),
    }
}

#[tokio::test]
async fn test_healthy_requires_available_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "available" })))
        .expect(1)
        .mount(&server)
        .await;

    assert!(index_for(&server).healthy().await);
}

#[tokio::test]
async fn test_healthy_is_false_on_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    assert!(!index_for(&server).healthy().await);

    let config = IndexConfig {
        host: "http://127.0.0.1:1".to_string(),
        ..IndexConfig::default()
    };
    let unreachable = MeiliIndex::new(&config, EmbeddingSize::D32, Arc::new(FixedEmbedder)).unwrap();
    assert!(!unreachable.healthy().await);
}

#[tokio::test]
async fn test_add_writes_vectors_and_waits_for_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents"))
        .and(query_param("primaryKey", "id"))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(1, "documentAdditionOrUpdate")))
        .expect(1)
        .mount(&server)
        .await;
    // Still processing on the first poll.
    Mock::given(method("GET"))
        .and(path("/tasks/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(1, "processing")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(1, "succeeded")))
        .mount(&server)
        .await;

    index_for(&server)
        .add(&[chunk("c1", "a.md")])
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let add = requests
        .iter()
        .find(|r| r.url.path() == "/indexes/vault-sync/documents")
        .unwrap();
    let body: Value = serde_json::from_slice(&add.body).unwrap();
    assert_eq!(body[0]["id"], "c1");
    assert_eq!(body[0]["pageContent"], "hello");
    assert_eq!(body[0]["metadata"]["path"], "a.md");
    assert_eq!(body[0]["_vectors"]["pageContent_embeddings"].as_array().unwrap().len(), 2);

    let polls = requests.iter().filter(|r| r.url.path() == "/tasks/1").count();
    assert_eq!(polls, 2);
}

#[tokio::test]
async fn test_add_reports_failed_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents"))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(2, "documentAdditionOrUpdate")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(2, "failed")))
        .mount(&server)
        .await;

    let err = index_for(&server)
        .add(&[chunk("a b", "a.md")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("is invalid"));
}

#[tokio::test]
async fn test_delete_by_filter_sends_filter_expression() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents/delete"))
        .and(body_json(json!({ "filter": "metadata.path NOT IN [\"a.md\", \"b.md\"]" })))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(3, "documentDeletion")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(3, "succeeded")))
        .mount(&server)
        .await;

    let keep = vec!["a.md".to_string(), "b.md".to_string()];
    index_for(&server)
        .delete_by_filter(&Filter::not_in("metadata.path", &keep))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_by_ids_uses_batch_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents/delete-batch"))
        .and(body_json(json!(["c1", "c2"])))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(4, "documentDeletion")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(4, "succeeded")))
        .mount(&server)
        .await;

    let index = index_for(&server);
    index
        .delete(&["c1".to_string(), "c2".to_string()])
        .await
        .unwrap();
    // Nothing to delete: no request at all.
    index.delete(&[]).await.unwrap();
}

#[tokio::test]
async fn test_find_by_pages_until_empty_and_reads_vectors() {
    let server = MockServer::start().await;
    let mut stored = serde_json::to_value(chunk("c1", "a.md")).unwrap();
    stored["_vectors"] = json!({
        "pageContent_embeddings": { "embeddings": [[0.1, 0.2]], "regenerate": false }
    });

    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents/fetch"))
        .and(body_partial_json(json!({
            "offset": 0,
            "filter": "metadata.path = \"a.md\"",
            "retrieveVectors": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [stored], "offset": 0, "limit": 1000, "total": 1
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents/fetch"))
        .and(body_partial_json(json!({ "offset": 1000 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [], "offset": 1000, "limit": 1000, "total": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let found = index_for(&server).find_by("a.md", "metadata.path").await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "c1");
    assert_eq!(found[0].metadata.hash, "abc");
    assert_eq!(found[0].vector, Some(vec![0.1, 0.2]));
}

#[tokio::test]
async fn test_create_index_provisions_settings() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes/vault-sync"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Index `vault-sync` not found.",
            "code": "index_not_found",
            "type": "invalid_request",
            "link": ""
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes"))
        .and(body_json(json!({ "uid": "vault-sync", "primaryKey": "id" })))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(10, "indexCreation")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/indexes/vault-sync/settings/filterable-attributes"))
        .and(body_json(json!(["metadata.path"])))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(11, "settingsUpdate")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/indexes/vault-sync/settings/embedders"))
        .and(body_json(json!({
            "pageContent_embeddings": { "source": "userProvided", "dimensions": 32 }
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(12, "settingsUpdate")))
        .expect(1)
        .mount(&server)
        .await;
    // A failed provisioning task is logged, not fatal.
    Mock::given(method("GET"))
        .and(path("/tasks/12"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(12, "failed")))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/tasks/\d+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(0, "succeeded")))
        .mount(&server)
        .await;

    let created = index_for(&server).create_index().await.unwrap();
    assert!(created);
}

#[tokio::test]
async fn test_create_index_is_noop_when_present() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes/vault-sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uid": "vault-sync", "primaryKey": "id"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes"))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(1, "indexCreation")))
        .expect(0)
        .mount(&server)
        .await;

    let index = index_for(&server);
    assert!(index.index_exists().await.unwrap());
    assert!(!index.create_index().await.unwrap());
}

#[tokio::test]
async fn test_vector_search_uses_named_embedder() {
    let server = MockServer::start().await;
    let mut hit = serde_json::to_value(chunk("c9", "notes/reading.md")).unwrap();
    hit["_rankingScore"] = json!(0.83);

    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/search"))
        .and(body_partial_json(json!({
            "hybrid": { "embedder": "pageContent_embeddings", "semanticRatio": 1.0 },
            "limit": 3,
            "showRankingScore": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "hits": [hit] })))
        .expect(1)
        .mount(&server)
        .await;

    let hits = index_for(&server).vector_search("books", 3).await.unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.metadata.path, "notes/reading.md");
    assert_eq!(hits[0].score, Some(0.83));

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["vector"].as_array().unwrap().len(), 32);
}

#[tokio::test]
async fn test_sync_checks_presence_without_vectors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents/delete"))
        .and(body_json(json!({ "filter": "metadata.path NOT IN [\"a.md\"]" })))
        .respond_with(ResponseTemplate::new(202).set_body_json(enqueued(20, "documentDeletion")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task(20, "succeeded")))
        .mount(&server)
        .await;

    let mut stored = serde_json::to_value(chunk("c1", "a.md")).unwrap();
    stored.as_object_mut().unwrap().remove("pageContent");
    Mock::given(method("POST"))
        .and(path("/indexes/vault-sync/documents/fetch"))
        .and(body_json(json!({
            "offset": 0,
            "limit": 1,
            "fields": ["id", "metadata"],
            "filter": "metadata.path = \"a.md\"",
            "retrieveVectors": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [stored], "offset": 0, "limit": 1, "total": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let index = Arc::new(index_for(&server));
    let settings = SyncSettings {
        vault_root: std::env::temp_dir(),
        chunk: ChunkParams {
            chunk_size: 200,
            chunk_overlap: 50,
        },
        embedding: EmbeddingOptions {
            size: EmbeddingSize::D32,
            task: EmbeddingTask::RetrievalPassage,
        },
        embed_concurrency: 1,
        concurrency: 1,
    };
    let engine = Arc::new(SyncEngine::new(index, Arc::new(FixedEmbedder), settings));

    let report = engine
        .spawn_sync(vec![FileDescriptor::from_path("a.md")])
        .wait()
        .await
        .unwrap();

    assert_eq!(report.files, 1);
    assert_eq!(report.missing, 0);
    assert_eq!(report.created, 0);
    assert!(report.failed.is_empty());
}
