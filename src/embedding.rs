//! Embedding provider abstraction and the HTTP embeddings client.
//!
//! Defines the [`Embedder`] trait and the [`EmbeddingsClient`] that calls a
//! remote embeddings service:
//!
//! ```text
//! POST {url}/api/v1/embeddings
//! { "texts": [...], "size": 512, "task": "retrieval.passage" }
//! → { "embeddings": [[...], ...] }
//! ```
//!
//! [`embed_chunks`] embeds document chunks with **one call per chunk**.
//! A failed call is logged and the chunk dropped; the rest of the batch
//! carries on, so partial success is the normal outcome.
//!
//! # Retry Strategy
//!
//! With `max_retries > 0` the client retries transient failures with
//! exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, … (capped at 2^5)

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::EmbeddingConfig;
use crate::models::{DocumentChunk, EmbeddingsError};

/// Output dimensionality accepted by the embeddings service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum EmbeddingSize {
    D32,
    D64,
    D128,
    D256,
    D512,
    D768,
    D1024,
}

impl EmbeddingSize {
    pub fn dims(self) -> usize {
        u32::from(self) as usize
    }
}

impl From<EmbeddingSize> for u32 {
    fn from(size: EmbeddingSize) -> Self {
        match size {
            EmbeddingSize::D32 => 32,
            EmbeddingSize::D64 => 64,
            EmbeddingSize::D128 => 128,
            EmbeddingSize::D256 => 256,
            EmbeddingSize::D512 => 512,
            EmbeddingSize::D768 => 768,
            EmbeddingSize::D1024 => 1024,
        }
    }
}

impl TryFrom<u32> for EmbeddingSize {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            32 => Ok(EmbeddingSize::D32),
            64 => Ok(EmbeddingSize::D64),
            128 => Ok(EmbeddingSize::D128),
            256 => Ok(EmbeddingSize::D256),
            512 => Ok(EmbeddingSize::D512),
            768 => Ok(EmbeddingSize::D768),
            1024 => Ok(EmbeddingSize::D1024),
            other => Err(format!(
                "invalid embedding size {}: must be one of 32, 64, 128, 256, 512, 768, 1024",
                other
            )),
        }
    }
}

/// What the embedding will be used for; the service tunes its output to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddingTask {
    #[serde(rename = "retrieval.query")]
    RetrievalQuery,
    #[serde(rename = "retrieval.passage")]
    RetrievalPassage,
    #[serde(rename = "separation")]
    Separation,
    #[serde(rename = "classification")]
    Classification,
    #[serde(rename = "text-matching")]
    TextMatching,
}

impl fmt::Display for EmbeddingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EmbeddingTask::RetrievalQuery => "retrieval.query",
            EmbeddingTask::RetrievalPassage => "retrieval.passage",
            EmbeddingTask::Separation => "separation",
            EmbeddingTask::Classification => "classification",
            EmbeddingTask::TextMatching => "text-matching",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingOptions {
    pub size: EmbeddingSize,
    pub task: EmbeddingTask,
}

/// Maps texts to vectors via some (usually remote) model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. Vectors are returned in input order.
    async fn embed(
        &self,
        texts: &[String],
        options: EmbeddingOptions,
    ) -> Result<Vec<Vec<f32>>, EmbeddingsError>;
}

/// Embed a single search query with the `retrieval.query` task.
pub async fn embed_query(
    embedder: &dyn Embedder,
    text: &str,
    size: EmbeddingSize,
) -> Result<Vec<f32>, EmbeddingsError> {
    let options = EmbeddingOptions {
        size,
        task: EmbeddingTask::RetrievalQuery,
    };
    embedder
        .embed(&[text.to_string()], options)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EmbeddingsError::internal("empty embedding response"))
}

/// Embed each chunk with its own call, keeping per-chunk outcomes in order.
pub async fn embed_each(
    embedder: &dyn Embedder,
    chunks: Vec<DocumentChunk>,
    options: EmbeddingOptions,
    concurrency: usize,
) -> Vec<Result<DocumentChunk, EmbeddingsError>> {
    stream::iter(chunks)
        .map(|mut chunk| async move {
            let vector = embedder
                .embed(std::slice::from_ref(&chunk.page_content), options)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| EmbeddingsError::internal("empty embedding response"))?;
            chunk.vector = Some(vector);
            Ok::<_, EmbeddingsError>(chunk)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Embed chunks, returning only those that succeeded.
///
/// Every failure is logged with the chunk's path and id; none of them
/// escapes the call.
pub async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: Vec<DocumentChunk>,
    options: EmbeddingOptions,
    concurrency: usize,
) -> Vec<DocumentChunk> {
    let ids: Vec<(String, String)> = chunks
        .iter()
        .map(|c| (c.id.clone(), c.metadata.path.clone()))
        .collect();

    let outcomes = embed_each(embedder, chunks, options, concurrency).await;

    let mut embedded = Vec::with_capacity(outcomes.len());
    for ((id, path), outcome) in ids.into_iter().zip(outcomes) {
        match outcome {
            Ok(chunk) => embedded.push(chunk),
            Err(e) => error!(chunk = %id, path = %path, kind = %e.kind, "embedding failed: {}", e.message),
        }
    }
    embedded
}

// ============ HTTP Client ============

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    texts: &'a [String],
    size: EmbeddingSize,
    task: EmbeddingTask,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for the remote embeddings service.
pub struct EmbeddingsClient {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl EmbeddingsClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/embeddings", config.url.trim_end_matches('/')),
            max_retries: config.max_retries,
        })
    }

    async fn embed_once(
        &self,
        texts: &[String],
        options: EmbeddingOptions,
    ) -> Result<Vec<Vec<f32>>, Attempt> {
        let body = EmbeddingsRequest {
            texts,
            size: options.size,
            task: options.task,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Attempt::Retry(EmbeddingsError::internal(e.to_string())))?;

        let status = response.status();
        if status.is_success() {
            let parsed: EmbeddingsResponse = response.json().await.map_err(|e| {
                Attempt::Fatal(EmbeddingsError::internal(format!(
                    "invalid embeddings response: {}",
                    e
                )))
            })?;
            return validate(parsed.embeddings, texts.len(), options.size).map_err(Attempt::Fatal);
        }

        let body_text = response.text().await.unwrap_or_default();
        let message = format!("embeddings service returned {}: {}", status, body_text);
        if status.as_u16() == 429 || status.is_server_error() {
            if status.is_server_error() {
                Err(Attempt::Retry(EmbeddingsError::internal(message)))
            } else {
                Err(Attempt::Retry(EmbeddingsError::bad_request(message)))
            }
        } else {
            Err(Attempt::Fatal(EmbeddingsError::bad_request(message)))
        }
    }
}

enum Attempt {
    Retry(EmbeddingsError),
    Fatal(EmbeddingsError),
}

fn validate(
    embeddings: Vec<Vec<f32>>,
    expected: usize,
    size: EmbeddingSize,
) -> Result<Vec<Vec<f32>>, EmbeddingsError> {
    if embeddings.len() != expected {
        return Err(EmbeddingsError::internal(format!(
            "expected {} embeddings, got {}",
            expected,
            embeddings.len()
        )));
    }
    if let Some(bad) = embeddings.iter().find(|v| v.len() != size.dims()) {
        return Err(EmbeddingsError::internal(format!(
            "expected {} dimensions, got {}",
            size.dims(),
            bad.len()
        )));
    }
    Ok(embeddings)
}

#[async_trait]
impl Embedder for EmbeddingsClient {
    async fn embed(
        &self,
        texts: &[String],
        options: EmbeddingOptions,
    ) -> Result<Vec<Vec<f32>>, EmbeddingsError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            debug!(texts = texts.len(), size = options.size.dims(), task = %options.task, attempt, "embedding request");
            match self.embed_once(texts, options).await {
                Ok(vectors) => return Ok(vectors),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| EmbeddingsError::internal("embedding failed after retries")))
    }
}
