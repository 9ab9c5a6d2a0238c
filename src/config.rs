use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkParams;
use crate::embedding::{EmbeddingOptions, EmbeddingSize, EmbeddingTask};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

fn default_chunk_size() -> usize {
    3000
}
fn default_chunk_overlap() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_size")]
    pub size: EmbeddingSize,
    #[serde(default = "default_task")]
    pub task: EmbeddingTask,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            size: default_size(),
            task: default_task(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            concurrency: default_embedding_concurrency(),
        }
    }
}

impl EmbeddingConfig {
    /// Options used when embedding document chunks.
    pub fn passage_options(&self) -> EmbeddingOptions {
        EmbeddingOptions {
            size: self.size,
            task: self.task,
        }
    }
}

fn default_embedding_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_size() -> EmbeddingSize {
    EmbeddingSize::D512
}
fn default_task() -> EmbeddingTask {
    EmbeddingTask::RetrievalPassage
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embedding_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default = "default_embedder")]
    pub embedder: String,
    #[serde(default = "default_task_poll_ms")]
    pub task_poll_ms: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_key: None,
            uid: default_uid(),
            embedder: default_embedder(),
            task_poll_ms: default_task_poll_ms(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl IndexConfig {
    /// The configured key, or `MEILI_MASTER_KEY` from the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("MEILI_MASTER_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

fn default_host() -> String {
    "http://localhost:7700".to_string()
}
fn default_uid() -> String {
    "vault-sync".to_string()
}
fn default_embedder() -> String {
    "pageContent_embeddings".to_string()
}
fn default_task_poll_ms() -> u64 {
    50
}
fn default_task_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            health_interval_ms: default_health_interval_ms(),
            concurrency: default_sync_concurrency(),
            resync_interval_secs: default_resync_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

fn default_debounce_secs() -> u64 {
    10
}
fn default_health_interval_ms() -> u64 {
    1000
}
fn default_sync_concurrency() -> usize {
    8
}
fn default_resync_interval_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a TOML configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.chunk_overlap,
            config.chunking.chunk_size
        );
    }

    // Validate concurrency
    if config.embedding.concurrency == 0 {
        bail!("embedding.concurrency must be >= 1");
    }
    if config.sync.concurrency == 0 {
        bail!("sync.concurrency must be >= 1");
    }

    if config.index.uid.trim().is_empty() {
        bail!("index.uid must not be empty");
    }
    if config.index.task_poll_ms == 0 {
        bail!("index.task_poll_ms must be > 0");
    }

    Ok(config)
}
