//! Sync engine: reconciles the vault tree with the search index.
//!
//! A full pass ([`SyncEngine::sync`]) runs through these phases:
//!
//! ```text
//! computing-delta → deleting-stale → creating-missing → done
//! ```
//!
//! 1. The authoritative path list is computed once from the vault tree.
//! 2. One bulk delete removes every entry whose `metadata.path` is not in
//!    that list. Its failure fails the pass.
//! 3. Each path is checked with `contains`; paths with no entries are missing.
//! 4. Missing files run the full pipeline:
//!    read → [`chunk_documents`] → [`embed_chunks`] → [`SearchIndex::add`].
//!
//! Per-document failures in step 3 and 4 are logged and reported but never
//! abort the pass. Stale deletion always completes before any creation.
//!
//! The engine also exposes the single-file operations driven by file-tree
//! events: [`create`](SyncEngine::create), [`update`](SyncEngine::update),
//! [`delete`](SyncEngine::delete) and [`move_file`](SyncEngine::move_file).
//!
//! Passes against the same index must be serialized by the caller.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_documents, content_hash, ChunkParams};
use crate::config::Config;
use crate::embedding::{embed_chunks, Embedder, EmbeddingOptions};
use crate::index::{Filter, QueryOptions, SearchIndex};
use crate::models::{file_name, Document, DocumentChunk, FileDescriptor, PathKeyed, PATH_FIELD};
use crate::status::StatusIndicator;

/// Page size for the full index scan behind [`SyncEngine::plan`].
const SCAN_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    ComputingDelta,
    DeletingStale,
    CreatingMissing,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::ComputingDelta => "computing-delta",
            SyncPhase::DeletingStale => "deleting-stale",
            SyncPhase::CreatingMissing => "creating-missing",
            SyncPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Supported files in the authoritative tree.
    pub files: usize,
    /// Paths that had no entries in the index.
    pub missing: usize,
    /// Missing paths that got at least one chunk indexed.
    pub created: usize,
    /// Chunks written during the pass.
    pub chunks: usize,
    /// Paths whose probe or creation failed; retried on the next pass.
    pub failed: Vec<String>,
}

/// Paths to create and delete when reconciling two path-keyed lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDelta<T> {
    pub to_create: Vec<T>,
    pub to_delete: Vec<T>,
}

/// Compare what is indexed (`synced`) with what should be (`unsynced`).
///
/// Items present in both, by path, appear in neither list. Input order is
/// preserved.
pub fn documents_to_delete_or_create<T>(synced: &[T], unsynced: &[T]) -> SyncDelta<T>
where
    T: PathKeyed + Clone,
{
    let synced_paths: HashSet<&str> = synced.iter().map(|d| d.path()).collect();
    let unsynced_paths: HashSet<&str> = unsynced.iter().map(|d| d.path()).collect();

    let to_create = unsynced
        .iter()
        .filter(|d| !synced_paths.contains(d.path()))
        .cloned()
        .collect();
    let to_delete = synced
        .iter()
        .filter(|d| !unsynced_paths.contains(d.path()))
        .cloned()
        .collect();

    SyncDelta {
        to_create,
        to_delete,
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub vault_root: PathBuf,
    pub chunk: ChunkParams,
    pub embedding: EmbeddingOptions,
    pub embed_concurrency: usize,
    /// Documents probed or created at once within a pass.
    pub concurrency: usize,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            vault_root: config.vault.root.clone(),
            chunk: config.chunking.params(),
            embedding: config.embedding.passage_options(),
            embed_concurrency: config.embedding.concurrency,
            concurrency: config.sync.concurrency,
        }
    }
}

pub struct SyncEngine {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    settings: SyncSettings,
    status: StatusIndicator,
}

impl SyncEngine {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            index,
            embedder,
            settings,
            status: StatusIndicator::new(),
        }
    }

    pub fn with_status(mut self, status: StatusIndicator) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> &StatusIndicator {
        &self.status
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    // ============ Single-file operations ============

    pub async fn create(&self, file: &FileDescriptor) -> Result<usize> {
        self.create_all(std::slice::from_ref(file)).await
    }

    /// Read, chunk, embed and index `files`. Returns the number of chunks
    /// written. Unreadable files and failed embeddings are logged and
    /// skipped.
    pub async fn create_all(&self, files: &[FileDescriptor]) -> Result<usize> {
        let documents = self.read_documents(files).await;
        self.index_documents(&documents).await
    }

    pub async fn delete(&self, file: &FileDescriptor) -> Result<()> {
        self.delete_all(std::slice::from_ref(file)).await
    }

    pub async fn delete_all(&self, files: &[FileDescriptor]) -> Result<()> {
        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        self.index.delete_by(&paths, PATH_FIELD).await
    }

    pub async fn delete_by(&self, values: &[String], field: &str) -> Result<()> {
        self.index.delete_by(values, field).await
    }

    /// Replace every chunk of a modified file.
    pub async fn update(&self, file: &FileDescriptor) -> Result<usize> {
        self.delete(file).await?;
        self.create(file).await
    }

    /// Follow a rename.
    ///
    /// When the indexed chunks of `old_path` were produced from the same
    /// content the file has now, they are re-added under the new path with
    /// their ids and vectors intact. Otherwise the old path is deleted and
    /// the file indexed from scratch. Renaming to an unsupported type only
    /// deletes the old path.
    pub async fn move_file(&self, old_path: &str, file: &FileDescriptor) -> Result<()> {
        let old = [old_path.to_string()];
        if !file.is_supported() {
            return self.index.delete_by(&old, PATH_FIELD).await;
        }
        if old_path != file.path {
            self.index.delete_by(&[file.path.clone()], PATH_FIELD).await?;
        }

        let document = match Document::from_file(file, &self.settings.vault_root).await {
            Ok(document) => document,
            Err(e) => {
                self.index.delete_by(&old, PATH_FIELD).await?;
                return Err(e).with_context(|| format!("move {} -> {}", old_path, file.path));
            }
        };

        let existing = self.index.find_by(old_path, PATH_FIELD).await?;
        let hash = content_hash(&document.page_content);
        let reusable = !existing.is_empty()
            && existing
                .iter()
                .all(|c| c.metadata.hash == hash && c.vector.is_some());

        if reusable {
            let moved: Vec<DocumentChunk> = existing
                .into_iter()
                .map(|mut chunk| {
                    chunk.metadata.path = file.path.clone();
                    chunk.metadata.filename = file_name(&file.path).to_string();
                    chunk
                })
                .collect();
            debug!(from = old_path, to = %file.path, chunks = moved.len(), "rewriting paths");
            return self.index.add(&moved).await;
        }

        debug!(from = old_path, to = %file.path, "content changed, re-indexing");
        self.index.delete_by(&old, PATH_FIELD).await?;
        self.index_documents(&[document]).await?;
        Ok(())
    }

    // ============ Index lifecycle ============

    pub async fn healthy(&self) -> bool {
        self.index.healthy().await
    }

    pub async fn create_index(&self) -> Result<bool> {
        self.index.create_index().await
    }

    /// Delete the index (if present) and provision it again.
    pub async fn reset_index(&self) -> Result<bool> {
        if self.index.index_exists().await? {
            self.index.delete_index().await?;
        }
        self.index.create_index().await
    }

    // ============ Reconciliation ============

    /// Run one full reconciliation pass against `files`, updating the
    /// status indicator with the outcome.
    pub async fn sync(&self, files: &[FileDescriptor]) -> Result<SyncReport> {
        self.status.syncing();
        let result = self.run_pass(files).await;
        match &result {
            Ok(report) if report.failed.is_empty() => self.status.ok(),
            Ok(report) => self
                .status
                .failed(format!("{} documents failed to sync", report.failed.len())),
            Err(e) => self.status.failed(format!("{:#}", e)),
        }
        result
    }

    /// Run [`sync`](Self::sync) in the background.
    pub fn spawn_sync(self: &Arc<Self>, files: Vec<FileDescriptor>) -> SyncTask {
        let engine = Arc::clone(self);
        SyncTask {
            handle: tokio::spawn(async move { engine.sync(&files).await }),
        }
    }

    async fn run_pass(&self, files: &[FileDescriptor]) -> Result<SyncReport> {
        debug!(phase = %SyncPhase::ComputingDelta);
        let files: Vec<FileDescriptor> = {
            let mut seen = HashSet::new();
            files
                .iter()
                .filter(|f| f.is_supported() && seen.insert(f.path.as_str()))
                .cloned()
                .collect()
        };
        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();

        debug!(phase = %SyncPhase::DeletingStale);
        let stale = if paths.is_empty() {
            Filter::exists(PATH_FIELD)
        } else {
            Filter::not_in(PATH_FIELD, &paths)
        };
        self.index
            .delete_by_filter(&stale)
            .await
            .context("failed to delete stale entries")?;

        debug!(phase = %SyncPhase::CreatingMissing);
        let mut report = SyncReport {
            files: files.len(),
            ..SyncReport::default()
        };

        let probes: Vec<(FileDescriptor, Result<bool>)> = stream::iter(files)
            .map(|file: FileDescriptor| async move {
                let found = self.index.contains(&file.path, PATH_FIELD).await;
                (file, found.map(|present| !present))
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut missing = Vec::new();
        for (file, probe) in probes {
            match probe {
                Ok(true) => missing.push(file),
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %file.path, "probe failed: {:#}", e);
                    report.failed.push(file.path.clone());
                }
            }
        }
        report.missing = missing.len();

        let outcomes: Vec<(FileDescriptor, Result<usize>)> = stream::iter(missing)
            .map(|file: FileDescriptor| async move {
                let outcome = self.create(&file).await;
                (file, outcome)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (file, outcome) in outcomes {
            match outcome {
                Ok(0) => debug!(path = %file.path, "nothing indexed"),
                Ok(chunks) => {
                    report.created += 1;
                    report.chunks += chunks;
                }
                Err(e) => {
                    warn!(path = %file.path, "create failed: {:#}", e);
                    report.failed.push(file.path.clone());
                }
            }
        }
        report.failed.sort();

        debug!(phase = %SyncPhase::Done);
        info!(
            files = report.files,
            missing = report.missing,
            created = report.created,
            chunks = report.chunks,
            failed = report.failed.len(),
            "sync pass complete"
        );
        Ok(report)
    }

    /// Compute the delta between indexed paths (full paginated scan) and
    /// `files` without changing anything.
    pub async fn plan(&self, files: &[FileDescriptor]) -> Result<SyncDelta<FileDescriptor>> {
        let options = QueryOptions {
            limit: SCAN_PAGE_SIZE,
            fields: vec!["metadata".to_string()],
            ..QueryOptions::default()
        };
        let indexed: BTreeSet<String> = self
            .index
            .all(options)
            .try_fold(BTreeSet::new(), |mut paths, page| async move {
                paths.extend(page.into_iter().map(|c| c.metadata.path));
                Ok(paths)
            })
            .await?;

        let indexed: Vec<FileDescriptor> =
            indexed.iter().map(|p| FileDescriptor::from_path(p)).collect();
        let wanted: Vec<FileDescriptor> =
            files.iter().filter(|f| f.is_supported()).cloned().collect();
        Ok(documents_to_delete_or_create(&indexed, &wanted))
    }

    // ============ Pipeline ============

    async fn read_documents(&self, files: &[FileDescriptor]) -> Vec<Document> {
        Document::from_files(files, &self.settings.vault_root)
            .await
            .into_iter()
            .zip(files)
            .filter_map(|(outcome, file)| match outcome {
                Ok(document) => Some(document),
                Err(e) => {
                    warn!(path = %file.path, kind = %e.kind, "skipping file: {}", e.message);
                    None
                }
            })
            .collect()
    }

    async fn index_documents(&self, documents: &[Document]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        let chunks = chunk_documents(documents, self.settings.chunk)?;
        let total = chunks.len();
        let embedded = embed_chunks(
            self.embedder.as_ref(),
            chunks,
            self.settings.embedding,
            self.settings.embed_concurrency,
        )
        .await;
        if embedded.len() < total {
            warn!(
                dropped = total - embedded.len(),
                total, "some chunks were not embedded"
            );
        }
        self.index.add(&embedded).await?;
        Ok(embedded.len())
    }
}

/// Handle to a background reconciliation pass.
pub struct SyncTask {
    handle: JoinHandle<Result<SyncReport>>,
}

impl SyncTask {
    /// Wait for the pass to finish and return its outcome.
    pub async fn wait(self) -> Result<SyncReport> {
        self.handle.await.context("sync task did not complete")?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        path: &'static str,
    }

    impl PathKeyed for Item {
        fn path(&self) -> &str {
            self.path
        }
    }

    fn item(id: &'static str, path: &'static str) -> Item {
        Item { id, path }
    }

    #[test]
    fn test_delta_example() {
        let synced = vec![item("a", "x"), item("b", "y"), item("c", "z")];
        let unsynced = vec![item("a", "q"), item("c", "z"), item("d", "p")];

        let delta = documents_to_delete_or_create(&synced, &unsynced);
        assert_eq!(delta.to_delete, vec![item("a", "x"), item("b", "y")]);
        assert_eq!(delta.to_create, vec![item("a", "q"), item("d", "p")]);
    }

    #[test]
    fn test_delta_identical_sets_is_empty() {
        let items = vec![item("a", "x"), item("b", "y")];
        let delta = documents_to_delete_or_create(&items, &items);
        assert!(delta.to_create.is_empty());
        assert!(delta.to_delete.is_empty());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(SyncPhase::ComputingDelta.to_string(), "computing-delta");
        assert_eq!(SyncPhase::Done.to_string(), "done");
    }
}
