//! In-memory [`SearchIndex`] implementation for tests and offline runs.
//!
//! Entries live in a `BTreeMap` keyed by id behind `std::sync::RwLock`, so
//! pagination order is stable. Filters are evaluated against each entry's
//! serialized JSON. Vector search is brute-force cosine similarity and needs
//! a query embedder (see [`InMemoryIndex::with_query_embedder`]).
//!
//! Every add and delete is counted; [`InMemoryIndex::mutations`] lets tests
//! assert that a pass changed nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{Filter, QueryOptions, SearchIndex};
use crate::embedding::{embed_query, Embedder, EmbeddingSize};
use crate::models::{DocumentChunk, SearchHit};

pub struct InMemoryIndex {
    entries: RwLock<BTreeMap<String, DocumentChunk>>,
    exists: AtomicBool,
    available: AtomicBool,
    fail_deletes: AtomicBool,
    added: AtomicUsize,
    removed: AtomicUsize,
    query_embedder: Option<(Arc<dyn Embedder>, EmbeddingSize)>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            exists: AtomicBool::new(false),
            available: AtomicBool::new(true),
            fail_deletes: AtomicBool::new(false),
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            query_embedder: None,
        }
    }

    pub fn with_query_embedder(mut self, embedder: Arc<dyn Embedder>, size: EmbeddingSize) -> Self {
        self.query_embedder = Some((embedder, size));
        self
    }

    /// Toggle what [`SearchIndex::healthy`] reports.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every delete fail, simulating a remote task failure.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Total entries written plus entries removed since creation.
    pub fn mutations(&self) -> usize {
        self.added.load(Ordering::SeqCst) + self.removed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct indexed paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .read()
            .map(|entries| entries.values().map(|e| e.metadata.path.clone()).collect())
            .unwrap_or_default();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn entries(&self) -> Vec<DocumentChunk> {
        self.read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, DocumentChunk>>> {
        self.entries
            .read()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, DocumentChunk>>> {
        self.entries
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }

    fn check_deletes(&self) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("delete task failed: simulated failure");
        }
        Ok(())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

fn matches(filter: &Filter, entry: &DocumentChunk) -> Result<bool> {
    Ok(filter.matches(&serde_json::to_value(entry)?))
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn add(&self, entries: &[DocumentChunk]) -> Result<()> {
        let mut stored = self.write()?;
        for entry in entries {
            stored.insert(entry.id.clone(), entry.clone());
        }
        self.exists.store(true, Ordering::SeqCst);
        self.added.fetch_add(entries.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.check_deletes()?;
        let mut stored = self.write()?;
        let removed = ids.iter().filter(|id| stored.remove(*id).is_some()).count();
        self.removed.fetch_add(removed, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &Filter) -> Result<()> {
        self.check_deletes()?;
        let mut stored = self.write()?;
        let mut doomed = Vec::new();
        for (id, entry) in stored.iter() {
            if matches(filter, entry)? {
                doomed.push(id.clone());
            }
        }
        for id in &doomed {
            stored.remove(id);
        }
        self.removed.fetch_add(doomed.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_page(&self, options: &QueryOptions) -> Result<Vec<DocumentChunk>> {
        let stored = self.read()?;
        let keep_content =
            options.fields.is_empty() || options.fields.iter().any(|f| f == "pageContent");

        let mut page = Vec::new();
        let mut skipped = 0;
        for entry in stored.values() {
            if page.len() >= options.limit {
                break;
            }
            if let Some(filter) = &options.filter {
                if !matches(filter, entry)? {
                    continue;
                }
            }
            if skipped < options.offset {
                skipped += 1;
                continue;
            }
            let mut entry = entry.clone();
            if !options.with_vectors {
                entry.vector = None;
            }
            if !keep_content {
                entry.page_content.clear();
            }
            page.push(entry);
        }
        Ok(page)
    }

    async fn healthy(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn index_exists(&self) -> Result<bool> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn create_index(&self) -> Result<bool> {
        Ok(!self.exists.swap(true, Ordering::SeqCst))
    }

    async fn delete_index(&self) -> Result<()> {
        if !self.exists.swap(false, Ordering::SeqCst) {
            bail!("index not found");
        }
        let mut stored = self.write()?;
        self.removed.fetch_add(stored.len(), Ordering::SeqCst);
        stored.clear();
        Ok(())
    }

    async fn vector_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let Some((embedder, size)) = &self.query_embedder else {
            bail!("no query embedder configured");
        };
        let vector = embed_query(embedder.as_ref(), query, *size).await?;

        let stored = self.read()?;
        let mut scored: Vec<(f32, &DocumentChunk)> = stored
            .values()
            .filter_map(|entry| {
                let v = entry.vector.as_ref()?;
                Some((cosine_sim(&vector, v), entry))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, entry)| SearchHit {
                chunk: DocumentChunk {
                    vector: None,
                    ..entry.clone()
                },
                score: Some(f64::from(score)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, LineSpan, Loc};
    use futures::TryStreamExt;

    fn chunk(id: &str, path: &str, vector: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            page_content: format!("text of {}", id),
            metadata: ChunkMetadata {
                document_id: format!("doc-{}", path),
                filename: path.to_string(),
                path: path.to_string(),
                extension: "md".to_string(),
                loc: Loc {
                    lines: LineSpan { from: 1, to: 1 },
                },
                hash: String::new(),
            },
            vector: Some(vector),
        }
    }

    #[tokio::test]
    async fn test_pages_advance_and_terminate() {
        let index = InMemoryIndex::new();
        let entries: Vec<_> = (0..5)
            .map(|i| chunk(&format!("c{}", i), "a.md", vec![1.0]))
            .collect();
        index.add(&entries).await.unwrap();

        let options = QueryOptions {
            limit: 2,
            ..QueryOptions::default()
        };
        let pages: Vec<Vec<DocumentChunk>> = index.all(options).try_collect().await.unwrap();
        let sizes: Vec<usize> = pages.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(pages.iter().flatten().all(|c| c.vector.is_none()));
    }

    #[tokio::test]
    async fn test_field_projection_drops_content() {
        let index = InMemoryIndex::new();
        index.add(&[chunk("c1", "a.md", vec![1.0])]).await.unwrap();

        let options = QueryOptions {
            fields: vec!["id".to_string(), "metadata".to_string()],
            ..QueryOptions::default()
        };
        let page = index.fetch_page(&options).await.unwrap();
        assert_eq!(page[0].page_content, "");
        assert_eq!(page[0].metadata.path, "a.md");
    }

    #[tokio::test]
    async fn test_find_by_and_delete_by() {
        let index = InMemoryIndex::new();
        index
            .add(&[
                chunk("c1", "a.md", vec![1.0]),
                chunk("c2", "a.md", vec![1.0]),
                chunk("c3", "b.md", vec![1.0]),
            ])
            .await
            .unwrap();

        let found = index.find_by("a.md", "metadata.path").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.vector.is_some()));
        assert!(index.contains("b.md", "metadata.path").await.unwrap());
        assert!(!index.contains("c.md", "metadata.path").await.unwrap());

        index
            .delete_by(&["a.md".to_string()], "metadata.path")
            .await
            .unwrap();
        assert_eq!(index.paths(), vec!["b.md".to_string()]);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let index = InMemoryIndex::new();
        assert!(!index.index_exists().await.unwrap());
        assert!(index.create_index().await.unwrap());
        assert!(!index.create_index().await.unwrap());
        index.delete_index().await.unwrap();
        assert!(index.delete_index().await.is_err());
    }
}
