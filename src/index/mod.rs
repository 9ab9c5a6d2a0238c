//! Search index abstraction.
//!
//! The [`SearchIndex`] trait defines every remote primitive the sync engine
//! needs, enabling pluggable backends (the Meilisearch client, the
//! in-memory index used by tests).
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`add`](SearchIndex::add) | Upsert entries by id, waiting for the remote task |
//! | [`delete`](SearchIndex::delete) | Delete entries by id |
//! | [`delete_by`](SearchIndex::delete_by) | Delete entries whose field matches any value |
//! | [`delete_by_filter`](SearchIndex::delete_by_filter) | Delete entries matching a [`Filter`] |
//! | [`find_by`](SearchIndex::find_by) | Every entry whose field equals a value |
//! | [`contains`](SearchIndex::contains) | Whether any entry's field equals a value |
//! | [`all`](SearchIndex::all) | Lazy stream of pages |
//! | [`healthy`](SearchIndex::healthy) | Remote reports "available" |
//! | [`create_index`](SearchIndex::create_index) | Idempotent provisioning |
//! | [`delete_index`](SearchIndex::delete_index) | Remove the index |
//! | [`vector_search`](SearchIndex::vector_search) | Embed a query and rank entries |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod meili;
pub mod memory;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::models::{DocumentChunk, SearchHit};

/// Page size used when [`SearchIndex::find_by`] collects every match.
const FIND_PAGE_SIZE: usize = 1000;

/// Boolean filter over entry fields, rendered to the index's filter syntax.
///
/// Fields are dotted paths into the serialized entry (e.g. `metadata.path`)
/// and must be filterable attributes of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq { field: String, value: String },
    In { field: String, values: Vec<String> },
    Exists { field: String },
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: &str) -> Self {
        Filter::Eq {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn is_in(field: &str, values: &[String]) -> Self {
        Filter::In {
            field: field.to_string(),
            values: values.to_vec(),
        }
    }

    pub fn not_in(field: &str, values: &[String]) -> Self {
        Filter::Not(Box::new(Filter::is_in(field, values)))
    }

    pub fn exists(field: &str) -> Self {
        Filter::Exists {
            field: field.to_string(),
        }
    }

    /// Evaluate the filter against a serialized entry.
    pub fn matches(&self, entry: &Value) -> bool {
        match self {
            Filter::Eq { field, value } => field_value(entry, field).is_some_and(|v| v == *value),
            Filter::In { field, values } => {
                field_value(entry, field).is_some_and(|v| values.iter().any(|x| *x == v))
            }
            Filter::Exists { field } => lookup(entry, field).is_some_and(|v| !v.is_null()),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq { field, value } => write!(f, "{} = {}", field, quote(value)),
            Filter::In { field, values } => write!(f, "{} IN [{}]", field, quote_all(values)),
            Filter::Exists { field } => write!(f, "{} EXISTS", field),
            Filter::Not(inner) => match inner.as_ref() {
                Filter::In { field, values } => {
                    write!(f, "{} NOT IN [{}]", field, quote_all(values))
                }
                Filter::Exists { field } => write!(f, "{} NOT EXISTS", field),
                other => write!(f, "NOT ({})", other),
            },
            Filter::And(filters) => write!(f, "{}", join(filters, " AND ")),
            Filter::Or(filters) => write!(f, "{}", join(filters, " OR ")),
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn quote_all(values: &[String]) -> String {
    values
        .iter()
        .map(|v| quote(v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn join(filters: &[Filter], op: &str) -> String {
    filters
        .iter()
        .map(|f| format!("({})", f))
        .collect::<Vec<_>>()
        .join(op)
}

fn lookup<'a>(entry: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(entry, |v, key| v.get(key))
}

fn field_value(entry: &Value, field: &str) -> Option<String> {
    match lookup(entry, field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Paging and projection options for [`SearchIndex::all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub offset: usize,
    pub limit: usize,
    /// Attributes to return; empty means all. Entries projected without
    /// `pageContent` come back with empty text.
    pub fields: Vec<String>,
    pub filter: Option<Filter>,
    /// Also return stored vectors.
    pub with_vectors: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
            fields: Vec::new(),
            filter: None,
            with_vectors: false,
        }
    }
}

/// Abstract remote search index holding [`DocumentChunk`] entries keyed by id.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upsert entries by id. Returns once the remote task has finished and
    /// fails if it did not succeed.
    async fn add(&self, entries: &[DocumentChunk]) -> Result<()>;

    /// Delete entries by id.
    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Delete every entry matching `filter`.
    async fn delete_by_filter(&self, filter: &Filter) -> Result<()>;

    /// Delete every entry whose `field` equals any of `values`.
    async fn delete_by(&self, values: &[String], field: &str) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.delete_by_filter(&Filter::is_in(field, values)).await
    }

    /// Fetch a single page.
    async fn fetch_page(&self, options: &QueryOptions) -> Result<Vec<DocumentChunk>>;

    /// Lazily stream pages starting at `options.offset`, advancing by
    /// `options.limit` until an empty page comes back.
    fn all(&self, options: QueryOptions) -> BoxStream<'_, Result<Vec<DocumentChunk>>> {
        paginate(self, options)
    }

    /// Every entry whose `field` equals `value`, vectors included.
    async fn find_by(&self, value: &str, field: &str) -> Result<Vec<DocumentChunk>> {
        let options = QueryOptions {
            limit: FIND_PAGE_SIZE,
            filter: Some(Filter::eq(field, value)),
            with_vectors: true,
            ..QueryOptions::default()
        };
        let pages: Vec<Vec<DocumentChunk>> = self.all(options).try_collect().await?;
        Ok(pages.concat())
    }

    /// Whether any entry has `field` equal to `value`. Fetches a single id,
    /// no vectors.
    async fn contains(&self, value: &str, field: &str) -> Result<bool> {
        let options = QueryOptions {
            limit: 1,
            fields: vec!["id".to_string()],
            filter: Some(Filter::eq(field, value)),
            ..QueryOptions::default()
        };
        Ok(!self.fetch_page(&options).await?.is_empty())
    }

    /// True iff the remote reports itself available. Never fails.
    async fn healthy(&self) -> bool;

    async fn index_exists(&self) -> Result<bool>;

    /// Provision the index if it does not exist yet.
    async fn create_index(&self) -> Result<bool>;

    async fn delete_index(&self) -> Result<()>;

    /// Embed `query` and return the best matching entries.
    async fn vector_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// Page through `index` with offset/limit paging.
///
/// Each call starts a fresh sequence. A zero limit is treated as one so the
/// offset always advances.
pub fn paginate<'a, I>(index: &'a I, options: QueryOptions) -> BoxStream<'a, Result<Vec<DocumentChunk>>>
where
    I: SearchIndex + ?Sized,
{
    let options = QueryOptions {
        limit: options.limit.max(1),
        ..options
    };

    stream::try_unfold(options, move |options| async move {
        let page = index.fetch_page(&options).await?;
        if page.is_empty() {
            return Ok::<_, anyhow::Error>(None);
        }
        let next = QueryOptions {
            offset: options.offset + options.limit,
            ..options
        };
        Ok(Some((page, next)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(path: &str) -> Value {
        json!({ "id": "1", "metadata": { "path": path, "loc": { "lines": { "from": 3 } } } })
    }

    #[test]
    fn test_render_in_and_not_in() {
        let paths = vec!["a.md".to_string(), "dir/b.md".to_string()];
        assert_eq!(
            Filter::is_in("metadata.path", &paths).to_string(),
            r#"metadata.path IN ["a.md", "dir/b.md"]"#
        );
        assert_eq!(
            Filter::not_in("metadata.path", &paths).to_string(),
            r#"metadata.path NOT IN ["a.md", "dir/b.md"]"#
        );
    }

    #[test]
    fn test_render_escapes_quotes() {
        assert_eq!(
            Filter::eq("metadata.path", r#"say "hi".md"#).to_string(),
            r#"metadata.path = "say \"hi\".md""#
        );
    }

    #[test]
    fn test_render_compound() {
        let filter = Filter::And(vec![
            Filter::exists("metadata.path"),
            Filter::Not(Box::new(Filter::eq("metadata.path", "x.md"))),
        ]);
        assert_eq!(
            filter.to_string(),
            r#"(metadata.path EXISTS) AND (NOT (metadata.path = "x.md"))"#
        );
    }

    #[test]
    fn test_matches_nested_fields() {
        let paths = vec!["a.md".to_string()];
        assert!(Filter::eq("metadata.path", "a.md").matches(&entry("a.md")));
        assert!(Filter::is_in("metadata.path", &paths).matches(&entry("a.md")));
        assert!(Filter::not_in("metadata.path", &paths).matches(&entry("b.md")));
        assert!(Filter::exists("metadata.path").matches(&entry("b.md")));
        assert!(!Filter::exists("metadata.missing").matches(&entry("b.md")));
        assert!(Filter::eq("metadata.loc.lines.from", "3").matches(&entry("b.md")));
        assert!(Filter::Or(vec![
            Filter::eq("metadata.path", "nope"),
            Filter::eq("id", "1")
        ])
        .matches(&entry("a.md")));
    }
}
