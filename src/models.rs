//! Core data models used throughout vault-sync.
//!
//! These types represent the files, documents, chunks, and search hits that
//! flow through the synchronization pipeline, plus the typed error values
//! produced by the document reader and the embeddings client.
//!
//! Error values here are *data*: they are returned per item, logged, and
//! filtered out of the pipeline rather than aborting a batch.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only file extension the pipeline indexes.
pub const SUPPORTED_EXTENSION: &str = "md";

/// Filterable index field holding a chunk's vault-relative path.
pub const PATH_FIELD: &str = "metadata.path";

/// Returns the last segment of a `/`-separated path.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Returns the text after the last `.` of a file name, if there is one.
pub fn extension(name: &str) -> Option<&str> {
    let name = file_name(name);
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Anything that can be reconciled against the index by its path.
pub trait PathKeyed {
    fn path(&self) -> &str;
}

/// Basic descriptor of a file in the vault tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub extension: String,
    /// Vault-relative path using `/` separators.
    pub path: String,
}

impl FileDescriptor {
    /// Build a descriptor from a vault-relative path.
    pub fn from_path(path: &str) -> Self {
        let path = path.replace('\\', "/");
        let name = file_name(&path).to_string();
        let extension = extension(&name).unwrap_or_default().to_string();
        Self {
            name,
            extension,
            path,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.extension == SUPPORTED_EXTENSION
    }
}

impl PathKeyed for FileDescriptor {
    fn path(&self) -> &str {
        &self.path
    }
}

/// Metadata attached to a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub filename: String,
    pub extension: String,
    pub path: String,
}

/// A source file read successfully from the vault.
///
/// Immutable once created: a changed file yields a new document with a new
/// id, and the chunks of the old one are deleted rather than mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub page_content: String,
    pub metadata: DocumentMetadata,
}

impl PathKeyed for Document {
    fn path(&self) -> &str {
        &self.metadata.path
    }
}

/// 1-based, inclusive line span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSpan {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub lines: LineSpan,
}

/// Metadata attached to a [`DocumentChunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Back-reference to the document that produced this chunk.
    pub document_id: String,
    pub filename: String,
    pub path: String,
    pub extension: String,
    pub loc: Loc,
    /// SHA-256 of the source document's full content.
    #[serde(default)]
    pub hash: String,
}

/// A segment of a document, and the unit stored in the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    pub id: String,
    #[serde(default)]
    pub page_content: String,
    pub metadata: ChunkMetadata,
    /// Attached after embedding. Index backends map this to their own
    /// vector field.
    #[serde(skip)]
    pub vector: Option<Vec<f32>>,
}

impl PathKeyed for DocumentChunk {
    fn path(&self) -> &str {
        &self.metadata.path
    }
}

/// A ranked hit returned from a vector search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub chunk: DocumentChunk,
    #[serde(rename = "_rankingScore", skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentErrorKind {
    Extension,
    Read,
}

impl fmt::Display for DocumentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentErrorKind::Extension => f.write_str("extension"),
            DocumentErrorKind::Read => f.write_str("read"),
        }
    }
}

/// A file that could not become a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DocumentError {
    #[serde(rename = "type")]
    pub kind: DocumentErrorKind,
    pub message: String,
}

impl DocumentError {
    pub fn extension(ext: &str) -> Self {
        Self {
            kind: DocumentErrorKind::Extension,
            message: format!("unsupported extension '{}'", ext),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self {
            kind: DocumentErrorKind::Read,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingsErrorKind {
    InternalServerError,
    BadRequest,
}

impl fmt::Display for EmbeddingsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingsErrorKind::InternalServerError => f.write_str("internal_server_error"),
            EmbeddingsErrorKind::BadRequest => f.write_str("bad_request"),
        }
    }
}

/// A failed call to the embeddings service.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct EmbeddingsError {
    #[serde(rename = "type")]
    pub kind: EmbeddingsErrorKind,
    pub message: String,
}

impl EmbeddingsError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: EmbeddingsErrorKind::InternalServerError,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: EmbeddingsErrorKind::BadRequest,
            message: message.into(),
        }
    }
}
