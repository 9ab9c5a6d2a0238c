//! Recursive character text splitter.
//!
//! Splits document text into overlapping windows of at most `chunk_size`
//! characters, preferring natural boundaries: paragraphs (`\n\n`), then
//! lines (`\n`), then words (` `), then single characters.
//!
//! # Algorithm
//!
//! 1. Pick the first separator that occurs in the text.
//! 2. Split on it, keeping the separator at the start of the following piece.
//! 3. Pieces shorter than `chunk_size` are merged greedily into windows; when
//!    a window is full it is emitted and pieces are dropped from its front
//!    until at most `chunk_overlap` characters remain to seed the next one.
//! 4. Pieces that are too long on their own are split recursively with the
//!    remaining, finer separators.
//!
//! Windows are byte ranges into the source, so every chunk is an exact
//! substring of its document and carries the 1-based line span it came from.
//! Whitespace-only windows are dropped.
//!
//! # Example
//!
//! ```rust
//! use vault_sync::chunk::{ChunkParams, TextSplitter};
//!
//! let splitter = TextSplitter::new(ChunkParams { chunk_size: 20, chunk_overlap: 5 });
//! let text = "First paragraph.\n\nSecond paragraph.";
//! let windows = splitter.split(text);
//! assert_eq!(windows.len(), 2);
//! assert_eq!(&text[windows[0].clone()], "First paragraph.");
//! ```

use std::collections::VecDeque;
use std::ops::Range;

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ChunkMetadata, Document, DocumentChunk, LineSpan, Loc};

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Window size and overlap, both measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("document at '{path}' has no id")]
    MissingDocumentId { path: String },
}

/// Split every document into chunks.
///
/// The result is flat and ordered: all chunks of `documents[0]` in text
/// order, then all chunks of `documents[1]`, and so on. Each chunk gets a
/// fresh id and a back-reference to its document.
///
/// Fails for the whole call if any document has an empty id.
pub fn chunk_documents(
    documents: &[Document],
    params: ChunkParams,
) -> Result<Vec<DocumentChunk>, ChunkError> {
    if let Some(doc) = documents.iter().find(|d| d.id.is_empty()) {
        return Err(ChunkError::MissingDocumentId {
            path: doc.metadata.path.clone(),
        });
    }

    let splitter = TextSplitter::new(params);
    let mut chunks = Vec::new();

    for document in documents {
        let text = &document.page_content;
        let hash = content_hash(text);
        let lines = LineIndex::new(text);

        for range in splitter.split(text) {
            chunks.push(DocumentChunk {
                id: Uuid::new_v4().to_string(),
                page_content: text[range.clone()].to_string(),
                metadata: ChunkMetadata {
                    document_id: document.id.clone(),
                    filename: document.metadata.filename.clone(),
                    path: document.metadata.path.clone(),
                    extension: document.metadata.extension.clone(),
                    loc: Loc {
                        lines: lines.span(text, range),
                    },
                    hash: hash.clone(),
                },
                vector: None,
            });
        }
    }

    Ok(chunks)
}

/// SHA-256 of a document's content, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Recursive splitter producing byte ranges into the source text.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(params: ChunkParams) -> Self {
        Self {
            chunk_size: params.chunk_size.max(1),
            chunk_overlap: params.chunk_overlap,
        }
    }

    /// Split `text` into windows, returned as byte ranges in text order.
    pub fn split(&self, text: &str) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        if !text.is_empty() {
            self.split_range(text, 0..text.len(), &SEPARATORS, &mut out);
        }
        out
    }

    fn split_range(
        &self,
        text: &str,
        range: Range<usize>,
        separators: &[&str],
        out: &mut Vec<Range<usize>>,
    ) {
        let slice = &text[range.clone()];

        let mut separator = "";
        let mut finer: &[&str] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() {
                separator = sep;
                finer = &[];
                break;
            }
            if slice.contains(sep) {
                separator = sep;
                finer = &separators[i + 1..];
                break;
            }
        }

        let mut good: Vec<Range<usize>> = Vec::new();
        for piece in split_keeping_separator(slice, separator, range.start) {
            if char_len(text, &piece) < self.chunk_size {
                good.push(piece);
                continue;
            }

            if !good.is_empty() {
                self.merge(text, &good, out);
                good.clear();
            }
            if finer.is_empty() {
                out.push(piece);
            } else {
                self.split_range(text, piece, finer, out);
            }
        }

        if !good.is_empty() {
            self.merge(text, &good, out);
        }
    }

    /// Greedily merge consecutive pieces into windows of at most
    /// `chunk_size` characters, carrying up to `chunk_overlap` over.
    fn merge(&self, text: &str, pieces: &[Range<usize>], out: &mut Vec<Range<usize>>) {
        let mut current: VecDeque<(Range<usize>, usize)> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(text, piece);

            if total + len > self.chunk_size && !current.is_empty() {
                push_window(text, &current, out);

                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    match current.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }

            current.push_back((piece.clone(), len));
            total += len;
        }

        push_window(text, &current, out);
    }
}

fn push_window(text: &str, current: &VecDeque<(Range<usize>, usize)>, out: &mut Vec<Range<usize>>) {
    let (Some((first, _)), Some((last, _))) = (current.front(), current.back()) else {
        return;
    };
    let window = first.start..last.end;
    if !text[window.clone()].trim().is_empty() {
        out.push(window);
    }
}

/// Split `slice` before every occurrence of `separator`; an empty separator
/// splits into single characters. Ranges are offset by `base`.
fn split_keeping_separator(slice: &str, separator: &str, base: usize) -> Vec<Range<usize>> {
    if separator.is_empty() {
        return slice
            .char_indices()
            .map(|(i, c)| base + i..base + i + c.len_utf8())
            .collect();
    }

    let mut starts: Vec<usize> = vec![0];
    starts.extend(slice.match_indices(separator).map(|(i, _)| i).filter(|&i| i > 0));
    starts.push(slice.len());

    starts
        .windows(2)
        .filter(|w| w[1] > w[0])
        .map(|w| base + w[0]..base + w[1])
        .collect()
}

fn char_len(text: &str, range: &Range<usize>) -> usize {
    text[range.clone()].chars().count()
}

/// Maps byte offsets to 1-based line numbers.
struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self { line_starts }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&start| start <= offset)
    }

    /// Line span of the non-whitespace content of `range`.
    fn span(&self, text: &str, range: Range<usize>) -> LineSpan {
        let window = &text[range.clone()];
        let leading = window.len() - window.trim_start().len();
        let content_end = range.start + window.trim_end().len();
        let first = range.start + leading;
        let last = content_end.saturating_sub(1).max(first);
        LineSpan {
            from: self.line_of(first),
            to: self.line_of(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn doc(id: &str, path: &str, text: &str) -> Document {
        Document {
            id: id.to_string(),
            page_content: text.to_string(),
            metadata: DocumentMetadata {
                filename: path.to_string(),
                extension: "md".to_string(),
                path: path.to_string(),
            },
        }
    }

    fn params(chunk_size: usize, chunk_overlap: usize) -> ChunkParams {
        ChunkParams {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Every window is within bounds, ordered, and together they cover the
    /// text except for whitespace.
    fn assert_covers(text: &str, windows: &[Range<usize>], chunk_size: usize) {
        let mut covered_to = 0usize;
        let mut last_start = 0usize;
        for w in windows {
            assert!(w.start >= last_start, "windows out of order: {:?}", windows);
            assert!(char_len(text, w) <= chunk_size, "window too large: {:?}", w);
            if w.start > covered_to {
                assert!(
                    text[covered_to..w.start].trim().is_empty(),
                    "lost text: {:?}",
                    &text[covered_to..w.start]
                );
            }
            covered_to = covered_to.max(w.end);
            last_start = w.start;
        }
        assert!(text[covered_to..].trim().is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let splitter = TextSplitter::new(params(100, 10));
        let windows = splitter.split("Hello, world!");
        assert_eq!(windows, vec![0..13]);
    }

    #[test]
    fn test_empty_and_whitespace_text() {
        let splitter = TextSplitter::new(params(100, 10));
        assert!(splitter.split("").is_empty());
        assert!(splitter.split("   \n\n  ").is_empty());
    }

    #[test]
    fn test_two_paragraphs_make_two_chunks() {
        let para = "a".repeat(150);
        let text = format!("{}\n\n{}", para, para);
        let doc = doc("doc-1", "Reading.md", &text);
        let chunks = chunk_documents(&[doc], params(200, 50)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.metadata.document_id == "doc-1"));
        assert_eq!(chunks[0].page_content, para);
        assert_eq!(chunks[1].page_content.trim(), para);
        assert_eq!(chunks[0].metadata.loc.lines, LineSpan { from: 1, to: 1 });
        assert_eq!(chunks[1].metadata.loc.lines, LineSpan { from: 3, to: 3 });
    }

    #[test]
    fn test_words_overlap_between_windows() {
        let text = (0..40)
            .map(|i| format!("w{:02}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let splitter = TextSplitter::new(params(20, 8));
        let windows = splitter.split(&text);
        assert!(windows.len() > 1);
        for pair in windows.windows(2) {
            assert!(pair[1].start < pair[0].end, "no overlap in {:?}", pair);
            let overlap = char_len(&text, &(pair[1].start..pair[0].end));
            assert!(overlap <= 8);
        }
        assert_covers(&text, &windows, 20);
    }

    #[test]
    fn test_long_word_falls_back_to_characters() {
        let text = "x".repeat(45);
        let splitter = TextSplitter::new(params(10, 3));
        let windows = splitter.split(&text);
        assert!(windows.len() >= 5);
        assert_covers(&text, &windows, 10);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end - pair[1].start, 3);
        }
    }

    #[test]
    fn test_mixed_structure_covers_source() {
        let text = "# Title\n\nIntro line one.\nIntro line two is a bit longer than the rest.\n\n\
                    A paragraph with several words that will need to be broken at word boundaries \
                    because it is long.\n\nTail.";
        for (size, overlap) in [(30, 10), (50, 0), (17, 16), (200, 50)] {
            let splitter = TextSplitter::new(params(size, overlap));
            let windows = splitter.split(text);
            assert_covers(text, &windows, size);
        }
    }

    #[test]
    fn test_multibyte_text_stays_on_char_boundaries() {
        let text = "héllo wörld ünïcödé ".repeat(10);
        let splitter = TextSplitter::new(params(12, 4));
        let windows = splitter.split(&text);
        assert_covers(&text, &windows, 12);
    }

    #[test]
    fn test_line_spans_are_non_decreasing() {
        let text = (1..=30)
            .map(|i| format!("line number {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_documents(&[doc("d", "lines.md", &text)], params(60, 20)).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].metadata.loc.lines.from, 1);
        assert_eq!(chunks.last().unwrap().metadata.loc.lines.to, 30);
        for pair in chunks.windows(2) {
            assert!(pair[1].metadata.loc.lines.from >= pair[0].metadata.loc.lines.from);
            assert!(pair[0].metadata.loc.lines.from <= pair[0].metadata.loc.lines.to);
        }
    }

    #[test]
    fn test_documents_stay_in_order() {
        let docs = vec![
            doc("first", "a.md", "alpha one\n\nalpha two"),
            doc("second", "b.md", "beta one\n\nbeta two"),
        ];
        let chunks = chunk_documents(&docs, params(10, 2)).unwrap();
        let ids: Vec<&str> = chunks
            .iter()
            .map(|c| c.metadata.document_id.as_str())
            .collect();
        let split = ids.iter().position(|id| *id == "second").unwrap();
        assert!(ids[..split].iter().all(|id| *id == "first"));
        assert!(ids[split..].iter().all(|id| *id == "second"));
    }

    #[test]
    fn test_chunk_ids_are_fresh_and_hash_is_shared() {
        let chunks =
            chunk_documents(&[doc("d", "a.md", "one two three four five six")], params(10, 0))
                .unwrap();
        assert!(chunks.len() > 1);
        assert_ne!(chunks[0].id, chunks[1].id);
        assert_eq!(chunks[0].metadata.hash, chunks[1].metadata.hash);
        assert_eq!(chunks[0].metadata.hash, content_hash("one two three four five six"));
    }

    #[test]
    fn test_missing_document_id_fails_whole_call() {
        let docs = vec![doc("ok", "a.md", "text"), doc("", "b.md", "text")];
        let err = chunk_documents(&docs, params(10, 2)).unwrap_err();
        assert_eq!(
            err,
            ChunkError::MissingDocumentId {
                path: "b.md".to_string()
            }
        );
    }
}
