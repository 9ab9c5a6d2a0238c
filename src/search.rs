//! Semantic search over the index, and retrieval-context formatting.

use anyhow::Result;

use crate::index::SearchIndex;
use crate::models::SearchHit;

const EXCERPT_CHARS: usize = 160;

/// Embed `query` and return the best `limit` hits. A blank query returns
/// nothing without touching the index.
pub async fn search(index: &dyn SearchIndex, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    index.vector_search(query, limit).await
}

/// Print ranked hits the way the `search` command shows them.
pub async fn run_search(index: &dyn SearchIndex, query: &str, limit: usize) -> Result<()> {
    let hits = search(index, query, limit).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let lines = hit.chunk.metadata.loc.lines;
        println!(
            "{}. [{:.2}] {} (lines {}-{})",
            i + 1,
            hit.score.unwrap_or_default(),
            hit.chunk.metadata.path,
            lines.from,
            lines.to
        );
        println!("    excerpt: \"{}\"", excerpt(&hit.chunk.page_content));
        println!("    id: {}", hit.chunk.id);
        println!();
    }
    Ok(())
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat.to_string(),
    }
}

/// Render hits as `<document>` blocks of pretty-printed JSON, one per hit,
/// for use as answer-generation context.
pub fn format_documents(hits: &[SearchHit]) -> Result<String> {
    let blocks = hits
        .iter()
        .map(|hit| {
            serde_json::to_string_pretty(hit).map(|json| format!("<document>\n{}\n</document>", json))
        })
        .collect::<serde_json::Result<Vec<_>>>()?;
    Ok(blocks.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::InMemoryIndex;
    use crate::models::{ChunkMetadata, DocumentChunk, LineSpan, Loc};

    fn hit(path: &str, text: &str) -> SearchHit {
        SearchHit {
            chunk: DocumentChunk {
                id: format!("id-{}", path),
                page_content: text.to_string(),
                metadata: ChunkMetadata {
                    document_id: "doc".to_string(),
                    filename: path.to_string(),
                    path: path.to_string(),
                    extension: "md".to_string(),
                    loc: Loc {
                        lines: LineSpan { from: 4, to: 9 },
                    },
                    hash: String::new(),
                },
                vector: None,
            },
            score: Some(0.5),
        }
    }

    #[test]
    fn test_format_documents() {
        let out = format_documents(&[hit("a.md", "alpha"), hit("b.md", "beta")]).unwrap();
        assert!(out.starts_with("<document>\n{"));
        assert!(out.ends_with("}\n</document>"));
        assert_eq!(out.matches("<document>").count(), 2);
        assert!(out.contains("\"pageContent\": \"alpha\""));
        assert!(out.contains("\"_rankingScore\": 0.5"));
        assert!(out.contains("</document>\n<document>"));
    }

    #[test]
    fn test_format_documents_empty() {
        assert_eq!(format_documents(&[]).unwrap(), "");
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(EXCERPT_CHARS + 10);
        let short = excerpt(&long);
        assert_eq!(short.chars().count(), EXCERPT_CHARS + 1);
        assert_eq!(excerpt(" two\nlines "), "two lines");
    }

    #[tokio::test]
    async fn test_blank_query_skips_index() {
        let index = InMemoryIndex::new();
        // No query embedder configured: any real search would fail.
        let hits = search(&index, "   ", 5).await.unwrap();
        assert!(hits.is_empty());
    }
}
