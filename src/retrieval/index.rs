//! Per-conversation retrieval index over one attached document.
//!
//! Built once when the document is attached; immutable afterwards. Queries
//! rank chunks by cosine similarity, ties going to the earlier chunk, so the
//! same query always yields the same order.

use std::sync::Arc;

use serde::Serialize;

use super::cache::{CacheKey, EmbeddingCache};
use super::chunking::chunk_lines;
use super::embedder::{cosine_similarity, l2_normalize, Embedder};
use super::errors::RetrievalError;

/// Texts sent to the embedder per request.
const EMBED_BATCH: usize = 32;

/// One indexed window of the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalChunk {
    /// Name of the document the chunk came from.
    pub source: String,
    /// Ordinal position in the document, from 0.
    pub position: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: RetrievalChunk,
    pub score: f32,
}

pub struct RetrievalIndex {
    source: String,
    chunks: Vec<RetrievalChunk>,
    embedder: Arc<dyn Embedder>,
    dimension: usize,
}

impl std::fmt::Debug for RetrievalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalIndex")
            .field("source", &self.source)
            .field("chunks", &self.chunks.len())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl RetrievalIndex {
    /// Chunk `text` into line windows and embed every chunk.
    pub async fn build(
        source: &str,
        text: &str,
        chunk_size_lines: usize,
        overlap_lines: usize,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, RetrievalError> {
        Self::build_cached(source, text, chunk_size_lines, overlap_lines, embedder, None).await
    }

    /// Like [`Self::build`], reusing vectors from `cache` when the same text
    /// was embedded before with the same embedder and chunking.
    pub async fn build_cached(
        source: &str,
        text: &str,
        chunk_size_lines: usize,
        overlap_lines: usize,
        embedder: Arc<dyn Embedder>,
        cache: Option<&EmbeddingCache>,
    ) -> Result<Self, RetrievalError> {
        let windows = chunk_lines(text, chunk_size_lines, overlap_lines);
        let key = CacheKey::new(&embedder.cache_id(), chunk_size_lines, overlap_lines, text);

        let cached = match cache {
            Some(cache) => cache
                .load(&key)
                .await
                .filter(|vectors| vectors.len() == windows.len()),
            None => None,
        };

        let embeddings = match cached {
            Some(vectors) => {
                tracing::info!(source = %source, chunks = vectors.len(), "reusing cached embeddings");
                vectors
            }
            None => {
                let texts: Vec<String> = windows.iter().map(|w| w.text.clone()).collect();
                let vectors = embed_all(embedder.as_ref(), &texts).await?;
                if let Some(cache) = cache {
                    if let Err(e) = cache.store(&key, &vectors).await {
                        tracing::warn!(
                            source = %source,
                            dir = %cache.dir().display(),
                            error = %e,
                            "failed to cache embeddings"
                        );
                    }
                }
                vectors
            }
        };

        let dimension = check_dimension(&embeddings)?;

        let chunks: Vec<RetrievalChunk> = windows
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(position, (window, embedding))| RetrievalChunk {
                source: source.to_string(),
                position,
                start_line: window.start_line,
                end_line: window.end_line,
                text: window.text,
                embedding,
            })
            .collect();

        tracing::info!(
            source = %source,
            chunks = chunks.len(),
            dimension,
            "document indexed"
        );

        Ok(Self {
            source: source.to_string(),
            chunks,
            embedder,
            dimension,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn chunks(&self) -> &[RetrievalChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The `k` chunks most similar to `query_text`.
    pub async fn query(&self, query_text: &str, k: usize) -> Result<Vec<ScoredChunk>, RetrievalError> {
        self.query_with_threshold(query_text, k, f32::NEG_INFINITY).await
    }

    /// Like [`Self::query`], dropping chunks that score below `min_similarity`.
    pub async fn query_with_threshold(
        &self,
        query_text: &str,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        if self.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = self
            .embedder
            .embed(&[query_text.to_string()])
            .await?
            .into_iter()
            .next()
            .map(l2_normalize)
            .ok_or(RetrievalError::EmptyResponse { count: 1 })?;

        if query_vec.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query_vec.len(),
            });
        }

        let hits = rank(&self.chunks, &query_vec, k, min_similarity);
        tracing::debug!(
            source = %self.source,
            k,
            returned = hits.len(),
            top_score = hits.first().map(|h| h.score),
            "retrieval query"
        );
        Ok(hits)
    }
}

/// Embed `texts` in batches, normalized and checked for a single dimension.
async fn embed_all(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBED_BATCH) {
        let vectors = embedder.embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(RetrievalError::EmptyResponse { count: batch.len() });
        }
        embeddings.extend(vectors.into_iter().map(l2_normalize));
    }
    check_dimension(&embeddings)?;
    Ok(embeddings)
}

fn check_dimension(embeddings: &[Vec<f32>]) -> Result<usize, RetrievalError> {
    let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
    match embeddings.iter().find(|e| e.len() != dimension) {
        Some(bad) => Err(RetrievalError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        }),
        None => Ok(dimension),
    }
}

/// Rank `chunks` against a normalized query vector.
///
/// Descending score, ties by ascending position; NaN scores rank last.
pub fn rank(
    chunks: &[RetrievalChunk],
    query_vec: &[f32],
    k: usize,
    min_similarity: f32,
) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = chunks
        .iter()
        .map(|chunk| {
            let score = cosine_similarity(query_vec, &chunk.embedding);
            ScoredChunk {
                chunk: chunk.clone(),
                score: if score.is_nan() { f32::NEG_INFINITY } else { score },
            }
        })
        .filter(|s| s.score >= min_similarity)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.position.cmp(&b.chunk.position))
    });
    scored.truncate(k);
    scored
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::embedder::HashingEmbedder;
    use async_trait::async_trait;

    const DOC: &str = "\
The invoice total is 420 euros.
Payment is due within thirty days.
Late payment incurs a fee.
The office is closed on Sundays.
Parking is available behind the building.
Visitors must sign in at reception.";

    async fn index(chunk_size: usize) -> RetrievalIndex {
        RetrievalIndex::build("contract.txt", DOC, chunk_size, 0, Arc::new(HashingEmbedder::new(256)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_tags_line_ranges() {
        let index = index(2).await;
        assert_eq!(index.len(), 3);
        let ranges: Vec<(usize, usize)> = index
            .chunks()
            .iter()
            .map(|c| (c.start_line, c.end_line))
            .collect();
        assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 6)]);
        assert!(index.chunks().iter().all(|c| c.source == "contract.txt"));
    }

    #[tokio::test]
    async fn test_query_ranks_relevant_chunk_first() {
        let index = index(2).await;
        let hits = index.query("when is payment of the invoice due", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.position, 0);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_query_is_stable() {
        let index = index(1).await;
        let a = index.query("payment", 4).await.unwrap();
        let b = index.query("payment", 4).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_empty_document_returns_empty() {
        let index = RetrievalIndex::build("empty", "", 10, 0, Arc::new(HashingEmbedder::new(16)))
            .await
            .unwrap();
        assert!(index.is_empty());
        assert!(index.query("anything", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_filters_weak_hits() {
        let index = index(1).await;
        let hits = index
            .query_with_threshold("parking behind the building", 6, 0.3)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.score >= 0.3));
        assert_eq!(hits[0].chunk.start_line, 5);
    }

    #[test]
    fn test_ties_break_by_position() {
        let chunk = |position: usize| RetrievalChunk {
            source: "d".into(),
            position,
            start_line: position + 1,
            end_line: position + 1,
            text: String::new(),
            embedding: vec![1.0, 0.0],
        };
        let chunks = vec![chunk(2), chunk(0), chunk(1)];
        let hits = rank(&chunks, &[1.0, 0.0], 2, f32::NEG_INFINITY);
        let positions: Vec<usize> = hits.iter().map(|h| h.chunk.position).collect();
        assert_eq!(positions, vec![0, 1]);
    }

    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Ok(texts.iter().map(|t| vec![1.0; t.len() % 3 + 1]).collect())
        }

        fn cache_id(&self) -> String {
            "short".to_string()
        }
    }

    #[tokio::test]
    async fn test_inconsistent_dimensions_rejected() {
        let err = RetrievalIndex::build("d", "a\nbb\nccc", 1, 0, Arc::new(ShortEmbedder))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { .. }));
    }
}
