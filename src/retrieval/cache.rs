//! On-disk cache of document embeddings.
//!
//! One JSON file per (embedder, chunking, document text), named by the SHA-256
//! of those inputs. Re-attaching an unchanged document loads its vectors
//! instead of embedding every chunk again. A missing or unreadable entry is a
//! cache miss, and a failed write only costs the next attach a re-embed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bumped whenever the stored layout or chunking changes.
const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    version: u32,
    embedder: String,
    embeddings: Vec<Vec<f32>>,
}

/// Identifies one cached embedding set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    embedder: String,
    digest: String,
}

impl CacheKey {
    pub fn new(embedder: &str, chunk_size_lines: usize, overlap_lines: usize, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(CACHE_FORMAT_VERSION.to_le_bytes());
        hasher.update(embedder.as_bytes());
        hasher.update([0u8]);
        hasher.update((chunk_size_lines as u64).to_le_bytes());
        hasher.update((overlap_lines as u64).to_le_bytes());
        hasher.update(text.as_bytes());
        let digest = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self {
            embedder: embedder.to_string(),
            digest,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    dir: PathBuf,
}

impl EmbeddingCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data_dir>/embeddings`.
    pub fn in_data_dir() -> Self {
        Self::new(crate::data_dir().join("embeddings"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest))
    }

    /// Cached vectors for `key`, if present and well-formed.
    pub async fn load(&self, key: &CacheKey) -> Option<Vec<Vec<f32>>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read embedding cache");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.version == CACHE_FORMAT_VERSION && entry.embedder == key.embedder => {
                tracing::debug!(
                    path = %path.display(),
                    chunks = entry.embeddings.len(),
                    "embedding cache hit"
                );
                Some(entry.embeddings)
            }
            Ok(_) => {
                tracing::debug!(path = %path.display(), "stale embedding cache entry ignored");
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt embedding cache entry ignored");
                None
            }
        }
    }

    /// Store vectors for `key`. Written to a temporary file and renamed, so a
    /// reader never sees a partial entry.
    pub async fn store(&self, key: &CacheKey, embeddings: &[Vec<f32>]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let entry = CacheEntry {
            version: CACHE_FORMAT_VERSION,
            embedder: key.embedder.clone(),
            embeddings: embeddings.to_vec(),
        };
        let body = serde_json::to_vec(&entry).map_err(std::io::Error::other)?;

        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key.digest));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(path = %path.display(), chunks = embeddings.len(), "embedding cache stored");
        Ok(())
    }
}
