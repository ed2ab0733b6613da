//! Retrieval: grounding chunks from an attached document.
//!
//! A document is split into line windows ([`chunking`]), embedded through a
//! pluggable [`Embedder`], and queried per user turn ([`RetrievalIndex`]).
//! Vectors of a document seen before come from the [`EmbeddingCache`].

pub mod cache;
pub mod chunking;
pub mod embedder;
pub mod errors;
pub mod index;

pub use cache::EmbeddingCache;
pub use embedder::{Embedder, HashingEmbedder, HttpEmbedder};
pub use errors::RetrievalError;
pub use index::{RetrievalChunk, RetrievalIndex, ScoredChunk};
