//! Vector engine for a single shard.
//!
//! # Architecture
//! Text goes through an [`Embedder`] (memoized by [`EmbeddingCache`]) into a
//! fixed-dimension vector, which is stored in an [`HnswIndex`]. Stored
//! vectors can be replaced by scalar-quantized forms ([`QuantizedVector`])
//! to trade precision for memory. Index graphs persist as checksummed blobs
//! that are read back through a memory map.
//!
//! # Complexity
//! - Cosine / dot-product search: sub-linear via the HNSW graph
//! - Euclidean / Manhattan search: O(n·D) exhaustive scan

mod cache;
mod distance;
mod embedding;
mod hnsw;
mod quantize;
mod storage;
mod types;

pub use cache::{CacheStats, DEFAULT_CACHE_CAPACITY, EmbeddingCache};
pub use distance::{
    cosine_similarity, distance_to_score, dot, euclidean_distance, manhattan_distance, norm,
    normalize,
};
pub use embedding::{
    Embedder, EmbeddingBackend, FastEmbedGenerator, HashingEmbedder, default_models_dir,
};
pub use hnsw::{HnswIndex, HnswParams};
pub use quantize::{QuantizedVector, StoredVector};
pub use storage::{HEADER_SIZE, STORAGE_VERSION, sha256_hex, write_atomic};
pub use types::{
    DEFAULT_DIMENSION, EntryId, QuantizationWidth, SimilarityMetric, VectorDimension, VectorError,
    fnv1a_hash,
};
