//! Sharded vector embedding store with approximate nearest-neighbor search.
//!
//! Texts are embedded, cached, and stored in per-shard HNSW indexes.
//! A [`ShardRouter`] spreads records over shards by hashing the text and
//! merges per-shard results into a global top-k.

pub mod config;
pub mod display;
pub mod error;
pub mod ingest;
pub mod store;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{StoreError, StoreResult};
pub use ingest::{BatchIngestor, IngestSink, IngestStats, StreamIngestor};
pub use store::{
    FanoutOptions, SearchHit, SearchOutcome, ShardConfig, ShardFailure, ShardRouter, VectorShard,
};
pub use vector::{
    Embedder, EmbeddingCache, EntryId, QuantizationWidth, SimilarityMetric, VectorDimension,
    VectorError,
};
