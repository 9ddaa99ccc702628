//! Text-level stores built on the vector engine.
//!
//! [`VectorShard`] owns one index plus the texts and metadata behind it.
//! [`ShardRouter`] spreads records over several shards by hashing the text
//! and merges their search results.

pub mod persist;
pub mod router;
pub mod shard;

pub use persist::{ShardIndexMetadata, ShardPaths, ShardPlacement, shard_base};
pub use router::{
    FailureReason, FanoutOptions, RouterMemoryReport, SearchOutcome, ShardFailure, ShardRouter,
    merge_hits, route,
};
pub use shard::{
    EntryRecord, MemoryReport, QuantizationReport, SearchHit, ShardConfig, VectorShard,
};
