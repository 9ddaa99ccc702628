//! Error types for the sharded vector store
//!
//! Index-level failures are [`VectorError`]s; everything a store adds on top
//! (arity checks, persistence, shard layout, fan-out) lives in [`StoreError`].

use std::path::PathBuf;

use thiserror::Error;

use crate::store::ShardFailure;
use crate::vector::VectorError;

/// Main error type for store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Dimension, capacity, id, metric, quantization and index-blob errors
    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(
        "Batch arity mismatch: {texts} texts but {metadata} metadata entries. Pass no metadata or one entry per text"
    )]
    ArityMismatch { texts: usize, metadata: usize },

    /// Persistence errors
    #[error("Persisted state at '{path}' is corrupted: {reason}")]
    CorruptPersistedState { path: PathBuf, reason: String },

    #[error("Shard files under '{base}' do not match the requested layout: {reason}")]
    ShardLayoutMismatch { base: PathBuf, reason: String },

    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize metadata for '{path}': {source}")]
    Serialization {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Fan-out errors
    #[error(
        "{} of {} shards failed during search: {}",
        .failures.len(),
        .failures.len() + .succeeded.len(),
        describe_failures(.failures)
    )]
    PartialShardFailure {
        failures: Vec<ShardFailure>,
        succeeded: Vec<usize>,
    },

    #[error("Shard {shard} does not exist (store has {shard_count} shards)")]
    ShardOutOfRange { shard: usize, shard_count: usize },

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

fn describe_failures(failures: &[ShardFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON output
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::Vector(inner) => match inner {
                VectorError::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
                VectorError::InvalidDimension { .. } => "INVALID_DIMENSION",
                VectorError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
                VectorError::UnknownId(_) => "UNKNOWN_ID",
                VectorError::UnsupportedMetric(_) => "UNSUPPORTED_METRIC",
                VectorError::UnsupportedQuantizationWidth(_) => "UNSUPPORTED_QUANTIZATION_WIDTH",
                VectorError::CorruptIndex { .. } | VectorError::VersionMismatch { .. } => {
                    "CORRUPT_PERSISTED_STATE"
                }
                VectorError::EmbeddingFailed(_) => "EMBEDDING_FAILED",
                VectorError::Storage(_) => "STORAGE_ERROR",
            },
            Self::ArityMismatch { .. } => "ARITY_MISMATCH",
            Self::CorruptPersistedState { .. } => "CORRUPT_PERSISTED_STATE",
            Self::ShardLayoutMismatch { .. } => "SHARD_LAYOUT_MISMATCH",
            Self::Io { .. } => "IO_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::PartialShardFailure { .. } => "PARTIAL_SHARD_FAILURE",
            Self::ShardOutOfRange { .. } => "SHARD_OUT_OF_RANGE",
            Self::InvalidConfig { .. } => "CONFIG_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Vector(VectorError::CapacityExceeded { .. }) => vec![
                "Raise store.max_elements in settings.toml",
                "Increase store.shard_count for a fresh store to spread entries further",
            ],
            Self::Vector(VectorError::DimensionMismatch { .. }) => vec![
                "Make store.dimension match the embedding model's output size",
                "Rebuild the store if the embedding model changed",
            ],
            Self::Vector(VectorError::EmbeddingFailed(_)) => vec![
                "Check embedding.backend and embedding.model in settings.toml",
                "Use the 'hashing' backend to work offline",
            ],
            Self::Vector(VectorError::CorruptIndex { .. } | VectorError::VersionMismatch { .. })
            | Self::CorruptPersistedState { .. } => vec![
                "Restore the shard files from a backup",
                "Delete the store directory and re-ingest the source data",
            ],
            Self::ShardLayoutMismatch { .. } => vec![
                "Load with the shard count the store was saved with",
                "Remove stray shard files left over from an older layout",
            ],
            Self::PartialShardFailure { .. } => vec![
                "Retry with --allow-partial to accept results from healthy shards",
                "Check the logs for the failing shard's error",
            ],
            Self::Io { .. } => vec![
                "Check that the path exists and you have read/write permissions",
                "Check available disk space",
            ],
            Self::InvalidConfig { .. } => vec![
                "Run 'shardvec config' to inspect the effective settings",
                "Run 'shardvec init --force' to regenerate the settings template",
            ],
            _ => vec![],
        }
    }

    /// Whether the store rejected input because it is full.
    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::Vector(VectorError::CapacityExceeded { .. }))
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
