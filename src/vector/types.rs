//! Type-safe wrappers and core types for the vector engine.
//!
//! Ids, dimensions, metrics and quantization widths are newtypes or closed
//! enums so that invalid values are rejected at the boundary instead of deep
//! inside the index.

use std::fmt;
use std::str::FromStr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of the default fastembed model (all-MiniLM-L6-v2).
pub const DEFAULT_DIMENSION: usize = 384;

/// Identifier of an entry within a single shard.
///
/// Ids are assigned as the shard's stored-entry count at insertion time, so
/// the first entry is `0`. They are never reused, including after deletion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
#[serde(transparent)]
pub struct EntryId(u32);

impl EntryId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Builds an id from a position in the shard's parallel arrays.
    ///
    /// Returns `None` if the position does not fit in a `u32`.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok().map(Self)
    }

    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Position of this entry in the shard's parallel arrays.
    #[must_use]
    pub const fn as_index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-safe wrapper for vector dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for VectorDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of similarity metrics.
///
/// `Cosine` and `DotProduct` are served by the HNSW graph. `Euclidean` and
/// `Manhattan` are answered by an exhaustive O(n·D) scan over every live
/// vector in the shard.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    #[serde(alias = "dot")]
    DotProduct,
    Euclidean,
    Manhattan,
}

impl SimilarityMetric {
    pub const ALL: [SimilarityMetric; 4] = [
        Self::Cosine,
        Self::DotProduct,
        Self::Euclidean,
        Self::Manhattan,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::DotProduct => "dot_product",
            Self::Euclidean => "euclidean",
            Self::Manhattan => "manhattan",
        }
    }

    /// Whether the HNSW graph can serve this metric.
    #[must_use]
    pub const fn is_graph_accelerated(&self) -> bool {
        matches!(self, Self::Cosine | Self::DotProduct)
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityMetric {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot" | "dot_product" | "dotproduct" => Ok(Self::DotProduct),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            "manhattan" | "l1" => Ok(Self::Manhattan),
            _ => Err(VectorError::UnsupportedMetric(s.to_string())),
        }
    }
}

/// Bits per component for scalar quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(try_from = "u8", into = "u8")]
pub enum QuantizationWidth {
    Eight,
    Four,
}

impl QuantizationWidth {
    #[must_use]
    pub const fn bits(&self) -> u8 {
        match self {
            Self::Eight => 8,
            Self::Four => 4,
        }
    }

    /// Largest magnitude a component maps to (`x * scale`, then clamped).
    #[must_use]
    pub const fn scale(&self) -> f32 {
        match self {
            Self::Eight => 127.0,
            Self::Four => 7.0,
        }
    }

    /// Bytes needed to store `dimension` components at this width.
    #[must_use]
    pub const fn encoded_len(&self, dimension: usize) -> usize {
        match self {
            Self::Eight => dimension,
            Self::Four => dimension.div_ceil(2),
        }
    }
}

impl TryFrom<u8> for QuantizationWidth {
    type Error = VectorError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(Self::Eight),
            4 => Ok(Self::Four),
            other => Err(VectorError::UnsupportedQuantizationWidth(other)),
        }
    }
}

impl From<QuantizationWidth> for u8 {
    fn from(width: QuantizationWidth) -> Self {
        width.bits()
    }
}

impl fmt::Display for QuantizationWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Errors that can occur during vector operations.
///
/// Messages include a suggestion where one is actionable.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure the store and the embedder are configured with the same dimension"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error(
        "Index capacity exceeded: {live} of {capacity} slots in use, {requested} more requested\nSuggestion: Raise max_elements or add shards"
    )]
    CapacityExceeded {
        capacity: usize,
        live: usize,
        requested: usize,
    },

    #[error("Unknown entry id {0}")]
    UnknownId(EntryId),

    #[error(
        "Unsupported similarity metric '{0}'\nSuggestion: Use one of cosine, dot_product, euclidean, manhattan"
    )]
    UnsupportedMetric(String),

    #[error("Unsupported quantization width: {0} bits\nSuggestion: Use 8 or 4")]
    UnsupportedQuantizationWidth(u8),

    #[error("Index blob is corrupted: {reason}")]
    CorruptIndex { reason: String },

    #[error(
        "Index format version mismatch: expected {expected}, got {actual}\nSuggestion: Rebuild the store with the current version"
    )]
    VersionMismatch { expected: u32, actual: u32 },

    #[error(
        "Embedding generation failed: {0}\nSuggestion: Check the embedding backend configuration"
    )]
    EmbeddingFailed(String),

    #[error("Index storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// FNV-1a 64-bit hash.
///
/// Used wherever a hash must be stable across processes and toolchains
/// (shard routing, feature hashing).
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
