//! Persisted shard layout and the JSON metadata record.
//!
//! A shard saved at base path `P` consists of two co-located files:
//! - `P.index`: the index blob (graph + vectors, checksummed)
//! - `P.json`: [`ShardIndexMetadata`], including the texts and metadata
//!   arrays and the SHA-256 of the blob it was written with
//!
//! A router saved at base `B` writes shard `i` at `B_shard{i}`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::vector::{QuantizationWidth, SimilarityMetric, write_atomic};

/// Unix timestamp in seconds.
pub fn get_utc_timestamp() -> u64 {
    Utc::now().timestamp() as u64
}

/// File pair backing one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPaths {
    pub index: PathBuf,
    pub metadata: PathBuf,
}

impl ShardPaths {
    /// Paths for a shard saved directly at `base`.
    #[must_use]
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            index: with_suffix(base.as_ref(), ".index"),
            metadata: with_suffix(base.as_ref(), ".json"),
        }
    }

    /// Paths for shard `shard` of a router saved at `base`.
    #[must_use]
    pub fn for_shard(base: impl AsRef<Path>, shard: usize) -> Self {
        Self::new(shard_base(base, shard))
    }

    /// Whether either artifact is present.
    #[must_use]
    pub fn any_exists(&self) -> bool {
        self.index.exists() || self.metadata.exists()
    }

    /// Whether both artifacts are present.
    #[must_use]
    pub fn both_exist(&self) -> bool {
        self.index.exists() && self.metadata.exists()
    }
}

/// `base` with `_shard{shard}` appended to its final component.
#[must_use]
pub fn shard_base(base: impl AsRef<Path>, shard: usize) -> PathBuf {
    with_suffix(base.as_ref(), &format!("_shard{shard}"))
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut raw = OsString::from(base.as_os_str());
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Position of a shard within a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub index: usize,
    pub count: usize,
}

/// Metadata record persisted next to each index blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardIndexMetadata {
    /// Version of the metadata format
    pub version: u32,

    pub dimension: usize,

    pub max_elements: usize,

    pub similarity_metric: SimilarityMetric,

    /// Live plus tombstoned entries; equals `texts.len()`
    pub entry_count: usize,

    /// Width the stored vectors were last quantized to, if any
    #[serde(default)]
    pub quantization: Option<QuantizationWidth>,

    /// SHA-256 of the `.index` file written alongside this record
    pub index_checksum: String,

    /// Unix timestamp when the shard was first saved
    pub created_at: u64,

    /// Unix timestamp of the latest save
    pub updated_at: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardPlacement>,

    pub texts: Vec<String>,

    pub metadata: Vec<String>,
}

impl ShardIndexMetadata {
    /// Current metadata version
    pub const CURRENT_VERSION: u32 = 1;

    /// Writes the record atomically as pretty JSON.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Serialization {
            path: path.to_path_buf(),
            source,
        })?;

        write_atomic(path, &json).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and structurally validates a record.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let json = std::fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let record: Self =
            serde_json::from_slice(&json).map_err(|e| StoreError::CorruptPersistedState {
                path: path.to_path_buf(),
                reason: format!("metadata record is not valid: {e}"),
            })?;

        record.validate(path)?;
        Ok(record)
    }

    /// Checks version and array lengths.
    pub fn validate(&self, path: &Path) -> StoreResult<()> {
        let corrupt = |reason: String| StoreError::CorruptPersistedState {
            path: path.to_path_buf(),
            reason,
        };

        if self.version != Self::CURRENT_VERSION {
            return Err(corrupt(format!(
                "metadata version {} is not supported (expected {})",
                self.version,
                Self::CURRENT_VERSION
            )));
        }
        if self.dimension == 0 {
            return Err(corrupt("dimension is zero".to_string()));
        }
        if self.texts.len() != self.entry_count || self.metadata.len() != self.entry_count {
            return Err(corrupt(format!(
                "entry_count {} but {} texts and {} metadata entries",
                self.entry_count,
                self.texts.len(),
                self.metadata.len()
            )));
        }
        if let Some(placement) = self.shard {
            if placement.index >= placement.count {
                return Err(corrupt(format!(
                    "shard index {} out of range for {} shards",
                    placement.index, placement.count
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record() -> ShardIndexMetadata {
        let now = get_utc_timestamp();
        ShardIndexMetadata {
            version: ShardIndexMetadata::CURRENT_VERSION,
            dimension: 128,
            max_elements: 1000,
            similarity_metric: SimilarityMetric::Cosine,
            entry_count: 2,
            quantization: None,
            index_checksum: "abc".to_string(),
            created_at: now,
            updated_at: now,
            shard: Some(ShardPlacement { index: 1, count: 3 }),
            texts: vec!["a".to_string(), "b".to_string()],
            metadata: vec![String::new(), "tag".to_string()],
        }
    }

    #[test]
    fn test_paths() {
        let paths = ShardPaths::for_shard("/tmp/db", 2);
        assert_eq!(paths.index, PathBuf::from("/tmp/db_shard2.index"));
        assert_eq!(paths.metadata, PathBuf::from("/tmp/db_shard2.json"));

        let single = ShardPaths::new("data/vectors");
        assert_eq!(single.index, PathBuf::from("data/vectors.index"));
    }

    #[test]
    fn test_record_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shard.json");
        let original = record();
        original.save(&path).unwrap();

        let loaded = ShardIndexMetadata::load(&path).unwrap();
        assert_eq!(loaded.texts, original.texts);
        assert_eq!(loaded.metadata, original.metadata);
        assert_eq!(loaded.shard, original.shard);
        assert_eq!(loaded.similarity_metric, SimilarityMetric::Cosine);

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"similarity_metric\": \"cosine\""));
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shard.json");
        let mut bad = record();
        bad.metadata.pop();
        bad.save(&path).unwrap();

        assert!(matches!(
            ShardIndexMetadata::load(&path),
            Err(StoreError::CorruptPersistedState { .. })
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shard.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ShardIndexMetadata::load(&path),
            Err(StoreError::CorruptPersistedState { .. })
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shard.json");
        let mut future = record();
        future.version = 99;
        future.save(&path).unwrap();
        assert!(matches!(
            ShardIndexMetadata::load(&path),
            Err(StoreError::CorruptPersistedState { .. })
        ));
    }
}
