//! Configuration module for the sharded vector store.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.shardvec/settings.toml`)
//! - Environment variable overrides
//! - CLI argument overrides (applied by the binary)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `SHARDVEC_` and use double
//! underscores to separate nested levels:
//! - `SHARDVEC_STORE__SHARD_COUNT=4` sets `store.shard_count`
//! - `SHARDVEC_CACHE__CAPACITY=5000` sets `cache.capacity`
//! - `SHARDVEC_SEARCH__ALLOW_PARTIAL=true` sets `search.allow_partial`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::vector::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_DIMENSION, EmbeddingBackend, HnswParams, SimilarityMetric,
};

/// Directory holding settings and, by default, the persisted store.
pub const CONFIG_DIR: &str = ".shardvec";

const ENV_PREFIX: &str = "SHARDVEC_";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Base path of the persisted store; shard `i` lives at `{data_path}_shard{i}`
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Workspace root directory (where .shardvec is located)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    #[serde(default)]
    pub store: StoreConfig,

    /// HNSW graph parameters
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    /// Embedding dimension shared by every shard
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Maximum live entries per shard
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,

    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Metric used when a search does not name one
    #[serde(default)]
    pub metric: SimilarityMetric,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_m")]
    pub m: usize,

    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    #[serde(default = "default_level_seed")]
    pub level_seed: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    /// Cached embeddings; 0 disables the cache
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Records per batch when streaming
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker threads for embedding
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,

    /// Splits a stream line into `text<delimiter>metadata` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_delimiter: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_k")]
    pub k: usize,

    /// Stop waiting for shards after this many milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,

    /// Merge results from healthy shards when others fail
    #[serde(default = "default_false")]
    pub allow_partial: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,

    /// fastembed model name
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Where fastembed stores downloaded models
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_data_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("store")
}
fn default_false() -> bool {
    false
}
fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}
fn default_max_elements() -> usize {
    10_000
}
fn default_shard_count() -> usize {
    3
}
fn default_m() -> usize {
    HnswParams::default().m
}
fn default_ef_construction() -> usize {
    HnswParams::default().ef_construction
}
fn default_ef_search() -> usize {
    HnswParams::default().ef_search
}
fn default_level_seed() -> u64 {
    HnswParams::default().level_seed
}
fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}
fn default_batch_size() -> usize {
    10
}
fn default_parallel_threads() -> usize {
    num_cpus::get()
}
fn default_k() -> usize {
    5
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_path: default_data_path(),
            workspace_root: None,
            debug: false,
            store: StoreConfig::default(),
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
            ingest: IngestConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            max_elements: default_max_elements(),
            shard_count: default_shard_count(),
            metric: SimilarityMetric::default(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            level_seed: default_level_seed(),
        }
    }
}

impl IndexConfig {
    /// Graph parameters with `m0 = 2 * m`.
    #[must_use]
    pub fn params(&self) -> HnswParams {
        HnswParams {
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            level_seed: self.level_seed,
            ..HnswParams::with_m(self.m)
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallel_threads: default_parallel_threads(),
            metadata_delimiter: None,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            deadline_ms: None,
            allow_partial: false,
        }
    }
}

impl SearchConfig {
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: default_embedding_model(),
            cache_dir: None,
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        // Try to find the workspace root by looking for .shardvec directory
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));

        Self::figment(&config_path, ENV_PREFIX)
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                if settings.workspace_root.is_none() {
                    settings.workspace_root = Self::workspace_root();
                }
                settings
            })
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref(), ENV_PREFIX)
            .extract()
            .map_err(Box::new)
    }

    /// Defaults, then the TOML file if it exists, then prefixed env vars.
    /// Double underscore (__) separates nested levels; single underscores
    /// stay part of field names.
    fn figment(config_path: &Path, env_prefix: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            .merge(
                Env::prefixed(env_prefix)
                    .map(|key| key.as_str().to_lowercase().replace("__", ".").into()),
            )
    }

    /// Find the workspace config by looking for a .shardvec directory
    /// from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        Self::workspace_root().map(|root| root.join(CONFIG_DIR).join("settings.toml"))
    }

    /// Get the workspace root directory (where .shardvec is located)
    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .find(|ancestor| ancestor.join(CONFIG_DIR).is_dir())
            .map(Path::to_path_buf)
    }

    /// Store base path, resolved against the workspace root when relative.
    #[must_use]
    pub fn resolved_data_path(&self) -> PathBuf {
        match &self.workspace_root {
            Some(root) if self.data_path.is_relative() => root.join(&self.data_path),
            _ => self.data_path.clone(),
        }
    }

    /// Rejects settings no store can be built from.
    pub fn validate(&self) -> StoreResult<()> {
        let checks: [(bool, &str); 8] = [
            (self.store.dimension == 0, "store.dimension must be greater than 0"),
            (self.store.max_elements == 0, "store.max_elements must be greater than 0"),
            (self.store.shard_count == 0, "store.shard_count must be greater than 0"),
            (self.index.m < 2, "index.m must be at least 2"),
            (self.index.ef_construction == 0, "index.ef_construction must be greater than 0"),
            (self.index.ef_search == 0, "index.ef_search must be greater than 0"),
            (self.ingest.batch_size == 0, "ingest.batch_size must be greater than 0"),
            (self.search.k == 0, "search.k must be greater than 0"),
        ];

        if let Some((_, reason)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(StoreError::InvalidConfig {
                reason: (*reason).to_string(),
            });
        }

        if self
            .ingest
            .metadata_delimiter
            .as_deref()
            .is_some_and(str::is_empty)
        {
            return Err(StoreError::InvalidConfig {
                reason: "ingest.metadata_delimiter must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join("settings.toml");
        Self::write_template(&config_path, force)?;
        Ok(config_path)
    }

    fn write_template(config_path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# shardvec configuration file

# Version of the configuration schema
version = 1

# Base path of the persisted store (relative to the workspace root).
# Shard i is written to "<data_path>_shard<i>.index" and ".json".
data_path = ".shardvec/store"

# Global debug mode (raises the default log level to debug)
debug = false

[store]
# Embedding dimension; must match the embedding backend
dimension = {dimension}

# Maximum live entries per shard
max_elements = {max_elements}

# Number of shards. Texts are routed by FNV-1a hash of their content, so
# changing this invalidates the placement of everything already stored.
shard_count = {shard_count}

# Default metric: "cosine", "dot_product", "euclidean" or "manhattan".
# euclidean and manhattan are answered by an exhaustive scan.
metric = "cosine"

[index]
# HNSW connections per node (layer 0 uses twice this)
m = {m}
ef_construction = {ef_construction}
ef_search = {ef_search}

[cache]
# Embeddings kept in the LRU cache; 0 disables caching
capacity = {cache_capacity}

[ingest]
# Records per batch when streaming input
batch_size = {batch_size}

# Worker threads for embedding (defaults to CPU count)
# parallel_threads = {threads}

# Split each input line into text and metadata on this delimiter
# metadata_delimiter = "\t"

[search]
# Results returned when -k is not given
k = {k}

# Give up waiting for slow shards after this many milliseconds
# deadline_ms = 500

# Merge results from healthy shards when others fail
allow_partial = false

[embedding]
# "hashing" (offline, deterministic) or "fastembed"
backend = "hashing"

# fastembed model: AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15,
# BGEBaseENV15 (768 dimensions) or MultilingualE5Small
model = "AllMiniLML6V2"
"#,
            dimension = default_dimension(),
            max_elements = default_max_elements(),
            shard_count = default_shard_count(),
            m = default_m(),
            ef_construction = default_ef_construction(),
            ef_search = default_ef_search(),
            cache_capacity = default_cache_capacity(),
            batch_size = default_batch_size(),
            threads = default_parallel_threads(),
            k = default_k(),
        );

        std::fs::write(config_path, template)?;
        Ok(())
    }
}
