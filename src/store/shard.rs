//! A single-index store: one HNSW graph plus the texts and metadata it was
//! built from.
//!
//! One `RwLock` guards the index together with both parallel arrays, so
//! readers never see them at different lengths. Embedding always happens
//! before that lock is taken.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{StoreError, StoreResult};
use crate::ingest::embed_concurrently;
use crate::store::persist::{ShardIndexMetadata, ShardPaths, ShardPlacement, get_utc_timestamp};
use crate::vector::{
    EmbeddingCache, EntryId, HnswIndex, HnswParams, QuantizationWidth, QuantizedVector,
    SimilarityMetric, VectorDimension, VectorError, distance_to_score,
};

/// Construction parameters for a [`VectorShard`].
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub dimension: VectorDimension,
    /// Maximum live entries
    pub max_elements: usize,
    /// Metric recorded with the shard and used by the CLI when none is given
    pub metric: SimilarityMetric,
    pub params: HnswParams,
    /// Position inside a router; `None` for a standalone shard
    pub placement: Option<ShardPlacement>,
}

impl ShardConfig {
    #[must_use]
    pub fn new(dimension: VectorDimension, max_elements: usize) -> Self {
        Self {
            dimension,
            max_elements,
            metric: SimilarityMetric::default(),
            params: HnswParams::default(),
            placement: None,
        }
    }

    #[must_use]
    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: HnswParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_placement(mut self, placement: ShardPlacement) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Shard parameters from the `[store]` and `[index]` sections.
    pub fn from_settings(settings: &Settings) -> StoreResult<Self> {
        let dimension = VectorDimension::new(settings.store.dimension)?;
        Ok(Self::new(dimension, settings.store.max_elements)
            .with_metric(settings.store.metric)
            .with_params(settings.index.params()))
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Shard that produced the hit
    pub shard: usize,
    pub id: EntryId,
    pub text: String,
    pub metadata: String,
    /// Higher is more similar, whatever the metric
    pub score: f32,
}

impl SearchHit {
    /// `text`, or `"text [metadata]"` when metadata is non-empty.
    #[must_use]
    pub fn display_text(&self) -> String {
        if self.metadata.is_empty() {
            self.text.clone()
        } else {
            format!("{} [{}]", self.text, self.metadata)
        }
    }
}

/// A stored entry as seen from outside the shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecord {
    pub id: EntryId,
    pub text: String,
    pub metadata: String,
    pub deleted: bool,
}

/// Outcome of [`VectorShard::quantize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuantizationReport {
    pub width: QuantizationWidth,
    /// Live entries whose stored vector was replaced
    pub entries: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// Diagnostic memory estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryReport {
    pub entries: usize,
    pub live_entries: usize,
    pub index_bytes: usize,
    pub text_bytes: usize,
    pub metadata_bytes: usize,
    pub total_bytes: usize,
}

impl std::ops::Add for MemoryReport {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            entries: self.entries + other.entries,
            live_entries: self.live_entries + other.live_entries,
            index_bytes: self.index_bytes + other.index_bytes,
            text_bytes: self.text_bytes + other.text_bytes,
            metadata_bytes: self.metadata_bytes + other.metadata_bytes,
            total_bytes: self.total_bytes + other.total_bytes,
        }
    }
}

impl std::iter::Sum for MemoryReport {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, report| acc + report)
    }
}

struct ShardState {
    index: HnswIndex,
    texts: Vec<String>,
    metadata: Vec<String>,
    quantization: Option<QuantizationWidth>,
    created_at: Option<u64>,
}

impl ShardState {
    /// Live `(id, text)` pairs from position `from` onward.
    fn live_texts(&self, from: usize) -> Vec<(EntryId, String)> {
        self.texts
            .iter()
            .enumerate()
            .skip(from)
            .filter_map(|(i, text)| {
                let id = EntryId::from_index(i)?;
                (self.index.is_deleted(id) == Some(false)).then(|| (id, text.clone()))
            })
            .collect()
    }

    fn next_id(&self, capacity: usize) -> Result<EntryId, VectorError> {
        EntryId::from_index(self.texts.len()).ok_or(VectorError::CapacityExceeded {
            capacity,
            live: self.index.live_len(),
            requested: 1,
        })
    }

    fn ensure_room(&self, requested: usize) -> Result<(), VectorError> {
        let remaining = self.index.remaining_capacity();
        let ids_left = (u32::MAX as usize).saturating_sub(self.texts.len());
        if requested > remaining || requested > ids_left {
            return Err(VectorError::CapacityExceeded {
                capacity: self.index.max_elements(),
                live: self.index.live_len(),
                requested,
            });
        }
        Ok(())
    }

    fn insert(&mut self, vector: &[f32], id: EntryId) -> Result<(), VectorError> {
        match self.quantization {
            Some(width) => self
                .index
                .insert_quantized(QuantizedVector::encode(vector, width), id),
            None => self.index.insert(vector, id),
        }
    }

    fn push(&mut self, vector: &[f32], text: &str, metadata: &str) -> Result<EntryId, VectorError> {
        let id = self.next_id(self.index.max_elements())?;
        self.insert(vector, id)?;
        self.texts.push(text.to_string());
        self.metadata.push(metadata.to_string());
        Ok(id)
    }
}

/// A single-index vector store.
pub struct VectorShard {
    config: ShardConfig,
    cache: Arc<EmbeddingCache>,
    state: RwLock<ShardState>,
}

impl std::fmt::Debug for VectorShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("VectorShard")
            .field("config", &self.config)
            .field("entries", &state.texts.len())
            .field("live", &state.index.live_len())
            .field("quantization", &state.quantization)
            .finish()
    }
}

impl VectorShard {
    /// Creates an empty shard embedding through `cache`.
    pub fn new(config: ShardConfig, cache: Arc<EmbeddingCache>) -> StoreResult<Self> {
        check_embedder_dimension(&cache, config.dimension)?;

        let index = HnswIndex::new(config.dimension, config.max_elements, config.params);
        Ok(Self {
            config,
            cache,
            state: RwLock::new(ShardState {
                index,
                texts: Vec::new(),
                metadata: Vec::new(),
                quantization: None,
                created_at: None,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.config.dimension
    }

    #[must_use]
    pub fn metric(&self) -> SimilarityMetric {
        self.config.metric
    }

    /// Position inside a router, 0 for a standalone shard.
    #[must_use]
    pub fn index(&self) -> usize {
        self.config.placement.map_or(0, |p| p.index)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Entries ever stored, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().texts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn live_len(&self) -> usize {
        self.state.read().index.live_len()
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.state.read().index.remaining_capacity()
    }

    /// Width the stored vectors were last quantized to.
    #[must_use]
    pub fn quantization(&self) -> Option<QuantizationWidth> {
        self.state.read().quantization
    }

    #[must_use]
    pub fn entry(&self, id: EntryId) -> Option<EntryRecord> {
        let state = self.state.read();
        let text = state.texts.get(id.as_index())?;
        Some(EntryRecord {
            id,
            text: text.clone(),
            metadata: state.metadata[id.as_index()].clone(),
            deleted: state.index.is_deleted(id).unwrap_or(true),
        })
    }

    /// Embeds and stores one record, returning its id.
    pub fn add_text(&self, text: &str, metadata: &str) -> StoreResult<EntryId> {
        let vector = self.cache.get(text)?;

        let mut state = self.state.write();
        let id = state.push(&vector, text, metadata)?;
        debug!(shard = self.index(), id = id.get(), "added entry");
        Ok(id)
    }

    /// Stores a batch, all or nothing.
    ///
    /// `metadata` must be empty or match `texts` in length. Capacity is
    /// checked for the whole batch before any embedding work starts, and
    /// again under the write lock before anything is inserted.
    pub fn add_texts_batch(&self, texts: &[String], metadata: &[String]) -> StoreResult<Vec<EntryId>> {
        if !metadata.is_empty() && metadata.len() != texts.len() {
            return Err(StoreError::ArityMismatch {
                texts: texts.len(),
                metadata: metadata.len(),
            });
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        self.state.read().ensure_room(texts.len())?;

        let vectors = embed_concurrently(&self.cache, texts)?;

        let mut state = self.state.write();
        state.ensure_room(texts.len())?;

        let mut ids = Vec::with_capacity(texts.len());
        for (i, (text, vector)) in texts.iter().zip(&vectors).enumerate() {
            let meta = metadata.get(i).map_or("", String::as_str);
            ids.push(state.push(vector, text, meta)?);
        }

        info!(
            shard = self.index(),
            entries = ids.len(),
            live = state.index.live_len(),
            "added batch"
        );
        Ok(ids)
    }

    /// Top-`k` hits for `query`, best first.
    pub fn search(&self, query: &str, k: usize, metric: SimilarityMetric) -> StoreResult<Vec<SearchHit>> {
        let vector = self.cache.get(query)?;
        self.search_vector(&vector, k, metric)
    }

    /// Top-`k` hits for an already-embedded query.
    pub fn search_vector(
        &self,
        vector: &[f32],
        k: usize,
        metric: SimilarityMetric,
    ) -> StoreResult<Vec<SearchHit>> {
        let state = self.state.read();
        let neighbors = state.index.search_knn(vector, k, metric)?;

        Ok(neighbors
            .into_iter()
            .map(|(id, distance)| SearchHit {
                shard: self.index(),
                id,
                text: state.texts[id.as_index()].clone(),
                metadata: state.metadata[id.as_index()].clone(),
                score: distance_to_score(metric, distance),
            })
            .collect())
    }

    /// Searches every query in parallel; result `i` belongs to `queries[i]`.
    pub fn search_batch<S>(
        &self,
        queries: &[S],
        k: usize,
        metric: SimilarityMetric,
    ) -> StoreResult<Vec<Vec<SearchHit>>>
    where
        S: AsRef<str> + Sync,
    {
        queries
            .par_iter()
            .map(|query| self.search(query.as_ref(), k, metric))
            .collect()
    }

    /// Holds the shard's write lock until the returned guard drops.
    #[cfg(test)]
    pub(crate) fn lock_exclusive(&self) -> impl Sized + '_ {
        self.state.write()
    }

    /// Tombstones `id`. Its text and metadata stay in place.
    pub fn mark_deleted(&self, id: EntryId) -> StoreResult<()> {
        self.state.write().index.mark_deleted(id)?;
        Ok(())
    }

    /// Replaces every live stored vector with its `width`-bit quantized form.
    ///
    /// Vectors are re-derived from the stored texts through the cache, so
    /// quantizing repeatedly never compounds precision loss. Entries added
    /// afterwards are stored quantized at the same width.
    pub fn quantize(&self, width: QuantizationWidth) -> StoreResult<QuantizationReport> {
        let bytes_before = self.state.read().index.memory_bytes();
        let mut entries = 0;
        let mut from = 0;

        // Entries added while a pass was embedding are picked up by the next
        // pass; the loop ends once a pass sees no newcomers under the lock.
        let mut state = loop {
            let (seen, snapshot) = {
                let state = self.state.read();
                (state.texts.len(), state.live_texts(from))
            };

            let texts: Vec<&str> = snapshot.iter().map(|(_, text)| text.as_str()).collect();
            let vectors = embed_concurrently(&self.cache, &texts)?;

            let mut state = self.state.write();
            for ((id, _), vector) in snapshot.iter().zip(&vectors) {
                // Deleted while we were embedding
                if state.index.is_deleted(*id) != Some(false) {
                    continue;
                }
                state
                    .index
                    .insert_quantized(QuantizedVector::encode(vector, width), *id)?;
                entries += 1;
            }

            if state.texts.len() == seen {
                break state;
            }
            from = seen;
        };
        state.quantization = Some(width);

        let report = QuantizationReport {
            width,
            entries,
            bytes_before,
            bytes_after: state.index.memory_bytes(),
        };
        info!(
            shard = self.index(),
            width = %width,
            entries = report.entries,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            "quantized shard"
        );
        Ok(report)
    }

    /// Memory estimate for the index and the parallel arrays.
    pub fn report_memory_usage(&self) -> MemoryReport {
        let state = self.state.read();
        let index_bytes = state.index.memory_bytes();
        let text_bytes: usize = state.texts.iter().map(String::len).sum();
        let metadata_bytes: usize = state.metadata.iter().map(String::len).sum();

        let report = MemoryReport {
            entries: state.texts.len(),
            live_entries: state.index.live_len(),
            index_bytes,
            text_bytes,
            metadata_bytes,
            total_bytes: index_bytes + text_bytes + metadata_bytes,
        };
        info!(
            shard = self.index(),
            entries = report.entries,
            index_bytes = report.index_bytes,
            text_bytes = report.text_bytes,
            metadata_bytes = report.metadata_bytes,
            total_bytes = report.total_bytes,
            "shard memory usage"
        );
        report
    }

    /// Writes `{base}.index` and `{base}.json`.
    pub fn save(&self, base: impl AsRef<Path>) -> StoreResult<()> {
        let paths = ShardPaths::new(base.as_ref());
        if let Some(parent) = paths.index.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        // Held for the whole save so the blob and the record agree
        let mut state = self.state.write();
        let index_checksum = state
            .index
            .save(&paths.index)
            .map_err(|e| persist_error(&paths.index, e))?;

        let now = get_utc_timestamp();
        let created_at = *state.created_at.get_or_insert(now);
        let record = ShardIndexMetadata {
            version: ShardIndexMetadata::CURRENT_VERSION,
            dimension: self.config.dimension.get(),
            max_elements: self.config.max_elements,
            similarity_metric: self.config.metric,
            entry_count: state.texts.len(),
            quantization: state.quantization,
            index_checksum,
            created_at,
            updated_at: now,
            shard: self.config.placement,
            texts: state.texts.clone(),
            metadata: state.metadata.clone(),
        };
        record.save(&paths.metadata)?;

        info!(
            shard = self.index(),
            path = %paths.index.display(),
            entries = record.entry_count,
            "saved shard"
        );
        Ok(())
    }

    /// Restores a shard written by [`save`](Self::save).
    ///
    /// Any inconsistency between the record and the blob fails the load
    /// without constructing a shard.
    pub fn load(base: impl AsRef<Path>, cache: Arc<EmbeddingCache>) -> StoreResult<Self> {
        let paths = ShardPaths::new(base.as_ref());
        let record = ShardIndexMetadata::load(&paths.metadata)?;

        let index = HnswIndex::load_verified(
            &paths.index,
            record.max_elements,
            Some(&record.index_checksum),
        )
        .map_err(|e| persist_error(&paths.index, e))?;

        let corrupt = |reason: String| StoreError::CorruptPersistedState {
            path: paths.metadata.clone(),
            reason,
        };
        if index.dimension().get() != record.dimension {
            return Err(corrupt(format!(
                "record dimension {} but index dimension {}",
                record.dimension,
                index.dimension()
            )));
        }
        if index.len() != record.entry_count {
            return Err(corrupt(format!(
                "record lists {} entries but index holds {}",
                record.entry_count,
                index.len()
            )));
        }
        if let Some(missing) = (0..record.entry_count)
            .filter_map(EntryId::from_index)
            .find(|id| !index.contains(*id))
        {
            return Err(corrupt(format!("entry {missing} is missing from the index")));
        }

        let dimension = index.dimension();
        check_embedder_dimension(&cache, dimension)?;

        let config = ShardConfig {
            dimension,
            max_elements: record.max_elements,
            metric: record.similarity_metric,
            params: *index.params(),
            placement: record.shard,
        };

        info!(
            shard = config.placement.map_or(0, |p| p.index),
            path = %paths.index.display(),
            entries = record.entry_count,
            live = index.live_len(),
            "loaded shard"
        );

        Ok(Self {
            config,
            cache,
            state: RwLock::new(ShardState {
                index,
                texts: record.texts,
                metadata: record.metadata,
                quantization: record.quantization,
                created_at: Some(record.created_at),
            }),
        })
    }
}

fn check_embedder_dimension(cache: &EmbeddingCache, dimension: VectorDimension) -> StoreResult<()> {
    let embedder_dim = cache.dimension();
    if embedder_dim != dimension {
        return Err(VectorError::DimensionMismatch {
            expected: dimension.get(),
            actual: embedder_dim.get(),
        }
        .into());
    }
    Ok(())
}

fn persist_error(path: &Path, err: VectorError) -> StoreError {
    match err {
        VectorError::Storage(source) => StoreError::Io {
            path: path.to_path_buf(),
            source,
        },
        other => StoreError::CorruptPersistedState {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}
