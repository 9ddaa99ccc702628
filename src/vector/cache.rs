//! Bounded LRU memo in front of an [`Embedder`].
//!
//! Hits refresh recency and the least recently used entry is evicted first,
//! so eviction order is fully determined by the access sequence. Embeddings
//! for misses are computed outside the lock.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::vector::embedding::Embedder;
use crate::vector::types::{VectorDimension, VectorError};

/// Default number of cached embeddings.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct LruState {
    capacity: usize,
    entries: LruCache<String, Arc<[f32]>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LruState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: LruCache::new(slots(capacity)),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn lookup(&mut self, text: &str) -> Option<Arc<[f32]>> {
        self.entries.get(text).cloned()
    }

    fn insert(&mut self, text: &str, vector: Arc<[f32]>) {
        if self.capacity == 0 {
            return;
        }
        // Another thread may have filled this key while we were embedding
        if self.entries.get(text).is_some() {
            return;
        }
        if self.entries.push(text.to_string(), vector).is_some() {
            self.evictions += 1;
        }
    }

    fn resize(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            if self.entries.pop_lru().is_none() {
                break;
            }
            self.evictions += 1;
        }
        self.entries.resize(slots(capacity));
        self.capacity = capacity;
    }
}

/// `LruCache` needs at least one slot; capacity 0 bypasses it entirely.
fn slots(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

/// Embedding cache shared by every shard of a store.
pub struct EmbeddingCache {
    embedder: Embedder,
    state: Mutex<LruState>,
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("embedder", &self.embedder)
            .field("stats", &self.stats())
            .finish()
    }
}

impl EmbeddingCache {
    /// Wraps `embedder` with room for `capacity` embeddings. Zero disables
    /// caching.
    #[must_use]
    pub fn new(embedder: Embedder, capacity: usize) -> Self {
        Self {
            embedder,
            state: Mutex::new(LruState::new(capacity)),
        }
    }

    #[must_use]
    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.embedder.dimension()
    }

    /// Returns the embedding for `text`, computing and caching it on a miss.
    pub fn get(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        {
            let mut state = self.state.lock();
            if let Some(vector) = state.lookup(text) {
                state.hits += 1;
                return Ok(vector.to_vec());
            }
            state.misses += 1;
        }

        let vector = self.embedder.embed(text)?;
        self.state.lock().insert(text, Arc::from(vector.as_slice()));
        Ok(vector)
    }

    /// Looks up many texts at once, preserving input order.
    ///
    /// Misses are embedded in a single backend batch.
    pub fn get_many(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<usize> = Vec::new();
        {
            let mut state = self.state.lock();
            for (i, text) in texts.iter().enumerate() {
                match state.lookup(text) {
                    Some(vector) => {
                        state.hits += 1;
                        out.push(Some(vector.to_vec()));
                    }
                    None => {
                        state.misses += 1;
                        out.push(None);
                        missing.push(i);
                    }
                }
            }
        }

        if !missing.is_empty() {
            let batch: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let vectors = self.embedder.embed_batch(&batch)?;

            let mut state = self.state.lock();
            for (i, vector) in missing.into_iter().zip(vectors) {
                state.insert(texts[i], Arc::from(vector.as_slice()));
                out[i] = Some(vector);
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| VectorError::EmbeddingFailed("missing batch embedding".into())))
            .collect()
    }

    /// Changes the capacity. Shrinking evicts least-recently-used entries
    /// immediately.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        let before = state.evictions;
        state.resize(capacity);
        debug!(
            capacity,
            evicted = state.evictions - before,
            "embedding cache resized"
        );
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    #[must_use]
    pub fn contains(&self, text: &str) -> bool {
        self.state.lock().entries.contains(text)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            len: state.entries.len(),
            capacity: state.capacity,
        }
    }
}
