//! Batch ingestion: concurrent embedding, the sink trait both store levels
//! implement, and a driver that chunks an in-memory record list.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{ShardRouter, VectorShard};
use crate::vector::{EmbeddingCache, VectorError};

/// Texts handed to the embedder per backend call.
pub const EMBED_CHUNK_SIZE: usize = 32;

/// Embeds `texts` on the rayon pool, preserving input order.
///
/// Texts are split into chunks of [`EMBED_CHUNK_SIZE`]; each chunk's cache
/// misses go to the backend as one batch. Runs before any shard lock is
/// taken, so inserts only wait on the lock and never on embedding work.
pub fn embed_concurrently<S>(
    cache: &EmbeddingCache,
    texts: &[S],
) -> Result<Vec<Vec<f32>>, VectorError>
where
    S: AsRef<str> + Sync,
{
    let chunks = texts
        .par_chunks(EMBED_CHUNK_SIZE)
        .map(|chunk| {
            let refs: Vec<&str> = chunk.iter().map(|text| text.as_ref()).collect();
            cache.get_many(&refs)
        })
        .collect::<Result<Vec<_>, VectorError>>()?;
    Ok(chunks.into_iter().flatten().collect())
}

/// Destination for batches of records.
pub trait IngestSink {
    /// Commits one batch, all or nothing. Returns the number of records added.
    ///
    /// `metadata` is either empty or exactly as long as `texts`.
    fn ingest_batch(&self, texts: &[String], metadata: &[String]) -> StoreResult<usize>;
}

impl IngestSink for VectorShard {
    fn ingest_batch(&self, texts: &[String], metadata: &[String]) -> StoreResult<usize> {
        self.add_texts_batch(texts, metadata).map(|ids| ids.len())
    }
}

impl IngestSink for ShardRouter {
    fn ingest_batch(&self, texts: &[String], metadata: &[String]) -> StoreResult<usize> {
        self.add_texts_batch(texts, metadata).map(|ids| ids.len())
    }
}

/// Statistics for an ingestion run
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestStats {
    /// Records committed to the sink
    pub records_ingested: usize,

    /// Batches committed to the sink
    pub batches: usize,

    /// Blank lines skipped by the stream reader
    pub skipped_blank: usize,

    /// Time elapsed during ingestion
    pub elapsed: Duration,

    #[serde(skip)]
    start_time: Option<Instant>,
}

impl IngestStats {
    /// Create new stats and start timing
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Stop timing and record elapsed time
    pub fn stop_timing(&mut self) {
        if let Some(start) = self.start_time {
            self.elapsed = start.elapsed();
            self.start_time = None;
        }
    }

    pub fn record_batch(&mut self, records: usize) {
        self.records_ingested += records;
        self.batches += 1;
    }

    /// Throughput over the measured interval.
    #[must_use]
    pub fn records_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.records_ingested as f64 / secs
        } else {
            0.0
        }
    }

    /// Display the statistics in a human-readable format
    pub fn display(&self) {
        println!("\nIngestion Complete:");
        println!("  Records ingested: {}", self.records_ingested);
        println!("  Batches: {}", self.batches);
        println!("  Blank lines skipped: {}", self.skipped_blank);
        println!("  Time elapsed: {:.2}s", self.elapsed.as_secs_f64());

        if self.records_ingested > 0 && self.elapsed > Duration::ZERO {
            println!("  Performance: {:.0} records/second", self.records_per_second());
        }
    }
}

/// Splits an in-memory record list into fixed-size batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchIngestor {
    batch_size: usize,
}

impl BatchIngestor {
    /// Batches of `batch_size` records; zero is rejected.
    pub fn new(batch_size: usize) -> StoreResult<Self> {
        if batch_size == 0 {
            return Err(StoreError::InvalidConfig {
                reason: "batch size must be greater than 0".to_string(),
            });
        }
        Ok(Self { batch_size })
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Feeds `texts` to `sink` batch by batch.
    ///
    /// Stops at the first failing batch; earlier batches stay committed.
    pub fn ingest<K: IngestSink + ?Sized>(
        &self,
        sink: &K,
        texts: &[String],
        metadata: &[String],
    ) -> StoreResult<IngestStats> {
        if !metadata.is_empty() && metadata.len() != texts.len() {
            return Err(StoreError::ArityMismatch {
                texts: texts.len(),
                metadata: metadata.len(),
            });
        }

        let mut stats = IngestStats::new();
        for (n, chunk) in texts.chunks(self.batch_size).enumerate() {
            let start = n * self.batch_size;
            let metas = if metadata.is_empty() {
                &[][..]
            } else {
                &metadata[start..start + chunk.len()]
            };

            let added = sink.ingest_batch(chunk, metas)?;
            stats.record_batch(added);
            debug!(batch = n, records = added, "committed batch");
        }
        stats.stop_timing();

        info!(
            records = stats.records_ingested,
            batches = stats.batches,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "batch ingestion finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{Embedder, VectorDimension};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<(Vec<String>, Vec<String>)>>,
        fail_on: Option<usize>,
    }

    impl IngestSink for RecordingSink {
        fn ingest_batch(&self, texts: &[String], metadata: &[String]) -> StoreResult<usize> {
            let mut batches = self.batches.lock();
            if self.fail_on == Some(batches.len()) {
                return Err(StoreError::InvalidConfig {
                    reason: "sink refused batch".to_string(),
                });
            }
            batches.push((texts.to_vec(), metadata.to_vec()));
            Ok(texts.len())
        }
    }

    fn records(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("record {i}")).collect()
    }

    #[test]
    fn test_embed_concurrently_preserves_order() {
        let cache = EmbeddingCache::new(Embedder::hashing(VectorDimension::new(32).unwrap()), 16);
        let texts = records(20);
        let vectors = embed_concurrently(&cache, &texts).unwrap();

        assert_eq!(vectors.len(), 20);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(&cache.embedder().embed(text).unwrap(), vector);
        }
    }

    #[test]
    fn test_embed_concurrently_fills_cache_across_chunks() {
        let cache = EmbeddingCache::new(Embedder::hashing(VectorDimension::new(32).unwrap()), 256);
        let texts = records(EMBED_CHUNK_SIZE * 3 + 5);

        let first = embed_concurrently(&cache, &texts).unwrap();
        assert_eq!(cache.len(), texts.len());
        assert_eq!(cache.stats().misses, texts.len() as u64);

        // Second pass is served entirely from the cache
        let second = embed_concurrently(&cache, &texts).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().hits, texts.len() as u64);
    }

    #[test]
    fn test_chunks_with_trailing_partial_batch() {
        let sink = RecordingSink::default();
        let texts = records(7);
        let metadata: Vec<String> = (0..7).map(|i| format!("m{i}")).collect();

        let stats = BatchIngestor::new(3)
            .unwrap()
            .ingest(&sink, &texts, &metadata)
            .unwrap();

        assert_eq!(stats.records_ingested, 7);
        assert_eq!(stats.batches, 3);

        let batches = sink.batches.lock();
        let sizes: Vec<usize> = batches.iter().map(|(t, _)| t.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batches[2].1, vec!["m6".to_string()]);
    }

    #[test]
    fn test_stops_at_first_failing_batch() {
        let sink = RecordingSink {
            fail_on: Some(1),
            ..Default::default()
        };
        let result = BatchIngestor::new(2).unwrap().ingest(&sink, &records(6), &[]);

        assert!(result.is_err());
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[test]
    fn test_rejects_arity_mismatch_and_zero_batch() {
        let sink = RecordingSink::default();
        let result = BatchIngestor::new(2)
            .unwrap()
            .ingest(&sink, &records(3), &["only one".to_string()]);
        assert!(matches!(result, Err(StoreError::ArityMismatch { .. })));
        assert!(sink.batches.lock().is_empty());

        assert!(BatchIngestor::new(0).is_err());
    }

    #[test]
    fn test_stats_display() {
        let mut stats = IngestStats::new();
        stats.record_batch(10);
        stats.elapsed = Duration::from_secs(2);
        assert!((stats.records_per_second() - 5.0).abs() < 1e-9);

        // Should not panic
        stats.display();
    }
}
