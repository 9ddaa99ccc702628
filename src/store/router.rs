//! Hash-routed overlay over N independent shards.
//!
//! Writes go to exactly one shard, chosen by `fnv1a(text) % shard_count`.
//! Searches embed the query once, fan out to every shard on its own thread,
//! wait for all of them (or a deadline), and merge the local top-k lists
//! into a global top-k.
//!
//! Changing the shard count invalidates the routing of everything already
//! stored; there is no rebalancing.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, unbounded};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{StoreError, StoreResult};
use crate::store::persist::{ShardPaths, ShardPlacement, shard_base};
use crate::store::shard::{MemoryReport, QuantizationReport, SearchHit, ShardConfig, VectorShard};
use crate::vector::{
    EmbeddingCache, EntryId, QuantizationWidth, SimilarityMetric, VectorError, fnv1a_hash,
};

/// How a fan-out search treats slow or failing shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutOptions {
    /// Stop waiting after this long; shards still running are reported as
    /// timed out and the result is partial.
    pub deadline: Option<Duration>,
    /// Merge the healthy shards' results when others error or panic instead
    /// of failing the whole search.
    pub allow_partial: bool,
}

impl FanoutOptions {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            deadline: settings.search.deadline(),
            allow_partial: settings.search.allow_partial,
        }
    }
}

/// Why a shard contributed nothing to a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Error(String),
    Panicked(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFailure {
    pub shard: usize,
    pub reason: FailureReason,
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FailureReason::Error(msg) => write!(f, "shard {} failed: {msg}", self.shard),
            FailureReason::Panicked(msg) => write!(f, "shard {} panicked: {msg}", self.shard),
            FailureReason::TimedOut => write!(f, "shard {} timed out", self.shard),
        }
    }
}

/// Merged hits plus which shards answered.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    /// Shards whose results were merged, ascending
    pub succeeded: Vec<usize>,
    /// Shards that did not contribute, ascending
    pub failures: Vec<ShardFailure>,
}

impl SearchOutcome {
    /// True when at least one shard is missing from the merge.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Memory estimate per shard and in total.
#[derive(Debug, Clone, Serialize)]
pub struct RouterMemoryReport {
    pub shards: Vec<MemoryReport>,
    pub total: MemoryReport,
}

/// Shard index for `text` out of `shard_count`.
#[must_use]
pub fn route(text: &str, shard_count: usize) -> usize {
    (fnv1a_hash(text.as_bytes()) % shard_count as u64) as usize
}

/// Global top-`k` from per-shard lists.
///
/// Ordered by score descending, then shard ascending, then id ascending.
#[must_use]
pub fn merge_hits(per_shard: Vec<Vec<SearchHit>>, k: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = per_shard.into_iter().flatten().collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.shard.cmp(&b.shard))
            .then(a.id.cmp(&b.id))
    });
    hits.truncate(k);
    hits
}

/// Fixed set of shards sharing one embedding cache.
pub struct ShardRouter {
    shards: Vec<Arc<VectorShard>>,
    cache: Arc<EmbeddingCache>,
    options: FanoutOptions,
}

impl fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRouter")
            .field("shards", &self.shards.len())
            .field("options", &self.options)
            .finish()
    }
}

impl ShardRouter {
    /// Creates `shard_count` empty shards built from `config`.
    pub fn new(
        shard_count: usize,
        config: ShardConfig,
        cache: Arc<EmbeddingCache>,
    ) -> StoreResult<Self> {
        if shard_count == 0 {
            return Err(StoreError::InvalidConfig {
                reason: "shard count must be greater than 0".to_string(),
            });
        }

        let shards = (0..shard_count)
            .map(|index| {
                let placed = config.clone().with_placement(ShardPlacement {
                    index,
                    count: shard_count,
                });
                VectorShard::new(placed, Arc::clone(&cache)).map(Arc::new)
            })
            .collect::<StoreResult<Vec<_>>>()?;

        debug!(shards = shard_count, "created shard router");
        Ok(Self {
            shards,
            cache,
            options: FanoutOptions::default(),
        })
    }

    /// Fan-out behavior used by [`search`](Self::search).
    #[must_use]
    pub fn with_options(mut self, options: FanoutOptions) -> Self {
        self.options = options;
        self
    }

    /// Loads the store at the configured data path, or creates an empty one
    /// when nothing has been saved there yet.
    pub fn open_or_create(settings: &Settings, cache: Arc<EmbeddingCache>) -> StoreResult<Self> {
        let base = settings.resolved_data_path();
        let count = settings.store.shard_count;
        let options = FanoutOptions::from_settings(settings);

        let router = if ShardPaths::for_shard(&base, 0).any_exists() {
            Self::load(&base, count, cache)?
        } else {
            info!(path = %base.display(), shards = count, "creating new store");
            Self::new(count, ShardConfig::from_settings(settings)?, cache)?
        };
        Ok(router.with_options(options))
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn shards(&self) -> &[Arc<VectorShard>] {
        &self.shards
    }

    pub fn shard(&self, shard: usize) -> StoreResult<&Arc<VectorShard>> {
        self.shards.get(shard).ok_or(StoreError::ShardOutOfRange {
            shard,
            shard_count: self.shards.len(),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    #[must_use]
    pub fn options(&self) -> FanoutOptions {
        self.options
    }

    /// Entries ever stored across all shards, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn live_len(&self) -> usize {
        self.shards.iter().map(|s| s.live_len()).sum()
    }

    #[must_use]
    pub fn shard_for(&self, text: &str) -> usize {
        route(text, self.shards.len())
    }

    /// Stores one record in its shard. Returns `(shard, id)`.
    pub fn add_text(&self, text: &str, metadata: &str) -> StoreResult<(usize, EntryId)> {
        let shard = self.shard_for(text);
        let id = self.shards[shard].add_text(text, metadata)?;
        Ok((shard, id))
    }

    /// Stores a batch, returning `(shard, id)` per input in input order.
    ///
    /// Every target shard's capacity is checked before anything is
    /// committed; shard groups are then committed in parallel.
    pub fn add_texts_batch(
        &self,
        texts: &[String],
        metadata: &[String],
    ) -> StoreResult<Vec<(usize, EntryId)>> {
        if !metadata.is_empty() && metadata.len() != texts.len() {
            return Err(StoreError::ArityMismatch {
                texts: texts.len(),
                metadata: metadata.len(),
            });
        }

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); self.shards.len()];
        for (i, text) in texts.iter().enumerate() {
            groups[self.shard_for(text)].push(i);
        }

        for (shard, positions) in groups.iter().enumerate() {
            let remaining = self.shards[shard].remaining_capacity();
            if positions.len() > remaining {
                return Err(VectorError::CapacityExceeded {
                    capacity: self.shards[shard].config().max_elements,
                    live: self.shards[shard].live_len(),
                    requested: positions.len(),
                }
                .into());
            }
        }

        let committed: Vec<(usize, Vec<usize>, Vec<EntryId>)> = groups
            .into_par_iter()
            .enumerate()
            .filter(|(_, positions)| !positions.is_empty())
            .map(|(shard, positions)| -> StoreResult<(usize, Vec<usize>, Vec<EntryId>)> {
                let group_texts: Vec<String> = positions.iter().map(|&i| texts[i].clone()).collect();
                let group_metas: Vec<String> = if metadata.is_empty() {
                    Vec::new()
                } else {
                    positions.iter().map(|&i| metadata[i].clone()).collect()
                };
                let ids = self.shards[shard].add_texts_batch(&group_texts, &group_metas)?;
                Ok((shard, positions, ids))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let mut placed = vec![(0, EntryId::new(0)); texts.len()];
        for (shard, positions, ids) in committed {
            for (position, id) in positions.into_iter().zip(ids) {
                placed[position] = (shard, id);
            }
        }
        Ok(placed)
    }

    /// Searches with the router's configured [`FanoutOptions`].
    ///
    /// The hits carry no partial tag, so any shard that errored, panicked,
    /// or missed the deadline fails the search with
    /// [`StoreError::PartialShardFailure`] unless partial results are
    /// allowed. Use [`search_with`](Self::search_with) to receive tagged
    /// partial results instead.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        metric: SimilarityMetric,
    ) -> StoreResult<Vec<SearchHit>> {
        let outcome = self.search_with(query, k, metric, self.options)?;
        if outcome.is_partial() && !self.options.allow_partial {
            return Err(StoreError::PartialShardFailure {
                failures: outcome.failures,
                succeeded: outcome.succeeded,
            });
        }
        Ok(outcome.hits)
    }

    /// Fan-out search with explicit options.
    pub fn search_with(
        &self,
        query: &str,
        k: usize,
        metric: SimilarityMetric,
        options: FanoutOptions,
    ) -> StoreResult<SearchOutcome> {
        let vector: Arc<[f32]> = Arc::from(self.cache.get(query)?);
        self.search_vector_with(vector, k, metric, options)
    }

    /// Fan-out search for an already-embedded query.
    pub fn search_vector_with(
        &self,
        vector: Arc<[f32]>,
        k: usize,
        metric: SimilarityMetric,
        options: FanoutOptions,
    ) -> StoreResult<SearchOutcome> {
        self.cache.embedder().dimension().validate_vector(&vector)?;

        let (results, failures) = fan_out(&self.shards, options.deadline, move |shard| {
            shard.search_vector(&vector, k, metric)
        });
        finish_outcome(results, failures, k, options)
    }

    /// Searches every query; result `i` belongs to `queries[i]`.
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

    /// Tombstones entry `id` of `shard`.
    pub fn mark_deleted(&self, shard: usize, id: EntryId) -> StoreResult<()> {
        self.shard(shard)?.mark_deleted(id)
    }

    /// Quantizes every shard, returning one report per shard.
    pub fn quantize(&self, width: QuantizationWidth) -> StoreResult<Vec<QuantizationReport>> {
        self.shards
            .par_iter()
            .map(|shard| shard.quantize(width))
            .collect()
    }

    pub fn report_memory_usage(&self) -> RouterMemoryReport {
        let shards: Vec<MemoryReport> = self
            .shards
            .iter()
            .map(|shard| shard.report_memory_usage())
            .collect();
        let total: MemoryReport = shards.iter().copied().sum();

        info!(
            shards = shards.len(),
            entries = total.entries,
            total_bytes = total.total_bytes,
            "store memory usage"
        );
        RouterMemoryReport { shards, total }
    }

    /// Writes shard `i` at `{base}_shard{i}`.
    pub fn save(&self, base: impl AsRef<Path>) -> StoreResult<()> {
        let base = base.as_ref();
        self.shards
            .par_iter()
            .enumerate()
            .try_for_each(|(i, shard)| shard.save(shard_base(base, i)))?;

        info!(path = %base.display(), shards = self.shards.len(), "saved store");
        Ok(())
    }

    /// Loads exactly `shard_count` shards saved at `base`.
    ///
    /// A missing shard, an extra `{base}_shard{shard_count}` artifact, or a
    /// shard whose recorded placement disagrees fails the whole load.
    pub fn load(
        base: impl AsRef<Path>,
        shard_count: usize,
        cache: Arc<EmbeddingCache>,
    ) -> StoreResult<Self> {
        let base = base.as_ref();
        let mismatch = |reason: String| StoreError::ShardLayoutMismatch {
            base: base.to_path_buf(),
            reason,
        };

        if shard_count == 0 {
            return Err(StoreError::InvalidConfig {
                reason: "shard count must be greater than 0".to_string(),
            });
        }
        if let Some(missing) =
            (0..shard_count).find(|&i| !ShardPaths::for_shard(base, i).both_exist())
        {
            return Err(mismatch(format!(
                "shard {missing} of {shard_count} is missing"
            )));
        }
        if ShardPaths::for_shard(base, shard_count).any_exists() {
            return Err(mismatch(format!(
                "found extra shard {shard_count}; expected shards 0..{shard_count}"
            )));
        }

        let shards = (0..shard_count)
            .into_par_iter()
            .map(|i| VectorShard::load(shard_base(base, i), Arc::clone(&cache)).map(Arc::new))
            .collect::<StoreResult<Vec<_>>>()?;

        for (i, shard) in shards.iter().enumerate() {
            let expected = ShardPlacement {
                index: i,
                count: shard_count,
            };
            if shard.config().placement != Some(expected) {
                return Err(mismatch(format!(
                    "shard {i} was saved as {:?}, expected {expected:?}",
                    shard.config().placement
                )));
            }
            if shard.dimension() != shards[0].dimension() {
                return Err(mismatch(format!(
                    "shard {i} has dimension {} but shard 0 has {}",
                    shard.dimension(),
                    shards[0].dimension()
                )));
            }
        }

        info!(
            path = %base.display(),
            shards = shard_count,
            entries = shards.iter().map(|s| s.len()).sum::<usize>(),
            "loaded store"
        );
        Ok(Self {
            shards,
            cache,
            options: FanoutOptions::default(),
        })
    }
}

type ShardResults = Vec<(usize, Vec<SearchHit>)>;

/// Runs `work` against every shard on its own thread and joins.
///
/// The join waits for every shard to answer or fail; with a deadline it
/// stops waiting when the deadline passes and reports the stragglers as
/// timed out. Their threads are left to finish in the background.
fn fan_out<F>(
    shards: &[Arc<VectorShard>],
    deadline: Option<Duration>,
    work: F,
) -> (ShardResults, Vec<ShardFailure>)
where
    F: Fn(&VectorShard) -> StoreResult<Vec<SearchHit>> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let (tx, rx) = unbounded();
    let mut failures = Vec::new();
    let mut pending = vec![false; shards.len()];

    for (i, shard) in shards.iter().enumerate() {
        let tx = tx.clone();
        let shard = Arc::clone(shard);
        let work = Arc::clone(&work);

        let spawned = std::thread::Builder::new()
            .name(format!("shardvec-shard-{i}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| work(shard.as_ref())));
                // The receiver is gone once the deadline has passed
                let _ = tx.send((i, result));
            });

        match spawned {
            Ok(_) => pending[i] = true,
            Err(e) => failures.push(ShardFailure {
                shard: i,
                reason: FailureReason::Error(format!("failed to spawn search thread: {e}")),
            }),
        }
    }
    drop(tx);

    let until = deadline.map(|d| Instant::now() + d);
    let mut results = Vec::new();
    while pending.iter().any(|p| *p) {
        let received = match until {
            Some(until) => rx.recv_deadline(until),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok((i, outcome)) => {
                pending[i] = false;
                match outcome {
                    Ok(Ok(hits)) => results.push((i, hits)),
                    Ok(Err(e)) => failures.push(ShardFailure {
                        shard: i,
                        reason: FailureReason::Error(e.to_string()),
                    }),
                    Err(payload) => failures.push(ShardFailure {
                        shard: i,
                        reason: FailureReason::Panicked(panic_message(payload.as_ref())),
                    }),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                for (i, _) in pending.iter().enumerate().filter(|(_, p)| **p) {
                    failures.push(ShardFailure {
                        shard: i,
                        reason: FailureReason::TimedOut,
                    });
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                for (i, _) in pending.iter().enumerate().filter(|(_, p)| **p) {
                    failures.push(ShardFailure {
                        shard: i,
                        reason: FailureReason::Error("search thread exited without a result".into()),
                    });
                }
                break;
            }
        }
    }

    failures.sort_by_key(|f| f.shard);
    results.sort_by_key(|(i, _)| *i);
    (results, failures)
}

fn finish_outcome(
    results: ShardResults,
    failures: Vec<ShardFailure>,
    k: usize,
    options: FanoutOptions,
) -> StoreResult<SearchOutcome> {
    let succeeded: Vec<usize> = results.iter().map(|(i, _)| *i).collect();

    let hard_failure = failures
        .iter()
        .any(|f| !matches!(f.reason, FailureReason::TimedOut));
    if hard_failure && !options.allow_partial {
        return Err(StoreError::PartialShardFailure {
            failures,
            succeeded,
        });
    }

    if !failures.is_empty() {
        warn!(
            failed = failures.len(),
            succeeded = succeeded.len(),
            "returning partial search results"
        );
        for failure in &failures {
            warn!(shard = failure.shard, "{failure}");
        }
    }

    let hits = merge_hits(results.into_iter().map(|(_, hits)| hits).collect(), k);
    Ok(SearchOutcome {
        hits,
        succeeded,
        failures,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
