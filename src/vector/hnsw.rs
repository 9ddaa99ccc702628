//! Hierarchical Navigable Small World graph over cosine distance.
//!
//! One `HnswIndex` backs one shard. Nodes live in a dense arena addressed by
//! slot; an id → slot map resolves caller ids. Deletion is a tombstone: the
//! node stays in the graph (so routing through it still works) but is never
//! returned and no longer counts against capacity.
//!
//! Level assignment hashes `(id, level_seed)`, so rebuilding the same inserts
//! in the same order produces the same graph.
//!
//! # Search
//!
//! - `Cosine`: graph search, distance `1 - cos`
//! - `DotProduct`: graph candidates re-scored by `-dot`
//! - `Euclidean`, `Manhattan`: exhaustive O(n·D) scan
//!
//! When the live count is at most `ef_search`, or the graph walk cannot fill
//! `min(k, live)` results, the exact scan is used instead so that a shard
//! always returns everything it can.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;

use bincode::{Decode, Encode};
use tracing::debug;

use crate::vector::distance::{
    cosine_from_parts, dot_iter, manhattan_iter, norm_iter, squared_euclidean_iter,
};
use crate::vector::quantize::{QuantizedVector, StoredVector};
use crate::vector::storage::{MappedBlob, write_blob};
use crate::vector::types::{EntryId, SimilarityMetric, VectorDimension, VectorError, fnv1a_hash};

/// Upper bound on node levels.
const MAX_LEVEL: usize = 16;

/// HNSW tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct HnswParams {
    /// Max connections per node on layers above 0.
    pub m: usize,
    /// Max connections per node on layer 0 (usually `2 * m`).
    pub m0: usize,
    /// Candidate list size while building.
    pub ef_construction: usize,
    /// Candidate list size while searching.
    pub ef_search: usize,
    /// Seed for deterministic level assignment.
    pub level_seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 50,
            level_seed: 0x5eed_cafe,
        }
    }
}

impl HnswParams {
    /// Params with the given `m` and `m0 = 2 * m`.
    #[must_use]
    pub fn with_m(m: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m0: m * 2,
            ..Self::default()
        }
    }

    fn level_multiplier(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 { self.m0.max(1) } else { self.m.max(1) }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
struct Node {
    id: EntryId,
    level: u32,
    /// Neighbor slots, one list per layer `0..=level`.
    neighbors: Vec<Vec<u32>>,
    vector: StoredVector,
    norm: f32,
    deleted: bool,
}

impl Node {
    fn neighbors_at(&self, layer: usize) -> &[u32] {
        self.neighbors.get(layer).map_or(&[], Vec::as_slice)
    }
}

/// Serialized form of the graph.
#[derive(Encode, Decode)]
struct IndexSnapshot {
    dimension: u32,
    params: HnswParams,
    nodes: Vec<Node>,
    entry_point: Option<u32>,
}

/// Search candidate ordered by distance, then id.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    id: EntryId,
    slot: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Query vector with its norm precomputed.
struct Query<'a> {
    vector: &'a [f32],
    norm: f32,
}

/// Approximate nearest-neighbor index for a single shard.
#[derive(Debug, Clone)]
pub struct HnswIndex {
    dimension: VectorDimension,
    max_elements: usize,
    params: HnswParams,
    nodes: Vec<Node>,
    slots: HashMap<EntryId, u32>,
    entry_point: Option<u32>,
    max_level: usize,
    live: usize,
}

impl HnswIndex {
    /// Creates an empty index holding at most `max_elements` live entries.
    #[must_use]
    pub fn new(dimension: VectorDimension, max_elements: usize, params: HnswParams) -> Self {
        Self {
            dimension,
            max_elements,
            params,
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry_point: None,
            max_level: 0,
            live: 0,
        }
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    #[must_use]
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Number of nodes, live and tombstoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of entries not marked deleted.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.live
    }

    /// Slots still available for live entries.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.max_elements.saturating_sub(self.live)
    }

    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.slots.contains_key(&id)
    }

    /// `Some(true)` for tombstoned ids, `None` for ids never inserted.
    #[must_use]
    pub fn is_deleted(&self, id: EntryId) -> Option<bool> {
        self.node(id).map(|node| node.deleted)
    }

    /// Decoded copy of the stored vector for `id`.
    #[must_use]
    pub fn get_vector(&self, id: EntryId) -> Option<Vec<f32>> {
        self.node(id).map(|node| node.vector.to_vec())
    }

    /// Stored representation for `id`.
    #[must_use]
    pub fn stored_vector(&self, id: EntryId) -> Option<&StoredVector> {
        self.node(id).map(|node| &node.vector)
    }

    /// Inserts a full-precision vector under `id`.
    ///
    /// Inserting an id that already exists replaces its vector and re-links
    /// it in the graph. Reviving a tombstoned id counts against capacity.
    pub fn insert(&mut self, vector: &[f32], id: EntryId) -> Result<(), VectorError> {
        self.dimension.validate_vector(vector)?;
        self.insert_stored(StoredVector::Full(vector.to_vec()), id)
    }

    /// Inserts a quantized vector under `id`, same semantics as [`insert`](Self::insert).
    pub fn insert_quantized(
        &mut self,
        vector: QuantizedVector,
        id: EntryId,
    ) -> Result<(), VectorError> {
        if !vector.is_well_formed(self.dimension) {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension.get(),
                actual: vector.dimension(),
            });
        }
        self.insert_stored(StoredVector::Quantized(vector), id)
    }

    fn insert_stored(&mut self, vector: StoredVector, id: EntryId) -> Result<(), VectorError> {
        let norm = norm_iter(vector.components());

        if let Some(&slot) = self.slots.get(&id) {
            let was_deleted = self.nodes[slot as usize].deleted;
            if was_deleted {
                self.ensure_capacity(1)?;
            }

            let node = &mut self.nodes[slot as usize];
            node.vector = vector;
            node.norm = norm;
            node.deleted = false;
            if was_deleted {
                self.live += 1;
            }

            self.relink(slot);
            debug!(id = id.get(), "replaced vector in index");
            return Ok(());
        }

        self.ensure_capacity(1)?;

        let slot = u32::try_from(self.nodes.len()).map_err(|_| VectorError::CapacityExceeded {
            capacity: self.max_elements,
            live: self.live,
            requested: 1,
        })?;
        let level = self.compute_level(id);
        self.nodes.push(Node {
            id,
            level: level as u32,
            neighbors: vec![Vec::new(); level + 1],
            vector,
            norm,
            deleted: false,
        });
        self.slots.insert(id, slot);
        self.live += 1;

        self.link(slot);
        Ok(())
    }

    /// Tombstones `id`. Marking an already-deleted id is a no-op.
    pub fn mark_deleted(&mut self, id: EntryId) -> Result<(), VectorError> {
        let slot = *self.slots.get(&id).ok_or(VectorError::UnknownId(id))?;
        let node = &mut self.nodes[slot as usize];
        if !node.deleted {
            node.deleted = true;
            self.live -= 1;
            debug!(id = id.get(), "marked entry deleted");
        }
        Ok(())
    }

    /// Returns up to `k` live `(id, distance)` pairs, ascending by distance
    /// with ties broken by id.
    pub fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<(EntryId, f32)>, VectorError> {
        self.dimension.validate_vector(query)?;
        if k == 0 || self.live == 0 {
            return Ok(Vec::new());
        }

        let wanted = k.min(self.live);
        if !metric.is_graph_accelerated() || self.live <= self.params.ef_search {
            return Ok(self.exact_scan(query, k, metric));
        }

        let q = Query {
            vector: query,
            norm: norm_iter(query.iter().copied()),
        };
        let ef = self.params.ef_search.max(k);
        let mut candidates = self.graph_search(&q, ef);

        if metric == SimilarityMetric::DotProduct {
            for c in &mut candidates {
                c.distance = self.metric_distance(&q, c.slot, metric);
            }
            candidates.sort();
        }

        if candidates.len() < wanted {
            debug!(
                found = candidates.len(),
                wanted, "graph search came up short, using exact scan"
            );
            return Ok(self.exact_scan(query, k, metric));
        }

        candidates.truncate(k);
        Ok(candidates.into_iter().map(|c| (c.id, c.distance)).collect())
    }

    /// Exhaustive scan over every live vector.
    #[must_use]
    pub fn exact_scan(
        &self,
        query: &[f32],
        k: usize,
        metric: SimilarityMetric,
    ) -> Vec<(EntryId, f32)> {
        let q = Query {
            vector: query,
            norm: norm_iter(query.iter().copied()),
        };

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k.min(self.live) + 1);
        for (slot, node) in self.nodes.iter().enumerate() {
            if node.deleted {
                continue;
            }
            let candidate = Candidate {
                distance: self.metric_distance(&q, slot as u32, metric),
                id: node.id,
                slot: slot as u32,
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| (c.id, c.distance))
            .collect()
    }

    /// Rough in-memory footprint of vectors, edges and id map.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let nodes: usize = self
            .nodes
            .iter()
            .map(|node| {
                let edges: usize = node
                    .neighbors
                    .iter()
                    .map(|layer| layer.len() * std::mem::size_of::<u32>())
                    .sum();
                std::mem::size_of::<Node>() + node.vector.byte_len() + edges
            })
            .sum();
        let slots =
            self.slots.len() * (std::mem::size_of::<EntryId>() + std::mem::size_of::<u32>());
        std::mem::size_of::<Self>() + nodes + slots
    }

    /// Writes the graph to `path` and returns the SHA-256 of the file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<String, VectorError> {
        let snapshot = IndexSnapshot {
            dimension: self.dimension.get() as u32,
            params: self.params,
            nodes: self.nodes.clone(),
            entry_point: self.entry_point,
        };
        let payload = bincode::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| corrupt(format!("failed to encode index: {e}")))?;

        let checksum = write_blob(
            path.as_ref(),
            snapshot.dimension,
            self.nodes.len() as u64,
            &payload,
        )?;
        debug!(
            path = %path.as_ref().display(),
            nodes = self.nodes.len(),
            bytes = payload.len(),
            "saved index blob"
        );
        Ok(checksum)
    }

    /// Loads a graph saved by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>, max_elements: usize) -> Result<Self, VectorError> {
        Self::load_verified(path, max_elements, None)
    }

    /// Loads a graph, optionally requiring the file's SHA-256 to match.
    pub fn load_verified(
        path: impl AsRef<Path>,
        max_elements: usize,
        expected_checksum: Option<&str>,
    ) -> Result<Self, VectorError> {
        let blob = MappedBlob::open(path.as_ref())?;

        if let Some(expected) = expected_checksum {
            let actual = blob.file_checksum();
            if actual != expected {
                return Err(corrupt(format!(
                    "file checksum {actual} does not match recorded {expected}"
                )));
            }
        }

        let (snapshot, read): (IndexSnapshot, usize) =
            bincode::decode_from_slice(blob.payload(), bincode::config::standard())
                .map_err(|e| corrupt(format!("failed to decode index: {e}")))?;
        if read != blob.payload().len() {
            return Err(corrupt("trailing bytes after index payload"));
        }
        if snapshot.dimension != blob.header().dimension
            || snapshot.nodes.len() as u64 != blob.header().node_count
        {
            return Err(corrupt("header does not match payload"));
        }

        let index = Self::from_snapshot(snapshot, max_elements)?;
        debug!(
            path = %path.as_ref().display(),
            nodes = index.len(),
            live = index.live_len(),
            "loaded index blob"
        );
        Ok(index)
    }

    fn from_snapshot(snapshot: IndexSnapshot, max_elements: usize) -> Result<Self, VectorError> {
        let dimension = VectorDimension::new(snapshot.dimension as usize)
            .map_err(|e| corrupt(e.to_string()))?;
        let node_count = snapshot.nodes.len();

        let mut slots = HashMap::with_capacity(node_count);
        let mut live = 0;
        let mut max_level = 0;
        for (slot, node) in snapshot.nodes.iter().enumerate() {
            let well_formed = match &node.vector {
                StoredVector::Full(v) => v.len() == dimension.get(),
                StoredVector::Quantized(q) => q.is_well_formed(dimension),
            };
            if !well_formed {
                return Err(corrupt(format!("node {} has wrong dimension", node.id)));
            }
            if node.neighbors.len() != node.level as usize + 1 {
                return Err(corrupt(format!("node {} has inconsistent layers", node.id)));
            }
            if node
                .neighbors
                .iter()
                .flatten()
                .any(|&n| n as usize >= node_count)
            {
                return Err(corrupt(format!("node {} links past the arena", node.id)));
            }
            if slots.insert(node.id, slot as u32).is_some() {
                return Err(corrupt(format!("duplicate id {}", node.id)));
            }
            if !node.deleted {
                live += 1;
            }
            max_level = max_level.max(node.level as usize);
        }

        match snapshot.entry_point {
            None if node_count > 0 => return Err(corrupt("missing entry point")),
            Some(ep) if ep as usize >= node_count => {
                return Err(corrupt("entry point out of range"));
            }
            _ => {}
        }

        if live > max_elements {
            return Err(VectorError::CapacityExceeded {
                capacity: max_elements,
                live,
                requested: 0,
            });
        }

        Ok(Self {
            dimension,
            max_elements,
            params: snapshot.params,
            nodes: snapshot.nodes,
            slots,
            entry_point: snapshot.entry_point,
            max_level,
            live,
        })
    }

    // Private helper methods

    fn node(&self, id: EntryId) -> Option<&Node> {
        self.slots.get(&id).map(|&slot| &self.nodes[slot as usize])
    }

    fn ensure_capacity(&self, requested: usize) -> Result<(), VectorError> {
        if self.live + requested > self.max_elements {
            return Err(VectorError::CapacityExceeded {
                capacity: self.max_elements,
                live: self.live,
                requested,
            });
        }
        Ok(())
    }

    fn compute_level(&self, id: EntryId) -> usize {
        let mut key = [0u8; 12];
        key[..4].copy_from_slice(&id.get().to_le_bytes());
        key[4..].copy_from_slice(&self.params.level_seed.to_le_bytes());
        let hash = mix64(fnv1a_hash(&key));

        // Uniform in (0, 1]; avoids ln(0)
        let uniform = ((hash >> 11) as f64 + 1.0) / ((1u64 << 53) as f64);
        let level = (-uniform.ln() * self.params.level_multiplier()).floor() as usize;
        level.min(MAX_LEVEL)
    }

    /// Cosine distance between the query and a stored node.
    fn graph_distance(&self, q: &Query<'_>, slot: u32) -> f32 {
        let node = &self.nodes[slot as usize];
        let dot = dot_iter(q.vector.iter().copied(), node.vector.components());
        1.0 - cosine_from_parts(dot, q.norm, node.norm)
    }

    fn metric_distance(&self, q: &Query<'_>, slot: u32, metric: SimilarityMetric) -> f32 {
        let node = &self.nodes[slot as usize];
        let stored = node.vector.components();
        let query = q.vector.iter().copied();
        match metric {
            SimilarityMetric::Cosine => self.graph_distance(q, slot),
            SimilarityMetric::DotProduct => -dot_iter(query, stored),
            SimilarityMetric::Euclidean => squared_euclidean_iter(query, stored).sqrt(),
            SimilarityMetric::Manhattan => manhattan_iter(query, stored),
        }
    }

    fn candidate(&self, q: &Query<'_>, slot: u32) -> Candidate {
        Candidate {
            distance: self.graph_distance(q, slot),
            id: self.nodes[slot as usize].id,
            slot,
        }
    }

    /// Full descent from the entry point; returns live nodes only.
    fn graph_search(&self, q: &Query<'_>, ef: usize) -> Vec<Candidate> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };

        let mut current = entry;
        for layer in (1..=self.max_level).rev() {
            current = self.search_layer_single(q, current, layer);
        }
        self.search_layer(q, &[current], ef, 0, false)
    }

    /// Greedy walk to the closest node reachable on `layer`.
    fn search_layer_single(&self, q: &Query<'_>, start: u32, layer: usize) -> u32 {
        let mut current = self.candidate(q, start);
        loop {
            let mut changed = false;
            for &neighbor in self.nodes[current.slot as usize].neighbors_at(layer) {
                let next = self.candidate(q, neighbor);
                if next < current {
                    current = next;
                    changed = true;
                }
            }
            if !changed {
                return current.slot;
            }
        }
    }

    /// Beam search on one layer. Tombstoned nodes are traversed but only
    /// returned when `include_deleted` is set.
    fn search_layer(
        &self,
        q: &Query<'_>,
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        include_deleted: bool,
    ) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut visited: HashSet<u32> = HashSet::new();
        // Min-heap of nodes to expand
        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        // Max-heap of the best results so far
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        let accept = |slot: u32| include_deleted || !self.nodes[slot as usize].deleted;

        for &ep in entry_points {
            if visited.insert(ep) {
                let c = self.candidate(q, ep);
                candidates.push(Reverse(c));
                if accept(ep) {
                    results.push(c);
                }
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef && results.peek().is_some_and(|worst| current > *worst) {
                break;
            }

            for &neighbor in self.nodes[current.slot as usize].neighbors_at(layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let next = self.candidate(q, neighbor);
                let dominated =
                    results.len() >= ef && results.peek().is_some_and(|worst| next > *worst);
                if dominated {
                    continue;
                }

                candidates.push(Reverse(next));
                if accept(neighbor) {
                    results.push(next);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Connects a freshly pushed node into the graph.
    fn link(&mut self, slot: u32) {
        let level = self.nodes[slot as usize].level as usize;
        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_level = level;
            return;
        };

        self.connect(slot, entry);

        if level > self.max_level {
            self.entry_point = Some(slot);
            self.max_level = level;
        }
    }

    /// Drops a node's outgoing edges and connects it again for its new vector.
    fn relink(&mut self, slot: u32) {
        for layer in &mut self.nodes[slot as usize].neighbors {
            layer.clear();
        }

        let start = match self.entry_point {
            Some(entry) if entry != slot => Some(entry),
            _ => (0..self.nodes.len() as u32)
                .filter(|&s| s != slot)
                .max_by_key(|&s| (self.nodes[s as usize].level, Reverse(s))),
        };
        if let Some(start) = start {
            self.connect(slot, start);
        }
    }

    fn connect(&mut self, slot: u32, start: u32) {
        let level = self.nodes[slot as usize].level as usize;
        let query_vector = self.nodes[slot as usize].vector.to_vec();
        let q = Query {
            vector: &query_vector,
            norm: self.nodes[slot as usize].norm,
        };

        let mut current = start;
        for layer in (level + 1..=self.max_level).rev() {
            current = self.search_layer_single(&q, current, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&q, &[current], self.params.ef_construction, layer, true);
            let max_conn = self.params.max_connections(layer);
            let selected: Vec<u32> = found
                .iter()
                .filter(|c| c.slot != slot)
                .take(max_conn)
                .map(|c| c.slot)
                .collect();

            if let Some(next) = selected.first() {
                current = *next;
            }

            self.nodes[slot as usize].neighbors[layer] = selected.clone();
            for neighbor in selected {
                self.add_reverse_edge(neighbor, slot, layer, max_conn);
            }
        }
    }

    /// Adds `from -> to` on `layer`, pruning `from` to its closest `max_conn`.
    fn add_reverse_edge(&mut self, from: u32, to: u32, layer: usize, max_conn: usize) {
        let Some(edges) = self.nodes[from as usize].neighbors.get(layer) else {
            return;
        };
        if edges.contains(&to) {
            return;
        }

        let mut edges = edges.clone();
        edges.push(to);
        if edges.len() > max_conn {
            let anchor = &self.nodes[from as usize];
            let mut scored: Vec<(f32, EntryId, u32)> = edges
                .iter()
                .map(|&n| {
                    let other = &self.nodes[n as usize];
                    let dot = dot_iter(anchor.vector.components(), other.vector.components());
                    let distance = 1.0 - cosine_from_parts(dot, anchor.norm, other.norm);
                    (distance, other.id, n)
                })
                .collect();
            scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            scored.truncate(max_conn);
            edges = scored.into_iter().map(|(_, _, n)| n).collect();
        }
        self.nodes[from as usize].neighbors[layer] = edges;
    }
}

fn corrupt(reason: impl Into<String>) -> VectorError {
    VectorError::CorruptIndex {
        reason: reason.into(),
    }
}

/// splitmix64 finalizer; FNV-1a alone leaves the high bits of short
/// sequential keys correlated.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
