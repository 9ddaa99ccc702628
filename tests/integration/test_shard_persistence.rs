//! Saving and loading shards, and detecting damaged artifacts.

use std::fs;
use std::sync::Arc;

use crate::common::{TestStore, shard, synthetic};
use shardvec::store::{ShardIndexMetadata, ShardPaths};
use shardvec::{EntryId, QuantizationWidth, SimilarityMetric, StoreError, VectorShard};

fn saved_shard(store: &TestStore, n: usize) -> VectorShard {
    let shard = shard(64, 1000);
    let texts = synthetic(n);
    let metas: Vec<String> = (0..n).map(|i| format!("tag-{}", i % 4)).collect();
    shard.add_texts_batch(&texts, &metas).unwrap();
    shard.save(store.base()).unwrap();
    shard
}

#[test]
fn test_roundtrip_reproduces_graph_search() {
    let store = TestStore::new();
    let original = saved_shard(&store, 300);
    original.mark_deleted(EntryId::new(11)).unwrap();
    original.save(store.base()).unwrap();

    let loaded = VectorShard::load(store.base(), Arc::clone(original.cache())).unwrap();
    assert_eq!(loaded.len(), 300);
    assert_eq!(loaded.live_len(), 299);
    assert_eq!(loaded.entry(EntryId::new(5)), original.entry(EntryId::new(5)));

    let queries = synthetic(300);
    for query in queries.iter().step_by(7) {
        for metric in SimilarityMetric::ALL {
            assert_eq!(
                original.search(query, 5, metric).unwrap(),
                loaded.search(query, 5, metric).unwrap(),
                "{metric}"
            );
        }
    }

    // Ids keep counting from where the saved shard stopped
    assert_eq!(loaded.add_text("new after load", "").unwrap(), EntryId::new(300));
}

#[test]
fn test_artifacts_are_written_side_by_side() {
    let store = TestStore::new();
    saved_shard(&store, 10);

    let paths = ShardPaths::new(store.base());
    assert!(paths.both_exist());

    let record = ShardIndexMetadata::load(&paths.metadata).unwrap();
    assert_eq!(record.dimension, 64);
    assert_eq!(record.max_elements, 1000);
    assert_eq!(record.entry_count, 10);
    assert_eq!(record.texts.len(), 10);
    assert_eq!(record.metadata[1], "tag-1");
    assert_eq!(record.similarity_metric, SimilarityMetric::Cosine);
    assert_eq!(record.index_checksum.len(), 64);
    assert!(record.created_at <= record.updated_at);
}

#[test]
fn test_quantization_survives_reload() {
    let store = TestStore::new();
    let shard = saved_shard(&store, 40);
    shard.quantize(QuantizationWidth::Four).unwrap();
    shard.save(store.base()).unwrap();

    let loaded = VectorShard::load(store.base(), Arc::clone(shard.cache())).unwrap();
    assert_eq!(loaded.quantization(), Some(QuantizationWidth::Four));
    assert_eq!(
        loaded.report_memory_usage().index_bytes,
        shard.report_memory_usage().index_bytes
    );
}

#[test]
fn test_flipped_index_byte_is_detected() {
    let store = TestStore::new();
    let shard = saved_shard(&store, 20);
    let paths = ShardPaths::new(store.base());

    let mut bytes = fs::read(&paths.index).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&paths.index, bytes).unwrap();

    let err = VectorShard::load(store.base(), Arc::clone(shard.cache())).unwrap_err();
    assert!(matches!(err, StoreError::CorruptPersistedState { .. }), "{err}");
    assert_eq!(err.status_code(), "CORRUPT_PERSISTED_STATE");
}

#[test]
fn test_truncated_index_is_detected() {
    let store = TestStore::new();
    let shard = saved_shard(&store, 20);
    let paths = ShardPaths::new(store.base());

    let bytes = fs::read(&paths.index).unwrap();
    fs::write(&paths.index, &bytes[..bytes.len() / 2]).unwrap();

    assert!(matches!(
        VectorShard::load(store.base(), Arc::clone(shard.cache())),
        Err(StoreError::CorruptPersistedState { .. })
    ));
}

#[test]
fn test_swapped_index_fails_checksum() {
    let store = TestStore::new();
    let shard = saved_shard(&store, 20);

    // A valid blob from a different shard
    let other_base = store.dir.path().join("other");
    let other = crate::common::shard(64, 1000);
    other.add_text("something else entirely", "").unwrap();
    other.save(&other_base).unwrap();
    fs::copy(
        ShardPaths::new(&other_base).index,
        ShardPaths::new(store.base()).index,
    )
    .unwrap();

    assert!(matches!(
        VectorShard::load(store.base(), Arc::clone(shard.cache())),
        Err(StoreError::CorruptPersistedState { .. })
    ));
}

#[test]
fn test_record_arrays_must_match_index() {
    let store = TestStore::new();
    let shard = saved_shard(&store, 20);
    let paths = ShardPaths::new(store.base());

    let mut record = ShardIndexMetadata::load(&paths.metadata).unwrap();
    record.texts.pop();
    record.metadata.pop();
    record.entry_count -= 1;
    record.save(&paths.metadata).unwrap();

    assert!(matches!(
        VectorShard::load(store.base(), Arc::clone(shard.cache())),
        Err(StoreError::CorruptPersistedState { .. })
    ));
}

#[test]
fn test_missing_artifacts() {
    let store = TestStore::new();
    let shard = saved_shard(&store, 5);
    fs::remove_file(ShardPaths::new(store.base()).index).unwrap();

    assert!(matches!(
        VectorShard::load(store.base(), Arc::clone(shard.cache())),
        Err(StoreError::Io { .. })
    ));
}
