//! Routing, fan-out merge and persisted shard layouts.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{KOREAN_BATCH, KOREAN_CORPUS, TestStore, router, split, synthetic};
use shardvec::store::{ShardPaths, route, shard_base};
use shardvec::{
    FanoutOptions, QuantizationWidth, Settings, ShardRouter, SimilarityMetric, StoreError,
};

#[test]
fn test_same_text_lands_on_same_shard_across_routers() {
    let a = router(4, 64, 100);
    let b = router(4, 64, 100);

    for text in synthetic(40) {
        let (shard_a, _) = a.add_text(&text, "").unwrap();
        let (shard_b, _) = b.add_text(&text, "").unwrap();
        assert_eq!(shard_a, shard_b);
        assert_eq!(shard_a, route(&text, 4));
    }
    let sizes: Vec<usize> = a.shards().iter().map(|s| s.len()).collect();
    assert_eq!(sizes.iter().sum::<usize>(), 40);
    // 40 texts over 4 shards should not all collapse onto one
    assert!(sizes.iter().filter(|&&n| n > 0).count() >= 2);
}

#[test]
fn test_global_search_dominates_local_search() {
    let router = router(3, 128, 1000);
    for (text, tag) in KOREAN_CORPUS {
        router.add_text(text, tag).unwrap();
    }
    let (texts, metas) = split(&KOREAN_BATCH);
    router.add_texts_batch(&texts, &metas).unwrap();

    let queries = [
        "벡터 간의 유사도를 측정하는 방법은 무엇이 있나요?",
        "라즈베리파이에서 프로그래밍하는 방법",
        "임베딩 모델의 원리는 무엇인가요?",
    ];
    for query in queries {
        let global = router.search(query, 3, SimilarityMetric::Cosine).unwrap();
        assert!(global.len() <= 3);
        assert!(global.windows(2).all(|w| w[0].score >= w[1].score));

        for shard in router.shards() {
            let local = shard.search(query, 3, SimilarityMetric::Cosine).unwrap();
            if let Some(best) = local.first() {
                assert!(global[0].score >= best.score);
            }
        }
    }

    let hits = router
        .search(queries[0], 3, SimilarityMetric::Cosine)
        .unwrap();
    assert!(hits.iter().any(|h| h.metadata == "수학"));
}

#[test]
fn test_small_shards_still_fill_k() {
    let router = router(4, 32, 100);
    let texts = synthetic(6);
    router.add_texts_batch(&texts, &[]).unwrap();

    // Every shard holds fewer than k, the merge still reaches all 6
    let hits = router.search("record", 10, SimilarityMetric::Cosine).unwrap();
    assert_eq!(hits.len(), 6);
}

#[test]
fn test_search_outcome_reports_all_shards() {
    let router = router(3, 32, 100);
    router.add_texts_batch(&synthetic(12), &[]).unwrap();

    let outcome = router
        .search_with(
            "shard record",
            4,
            SimilarityMetric::Cosine,
            FanoutOptions {
                deadline: Some(Duration::from_secs(30)),
                allow_partial: false,
            },
        )
        .unwrap();

    assert!(!outcome.is_partial());
    assert_eq!(outcome.succeeded, vec![0, 1, 2]);
    assert_eq!(outcome.hits.len(), 4);
}

#[test]
fn test_batch_arity_rejected_before_routing() {
    let router = router(2, 32, 100);
    let err = router
        .add_texts_batch(&synthetic(3), &["a".to_string()])
        .unwrap_err();
    assert!(matches!(err, StoreError::ArityMismatch { texts: 3, metadata: 1 }));
    assert!(router.is_empty());
}

#[test]
fn test_save_load_roundtrip() {
    let store = TestStore::new();
    let original = router(3, 64, 1000);
    let texts = synthetic(90);
    original.add_texts_batch(&texts, &[]).unwrap();
    original.quantize(QuantizationWidth::Eight).unwrap();
    original.save(store.base()).unwrap();

    let loaded = ShardRouter::load(store.base(), 3, Arc::clone(original.cache())).unwrap();
    assert_eq!(loaded.shard_count(), 3);
    assert_eq!(loaded.len(), 90);
    for query in texts.iter().step_by(9) {
        assert_eq!(
            original.search(query, 5, SimilarityMetric::Cosine).unwrap(),
            loaded.search(query, 5, SimilarityMetric::Cosine).unwrap()
        );
    }
    for shard in loaded.shards() {
        assert_eq!(shard.quantization(), Some(QuantizationWidth::Eight));
    }
}

#[test]
fn test_load_rejects_fewer_shards_than_saved() {
    let store = TestStore::new();
    let original = router(3, 32, 100);
    original.add_texts_batch(&synthetic(9), &[]).unwrap();
    original.save(store.base()).unwrap();

    let err = ShardRouter::load(store.base(), 2, Arc::clone(original.cache())).unwrap_err();
    assert!(matches!(err, StoreError::ShardLayoutMismatch { .. }), "{err}");
}

#[test]
fn test_load_rejects_more_shards_than_saved() {
    let store = TestStore::new();
    let original = router(2, 32, 100);
    original.save(store.base()).unwrap();

    let err = ShardRouter::load(store.base(), 3, Arc::clone(original.cache())).unwrap_err();
    assert!(matches!(err, StoreError::ShardLayoutMismatch { .. }));
    assert_eq!(err.status_code(), "SHARD_LAYOUT_MISMATCH");
}

#[test]
fn test_load_rejects_missing_shard_file() {
    let store = TestStore::new();
    let original = router(3, 32, 100);
    original.save(store.base()).unwrap();
    fs::remove_file(ShardPaths::for_shard(store.base(), 1).metadata).unwrap();

    assert!(matches!(
        ShardRouter::load(store.base(), 3, Arc::clone(original.cache())),
        Err(StoreError::ShardLayoutMismatch { .. })
    ));
}

#[test]
fn test_load_rejects_shuffled_shard_files() {
    let store = TestStore::new();
    let original = router(2, 32, 100);
    original.add_texts_batch(&synthetic(8), &[]).unwrap();
    original.save(store.base()).unwrap();

    // Swap shard 0 and shard 1 on disk
    let tmp = store.dir.path().join("swap");
    let first = ShardPaths::new(shard_base(store.base(), 0));
    let second = ShardPaths::new(shard_base(store.base(), 1));
    for (a, b) in [(&first.index, &second.index), (&first.metadata, &second.metadata)] {
        fs::rename(a, &tmp).unwrap();
        fs::rename(b, a).unwrap();
        fs::rename(&tmp, b).unwrap();
    }

    assert!(matches!(
        ShardRouter::load(store.base(), 2, Arc::clone(original.cache())),
        Err(StoreError::ShardLayoutMismatch { .. })
    ));
}

#[test]
fn test_open_or_create_from_settings() {
    let store = TestStore::new();
    let mut settings = Settings::default();
    settings.data_path = store.base();
    settings.store.dimension = 48;
    settings.store.shard_count = 2;
    settings.store.max_elements = 50;
    settings.search.allow_partial = true;

    let cache = crate::common::cache(48);
    let created = ShardRouter::open_or_create(&settings, Arc::clone(&cache)).unwrap();
    assert!(created.is_empty());
    assert!(created.options().allow_partial);
    created.add_text("persist me", "note").unwrap();
    created.save(settings.resolved_data_path()).unwrap();

    let reopened = ShardRouter::open_or_create(&settings, cache).unwrap();
    assert_eq!(reopened.len(), 1);
    let hits = reopened
        .search("persist me", 1, SimilarityMetric::Cosine)
        .unwrap();
    assert_eq!(hits[0].display_text(), "persist me [note]");
}

#[test]
fn test_memory_report_totals() {
    let router = router(3, 32, 100);
    router.add_texts_batch(&synthetic(15), &[]).unwrap();

    let report = router.report_memory_usage();
    assert_eq!(report.shards.len(), 3);
    assert_eq!(report.total.entries, 15);
    assert_eq!(
        report.total.total_bytes,
        report.shards.iter().map(|s| s.total_bytes).sum::<usize>()
    );
}
