//! End-to-end behavior of a single shard with the hashing embedder.

use std::collections::HashSet;
use std::thread;

use crate::common::{KOREAN_BATCH, KOREAN_CORPUS, shard, split, synthetic};
use shardvec::vector::HnswParams;
use shardvec::{
    EntryId, QuantizationWidth, ShardConfig, SimilarityMetric, StoreError, VectorError,
    VectorShard,
};

#[test]
fn test_similarity_query_finds_cosine_sentence() {
    let shard = shard(128, 1000);
    for (text, tag) in KOREAN_CORPUS {
        shard.add_text(text, tag).unwrap();
    }

    let hits = shard
        .search(
            "벡터 간의 유사도를 측정하는 방법은 무엇이 있나요?",
            3,
            SimilarityMetric::Cosine,
        )
        .unwrap();

    assert_eq!(hits.len(), 3);
    assert!(hits.iter().any(|h| h.metadata == "수학"));
    assert!(
        hits.iter()
            .any(|h| h.display_text() == "코사인 유사도는 두 벡터 간의 각도를 측정하는 방법입니다. [수학]")
    );
    for hit in &hits {
        assert!((-1.0..=1.0).contains(&hit.score), "score {}", hit.score);
    }
    assert!(hits.windows(2).all(|w| w[0].score > w[1].score));
}

#[test]
fn test_every_text_retrieves_itself_first() {
    let shard = shard(128, 1000);
    for (text, tag) in KOREAN_CORPUS {
        shard.add_text(text, tag).unwrap();
    }
    let (texts, metas) = split(&KOREAN_BATCH);
    shard.add_texts_batch(&texts, &metas).unwrap();

    for (text, _) in KOREAN_CORPUS.iter().chain(KOREAN_BATCH.iter()) {
        let hits = shard.search(text, 3, SimilarityMetric::Cosine).unwrap();
        assert_eq!(hits[0].text, *text);
        assert!(hits[0].score >= hits[1].score);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }
}

#[test]
fn test_capacity_scenario() {
    let shard = shard(128, 2);
    shard.add_text("first", "").unwrap();
    shard.add_text("second", "").unwrap();

    let err = shard.add_text("third", "").unwrap_err();
    assert!(matches!(
        err,
        StoreError::Vector(VectorError::CapacityExceeded { capacity: 2, .. })
    ));
    assert_eq!(err.status_code(), "CAPACITY_EXCEEDED");
    assert_eq!(shard.len(), 2);
}

#[test]
fn test_batch_and_single_insert_are_equivalent() {
    let texts = synthetic(150);

    let single = shard(64, 1000);
    for text in &texts {
        single.add_text(text, "").unwrap();
    }
    let batched = shard(64, 1000);
    batched.add_texts_batch(&texts, &[]).unwrap();

    let mut found = 0;
    for text in &texts {
        let a = single.search(text, 10, SimilarityMetric::Cosine).unwrap();
        let b = batched.search(text, 10, SimilarityMetric::Cosine).unwrap();
        assert_eq!(a, b);
        if b.iter().any(|hit| hit.text == *text) {
            found += 1;
        }
    }
    assert!(found >= 145, "only {found}/150 texts found themselves");
}

#[test]
fn test_search_batch_preserves_query_order() {
    let shard = shard(64, 1000);
    let texts = synthetic(60);
    shard.add_texts_batch(&texts, &[]).unwrap();

    let queries: Vec<&str> = texts.iter().rev().map(String::as_str).collect();
    let batched = shard
        .search_batch(&queries, 4, SimilarityMetric::Cosine)
        .unwrap();

    assert_eq!(batched.len(), queries.len());
    for (query, hits) in queries.iter().zip(&batched) {
        assert_eq!(
            hits,
            &shard.search(query, 4, SimilarityMetric::Cosine).unwrap()
        );
    }
}

#[test]
fn test_fewer_entries_than_k() {
    let shard = shard(32, 10);
    shard.add_text("only", "").unwrap();
    shard.add_text("two", "").unwrap();

    for metric in SimilarityMetric::ALL {
        assert_eq!(shard.search("only", 5, metric).unwrap().len(), 2);
    }
    assert!(
        shard
            .search("only", 0, SimilarityMetric::Cosine)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_exhaustive_metrics_rank_exact_match_first() {
    let shard = shard(64, 1000);
    let texts = synthetic(80);
    shard.add_texts_batch(&texts, &[]).unwrap();

    for metric in [SimilarityMetric::Euclidean, SimilarityMetric::Manhattan] {
        let hits = shard.search(&texts[17], 5, metric).unwrap();
        assert_eq!(hits[0].text, texts[17]);
        assert!(hits[0].score.abs() < 1e-5);
        assert!(hits.iter().all(|h| h.score <= 0.0));
    }

    // Unit-length embeddings: dot product agrees with cosine on the winner
    let dot = shard
        .search(&texts[42], 1, SimilarityMetric::DotProduct)
        .unwrap();
    assert_eq!(dot[0].text, texts[42]);
}

#[test]
fn test_graph_path_with_tight_ef() {
    let cache = crate::common::cache(64);
    let params = HnswParams {
        ef_search: 8,
        ..HnswParams::with_m(8)
    };
    let config = ShardConfig::new(cache.dimension(), 1000).with_params(params);
    let shard = VectorShard::new(config, cache).unwrap();

    let texts = synthetic(120);
    shard.add_texts_batch(&texts, &[]).unwrap();

    // Always fills k, even through the graph walk
    for text in texts.iter().step_by(10) {
        assert_eq!(
            shard.search(text, 12, SimilarityMetric::Cosine).unwrap().len(),
            12
        );
    }
}

#[test]
fn test_eight_bit_quantization_keeps_most_top1() {
    let shard = shard(128, 1000);
    for (text, tag) in KOREAN_CORPUS.iter().chain(KOREAN_BATCH.iter()) {
        shard.add_text(text, tag).unwrap();
    }
    let synthetic_texts = synthetic(40);
    shard.add_texts_batch(&synthetic_texts, &[]).unwrap();

    let mut queries: Vec<String> = vec![
        "벡터 간의 유사도를 측정하는 방법은 무엇이 있나요?".to_string(),
        "라즈베리파이에서 프로그래밍하는 방법".to_string(),
        "임베딩 모델의 원리는 무엇인가요?".to_string(),
    ];
    queries.extend(synthetic_texts.iter().step_by(4).cloned());

    let before = shard
        .search_batch(&queries, 1, SimilarityMetric::Cosine)
        .unwrap();
    let report = shard.quantize(QuantizationWidth::Eight).unwrap();
    let after = shard
        .search_batch(&queries, 1, SimilarityMetric::Cosine)
        .unwrap();

    assert_eq!(report.entries, 50);
    assert!(report.bytes_after < report.bytes_before);

    let same = before
        .iter()
        .zip(&after)
        .filter(|(b, a)| b[0].id == a[0].id)
        .count();
    assert!(same * 2 > queries.len(), "{same}/{} kept top-1", queries.len());
}

#[test]
fn test_four_bit_quantization_saves_more_than_eight() {
    let texts = synthetic(60);

    let eight = shard(128, 1000);
    eight.add_texts_batch(&texts, &[]).unwrap();
    let eight_report = eight.quantize(QuantizationWidth::Eight).unwrap();

    let four = shard(128, 1000);
    four.add_texts_batch(&texts, &[]).unwrap();
    let four_report = four.quantize(QuantizationWidth::Four).unwrap();

    assert_eq!(eight_report.bytes_before, four_report.bytes_before);
    assert!(four_report.bytes_after < eight_report.bytes_after);
    assert_eq!(
        four.search(&texts[5], 1, SimilarityMetric::Cosine).unwrap()[0].text,
        texts[5]
    );
}

#[test]
fn test_memory_report() {
    let shard = shard(32, 100);
    let (texts, metas) = split(&KOREAN_CORPUS);
    shard.add_texts_batch(&texts, &metas).unwrap();

    let report = shard.report_memory_usage();
    let text_bytes: usize = texts.iter().map(String::len).sum();
    let meta_bytes: usize = metas.iter().map(String::len).sum();

    assert_eq!(report.entries, 5);
    assert_eq!(report.text_bytes, text_bytes);
    assert_eq!(report.metadata_bytes, meta_bytes);
    assert!(report.index_bytes > 5 * 32 * 4);
    assert_eq!(
        report.total_bytes,
        report.index_bytes + text_bytes + meta_bytes
    );

    // Reading the report changes nothing
    assert_eq!(shard.report_memory_usage(), report);
}

#[test]
fn test_concurrent_writers_keep_arrays_aligned() {
    const WRITERS: usize = 6;
    let shard = shard(64, 1000);
    shard.add_texts_batch(&synthetic(20), &[]).unwrap();

    let inserted: Vec<(EntryId, String, String)> = thread::scope(|scope| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let shard = &shard;
                scope.spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..15 {
                        let text = format!("writer{w} single{i}");
                        let meta = format!("w{w}");
                        let id = shard.add_text(&text, &meta).unwrap();
                        mine.push((id, text, meta));
                    }
                    let texts: Vec<String> =
                        (0..10).map(|i| format!("writer{w} batch{i}")).collect();
                    let metas: Vec<String> = (0..10).map(|i| format!("w{w}b{i}")).collect();
                    let ids = shard.add_texts_batch(&texts, &metas).unwrap();
                    mine.extend(
                        ids.into_iter()
                            .zip(texts)
                            .zip(metas)
                            .map(|((id, text), meta)| (id, text, meta)),
                    );
                    mine
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|r| {
                let shard = &shard;
                scope.spawn(move || {
                    for i in 0..40 {
                        let metric = SimilarityMetric::ALL[(r + i) % SimilarityMetric::ALL.len()];
                        let hits = shard.search("writer batch", 5, metric).unwrap();
                        assert_eq!(hits.len(), 5);
                        for hit in &hits {
                            assert_eq!(shard.entry(hit.id).unwrap().text, hit.text);
                        }
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        writers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let total = 20 + WRITERS * 25;
    assert_eq!(inserted.len(), WRITERS * 25);
    assert_eq!(shard.len(), total);
    assert_eq!(shard.live_len(), total);

    let ids: HashSet<EntryId> = inserted.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids.len(), inserted.len());
    for (id, text, meta) in &inserted {
        let entry = shard.entry(*id).unwrap();
        assert_eq!(&entry.text, text);
        assert_eq!(&entry.metadata, meta);
    }

    for (id, text, _) in inserted.iter().step_by(7) {
        let hits = shard.search(text, 1, SimilarityMetric::Euclidean).unwrap();
        assert_eq!(hits[0].id, *id);
    }
}
