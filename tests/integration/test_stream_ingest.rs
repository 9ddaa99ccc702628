//! Line-oriented ingestion into a sharded store.

use std::io::Cursor;

use crate::common::{KOREAN_CORPUS, router, shard, synthetic};
use shardvec::{BatchIngestor, SimilarityMetric, StoreError, StreamIngestor, VectorError};

#[test]
fn test_tab_separated_stream_into_router() {
    let input: String = KOREAN_CORPUS
        .iter()
        .map(|(text, tag)| format!("{text}\t{tag}\r\n"))
        .chain(std::iter::once("   \n".to_string()))
        .collect();

    let router = router(3, 128, 100);
    let ingestor = StreamIngestor::new(2)
        .unwrap()
        .with_metadata_delimiter(Some("\t".to_string()));

    let mut progress = Vec::new();
    let stats = ingestor
        .ingest(Cursor::new(input), &router, |s| {
            progress.push(s.records_ingested)
        })
        .unwrap();

    assert_eq!(stats.records_ingested, 5);
    assert_eq!(stats.batches, 3);
    assert_eq!(stats.skipped_blank, 1);
    assert_eq!(progress, vec![2, 4, 5]);
    assert_eq!(router.len(), 5);

    let hits = router
        .search("코사인 유사도", 1, SimilarityMetric::Cosine)
        .unwrap();
    assert_eq!(hits[0].metadata, "수학");
    assert!(!hits[0].text.ends_with('\r'));
}

#[test]
fn test_stream_without_delimiter_keeps_whole_line() {
    let shard = shard(64, 100);
    let ingestor = StreamIngestor::new(10).unwrap();

    ingestor
        .ingest(Cursor::new("alpha\tbeta\ngamma\n"), &shard, |_| {})
        .unwrap();

    let hits = shard
        .search("alpha\tbeta", 1, SimilarityMetric::Cosine)
        .unwrap();
    assert_eq!(hits[0].text, "alpha\tbeta");
    assert_eq!(hits[0].metadata, "");
}

#[test]
fn test_capacity_failure_keeps_committed_batches() {
    let router = router(1, 32, 5);
    let input = synthetic(7).join("\n");
    let ingestor = StreamIngestor::new(2).unwrap();

    let err = ingestor
        .ingest(Cursor::new(input), &router, |_| {})
        .unwrap_err();

    assert!(matches!(
        err,
        StoreError::Vector(VectorError::CapacityExceeded { .. })
    ));
    assert!(err.is_capacity_exceeded());
    assert_eq!(router.len(), 4);
}

#[test]
fn test_batch_ingestor_chunks_records() {
    let router = router(2, 32, 100);
    let texts = synthetic(23);
    let metadata: Vec<String> = (0..23).map(|i| format!("m{i}")).collect();

    let stats = BatchIngestor::new(10)
        .unwrap()
        .ingest(&router, &texts, &metadata)
        .unwrap();

    assert_eq!(stats.records_ingested, 23);
    assert_eq!(stats.batches, 3);
    assert_eq!(router.len(), 23);

    let hits = router
        .search(&texts[21], 1, SimilarityMetric::Cosine)
        .unwrap();
    assert_eq!(hits[0].metadata, "m21");
}
