use std::path::PathBuf;
use std::sync::Arc;

use shardvec::{
    Embedder, EmbeddingCache, ShardConfig, ShardRouter, VectorDimension, VectorShard,
};
use tempfile::TempDir;

/// Five tagged sentences used across the scenario tests.
pub const KOREAN_CORPUS: [(&str, &str); 5] = [
    ("라즈베리파이는 저비용 소형 컴퓨터입니다.", "하드웨어"),
    (
        "벡터 데이터베이스는 임베딩을 저장하고 검색하는데 사용됩니다.",
        "데이터베이스",
    ),
    ("C++은 성능이 중요한 응용 프로그램에 적합합니다.", "프로그래밍"),
    ("임베딩은 텍스트나 이미지를 벡터로 변환하는 과정입니다.", "머신러닝"),
    ("코사인 유사도는 두 벡터 간의 각도를 측정하는 방법입니다.", "수학"),
];

/// Follow-up records for the batch path.
pub const KOREAN_BATCH: [(&str, &str); 5] = [
    (
        "라즈베리파이 5는 이전 모델보다 성능이 크게 향상되었습니다.",
        "하드웨어",
    ),
    (
        "임베디드 시스템은 특정 기능을 수행하는 전용 컴퓨터 시스템입니다.",
        "임베디드",
    ),
    (
        "벡터 검색은 대용량 데이터에서 유사한 항목을 빠르게 찾는 방법입니다.",
        "알고리즘",
    ),
    ("C++17은 많은 유용한 기능을 추가한 C++ 표준입니다.", "프로그래밍"),
    (
        "자연어 처리는 컴퓨터가 인간의 언어를 이해하고 처리하는 기술입니다.",
        "NLP",
    ),
];

pub struct TestStore {
    pub dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn base(&self) -> PathBuf {
        self.dir.path().join("store")
    }
}

pub fn cache(dimension: usize) -> Arc<EmbeddingCache> {
    let dim = VectorDimension::new(dimension).expect("valid dimension");
    Arc::new(EmbeddingCache::new(Embedder::hashing(dim), 256))
}

pub fn shard(dimension: usize, max_elements: usize) -> VectorShard {
    let cache = cache(dimension);
    let config = ShardConfig::new(cache.dimension(), max_elements);
    VectorShard::new(config, cache).expect("shard")
}

pub fn router(shards: usize, dimension: usize, max_elements: usize) -> ShardRouter {
    let cache = cache(dimension);
    let config = ShardConfig::new(cache.dimension(), max_elements);
    ShardRouter::new(shards, config, cache).expect("router")
}

pub fn split(records: &[(&str, &str)]) -> (Vec<String>, Vec<String>) {
    records
        .iter()
        .map(|(text, meta)| (text.to_string(), meta.to_string()))
        .unzip()
}

pub fn synthetic(n: usize) -> Vec<String> {
    const TOPICS: [&str; 6] = ["graph", "vector", "shard", "cache", "quantized", "merge"];
    (0..n)
        .map(|i| {
            format!(
                "{} record {} about {} number {}",
                TOPICS[i % TOPICS.len()],
                i,
                TOPICS[(i * 7 + 3) % TOPICS.len()],
                i * 31 % 97
            )
        })
        .collect()
}
