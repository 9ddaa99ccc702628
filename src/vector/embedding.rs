//! Text embedding backends.
//!
//! The backend is picked once at construction and dispatched through the
//! [`Embedder`] enum, so batch paths never go through a trait object.
//!
//! - [`HashingEmbedder`]: deterministic feature hashing. Works offline for
//!   any dimension and is what the tests use.
//! - [`FastEmbedGenerator`]: a fastembed ONNX model (all-MiniLM-L6-v2 by
//!   default, 384 dimensions).

use std::path::PathBuf;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::vector::distance::normalize;
use crate::vector::types::{VectorDimension, VectorError, fnv1a_hash};

/// Weight of a whole-word feature.
const WORD_WEIGHT: f32 = 1.0;

/// Weight of a character-bigram feature.
const BIGRAM_WEIGHT: f32 = 0.5;

/// Embedding backend selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    #[default]
    Hashing,
    #[serde(alias = "fast_embed")]
    Fastembed,
}

/// Text → vector producer with a fixed output dimension.
pub enum Embedder {
    Hashing(HashingEmbedder),
    FastEmbed(FastEmbedGenerator),
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("backend", &self.backend_name())
            .field("dimension", &self.dimension().get())
            .finish()
    }
}

impl Embedder {
    /// Deterministic hashing embedder of the given dimension.
    #[must_use]
    pub fn hashing(dimension: VectorDimension) -> Self {
        Self::Hashing(HashingEmbedder::new(dimension))
    }

    /// Builds the configured backend and checks it produces `dimension`.
    pub fn from_backend(
        backend: EmbeddingBackend,
        model: &str,
        cache_dir: Option<PathBuf>,
        dimension: VectorDimension,
    ) -> Result<Self, VectorError> {
        match backend {
            EmbeddingBackend::Hashing => Ok(Self::hashing(dimension)),
            EmbeddingBackend::Fastembed => {
                let generator = FastEmbedGenerator::new(model, cache_dir, false)?;
                if generator.dimension() != dimension {
                    return Err(VectorError::DimensionMismatch {
                        expected: dimension.get(),
                        actual: generator.dimension().get(),
                    });
                }
                Ok(Self::FastEmbed(generator))
            }
        }
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        match self {
            Self::Hashing(e) => e.dimension(),
            Self::FastEmbed(e) => e.dimension(),
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Hashing(_) => "hashing",
            Self::FastEmbed(_) => "fastembed",
        }
    }

    /// Embeds one text.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let vector = match self {
            Self::Hashing(e) => e.embed(text),
            Self::FastEmbed(e) => e
                .generate_embeddings(&[text])?
                .pop()
                .ok_or_else(|| VectorError::EmbeddingFailed("model returned no embedding".into()))?,
        };
        self.dimension().validate_vector(&vector)?;
        Ok(vector)
    }

    /// Embeds many texts, preserving input order.
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        let vectors = match self {
            Self::Hashing(e) => texts.iter().map(|t| e.embed(t)).collect(),
            Self::FastEmbed(e) => e.generate_embeddings(texts)?,
        };
        if vectors.len() != texts.len() {
            return Err(VectorError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        for vector in &vectors {
            self.dimension().validate_vector(vector)?;
        }
        Ok(vectors)
    }
}

/// Feature-hashing embedder.
///
/// Text is lowercased and split on anything that is not alphanumeric. Each
/// word contributes a whole-word feature and one feature per character
/// bigram; every feature is FNV-1a hashed into a signed bucket. The result
/// is L2-normalized, so texts with no features map to the zero vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingEmbedder {
    dimension: VectorDimension,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dimension: VectorDimension) -> Self {
        Self { dimension }
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension.get()];
        let lowered = text.to_lowercase();

        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut vector, b'w', word, WORD_WEIGHT);

            let chars: Vec<char> = word.chars().collect();
            let mut buf = String::with_capacity(8);
            for pair in chars.windows(2) {
                buf.clear();
                buf.push(pair[0]);
                buf.push(pair[1]);
                self.add_feature(&mut vector, b'b', &buf, BIGRAM_WEIGHT);
            }
        }

        normalize(&mut vector);
        vector
    }

    fn add_feature(&self, vector: &mut [f32], kind: u8, feature: &str, weight: f32) {
        let mut bytes = Vec::with_capacity(feature.len() + 1);
        bytes.push(kind);
        bytes.extend_from_slice(feature.as_bytes());

        let hash = fnv1a_hash(&bytes);
        let bucket = (hash % vector.len() as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

/// fastembed-backed generator.
///
/// The ONNX session is not shareable across threads, so calls are
/// serialized through a mutex.
pub struct FastEmbedGenerator {
    model: Mutex<TextEmbedding>,
    dimension: VectorDimension,
}

impl FastEmbedGenerator {
    /// Loads `model_name`, downloading it into `cache_dir` on first use.
    ///
    /// # Errors
    /// Returns an error if the model name is unknown or the model fails to
    /// initialize or download.
    pub fn new(
        model_name: &str,
        cache_dir: Option<PathBuf>,
        show_download_progress: bool,
    ) -> Result<Self, VectorError> {
        let (model, dim) = parse_model(model_name)?;
        let cache_dir = cache_dir.unwrap_or_else(default_models_dir);

        let model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(show_download_progress),
        )
        .map_err(|e| {
            VectorError::EmbeddingFailed(format!(
                "Failed to initialize embedding model: {e}. Ensure you have internet connection for first-time model download"
            ))
        })?;

        Ok(Self {
            model: Mutex::new(model),
            dimension: VectorDimension::new(dim)?,
        })
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// Generate embeddings for multiple texts.
    pub fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let text_strings: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();
        self.model
            .lock()
            .embed(text_strings, None)
            .map_err(|e| VectorError::EmbeddingFailed(format!("Failed to generate embeddings: {e}")))
    }
}

/// Maps a configured model name to the fastembed model and its dimension.
fn parse_model(name: &str) -> Result<(EmbeddingModel, usize), VectorError> {
    let normalized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    match normalized.as_str() {
        "allminilml6v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "allminilml12v2" => Ok((EmbeddingModel::AllMiniLML12V2, 384)),
        "bgesmallenv15" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bgebaseenv15" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "multilinguale5small" => Ok((EmbeddingModel::MultilingualE5Small, 384)),
        _ => Err(VectorError::EmbeddingFailed(format!(
            "unknown embedding model '{name}'. Supported: AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15, MultilingualE5Small"
        ))),
    }
}

/// Default directory for downloaded models.
#[must_use]
pub fn default_models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shardvec")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::distance::{cosine_similarity, norm};

    fn embedder(d: usize) -> Embedder {
        Embedder::hashing(VectorDimension::new(d).unwrap())
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let e = embedder(64);
        let a = e.embed("Vector databases store embeddings").unwrap();
        let b = e.embed("Vector databases store embeddings").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let e = embedder(128);
        let a = e.embed("Hello, World!").unwrap();
        let b = e.embed("hello world").unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_related_texts_score_higher() {
        let e = embedder(256);
        let query = e.embed("how to measure vector similarity").unwrap();
        let related = e.embed("cosine similarity measures the angle between vectors").unwrap();
        let unrelated = e.embed("the raspberry pi is a small cheap computer").unwrap();
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let e = embedder(16);
        let v = e.embed("  ...  ").unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_batch_matches_single() {
        let e = embedder(32);
        let texts = ["alpha beta", "gamma", "델타 엡실론"];
        let batch = e.embed_batch(&texts).unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vector) in texts.iter().zip(&batch) {
            assert_eq!(&e.embed(text).unwrap(), vector);
        }
    }

    #[test]
    fn test_model_names() {
        assert!(parse_model("AllMiniLML6V2").is_ok());
        assert!(parse_model("all-MiniLM-L6-v2").is_ok());
        assert_eq!(parse_model("BGEBaseENV15").unwrap().1, 768);
        assert!(matches!(
            parse_model("gpt-embeddings"),
            Err(VectorError::EmbeddingFailed(_))
        ));
    }

    #[test]
    fn test_backend_serde() {
        let parsed: EmbeddingBackend = serde_json::from_str("\"fastembed\"").unwrap();
        assert_eq!(parsed, EmbeddingBackend::Fastembed);
        let hashing = Embedder::from_backend(
            EmbeddingBackend::Hashing,
            "AllMiniLML6V2",
            None,
            VectorDimension::new(8).unwrap(),
        )
        .unwrap();
        assert_eq!(hashing.backend_name(), "hashing");
        assert_eq!(hashing.dimension().get(), 8);
    }
}
