//! Distance and similarity kernels.
//!
//! The `_iter` variants take component iterators so they work over both raw
//! `f32` slices and quantized codes without materializing a decoded copy.

use crate::vector::types::SimilarityMetric;

/// Dot product of two component streams.
pub fn dot_iter(a: impl IntoIterator<Item = f32>, b: impl IntoIterator<Item = f32>) -> f32 {
    a.into_iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Squared euclidean distance of two component streams.
pub fn squared_euclidean_iter(
    a: impl IntoIterator<Item = f32>,
    b: impl IntoIterator<Item = f32>,
) -> f32 {
    a.into_iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// L1 distance of two component streams.
pub fn manhattan_iter(a: impl IntoIterator<Item = f32>, b: impl IntoIterator<Item = f32>) -> f32 {
    a.into_iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

/// L2 norm of a component stream.
pub fn norm_iter(a: impl IntoIterator<Item = f32>) -> f32 {
    a.into_iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    dot_iter(a.iter().copied(), b.iter().copied())
}

pub fn norm(a: &[f32]) -> f32 {
    norm_iter(a.iter().copied())
}

/// Computes cosine similarity between two vectors.
///
/// # Returns
/// * Cosine similarity in range [-1, 1], where 1 is most similar. A zero
///   vector on either side yields 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_from_parts(dot(a, b), norm(a), norm(b))
}

/// Cosine similarity from a precomputed dot product and norms.
pub fn cosine_from_parts(dot_product: f32, norm_a: f32, norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    squared_euclidean_iter(a.iter().copied(), b.iter().copied()).sqrt()
}

pub fn manhattan_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    manhattan_iter(a.iter().copied(), b.iter().copied())
}

/// Scales `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

/// Converts an index distance into a "higher is more similar" score.
///
/// Cosine distances are `1 - cos`, so the score is the cosine similarity.
/// Every other metric stores a value where smaller is better (negated dot
/// product, euclidean or manhattan distance), so the score is its negation.
pub fn distance_to_score(metric: SimilarityMetric, distance: f32) -> f32 {
    match metric {
        SimilarityMetric::Cosine => 1.0 - distance,
        SimilarityMetric::DotProduct | SimilarityMetric::Euclidean | SimilarityMetric::Manhattan => {
            -distance
        }
    }
}
