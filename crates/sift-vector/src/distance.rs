//! Vector math shared by the store, the index and the query engine.
//!
//! Accumulation is done in f64 so scores for identical inputs are stable
//! regardless of how many components the vectors have.

use sift_core::error::ValidationError;

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum()
}

/// Euclidean length.
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt()
}

/// Cosine similarity, clamped to [-1, 1].
///
/// Returns 0.0 if the lengths differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mag_a = l2_norm(a);
    let mag_b = l2_norm(b);
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot(a, b) / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

/// Unit-length copy of `v`, or `None` for a zero vector.
pub fn normalized(v: &[f32]) -> Option<Vec<f32>> {
    let norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(v.iter().map(|x| ((*x as f64) / norm) as f32).collect())
}

/// Check an embedding against the deployment dimension and return its norm.
///
/// Rejects wrong lengths, non-finite components and the all-zero vector.
pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<f64, ValidationError> {
    if embedding.len() != dimension {
        return Err(ValidationError::DimensionMismatch {
            expected: dimension,
            actual: embedding.len(),
        });
    }
    if let Some(index) = embedding.iter().position(|x| !x.is_finite()) {
        return Err(ValidationError::NonFinite { index });
    }
    let norm = l2_norm(embedding);
    if norm == 0.0 {
        return Err(ValidationError::EmptyVector);
    }
    Ok(norm)
}
