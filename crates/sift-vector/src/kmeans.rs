//! Spherical k-means over unit vectors.
//!
//! Centroids are seeded deterministically with farthest-point selection and
//! refined with Lloyd iterations. Similarity is the dot product, so every
//! centroid is renormalised after each update. The assignment step runs on
//! the rayon pool; results are identical to a sequential run.

use rayon::prelude::*;

use crate::distance::{dot, normalized};

/// Points whose best centroid similarity is at least this are treated as
/// already covered during seeding.
const COVERED: f64 = 1.0 - 1e-6;

/// Partition count for a corpus of `n` documents: about sqrt(n), clamped to
/// `[min, max]` and never more than `n`.
pub fn partition_count(n: usize, min: usize, max: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let k = (n as f64).sqrt().round() as usize;
    k.clamp(min.max(1), max.max(1)).min(n)
}

/// Result of a k-means run.
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    pub centroids: Vec<Vec<f32>>,
    /// Partition of each input point, in input order.
    pub assignments: Vec<usize>,
}

/// Index and similarity of the centroid nearest to `point`.
///
/// Ties go to the lowest index. Returns `None` when there are no centroids.
pub fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, c) in centroids.iter().enumerate() {
        let sim = dot(point, c);
        match best {
            Some((_, b)) if sim <= b => {}
            _ => best = Some((i, sim)),
        }
    }
    best
}

/// Cluster unit-length `points` into at most `k` partitions.
///
/// Fewer partitions come back when the points have fewer than `k` distinct
/// directions. Input order determines the result, so callers that need
/// reproducible builds must pass points in a stable order.
pub fn train(points: &[Vec<f32>], k: usize, iterations: usize) -> Clustering {
    if points.is_empty() || k == 0 {
        return Clustering {
            centroids: Vec::new(),
            assignments: Vec::new(),
        };
    }

    let mut centroids = seed(points, k);
    let mut assignments = assign(points, &centroids);

    for _ in 0..iterations {
        update(points, &assignments, &mut centroids);
        let next = assign(points, &centroids);
        if next == assignments {
            break;
        }
        assignments = next;
    }

    Clustering {
        centroids,
        assignments,
    }
}

/// Farthest-point seeding starting from the first point.
fn seed(points: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
    let mut centroids = vec![points[0].clone()];
    let mut best: Vec<f64> = points.par_iter().map(|p| dot(p, &points[0])).collect();

    while centroids.len() < k {
        let mut pick: Option<(usize, f64)> = None;
        for (i, sim) in best.iter().enumerate() {
            match pick {
                Some((_, s)) if *sim >= s => {}
                _ => pick = Some((i, *sim)),
            }
        }
        let Some((index, sim)) = pick else { break };
        if sim >= COVERED {
            break;
        }

        let centroid = points[index].clone();
        best.par_iter_mut()
            .zip(points.par_iter())
            .for_each(|(b, p)| *b = b.max(dot(p, &centroid)));
        centroids.push(centroid);
    }
    centroids
}

fn assign(points: &[Vec<f32>], centroids: &[Vec<f32>]) -> Vec<usize> {
    points
        .par_iter()
        .map(|p| nearest(p, centroids).map_or(0, |(i, _)| i))
        .collect()
}

/// Move each centroid to the normalised mean of its members. Empty
/// partitions keep their previous centroid.
fn update(points: &[Vec<f32>], assignments: &[usize], centroids: &mut [Vec<f32>]) {
    let dim = centroids.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0f64; dim]; centroids.len()];
    for (point, &cluster) in points.iter().zip(assignments) {
        for (s, x) in sums[cluster].iter_mut().zip(point) {
            *s += *x as f64;
        }
    }
    for (centroid, sum) in centroids.iter_mut().zip(sums) {
        let mean: Vec<f32> = sum.into_iter().map(|x| x as f32).collect();
        if let Some(unit) = normalized(&mean) {
            *centroid = unit;
        }
    }
}
