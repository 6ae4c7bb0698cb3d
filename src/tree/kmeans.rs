//! Seeded k-means clustering for BKT splits.
//!
//! k-means++ initialization followed by Lloyd iterations. Every stochastic
//! choice flows from the caller-supplied seed, so the same ids over the same
//! vectors always cluster identically — the property BKT builds rely on for
//! reproducibility.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::DistanceMetric;
use crate::store::VectorId;
use crate::tree::VectorSource;

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_EPSILON: f32 = 1e-6;

/// Outcome of clustering a set of ids into `k` groups.
pub(crate) struct Clustering {
    /// Cluster centroids (k x dimension). Never empty.
    pub centroids: Vec<Vec<f32>>,
    /// For each input id (by position), its cluster index.
    pub assignments: Vec<usize>,
}

/// Cluster `ids` into at most `k` groups.
///
/// `k` is clamped to the number of ids; the result always has at least one
/// centroid. Distances use the index metric so the clustering geometry
/// matches query routing.
pub(crate) fn cluster<S: VectorSource + ?Sized>(
    src: &S,
    ids: &[VectorId],
    k: usize,
    metric: DistanceMetric,
    seed: u64,
) -> Clustering {
    debug_assert!(!ids.is_empty());
    let k = k.clamp(1, ids.len());

    let mut centroids = plus_plus_init(src, ids, k, metric, seed);
    let mut assignments = assign(src, ids, &centroids, metric);

    for _ in 0..MAX_ITERATIONS {
        let new_centroids = recompute_centroids(src, ids, &assignments, &centroids);

        let converged = centroids
            .iter()
            .zip(new_centroids.iter())
            .all(|(old, new)| metric.distance(old, new) <= CONVERGENCE_EPSILON);

        centroids = new_centroids;
        assignments = assign(src, ids, &centroids, metric);
        if converged {
            break;
        }
    }

    Clustering {
        centroids,
        assignments,
    }
}

/// k-means++ seeding: first centroid uniform, the rest sampled proportional
/// to distance from the nearest chosen centroid.
fn plus_plus_init<S: VectorSource + ?Sized>(
    src: &S,
    ids: &[VectorId],
    k: usize,
    metric: DistanceMetric,
    seed: u64,
) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

    let first = rng.random_range(0..ids.len());
    centroids.push(src.vector(ids[first]).to_vec());

    while centroids.len() < k {
        let mut weights = Vec::with_capacity(ids.len());
        let mut total = 0.0f64;
        for &id in ids {
            let v = src.vector(id);
            let min_dist = centroids
                .iter()
                .map(|c| metric.distance(v, c))
                .fold(f32::INFINITY, f32::min);
            // Shift so non-metric distances (inner product can go negative)
            // still yield usable weights.
            let w = f64::from(min_dist.max(0.0));
            weights.push(w);
            total += w;
        }

        if total <= 0.0 {
            // All remaining points coincide with a centroid; any choice is
            // as good as any other.
            let idx = rng.random_range(0..ids.len());
            centroids.push(src.vector(ids[idx]).to_vec());
            continue;
        }

        let threshold = rng.random::<f64>() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = ids.len() - 1;
        for (i, &w) in weights.iter().enumerate() {
            cumulative += w;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids.push(src.vector(ids[chosen]).to_vec());
    }

    centroids
}

fn assign<S: VectorSource + ?Sized>(
    src: &S,
    ids: &[VectorId],
    centroids: &[Vec<f32>],
    metric: DistanceMetric,
) -> Vec<usize> {
    ids.iter()
        .map(|&id| {
            let v = src.vector(id);
            let mut best = 0;
            let mut best_dist = f32::INFINITY;
            for (i, c) in centroids.iter().enumerate() {
                let d = metric.distance(v, c);
                if d < best_dist {
                    best_dist = d;
                    best = i;
                }
            }
            best
        })
        .collect()
}

fn recompute_centroids<S: VectorSource + ?Sized>(
    src: &S,
    ids: &[VectorId],
    assignments: &[usize],
    old: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let dim = src.dimension();
    let k = old.len();
    let mut sums = vec![vec![0.0f32; dim]; k];
    let mut counts = vec![0usize; k];

    for (&id, &cluster) in ids.iter().zip(assignments.iter()) {
        counts[cluster] += 1;
        for (acc, &x) in sums[cluster].iter_mut().zip(src.vector(id).iter()) {
            *acc += x;
        }
    }

    sums.into_iter()
        .zip(counts.iter())
        .enumerate()
        .map(|(i, (sum, &count))| {
            if count > 0 {
                sum.iter().map(|&s| s / count as f32).collect()
            } else {
                // Empty cluster: keep the previous centroid rather than
                // collapsing it to the origin.
                old[i].clone()
            }
        })
        .collect()
}
