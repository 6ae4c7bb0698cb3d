//! Split strategies: the one point where BKT and KDT differ.
//!
//! Both variants share the node, routing, build, and rebalance machinery;
//! a [`SplitStrategy`] is injected wherever a set of ids must be
//! partitioned into children.

use crate::config::{IndexConfig, TreeKind};
use crate::distance::DistanceMetric;
use crate::store::VectorId;
use crate::tree::{kmeans, Splitter, VectorSource};

/// A proposed partition of a set of ids into children.
pub(crate) struct SplitOutcome {
    pub splitter: Splitter,
    /// Child membership, parallel to the splitter's children. Every input
    /// id lands in exactly one part; no part is empty.
    pub parts: Vec<Vec<VectorId>>,
}

/// Partitions ids into subtrees. Implementations must be deterministic for
/// a fixed `seed` and must assign ids consistently with
/// [`Splitter::assign`] so insert routing and build agree.
pub(crate) trait SplitStrategy: Send + Sync {
    /// Split `ids` (at least 2) into children, or `None` when no partition
    /// makes progress (e.g. all points coincide) and the caller should keep
    /// a leaf.
    fn split<'a>(
        &self,
        src: &'a (dyn VectorSource + 'a),
        ids: &[VectorId],
        metric: DistanceMetric,
        seed: u64,
    ) -> Option<SplitOutcome>;
}

/// Balanced k-means tree splits: cluster around `branch` centroids.
pub(crate) struct BktSplit {
    pub branch: usize,
}

impl SplitStrategy for BktSplit {
    fn split<'a>(
        &self,
        src: &'a (dyn VectorSource + 'a),
        ids: &[VectorId],
        metric: DistanceMetric,
        seed: u64,
    ) -> Option<SplitOutcome> {
        let clustering = kmeans::cluster(src, ids, self.branch, metric, seed);

        let k = clustering.centroids.len();
        let mut parts: Vec<Vec<VectorId>> = vec![Vec::new(); k];
        for (&id, &cluster) in ids.iter().zip(clustering.assignments.iter()) {
            parts[cluster].push(id);
        }

        // Drop empty clusters; keep centroids aligned with parts.
        let mut centroids = Vec::with_capacity(k);
        let mut kept_parts = Vec::with_capacity(k);
        for (centroid, part) in clustering.centroids.into_iter().zip(parts.into_iter()) {
            if !part.is_empty() {
                centroids.push(centroid);
                kept_parts.push(part);
            }
        }

        // A single surviving cluster means the split made no progress.
        if kept_parts.len() < 2 {
            return None;
        }

        let radii = centroids
            .iter()
            .zip(kept_parts.iter())
            .map(|(centroid, part)| {
                part.iter()
                    .map(|&id| metric.distance(src.vector(id), centroid))
                    .fold(0.0f32, f32::max)
            })
            .collect();

        Some(SplitOutcome {
            splitter: Splitter::Centroids { centroids, radii },
            parts: kept_parts,
        })
    }
}

/// k-d tree splits: highest-variance coordinate, two-way at the median.
pub(crate) struct KdtSplit;

impl SplitStrategy for KdtSplit {
    fn split<'a>(
        &self,
        src: &'a (dyn VectorSource + 'a),
        ids: &[VectorId],
        _metric: DistanceMetric,
        _seed: u64,
    ) -> Option<SplitOutcome> {
        let dim = src.dimension();

        // Pick the coordinate with the highest variance across the ids.
        let mut best_dim = 0;
        let mut best_var = 0.0f64;
        for d in 0..dim {
            let mut sum = 0.0f64;
            let mut sum_sq = 0.0f64;
            for &id in ids {
                let x = f64::from(src.vector(id)[d]);
                sum += x;
                sum_sq += x * x;
            }
            let n = ids.len() as f64;
            let mean = sum / n;
            let var = (sum_sq / n - mean * mean).max(0.0);
            if var > best_var {
                best_var = var;
                best_dim = d;
            }
        }

        if best_var == 0.0 {
            // All points coincide on every coordinate.
            return None;
        }

        let mut values: Vec<f32> = ids.iter().map(|&id| src.vector(id)[best_dim]).collect();
        values.sort_by(f32::total_cmp);
        let median = values[values.len() / 2];
        let mean = (values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64) as f32;

        // Median first; fall back to the mean when duplicates push
        // everything onto one side of the median.
        for threshold in [median, mean] {
            let split = self.partition(src, ids, best_dim, threshold);
            if let Some(outcome) = split {
                return Some(outcome);
            }
        }
        None
    }
}

impl KdtSplit {
    fn partition<'a>(
        &self,
        src: &'a (dyn VectorSource + 'a),
        ids: &[VectorId],
        dim: usize,
        threshold: f32,
    ) -> Option<SplitOutcome> {
        let mut below = Vec::new();
        let mut above = Vec::new();
        for &id in ids {
            if src.vector(id)[dim] < threshold {
                below.push(id);
            } else {
                above.push(id);
            }
        }
        if below.is_empty() || above.is_empty() {
            return None;
        }
        Some(SplitOutcome {
            splitter: Splitter::Coordinate {
                dim: dim as u32,
                threshold,
            },
            parts: vec![below, above],
        })
    }
}

/// The strategy an index of this configuration splits with.
pub(crate) fn strategy_for(config: &IndexConfig) -> Box<dyn SplitStrategy> {
    match config.kind {
        TreeKind::Bkt => Box::new(BktSplit {
            branch: config.branching_factor,
        }),
        TreeKind::Kdt => Box::new(KdtSplit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;

    fn store_from(vectors: &[Vec<f32>]) -> VectorStore {
        let mut store = VectorStore::new(vectors[0].len());
        for v in vectors {
            store.append(v).unwrap();
        }
        store
    }

    #[test]
    fn bkt_split_partitions_every_id_once() {
        let vectors: Vec<Vec<f32>> = (0..20)
            .map(|i| vec![(i % 4) as f32 * 10.0, (i / 4) as f32])
            .collect();
        let store = store_from(&vectors);
        let ids: Vec<VectorId> = (0..20).collect();

        let outcome = BktSplit { branch: 4 }
            .split(&store, &ids, DistanceMetric::L2, 11)
            .expect("split should make progress");

        let mut seen: Vec<VectorId> = outcome.parts.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, ids);
        assert!(outcome.parts.iter().all(|p| !p.is_empty()));
        assert_eq!(outcome.splitter.child_count(), outcome.parts.len());
    }

    #[test]
    fn bkt_split_assignment_agrees_with_routing() {
        let vectors: Vec<Vec<f32>> = (0..16).map(|i| vec![i as f32, (i * i) as f32]).collect();
        let store = store_from(&vectors);
        let ids: Vec<VectorId> = (0..16).collect();

        let outcome = BktSplit { branch: 3 }
            .split(&store, &ids, DistanceMetric::L2, 5)
            .unwrap();

        for (part_idx, part) in outcome.parts.iter().enumerate() {
            for &id in part {
                assert_eq!(
                    outcome.splitter.assign(store.get(id).unwrap(), DistanceMetric::L2),
                    part_idx,
                    "id {id} routed away from its split part"
                );
            }
        }
    }

    #[test]
    fn identical_points_refuse_to_split() {
        let store = store_from(&vec![vec![3.0, 3.0]; 8]);
        let ids: Vec<VectorId> = (0..8).collect();
        assert!(BktSplit { branch: 2 }
            .split(&store, &ids, DistanceMetric::L2, 1)
            .is_none());
        assert!(KdtSplit.split(&store, &ids, DistanceMetric::L2, 1).is_none());
    }

    #[test]
    fn kdt_split_uses_highest_variance_coordinate() {
        // Coordinate 1 has far higher spread than coordinate 0.
        let vectors: Vec<Vec<f32>> = (0..10).map(|i| vec![0.01 * i as f32, i as f32 * 5.0]).collect();
        let store = store_from(&vectors);
        let ids: Vec<VectorId> = (0..10).collect();

        let outcome = KdtSplit.split(&store, &ids, DistanceMetric::L2, 0).unwrap();
        match outcome.splitter {
            Splitter::Coordinate { dim, .. } => assert_eq!(dim, 1),
            _ => panic!("expected coordinate splitter"),
        }
        assert_eq!(outcome.parts.len(), 2);
        assert!(!outcome.parts[0].is_empty() && !outcome.parts[1].is_empty());
    }

    #[test]
    fn kdt_falls_back_to_mean_on_skewed_duplicates() {
        // Median is the minimum, so the median threshold makes no progress.
        let store = store_from(&[
            vec![1.0],
            vec![1.0],
            vec![1.0],
            vec![1.0],
            vec![10.0],
        ]);
        let ids: Vec<VectorId> = (0..5).collect();
        let outcome = KdtSplit.split(&store, &ids, DistanceMetric::L2, 0).unwrap();
        assert_eq!(outcome.parts[0].len(), 4);
        assert_eq!(outcome.parts[1].len(), 1);
    }
}
