//! Distance metrics for dense vectors.
//!
//! The metric is fixed per index instance at creation time; every comparison
//! inside that index (splitting, routing, leaf scans) uses the same metric so
//! the tree's geometry stays consistent with its queries.
//!
//! ## Pruning caveat
//!
//! Branch-and-bound pruning relies on a lower bound for the distance from a
//! query to anything inside a subtree. Such a bound exists for [`L2`] (the
//! triangle inequality) but not for [`Cosine`] or [`InnerProduct`], which are
//! not metrics. For those, [`DistanceMetric::supports_bounds`] is false and
//! the query engine falls back to best-first ordering without pruning; the
//! exploration budget is then the only thing limiting work.
//!
//! [`L2`]: DistanceMetric::L2
//! [`Cosine`]: DistanceMetric::Cosine
//! [`InnerProduct`]: DistanceMetric::InnerProduct

use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::simd;

/// Distance metric for dense vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Euclidean (L2) distance.
    L2,
    /// Cosine distance $1 - \cos(a,b)$. Computes norms; inputs need not be
    /// pre-normalized.
    Cosine,
    /// Inner product distance $-\langle a,b\rangle$ (maximum inner product
    /// search).
    InnerProduct,
}

impl DistanceMetric {
    /// Compute the distance between two equal-length vectors.
    ///
    /// Callers validate dimensions at the API boundary; if lengths mismatch
    /// anyway this returns `f32::INFINITY` so the pair is never selected as
    /// a nearest neighbor.
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self {
            DistanceMetric::L2 => simd::l2_distance(a, b),
            DistanceMetric::Cosine => 1.0 - simd::cosine(a, b).clamp(-1.0, 1.0),
            DistanceMetric::InnerProduct => -simd::dot(a, b),
        }
    }

    /// Whether subtree lower bounds derived from this metric are valid for
    /// pruning (true only for proper metrics).
    #[inline]
    #[must_use]
    pub fn supports_bounds(self) -> bool {
        matches!(self, DistanceMetric::L2)
    }

    /// Lower bound on the distance from `query_to_center` to any point
    /// within `radius` of the center.
    ///
    /// Only meaningful when [`supports_bounds`](Self::supports_bounds) holds;
    /// otherwise returns 0.0 (no pruning).
    #[inline]
    #[must_use]
    pub fn ball_lower_bound(self, query_to_center: f32, radius: f32) -> f32 {
        if self.supports_bounds() {
            (query_to_center - radius).max(0.0)
        } else {
            0.0
        }
    }

    /// Lower bound on the distance across an axis-aligned split plane.
    ///
    /// `axis_gap` is `|query[dim] - threshold|`. Valid for L2 only.
    #[inline]
    #[must_use]
    pub fn plane_lower_bound(self, axis_gap: f32) -> f32 {
        if self.supports_bounds() {
            axis_gap
        } else {
            0.0
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L2" => Ok(DistanceMetric::L2),
            "Cosine" => Ok(DistanceMetric::Cosine),
            "InnerProduct" => Ok(DistanceMetric::InnerProduct),
            other => Err(IndexError::InvalidArgument(format!(
                "unknown distance metric {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DistanceMetric::L2 => "L2",
            DistanceMetric::Cosine => "Cosine",
            DistanceMetric::InnerProduct => "InnerProduct",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_distance_of_identical_is_zero() {
        let a = [1.0_f32, 2.0, 3.0];
        assert!(DistanceMetric::L2.distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_of_identical_is_zero() {
        let a = [1.0_f32, 2.0, 3.0];
        assert!(DistanceMetric::Cosine.distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_are_infinitely_far() {
        let a = [1.0_f32, 2.0];
        let b = [1.0_f32, 2.0, 3.0];
        assert_eq!(DistanceMetric::L2.distance(&a, &b), f32::INFINITY);
    }

    #[test]
    fn ball_bound_clamps_at_zero() {
        let m = DistanceMetric::L2;
        assert_eq!(m.ball_lower_bound(1.0, 3.0), 0.0);
        assert!((m.ball_lower_bound(5.0, 3.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn non_metric_bounds_never_prune() {
        assert_eq!(DistanceMetric::Cosine.ball_lower_bound(10.0, 1.0), 0.0);
        assert_eq!(DistanceMetric::InnerProduct.plane_lower_bound(10.0), 0.0);
    }

    #[test]
    fn metric_names_round_trip() {
        for m in [
            DistanceMetric::L2,
            DistanceMetric::Cosine,
            DistanceMetric::InnerProduct,
        ] {
            let parsed: DistanceMetric = m.to_string().parse().unwrap();
            assert_eq!(parsed, m);
        }
        assert!("Hamming".parse::<DistanceMetric>().is_err());
    }
}
