//! Index configuration and boundary parameter parsing.
//!
//! The external wrapper drives this library through string-encoded
//! name/value pairs. Those are parsed here, once, into a strongly-typed
//! [`IndexConfig`]; the rest of the crate never re-parses strings.

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};

/// Tree variant selecting the split strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeKind {
    /// Balanced k-means tree: centroid-based multi-way splits.
    Bkt,
    /// k-d tree: highest-variance coordinate, two-way splits.
    Kdt,
}

impl std::str::FromStr for TreeKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BKT" => Ok(TreeKind::Bkt),
            "KDT" => Ok(TreeKind::Kdt),
            other => Err(IndexError::InvalidArgument(format!(
                "unknown algorithm {other:?} (expected \"BKT\" or \"KDT\")"
            ))),
        }
    }
}

impl std::fmt::Display for TreeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TreeKind::Bkt => "BKT",
            TreeKind::Kdt => "KDT",
        })
    }
}

/// Component value type of stored vectors.
///
/// Only 32-bit floats are supported today; the variant exists because the
/// boundary selects the type by name and must reject the rest explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Float,
}

impl std::str::FromStr for ValueType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Float" => Ok(ValueType::Float),
            other => Err(IndexError::InvalidArgument(format!(
                "unsupported value type {other:?} (expected \"Float\")"
            ))),
        }
    }
}

/// Strongly-typed index configuration.
///
/// Build-shaping fields (`branching_factor`, `max_leaf_size`, `max_depth`,
/// `seed`, `build_threads`) take effect on the next build or rebalance;
/// query-shaping fields (`search_budget`) take effect immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Tree variant.
    pub kind: TreeKind,
    /// Component value type.
    pub value_type: ValueType,
    /// Distance metric, fixed for the index lifetime.
    pub metric: DistanceMetric,
    /// Vector dimension, fixed for the index lifetime.
    pub dimension: usize,
    /// Children per BKT internal node (ignored by KDT, which is binary).
    pub branching_factor: usize,
    /// Build-time leaf capacity; recursion stops at or below this size.
    pub max_leaf_size: usize,
    /// Depth bound protecting against degenerate splits.
    pub max_depth: usize,
    /// Maximum distance computations per query; 0 disables the budget and
    /// makes traversal exact.
    pub search_budget: usize,
    /// An inserted leaf splits once it exceeds
    /// `max_leaf_size * rebalance_slack`; rebalance re-partitions subtrees
    /// whose leaves exceed plain `max_leaf_size`.
    pub rebalance_slack: f32,
    /// Worker threads for bulk build; 0 means rayon's default.
    pub build_threads: usize,
    /// Seed for all stochastic split decisions. Builds with the same seed on
    /// the same input produce identical trees.
    pub seed: u64,
}

impl IndexConfig {
    /// Configuration for a new index of the given variant and dimension.
    pub fn new(kind: TreeKind, value_type: ValueType, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(IndexError::InvalidArgument(
                "dimension must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            kind,
            value_type,
            metric: DistanceMetric::L2,
            dimension,
            branching_factor: 8,
            max_leaf_size: 32,
            max_depth: 32,
            search_budget: 4096,
            rebalance_slack: 2.0,
            build_threads: 0,
            seed: 0x5eed,
        })
    }

    /// Apply a string-encoded parameter from the boundary.
    ///
    /// Unknown names and unparseable values are rejected with
    /// [`IndexError::InvalidArgument`]. `metric` may only be changed while
    /// the index is empty; [`crate::Index::set_parameter`] enforces that.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| {
                IndexError::InvalidArgument(format!("cannot parse {value:?} for parameter {name}"))
            })
        }

        match name {
            "branching_factor" => {
                let v: usize = parse(name, value)?;
                if v < 2 {
                    return Err(IndexError::InvalidArgument(
                        "branching_factor must be at least 2".to_string(),
                    ));
                }
                self.branching_factor = v;
            }
            "max_leaf_size" => {
                let v: usize = parse(name, value)?;
                if v == 0 {
                    return Err(IndexError::InvalidArgument(
                        "max_leaf_size must be greater than 0".to_string(),
                    ));
                }
                self.max_leaf_size = v;
            }
            "max_depth" => {
                let v: usize = parse(name, value)?;
                if v == 0 {
                    return Err(IndexError::InvalidArgument(
                        "max_depth must be greater than 0".to_string(),
                    ));
                }
                self.max_depth = v;
            }
            "search_budget" => self.search_budget = parse(name, value)?,
            "rebalance_slack" => {
                let v: f32 = parse(name, value)?;
                if !(v >= 1.0) {
                    return Err(IndexError::InvalidArgument(
                        "rebalance_slack must be at least 1.0".to_string(),
                    ));
                }
                self.rebalance_slack = v;
            }
            "build_threads" => self.build_threads = parse(name, value)?,
            "seed" => self.seed = parse(name, value)?,
            "metric" => self.metric = value.parse()?,
            other => {
                return Err(IndexError::InvalidArgument(format!(
                    "unknown parameter {other:?}"
                )))
            }
        }
        Ok(())
    }

    /// Read a parameter back as its string encoding.
    pub fn get_parameter(&self, name: &str) -> Result<String> {
        let value = match name {
            "branching_factor" => self.branching_factor.to_string(),
            "max_leaf_size" => self.max_leaf_size.to_string(),
            "max_depth" => self.max_depth.to_string(),
            "search_budget" => self.search_budget.to_string(),
            "rebalance_slack" => self.rebalance_slack.to_string(),
            "build_threads" => self.build_threads.to_string(),
            "seed" => self.seed.to_string(),
            "metric" => self.metric.to_string(),
            other => {
                return Err(IndexError::InvalidArgument(format!(
                    "unknown parameter {other:?}"
                )))
            }
        };
        Ok(value)
    }

    /// Leaf size above which an incrementally-grown leaf is split.
    pub(crate) fn split_threshold(&self) -> usize {
        ((self.max_leaf_size as f32) * self.rebalance_slack).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = "XYZ".parse::<TreeKind>().unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));
    }

    #[test]
    fn unsupported_value_type_is_rejected() {
        assert!("Int8".parse::<ValueType>().is_err());
        assert!("Float".parse::<ValueType>().is_ok());
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(IndexConfig::new(TreeKind::Bkt, ValueType::Float, 0).is_err());
    }

    #[test]
    fn set_and_get_round_trip() {
        let mut cfg = IndexConfig::new(TreeKind::Kdt, ValueType::Float, 16).unwrap();
        cfg.set_parameter("max_leaf_size", "64").unwrap();
        assert_eq!(cfg.get_parameter("max_leaf_size").unwrap(), "64");
        cfg.set_parameter("seed", "42").unwrap();
        assert_eq!(cfg.seed, 42);
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut cfg = IndexConfig::new(TreeKind::Bkt, ValueType::Float, 16).unwrap();
        assert!(cfg.set_parameter("max_leaf_size", "zero").is_err());
        assert!(cfg.set_parameter("branching_factor", "1").is_err());
        assert!(cfg.set_parameter("rebalance_slack", "0.5").is_err());
        assert!(cfg.set_parameter("no_such_knob", "1").is_err());
    }

    #[test]
    fn split_threshold_scales_with_slack() {
        let mut cfg = IndexConfig::new(TreeKind::Bkt, ValueType::Float, 16).unwrap();
        cfg.max_leaf_size = 10;
        cfg.rebalance_slack = 1.5;
        assert_eq!(cfg.split_threshold(), 15);
    }
}
