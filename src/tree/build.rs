//! Bulk tree construction.
//!
//! Recursively partitions an id set with the index's split strategy until
//! leaves fall at or below `max_leaf_size` (or `max_depth` stops degenerate
//! recursion). Sibling subtrees build in parallel on rayon; determinism
//! comes from the seed, not the schedule — each child derives its seed from
//! its parent's seed and its ordinal, and the finished tree is flattened
//! into slots in a single-threaded preorder pass.

use std::sync::Arc;

use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::store::VectorId;
use crate::tree::split::SplitStrategy;
use crate::tree::{Node, VectorSource};

/// Tree under construction, before slot assignment.
enum BuiltNode {
    Internal {
        splitter: crate::tree::Splitter,
        children: Vec<BuiltNode>,
    },
    Leaf {
        ids: Vec<VectorId>,
    },
}

/// Derive a child's seed from its parent's seed and ordinal.
///
/// SplitMix64-style mixing so sibling seeds decorrelate even for adjacent
/// ordinals.
pub(crate) fn derive_seed(seed: u64, ordinal: usize) -> u64 {
    let mut z = seed
        .wrapping_add(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(ordinal as u64);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Build a complete tree over `ids`, returning the node list with the root
/// at index 0, ready for [`NodeArena::install`](crate::tree::NodeArena::install).
pub(crate) fn build_tree(
    src: &(dyn VectorSource + '_),
    ids: Vec<VectorId>,
    strategy: &dyn SplitStrategy,
    config: &IndexConfig,
    cancel: &CancelToken,
) -> Result<Vec<Arc<Node>>> {
    let built = build_node(src, ids, 1, config.seed, strategy, config, cancel)?;
    let mut nodes = Vec::new();
    flatten(built, &mut nodes);
    Ok(nodes)
}

/// Build one subtree over `ids`, rooted at `depth`.
///
/// Shared by bulk build (over the whole store) and rebalance (over a
/// scratch copy of one subtree's vectors).
pub(crate) fn build_subtree(
    src: &(dyn VectorSource + '_),
    ids: Vec<VectorId>,
    depth: usize,
    seed: u64,
    strategy: &dyn SplitStrategy,
    config: &IndexConfig,
    cancel: &CancelToken,
) -> Result<Vec<Arc<Node>>> {
    let built = build_node(src, ids, depth, seed, strategy, config, cancel)?;
    let mut nodes = Vec::new();
    flatten(built, &mut nodes);
    Ok(nodes)
}

fn build_node(
    src: &(dyn VectorSource + '_),
    ids: Vec<VectorId>,
    depth: usize,
    seed: u64,
    strategy: &dyn SplitStrategy,
    config: &IndexConfig,
    cancel: &CancelToken,
) -> Result<BuiltNode> {
    if cancel.is_cancelled() {
        return Err(IndexError::Cancelled);
    }

    if ids.len() <= config.max_leaf_size || depth >= config.max_depth {
        return Ok(BuiltNode::Leaf { ids });
    }

    let Some(outcome) = strategy.split(src, &ids, config.metric, seed) else {
        // No split makes progress (coincident points); keep an oversized
        // leaf rather than recursing forever.
        return Ok(BuiltNode::Leaf { ids });
    };

    let children: Result<Vec<BuiltNode>> = outcome
        .parts
        .into_par_iter()
        .enumerate()
        .map(|(ordinal, part)| {
            build_node(
                src,
                part,
                depth + 1,
                derive_seed(seed, ordinal),
                strategy,
                config,
                cancel,
            )
        })
        .collect();

    Ok(BuiltNode::Internal {
        splitter: outcome.splitter,
        children: children?,
    })
}

/// Preorder flatten: the node itself takes the next slot, then each child
/// subtree in order. Deterministic for a deterministic `BuiltNode`.
fn flatten(built: BuiltNode, nodes: &mut Vec<Arc<Node>>) -> u32 {
    match built {
        BuiltNode::Leaf { ids } => {
            let slot = nodes.len() as u32;
            nodes.push(Arc::new(Node::Leaf { ids }));
            slot
        }
        BuiltNode::Internal { splitter, children } => {
            let slot = nodes.len() as u32;
            // Placeholder until the children's slots are known.
            nodes.push(Arc::new(Node::empty_leaf()));
            let child_slots = children
                .into_iter()
                .map(|c| flatten(c, nodes))
                .collect();
            nodes[slot as usize] = Arc::new(Node::Internal {
                splitter,
                children: child_slots,
            });
            slot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, TreeKind, ValueType};
    use crate::store::VectorStore;
    use crate::tree::split::strategy_for;

    fn grid_store(n: usize, dim: usize) -> VectorStore {
        let mut store = VectorStore::new(dim);
        for i in 0..n {
            let v: Vec<f32> = (0..dim).map(|d| ((i * (d + 3)) % 17) as f32).collect();
            store.append(&v).unwrap();
        }
        store
    }

    fn build_with(kind: TreeKind, n: usize) -> (VectorStore, Vec<Arc<Node>>, IndexConfig) {
        let store = grid_store(n, 4);
        let mut config = IndexConfig::new(kind, ValueType::Float, 4).unwrap();
        config.max_leaf_size = 8;
        let strategy = strategy_for(&config);
        let ids: Vec<VectorId> = (0..n as VectorId).collect();
        let nodes = build_tree(&store, ids, strategy.as_ref(), &config, &CancelToken::new()).unwrap();
        (store, nodes, config)
    }

    fn collect_leaf_ids(nodes: &[Arc<Node>]) -> Vec<VectorId> {
        let mut out = Vec::new();
        for node in nodes {
            if let Node::Leaf { ids } = &**node {
                out.extend_from_slice(ids);
            }
        }
        out.sort_unstable();
        out
    }

    #[test]
    fn every_id_lands_in_exactly_one_leaf() {
        for kind in [TreeKind::Bkt, TreeKind::Kdt] {
            let (_, nodes, _) = build_with(kind, 200);
            let ids = collect_leaf_ids(&nodes);
            assert_eq!(ids, (0..200).collect::<Vec<VectorId>>(), "{kind:?}");
        }
    }

    #[test]
    fn leaves_respect_the_size_threshold() {
        let (_, nodes, config) = build_with(TreeKind::Bkt, 300);
        for node in &nodes {
            if let Node::Leaf { ids } = &**node {
                assert!(ids.len() <= config.max_leaf_size.max(1) * 4);
            }
        }
        // At least one split happened.
        assert!(nodes.len() > 1);
    }

    #[test]
    fn same_seed_builds_identical_trees() {
        let store = grid_store(150, 4);
        let mut config = IndexConfig::new(TreeKind::Bkt, ValueType::Float, 4).unwrap();
        config.max_leaf_size = 8;
        config.seed = 99;
        let strategy = strategy_for(&config);
        let ids: Vec<VectorId> = (0..150).collect();

        let a = build_tree(&store, ids.clone(), strategy.as_ref(), &config, &CancelToken::new())
            .unwrap();
        let b = build_tree(&store, ids, strategy.as_ref(), &config, &CancelToken::new()).unwrap();

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            match (&**x, &**y) {
                (Node::Leaf { ids: i }, Node::Leaf { ids: j }) => assert_eq!(i, j),
                (
                    Node::Internal { children: c, .. },
                    Node::Internal { children: d, .. },
                ) => assert_eq!(c, d),
                _ => panic!("tree shapes diverged"),
            }
        }
    }

    #[test]
    fn cancelled_build_returns_cancelled() {
        let store = grid_store(500, 4);
        let mut config = IndexConfig::new(TreeKind::Kdt, ValueType::Float, 4).unwrap();
        config.max_leaf_size = 2;
        let strategy = strategy_for(&config);
        let token = CancelToken::new();
        token.cancel();

        let err = build_tree(
            &store,
            (0..500).collect(),
            strategy.as_ref(),
            &config,
            &token,
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));
    }

    #[test]
    fn coincident_points_build_one_big_leaf() {
        let mut store = VectorStore::new(2);
        for _ in 0..50 {
            store.append(&[1.0, 1.0]).unwrap();
        }
        let mut config = IndexConfig::new(TreeKind::Bkt, ValueType::Float, 2).unwrap();
        config.max_leaf_size = 8;
        let strategy = strategy_for(&config);
        let nodes = build_tree(
            &store,
            (0..50).collect(),
            strategy.as_ref(),
            &config,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_leaf());
    }
}
