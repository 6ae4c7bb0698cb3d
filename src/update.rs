//! Incremental updates: routed insert, leaf split, and rebalancing.
//!
//! # Insert
//!
//! A new vector routes down the published tree — by the same rule queries
//! use — to its best-matching leaf, and a replacement leaf containing it is
//! published in place. Routing is optimistic: the writer records the tree
//! generation, routes without locks, then takes the leaf's stripe lock and
//! re-validates. If a rebalance swapped the topology in between (generation
//! moved) or the slot stopped being a leaf (a racing split), it re-routes.
//!
//! # Split
//!
//! A leaf that outgrows `max_leaf_size * rebalance_slack` is re-partitioned
//! with the same strategy the build used and grafted back: fresh slots for
//! the new interior, descendants published first, the subtree root published
//! into the existing slot last. Readers see the old leaf or the finished
//! subtree, never anything in between.
//!
//! # Rebalance
//!
//! Incremental growth degrades leaf quality (imbalance, overlap with
//! sibling clusters). A rebalance pass finds degraded leaves — oversized or
//! tombstone-heavy — and rebuilds each one's parent subtree copy-on-write:
//! the replacement is constructed entirely aside from a scratch copy of the
//! subtree's live vectors, then swapped in by a single slot store. Failure
//! or cancellation before the swap leaves the previous subtree untouched.
//! Slots orphaned by the swap stay retired until the next exclusive rebuild
//! installs a fresh arena.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::store::{VectorId, VectorStore};
use crate::tree::build::{build_subtree, derive_seed};
use crate::tree::split::SplitStrategy;
use crate::tree::{Node, SlotId, Tree, VectorSource, ROOT_SLOT};

/// Outcome of a rebalance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceStats {
    /// Subtrees rebuilt and swapped.
    pub subtrees_rebuilt: usize,
    /// Tombstoned ids dropped from leaves during the pass.
    pub tombstones_dropped: usize,
}

/// Scratch copy of a subtree's vectors, so clustering never holds the
/// store lock.
struct ScratchVectors {
    dimension: usize,
    flat: Vec<f32>,
    offsets: HashMap<VectorId, usize>,
}

impl ScratchVectors {
    fn collect(store: &VectorStore, ids: &[VectorId]) -> Self {
        let dimension = store.dimension();
        let mut flat = Vec::with_capacity(ids.len() * dimension);
        let mut offsets = HashMap::with_capacity(ids.len());
        for (pos, &id) in ids.iter().enumerate() {
            flat.extend_from_slice(store.raw(id));
            offsets.insert(id, pos);
        }
        Self {
            dimension,
            flat,
            offsets,
        }
    }
}

impl VectorSource for ScratchVectors {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn vector(&self, id: VectorId) -> &[f32] {
        let pos = self.offsets[&id];
        &self.flat[pos * self.dimension..(pos + 1) * self.dimension]
    }
}

/// Walk the published topology to the leaf a vector belongs in.
fn route_to_leaf(tree: &Tree, vector: &[f32], config: &IndexConfig) -> SlotId {
    let mut slot = ROOT_SLOT;
    loop {
        match &*tree.arena.load(slot) {
            Node::Leaf { .. } => return slot,
            Node::Internal { splitter, children } => {
                let child = splitter.assign(vector, config.metric);
                slot = children[child];
            }
        }
    }
}

/// Insert an already-stored vector into the tree.
///
/// The id must already be appended to the store; this only places it in a
/// leaf. Serializes with other writers on the leaf's stripe; never blocks
/// readers.
pub(crate) fn insert(
    tree: &Tree,
    store: &RwLock<VectorStore>,
    config: &IndexConfig,
    strategy: &dyn SplitStrategy,
    id: VectorId,
    vector: &[f32],
) -> Result<()> {
    loop {
        let generation = tree.generation();
        let leaf_slot = route_to_leaf(tree, vector, config);
        let _stripe = tree.stripe(leaf_slot).lock();

        // A swap between routing and locking may have retired the slot we
        // routed to; start over on the new topology.
        if tree.generation() != generation {
            continue;
        }
        let node = tree.arena.load(leaf_slot);
        let Node::Leaf { ids } = &*node else {
            // A racing split on the same stripe turned the leaf internal.
            continue;
        };

        let mut new_ids = Vec::with_capacity(ids.len() + 1);
        new_ids.extend_from_slice(ids);
        new_ids.push(id);

        if new_ids.len() > config.split_threshold() {
            split_leaf(tree, store, config, strategy, leaf_slot, new_ids)?;
        } else {
            tree.arena
                .store(leaf_slot, Arc::new(Node::Leaf { ids: new_ids }));
        }
        return Ok(());
    }
}

/// Re-partition an overflowing leaf and graft the result into its slot.
///
/// Caller holds the slot's stripe lock. Tombstoned ids are dropped on the
/// way — a split is a natural cleanup point.
fn split_leaf(
    tree: &Tree,
    store: &RwLock<VectorStore>,
    config: &IndexConfig,
    strategy: &dyn SplitStrategy,
    slot: SlotId,
    ids: Vec<VectorId>,
) -> Result<()> {
    let (live_ids, scratch) = {
        let guard = store.read();
        let live_ids: Vec<VectorId> = ids.into_iter().filter(|&id| guard.is_live(id)).collect();
        let scratch = ScratchVectors::collect(&guard, &live_ids);
        (live_ids, scratch)
    };

    trace!(slot, count = live_ids.len(), "splitting leaf");
    let nodes = build_subtree(
        &scratch,
        live_ids,
        1,
        derive_seed(config.seed, slot as usize),
        strategy,
        config,
        &CancelToken::new(),
    )?;
    graft(tree, nodes, slot);
    Ok(())
}

/// Publish a locally-built subtree into the arena with its root at
/// `target`.
///
/// Local node indices are remapped onto arena slots; descendants are
/// published before the root, so the single store into `target` is the
/// atomic switch from old subtree to new.
fn graft(tree: &Tree, nodes: Vec<Arc<Node>>, target: SlotId) {
    let mut mapping = Vec::with_capacity(nodes.len());
    mapping.push(target);
    for _ in 1..nodes.len() {
        mapping.push(tree.arena.alloc(Arc::new(Node::empty_leaf())));
    }

    for (local, node) in nodes.into_iter().enumerate().rev() {
        let rewritten = match &*node {
            Node::Leaf { .. } => Arc::clone(&node),
            Node::Internal { splitter, children } => Arc::new(Node::Internal {
                splitter: splitter.clone(),
                children: children.iter().map(|&c| mapping[c as usize]).collect(),
            }),
        };
        tree.arena.store(mapping[local], rewritten);
    }
}

/// Whether a leaf needs attention from the rebalancer.
fn is_degraded(store: &VectorStore, ids: &[VectorId], config: &IndexConfig) -> bool {
    if ids.is_empty() {
        return false;
    }
    let live = ids.iter().filter(|&&id| store.is_live(id)).count();
    let dead = ids.len() - live;
    live > config.max_leaf_size || dead * 2 > ids.len()
}

/// One rebalance pass over the whole tree.
///
/// Runs concurrently with reads and with inserts into unaffected subtrees;
/// serializes with writers touching the subtrees it rebuilds via their
/// stripe locks (acquired in sorted order, so the pass cannot deadlock with
/// single-stripe writers).
pub(crate) fn rebalance(
    tree: &Tree,
    store: &RwLock<VectorStore>,
    config: &IndexConfig,
    strategy: &dyn SplitStrategy,
    cancel: &CancelToken,
) -> Result<RebalanceStats> {
    if cancel.is_cancelled() {
        return Err(IndexError::Cancelled);
    }
    let mut stats = RebalanceStats::default();

    // Snapshot the topology and find parents of degraded leaves. The
    // snapshot is advisory — each rebuild re-validates under locks.
    let mut targets: Vec<SlotId> = Vec::new();
    {
        let guard = store.read();
        let mut stack = vec![(ROOT_SLOT, ROOT_SLOT)];
        while let Some((slot, parent)) = stack.pop() {
            match &*tree.arena.load(slot) {
                Node::Internal { children, .. } => {
                    stack.extend(children.iter().map(|&c| (c, slot)));
                }
                Node::Leaf { ids } => {
                    if is_degraded(&guard, ids, config) {
                        targets.push(parent);
                    }
                }
            }
        }
    }
    targets.sort_unstable();
    targets.dedup();

    for target in targets {
        if cancel.is_cancelled() {
            debug!(
                rebuilt = stats.subtrees_rebuilt,
                "rebalance cancelled; tree left in last consistent state"
            );
            return Err(IndexError::Cancelled);
        }
        if rebuild_subtree_cow(tree, store, config, strategy, target, cancel, &mut stats)? {
            stats.subtrees_rebuilt += 1;
        }
    }

    debug!(
        rebuilt = stats.subtrees_rebuilt,
        dropped = stats.tombstones_dropped,
        "rebalance pass complete"
    );
    Ok(stats)
}

/// Rebuild the subtree rooted at `target` copy-on-write and swap it in.
///
/// Returns false when the subtree no longer needs rebuilding (a racing
/// writer got there first).
fn rebuild_subtree_cow(
    tree: &Tree,
    store: &RwLock<VectorStore>,
    config: &IndexConfig,
    strategy: &dyn SplitStrategy,
    target: SlotId,
    cancel: &CancelToken,
    stats: &mut RebalanceStats,
) -> Result<bool> {
    // Lock every stripe covering the subtree, in sorted order. Writers
    // inside the subtree hold one of these, so after acquisition the
    // subtree is quiescent and safe to read consistently.
    let subtree_slots = tree.reachable(target);
    let stripe_indices = tree.stripe_set(&subtree_slots);
    let _guards: Vec<_> = stripe_indices
        .iter()
        .map(|&i| tree.lock_stripe_index(i).lock())
        .collect();

    // Re-validate: the topology may have changed before we locked. The
    // target itself may have been detached by an earlier swap this pass
    // (slots are never reused, so a reachability check is conclusive).
    if target != ROOT_SLOT && !tree.reachable(ROOT_SLOT).contains(&target) {
        return Ok(false);
    }
    let current_slots = tree.reachable(target);
    if current_slots != subtree_slots {
        return Ok(false);
    }

    let all_ids = tree.leaf_ids(target);
    let (live_ids, scratch) = {
        let guard = store.read();
        let still_degraded = {
            let mut any = false;
            let mut stack = vec![target];
            while let Some(slot) = stack.pop() {
                match &*tree.arena.load(slot) {
                    Node::Internal { children, .. } => stack.extend(children.iter().copied()),
                    Node::Leaf { ids } => {
                        if is_degraded(&guard, ids, config) {
                            any = true;
                            break;
                        }
                    }
                }
            }
            any
        };
        if !still_degraded {
            return Ok(false);
        }
        let live_ids: Vec<VectorId> = all_ids
            .iter()
            .copied()
            .filter(|&id| guard.is_live(id))
            .collect();
        let scratch = ScratchVectors::collect(&guard, &live_ids);
        (live_ids, scratch)
    };
    stats.tombstones_dropped += all_ids.len() - live_ids.len();

    // Construct the replacement entirely aside. Cancellation or failure
    // here abandons the scratch nodes; nothing was published.
    let nodes = build_subtree(
        &scratch,
        live_ids,
        1,
        derive_seed(config.seed, target as usize),
        strategy,
        config,
        cancel,
    )?;

    // Atomic swap: descendants first, subtree root last. The old interior
    // slots are dead weight until the next exclusive rebuild resets the
    // arena.
    graft(tree, nodes, target);
    tree.retire(subtree_slots.len().saturating_sub(1));
    tree.bump_generation();
    Ok(true)
}
