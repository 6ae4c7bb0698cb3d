//! Best-first branch-and-bound k-NN search.
//!
//! A min-heap orders candidate subtrees by their lower-bound distance; the
//! most promising is expanded first, and any subtree whose bound exceeds the
//! current k-th best distance is pruned. Traversal stops when the heap
//! drains or the exploration budget — a cap on distance computations — runs
//! out. With a budget the search is approximate by design; with budget 0 it
//! degrades to exact traversal (every non-prunable node visited).
//!
//! Tombstoned ids are filtered here, so a leaf may contribute fewer
//! candidates than it lists.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::distance::DistanceMetric;
use crate::store::{VectorId, VectorStore};
use crate::tree::{Node, SlotId, Tree, ROOT_SLOT};

/// One search hit: a live vector id and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: VectorId,
    pub distance: f32,
}

/// A subtree awaiting expansion.
struct Candidate {
    /// Best-first ordering key.
    order: f32,
    /// Lower bound for pruning (0 when the metric admits none).
    bound: f32,
    slot: SlotId,
}

// BinaryHeap is a max-heap; invert the ordering to pop the smallest key.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .order
            .total_cmp(&self.order)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Bounded best-k set ordered by (distance, id): equal distances resolve to
/// the earlier-inserted vector, keeping results deterministic.
struct BestK {
    k: usize,
    hits: Vec<(f32, VectorId)>,
}

impl BestK {
    fn new(k: usize) -> Self {
        Self {
            k,
            hits: Vec::with_capacity(k),
        }
    }

    /// The current k-th best distance, or infinity while under-filled.
    fn threshold(&self) -> f32 {
        if self.hits.len() < self.k {
            f32::INFINITY
        } else {
            self.hits
                .iter()
                .map(|&(d, _)| d)
                .fold(f32::NEG_INFINITY, f32::max)
        }
    }

    fn offer(&mut self, distance: f32, id: VectorId) {
        if self.hits.len() < self.k {
            self.hits.push((distance, id));
            return;
        }
        // Replace the worst hit if the newcomer beats it on (distance, id).
        if let Some(worst_idx) = self
            .hits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1 .0.total_cmp(&b.1 .0).then(a.1 .1.cmp(&b.1 .1)))
            .map(|(i, _)| i)
        {
            let worst = self.hits[worst_idx];
            if distance.total_cmp(&worst.0).then(id.cmp(&worst.1)).is_lt() {
                self.hits[worst_idx] = (distance, id);
            }
        }
    }

    fn into_sorted(mut self) -> Vec<Neighbor> {
        self.hits
            .sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        self.hits
            .into_iter()
            .map(|(distance, id)| Neighbor { id, distance })
            .collect()
    }
}

/// Search the published tree for the k nearest live vectors.
///
/// `budget` caps distance computations; 0 disables the cap. Input
/// validation (k > 0, dimension) happens at the `Index` boundary.
pub(crate) fn search(
    tree: &Tree,
    store: &VectorStore,
    metric: DistanceMetric,
    query: &[f32],
    k: usize,
    budget: usize,
) -> Vec<Neighbor> {
    let mut best = BestK::new(k);
    let mut heap = BinaryHeap::new();
    heap.push(Candidate {
        order: 0.0,
        bound: 0.0,
        slot: ROOT_SLOT,
    });

    let mut spent = 0usize;

    while let Some(candidate) = heap.pop() {
        if candidate.bound > best.threshold() {
            // Everything under this subtree is provably worse than the
            // current k-th best; with bounds being monotone down the heap,
            // so is everything still queued.
            break;
        }
        if budget != 0 && spent >= budget {
            break;
        }

        match &*tree.arena.load(candidate.slot) {
            Node::Internal { splitter, children } => {
                let routes = splitter.route(query, metric);
                spent += routes.len();
                for route in routes {
                    // A child's bound can never be looser than its parent's.
                    let bound = route.bound.max(candidate.bound);
                    if bound > best.threshold() {
                        continue;
                    }
                    heap.push(Candidate {
                        order: route.order.max(candidate.order),
                        bound,
                        slot: children[route.child],
                    });
                }
            }
            Node::Leaf { ids } => {
                for &id in ids {
                    if !store.is_live(id) {
                        continue;
                    }
                    if budget != 0 && spent >= budget {
                        break;
                    }
                    spent += 1;
                    let d = metric.distance(query, store.raw(id));
                    best.offer(d, id);
                }
            }
        }
    }

    best.into_sorted()
}
