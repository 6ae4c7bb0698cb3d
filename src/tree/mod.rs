//! Partitioning tree core: slot arena, nodes, and routing.
//!
//! # Ownership and concurrency
//!
//! Nodes live in an index-based arena and reference each other by integer
//! slot id, never by pointer. Each slot holds an [`ArcSwap`] so a reader
//! loads a complete, immutable `Arc<Node>` in one atomic operation — there
//! is no state in which a traversal can observe a half-updated node. Writers
//! publish a replacement node (or a whole replacement subtree whose interior
//! slots are freshly allocated) by storing into a slot.
//!
//! Writers serialize per subtree through a striped lock table keyed by slot
//! id; see [`crate::update`]. A `generation` counter is bumped on every
//! subtree swap so optimistic writers can detect that the topology moved
//! under them and re-route.
//!
//! Slots orphaned by a subtree swap are retired, not reused: readers may
//! still be traversing the old subtree, and node-level atomicity only
//! protects them if dead slots keep their content. The arena grows by the
//! size of each swapped-out subtree until an exclusive rebuild (full build
//! or compaction) installs a fresh arena and resets it.
//!
//! # Variants
//!
//! The BKT and KDT variants share this entire module; they differ only in
//! the [`Splitter`] carried by internal nodes and in the
//! [`SplitStrategy`](split::SplitStrategy) that produces it.

pub(crate) mod build;
pub(crate) mod kmeans;
pub(crate) mod split;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::distance::DistanceMetric;
use crate::store::{VectorId, VectorStore};

/// Arena slot index; the tree's only form of node reference.
pub type SlotId = u32;

/// The root of the tree always lives in slot 0, so a subtree swap anywhere
/// below it never requires updating an external root pointer.
pub(crate) const ROOT_SLOT: SlotId = 0;

/// Number of write-lock stripes. Writers hash their slot into this table;
/// two writers contend only when their slots share a stripe.
const LOCK_STRIPES: usize = 64;

/// Read-only access to vectors by id, shared by build and rebalance paths.
///
/// Bulk build borrows the store directly (the build gate is exclusive);
/// incremental rebalance works from a scratch copy so it does not hold the
/// store lock while clustering.
pub(crate) trait VectorSource: Sync {
    fn dimension(&self) -> usize;
    fn vector(&self, id: VectorId) -> &[f32];
}

impl VectorSource for VectorStore {
    fn dimension(&self) -> usize {
        VectorStore::dimension(self)
    }

    fn vector(&self, id: VectorId) -> &[f32] {
        self.raw(id)
    }
}

/// Partitioning rule carried by an internal node, one entry per child.
#[derive(Debug, Clone, PartialEq)]
pub enum Splitter {
    /// BKT: child `i` covers the cluster around `centroids[i]`;
    /// `radii[i]` is the distance from the centroid to its farthest member
    /// at split time.
    Centroids {
        centroids: Vec<Vec<f32>>,
        radii: Vec<f32>,
    },
    /// KDT: two children split on coordinate `dim` at `threshold`
    /// (child 0: `v[dim] < threshold`, child 1: the rest).
    Coordinate { dim: u32, threshold: f32 },
}

/// Routing decision for one child of an internal node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildRoute {
    /// Position in the node's child list.
    pub child: usize,
    /// Best-first ordering key (smaller = more promising).
    pub order: f32,
    /// Lower bound on the distance to anything in the child's subtree;
    /// 0.0 when the metric admits no bound.
    pub bound: f32,
}

impl Splitter {
    /// Number of children this splitter partitions into.
    pub fn child_count(&self) -> usize {
        match self {
            Splitter::Centroids { centroids, .. } => centroids.len(),
            Splitter::Coordinate { .. } => 2,
        }
    }

    /// Child index a vector belongs to. Used by insert routing and by the
    /// load-time invariant check; must agree with how `split` partitioned.
    pub fn assign(&self, v: &[f32], metric: DistanceMetric) -> usize {
        match self {
            Splitter::Centroids { centroids, .. } => {
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
            }
            Splitter::Coordinate { dim, threshold } => {
                usize::from(v[*dim as usize] >= *threshold)
            }
        }
    }

    /// Route a query: every child with its ordering key and pruning bound.
    pub(crate) fn route(&self, query: &[f32], metric: DistanceMetric) -> SmallVec<[ChildRoute; 8]> {
        match self {
            Splitter::Centroids { centroids, radii } => centroids
                .iter()
                .zip(radii.iter())
                .enumerate()
                .map(|(i, (c, &r))| {
                    let d = metric.distance(query, c);
                    let bound = metric.ball_lower_bound(d, r);
                    ChildRoute {
                        child: i,
                        // Without a valid bound, the centroid distance still
                        // orders children by promise.
                        order: if metric.supports_bounds() { bound } else { d },
                        bound,
                    }
                })
                .collect(),
            Splitter::Coordinate { dim, threshold } => {
                let gap = (query[*dim as usize] - threshold).abs();
                let near = usize::from(query[*dim as usize] >= *threshold);
                let mut routes = SmallVec::new();
                routes.push(ChildRoute {
                    child: near,
                    order: 0.0,
                    bound: 0.0,
                });
                routes.push(ChildRoute {
                    child: 1 - near,
                    order: gap,
                    bound: metric.plane_lower_bound(gap),
                });
                routes
            }
        }
    }
}

/// A tree node. Immutable once published to a slot; mutation means
/// publishing a replacement.
#[derive(Debug, Clone)]
pub enum Node {
    Internal {
        splitter: Splitter,
        children: SmallVec<[SlotId; 8]>,
    },
    Leaf {
        ids: Vec<VectorId>,
    },
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Node::Leaf { ids: Vec::new() }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}

/// Slot arena holding the tree's nodes behind per-slot atomic pointers.
#[derive(Debug)]
pub(crate) struct NodeArena {
    slots: RwLock<Vec<Arc<ArcSwap<Node>>>>,
}

impl NodeArena {
    /// Arena containing a single empty-leaf root.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![Arc::new(ArcSwap::from_pointee(Node::empty_leaf()))]),
        }
    }

    /// Load the node currently published in `slot`.
    pub fn load(&self, slot: SlotId) -> Arc<Node> {
        self.slots.read()[slot as usize].load_full()
    }

    /// Atomically publish `node` into `slot`.
    pub fn store(&self, slot: SlotId, node: Arc<Node>) {
        self.slots.read()[slot as usize].store(node);
    }

    /// Allocate a fresh slot holding `node`.
    pub fn alloc(&self, node: Arc<Node>) -> SlotId {
        let mut slots = self.slots.write();
        let slot = slots.len() as SlotId;
        slots.push(Arc::new(ArcSwap::new(node)));
        slot
    }

    /// Total slots ever allocated (live + retired).
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Replace the entire arena with `nodes` (root at slot 0).
    ///
    /// Only sound under the exclusive build gate: no reader or writer may
    /// hold slot references across this call.
    pub fn install(&self, nodes: Vec<Arc<Node>>) {
        debug_assert!(!nodes.is_empty());
        let mut slots = self.slots.write();
        *slots = nodes.into_iter().map(|n| Arc::new(ArcSwap::new(n))).collect();
    }
}

/// The partitioning tree: arena plus the write-side coordination state.
#[derive(Debug)]
pub(crate) struct Tree {
    pub arena: NodeArena,
    stripes: Box<[Mutex<()>]>,
    /// Bumped on every subtree swap; optimistic writers re-route when it
    /// moves between routing and locking.
    generation: AtomicU64,
    /// Slots unlinked by subtree swaps since the last exclusive rebuild.
    retired: AtomicUsize,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            arena: NodeArena::new(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            generation: AtomicU64::new(0),
            retired: AtomicUsize::new(0),
        }
    }

    /// The write-lock stripe covering `slot`.
    pub fn stripe(&self, slot: SlotId) -> &Mutex<()> {
        &self.stripes[slot as usize % LOCK_STRIPES]
    }

    /// Stripe indices covering `slots`, deduplicated and sorted.
    ///
    /// Multi-stripe holders (rebalance) must acquire in this order; single-
    /// stripe holders (insert) never acquire a second. That ordering
    /// discipline is what makes the striped table deadlock-free.
    pub fn stripe_set(&self, slots: &[SlotId]) -> Vec<usize> {
        let mut set: Vec<usize> = slots
            .iter()
            .map(|s| *s as usize % LOCK_STRIPES)
            .collect();
        set.sort_unstable();
        set.dedup();
        set
    }

    pub fn lock_stripe_index(&self, index: usize) -> &Mutex<()> {
        &self.stripes[index]
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Record `count` slots unlinked by a swap.
    pub fn retire(&self, count: usize) {
        self.retired.fetch_add(count, Ordering::Relaxed);
    }

    /// Slots currently retired (dead weight until the next exclusive
    /// rebuild installs a fresh arena).
    pub fn retired_slots(&self) -> usize {
        self.retired.load(Ordering::Relaxed)
    }

    /// Install a freshly built arena and reset swap bookkeeping. Caller
    /// must hold the exclusive build gate.
    pub fn install(&self, nodes: Vec<Arc<Node>>) {
        self.arena.install(nodes);
        self.retired.store(0, Ordering::Relaxed);
        self.bump_generation();
    }

    /// Lock every stripe, in order. Quiesces all tree writers; readers are
    /// unaffected. Used by save to capture a topology consistent with the
    /// store.
    pub fn lock_all_stripes(&self) -> Vec<parking_lot::MutexGuard<'_, ()>> {
        self.stripes.iter().map(|m| m.lock()).collect()
    }

    /// Slot ids reachable from `root` in the currently published topology.
    pub fn reachable(&self, root: SlotId) -> Vec<SlotId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(slot) = stack.pop() {
            out.push(slot);
            if let Node::Internal { children, .. } = &*self.arena.load(slot) {
                stack.extend(children.iter().copied());
            }
        }
        out
    }

    /// All leaf ids under `root`, in traversal order.
    pub fn leaf_ids(&self, root: SlotId) -> Vec<VectorId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(slot) = stack.pop() {
            match &*self.arena.load(slot) {
                Node::Internal { children, .. } => stack.extend(children.iter().copied()),
                Node::Leaf { ids } => out.extend_from_slice(ids),
            }
        }
        out
    }

    /// (internal nodes, leaves, max depth) under the root.
    pub fn shape(&self) -> (usize, usize, usize) {
        let mut internals = 0;
        let mut leaves = 0;
        let mut max_depth = 0;
        let mut stack = vec![(ROOT_SLOT, 1usize)];
        while let Some((slot, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            match &*self.arena.load(slot) {
                Node::Internal { children, .. } => {
                    internals += 1;
                    stack.extend(children.iter().map(|&c| (c, depth + 1)));
                }
                Node::Leaf { .. } => leaves += 1,
            }
        }
        (internals, leaves, max_depth)
    }
}
