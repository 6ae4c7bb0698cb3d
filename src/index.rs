//! The index: one vector store, one partitioning tree, and the boundary
//! operations the external wrapper consumes.
//!
//! # Concurrency contract
//!
//! - `search` and `get` run concurrently with everything except a full
//!   build; they never observe a half-updated node.
//! - `add`, `remove`, and `rebalance` run concurrently with reads and with
//!   each other on disjoint subtrees; they serialize per subtree through
//!   the tree's stripe locks.
//! - `build` and `compact` are exclusive. They wait for in-flight
//!   operations to drain; operations arriving while they hold the gate
//!   fail with [`IndexError::Unavailable`] instead of blocking. The plain
//!   counters (`count`, `dimension`) never touch the tree and stay
//!   available throughout.
//!
//! # Teardown
//!
//! Ownership is strictly hierarchical (arena slots hold nodes, nodes hold
//! ids, the store holds vectors; no cycles), so dropping the index tears
//! everything down deterministically: the tree releases its nodes before
//! the store releases vector storage (field declaration order below).

use std::path::Path;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{IndexConfig, TreeKind, ValueType};
use crate::error::{IndexError, Result};
use crate::persistence::format::IndexManifest;
use crate::persistence::snapshot;
use crate::persistence::FORMAT_VERSION;
use crate::query::{self, Neighbor};
use crate::store::{VectorId, VectorStore};
use crate::tree::build::build_tree;
use crate::tree::split::strategy_for;
use crate::tree::Tree;
use crate::update::{self, RebalanceStats};

/// Observable shape of an index.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub algorithm: TreeKind,
    pub dimension: usize,
    pub live_vectors: usize,
    pub total_vectors: usize,
    pub internal_nodes: usize,
    pub leaves: usize,
    pub max_depth: usize,
    pub retired_slots: usize,
}

/// A mutable approximate nearest-neighbor index.
#[derive(Debug)]
pub struct Index {
    // Tree before store: teardown drops nodes (which reference ids) before
    // the storage those ids point into.
    tree: Tree,
    store: RwLock<VectorStore>,
    config: RwLock<IndexConfig>,
    build_gate: RwLock<()>,
    /// An insert is two steps (store append, then tree placement) and is
    /// only atomic with respect to snapshot capture, which would otherwise
    /// observe a live id in no leaf. Inserts hold this shared; save holds
    /// it exclusive while capturing. Always acquired before stripe locks.
    mutation_gate: RwLock<()>,
}

impl Index {
    /// Create an empty index, selecting the algorithm and value type by
    /// name as the boundary does: `"BKT"`/`"KDT"` and `"Float"`. Unknown
    /// names fail with [`IndexError::InvalidArgument`].
    pub fn create(algorithm: &str, value_type: &str, dimension: usize) -> Result<Self> {
        let kind: TreeKind = algorithm.parse()?;
        let vtype: ValueType = value_type.parse()?;
        Ok(Self::with_config(IndexConfig::new(kind, vtype, dimension)?))
    }

    /// Create an empty index from an already-typed configuration.
    pub fn with_config(config: IndexConfig) -> Self {
        let dimension = config.dimension;
        Self {
            tree: Tree::new(),
            store: RwLock::new(VectorStore::new(dimension)),
            config: RwLock::new(config),
            build_gate: RwLock::new(()),
            mutation_gate: RwLock::new(()),
        }
    }

    /// Guard taken by every non-exclusive operation. Fails fast while a
    /// build or compaction holds the gate.
    fn operation_gate(&self) -> Result<parking_lot::RwLockReadGuard<'_, ()>> {
        self.build_gate
            .try_read()
            .ok_or(IndexError::Unavailable("exclusive build in progress"))
    }

    /// Insert a single vector, returning its id.
    ///
    /// The vector routes down the tree to its best-matching leaf; an
    /// overflowing leaf is split in place. A search racing this insert sees
    /// the index either without the new id or with it fully placed.
    pub fn add(&self, vector: &[f32]) -> Result<VectorId> {
        let _gate = self.operation_gate()?;
        let _mutation = self.mutation_gate.read();
        let config = self.config.read().clone();

        let id = self.store.write().append(vector)?;
        let strategy = strategy_for(&config);
        update::insert(&self.tree, &self.store, &config, strategy.as_ref(), id, vector)?;
        Ok(id)
    }

    /// Tombstone a vector. The id is never reassigned; the slot is
    /// reclaimed only by [`compact`](Self::compact).
    pub fn remove(&self, id: VectorId) -> Result<()> {
        let _gate = self.operation_gate()?;
        self.store.write().delete(id)
    }

    /// Fetch a live vector by id.
    pub fn get(&self, id: VectorId) -> Result<Vec<f32>> {
        let _gate = self.operation_gate()?;
        self.store.read().get(id).map(<[f32]>::to_vec)
    }

    /// Bulk (re)build from `vectors`. Exclusive: waits for in-flight
    /// operations, then replaces both store and tree. Ids are assigned
    /// 0..n in input order.
    pub fn build(&self, vectors: &[Vec<f32>]) -> Result<()> {
        self.build_cancellable(vectors, &CancelToken::new())
    }

    /// [`build`](Self::build) with a cancellation token. A cancelled build
    /// leaves the previous store and tree untouched.
    pub fn build_cancellable(&self, vectors: &[Vec<f32>], cancel: &CancelToken) -> Result<()> {
        let _gate = self.build_gate.write();
        let config = self.config.read().clone();
        let started = Instant::now();

        let mut store = VectorStore::with_capacity(config.dimension, vectors.len());
        for v in vectors {
            store.append(v)?;
        }

        let ids: Vec<VectorId> = (0..store.total_count() as VectorId).collect();
        let strategy = strategy_for(&config);
        let nodes = run_on_pool(config.build_threads, || {
            build_tree(&store, ids, strategy.as_ref(), &config, cancel)
        })?;

        // Nothing above mutated the index; publish both halves now.
        *self.store.write() = store;
        self.tree.install(nodes);

        info!(
            vectors = vectors.len(),
            nodes = self.tree.arena.capacity(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            algorithm = %config.kind,
            "bulk build complete"
        );
        Ok(())
    }

    /// Approximate k-nearest-neighbor search.
    ///
    /// Results are sorted ascending by distance, ties broken by insertion
    /// order, at most `k` long. With `search_budget = 0` the traversal is
    /// exact and returns `min(k, live_count)` results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let _gate = self.operation_gate()?;
        if k == 0 {
            return Err(IndexError::InvalidArgument(
                "k must be greater than 0".to_string(),
            ));
        }
        let config = self.config.read().clone();
        if query.len() != config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: config.dimension,
                actual: query.len(),
            });
        }

        let store = self.store.read();
        Ok(query::search(
            &self.tree,
            &store,
            config.metric,
            query,
            k,
            config.search_budget,
        ))
    }

    /// Re-partition degraded subtrees copy-on-write. Runs concurrently
    /// with reads and with writes to unaffected subtrees.
    pub fn rebalance(&self) -> Result<RebalanceStats> {
        self.rebalance_cancellable(&CancelToken::new())
    }

    /// [`rebalance`](Self::rebalance) with a cancellation token. A
    /// cancelled pass leaves the tree in its last consistent state.
    pub fn rebalance_cancellable(&self, cancel: &CancelToken) -> Result<RebalanceStats> {
        let _gate = self.operation_gate()?;
        let config = self.config.read().clone();
        let strategy = strategy_for(&config);
        update::rebalance(&self.tree, &self.store, &config, strategy.as_ref(), cancel)
    }

    /// Drop tombstones and rebuild densely. Exclusive, like
    /// [`build`](Self::build).
    ///
    /// Surviving vectors are reassigned contiguous ids preserving insertion
    /// order; ids held by callers from before the compaction are
    /// invalidated.
    pub fn compact(&self) -> Result<()> {
        let _gate = self.build_gate.write();
        let config = self.config.read().clone();
        let started = Instant::now();

        let (survivors, dropped) = {
            let store = self.store.read();
            let survivors: Vec<Vec<f32>> = store
                .live_ids()
                .map(|id| store.raw(id).to_vec())
                .collect();
            let dropped = store.total_count() - survivors.len();
            (survivors, dropped)
        };

        let mut store = VectorStore::with_capacity(config.dimension, survivors.len());
        for v in &survivors {
            store.append(v)?;
        }
        let ids: Vec<VectorId> = (0..store.total_count() as VectorId).collect();
        let strategy = strategy_for(&config);
        let nodes = run_on_pool(config.build_threads, || {
            build_tree(&store, ids, strategy.as_ref(), &config, &CancelToken::new())
        })?;

        *self.store.write() = store;
        self.tree.install(nodes);

        info!(
            survivors = survivors.len(),
            dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction complete"
        );
        Ok(())
    }

    /// Number of live vectors.
    pub fn count(&self) -> usize {
        self.store.read().live_count()
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.config.read().dimension
    }

    /// Shape and occupancy counters.
    pub fn stats(&self) -> Result<IndexStats> {
        let _gate = self.operation_gate()?;
        let config = self.config.read();
        let store = self.store.read();
        let (internal_nodes, leaves, max_depth) = self.tree.shape();
        Ok(IndexStats {
            algorithm: config.kind,
            dimension: config.dimension,
            live_vectors: store.live_count(),
            total_vectors: store.total_count(),
            internal_nodes,
            leaves,
            max_depth,
            retired_slots: self.tree.retired_slots(),
        })
    }

    /// Apply a string-encoded parameter. The metric may only change while
    /// the index is empty — the tree's geometry is built in it.
    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        let _gate = self.operation_gate()?;
        if name == "metric" && self.store.read().total_count() > 0 {
            return Err(IndexError::InvalidArgument(
                "metric cannot change on a non-empty index".to_string(),
            ));
        }
        self.config.write().set_parameter(name, value)
    }

    /// Read a parameter back as its string encoding.
    pub fn get_parameter(&self, name: &str) -> Result<String> {
        self.config.read().get_parameter(name)
    }

    /// Write a snapshot of the index into `dir`.
    ///
    /// Tree writers are quiesced while the snapshot is captured so the
    /// saved store and topology agree on membership; concurrent searches
    /// are unaffected. On failure the directory contents are undefined and
    /// must be cleaned before reuse.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let _gate = self.operation_gate()?;
        let config = self.config.read().clone();

        // Capture and encode under the consistency locks (no in-flight
        // two-step inserts, no mid-capture subtree swaps), then release
        // everything before touching the filesystem.
        let bytes = {
            let _mutation = self.mutation_gate.write();
            let _stripes = self.tree.lock_all_stripes();
            let store = self.store.read();
            let nodes = snapshot::capture(&self.tree);

            let manifest = IndexManifest {
                version: FORMAT_VERSION,
                algorithm: config.kind,
                value_type: config.value_type,
                metric: config.metric,
                dimension: config.dimension as u32,
                total_vectors: store.total_count() as u64,
                live_vectors: store.live_count() as u64,
                config,
            };
            snapshot::encode(&manifest, &store, &nodes)?
        };
        snapshot::write(dir.as_ref(), &bytes)
    }

    /// Load an index from a snapshot directory.
    ///
    /// Fails with [`IndexError::VersionMismatch`] for unsupported formats
    /// and [`IndexError::CorruptData`] when checksums or structural
    /// invariants do not hold.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let (manifest, store, nodes) = snapshot::load(dir.as_ref())?;
        debug!(
            algorithm = %manifest.algorithm,
            vectors = manifest.total_vectors,
            "index loaded"
        );

        let index = Self::with_config(manifest.config);
        *index.store.write() = store;
        index.tree.install(nodes);
        Ok(index)
    }
}

/// Run `f` on a dedicated rayon pool of `threads` workers, or inline on
/// the global pool when `threads` is 0.
fn run_on_pool<T: Send>(threads: usize, f: impl FnOnce() -> Result<T> + Send) -> Result<T> {
    if threads == 0 {
        return f();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| IndexError::InvalidArgument(format!("build_threads: {e}")))?;
    pool.install(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                (0..dim)
                    .map(|d| (((i * 37 + d * 13) % 97) as f32) * 0.25)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn create_rejects_unknown_names() {
        assert!(matches!(
            Index::create("XYZ", "Float", 128),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(matches!(
            Index::create("BKT", "Int8", 128),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(Index::create("BKT", "Float", 128).is_ok());
        assert!(Index::create("KDT", "Float", 128).is_ok());
    }

    #[test]
    fn add_then_get_returns_the_vector() {
        let index = Index::create("KDT", "Float", 4).unwrap();
        let v = vec![1.0, 2.0, 3.0, 4.0];
        let id = index.add(&v).unwrap();
        assert_eq!(index.get(id).unwrap(), v);
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn search_validates_k_and_dimension() {
        let index = Index::create("BKT", "Float", 4).unwrap();
        index.add(&[0.0; 4]).unwrap();

        assert!(matches!(
            index.search(&[0.0; 4], 0),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.search(&[0.0; 3], 5),
            Err(IndexError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn build_then_exact_query_finds_itself() {
        let index = Index::create("BKT", "Float", 8).unwrap();
        index.set_parameter("search_budget", "0").unwrap();
        let data = vectors(500, 8);
        index.build(&data).unwrap();

        let results = index.search(&data[42], 10).unwrap();
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].id, 42);
        assert!(results[0].distance.abs() < 1e-6);
    }

    #[test]
    fn build_rejects_ragged_input() {
        let index = Index::create("KDT", "Float", 4).unwrap();
        let mut data = vectors(10, 4);
        data[3] = vec![0.0; 3];
        assert!(matches!(
            index.build(&data),
            Err(IndexError::DimensionMismatch { .. })
        ));
        // Failed build must not have replaced anything.
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn remove_hides_from_search_and_get() {
        let index = Index::create("KDT", "Float", 2).unwrap();
        index.set_parameter("search_budget", "0").unwrap();
        let ids: Vec<VectorId> = (0..10)
            .map(|i| index.add(&[i as f32, 0.0]).unwrap())
            .collect();

        index.remove(ids[3]).unwrap();
        assert!(matches!(index.get(ids[3]), Err(IndexError::NotFound(_))));
        assert!(matches!(index.remove(ids[3]), Err(IndexError::NotFound(_))));

        let results = index.search(&[3.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 9);
        assert!(results.iter().all(|n| n.id != ids[3]));
    }

    #[test]
    fn compact_reclaims_and_reassigns_densely() {
        let index = Index::create("BKT", "Float", 2).unwrap();
        index.set_parameter("search_budget", "0").unwrap();
        for i in 0..20 {
            index.add(&[i as f32, 1.0]).unwrap();
        }
        for id in 0..10 {
            index.remove(id).unwrap();
        }
        index.compact().unwrap();

        let stats = index.stats().unwrap();
        assert_eq!(stats.live_vectors, 10);
        assert_eq!(stats.total_vectors, 10);
        assert_eq!(stats.retired_slots, 0);

        // Survivors keep insertion order: old vector 10 is now id 0.
        assert_eq!(index.get(0).unwrap(), vec![10.0, 1.0]);
    }

    #[test]
    fn cancelled_build_leaves_previous_index() {
        let index = Index::create("BKT", "Float", 4).unwrap();
        index.set_parameter("search_budget", "0").unwrap();
        index.build(&vectors(50, 4)).unwrap();

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            index.build_cancellable(&vectors(2000, 4), &token),
            Err(IndexError::Cancelled)
        ));

        assert_eq!(index.count(), 50);
        assert_eq!(index.search(&vectors(50, 4)[7], 1).unwrap()[0].id, 7);
    }

    #[test]
    fn parameters_round_trip_and_metric_locks_after_data() {
        let index = Index::create("BKT", "Float", 4).unwrap();
        index.set_parameter("metric", "Cosine").unwrap();
        assert_eq!(index.get_parameter("metric").unwrap(), "Cosine");

        index.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            index.set_parameter("metric", "L2"),
            Err(IndexError::InvalidArgument(_))
        ));
    }

    #[test]
    fn stats_reflect_shape() {
        let index = Index::create("KDT", "Float", 4).unwrap();
        index.set_parameter("max_leaf_size", "8").unwrap();
        index.build(&vectors(200, 4)).unwrap();

        let stats = index.stats().unwrap();
        assert_eq!(stats.live_vectors, 200);
        assert!(stats.leaves > 1);
        assert!(stats.internal_nodes >= 1);
        assert!(stats.max_depth >= 2);
        assert_eq!(stats.dimension, 4);
    }

    #[test]
    fn incremental_inserts_after_build_stay_searchable() {
        let index = Index::create("BKT", "Float", 4).unwrap();
        index.set_parameter("search_budget", "0").unwrap();
        index.build(&vectors(100, 4)).unwrap();

        let v = vec![123.0, 456.0, 789.0, 0.5];
        let id = index.add(&v).unwrap();
        assert_eq!(id, 100);

        let results = index.search(&v, 1).unwrap();
        assert_eq!(results[0].id, id);
        assert!(results[0].distance.abs() < 1e-6);
    }
}
