//! copse: mutable approximate nearest-neighbor search over partitioning
//! trees.
//!
//! An [`Index`] owns a flat vector store and a hierarchical partitioning
//! tree in one of two variants:
//!
//! - **BKT** (balanced k-means tree): internal nodes carry per-child
//!   centroids from a seeded k-means split; good when clusters are
//!   direction-shaped and dimensionality is moderate to high.
//! - **KDT** (k-d tree): internal nodes split the highest-variance
//!   coordinate at its median; cheap to build and effective at low
//!   dimensionality.
//!
//! Both variants share everything except split selection: storage, arena,
//! routing, branch-and-bound search, incremental insert, rebalancing, and
//! persistence are one code path.
//!
//! # Mutability without rebuilds
//!
//! Most tree-based ANN structures are build-once: inserting after the bulk
//! build either degrades quickly or is simply unsupported. Here a new
//! vector routes to its best-matching leaf and is published copy-on-write;
//! an overflowing leaf re-splits in place, and a background
//! [`rebalance`](Index::rebalance) pass rebuilds degraded subtrees aside
//! and swaps them in atomically. Readers never block and never see a
//! half-built node — they observe either the old subtree or the new one.
//!
//! # Approximation contract
//!
//! Search is branch-and-bound with an exploration budget
//! (`search_budget` distance computations per query). A finite budget
//! trades recall for latency and may miss true nearest neighbors by
//! design; budget 0 makes traversal exact. Note that only the L2 metric
//! yields valid pruning bounds — under `Cosine` or `InnerProduct` the
//! traversal is ordered best-first but nothing is pruned, and the budget
//! is what bounds work.
//!
//! # Example
//!
//! ```rust
//! use copse::Index;
//!
//! let index = Index::create("BKT", "Float", 4)?;
//! index.build(&vec![vec![0.0, 0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0, 1.0]])?;
//!
//! let id = index.add(&[0.9, 1.0, 1.1, 1.0])?;
//! let hits = index.search(&[1.0, 1.0, 1.0, 1.0], 2)?;
//! assert_eq!(hits.len(), 2);
//! # let _ = id;
//! # Ok::<(), copse::IndexError>(())
//! ```

pub mod cancel;
pub mod config;
pub mod distance;
pub mod error;
pub mod index;
pub mod persistence;
pub mod query;
pub mod simd;
pub mod store;

mod tree;
mod update;

pub use cancel::CancelToken;
pub use config::{IndexConfig, TreeKind, ValueType};
pub use distance::DistanceMetric;
pub use error::{IndexError, Result};
pub use index::{Index, IndexStats};
pub use query::Neighbor;
pub use store::VectorId;
pub use update::RebalanceStats;
