//! End-to-end scenarios for the index boundary operations.

use copse::{Index, IndexError, VectorId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect())
        .collect()
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn unknown_algorithm_fails_with_invalid_argument() {
    let err = Index::create("XYZ", "Float", 128).unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)), "{err:?}");
}

#[test]
fn unknown_value_type_fails_with_invalid_argument() {
    let err = Index::create("BKT", "Double", 128).unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));
}

#[test]
fn both_algorithms_create_and_report_dimension() {
    for algo in ["BKT", "KDT"] {
        let index = Index::create(algo, "Float", 64).expect("create");
        assert_eq!(index.dimension(), 64);
        assert_eq!(index.count(), 0);
    }
}

// =============================================================================
// The canonical scenario: 1000 random 128-dim vectors
// =============================================================================

#[test]
fn build_1000_vectors_query_returns_vector_42_first() {
    for algo in ["BKT", "KDT"] {
        let index = Index::create(algo, "Float", 128).expect("create");
        index.set_parameter("search_budget", "0").unwrap();
        let data = random_vectors(1000, 128, 0xC0FFEE);
        index.build(&data).expect("build");
        assert_eq!(index.count(), 1000);

        let results = index.search(&data[42], 10).expect("search");
        assert_eq!(results.len(), 10, "{algo}");
        assert_eq!(results[0].id, 42, "{algo}: expected exact hit first");
        assert!(
            results[0].distance.abs() < 1e-5,
            "{algo}: expected distance 0, got {}",
            results[0].distance
        );
    }
}

#[test]
fn approximate_mode_still_finds_the_exact_duplicate_usually() {
    let index = Index::create("BKT", "Float", 64).expect("create");
    // Default budget (finite): search must return something reasonable.
    let data = random_vectors(1000, 64, 7);
    index.build(&data).expect("build");

    let results = index.search(&data[10], 5).expect("search");
    assert!(!results.is_empty());
    assert!(results.len() <= 5);
    for pair in results.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
}

// =============================================================================
// Search argument validation
// =============================================================================

#[test]
fn search_with_k_zero_fails_with_invalid_argument() {
    let index = Index::create("KDT", "Float", 16).unwrap();
    index.build(&random_vectors(10, 16, 1)).unwrap();
    let err = index.search(&vec![0.0; 16], 0).unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));
}

#[test]
fn search_with_wrong_dimension_fails() {
    let index = Index::create("BKT", "Float", 16).unwrap();
    index.build(&random_vectors(10, 16, 2)).unwrap();
    let err = index.search(&vec![0.0; 8], 3).unwrap_err();
    assert!(matches!(
        err,
        IndexError::DimensionMismatch {
            expected: 16,
            actual: 8
        }
    ));
}

// =============================================================================
// Result contract
// =============================================================================

#[test]
fn results_sorted_ascending_and_capped_at_k() {
    let index = Index::create("BKT", "Float", 32).unwrap();
    index.set_parameter("search_budget", "0").unwrap();
    index.build(&random_vectors(300, 32, 3)).unwrap();

    let query = random_vectors(1, 32, 4).remove(0);
    let results = index.search(&query, 25).unwrap();
    assert_eq!(results.len(), 25);
    for pair in results.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
}

#[test]
fn exact_mode_returns_min_k_live() {
    let index = Index::create("KDT", "Float", 8).unwrap();
    index.set_parameter("search_budget", "0").unwrap();
    index.build(&random_vectors(7, 8, 5)).unwrap();

    let results = index.search(&vec![0.0; 8], 50).unwrap();
    assert_eq!(results.len(), 7);

    index.remove(2).unwrap();
    let results = index.search(&vec![0.0; 8], 50).unwrap();
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|n| n.id != 2));
}

// =============================================================================
// Vector round-trips and deletion semantics
// =============================================================================

#[test]
fn get_returns_inserted_vector_unchanged_until_deleted() {
    let index = Index::create("BKT", "Float", 6).unwrap();
    let data = random_vectors(40, 6, 6);
    let ids: Vec<VectorId> = data.iter().map(|v| index.add(v).unwrap()).collect();

    for (v, &id) in data.iter().zip(ids.iter()) {
        assert_eq!(&index.get(id).unwrap(), v);
    }

    index.remove(ids[13]).unwrap();
    assert!(matches!(
        index.get(ids[13]),
        Err(IndexError::NotFound(_))
    ));
    // Neighbors unaffected.
    assert_eq!(&index.get(ids[12]).unwrap(), &data[12]);
}

#[test]
fn ids_are_monotone_across_build_and_add() {
    let index = Index::create("KDT", "Float", 4).unwrap();
    index.build(&random_vectors(25, 4, 8)).unwrap();
    assert_eq!(index.add(&[0.5; 4]).unwrap(), 25);
    assert_eq!(index.add(&[0.6; 4]).unwrap(), 26);

    index.remove(25).unwrap();
    // Tombstoned id is not reused.
    assert_eq!(index.add(&[0.7; 4]).unwrap(), 27);
}

// =============================================================================
// Incremental growth and rebalance
// =============================================================================

#[test]
fn heavy_incremental_insertion_keeps_results_exact() {
    let index = Index::create("BKT", "Float", 16).unwrap();
    index.set_parameter("search_budget", "0").unwrap();
    index.set_parameter("max_leaf_size", "16").unwrap();

    let data = random_vectors(600, 16, 9);
    for v in &data {
        index.add(v).unwrap();
    }
    assert_eq!(index.count(), 600);

    let results = index.search(&data[123], 1).unwrap();
    assert_eq!(results[0].id, 123);
    assert!(results[0].distance.abs() < 1e-5);
}

#[test]
fn rebalance_after_deletions_preserves_query_results() {
    let index = Index::create("KDT", "Float", 8).unwrap();
    index.set_parameter("search_budget", "0").unwrap();
    index.set_parameter("max_leaf_size", "8").unwrap();

    let data = random_vectors(400, 8, 10);
    index.build(&data).unwrap();
    for id in (0..200).step_by(2) {
        index.remove(id).unwrap();
    }

    let query = &data[301];
    let before = index.search(query, 10).unwrap();
    index.rebalance().expect("rebalance");
    let after = index.search(query, 10).unwrap();

    let before_ids: Vec<VectorId> = before.iter().map(|n| n.id).collect();
    let after_ids: Vec<VectorId> = after.iter().map(|n| n.id).collect();
    assert_eq!(before_ids, after_ids);
}

#[test]
fn compact_then_search_still_exact() {
    let index = Index::create("BKT", "Float", 12).unwrap();
    index.set_parameter("search_budget", "0").unwrap();
    let data = random_vectors(200, 12, 11);
    index.build(&data).unwrap();
    for id in 0..100 {
        index.remove(id).unwrap();
    }
    index.compact().unwrap();
    assert_eq!(index.count(), 100);

    // Old vector 150 survived; find it by value.
    let results = index.search(&data[150], 1).unwrap();
    assert!(results[0].distance.abs() < 1e-5);
}
