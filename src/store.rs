//! Contiguous vector storage with tombstone deletion.
//!
//! Vectors live in one flat `Vec<f32>` (structure-of-arrays) addressed by
//! `id * dimension`. Ids are assigned in insertion order and stay valid for
//! the lifetime of the store: growth may reallocate the backing buffer, but
//! ids are offsets, not pointers. Deletion is logical — the slot is
//! tombstoned and the id is never handed out again until
//! [`crate::Index::compact`] rebuilds the store.

use crate::error::{IndexError, Result};

/// Identifier of a stored vector, assigned monotonically at insertion order
/// and stable across save/load.
pub type VectorId = u32;

/// Per-vector bookkeeping kept alongside the raw components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VectorMeta {
    /// Tombstone flag; a deleted vector keeps its slot until compaction.
    pub deleted: bool,
    /// Bumped on every state change of the slot. Persisted so a reloaded
    /// store resumes where it left off.
    pub version: u32,
}

/// Flat storage of fixed-dimension vectors.
#[derive(Debug)]
pub struct VectorStore {
    data: Vec<f32>,
    meta: Vec<VectorMeta>,
    dimension: usize,
    live: usize,
}

impl VectorStore {
    /// Create an empty store for vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            data: Vec::new(),
            meta: Vec::new(),
            dimension,
            live: 0,
        }
    }

    /// Create a store with room for `capacity` vectors pre-allocated.
    pub fn with_capacity(dimension: usize, capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(dimension * capacity),
            meta: Vec::with_capacity(capacity),
            dimension,
            live: 0,
        }
    }

    /// Append a vector, returning its id.
    ///
    /// O(1) amortized; never invalidates previously returned ids.
    pub fn append(&mut self, vector: &[f32]) -> Result<VectorId> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if self.meta.len() > VectorId::MAX as usize {
            return Err(IndexError::InvalidArgument(
                "vector id space exhausted".to_string(),
            ));
        }
        let id = self.meta.len() as VectorId;
        self.data.extend_from_slice(vector);
        self.meta.push(VectorMeta {
            deleted: false,
            version: 0,
        });
        self.live += 1;
        Ok(id)
    }

    /// Fetch a live vector by id.
    pub fn get(&self, id: VectorId) -> Result<&[f32]> {
        match self.meta.get(id as usize) {
            Some(m) if !m.deleted => Ok(self.raw(id)),
            _ => Err(IndexError::NotFound(id)),
        }
    }

    /// Fetch a vector's components regardless of tombstone state.
    ///
    /// Callers must have bounds-checked `id`; used by tree internals that
    /// already hold a leaf membership proof.
    pub(crate) fn raw(&self, id: VectorId) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.data[start..start + self.dimension]
    }

    /// Tombstone a vector. Fails with `NotFound` if the id is out of range
    /// or already deleted.
    pub fn delete(&mut self, id: VectorId) -> Result<()> {
        match self.meta.get_mut(id as usize) {
            Some(m) if !m.deleted => {
                m.deleted = true;
                m.version += 1;
                self.live -= 1;
                Ok(())
            }
            _ => Err(IndexError::NotFound(id)),
        }
    }

    /// Whether the id refers to a live (non-tombstoned, in-range) vector.
    #[inline]
    pub fn is_live(&self, id: VectorId) -> bool {
        self.meta
            .get(id as usize)
            .is_some_and(|m| !m.deleted)
    }

    /// Number of live vectors.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Total slots including tombstones.
    #[inline]
    pub fn total_count(&self) -> usize {
        self.meta.len()
    }

    /// Vector dimension.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Iterate over live ids in insertion order.
    pub fn live_ids(&self) -> impl Iterator<Item = VectorId> + '_ {
        self.meta
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.deleted)
            .map(|(i, _)| i as VectorId)
    }

    /// Raw parts for the persistence layer.
    pub(crate) fn as_parts(&self) -> (&[f32], &[VectorMeta]) {
        (&self.data, &self.meta)
    }

    /// Reassemble a store from persisted parts.
    pub(crate) fn from_parts(dimension: usize, data: Vec<f32>, meta: Vec<VectorMeta>) -> Result<Self> {
        if data.len() != meta.len() * dimension {
            return Err(IndexError::CorruptData(format!(
                "vector payload holds {} floats but metadata describes {} vectors of dimension {}",
                data.len(),
                meta.len(),
                dimension
            )));
        }
        let live = meta.iter().filter(|m| !m.deleted).count();
        Ok(Self {
            data,
            meta,
            dimension,
            live,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_get_round_trip() {
        let mut store = VectorStore::new(3);
        let id = store.append(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(id, 0);
        assert_eq!(store.get(id).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(store.live_count(), 1);
    }

    #[test]
    fn ids_are_insertion_ordered() {
        let mut store = VectorStore::new(2);
        for i in 0..10 {
            let id = store.append(&[i as f32, 0.0]).unwrap();
            assert_eq!(id, i);
        }
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let mut store = VectorStore::new(3);
        let err = store.append(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn delete_tombstones_without_reuse() {
        let mut store = VectorStore::new(2);
        let a = store.append(&[0.0, 0.0]).unwrap();
        store.delete(a).unwrap();

        assert!(matches!(store.get(a), Err(IndexError::NotFound(0))));
        assert!(matches!(store.delete(a), Err(IndexError::NotFound(0))));
        assert_eq!(store.live_count(), 0);
        assert_eq!(store.total_count(), 1);

        // The tombstoned slot is not handed out again.
        let b = store.append(&[1.0, 1.0]).unwrap();
        assert_eq!(b, 1);
    }

    #[test]
    fn growth_keeps_earlier_ids_valid() {
        let mut store = VectorStore::with_capacity(4, 1);
        let first = store.append(&[9.0, 8.0, 7.0, 6.0]).unwrap();
        for i in 0..1000 {
            store.append(&[i as f32; 4]).unwrap();
        }
        assert_eq!(store.get(first).unwrap(), &[9.0, 8.0, 7.0, 6.0]);
    }

    #[test]
    fn live_ids_skip_tombstones() {
        let mut store = VectorStore::new(1);
        for i in 0..5 {
            store.append(&[i as f32]).unwrap();
        }
        store.delete(1).unwrap();
        store.delete(3).unwrap();
        let live: Vec<VectorId> = store.live_ids().collect();
        assert_eq!(live, vec![0, 2, 4]);
    }

    #[test]
    fn from_parts_validates_shape() {
        let meta = vec![
            VectorMeta {
                deleted: false,
                version: 0
            };
            2
        ];
        assert!(VectorStore::from_parts(3, vec![0.0; 5], meta.clone()).is_err());
        let store = VectorStore::from_parts(3, vec![0.0; 6], meta).unwrap();
        assert_eq!(store.live_count(), 2);
    }
}
