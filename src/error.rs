//! Error types for `copse`.

use thiserror::Error;

use crate::store::VectorId;

/// Errors that can occur during index construction, mutation, search, or
/// persistence.
///
/// Every fallible operation in the crate surfaces one of these; nothing is
/// logged-and-swallowed. Callers must check the result before using any
/// output (ids, result lists, loaded handles).
#[derive(Debug, Error)]
pub enum IndexError {
    /// A caller-supplied argument was rejected (unknown algorithm or value
    /// type name, non-positive `k`, unparseable parameter value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A vector or query length differs from the index dimension.
    #[error("dimension mismatch: index has {expected} dimensions, input has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The id is out of range or refers to a tombstoned vector.
    #[error("vector {0} not found")]
    NotFound(VectorId),

    /// A loaded snapshot violates a structural invariant (bad checksum,
    /// orphan id, id present in more than one leaf).
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// The on-disk format version is not supported by this build.
    #[error("unsupported format version {found} (supported: {supported})")]
    VersionMismatch { supported: u32, found: u32 },

    /// I/O failure during save or load.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was attempted while an exclusive build holds the index.
    #[error("index unavailable: {0}")]
    Unavailable(&'static str),

    /// A build or rebalance was interrupted via its cancellation token.
    /// The tree is left in its last consistent state.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_dimensions() {
        let e = IndexError::DimensionMismatch {
            expected: 128,
            actual: 64,
        };
        let msg = e.to_string();
        assert!(msg.contains("128"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let e: IndexError = io.into();
        assert!(matches!(e, IndexError::Io(_)));
    }
}
