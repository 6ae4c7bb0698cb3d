//! Directory snapshots of an index.
//!
//! A saved index is a directory of three files, each self-describing:
//!
//! ```text
//! <dir>/
//! ├── manifest.json   # format version, algorithm, metric, config, counts
//! ├── vectors.bin     # magic + version + store payload + crc32
//! └── tree.bin        # magic + version + topology payload + crc32
//! ```
//!
//! Binary files carry magic bytes and the format version up front and a
//! CRC32 of their payload at the end. Load refuses unsupported versions
//! (`VersionMismatch`), checksum failures, and structural invariant
//! violations (`CorruptData`): every live id must appear in exactly one
//! leaf, every leaf id must be in range, and the node graph must be a tree
//! rooted at slot 0.
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! *successful* save is internally consistent. A *failed* save leaves the
//! target directory in an undefined state; callers must clean it before
//! reuse.

pub mod format;
pub(crate) mod snapshot;

pub use format::{IndexManifest, FORMAT_VERSION};
