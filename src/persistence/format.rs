//! On-disk format: magic bytes, version, manifest, and the little-endian
//! primitives the binary sections are written with.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::config::{IndexConfig, TreeKind, ValueType};
use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};

/// Magic bytes opening `vectors.bin`.
pub const STORE_MAGIC: [u8; 4] = *b"CPVS";

/// Magic bytes opening `tree.bin`.
pub const TREE_MAGIC: [u8; 4] = *b"CPTR";

/// Current snapshot format version.
pub const FORMAT_VERSION: u32 = 1;

/// File names within a snapshot directory.
pub const MANIFEST_FILE: &str = "manifest.json";
pub const STORE_FILE: &str = "vectors.bin";
pub const TREE_FILE: &str = "tree.bin";

/// Human-readable snapshot metadata, saved as JSON.
///
/// The manifest is read first on load; its `version` gates everything else,
/// and its counts cross-check the binary payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Snapshot format version.
    pub version: u32,
    /// Tree variant.
    pub algorithm: TreeKind,
    /// Component value type.
    pub value_type: ValueType,
    /// Distance metric.
    pub metric: DistanceMetric,
    /// Vector dimension.
    pub dimension: u32,
    /// Total store slots including tombstones.
    pub total_vectors: u64,
    /// Live vectors.
    pub live_vectors: u64,
    /// Full index configuration at save time.
    pub config: IndexConfig,
}

impl IndexManifest {
    /// Reject manifests this build cannot read.
    pub fn check_version(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(IndexError::VersionMismatch {
                supported: FORMAT_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

// Little-endian primitives. The binary sections are fixed-layout; there is
// no schema evolution inside a version, only across versions.

pub(crate) fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}

pub(crate) fn write_u16<W: Write>(w: &mut W, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_f32<W: Write>(w: &mut W, v: f32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}
