//! Snapshot writer/reader for the vector store and tree topology.
//!
//! The writer serializes a *captured* topology: a contiguous node list with
//! the root at index 0, produced while writers are quiesced (the `Index`
//! holds every stripe during capture). The reader decodes, checksums, and
//! then validates the structural invariants before handing anything back.

use std::path::Path;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::persistence::format::{
    read_f32, read_u16, read_u32, read_u64, read_u8, write_f32, write_u16, write_u32, write_u64,
    write_u8, IndexManifest, FORMAT_VERSION, MANIFEST_FILE, STORE_FILE, STORE_MAGIC, TREE_FILE,
    TREE_MAGIC,
};
use crate::store::{VectorId, VectorMeta, VectorStore};
use crate::tree::{Node, Splitter, Tree, ROOT_SLOT};

const DELETED_FLAG: u8 = 0b0000_0001;

/// Capture the published topology as a contiguous node list (root first,
/// preorder), remapping arena slots to dense indices.
///
/// Caller must have quiesced writers; a capture taken mid-swap could pair a
/// store state with a topology that disagrees about membership.
pub(crate) fn capture(tree: &Tree) -> Vec<Arc<Node>> {
    fn walk(tree: &Tree, slot: u32, out: &mut Vec<Arc<Node>>) -> u32 {
        let node = tree.arena.load(slot);
        let index = out.len() as u32;
        out.push(node.clone());
        if let Node::Internal { splitter, children } = &*node {
            let mapped: SmallVec<[u32; 8]> = children
                .iter()
                .map(|&child| walk(tree, child, out))
                .collect();
            out[index as usize] = Arc::new(Node::Internal {
                splitter: splitter.clone(),
                children: mapped,
            });
        }
        index
    }

    let mut out = Vec::new();
    walk(tree, ROOT_SLOT, &mut out);
    out
}

/// A fully-encoded snapshot, ready to hit disk.
///
/// Encoding is separated from writing so the `Index` can serialize under
/// its consistency locks and release them before any file I/O.
pub(crate) struct SnapshotBytes {
    manifest_json: Vec<u8>,
    store_frame: Vec<u8>,
    tree_frame: Vec<u8>,
    vectors: usize,
    nodes: usize,
}

/// Serialize a snapshot into memory.
pub(crate) fn encode(
    manifest: &IndexManifest,
    store: &VectorStore,
    nodes: &[Arc<Node>],
) -> Result<SnapshotBytes> {
    let manifest_json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| IndexError::CorruptData(format!("manifest encode: {e}")))?;
    Ok(SnapshotBytes {
        manifest_json,
        store_frame: frame(STORE_MAGIC, encode_store(store)?),
        tree_frame: frame(TREE_MAGIC, encode_tree(nodes, store.dimension())?),
        vectors: store.total_count(),
        nodes: nodes.len(),
    })
}

/// Write an encoded snapshot into `dir`.
///
/// On error the directory contents are undefined; each individual file is
/// written to a temporary sibling and renamed, so files are never half-
/// written, but the set may be incomplete.
pub(crate) fn write(dir: &Path, bytes: &SnapshotBytes) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_atomic(&dir.join(MANIFEST_FILE), &bytes.manifest_json)?;
    write_atomic(&dir.join(STORE_FILE), &bytes.store_frame)?;
    write_atomic(&dir.join(TREE_FILE), &bytes.tree_frame)?;

    debug!(
        path = %dir.display(),
        vectors = bytes.vectors,
        nodes = bytes.nodes,
        "snapshot saved"
    );
    Ok(())
}


/// Read and validate a snapshot from `dir`.
pub(crate) fn load(dir: &Path) -> Result<(IndexManifest, VectorStore, Vec<Arc<Node>>)> {
    let manifest_bytes = std::fs::read(dir.join(MANIFEST_FILE))?;
    let manifest: IndexManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| IndexError::CorruptData(format!("manifest decode: {e}")))?;
    manifest.check_version()?;

    let store_payload = read_frame(&dir.join(STORE_FILE), STORE_MAGIC)?;
    let store = decode_store(&store_payload, &manifest)?;

    let tree_payload = read_frame(&dir.join(TREE_FILE), TREE_MAGIC)?;
    let nodes = decode_tree(&tree_payload, manifest.dimension as usize)?;

    validate(&store, &nodes)?;

    debug!(
        path = %dir.display(),
        vectors = store.total_count(),
        nodes = nodes.len(),
        "snapshot loaded"
    );
    Ok((manifest, store, nodes))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Wrap a payload as `magic + version + payload + crc32(payload)`.
fn frame(magic: [u8; 4], payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(&magic);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    let checksum = crc32fast::hash(&payload);
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

fn read_frame(path: &Path, magic: [u8; 4]) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 12 {
        return Err(IndexError::CorruptData(format!(
            "{} is truncated ({} bytes)",
            path.display(),
            bytes.len()
        )));
    }
    if bytes[..4] != magic {
        return Err(IndexError::CorruptData(format!(
            "{} has wrong magic bytes",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(IndexError::VersionMismatch {
            supported: FORMAT_VERSION,
            found: version,
        });
    }
    let payload = &bytes[8..bytes.len() - 4];
    let stored = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    let actual = crc32fast::hash(payload);
    if stored != actual {
        return Err(IndexError::CorruptData(format!(
            "{} checksum mismatch (expected {stored:#010x}, got {actual:#010x})",
            path.display()
        )));
    }
    Ok(payload.to_vec())
}

fn encode_store(store: &VectorStore) -> Result<Vec<u8>> {
    let (data, meta) = store.as_parts();
    let mut out = Vec::with_capacity(16 + meta.len() * 5 + data.len() * 4);
    write_u32(&mut out, store.dimension() as u32)?;
    write_u64(&mut out, meta.len() as u64)?;
    for m in meta {
        write_u8(&mut out, if m.deleted { DELETED_FLAG } else { 0 })?;
        write_u32(&mut out, m.version)?;
    }
    for &x in data {
        write_f32(&mut out, x)?;
    }
    Ok(out)
}

fn decode_store(payload: &[u8], manifest: &IndexManifest) -> Result<VectorStore> {
    let mut r = std::io::Cursor::new(payload);
    let dimension = read_u32(&mut r)? as usize;
    let total = read_u64(&mut r)? as usize;

    if dimension != manifest.dimension as usize {
        return Err(IndexError::CorruptData(format!(
            "store dimension {dimension} disagrees with manifest {}",
            manifest.dimension
        )));
    }
    if total != manifest.total_vectors as usize {
        return Err(IndexError::CorruptData(format!(
            "store holds {total} vectors but manifest declares {}",
            manifest.total_vectors
        )));
    }

    let mut meta = Vec::with_capacity(total);
    for _ in 0..total {
        let flags = read_u8(&mut r)?;
        let version = read_u32(&mut r)?;
        meta.push(VectorMeta {
            deleted: flags & DELETED_FLAG != 0,
            version,
        });
    }

    let mut data = Vec::with_capacity(total * dimension);
    for _ in 0..total * dimension {
        data.push(read_f32(&mut r)?);
    }

    let store = VectorStore::from_parts(dimension, data, meta)?;
    if store.live_count() != manifest.live_vectors as usize {
        return Err(IndexError::CorruptData(format!(
            "store has {} live vectors but manifest declares {}",
            store.live_count(),
            manifest.live_vectors
        )));
    }
    Ok(store)
}

const NODE_TAG_INTERNAL: u8 = 1;
const NODE_TAG_LEAF: u8 = 2;
const SPLIT_TAG_CENTROIDS: u8 = 1;
const SPLIT_TAG_COORDINATE: u8 = 2;

fn encode_tree(nodes: &[Arc<Node>], dimension: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_u32(&mut out, nodes.len() as u32)?;
    for node in nodes {
        match &**node {
            Node::Internal { splitter, children } => {
                write_u8(&mut out, NODE_TAG_INTERNAL)?;
                match splitter {
                    Splitter::Centroids { centroids, radii } => {
                        write_u8(&mut out, SPLIT_TAG_CENTROIDS)?;
                        write_u16(&mut out, centroids.len() as u16)?;
                        for c in centroids {
                            debug_assert_eq!(c.len(), dimension);
                            for &x in c {
                                write_f32(&mut out, x)?;
                            }
                        }
                        for &r in radii {
                            write_f32(&mut out, r)?;
                        }
                    }
                    Splitter::Coordinate { dim, threshold } => {
                        write_u8(&mut out, SPLIT_TAG_COORDINATE)?;
                        write_u32(&mut out, *dim)?;
                        write_f32(&mut out, *threshold)?;
                    }
                }
                write_u16(&mut out, children.len() as u16)?;
                for &child in children {
                    write_u32(&mut out, child)?;
                }
            }
            Node::Leaf { ids } => {
                write_u8(&mut out, NODE_TAG_LEAF)?;
                write_u32(&mut out, ids.len() as u32)?;
                for &id in ids {
                    write_u32(&mut out, id)?;
                }
            }
        }
    }
    Ok(out)
}

fn decode_tree(payload: &[u8], dimension: usize) -> Result<Vec<Arc<Node>>> {
    let mut r = std::io::Cursor::new(payload);
    let count = read_u32(&mut r)? as usize;
    if count == 0 {
        return Err(IndexError::CorruptData("tree has no nodes".to_string()));
    }

    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = read_u8(&mut r)?;
        let node = match tag {
            NODE_TAG_INTERNAL => {
                let splitter = match read_u8(&mut r)? {
                    SPLIT_TAG_CENTROIDS => {
                        let k = read_u16(&mut r)? as usize;
                        let mut centroids = Vec::with_capacity(k);
                        for _ in 0..k {
                            let mut c = Vec::with_capacity(dimension);
                            for _ in 0..dimension {
                                c.push(read_f32(&mut r)?);
                            }
                            centroids.push(c);
                        }
                        let mut radii = Vec::with_capacity(k);
                        for _ in 0..k {
                            radii.push(read_f32(&mut r)?);
                        }
                        Splitter::Centroids { centroids, radii }
                    }
                    SPLIT_TAG_COORDINATE => {
                        let dim = read_u32(&mut r)?;
                        if dim as usize >= dimension {
                            return Err(IndexError::CorruptData(format!(
                                "split coordinate {dim} out of range for dimension {dimension}"
                            )));
                        }
                        let threshold = read_f32(&mut r)?;
                        Splitter::Coordinate { dim, threshold }
                    }
                    other => {
                        return Err(IndexError::CorruptData(format!(
                            "unknown splitter tag {other}"
                        )))
                    }
                };
                let child_count = read_u16(&mut r)? as usize;
                if child_count != splitter.child_count() {
                    return Err(IndexError::CorruptData(format!(
                        "internal node lists {child_count} children but its splitter partitions {}",
                        splitter.child_count()
                    )));
                }
                let mut children = SmallVec::with_capacity(child_count);
                for _ in 0..child_count {
                    let child = read_u32(&mut r)?;
                    if child as usize >= count {
                        return Err(IndexError::CorruptData(format!(
                            "child reference {child} out of range ({count} nodes)"
                        )));
                    }
                    children.push(child);
                }
                Node::Internal { splitter, children }
            }
            NODE_TAG_LEAF => {
                let n = read_u32(&mut r)? as usize;
                let mut ids = Vec::with_capacity(n);
                for _ in 0..n {
                    ids.push(read_u32(&mut r)?);
                }
                Node::Leaf { ids }
            }
            other => {
                return Err(IndexError::CorruptData(format!("unknown node tag {other}")))
            }
        };
        nodes.push(Arc::new(node));
    }
    Ok(nodes)
}

/// Enforce the structural invariants a snapshot must satisfy:
/// the node list is a tree rooted at 0, and store and leaves agree on
/// membership (every live id in exactly one leaf, every leaf id in range).
fn validate(store: &VectorStore, nodes: &[Arc<Node>]) -> Result<()> {
    // Tree-ness: every non-root node referenced exactly once, reachable
    // from the root, no cycles (guaranteed by single-reference + rootedness).
    let mut ref_counts = vec![0u32; nodes.len()];
    for node in nodes {
        if let Node::Internal { children, .. } = &**node {
            for &child in children {
                if child as usize >= nodes.len() {
                    return Err(IndexError::CorruptData(format!(
                        "child reference {child} out of range"
                    )));
                }
                ref_counts[child as usize] += 1;
            }
        }
    }
    if ref_counts[0] != 0 {
        return Err(IndexError::CorruptData(
            "root node is referenced as a child".to_string(),
        ));
    }
    for (slot, &refs) in ref_counts.iter().enumerate().skip(1) {
        if refs != 1 {
            return Err(IndexError::CorruptData(format!(
                "node {slot} referenced {refs} times (expected exactly once)"
            )));
        }
    }

    // Membership: occurrences of each id across leaves.
    let total = store.total_count();
    let mut occurrences = vec![0u32; total];
    for node in nodes {
        if let Node::Leaf { ids } = &**node {
            for &id in ids {
                if id as usize >= total {
                    return Err(IndexError::CorruptData(format!(
                        "leaf references id {id} beyond store size {total}"
                    )));
                }
                occurrences[id as usize] += 1;
            }
        }
    }
    for id in 0..total as VectorId {
        let occ = occurrences[id as usize];
        if store.is_live(id) {
            if occ != 1 {
                return Err(IndexError::CorruptData(format!(
                    "live id {id} appears in {occ} leaves (expected exactly one)"
                )));
            }
        } else if occ > 1 {
            return Err(IndexError::CorruptData(format!(
                "tombstoned id {id} appears in {occ} leaves"
            )));
        }
    }
    Ok(())
}
