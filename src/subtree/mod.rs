//! Merkle internal nodes, grouped into fixed-depth subtrees.
//!
//! A node is addressed by the bit path from the root of a 64-level tree:
//! `prefix_len_bits` leading bits of `path` select it, so a leaf uses all 64
//! bits and the tree root uses none. Nodes are stored in strata of depth 8:
//! the subtree holding a node is named by the whole bytes of its path and
//! the remaining 1-8 bits index the node inside the blob.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::StorageError;
use crate::types::Hash;

/// Depth of one stored stratum of internal nodes.
pub const STRATUM_DEPTH: u8 = 8;

const MAX_PATH_BITS: u8 = 64;

/// Coordinates of one Merkle node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub path: [u8; 8],
    pub prefix_len_bits: u8,
}

impl NodeId {
    pub fn new(path: [u8; 8], prefix_len_bits: u8) -> Result<Self, StorageError> {
        if prefix_len_bits > MAX_PATH_BITS {
            return Err(StorageError::BadInput(format!(
                "invalid node id: bad prefix length {prefix_len_bits}"
            )));
        }
        // bits past the prefix are cleared so equal coordinates compare equal
        let mut masked = [0u8; 8];
        let whole = (prefix_len_bits / 8) as usize;
        masked[..whole].copy_from_slice(&path[..whole]);
        let partial = prefix_len_bits % 8;
        if partial != 0 {
            masked[whole] = path[whole] & (0xffu8 << (8 - partial));
        }
        Ok(NodeId {
            path: masked,
            prefix_len_bits,
        })
    }

    /// Node at `height` above the leaves, covering the `index`-th subtree of
    /// that height.
    pub fn for_tree_coords(height: u8, index: u64) -> Result<Self, StorageError> {
        if height > MAX_PATH_BITS {
            return Err(StorageError::BadInput(format!(
                "invalid node coordinates: height {height}"
            )));
        }
        let out_of_range = match height {
            0 => false,
            64 => index != 0,
            _ => (index >> (MAX_PATH_BITS - height)) != 0,
        };
        if out_of_range {
            return Err(StorageError::BadInput(format!(
                "invalid node coordinates: index {index} at height {height}"
            )));
        }
        let path = if height == 64 {
            [0u8; 8]
        } else {
            (index << height).to_be_bytes()
        };
        NodeId::new(path, MAX_PATH_BITS - height)
    }

    /// Id of the subtree rooted at `prefix` whole bytes of path.
    pub(crate) fn for_subtree_prefix(prefix: &[u8]) -> Result<Self, StorageError> {
        if prefix.len() > 8 {
            return Err(StorageError::BadInput(format!(
                "subtree prefix is too long: {}",
                prefix.len()
            )));
        }
        let mut path = [0u8; 8];
        path[..prefix.len()].copy_from_slice(prefix);
        NodeId::new(path, (prefix.len() * 8) as u8)
    }
}

/// Position of a node relative to its containing subtree: the whole-byte
/// prefix naming the subtree, and the trailing bits packed as
/// `(bit_count << 8) | bits`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Coords {
    prefix: Vec<u8>,
    suffix: u16,
}

fn coords(id: &NodeId) -> Coords {
    if id.prefix_len_bits == 0 {
        return Coords {
            prefix: Vec::new(),
            suffix: 0,
        };
    }
    let prefix_bytes = ((id.prefix_len_bits - 1) / 8) as usize;
    let suffix_bits = id.prefix_len_bits - (prefix_bytes as u8) * 8;
    let raw = id.path[prefix_bytes];
    let bits = if suffix_bits == 8 {
        raw
    } else {
        raw & (0xffu8 << (8 - suffix_bits))
    };
    Coords {
        prefix: id.path[..prefix_bytes].to_vec(),
        suffix: ((suffix_bits as u16) << 8) | bits as u16,
    }
}

/// One stored stratum: the node hashes of a depth-8 region, keyed by their
/// in-subtree suffix.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtree {
    #[serde(with = "serde_bytes")]
    pub prefix: Vec<u8>,
    pub depth: u8,
    pub nodes: BTreeMap<u16, ByteBuf>,
}

impl Subtree {
    fn empty(prefix: Vec<u8>) -> Self {
        Subtree {
            prefix,
            depth: STRATUM_DEPTH,
            nodes: BTreeMap::new(),
        }
    }

    pub(crate) fn id(&self) -> Result<NodeId, StorageError> {
        NodeId::for_subtree_prefix(&self.prefix)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_cbor::from_slice(raw)?)
    }
}

/// A Merkle node hash at a coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub hash: Hash,
}

/// Loads whole subtrees on demand; returns only the subtrees that exist.
pub(crate) type SubtreeFetch<'a> =
    dyn FnMut(&[NodeId]) -> Result<Vec<Subtree>, StorageError> + 'a;

/// Read-through cache over the stored subtrees of one transaction. Writes
/// mutate the cached blobs in place; `flush` hands the dirty ones back to the
/// store at the transaction's write revision.
#[derive(Default)]
pub struct SubtreeCache {
    subtrees: HashMap<Vec<u8>, Subtree>,
    dirty: HashSet<Vec<u8>>,
}

impl SubtreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes for `ids`, in input order. Nodes with no stored hash are
    /// silently elided.
    pub fn get_nodes(
        &mut self,
        ids: &[NodeId],
        fetch: &mut SubtreeFetch,
    ) -> Result<Vec<Node>, StorageError> {
        self.load_missing(ids, fetch)?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let at = coords(id);
            let Some(subtree) = self.subtrees.get(&at.prefix) else {
                continue;
            };
            if let Some(raw) = subtree.nodes.get(&at.suffix) {
                let hash: Hash = raw.as_ref().try_into().map_err(|_| {
                    StorageError::Corrupt("stored node hash has the wrong length".into())
                })?;
                out.push(Node { id: *id, hash });
            }
        }
        Ok(out)
    }

    /// Writes one node hash, pulling the containing subtree through `fetch`
    /// first so the untouched nodes of the blob survive the next flush.
    pub fn set_node_hash(
        &mut self,
        id: &NodeId,
        hash: Hash,
        fetch: &mut SubtreeFetch,
    ) -> Result<(), StorageError> {
        self.load_missing(std::slice::from_ref(id), fetch)?;

        let at = coords(id);
        let subtree = self
            .subtrees
            .entry(at.prefix.clone())
            .or_insert_with(|| Subtree::empty(at.prefix.clone()));
        subtree.nodes.insert(at.suffix, ByteBuf::from(hash.to_vec()));
        self.dirty.insert(at.prefix);
        Ok(())
    }

    fn load_missing(
        &mut self,
        ids: &[NodeId],
        fetch: &mut SubtreeFetch,
    ) -> Result<(), StorageError> {
        let mut wanted = Vec::new();
        let mut prefixes = Vec::new();
        for id in ids {
            let at = coords(id);
            if self.subtrees.contains_key(&at.prefix) || prefixes.contains(&at.prefix) {
                continue;
            }
            wanted.push(NodeId::for_subtree_prefix(&at.prefix)?);
            prefixes.push(at.prefix);
        }
        if wanted.is_empty() {
            return Ok(());
        }

        for fetched in fetch(&wanted)? {
            self.subtrees.insert(fetched.prefix.clone(), fetched);
        }
        // remember the misses as empty strata so repeated lookups stay local
        for prefix in prefixes {
            self.subtrees
                .entry(prefix.clone())
                .or_insert_with(|| Subtree::empty(prefix));
        }
        Ok(())
    }

    /// Hands every dirty subtree to `store` and marks the cache clean.
    pub fn flush(
        &mut self,
        store: &mut dyn FnMut(&[&Subtree]) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let dirty: Vec<&Subtree> = self
            .dirty
            .iter()
            .filter_map(|prefix| self.subtrees.get(prefix))
            .collect();
        store(&dirty)?;
        self.dirty.clear();
        Ok(())
    }
}
