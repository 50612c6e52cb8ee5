//! Read-only views over one tree.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageError;
use crate::frontier::Frontier;
use crate::local::{Local, Snapshot};
use crate::remote::{BatchStore, Remote};
use crate::subtree::{Node, NodeId, SubtreeCache};
use crate::types::{Leaf, SignedLogRoot};

/// A read transaction over one tree: the root and frontier cached at open,
/// a stable snapshot of the local index, and a lazily-filled cache of the
/// Merkle subtrees backing it.
pub struct ReadOnlyLogTreeTx<S> {
    pub(crate) local: Arc<Local>,
    pub(crate) remote: Arc<Remote<S>>,
    pub(crate) snapshot: Snapshot,
    pub(crate) subtree_cache: SubtreeCache,

    pub(crate) tree_id: i64,
    pub(crate) root: SignedLogRoot,
    pub(crate) front: Frontier,
}

impl<S: BatchStore> ReadOnlyLogTreeTx<S> {
    pub fn tree_id(&self) -> i64 {
        self.tree_id
    }

    /// The most recent signed root, as of transaction open.
    pub fn latest_signed_log_root(&self) -> &SignedLogRoot {
        &self.root
    }

    /// The tree revision current when this transaction started.
    pub fn read_revision(&self) -> i64 {
        self.root.tree_revision
    }

    /// Total number of leaves integrated into the tree.
    pub fn get_sequenced_leaf_count(&self) -> i64 {
        self.root.tree_size
    }

    /// Leaf data for a set of sequenced indexes, verified against the
    /// level-0 node hashes the signer stored. Disagreement means the remote
    /// data is corrupt and fails the whole read.
    pub async fn get_leaves_by_index(
        &mut self,
        indexes: &[i64],
    ) -> Result<Vec<Leaf>, StorageError> {
        for &index in indexes {
            if index < 0 {
                return Err(StorageError::BadInput(format!(
                    "{index} is a bad leaf index"
                )));
            }
            if index >= self.root.tree_size {
                return Err(StorageError::BadInput(format!(
                    "there is no leaf with index {index} yet"
                )));
            }
        }

        // leaves come back in ascending order; verify in the same order
        let leaves = self.remote.get_leaves(self.tree_id, indexes).await?;
        let mut sorted = indexes.to_vec();
        sorted.sort_unstable();
        let mut ids = Vec::with_capacity(sorted.len());
        for &index in &sorted {
            ids.push(NodeId::for_tree_coords(0, index as u64)?);
        }
        let nodes = self.get_merkle_nodes(self.root.tree_revision, &ids)?;

        for (i, leaf) in leaves.iter().enumerate() {
            match nodes.get(i) {
                Some(node) if node.hash[..] == leaf.merkle_leaf_hash[..] => {}
                _ => return Err(StorageError::MerkleMismatch(sorted[i])),
            }
        }
        Ok(leaves)
    }

    /// Leaf data for a contiguous range, clamped to the tree size.
    pub async fn get_leaves_by_range(
        &mut self,
        start: i64,
        count: i64,
    ) -> Result<Vec<Leaf>, StorageError> {
        if start < 0 || count < 1 {
            return Err(StorageError::BadInput(format!(
                "invalid leaf range: start {start}, count {count}"
            )));
        }
        let stop = start.saturating_add(count).min(self.root.tree_size);
        let indexes: Vec<i64> = (start..stop).collect();
        self.get_leaves_by_index(&indexes).await
    }

    /// Leaf data looked up by Merkle leaf hash. Hashes that map to nothing,
    /// or to indexes outside the current tree, are silently dropped; the
    /// remaining leaves come back in the order their hashes were given.
    pub async fn get_leaves_by_hash(
        &mut self,
        leaf_hashes: &[Vec<u8>],
        _order_by_sequence: bool,
    ) -> Result<Vec<Leaf>, StorageError> {
        let looked_up = self
            .snapshot
            .sequence_by_merkle_hash(self.tree_id, leaf_hashes)?;
        let indexes: Vec<i64> = looked_up
            .iter()
            .copied()
            .filter(|&index| index >= 0 && index < self.root.tree_size)
            .collect();

        // the remote returns leaves in ascending sequence order no matter
        // how the lookups resolved, so fetched[k] belongs to the k-th
        // smallest requested index; match leaves back by index value
        let fetched = self.remote.get_leaves(self.tree_id, &indexes).await?;
        let mut sorted = indexes;
        sorted.sort_unstable();
        let mut by_index: HashMap<i64, Leaf> = HashMap::with_capacity(fetched.len());
        for (index, leaf) in sorted.into_iter().zip(fetched) {
            by_index.insert(index, leaf);
        }

        // each returned leaf must carry the hash it was looked up by
        let mut out = Vec::with_capacity(by_index.len());
        for (i, &index) in looked_up.iter().enumerate() {
            if index < 0 || index >= self.root.tree_size {
                continue;
            }
            match by_index.get(&index) {
                Some(leaf) if leaf.merkle_leaf_hash == leaf_hashes[i] => {
                    out.push(leaf.clone());
                }
                _ => return Err(StorageError::MerkleMismatch(index)),
            }
        }
        Ok(out)
    }

    /// Node hashes at the given coordinates, read at `revision`. Nodes with
    /// no stored hash are elided.
    pub fn get_merkle_nodes(
        &mut self,
        revision: i64,
        ids: &[NodeId],
    ) -> Result<Vec<Node>, StorageError> {
        let ReadOnlyLogTreeTx {
            snapshot,
            subtree_cache,
            tree_id,
            ..
        } = self;
        let tree_id = *tree_id;
        let snapshot = &*snapshot;
        subtree_cache.get_nodes(ids, &mut |wanted: &[NodeId]| {
            snapshot.subtrees(tree_id, revision, wanted)
        })
    }
}
