//! The read/write transaction driving queue, sequencing and root updates.

use crate::dedup::LeafCache;
use crate::error::StorageError;
use crate::fsm::{Fsm, State};
use crate::local::{Batch, Local};
use crate::remote::{BatchStore, Remote};
use crate::storage::ReadOnlyLogTreeTx;
use crate::subtree::{Node, NodeId};
use crate::types::{digest_leaves, Hash, Leaf, SignedLogRoot};

/// A write transaction over one tree. The state machine only admits the
/// legal operation orders; local writes collect into a batch that commits
/// atomically, while remote batch uploads happen inline (see `rollback`).
pub struct LogTreeTx<S> {
    ro: ReadOnlyLogTreeTx<S>,
    fsm: Fsm,
    dedup: LeafCache,
    batch: Batch,
    queued_leaves: bool,
    dequeued_digest: Option<Hash>,
}

impl<S: BatchStore> LogTreeTx<S> {
    pub(crate) fn new(ro: ReadOnlyLogTreeTx<S>, dedup: LeafCache) -> Self {
        LogTreeTx {
            ro,
            fsm: Fsm::new(),
            dedup,
            batch: Batch::new(),
            queued_leaves: false,
            dequeued_digest: None,
        }
    }

    pub fn tree_id(&self) -> i64 {
        self.ro.tree_id()
    }

    pub fn latest_signed_log_root(&self) -> &SignedLogRoot {
        self.ro.latest_signed_log_root()
    }

    pub fn read_revision(&self) -> i64 {
        self.ro.read_revision()
    }

    /// The revision that writes through this transaction land at.
    pub fn write_revision(&self) -> i64 {
        self.ro.read_revision() + 1
    }

    pub fn get_sequenced_leaf_count(&self) -> i64 {
        self.ro.get_sequenced_leaf_count()
    }

    pub async fn get_leaves_by_index(
        &mut self,
        indexes: &[i64],
    ) -> Result<Vec<Leaf>, StorageError> {
        self.ro.get_leaves_by_index(indexes).await
    }

    pub async fn get_leaves_by_range(
        &mut self,
        start: i64,
        count: i64,
    ) -> Result<Vec<Leaf>, StorageError> {
        self.ro.get_leaves_by_range(start, count).await
    }

    pub async fn get_leaves_by_hash(
        &mut self,
        leaf_hashes: &[Vec<u8>],
        order_by_sequence: bool,
    ) -> Result<Vec<Leaf>, StorageError> {
        self.ro.get_leaves_by_hash(leaf_hashes, order_by_sequence).await
    }

    pub fn get_merkle_nodes(
        &mut self,
        revision: i64,
        ids: &[NodeId],
    ) -> Result<Vec<Node>, StorageError> {
        self.ro.get_merkle_nodes(revision, ids)
    }

    /// Enqueues leaves for later integration. The returned vector matches
    /// the input: `None` for freshly queued leaves, or the already-stored
    /// leaf a submission duplicates.
    pub async fn queue_leaves(
        &mut self,
        leaves: Vec<Leaf>,
        queue_timestamp: i64,
    ) -> Result<Vec<Option<Leaf>>, StorageError> {
        self.fsm.emit(State::QueueLeaves)?;
        self.queued_leaves = true;

        let mut out = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            out.push(
                queue_leaf(
                    &self.ro.local,
                    &self.ro.remote,
                    &self.dedup,
                    self.ro.tree_id,
                    self.ro.root.tree_size,
                    leaf,
                    queue_timestamp,
                )
                .await?,
            );
        }
        Ok(out)
    }

    /// Takes up to `limit` leaves queued at or before `cutoff`, oldest
    /// first. Their queue entries are deleted when this transaction commits,
    /// so a rollback makes them dequeueable again.
    pub fn dequeue_leaves(
        &mut self,
        limit: usize,
        cutoff: i64,
    ) -> Result<Vec<Leaf>, StorageError> {
        self.fsm.emit(State::DequeueLeaves)?;

        let entries = self
            .ro
            .snapshot
            .queued_leaves(self.ro.tree_id, cutoff, limit)?;

        if self.dequeued_digest.is_some() {
            return Err(StorageError::BadInput(
                "refusing to overwrite previous dequeued checksum".into(),
            ));
        }

        let mut leaves = Vec::with_capacity(entries.len());
        for (key, leaf) in entries {
            self.batch.delete(key);
            leaves.push(leaf);
        }
        self.dequeued_digest = Some(digest_leaves(&leaves));
        tracing::debug!(tree = self.ro.tree_id, count = leaves.len(), "dequeued leaves");
        Ok(leaves)
    }

    /// Stores the dequeued leaves with their assigned sequence numbers:
    /// verifies they are bit-for-bit the leaves handed out by dequeue,
    /// uploads them to the remote batch store, folds their hashes into the
    /// frontier in the order given, and indexes them by both hashes.
    pub async fn update_sequenced_leaves(
        &mut self,
        leaves: &mut [Leaf],
    ) -> Result<(), StorageError> {
        self.fsm.emit(State::UpdateSequencedLeaves)?;

        for leaf in leaves.iter_mut() {
            leaf.integrate_timestamp = 0;
        }
        let sum = digest_leaves(leaves);
        if self.dequeued_digest != Some(sum) {
            return Err(StorageError::ChecksumMismatch);
        }
        self.dequeued_digest = None;

        // remote durability precedes any local index visibility
        self.ro.remote.put_leaves(self.ro.tree_id, leaves).await?;

        for leaf in leaves.iter() {
            let hash: Hash = leaf.merkle_leaf_hash.as_slice().try_into().map_err(|_| {
                StorageError::Codec("merkle leaf hash has the wrong length".into())
            })?;
            self.ro.front.append(hash);
        }
        self.batch.put_sequences(self.ro.tree_id, leaves);
        Ok(())
    }

    /// Writes the given node hashes at this transaction's write revision.
    pub fn set_merkle_nodes(&mut self, nodes: &[Node]) -> Result<(), StorageError> {
        self.fsm.emit(State::SetMerkleNodes)?;

        let revision = self.ro.root.tree_revision + 1;
        let ReadOnlyLogTreeTx {
            snapshot,
            subtree_cache,
            tree_id,
            ..
        } = &mut self.ro;
        let tree_id = *tree_id;
        let snapshot = &*snapshot;
        let mut fetch =
            |wanted: &[NodeId]| snapshot.subtrees(tree_id, revision, wanted);
        for node in nodes {
            subtree_cache.set_node_hash(&node.id, node.hash, &mut fetch)?;
        }
        Ok(())
    }

    /// Stores a freshly signed root, provided it agrees with the frontier.
    pub fn store_signed_log_root(&mut self, root: &SignedLogRoot) -> Result<(), StorageError> {
        self.fsm.emit(State::StoreSignedLogRoot)?;
        if root.root_hash != self.ro.front.head() {
            return Err(StorageError::RootMismatch);
        }
        self.batch.store_root(self.ro.tree_id, root, &self.ro.front)
    }

    pub fn add_sequenced_leaves(&mut self, _leaves: &[Leaf]) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented("adding sequenced leaves"))
    }

    /// Commits the transaction: dirty subtrees are serialized at the write
    /// revision, then the whole batch - queue deletions, index entries,
    /// subtrees and the new root - applies atomically. A queue-only
    /// transaction has nothing left to do; those writes were persisted
    /// synchronously.
    pub fn commit(mut self) -> Result<(), StorageError> {
        self.fsm.emit(State::Commit)?;
        if self.queued_leaves {
            self.fsm.emit(State::Close)?;
            return Ok(());
        }

        let revision = self.ro.root.tree_revision + 1;
        let tree_id = self.ro.tree_id;
        let batch = &mut self.batch;
        self.ro
            .subtree_cache
            .flush(&mut |dirty| batch.put_subtrees(tree_id, revision, dirty))?;

        let batch = std::mem::take(&mut self.batch);
        self.ro.local.write(batch)?;
        self.fsm.emit(State::Close)?;
        Ok(())
    }

    /// Discards the batched local writes. Remote batch uploads are not
    /// undone; the next signer run reproduces them offset-for-offset, and
    /// the merge in `put_leaves` makes that replay a no-op.
    pub fn rollback(mut self) {
        let _ = self.fsm.emit(State::Rollback);
        let _ = self.fsm.emit(State::Close);
    }
}

/// Queues a single leaf, answering duplicates from the in-flight cache
/// first, then from the persisted identity index.
pub(crate) async fn queue_leaf<S: BatchStore>(
    local: &Local,
    remote: &Remote<S>,
    dedup: &LeafCache,
    tree_id: i64,
    tree_size: i64,
    mut leaf: Leaf,
    queue_timestamp: i64,
) -> Result<Option<Leaf>, StorageError> {
    if let Some(cached) = dedup.get(tree_id, &leaf.leaf_identity_hash) {
        return Ok(Some(cached));
    }

    let seqs = local
        .snapshot()?
        .sequence_by_identity_hash(tree_id, std::slice::from_ref(&leaf.leaf_identity_hash))?;
    let seq = seqs[0];
    // TODO: sequence zero is treated as "not present" here, so the first
    // leaf ever sequenced is never deduplicated against the identity index.
    if seq > 0 && seq < tree_size {
        let dup = remote.get_leaves(tree_id, &[seq]).await?;
        return Ok(dup.into_iter().next());
    }

    leaf.leaf_index = -1;
    leaf.queue_timestamp = queue_timestamp;
    leaf.integrate_timestamp = 0;
    local.queue_leaves(tree_id, queue_timestamp, std::slice::from_ref(&leaf))?;
    dedup.insert(tree_id, &leaf);
    Ok(None)
}
