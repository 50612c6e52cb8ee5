//! The local index: metadata and indices on an embedded ordered store.
//!
//! Everything small and frequently read lives here - the latest signed root
//! and frontier, the unsequenced leaf queue, both hash-to-sequence indices,
//! and the Merkle subtree blobs. Reads go through a [`Snapshot`] so one
//! transaction sees one version of the world; writes either happen
//! immediately (freshly queued leaves) or collect into a [`Batch`] that is
//! applied in a single atomic step at commit.

pub(crate) mod keys;

use std::path::Path;

use rand::Rng;
use redb::{Database, TableDefinition};

use crate::error::StorageError;
use crate::frontier::Frontier;
use crate::subtree::{NodeId, Subtree};
use crate::types::{Leaf, LogRootV1, SignedLogRoot};

const STORE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ctlog");

pub struct Local {
    db: Database,
}

impl Local {
    /// Opens (or creates) the index at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = Database::create(path)?;
        // create the table up front so snapshots never race its creation
        let txn = db.begin_write()?;
        txn.open_table(STORE)?;
        txn.commit()?;
        Ok(Local { db })
    }

    /// A stable read view of the whole index.
    pub fn snapshot(&self) -> Result<Snapshot, StorageError> {
        Ok(Snapshot {
            txn: self.db.begin_read()?,
        })
    }

    /// Most-recently committed root and frontier for the tree.
    pub fn most_recent_root(
        &self,
        tree_id: i64,
    ) -> Result<(SignedLogRoot, Frontier), StorageError> {
        self.snapshot()?.most_recent_root(tree_id)
    }

    /// Number of leaves waiting in the tree's queue.
    pub fn unsequenced(&self, tree_id: i64) -> Result<u64, StorageError> {
        self.snapshot()?.unsequenced(tree_id)
    }

    /// Persists freshly queued leaves immediately. Each entry is keyed by the
    /// queue timestamp plus four random bytes, so bursty submissions at the
    /// same nanosecond cannot collide.
    pub fn queue_leaves(
        &self,
        tree_id: i64,
        queue_timestamp: i64,
        leaves: &[Leaf],
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STORE)?;
            let mut rng = rand::thread_rng();
            for leaf in leaves {
                let mut noise = [0u8; 4];
                rng.fill(&mut noise[..]);
                let key = keys::queue_key(tree_id, queue_timestamp, noise);
                let value = serde_cbor::to_vec(leaf)?;
                table.insert(key.as_slice(), value.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Applies all collected writes in one atomic transaction.
    pub fn write(&self, batch: Batch) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STORE)?;
            for op in batch.ops {
                match op {
                    Op::Put(key, value) => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    Op::Delete(key) => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

/// One read transaction over the index.
pub struct Snapshot {
    txn: redb::ReadTransaction,
}

impl Snapshot {
    fn table(&self) -> Result<redb::ReadOnlyTable<&'static [u8], &'static [u8]>, StorageError> {
        Ok(self.txn.open_table(STORE)?)
    }

    /// Most-recently committed root and frontier for the tree, or
    /// `TreeNeedsInit` if the tree has never stored a root.
    pub fn most_recent_root(
        &self,
        tree_id: i64,
    ) -> Result<(SignedLogRoot, Frontier), StorageError> {
        let table = self.table()?;
        let root_raw = match table.get(keys::root_key(tree_id, keys::ROOT_FIELD).as_slice())? {
            Some(guard) => guard.value().to_vec(),
            None => return Err(StorageError::TreeNeedsInit(tree_id)),
        };
        let signature = table
            .get(keys::root_key(tree_id, keys::SIG_FIELD).as_slice())?
            .map(|guard| guard.value().to_vec())
            .unwrap_or_default();
        let front_raw = table
            .get(keys::root_key(tree_id, keys::FRONTIER_FIELD).as_slice())?
            .map(|guard| guard.value().to_vec())
            .unwrap_or_default();

        let root = LogRootV1::from_bytes(&root_raw)?;
        let front = if front_raw.is_empty() {
            Frontier::new()
        } else {
            Frontier::from_bytes(&front_raw)?
        };

        let sth = SignedLogRoot {
            timestamp_nanos: root.timestamp_nanos as i64,
            root_hash: root.root_hash.clone(),
            tree_size: root.tree_size as i64,
            tree_revision: root.revision as i64,
            log_root: root_raw,
            log_root_signature: signature,
        };
        Ok((sth, front))
    }

    /// Sequence numbers for the given Merkle leaf hashes; -1 where absent.
    pub fn sequence_by_merkle_hash(
        &self,
        tree_id: i64,
        hashes: &[Vec<u8>],
    ) -> Result<Vec<i64>, StorageError> {
        self.sequence_by(keys::NS_MERKLE, tree_id, hashes)
    }

    /// Sequence numbers for the given identity hashes; -1 where absent.
    pub fn sequence_by_identity_hash(
        &self,
        tree_id: i64,
        hashes: &[Vec<u8>],
    ) -> Result<Vec<i64>, StorageError> {
        self.sequence_by(keys::NS_IDENTITY, tree_id, hashes)
    }

    fn sequence_by(
        &self,
        ns: u8,
        tree_id: i64,
        hashes: &[Vec<u8>],
    ) -> Result<Vec<i64>, StorageError> {
        let table = self.table()?;
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match table.get(keys::hash_key(ns, tree_id, hash).as_slice())? {
                None => out.push(-1),
                Some(guard) => out.push(keys::decode_varint(guard.value())?),
            }
        }
        Ok(out)
    }

    /// Most recent revision (at or below `revision`) of each subtree.
    /// Missing subtrees are silently elided.
    pub fn subtrees(
        &self,
        tree_id: i64,
        revision: i64,
        ids: &[NodeId],
    ) -> Result<Vec<Subtree>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(subtree) = self.subtree(tree_id, revision, id)? {
                out.push(subtree);
            }
        }
        Ok(out)
    }

    /// Looks up the subtree at `id` with the largest revision at or below
    /// `revision`: seek to the exact rowkey, otherwise step back to the
    /// predecessor and accept it only while it is still above the floor for
    /// this path.
    pub fn subtree(
        &self,
        tree_id: i64,
        revision: i64,
        id: &NodeId,
    ) -> Result<Option<Subtree>, StorageError> {
        let start = keys::subtree_key(tree_id, id, revision)?;
        let floor = keys::subtree_floor(tree_id, id)?;

        let table = self.table()?;
        match table.range(..=start.as_slice())?.next_back() {
            None => Ok(None),
            Some(entry) => {
                let (key, value) = entry?;
                if key.value() >= floor.as_slice() {
                    Ok(Some(Subtree::from_bytes(value.value())?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Number of leaves waiting in the tree's queue.
    pub fn unsequenced(&self, tree_id: i64) -> Result<u64, StorageError> {
        let floor = keys::namespace(keys::NS_QUEUE, tree_id);
        let ceiling = keys::namespace_end(keys::NS_QUEUE, tree_id);
        let table = self.table()?;
        let mut count = 0u64;
        for entry in table.range(floor.as_slice()..ceiling.as_slice())? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Leaves queued at or before `cutoff`, oldest first, with their
    /// rowkeys so the caller can schedule their deletion.
    pub fn queued_leaves(
        &self,
        tree_id: i64,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Leaf)>, StorageError> {
        let floor = keys::namespace(keys::NS_QUEUE, tree_id);
        let ceiling = keys::queue_scan_ceiling(tree_id, cutoff);
        let table = self.table()?;
        let mut out = Vec::new();
        for entry in table.range(floor.as_slice()..ceiling.as_slice())? {
            if out.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            let leaf: Leaf = serde_cbor::from_slice(value.value())?;
            out.push((key.value().to_vec(), leaf));
        }
        Ok(out)
    }
}

enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Pending writes, applied atomically by [`Local::write`]. A failed
/// conversion while queueing an operation surfaces immediately instead of
/// being deferred to commit.
#[derive(Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(Op::Put(key, value));
    }

    pub(crate) fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(Op::Delete(key));
    }

    /// Index entries that let the leaves be found by Merkle or identity
    /// hash; each leaf must already carry its assigned index.
    pub(crate) fn put_sequences(&mut self, tree_id: i64, leaves: &[Leaf]) {
        for leaf in leaves {
            let value = keys::encode_varint(leaf.leaf_index);
            self.put(
                keys::hash_key(keys::NS_MERKLE, tree_id, &leaf.merkle_leaf_hash),
                value.clone(),
            );
            self.put(
                keys::hash_key(keys::NS_IDENTITY, tree_id, &leaf.leaf_identity_hash),
                value,
            );
        }
    }

    /// Serialized subtrees, stored at the given tree revision.
    pub(crate) fn put_subtrees(
        &mut self,
        tree_id: i64,
        revision: i64,
        subtrees: &[&Subtree],
    ) -> Result<(), StorageError> {
        for subtree in subtrees {
            let key = keys::subtree_key(tree_id, &subtree.id()?, revision)?;
            self.put(key, subtree.to_bytes()?);
        }
        Ok(())
    }

    /// The new signed root, its signature, and the frontier it was checked
    /// against.
    pub(crate) fn store_root(
        &mut self,
        tree_id: i64,
        root: &SignedLogRoot,
        front: &Frontier,
    ) -> Result<(), StorageError> {
        self.put(
            keys::root_key(tree_id, keys::ROOT_FIELD),
            root.log_root.clone(),
        );
        self.put(
            keys::root_key(tree_id, keys::SIG_FIELD),
            root.log_root_signature.clone(),
        );
        self.put(
            keys::root_key(tree_id, keys::FRONTIER_FIELD),
            front.to_bytes()?,
        );
        Ok(())
    }
}
