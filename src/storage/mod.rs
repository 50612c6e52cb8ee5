//! The storage contract consumed by the front-end and the sequencing
//! driver.
//!
//! [`LogStorage`] ties the two tiers together: the local index for
//! metadata, queues and Merkle subtrees, and the remote batch store for
//! sequenced leaf bodies. Request handlers open short-lived transactions;
//! the single signer opens one write transaction per integration cycle.

mod read_tx;
mod tree_tx;

pub use read_tx::ReadOnlyLogTreeTx;
pub use tree_tx::LogTreeTx;

use std::future::Future;
use std::sync::Arc;

use crate::admin::{AdminTable, Tree};
use crate::dedup::LeafCache;
use crate::error::StorageError;
use crate::frontier::Frontier;
use crate::local::Local;
use crate::remote::{BatchStore, Remote};
use crate::subtree::SubtreeCache;
use crate::types::{Leaf, QueuedLeaf, SignedLogRoot};

/// Log storage over a local index and a remote batch store.
pub struct LogStorage<S> {
    local: Arc<Local>,
    remote: Arc<Remote<S>>,
    admin: AdminTable,
    dedup: LeafCache,
}

impl<S: BatchStore> LogStorage<S> {
    pub fn new(local: Arc<Local>, remote: Arc<Remote<S>>, admin: AdminTable) -> Self {
        LogStorage {
            local,
            remote,
            admin,
            dedup: LeafCache::new(),
        }
    }

    pub fn local(&self) -> &Arc<Local> {
        &self.local
    }

    pub fn admin(&self) -> &AdminTable {
        &self.admin
    }

    pub fn check_database_accessible(&self) -> Result<(), StorageError> {
        self.local.snapshot().map(|_| ())
    }

    /// A read view not tied to any particular tree.
    pub fn snapshot(&self) -> ReadOnlyLogTx {
        ReadOnlyLogTx {
            active_ids: self.admin.active_log_ids(),
        }
    }

    /// A read transaction over one tree. Fails with `TreeNeedsInit` when
    /// the tree has no stored root yet.
    pub fn snapshot_for_tree(&self, tree_id: i64) -> Result<ReadOnlyLogTreeTx<S>, StorageError> {
        let snapshot = self.local.snapshot()?;
        let (root, front) = snapshot.most_recent_root(tree_id)?;
        Ok(ReadOnlyLogTreeTx {
            local: self.local.clone(),
            remote: self.remote.clone(),
            snapshot,
            subtree_cache: SubtreeCache::new(),
            tree_id,
            root,
            front,
        })
    }

    /// A write transaction over one tree. A tree with no stored root starts
    /// from the zero root, which is how log initialization bootstraps.
    pub fn begin_for_tree(&self, tree_id: i64) -> Result<LogTreeTx<S>, StorageError> {
        let snapshot = self.local.snapshot()?;
        let (root, front) = match snapshot.most_recent_root(tree_id) {
            Ok(found) => found,
            Err(StorageError::TreeNeedsInit(_)) => (SignedLogRoot::default(), Frontier::new()),
            Err(err) => return Err(err),
        };
        let ro = ReadOnlyLogTreeTx {
            local: self.local.clone(),
            remote: self.remote.clone(),
            snapshot,
            subtree_cache: SubtreeCache::new(),
            tree_id,
            root,
            front,
        };
        Ok(LogTreeTx::new(ro, self.dedup.clone()))
    }

    /// Runs `f` inside a fresh write transaction, committing on success and
    /// rolling back on error. The closure returns the transaction so commit
    /// and rollback can consume it.
    pub async fn read_write_transaction<T, F, Fut>(
        &self,
        tree: &Tree,
        f: F,
    ) -> Result<T, StorageError>
    where
        F: FnOnce(LogTreeTx<S>) -> Fut,
        Fut: Future<Output = (LogTreeTx<S>, Result<T, StorageError>)>,
    {
        let tx = self.begin_for_tree(tree.tree_id)?;
        let (tx, result) = f(tx).await;
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// The serving fast path: enqueue submissions without the weight of a
    /// full write transaction. Each result marks whether the submission
    /// duplicated a stored or in-flight leaf.
    pub async fn queue_leaves(
        &self,
        tree: &Tree,
        leaves: Vec<Leaf>,
        queue_timestamp: i64,
    ) -> Result<Vec<QueuedLeaf>, StorageError> {
        let snapshot = self.local.snapshot()?;
        let (root, _) = snapshot.most_recent_root(tree.tree_id)?;

        let mut out = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let submitted = leaf.clone();
            let queued = tree_tx::queue_leaf(
                &self.local,
                &self.remote,
                &self.dedup,
                tree.tree_id,
                root.tree_size,
                leaf,
                queue_timestamp,
            )
            .await?;
            match queued {
                None => out.push(QueuedLeaf {
                    leaf: submitted,
                    duplicate: false,
                }),
                Some(stored) => out.push(QueuedLeaf {
                    leaf: stored,
                    duplicate: true,
                }),
            }
        }
        Ok(out)
    }

    pub fn add_sequenced_leaves(
        &self,
        _tree: &Tree,
        _leaves: &[Leaf],
    ) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented("adding sequenced leaves"))
    }
}

/// A read-only view into the set of configured logs.
pub struct ReadOnlyLogTx {
    active_ids: Vec<i64>,
}

impl ReadOnlyLogTx {
    pub fn get_active_log_ids(&self) -> &[i64] {
        &self.active_ids
    }

    pub fn get_unsequenced_counts(&self) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented("getting unsequenced counts"))
    }
}
