//! The sequencing driver: drains the queue and publishes new signed roots.
//!
//! One signer runs per deployment. Each cycle dequeues a batch, assigns
//! sequence numbers in dequeue order, writes the leaves and every Merkle
//! node the appends create, and finishes with a signed root that the
//! transaction cross-checks against its own frontier before committing.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signer as _, SigningKey};

use crate::admin::{Tree, TreeState};
use crate::config::SignerConfig;
use crate::error::StorageError;
use crate::frontier::{empty_root, node_hash, Frontier};
use crate::quota::{QuotaManager, Spec};
use crate::remote::BatchStore;
use crate::storage::{LogStorage, LogTreeTx};
use crate::subtree::{Node, NodeId};
use crate::types::{now_nanos, Hash, LogRootV1, SignedLogRoot};

/// How long the master holds its lease: effectively forever, because the
/// deployment runs a single signer and leadership is never contended.
pub const MASTER_HOLD_NANOS: i64 = i64::MAX;

/// The election hook. A no-op that always claims mastership; the type
/// exists so a contended deployment has a seam to replace.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopElection;

impl NoopElection {
    pub fn is_master(&self) -> bool {
        true
    }

    pub fn hold_interval(&self) -> Duration {
        Duration::from_nanos(MASTER_HOLD_NANOS as u64)
    }
}

pub struct Sequencer<S> {
    storage: Arc<LogStorage<S>>,
    quota: Arc<QuotaManager>,
    config: SignerConfig,
    key: SigningKey,
    election: NoopElection,
}

impl<S: BatchStore> Sequencer<S> {
    pub fn new(
        storage: Arc<LogStorage<S>>,
        quota: Arc<QuotaManager>,
        config: SignerConfig,
        key: SigningKey,
    ) -> Self {
        Sequencer {
            storage,
            quota,
            config,
            key,
            election: NoopElection,
        }
    }

    /// Writes the signed empty-tree root for a tree with no stored state.
    pub async fn init_log(&self, tree: &Tree) -> Result<(), StorageError> {
        let root = sign_root(&self.key, 0, empty_root().to_vec(), 0)?;
        self.storage
            .read_write_transaction(tree, |mut tx| async move {
                let result = tx.store_signed_log_root(&root);
                (tx, result)
            })
            .await?;
        tracing::info!(tree = tree.tree_id, "initialized log");
        Ok(())
    }

    /// Runs one integration cycle; returns the number of leaves sequenced.
    pub async fn integrate_once(&self, tree: &Tree) -> Result<usize, StorageError> {
        let batch_size = self.config.batch_size;
        let cutoff = now_nanos() - self.config.guard_window.as_nanos() as i64;
        let key = &self.key;

        let sequenced = self
            .storage
            .read_write_transaction(tree, |mut tx| async move {
                let result = integrate(&mut tx, batch_size, cutoff, key).await;
                (tx, result)
            })
            .await?;

        if sequenced > 0 {
            // leaves left the queue, so their admission tokens come back
            let spec = [Spec::tree_write(tree.tree_id)];
            if let Err(err) = self.quota.put_tokens(sequenced as i64, &spec) {
                tracing::warn!(tree = tree.tree_id, %err, "failed to return quota tokens");
            }
        }
        Ok(sequenced)
    }

    /// The periodic signing loop; runs until the surrounding task is
    /// dropped or aborted.
    pub async fn run(&self, trees: &[Tree]) {
        let mut ticker = tokio::time::interval(self.config.run_interval);
        loop {
            ticker.tick().await;
            if !self.election.is_master() {
                continue;
            }
            for tree in trees {
                if tree.state != TreeState::Active {
                    continue;
                }
                match self.integrate_once(tree).await {
                    Ok(0) => {}
                    Ok(count) => {
                        tracing::info!(tree = tree.tree_id, leaves = count, "sequenced leaves");
                    }
                    Err(err) => {
                        tracing::error!(tree = tree.tree_id, %err, "integration cycle failed");
                    }
                }
            }
        }
    }
}

async fn integrate<S: BatchStore>(
    tx: &mut LogTreeTx<S>,
    batch_size: usize,
    cutoff: i64,
    key: &SigningKey,
) -> Result<usize, StorageError> {
    let root = tx.latest_signed_log_root().clone();
    let mut leaves = tx.dequeue_leaves(batch_size, cutoff)?;
    if leaves.is_empty() {
        return Ok(0);
    }

    // Rebuild the compact right edge from the node hashes on disk rather
    // than trusting any in-memory state; a crashed run then reproduces the
    // exact same appends, and the root check at the end stays a real guard.
    let mut front = stored_frontier(tx, root.tree_size, root.tree_revision)?;

    let integrate_timestamp = now_nanos();
    let mut updates = Vec::new();
    for (i, leaf) in leaves.iter_mut().enumerate() {
        leaf.leaf_index = root.tree_size + i as i64;
        leaf.integrate_timestamp = integrate_timestamp;
        let hash: Hash = leaf
            .merkle_leaf_hash
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::Codec("merkle leaf hash has the wrong length".into()))?;
        append_tracking(&mut front, leaf.leaf_index as u64, hash, &mut updates)?;
    }

    tx.update_sequenced_leaves(&mut leaves).await?;
    tx.set_merkle_nodes(&updates)?;

    let new_size = (root.tree_size + leaves.len() as i64) as u64;
    let new_root = sign_root(key, new_size, front.head().to_vec(), (root.tree_revision + 1) as u64)?;
    tracing::debug!(
        tree = tx.tree_id(),
        size = new_size,
        root = %hex::encode(&new_root.root_hash),
        "publishing new signed root",
    );
    tx.store_signed_log_root(&new_root)?;
    Ok(leaves.len())
}

fn sign_root(
    key: &SigningKey,
    tree_size: u64,
    root_hash: Vec<u8>,
    revision: u64,
) -> Result<SignedLogRoot, StorageError> {
    let inner = LogRootV1 {
        tree_size,
        root_hash: root_hash.clone(),
        timestamp_nanos: now_nanos() as u64,
        revision,
    };
    let encoded = inner.to_bytes()?;
    let signature = key.sign(&encoded).to_vec();
    Ok(SignedLogRoot {
        timestamp_nanos: inner.timestamp_nanos as i64,
        root_hash,
        tree_size: tree_size as i64,
        tree_revision: revision as i64,
        log_root: encoded,
        log_root_signature: signature,
    })
}

/// The perfect-subtree roots of a tree of `size` leaves, read back from the
/// stored nodes at `revision`.
fn stored_frontier<S: BatchStore>(
    tx: &mut LogTreeTx<S>,
    size: i64,
    revision: i64,
) -> Result<Frontier, StorageError> {
    let size = size as u64;
    let mut heights = Vec::new();
    let mut ids = Vec::new();
    for height in 0..64u32 {
        if size >> height == 0 {
            break;
        }
        if (size >> height) & 1 == 1 {
            // leaves to the left of this subtree are the higher bits of size
            let index = ((size >> height) >> 1) << 1;
            heights.push(height as usize);
            ids.push(NodeId::for_tree_coords(height as u8, index)?);
        }
    }
    if ids.is_empty() {
        return Ok(Frontier::new());
    }

    let nodes = tx.get_merkle_nodes(revision, &ids)?;
    if nodes.len() != ids.len() {
        return Err(StorageError::Corrupt(
            "stored tree is missing frontier nodes".into(),
        ));
    }

    let mut roots = vec![None; heights[heights.len() - 1] + 1];
    for (height, node) in heights.into_iter().zip(nodes) {
        roots[height] = Some(node.hash);
    }
    Ok(Frontier { roots })
}

/// Appends `hash` for leaf `index` and records every node the append
/// creates: the leaf-level node plus one internal node per carry.
fn append_tracking(
    front: &mut Frontier,
    index: u64,
    hash: Hash,
    updates: &mut Vec<Node>,
) -> Result<(), StorageError> {
    updates.push(Node {
        id: NodeId::for_tree_coords(0, index)?,
        hash,
    });

    let mut carry = hash;
    let mut height = 0u8;
    for slot in front.roots.iter_mut() {
        match slot.take() {
            None => {
                *slot = Some(carry);
                return Ok(());
            }
            Some(left) => {
                carry = node_hash(&left, &carry);
                height += 1;
                updates.push(Node {
                    id: NodeId::for_tree_coords(height, index >> height)?,
                    hash: carry,
                });
            }
        }
    }
    front.roots.push(Some(carry));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontier::leaf_hash;

    #[test]
    fn test_append_tracking_matches_frontier() {
        let mut tracked = Frontier::new();
        let mut plain = Frontier::new();
        let mut updates = Vec::new();

        for index in 0u64..13 {
            let hash = leaf_hash(&index.to_be_bytes());
            append_tracking(&mut tracked, index, hash, &mut updates).unwrap();
            plain.append(hash);
            assert_eq!(tracked, plain);
        }
        // 13 leaves plus one internal node per carry; appending n leaves
        // carries n - popcount(n) times
        assert_eq!(updates.len(), 13 + 10);
    }

    #[test]
    fn test_append_tracking_node_coordinates() {
        let mut front = Frontier::new();
        let mut updates = Vec::new();
        for index in 0u64..4 {
            append_tracking(&mut front, index, leaf_hash(&[index as u8]), &mut updates).unwrap();
        }

        let ids: Vec<(u8, [u8; 8])> = updates
            .iter()
            .map(|node| (node.id.prefix_len_bits, node.id.path))
            .collect();
        assert_eq!(
            ids,
            vec![
                (64, 0u64.to_be_bytes()),
                (64, 1u64.to_be_bytes()),
                (63, 0u64.to_be_bytes()), // node (height 1, index 0)
                (64, 2u64.to_be_bytes()),
                (64, 3u64.to_be_bytes()),
                (63, 2u64.to_be_bytes()), // node (height 1, index 1)
                (62, 0u64.to_be_bytes()), // node (height 2, index 0)
            ],
        );

        // the recorded internal hashes are the RFC 6962 parents
        let expected = node_hash(&leaf_hash(&[0]), &leaf_hash(&[1]));
        assert_eq!(updates[2].hash, expected);
    }

    #[test]
    fn test_signed_root_verifies() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let root = sign_root(&key, 5, vec![9; 32], 2).unwrap();
        assert_eq!(root.tree_size, 5);
        assert_eq!(root.tree_revision, 2);

        use ed25519_dalek::Verifier;
        let signature =
            ed25519_dalek::Signature::from_slice(&root.log_root_signature).unwrap();
        key.verifying_key().verify(&root.log_root, &signature).unwrap();

        let decoded = LogRootV1::from_bytes(&root.log_root).unwrap();
        assert_eq!(decoded.tree_size, 5);
        assert_eq!(decoded.root_hash, vec![9; 32]);
    }

    #[test]
    fn test_election_defaults() {
        let election = NoopElection;
        assert!(election.is_master());
        assert_eq!(
            election.hold_interval(),
            Duration::from_nanos(i64::MAX as u64),
        );
    }
}
