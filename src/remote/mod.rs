//! The remote batch store: sequenced leaf bodies on cheap bulk storage.
//!
//! Leaves are grouped into batches of 1024 consecutive sequence numbers and
//! stored as one JSON object per batch, named `leaves-<treeID>/<batch_hex>`.
//! [`Remote`] owns the batch semantics - grouping, offset verification and
//! the merge-with-existing upload path - while [`BatchStore`] implementations
//! only move blobs.

mod b2;
mod filestore;

pub use b2::B2Store;
pub use filestore::FileStore;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::types::Leaf;

/// Number of leaves in one stored batch.
pub const LEAVES_PER_BATCH: i64 = 1024;

/// Object name of one batch, e.g. `leaves-42/1f`.
pub(crate) fn object_name(tree_id: i64, batch: i64) -> String {
    format!("leaves-{}/{:x}", tree_id, batch)
}

/// Wire form of a sequenced leaf. The field names and the standard base64
/// alphabet are part of the stored format; timestamps are not persisted
/// remotely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredLeaf {
    #[serde(rename = "MerkleLeafHash", with = "b64")]
    merkle_leaf_hash: Vec<u8>,
    #[serde(rename = "LeafValue", with = "b64")]
    leaf_value: Vec<u8>,
    #[serde(rename = "ExtraData", with = "b64")]
    extra_data: Vec<u8>,
    #[serde(rename = "LeafIndex")]
    leaf_index: i64,
    #[serde(rename = "LeafIdentityHash", with = "b64")]
    leaf_identity_hash: Vec<u8>,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

impl From<&Leaf> for StoredLeaf {
    fn from(leaf: &Leaf) -> Self {
        StoredLeaf {
            merkle_leaf_hash: leaf.merkle_leaf_hash.clone(),
            leaf_value: leaf.leaf_value.clone(),
            extra_data: leaf.extra_data.clone(),
            leaf_index: leaf.leaf_index,
            leaf_identity_hash: leaf.leaf_identity_hash.clone(),
        }
    }
}

impl From<StoredLeaf> for Leaf {
    fn from(stored: StoredLeaf) -> Self {
        Leaf {
            merkle_leaf_hash: stored.merkle_leaf_hash,
            leaf_value: stored.leaf_value,
            extra_data: stored.extra_data,
            leaf_index: stored.leaf_index,
            leaf_identity_hash: stored.leaf_identity_hash,
            queue_timestamp: 0,
            integrate_timestamp: 0,
        }
    }
}

pub(crate) fn encode_batch(leaves: &[Leaf]) -> Result<Vec<u8>, StorageError> {
    let stored: Vec<StoredLeaf> = leaves.iter().map(StoredLeaf::from).collect();
    Ok(serde_json::to_vec(&stored)?)
}

pub(crate) fn decode_batch(raw: &[u8]) -> Result<Vec<Leaf>, StorageError> {
    let stored: Vec<StoredLeaf> = serde_json::from_slice(raw)?;
    Ok(stored.into_iter().map(Leaf::from).collect())
}

/// Transport for batch blobs.
#[allow(async_fn_in_trait)]
pub trait BatchStore {
    /// Fetches one batch. `LeavesNotFound` when the object does not exist.
    async fn get_batch(&self, tree_id: i64, batch: i64) -> Result<Vec<Leaf>, StorageError>;

    /// Replaces one batch.
    async fn put_batch(
        &self,
        tree_id: i64,
        batch: i64,
        leaves: &[Leaf],
    ) -> Result<(), StorageError>;
}

/// Batch semantics over any [`BatchStore`] transport.
pub struct Remote<S> {
    store: S,
}

impl<S: BatchStore> Remote<S> {
    pub fn new(store: S) -> Self {
        Remote { store }
    }

    /// Fetches the leaves with the given sequence numbers, each required
    /// batch read once, returned in ascending sequence order.
    pub async fn get_leaves(
        &self,
        tree_id: i64,
        seqs: &[i64],
    ) -> Result<Vec<Leaf>, StorageError> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        for &seq in seqs {
            if seq < 0 {
                return Err(StorageError::BadInput(format!("{seq} is a bad leaf index")));
            }
        }
        let mut sorted = seqs.to_vec();
        sorted.sort_unstable();

        let mut out = Vec::with_capacity(sorted.len());
        let mut at = 0usize;
        while at < sorted.len() {
            let batch = sorted[at] / LEAVES_PER_BATCH;
            let mut offset = (sorted[at] % LEAVES_PER_BATCH) as usize;
            let data = self.store.get_batch(tree_id, batch).await?;
            loop {
                if offset >= data.len() {
                    return Err(StorageError::Truncated(batch));
                }
                out.push(data[offset].clone());
                at += 1;
                offset += 1;
                if at < sorted.len() && offset < data.len() && sorted[at - 1] + 1 == sorted[at] {
                    continue;
                }
                break;
            }
        }
        Ok(out)
    }

    /// Stores sequenced leaves, merging with whatever each touched batch
    /// already holds. Re-storing an identical leaf at an occupied offset is
    /// a no-op, so a crashed run can safely repeat its uploads; a different
    /// leaf at an occupied offset is corruption and is rejected.
    pub async fn put_leaves(&self, tree_id: i64, leaves: &[Leaf]) -> Result<(), StorageError> {
        let mut batches: BTreeMap<i64, Vec<&Leaf>> = BTreeMap::new();
        for leaf in leaves {
            if leaf.leaf_index < 0 {
                return Err(StorageError::BadInput(format!(
                    "{} is a bad leaf index",
                    leaf.leaf_index
                )));
            }
            batches
                .entry(leaf.leaf_index / LEAVES_PER_BATCH)
                .or_default()
                .push(leaf);
        }

        for (batch, new_leaves) in batches {
            let existing = match self.store.get_batch(tree_id, batch).await {
                Ok(have) => have,
                Err(StorageError::LeavesNotFound) => Vec::new(),
                Err(err) => return Err(err),
            };

            let mut positions: BTreeMap<i64, &Leaf> = BTreeMap::new();
            for leaf in &existing {
                positions.insert(leaf.leaf_index % LEAVES_PER_BATCH, leaf);
            }
            for leaf in new_leaves {
                let offset = leaf.leaf_index % LEAVES_PER_BATCH;
                match positions.get(&offset) {
                    None => {
                        positions.insert(offset, leaf);
                    }
                    Some(have) if StoredLeaf::from(*have) == StoredLeaf::from(leaf) => {}
                    Some(_) => return Err(StorageError::DuplicateOffset(leaf.leaf_index)),
                }
            }

            // the merged batch must be contiguous from offset zero
            let mut updated = Vec::with_capacity(positions.len());
            for (want, (&offset, leaf)) in positions.iter().enumerate() {
                if offset != want as i64 {
                    return Err(StorageError::Gap(batch));
                }
                updated.push((*leaf).clone());
            }

            self.store.put_batch(tree_id, batch, &updated).await?;
        }
        Ok(())
    }
}
