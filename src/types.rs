//! Core data types shared across the storage tiers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::frontier;

pub type Hash = [u8; 32];

/// One entry of the log: the TLS-encoded leaf payload, the submitted chain,
/// and the two hashes it is indexed under.
///
/// `leaf_index` is -1 until the signer sequences the leaf.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    #[serde(with = "serde_bytes")]
    pub merkle_leaf_hash: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub leaf_value: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub extra_data: Vec<u8>,
    pub leaf_index: i64,
    #[serde(with = "serde_bytes")]
    pub leaf_identity_hash: Vec<u8>,
    pub queue_timestamp: i64,
    pub integrate_timestamp: i64,
}

impl Leaf {
    /// Builds an unsequenced leaf, deriving the RFC 6962 Merkle hash and the
    /// identity hash from the payload.
    pub fn new(leaf_value: Vec<u8>, extra_data: Vec<u8>) -> Self {
        let merkle_leaf_hash = frontier::leaf_hash(&leaf_value).to_vec();
        let leaf_identity_hash = Sha256::digest(&leaf_value).to_vec();
        Leaf {
            merkle_leaf_hash,
            leaf_value,
            extra_data,
            leaf_index: -1,
            leaf_identity_hash,
            queue_timestamp: 0,
            integrate_timestamp: 0,
        }
    }
}

/// Digest over a run of leaves, used to verify that the leaves handed back by
/// the sequencing driver are the leaves handed out by dequeue.
///
/// `leaf_index` is assigned between dequeue and update, so it stays out of
/// the digest; every other field is length-prefixed and folded in order.
pub(crate) fn digest_leaves(leaves: &[Leaf]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update((leaves.len() as u64).to_be_bytes());
    for leaf in leaves {
        for field in [
            &leaf.leaf_value,
            &leaf.extra_data,
            &leaf.merkle_leaf_hash,
            &leaf.leaf_identity_hash,
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(leaf.queue_timestamp.to_be_bytes());
        hasher.update(leaf.integrate_timestamp.to_be_bytes());
    }
    hasher.finalize().into()
}

/// The unsigned log root, serialized into `SignedLogRoot::log_root`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRootV1 {
    pub tree_size: u64,
    #[serde(with = "serde_bytes")]
    pub root_hash: Vec<u8>,
    pub timestamp_nanos: u64,
    pub revision: u64,
}

impl LogRootV1 {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_cbor::from_slice(raw)?)
    }
}

/// A log root together with its signature. `log_root` holds the serialized
/// `LogRootV1` the signature covers; the remaining fields are decoded from it
/// for convenience.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedLogRoot {
    pub timestamp_nanos: i64,
    pub root_hash: Vec<u8>,
    pub tree_size: i64,
    pub tree_revision: i64,
    pub log_root: Vec<u8>,
    pub log_root_signature: Vec<u8>,
}

/// Outcome of queueing one leaf: either the submission itself, or the
/// previously stored leaf it duplicates.
#[derive(Clone, Debug)]
pub struct QueuedLeaf {
    pub leaf: Leaf,
    pub duplicate: bool,
}

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_leaf() -> Leaf {
        let mut leaf = Leaf::new(b"certificate".to_vec(), b"chain".to_vec());
        leaf.queue_timestamp = 12345;
        leaf
    }

    #[test]
    fn test_leaf_cbor_roundtrip() {
        let leaf = sample_leaf();
        let raw = serde_cbor::to_vec(&leaf).unwrap();
        let back: Leaf = serde_cbor::from_slice(&raw).unwrap();
        assert_eq!(leaf, back);
    }

    #[test]
    fn test_digest_ignores_leaf_index() {
        let mut a = sample_leaf();
        let mut b = sample_leaf();
        a.leaf_index = -1;
        b.leaf_index = 700;
        assert_eq!(
            digest_leaves(std::slice::from_ref(&a)),
            digest_leaves(std::slice::from_ref(&b)),
        );
    }

    #[test]
    fn test_digest_covers_payload() {
        let a = sample_leaf();
        let mut b = sample_leaf();
        b.leaf_value[0] ^= 1;
        assert_ne!(
            digest_leaves(std::slice::from_ref(&a)),
            digest_leaves(std::slice::from_ref(&b)),
        );

        let mut c = sample_leaf();
        c.integrate_timestamp = 1;
        assert_ne!(
            digest_leaves(std::slice::from_ref(&a)),
            digest_leaves(std::slice::from_ref(&c)),
        );
    }

    #[test]
    fn test_log_root_roundtrip() {
        let root = LogRootV1 {
            tree_size: 42,
            root_hash: vec![7; 32],
            timestamp_nanos: 1_000_000_000,
            revision: 9,
        };
        let raw = root.to_bytes().unwrap();
        assert_eq!(LogRootV1::from_bytes(&raw).unwrap(), root);
    }
}
