//! The frontier protects the right-most edge of the log's Merkle tree.
//!
//! Only the roots of the maximal perfect subtrees (subtrees with `2^n`
//! leaves) are stored, one optional slot per height. That is enough to fold
//! every future leaf into the tree and to reproduce the current root hash,
//! so the signer can cross-check a proposed tree head without re-reading any
//! leaf.
//!
//! ```text
//!     (*)
//!   /   \
//!  *     *        appending leaf 4 keeps the height-2 root cached
//! / \   / \       and opens a height-0 slot for (4):
//! 0 1 2 3
//!
//!         *
//!       /  \
//!     (*)   (4)
//!   /   \
//!  *     *
//! / \   / \
//! 0 1 2 3
//! ```
//!
//! An append behaves like incrementing a binary counter: the new hash
//! carries upward, merging with each occupied slot, until it lands in an
//! empty one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::types::Hash;

/// RFC 6962 leaf hash: `SHA-256(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    hasher.finalize().into()
}

/// RFC 6962 internal node hash: `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: &[u8], right: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root hash of a tree with no leaves.
pub fn empty_root() -> Hash {
    Sha256::digest([]).into()
}

/// Perfect-subtree roots from height 0 upward; slot `i` covers `2^i` leaves
/// when occupied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontier {
    pub roots: Vec<Option<Hash>>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `h` as the right-most leaf-level node of the tree.
    pub fn append(&mut self, h: Hash) {
        let mut carry = h;
        for slot in self.roots.iter_mut() {
            match slot.take() {
                None => {
                    *slot = Some(carry);
                    return;
                }
                Some(left) => carry = node_hash(&left, &carry),
            }
        }
        self.roots.push(Some(carry));
    }

    /// Current root hash of the tree.
    pub fn head(&self) -> Hash {
        let mut acc: Option<Hash> = None;
        for root in self.roots.iter().flatten() {
            acc = Some(match acc {
                None => *root,
                // higher slots are older, so they sit on the left
                Some(right) => node_hash(root, &right),
            });
        }
        acc.unwrap_or_else(empty_root)
    }

    /// Number of leaves folded in so far.
    pub fn size(&self) -> u64 {
        self.roots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(height, _)| 1u64 << height)
            .sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_cbor::from_slice(raw)?)
    }
}
