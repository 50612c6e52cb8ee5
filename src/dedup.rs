//! In-flight leaf deduplication.
//!
//! Leaves that have been queued but not yet integrated into a signed root
//! are invisible to the persisted identity index, so a short-lived cache
//! answers resubmissions in the meantime. Once a leaf is sequenced the index
//! takes over and the cached entry is simply left to expire.

use std::time::Duration;

use crate::types::Leaf;

const CAPACITY: u64 = 75_000;
const TTL: Duration = Duration::from_secs(60 * 60);

/// Process-wide cache of recently queued leaves, keyed by tree id and leaf
/// identity hash. Inserts and hits hand out owned copies, so callers can
/// never mutate a cached entry.
#[derive(Clone)]
pub struct LeafCache {
    leaves: moka::sync::Cache<(i64, Vec<u8>), Leaf>,
}

impl LeafCache {
    pub fn new() -> Self {
        LeafCache {
            leaves: moka::sync::Cache::builder()
                .max_capacity(CAPACITY)
                .time_to_live(TTL)
                .build(),
        }
    }

    pub(crate) fn insert(&self, tree_id: i64, leaf: &Leaf) {
        self.leaves
            .insert((tree_id, leaf.leaf_identity_hash.clone()), leaf.clone());
    }

    pub(crate) fn get(&self, tree_id: i64, identity_hash: &[u8]) -> Option<Leaf> {
        self.leaves.get(&(tree_id, identity_hash.to_vec()))
    }
}

impl Default for LeafCache {
    fn default() -> Self {
        Self::new()
    }
}
