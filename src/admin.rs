//! The in-memory table of trees this process serves.
//!
//! Tree descriptors come from the config file at startup; there is no
//! runtime tree administration.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StorageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeState {
    Active,
    Frozen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Ecdsa,
    Ed25519,
}

/// Descriptor of one log tree.
#[derive(Clone, Debug)]
pub struct Tree {
    pub tree_id: i64,
    pub state: TreeState,
    pub signature_algorithm: SignatureAlgorithm,
    pub max_root_duration: Duration,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

pub struct AdminTable {
    trees: HashMap<i64, Tree>,
}

impl AdminTable {
    pub fn new(trees: Vec<Tree>) -> Self {
        AdminTable {
            trees: trees.into_iter().map(|tree| (tree.tree_id, tree)).collect(),
        }
    }

    pub fn tree(&self, tree_id: i64) -> Result<&Tree, StorageError> {
        self.trees
            .get(&tree_id)
            .ok_or_else(|| StorageError::BadInput(format!("unknown tree id: {tree_id}")))
    }

    /// Ids of all active trees, in stable order.
    pub fn active_log_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .trees
            .values()
            .filter(|tree| tree.state == TreeState::Active)
            .map(|tree| tree.tree_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn create_tree(&self) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented("creating trees"))
    }

    pub fn update_tree(&self) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented("updating trees"))
    }

    pub fn delete_tree(&self) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented("deleting trees"))
    }
}
