//! Backpressure between the serving path and the signer.
//!
//! The manager tracks how many leaves each tree has queued but not yet
//! sequenced. Admission charges tokens against that count; the signer
//! returns them as it drains the queue, and a background watcher per tree
//! periodically re-reads the true count from the local index so drift
//! cannot accumulate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::StorageError;
use crate::local::Local;

const WATCH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecGroup {
    Global,
    Tree,
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecKind {
    Read,
    Write,
}

/// What a token request is charged against. Only `(Tree, Write)` specs are
/// tracked; everything else is admitted unconditionally.
#[derive(Clone, Copy, Debug)]
pub struct Spec {
    pub group: SpecGroup,
    pub kind: SpecKind,
    pub tree_id: i64,
}

impl Spec {
    pub fn tree_write(tree_id: i64) -> Self {
        Spec {
            group: SpecGroup::Tree,
            kind: SpecKind::Write,
            tree_id,
        }
    }
}

pub struct QuotaManager {
    max_unsequenced_leaves: i64,
    unsequenced: Mutex<HashMap<i64, i64>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl QuotaManager {
    pub fn new(max_unsequenced_leaves: i64) -> Self {
        QuotaManager {
            max_unsequenced_leaves,
            unsequenced: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Starts tracking `tree_id` and spawns a task that keeps the tracked
    /// count in step with the queue on disk.
    pub fn watch_log(self: &Arc<Self>, local: Arc<Local>, tree_id: i64) {
        self.unsequenced.lock().insert(tree_id, 0);

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;

                let sth = match local.most_recent_root(tree_id) {
                    Ok((root, _)) => root,
                    Err(StorageError::TreeNeedsInit(_)) => continue,
                    Err(err) => {
                        tracing::warn!(tree = tree_id, %err, "error getting the most recent STH");
                        continue;
                    }
                };
                let count = match local.unsequenced(tree_id) {
                    Ok(count) => count as i64,
                    Err(err) => {
                        tracing::warn!(tree = tree_id, %err, "error getting the unsequenced count");
                        continue;
                    }
                };
                tracing::debug!(
                    tree = tree_id,
                    tree_size = sth.tree_size,
                    unsequenced = count,
                    "quota watcher",
                );
                manager.unsequenced.lock().insert(tree_id, count);
            }
        });
        self.watchers.lock().push(handle);
    }

    /// Acquires `tokens` for every spec, in order. Fails without charging
    /// the spec that would overflow.
    pub fn get_tokens(&self, tokens: i64, specs: &[Spec]) -> Result<(), StorageError> {
        let mut unsequenced = self.unsequenced.lock();
        for spec in specs {
            if spec.group != SpecGroup::Tree || spec.kind != SpecKind::Write {
                continue;
            }
            let count = unsequenced.get_mut(&spec.tree_id).ok_or_else(|| {
                StorageError::BadInput(format!("unknown tree id: {}", spec.tree_id))
            })?;
            if *count + tokens > self.max_unsequenced_leaves {
                return Err(StorageError::QuotaExceeded);
            }
            *count += tokens;
        }
        Ok(())
    }

    /// Returns `tokens` for every spec, clamping the count at zero.
    pub fn put_tokens(&self, tokens: i64, specs: &[Spec]) -> Result<(), StorageError> {
        let mut unsequenced = self.unsequenced.lock();
        for spec in specs {
            if spec.group != SpecGroup::Tree || spec.kind != SpecKind::Write {
                continue;
            }
            let count = unsequenced.get_mut(&spec.tree_id).ok_or_else(|| {
                StorageError::BadInput(format!("unknown tree id: {}", spec.tree_id))
            })?;
            *count = (*count - tokens).max(0);
        }
        Ok(())
    }

    pub fn peek_tokens(&self, _specs: &[Spec]) -> Result<HashMap<i64, i64>, StorageError> {
        Err(StorageError::Unimplemented("peeking into the quota"))
    }

    pub fn reset_quota(&self, _specs: &[Spec]) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented("resetting the quota"))
    }

    /// Stops every watcher task.
    pub fn shutdown(&self) {
        for handle in self.watchers.lock().drain(..) {
            handle.abort();
        }
    }
}
