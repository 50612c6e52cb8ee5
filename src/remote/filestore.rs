//! Filesystem batch transport, for development and tests.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{decode_batch, encode_batch, object_name, BatchStore};
use crate::error::StorageError;
use crate::types::Leaf;

/// Stores batch objects as files under a root directory, with the same
/// layout the bucket uses.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root)?;
        Ok(FileStore {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, tree_id: i64, batch: i64) -> PathBuf {
        self.root.join(object_name(tree_id, batch))
    }
}

impl BatchStore for FileStore {
    async fn get_batch(&self, tree_id: i64, batch: i64) -> Result<Vec<Leaf>, StorageError> {
        let path = self.object_path(tree_id, batch);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::LeavesNotFound);
            }
            Err(err) => return Err(err.into()),
        };
        decode_batch(&raw)
    }

    async fn put_batch(
        &self,
        tree_id: i64,
        batch: i64,
        leaves: &[Leaf],
    ) -> Result<(), StorageError> {
        let path = self.object_path(tree_id, batch);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(&encode_batch(leaves)?)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}
