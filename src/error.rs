//! Error kinds surfaced by the storage core.

use thiserror::Error;

use crate::fsm::State;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Storage holds no state for this tree; the caller should run log
    /// initialization before serving it.
    #[error("tree {0} has not been initialized")]
    TreeNeedsInit(i64),

    #[error("illegal transition blocked: {from} -> {to}")]
    IllegalTransition { from: State, to: State },

    /// The leaves handed to `update_sequenced_leaves` are not the leaves
    /// handed out by `dequeue_leaves`.
    #[error("leaf checksum does not match")]
    ChecksumMismatch,

    /// The proposed signed root disagrees with the frontier.
    #[error("root hash does not match what is expected")]
    RootMismatch,

    /// Data read from the remote store disagrees with the stored Merkle
    /// node hashes. Fatal for the read; indicates corruption.
    #[error("leaf at index {0} doesn't have the expected merkle hash")]
    MerkleMismatch(i64),

    #[error("too many unsequenced leaves")]
    QuotaExceeded,

    /// The requested batch object does not exist.
    #[error("leaves not found in remote database")]
    LeavesNotFound,

    #[error("set of stored leaves is truncated in batch {0}")]
    Truncated(i64),

    #[error("gap in set of leaves to store in batch {0}")]
    Gap(i64),

    #[error("multiple leaves in position {0}")]
    DuplicateOffset(i64),

    #[error("{0}")]
    BadInput(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    /// Stored bytes that should always decode did not.
    #[error("storage corruption: {0}")]
    Corrupt(String),

    #[error("codec: {0}")]
    Codec(String),

    #[error("local database: {0}")]
    Local(#[from] redb::Error),

    #[error("remote transfer: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response status: {0}")]
    RemoteStatus(u16),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Local(err.into())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Local(err.into())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Local(err.into())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Local(err.into())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Local(err.into())
    }
}

impl From<serde_cbor::Error> for StorageError {
    fn from(err: serde_cbor::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}
