//! Storage and sequencing core for a Certificate Transparency log.
//!
//! Two tiers back each log tree. A fast local index holds everything small
//! and hot: the latest signed root and its compact frontier, the queue of
//! unsequenced leaves, the Merkle- and identity-hash indices, and the
//! tree's internal node hashes grouped into subtree blobs. A slow remote
//! batch store holds the sequenced leaf bodies, 1024 to an object, where
//! they are cheap to keep forever.
//!
//! The two tiers meet in the write transaction of [`storage::LogTreeTx`]:
//! a state machine only admits the legal order of operations, a checksum
//! ties the sequenced leaves back to the dequeue that produced them, and a
//! proposed signed root must reproduce the frontier's head before it can
//! commit. Remote uploads land before the local index references them, so
//! readers never observe a root whose leaves are missing.

pub mod admin;
pub mod config;
pub mod dedup;
pub mod error;
pub mod frontier;
pub mod fsm;
pub mod local;
pub mod quota;
pub mod remote;
pub mod signer;
pub mod storage;
pub mod subtree;
pub mod types;

pub use error::StorageError;
pub use types::{Hash, Leaf, LogRootV1, QueuedLeaf, SignedLogRoot};
