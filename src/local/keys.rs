//! Rowkey construction for the local index.
//!
//! All namespaces share one ordered keyspace. Every key starts with a type
//! byte and the 16 hex characters of the tree id:
//!
//! | type | suffix                                    | value              |
//! |------|-------------------------------------------|--------------------|
//! | `r`  | `root` / `sig` / `frontier`               | latest STH parts   |
//! | `l`  | big-endian queue timestamp + 4 noise bytes | queued leaf        |
//! | `m`  | Merkle leaf hash                          | varint leaf index  |
//! | `i`  | leaf identity hash                        | varint leaf index  |
//! | `s`  | path (8 B, zero padded) + prefix length + big-endian revision | subtree |
//!
//! Keys are built by concatenating fixed-width big-endian fragments; the
//! layout is part of the on-disk format.

use crate::error::StorageError;
use crate::subtree::NodeId;

pub(crate) const NS_ROOT: u8 = b'r';
pub(crate) const NS_QUEUE: u8 = b'l';
pub(crate) const NS_MERKLE: u8 = b'm';
pub(crate) const NS_IDENTITY: u8 = b'i';
pub(crate) const NS_SUBTREE: u8 = b's';

pub(crate) const ROOT_FIELD: &[u8] = b"root";
pub(crate) const SIG_FIELD: &[u8] = b"sig";
pub(crate) const FRONTIER_FIELD: &[u8] = b"frontier";

const HEX: &[u8; 16] = b"0123456789abcdef";

/// First key of the namespace: type byte plus the hex tree id. A strict
/// prefix of every key in the namespace, so it sorts before all of them.
pub(crate) fn namespace(ns: u8, tree_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(38);
    key.push(ns);
    for byte in tree_id.to_be_bytes() {
        key.push(HEX[(byte >> 4) as usize]);
        key.push(HEX[(byte & 0x0f) as usize]);
    }
    key
}

/// First key past the namespace.
pub(crate) fn namespace_end(ns: u8, tree_id: i64) -> Vec<u8> {
    let mut key = namespace(ns, tree_id);
    // the last hex character is never 0xff
    *key.last_mut().expect("namespace keys are non-empty") += 1;
    key
}

pub(crate) fn root_key(tree_id: i64, field: &[u8]) -> Vec<u8> {
    let mut key = namespace(NS_ROOT, tree_id);
    key.extend_from_slice(field);
    key
}

pub(crate) fn queue_key(tree_id: i64, queue_timestamp: i64, noise: [u8; 4]) -> Vec<u8> {
    let mut key = namespace(NS_QUEUE, tree_id);
    key.extend_from_slice(&queue_timestamp.to_be_bytes());
    key.extend_from_slice(&noise);
    key
}

/// First queue key past the cutoff window: entries queued at `cutoff` or
/// earlier sort strictly below it.
pub(crate) fn queue_scan_ceiling(tree_id: i64, cutoff: i64) -> Vec<u8> {
    let mut key = namespace(NS_QUEUE, tree_id);
    key.extend_from_slice(&cutoff.saturating_add(1).to_be_bytes());
    key
}

pub(crate) fn hash_key(ns: u8, tree_id: i64, hash: &[u8]) -> Vec<u8> {
    let mut key = namespace(ns, tree_id);
    key.extend_from_slice(hash);
    key
}

/// Rowkey of the subtree at `id` for one tree revision. Only whole-byte
/// prefixes are persisted.
pub(crate) fn subtree_key(
    tree_id: i64,
    id: &NodeId,
    revision: i64,
) -> Result<Vec<u8>, StorageError> {
    if id.prefix_len_bits % 8 != 0 {
        return Err(StorageError::BadInput(format!(
            "invalid subtree id - not multiple of 8: {}",
            id.prefix_len_bits
        )));
    }
    let mut key = namespace(NS_SUBTREE, tree_id);
    let mut path = [0u8; 8];
    let bytes = (id.prefix_len_bits / 8) as usize;
    path[..bytes].copy_from_slice(&id.path[..bytes]);
    key.extend_from_slice(&path);
    key.push(id.prefix_len_bits);
    key.extend_from_slice(&revision.to_be_bytes());
    Ok(key)
}

/// Smallest acceptable key when scanning backward for the subtree at `id`:
/// the key immediately before `path || len || revision 0`. A zero prefix
/// length has no in-namespace predecessor, so the namespace floor stands in.
pub(crate) fn subtree_floor(tree_id: i64, id: &NodeId) -> Result<Vec<u8>, StorageError> {
    let mut floor = subtree_key(tree_id, id, 0)?;
    floor.truncate(floor.len() - 8);
    let len_at = floor.len() - 1;
    if floor[len_at] == 0 {
        floor.truncate(len_at - 8);
    } else {
        floor[len_at] -= 1;
        floor.extend_from_slice(&[0xff; 8]);
    }
    Ok(floor)
}

/// Zigzag varint, the stored form of a leaf index. -1 is the reserved
/// "absent" sentinel, so the encoding has to carry signed values.
pub(crate) fn encode_varint(value: i64) -> Vec<u8> {
    let mut zigzag = ((value as u64) << 1) ^ ((value >> 63) as u64);
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (zigzag & 0x7f) as u8;
        zigzag >>= 7;
        if zigzag == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn decode_varint(raw: &[u8]) -> Result<i64, StorageError> {
    let mut zigzag: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in raw.iter().enumerate() {
        if shift >= 64 {
            break;
        }
        zigzag |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if i + 1 != raw.len() {
                break;
            }
            return Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64));
        }
    }
    Err(StorageError::Corrupt("malformed entry in index".into()))
}
