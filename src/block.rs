//! Blocks - raw payloads paired with their content identifier

use bytes::Bytes;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

/// Multicodec for raw binary blocks
pub const RAW_CODEC: u64 = 0x55;

/// An immutable content-addressed block
///
/// Producers are responsible for digest correctness: the service only checks
/// that the CID's hash function is safe, it never re-hashes payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// Build a CIDv1 raw block hashed with sha2-256
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let hash = Code::Sha2_256.digest(&data);
        Self {
            cid: Cid::new_v1(RAW_CODEC, hash),
            data,
        }
    }

    /// Pair data with a CID computed elsewhere
    pub fn with_cid(data: impl Into<Bytes>, cid: Cid) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Name of this block inside a remote pack
    pub fn content_hash(&self) -> String {
        content_hash_hex(&self.cid)
    }
}

/// Lowercase hex of the CID's multihash bytes
///
/// Pack entries are named by this string and usage reports carry it, so it
/// must stay stable across releases.
pub fn content_hash_hex(cid: &Cid) -> String {
    hex::encode(cid.hash().to_bytes())
}
