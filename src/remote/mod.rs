//! Remote pack store - append-only CDN blob service
//!
//! Blocks are written into large pack files. A pack is created by `upload`,
//! grown by `append`, and read back by byte range. Packs are never rewritten
//! or deleted, so a placement handed out once stays valid forever.

mod http;
mod memory;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::block::Block;
use crate::error::Result;

/// Pack size after which the owner's next write starts a new pack (100 MiB)
pub const PACK_ROTATION_THRESHOLD: u64 = 100 * 1024 * 1024;

/// One file sent to the pack store
#[derive(Debug, Clone)]
pub struct PackFile {
    /// Content hash of the block, used to match placements back
    pub name: String,
    pub data: Bytes,
}

impl From<&Block> for PackFile {
    fn from(block: &Block) -> Self {
        Self {
            name: block.content_hash(),
            data: block.data().clone(),
        }
    }
}

/// Where the store put one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

/// Result of an upload or append
#[derive(Debug, Clone)]
pub struct PackReceipt {
    pub pack_id: String,
    pub placements: Vec<Placement>,
    /// Cumulative pack size after this write
    pub total_size: u64,
}

impl PackReceipt {
    /// Placement for a given file name
    ///
    /// The store may report entries under a directory prefix, so only the
    /// last path segment is compared.
    pub fn placement(&self, name: &str) -> Option<&Placement> {
        self.placements
            .iter()
            .find(|p| p.name.rsplit('/').next() == Some(name))
    }
}


/// Append-only pack blob service
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a new pack holding `files`
    async fn upload(&self, files: Vec<PackFile>) -> Result<PackReceipt>;

    /// Append `files` to an existing pack
    async fn append(&self, pack_id: &str, files: Vec<PackFile>) -> Result<PackReceipt>;

    /// Read `length` bytes at `offset` from a pack
    async fn range_fetch(&self, pack_id: &str, offset: u64, length: u64) -> Result<Bytes>;
}
