//! Placement index - where each block lives inside the remote packs
//!
//! Two kinds of entries share one key-value namespace:
//!
//! ```text
//! <multihash bytes>   → FileInfo   { pack, offset, size }   write-once
//! owner/<owner id>    → FileRecord { pack, cumulative size } rewritten on every write
//! ```
//!
//! FileInfo entries are never updated after creation, so reads need no
//! locking. FileRecord entries are only touched under the pack writer's lock.

mod memory;
mod sled_index;

pub use memory::MemoryIndex;
pub use sled_index::SledIndex;

use async_trait::async_trait;
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

/// Raw key-value engine backing the placement index
#[async_trait]
pub trait LocalIndex: Send + Sync {
    /// Value for `key`, `None` when absent
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;
}

/// The pack currently receiving writes for one owner scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "FileRecordID")]
    pub pack_id: String,
    /// Cumulative bytes written to the pack
    #[serde(rename = "Size")]
    pub size: u64,
}

/// Location of one block inside a pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "FileRecordID")]
    pub pack_id: String,
    /// Length of the block inside the pack
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Offset")]
    pub offset: u64,
}

const OWNER_PREFIX: &[u8] = b"owner/";

/// Typed access to FileRecord and FileInfo entries
#[derive(Clone)]
pub struct PlacementIndex {
    inner: Arc<dyn LocalIndex>,
}

impl PlacementIndex {
    pub fn new(inner: Arc<dyn LocalIndex>) -> Self {
        Self { inner }
    }

    pub fn hash_key(cid: &Cid) -> Vec<u8> {
        cid.hash().to_bytes()
    }

    pub fn owner_key(owner: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(OWNER_PREFIX.len() + owner.len());
        key.extend_from_slice(OWNER_PREFIX);
        key.extend_from_slice(owner.as_bytes());
        key
    }

    pub async fn file_info(&self, cid: &Cid) -> Result<Option<FileInfo>> {
        match self.inner.get(&Self::hash_key(cid)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn has_file_info(&self, cid: &Cid) -> Result<bool> {
        Ok(self.inner.get(&Self::hash_key(cid)).await?.is_some())
    }

    pub async fn put_file_info(&self, cid: &Cid, info: &FileInfo) -> Result<()> {
        let value = serde_json::to_vec(info)?;
        self.inner.put(&Self::hash_key(cid), value).await
    }

    pub async fn file_record(&self, owner: &str) -> Result<Option<FileRecord>> {
        match self.inner.get(&Self::owner_key(owner)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_file_record(&self, owner: &str, record: &FileRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.inner.put(&Self::owner_key(owner), value).await
    }
}
