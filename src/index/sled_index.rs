//! Sled-backed placement index

use async_trait::async_trait;
use sled::Db;
use std::path::Path;
use tracing::info;

use super::LocalIndex;
use crate::error::Result;

/// Placement index persisted in a local sled database
pub struct SledIndex {
    db: Db,
}

impl SledIndex {
    /// Open or create the index database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened placement index");
        Ok(Self { db })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

#[async_trait]
impl LocalIndex for SledIndex {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }
}
