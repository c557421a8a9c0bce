//! In-memory placement index

use async_trait::async_trait;
use dashmap::DashMap;

use super::LocalIndex;
use crate::error::Result;

/// Placement index held in a concurrent map (tests and offline use)
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LocalIndex for MemoryIndex {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_vec(), value);
        Ok(())
    }
}
