//! In-process pack store
//!
//! Behaves like the CDN uploader: packs grow by appending files back to back,
//! and appends to one pack are serialized so offsets never overlap.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{PackFile, PackReceipt, Placement, RemoteStore};
use crate::error::{BlockServiceError, Result};

/// Pack store kept in memory, with call counters for inspection
#[derive(Default)]
pub struct MemoryRemoteStore {
    packs: DashMap<String, Arc<Mutex<Vec<u8>>>>,
    rejected: DashSet<String>,
    next_pack: AtomicU64,
    uploads: AtomicU64,
    appends: AtomicU64,
    range_fetches: AtomicU64,
    fetched_ranges: Mutex<Vec<(String, u64, u64)>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any request carrying a file with this name
    pub fn reject_file(&self, name: impl Into<String>) {
        self.rejected.insert(name.into());
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    pub fn range_fetch_count(&self) -> u64 {
        self.range_fetches.load(Ordering::Relaxed)
    }

    /// Every `(pack_id, offset, length)` requested, in call order
    pub async fn fetched_ranges(&self) -> Vec<(String, u64, u64)> {
        self.fetched_ranges.lock().await.clone()
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    /// Current size of a pack
    pub async fn pack_size(&self, pack_id: &str) -> Option<u64> {
        let pack = self.packs.get(pack_id).map(|p| Arc::clone(p.value()))?;
        let data = pack.lock().await;
        Some(data.len() as u64)
    }

    fn check_rejected(&self, files: &[PackFile]) -> Result<()> {
        match files.iter().find(|f| self.rejected.contains(&f.name)) {
            Some(file) => Err(BlockServiceError::remote(format!(
                "file {} rejected by pack store",
                file.name
            ))),
            None => Ok(()),
        }
    }

    async fn write_files(
        &self,
        pack_id: &str,
        pack: &Mutex<Vec<u8>>,
        files: Vec<PackFile>,
    ) -> PackReceipt {
        let mut data = pack.lock().await;
        let mut placements = Vec::with_capacity(files.len());
        for file in files {
            placements.push(Placement {
                name: file.name,
                offset: data.len() as u64,
                length: file.data.len() as u64,
            });
            data.extend_from_slice(&file.data);
        }

        PackReceipt {
            pack_id: pack_id.to_string(),
            placements,
            total_size: data.len() as u64,
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upload(&self, files: Vec<PackFile>) -> Result<PackReceipt> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.check_rejected(&files)?;

        let pack_id = format!("pack-{}", self.next_pack.fetch_add(1, Ordering::Relaxed));
        let pack = Arc::new(Mutex::new(Vec::new()));
        self.packs.insert(pack_id.clone(), Arc::clone(&pack));

        Ok(self.write_files(&pack_id, &pack, files).await)
    }

    async fn append(&self, pack_id: &str, files: Vec<PackFile>) -> Result<PackReceipt> {
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.check_rejected(&files)?;

        let pack = self
            .packs
            .get(pack_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| BlockServiceError::remote(format!("unknown pack {}", pack_id)))?;

        Ok(self.write_files(pack_id, &pack, files).await)
    }

    async fn range_fetch(&self, pack_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.range_fetches.fetch_add(1, Ordering::Relaxed);
        self.fetched_ranges
            .lock()
            .await
            .push((pack_id.to_string(), offset, length));

        let pack = self
            .packs
            .get(pack_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| BlockServiceError::remote(format!("unknown pack {}", pack_id)))?;
        let data = pack.lock().await;

        let start = offset as usize;
        let end = start.saturating_add(length as usize);
        if end > data.len() {
            return Err(BlockServiceError::remote(format!(
                "range {},{} outside pack {} of {} bytes",
                offset,
                length,
                pack_id,
                data.len()
            )));
        }

        Ok(Bytes::copy_from_slice(&data[start..end]))
    }
}
