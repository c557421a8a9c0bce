//! Pack writer - placement bookkeeping for the write path
//!
//! ## Write Flow
//!
//! 1. Take the process-wide pack lock
//! 2. Read the owner's current FileRecord
//! 3. Pick a target: append to the current pack, or create a new one when
//!    there is none or it has grown past the rotation threshold
//! 4. Send the blocks in requests of `max_files_per_request`; when creating,
//!    the first request creates the pack and the rest append to it
//! 5. Match placements back to blocks by content hash
//! 6. Persist a FileInfo per placed block, then the owner's FileRecord
//!
//! Nothing is rolled back. A block uploaded but not indexed is orphaned in
//! the pack, which is harmless: the next write of it misses the dedup check
//! and uploads it again.

use cid::Cid;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::config::ServiceConfig;
use crate::error::{BlockServiceError, Result};
use crate::index::{FileInfo, FileRecord, PlacementIndex};
use crate::remote::{PackFile, PackReceipt, RemoteStore};

/// Serializes pack selection across every writer in the process, so two
/// writers can't both append to a pack that should have rotated
static PACK_LOCK: Mutex<()> = Mutex::const_new(());

/// What a write did
#[derive(Debug, Default)]
pub struct WriteOutcome {
    /// Blocks uploaded and indexed
    pub stored: Vec<Block>,
    /// Blocks that failed, with their cause
    pub failed: Vec<(Cid, BlockServiceError)>,
    /// Pack that received the blocks
    pub pack_id: Option<String>,
    /// Whether the write created `pack_id`
    pub created_pack: bool,
    /// Append requests issued
    pub appends: usize,
}

/// Writes blocks into remote packs and records where they landed
#[derive(Clone)]
pub struct PackWriter {
    index: PlacementIndex,
    remote: Arc<dyn RemoteStore>,
}

impl PackWriter {
    pub fn new(index: PlacementIndex, remote: Arc<dyn RemoteStore>) -> Self {
        Self { index, remote }
    }

    /// Upload `blocks` for `owner` and index them
    ///
    /// Returns `Err` only when nothing could be written (owner record
    /// unreadable, pack creation failed) or when the owner record could not
    /// be saved afterwards. Per-block failures are reported in the outcome.
    pub async fn write(
        &self,
        owner: Option<&str>,
        blocks: Vec<Block>,
        config: &ServiceConfig,
    ) -> Result<WriteOutcome> {
        let blocks = unique(blocks);
        if blocks.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let _guard = PACK_LOCK.lock().await;

        let current = match owner {
            Some(owner) => self.index.file_record(owner).await?,
            None => None,
        };

        let mut chunks: Vec<Vec<Block>> = blocks
            .chunks(config.max_files_per_request.max(1))
            .map(|c| c.to_vec())
            .collect();

        let mut outcome = WriteOutcome::default();
        let mut placed: Vec<(Block, FileInfo)> = Vec::new();
        let mut pack_size = 0u64;

        let pack_id = match current {
            Some(record) if record.size <= config.pack_rotation_bytes => {
                debug!(owner = ?owner, pack_id = %record.pack_id, size = record.size, "Appending to current pack");
                pack_size = record.size;
                record.pack_id
            }
            stale => {
                if let Some(record) = stale {
                    info!(owner = ?owner, pack_id = %record.pack_id, size = record.size, "Pack full, rotating");
                }
                let first = chunks.remove(0);
                let receipt = self.remote.upload(pack_files(&first)).await?;
                info!(owner = ?owner, pack_id = %receipt.pack_id, "Created pack");

                outcome.created_pack = true;
                pack_size = pack_size.max(receipt.total_size);
                let pack_id = receipt.pack_id.clone();
                match_placements(first, Ok(receipt), &pack_id, &mut placed, &mut outcome.failed);
                pack_id
            }
        };

        outcome.appends = chunks.len();
        let remote = &self.remote;
        let target = pack_id.as_str();
        let results: Vec<(Vec<Block>, Result<PackReceipt>)> = stream::iter(chunks)
            .map(|chunk| async move {
                let result = remote.append(target, pack_files(&chunk)).await;
                (chunk, result)
            })
            .buffer_unordered(config.max_concurrent_uploads.max(1))
            .collect()
            .await;

        for (chunk, result) in results {
            if let Ok(receipt) = &result {
                pack_size = pack_size.max(receipt.total_size);
            }
            match_placements(chunk, result, &pack_id, &mut placed, &mut outcome.failed);
        }

        for (block, info) in placed {
            match self.index.put_file_info(block.cid(), &info).await {
                Ok(()) => outcome.stored.push(block),
                Err(e) => {
                    warn!(cid = %block.cid(), error = %e, "Block uploaded but not indexed");
                    outcome.failed.push((*block.cid(), e));
                }
            }
        }

        if let Some(owner) = owner {
            if !outcome.stored.is_empty() || outcome.created_pack {
                let record = FileRecord {
                    pack_id: pack_id.clone(),
                    size: pack_size,
                };
                self.index.put_file_record(owner, &record).await?;
            }
        }

        debug!(
            pack_id = %pack_id,
            stored = outcome.stored.len(),
            failed = outcome.failed.len(),
            pack_size,
            "Pack write complete"
        );

        outcome.pack_id = Some(pack_id);
        Ok(outcome)
    }
}

fn unique(blocks: Vec<Block>) -> Vec<Block> {
    let mut seen = HashSet::with_capacity(blocks.len());
    blocks
        .into_iter()
        .filter(|b| seen.insert(*b.cid()))
        .collect()
}

fn pack_files(blocks: &[Block]) -> Vec<PackFile> {
    blocks.iter().map(PackFile::from).collect()
}

/// Pair each block of a request with its placement, or record why it failed
fn match_placements(
    chunk: Vec<Block>,
    result: Result<PackReceipt>,
    pack_id: &str,
    placed: &mut Vec<(Block, FileInfo)>,
    failed: &mut Vec<(Cid, BlockServiceError)>,
) {
    let receipt = match result {
        Ok(receipt) => receipt,
        Err(e) => {
            warn!(pack_id = %pack_id, blocks = chunk.len(), error = %e, "Pack request failed");
            let message = e.to_string();
            let mut first = Some(e);
            for block in chunk {
                let err = first
                    .take()
                    .unwrap_or_else(|| BlockServiceError::remote(message.clone()));
                failed.push((*block.cid(), err));
            }
            return;
        }
    };

    for block in chunk {
        match receipt.placement(&block.content_hash()) {
            Some(placement) => {
                let info = FileInfo {
                    pack_id: pack_id.to_string(),
                    size: placement.length,
                    offset: placement.offset,
                };
                placed.push((block, info));
            }
            None => {
                let err = BlockServiceError::remote(format!(
                    "no placement returned for {}",
                    block.cid()
                ));
                failed.push((*block.cid(), err));
            }
        }
    }
}
