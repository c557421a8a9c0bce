//! Local blockstore - the opportunistic cache layer
//!
//! The blockstore belongs to the caller's infrastructure. The service writes
//! exchange-sourced blocks into it when asked to cache, and deletes from it,
//! but never treats it as the source of truth.
//!
//! ## Filesystem Layout
//!
//! ```text
//! <root>/
//! └── blocks/
//!     ├── bafk/              # First 4 chars of the CID as subdir
//!     │   └── bafkrei...     # Raw block bytes
//!     └── ...
//! ```

use async_trait::async_trait;
use cid::Cid;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::block::Block;
use crate::error::{BlockServiceError, Result};

/// Local block cache
#[async_trait]
pub trait Blockstore: Send + Sync {
    async fn get(&self, cid: &Cid) -> Result<Block>;

    async fn has(&self, cid: &Cid) -> Result<bool>;

    async fn put(&self, block: &Block) -> Result<()>;

    async fn put_many(&self, blocks: &[Block]) -> Result<()> {
        for block in blocks {
            self.put(block).await?;
        }
        Ok(())
    }

    async fn delete(&self, cid: &Cid) -> Result<()>;
}

/// Blockstore held in memory
#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: DashMap<Cid, Block>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn get(&self, cid: &Cid) -> Result<Block> {
        self.blocks
            .get(cid)
            .map(|b| b.value().clone())
            .ok_or(BlockServiceError::NotFound(*cid))
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.contains_key(cid))
    }

    async fn put(&self, block: &Block) -> Result<()> {
        self.blocks.insert(*block.cid(), block.clone());
        Ok(())
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        self.blocks
            .remove(cid)
            .map(|_| ())
            .ok_or(BlockServiceError::NotFound(*cid))
    }
}

/// Blockstore on the local filesystem, one file per block
pub struct FsBlockstore {
    root_dir: PathBuf,
}

impl FsBlockstore {
    /// Create a blockstore at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(root_dir.join("blocks")).await?;

        info!(path = %root_dir.display(), "Initialized blockstore");

        Ok(Self { root_dir })
    }

    fn block_path(&self, cid: &Cid) -> PathBuf {
        let name = cid.to_string();
        let subdir = &name[..4.min(name.len())];
        self.root_dir.join("blocks").join(subdir).join(name)
    }
}

#[async_trait]
impl Blockstore for FsBlockstore {
    async fn get(&self, cid: &Cid) -> Result<Block> {
        match fs::read(self.block_path(cid)).await {
            Ok(data) => Ok(Block::with_cid(data, *cid)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlockServiceError::NotFound(*cid))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(fs::try_exists(self.block_path(cid)).await?)
    }

    async fn put(&self, block: &Block) -> Result<()> {
        let path = self.block_path(block.cid());
        if fs::try_exists(&path).await? {
            debug!(cid = %block.cid(), "Block already cached");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Each writer gets its own temp file so readers never see a partial
        // block and concurrent puts of one block can't clobber each other
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, block.data()).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            if !fs::try_exists(&path).await? {
                return Err(e.into());
            }
            debug!(cid = %block.cid(), "Block cached by a concurrent writer");
            return Ok(());
        }

        debug!(cid = %block.cid(), size = block.len(), "Cached block");
        Ok(())
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        match fs::remove_file(self.block_path(cid)).await {
            Ok(()) => {
                debug!(cid = %cid, "Deleted cached block");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlockServiceError::NotFound(*cid))
            }
            Err(e) => Err(e.into()),
        }
    }
}
