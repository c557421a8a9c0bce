//! Block service orchestrator
//!
//! Routes every operation across the four collaborators:
//!
//! | Operation      | Index | Remote packs | Blockstore | Exchange       |
//! |----------------|-------|--------------|------------|----------------|
//! | add_block(s)   | r/w   | upload/append| -          | notify         |
//! | get_block(s)   | r     | range fetch  | write-back | fetch + notify |
//! | delete_block   | -     | -            | delete     | -              |
//! | close          | -     | -            | -          | close          |
//!
//! Packs are append-only, so deleting a block only evicts it from the local
//! blockstore. The index and the CDN keep serving it.

use async_trait::async_trait;
use cid::Cid;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::block::Block;
use crate::blockstore::Blockstore;
use crate::config::ServiceConfig;
use crate::context::CallContext;
use crate::error::{BlockServiceError, Result};
use crate::exchange::{BlockStream, Exchange};
use crate::index::{LocalIndex, PlacementIndex};
use crate::metering::UsageReporter;
use crate::pack::PackWriter;
use crate::reader::{FetcherSource, ReadCore};
use crate::remote::RemoteStore;
use crate::stats::{ServiceStats, StatsCounters};
use crate::streamer::stream_blocks;
use crate::validator::validate_cid;

/// Read access shared by [`BlockService`] and [`crate::Session`]
#[async_trait]
pub trait BlockGetter: Send + Sync {
    async fn get_block(&self, cid: &Cid, ctx: &CallContext) -> Result<Block>;

    /// Unordered, possibly partial; see [`BlockService::get_blocks`]
    fn get_blocks(&self, cids: Vec<Cid>, ctx: &CallContext) -> BlockStream;
}

/// Content-addressed block service backed by a pack CDN
#[derive(Clone)]
pub struct BlockService {
    core: Arc<ReadCore>,
    exchange: Option<Arc<dyn Exchange>>,
}

impl BlockService {
    /// Service that skips uploads of blocks already indexed
    ///
    /// Without an exchange the service runs offline: misses are `NotFound`.
    pub fn new(
        blockstore: Arc<dyn Blockstore>,
        exchange: Option<Arc<dyn Exchange>>,
        index: Arc<dyn LocalIndex>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self::build(blockstore, exchange, index, remote, ServiceConfig::default())
    }

    /// Service that uploads every added block, indexed or not
    pub fn write_through(
        blockstore: Arc<dyn Blockstore>,
        exchange: Option<Arc<dyn Exchange>>,
        index: Arc<dyn LocalIndex>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        let config = ServiceConfig {
            check_first: false,
            ..ServiceConfig::default()
        };
        Self::build(blockstore, exchange, index, remote, config)
    }

    fn build(
        blockstore: Arc<dyn Blockstore>,
        exchange: Option<Arc<dyn Exchange>>,
        index: Arc<dyn LocalIndex>,
        remote: Arc<dyn RemoteStore>,
        config: ServiceConfig,
    ) -> Self {
        let index = PlacementIndex::new(index);
        let writer = PackWriter::new(index.clone(), Arc::clone(&remote));
        Self {
            core: Arc::new(ReadCore {
                blockstore,
                index,
                remote,
                writer,
                config,
                usage: None,
                stats: Arc::new(StatsCounters::default()),
            }),
            exchange,
        }
    }

    /// Replace every tunable, `check_first` included
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        let mut core = (*self.core).clone();
        core.config = config;
        self.core = Arc::new(core);
        self
    }

    /// Report CDN bandwidth when running as a dedicated gateway
    pub fn with_usage_reporter(mut self, reporter: Arc<dyn UsageReporter>) -> Self {
        let mut core = (*self.core).clone();
        core.usage = Some(reporter);
        self.core = Arc::new(core);
        self
    }

    pub fn blockstore(&self) -> &Arc<dyn Blockstore> {
        &self.core.blockstore
    }

    pub fn exchange(&self) -> Option<&Arc<dyn Exchange>> {
        self.exchange.as_ref()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.core.config
    }

    pub fn stats(&self) -> ServiceStats {
        self.core.stats.snapshot()
    }

    pub(crate) fn core(&self) -> Arc<ReadCore> {
        Arc::clone(&self.core)
    }

    fn source(&self) -> FetcherSource {
        FetcherSource::for_exchange(self.exchange.as_ref())
    }

    /// Store one block in the owner's current pack
    ///
    /// With `check_first`, a block already indexed returns `Ok` without any
    /// upload. A failure after the upload leaves the block in its pack but
    /// unindexed; retrying uploads it again.
    pub async fn add_block(&self, block: Block, ctx: &CallContext) -> Result<()> {
        validate_cid(block.cid())?;
        if ctx.cancel.is_cancelled() {
            return Err(BlockServiceError::Cancelled);
        }

        if self.core.config.check_first && self.is_indexed(block.cid()).await {
            StatsCounters::incr(&self.core.stats.dedup_skips, 1);
            debug!(cid = %block.cid(), "Block already indexed, skipping upload");
            return Ok(());
        }

        let outcome = self.core.ingest(ctx.owner(), vec![block]).await?;
        if let Some((_, e)) = outcome.failed.into_iter().next() {
            return Err(e);
        }

        self.announce(&outcome.stored).await;
        Ok(())
    }

    /// Store many blocks, sharing one target pack
    ///
    /// Any unsafe id fails the whole call before anything is written. Blocks
    /// that fail to upload or index are returned in
    /// [`BlockServiceError::Aggregate`]; the blocks that succeeded stay
    /// stored and indexed.
    pub async fn add_blocks(&self, blocks: Vec<Block>, ctx: &CallContext) -> Result<()> {
        for block in &blocks {
            validate_cid(block.cid())?;
        }
        if ctx.cancel.is_cancelled() {
            return Err(BlockServiceError::Cancelled);
        }

        let pending = if self.core.config.check_first {
            let mut pending = Vec::with_capacity(blocks.len());
            for block in blocks {
                if self.is_indexed(block.cid()).await {
                    StatsCounters::incr(&self.core.stats.dedup_skips, 1);
                } else {
                    pending.push(block);
                }
            }
            pending
        } else {
            blocks
        };

        if pending.is_empty() {
            debug!("Every block already indexed");
            return Ok(());
        }

        let outcome = self.core.ingest(ctx.owner(), pending).await?;
        if !outcome.failed.is_empty() {
            warn!(
                stored = outcome.stored.len(),
                failed = outcome.failed.len(),
                "Batch write partially failed"
            );
            return Err(BlockServiceError::Aggregate(outcome.failed));
        }

        self.announce(&outcome.stored).await;
        Ok(())
    }

    /// Fetch one block: CDN first, then the exchange
    pub async fn get_block(&self, cid: &Cid, ctx: &CallContext) -> Result<Block> {
        self.core.get_block(cid, ctx, &self.source()).await
    }

    /// Stream many blocks
    ///
    /// Unsafe ids are dropped. CDN hits come first in request order, then
    /// exchange blocks in arrival order. The stream can end before every id
    /// was delivered (not found, exchange gave up, cancelled); compare the
    /// received ids with the requested ones.
    pub fn get_blocks(&self, cids: Vec<Cid>, ctx: &CallContext) -> BlockStream {
        stream_blocks(self.core(), cids, ctx.clone(), self.source())
    }

    /// Evict a block from the local blockstore
    pub async fn delete_block(&self, cid: &Cid) -> Result<()> {
        validate_cid(cid)?;
        self.core.blockstore.delete(cid).await?;
        debug!(cid = %cid, "Deleted block from blockstore");
        Ok(())
    }

    /// Close the exchange. The stores are owned by the caller and stay open.
    pub async fn close(&self) -> Result<()> {
        match &self.exchange {
            Some(exchange) => exchange.close().await,
            None => Ok(()),
        }
    }

    async fn is_indexed(&self, cid: &Cid) -> bool {
        match self.core.index.has_file_info(cid).await {
            Ok(indexed) => indexed,
            Err(e) => {
                warn!(cid = %cid, error = %e, "Placement lookup failed, uploading anyway");
                false
            }
        }
    }

    async fn announce(&self, blocks: &[Block]) {
        let Some(exchange) = &self.exchange else {
            return;
        };
        if blocks.is_empty() {
            return;
        }
        if let Err(e) = exchange.notify_new_blocks(blocks).await {
            warn!(blocks = blocks.len(), error = %e, "Could not tell the exchange about new blocks");
        }
    }
}

#[async_trait]
impl BlockGetter for BlockService {
    async fn get_block(&self, cid: &Cid, ctx: &CallContext) -> Result<Block> {
        BlockService::get_block(self, cid, ctx).await
    }

    fn get_blocks(&self, cids: Vec<Cid>, ctx: &CallContext) -> BlockStream {
        BlockService::get_blocks(self, cids, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemoryBlockstore;
    use crate::exchange::MemoryExchange;
    use crate::index::MemoryIndex;
    use crate::remote::MemoryRemoteStore;

    struct Fixture {
        service: BlockService,
        exchange: MemoryExchange,
        remote: Arc<MemoryRemoteStore>,
        blockstore: Arc<MemoryBlockstore>,
    }

    fn fixture() -> Fixture {
        let exchange = MemoryExchange::new();
        let remote = Arc::new(MemoryRemoteStore::new());
        let blockstore = Arc::new(MemoryBlockstore::new());
        let service = BlockService::new(
            blockstore.clone(),
            Some(Arc::new(exchange.clone())),
            Arc::new(MemoryIndex::new()),
            remote.clone(),
        );
        Fixture {
            service,
            exchange,
            remote,
            blockstore,
        }
    }

    #[tokio::test]
    async fn test_add_then_get_from_cdn() {
        let f = fixture();
        let block = Block::new(b"hello pack".to_vec());
        let ctx = CallContext::new().with_owner("u1");

        f.service.add_block(block.clone(), &ctx).await.unwrap();
        let got = f.service.get_block(block.cid(), &ctx).await.unwrap();

        assert_eq!(got, block);
        assert_eq!(f.exchange.get_block_calls(), 0);
        assert_eq!(f.exchange.notified(), 1);
        assert_eq!(f.remote.range_fetch_count(), 1);

        let stats = f.service.stats();
        assert_eq!(stats.cdn_hits, 1);
        assert_eq!(stats.packs_created, 1);
    }

    #[tokio::test]
    async fn test_dedup_skips_upload() {
        let f = fixture();
        let block = Block::new(b"once".to_vec());
        let ctx = CallContext::new().with_owner("u1");

        f.service.add_block(block.clone(), &ctx).await.unwrap();
        f.service.add_block(block, &ctx).await.unwrap();

        assert_eq!(f.remote.upload_count(), 1);
        assert_eq!(f.remote.append_count(), 0);
        assert_eq!(f.service.stats().dedup_skips, 1);
    }

    #[tokio::test]
    async fn test_write_through_uploads_again() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let service = BlockService::write_through(
            Arc::new(MemoryBlockstore::new()),
            None,
            Arc::new(MemoryIndex::new()),
            remote.clone(),
        );
        let block = Block::new(b"again".to_vec());
        let ctx = CallContext::new().with_owner("u1");

        service.add_block(block.clone(), &ctx).await.unwrap();
        service.add_block(block, &ctx).await.unwrap();

        assert_eq!(remote.upload_count(), 1);
        assert_eq!(remote.append_count(), 1);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_exchange_without_caching() {
        let f = fixture();
        let block = Block::new(b"from peers".to_vec());
        f.exchange.insert(block.clone());

        let got = f.service.get_block(block.cid(), &CallContext::new()).await.unwrap();

        assert_eq!(got, block);
        assert_eq!(f.remote.upload_count(), 0);
        assert!(f.blockstore.is_empty());
        assert_eq!(f.service.stats().exchange_fetches, 1);
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_not_found() {
        let f = fixture();
        let block = Block::new(b"nowhere".to_vec());

        let err = f
            .service
            .get_block(block.cid(), &CallContext::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_only_touches_blockstore() {
        let f = fixture();
        let block = Block::new(b"cached".to_vec());
        let ctx = CallContext::new().with_owner("u1");
        f.service.add_block(block.clone(), &ctx).await.unwrap();
        f.blockstore.put(&block).await.unwrap();

        f.service.delete_block(block.cid()).await.unwrap();

        assert!(!f.blockstore.has(block.cid()).await.unwrap());
        assert_eq!(f.service.get_block(block.cid(), &ctx).await.unwrap(), block);
    }

    #[tokio::test]
    async fn test_close_closes_exchange() {
        let f = fixture();
        f.service.close().await.unwrap();
        assert!(f.exchange.is_closed());
    }

    #[tokio::test]
    async fn test_add_after_cancel() {
        let f = fixture();
        let ctx = CallContext::new();
        ctx.cancel.cancel();

        let err = f
            .service
            .add_block(Block::new(b"late".to_vec()), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, BlockServiceError::Cancelled));
        assert_eq!(f.remote.upload_count(), 0);
    }
}
