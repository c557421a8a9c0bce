//! Read path shared by the block service and its sessions
//!
//! ## Resolution Flow
//!
//! 1. Validate the CID
//! 2. Look up the block's FileInfo; on a hit, range-fetch it from its pack
//! 3. On a miss, fetch from the exchange (or a session of it)
//! 4. With cache opt-in, write the block back: blockstore, pack + index,
//!    exchange announcement
//!
//! The exchange is only resolved once the CDN has missed, so a session is
//! never opened for reads the CDN can serve.

use cid::Cid;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::block::{content_hash_hex, Block};
use crate::blockstore::Blockstore;
use crate::config::ServiceConfig;
use crate::context::CallContext;
use crate::error::{BlockServiceError, Result};
use crate::exchange::{Exchange, Fetcher, NotifyingFetcher};
use crate::index::{FileInfo, PlacementIndex};
use crate::metering::{BandwidthUsage, UsageReporter};
use crate::pack::{PackWriter, WriteOutcome};
use crate::remote::RemoteStore;
use crate::stats::StatsCounters;
use crate::validator::validate_cid;

/// Where misses go
#[derive(Clone)]
pub(crate) enum FetcherSource {
    /// No exchange configured
    Offline,
    /// Fetch straight from the exchange
    Direct(Arc<dyn Exchange>),
    /// Fetch through one lazily opened exchange session
    Session(Arc<SessionSlot>),
}

impl FetcherSource {
    pub(crate) fn for_exchange(exchange: Option<&Arc<dyn Exchange>>) -> Self {
        match exchange {
            Some(exchange) => Self::Direct(Arc::clone(exchange)),
            None => Self::Offline,
        }
    }

    pub(crate) async fn resolve(&self) -> Option<NotifyingFetcher> {
        match self {
            Self::Offline => None,
            Self::Direct(exchange) => Some(NotifyingFetcher::direct(Arc::clone(exchange))),
            Self::Session(slot) => Some(slot.fetcher().await),
        }
    }
}

/// Holds at most one exchange session, opened on first use
pub(crate) struct SessionSlot {
    exchange: Arc<dyn Exchange>,
    scope: CancellationToken,
    session: Mutex<Option<Arc<dyn Fetcher>>>,
}

impl SessionSlot {
    pub(crate) fn new(exchange: Arc<dyn Exchange>, scope: CancellationToken) -> Self {
        Self {
            exchange,
            scope,
            session: Mutex::new(None),
        }
    }

    async fn fetcher(&self) -> NotifyingFetcher {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            *slot = self.exchange.new_session(self.scope.clone());
            if slot.is_some() {
                debug!("Opened exchange session");
            }
        }

        match slot.as_ref() {
            Some(session) => NotifyingFetcher::session(Arc::clone(&self.exchange), Arc::clone(session)),
            None => NotifyingFetcher::direct(Arc::clone(&self.exchange)),
        }
    }
}

/// Collaborators and tunables of the read path
#[derive(Clone)]
pub(crate) struct ReadCore {
    pub(crate) blockstore: Arc<dyn Blockstore>,
    pub(crate) index: PlacementIndex,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) writer: PackWriter,
    pub(crate) config: ServiceConfig,
    pub(crate) usage: Option<Arc<dyn UsageReporter>>,
    pub(crate) stats: Arc<StatsCounters>,
}

impl ReadCore {
    /// Single block read
    pub(crate) async fn get_block(
        &self,
        cid: &Cid,
        ctx: &CallContext,
        source: &FetcherSource,
    ) -> Result<Block> {
        validate_cid(cid)?;

        let index_error = match self.index.file_info(cid).await {
            Ok(Some(info)) => return self.fetch_placed(cid, &info, &ctx.cancel).await,
            Ok(None) => None,
            Err(e) => {
                warn!(cid = %cid, error = %e, "Placement lookup failed, trying exchange");
                Some(e)
            }
        };

        let Some(fetcher) = source.resolve().await else {
            return Err(index_error.unwrap_or(BlockServiceError::NotFound(*cid)));
        };

        debug!(cid = %cid, "Searching exchange");
        let fetched = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(BlockServiceError::Cancelled),
            result = fetcher.get_block(cid, &ctx.cancel) => result,
        };
        let block = match fetched {
            Ok(block) => block,
            Err(BlockServiceError::Cancelled) => return Err(BlockServiceError::Cancelled),
            Err(e) => {
                debug!(cid = %cid, error = %e, "Exchange could not provide block");
                return Err(BlockServiceError::NotFound(*cid));
            }
        };
        StatsCounters::incr(&self.stats.exchange_fetches, 1);

        if ctx.cache {
            self.blockstore.put(&block).await?;
            let outcome = self.ingest(ctx.owner(), vec![block.clone()]).await?;
            if let Some((_, e)) = outcome.failed.into_iter().next() {
                return Err(e);
            }
            announce(&fetcher, std::slice::from_ref(&block)).await;
        }

        debug!(cid = %cid, "Block fetched from exchange");
        Ok(block)
    }

    /// CDN-only lookup: `Ok(None)` when the block isn't indexed
    pub(crate) async fn cdn_get(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Option<Block>> {
        match self.index.file_info(cid).await? {
            Some(info) => self.fetch_placed(cid, &info, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    async fn fetch_placed(
        &self,
        cid: &Cid,
        info: &FileInfo,
        cancel: &CancellationToken,
    ) -> Result<Block> {
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlockServiceError::Cancelled),
            data = self.remote.range_fetch(&info.pack_id, info.offset, info.size) => data?,
        };
        StatsCounters::incr(&self.stats.cdn_hits, 1);

        if self.config.dedicated_gateway {
            self.report_usage(info.size, cid);
        }

        debug!(cid = %cid, pack_id = %info.pack_id, offset = info.offset, size = info.size, "Block served from CDN");
        Ok(Block::with_cid(data, *cid))
    }

    fn report_usage(&self, amount: u64, cid: &Cid) {
        let Some(reporter) = self.usage.clone() else {
            return;
        };
        let usage = BandwidthUsage {
            amount,
            cid: content_hash_hex(cid),
        };
        tokio::spawn(async move {
            if let Err(e) = reporter.report_usage(usage).await {
                debug!(error = %e, "Failed to send bandwidth usage");
            }
        });
    }

    /// Store blocks already known to be missing from the index
    pub(crate) async fn ingest(&self, owner: Option<&str>, blocks: Vec<Block>) -> Result<WriteOutcome> {
        let outcome = self.writer.write(owner, blocks, &self.config).await?;
        self.record_write(&outcome);
        Ok(outcome)
    }

    pub(crate) fn record_write(&self, outcome: &WriteOutcome) {
        StatsCounters::incr(&self.stats.blocks_stored, outcome.stored.len() as u64);
        StatsCounters::incr(&self.stats.appends, outcome.appends as u64);
        if outcome.created_pack {
            StatsCounters::incr(&self.stats.packs_created, 1);
        }
    }

    /// Cache a batch of exchange blocks; failures are logged, never fatal
    pub(crate) async fn write_back_batch(
        &self,
        fetcher: &NotifyingFetcher,
        batch: &[Block],
        owner: Option<&str>,
    ) {
        StatsCounters::incr(&self.stats.write_back_batches, 1);

        if let Err(e) = self.blockstore.put_many(batch).await {
            error!(blocks = batch.len(), error = %e, "Could not write network blocks to the blockstore");
        }

        match self.ingest(owner, batch.to_vec()).await {
            Ok(outcome) if !outcome.failed.is_empty() => {
                error!(failed = outcome.failed.len(), "Could not add some network blocks to the CDN");
            }
            Ok(_) => {}
            Err(e) => {
                error!(blocks = batch.len(), error = %e, "Could not add network blocks to the CDN");
            }
        }

        announce(fetcher, batch).await;
    }
}

async fn announce(fetcher: &NotifyingFetcher, blocks: &[Block]) {
    if let Err(e) = fetcher.notify_new_blocks(blocks).await {
        warn!(blocks = blocks.len(), error = %e, "Could not tell the exchange about new blocks");
    }
}
