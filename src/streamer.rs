//! Batch read streaming
//!
//! A spawned producer resolves the requested ids and feeds a bounded channel;
//! the caller sees the receiving end as a [`BlockStream`].
//!
//! ```text
//! ids ──validate──▶ CDN lookups (input order) ──hits──────────────────▶ out
//!                        │
//!                        └─misses──▶ exchange.get_blocks ──batches≤32──▶ write-back ──▶ out
//! ```
//!
//! Blocks from the exchange arrive unordered. The stream ends early on
//! cancellation; callers reconcile received ids against requested ones.

use cid::Cid;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block::Block;
use crate::context::CallContext;
use crate::error::BlockServiceError;
use crate::exchange::BlockStream;
use crate::reader::{FetcherSource, ReadCore};
use crate::stats::StatsCounters;
use crate::validator::retain_valid;

/// Most exchange blocks written back and forwarded in one cycle
pub const MAX_BATCH: usize = 32;

/// Stream the blocks for `cids`
pub(crate) fn stream_blocks(
    core: Arc<ReadCore>,
    cids: Vec<Cid>,
    ctx: CallContext,
    source: FetcherSource,
) -> BlockStream {
    let (tx, rx) = mpsc::channel(1);
    let cancel = ctx.cancel.clone();

    tokio::spawn(async move {
        produce(&core, cids, &ctx, &source, &tx).await;
    });

    ReceiverStream::new(rx)
        .take_until(async move { cancel.cancelled().await })
        .boxed()
}

async fn produce(
    core: &ReadCore,
    cids: Vec<Cid>,
    ctx: &CallContext,
    source: &FetcherSource,
    tx: &mpsc::Sender<Block>,
) {
    let cancel = &ctx.cancel;
    let cids = retain_valid(cids);
    if cids.is_empty() {
        return;
    }

    let mut lookups = stream::iter(cids)
        .map(|cid| async move {
            let found = core.cdn_get(&cid, cancel).await;
            (cid, found)
        })
        .buffered(core.config.max_concurrent_lookups.max(1));

    let mut misses = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = lookups.next() => next,
        };
        let Some((cid, found)) = next else {
            break;
        };
        match found {
            Ok(Some(block)) => {
                if !send(tx, cancel, block).await {
                    return;
                }
            }
            Ok(None) => misses.push(cid),
            Err(BlockServiceError::Cancelled) => return,
            Err(e) => {
                debug!(cid = %cid, error = %e, "CDN lookup failed, trying exchange");
                misses.push(cid);
            }
        }
    }
    drop(lookups);

    if misses.is_empty() {
        return;
    }
    let Some(fetcher) = source.resolve().await else {
        debug!(missing = misses.len(), "No exchange configured, ending stream");
        return;
    };

    let requested = misses.len();
    let mut incoming = match fetcher.get_blocks(misses, cancel.clone()).await {
        Ok(incoming) => incoming,
        Err(e) => {
            warn!(requested, error = %e, "Exchange batch request failed");
            return;
        }
    };

    let mut exhausted = false;
    while !exhausted {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = incoming.next() => next,
        };
        let Some(first) = first else {
            break;
        };

        let mut batch = Vec::with_capacity(MAX_BATCH);
        batch.push(first);
        while batch.len() < MAX_BATCH {
            if cancel.is_cancelled() {
                return;
            }
            match incoming.next().now_or_never() {
                Some(Some(block)) => batch.push(block),
                Some(None) => {
                    exhausted = true;
                    break;
                }
                None => break,
            }
        }

        StatsCounters::incr(&core.stats.exchange_fetches, batch.len() as u64);
        debug!(blocks = batch.len(), "Received exchange batch");

        if ctx.cache {
            core.write_back_batch(&fetcher, &batch, ctx.owner()).await;
        }

        for block in batch {
            if !send(tx, cancel, block).await {
                return;
            }
        }
    }
}

/// False once the caller cancelled or dropped the stream
async fn send(tx: &mpsc::Sender<Block>, cancel: &CancellationToken, block: Block) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(block) => sent.is_ok(),
    }
}
