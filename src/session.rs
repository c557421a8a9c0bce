//! Read-only sessions over a block service
//!
//! A session groups related reads so the exchange can route them to the same
//! peers. Whether the exchange supports that is decided once, when the
//! session is built; an exchange without sessions is used directly.

use async_trait::async_trait;
use cid::Cid;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::context::CallContext;
use crate::error::Result;
use crate::exchange::BlockStream;
use crate::reader::{FetcherSource, ReadCore, SessionSlot};
use crate::service::{BlockGetter, BlockService};
use crate::streamer::stream_blocks;

/// Session-scoped read view of a [`BlockService`]
///
/// The underlying exchange session is opened on the first exchange fetch,
/// never more than once.
pub struct Session {
    core: Arc<ReadCore>,
    source: FetcherSource,
}

impl Session {
    /// `scope` bounds the lifetime of the exchange session
    pub fn new(service: &BlockService, scope: CancellationToken) -> Self {
        let source = match service.exchange() {
            Some(exchange) if exchange.supports_sessions() => {
                FetcherSource::Session(Arc::new(SessionSlot::new(Arc::clone(exchange), scope)))
            }
            other => FetcherSource::for_exchange(other),
        };

        Self {
            core: service.core(),
            source,
        }
    }

    /// Whether reads go through an exchange session
    pub fn uses_exchange_session(&self) -> bool {
        matches!(self.source, FetcherSource::Session(_))
    }

    pub async fn get_block(&self, cid: &Cid, ctx: &CallContext) -> Result<Block> {
        self.core.get_block(cid, ctx, &self.source).await
    }

    pub fn get_blocks(&self, cids: Vec<Cid>, ctx: &CallContext) -> BlockStream {
        stream_blocks(Arc::clone(&self.core), cids, ctx.clone(), self.source.clone())
    }
}

#[async_trait]
impl BlockGetter for Session {
    async fn get_block(&self, cid: &Cid, ctx: &CallContext) -> Result<Block> {
        Session::get_block(self, cid, ctx).await
    }

    fn get_blocks(&self, cids: Vec<Cid>, ctx: &CallContext) -> BlockStream {
        Session::get_blocks(self, cids, ctx)
    }
}
