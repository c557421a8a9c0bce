//! Peer block exchange interface
//!
//! The exchange is the last resort of the read path: blocks that the
//! placement index doesn't know about are requested from peers. Batch
//! requests resolve as a stream in whatever order peers answer, and may end
//! before every requested block arrived.

mod memory;

pub use memory::MemoryExchange;

use async_trait::async_trait;
use cid::Cid;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::error::Result;

/// Unordered, possibly partial stream of blocks
pub type BlockStream = Pin<Box<dyn Stream<Item = Block> + Send>>;

/// Anything that can fetch blocks from peers
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get_block(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Block>;

    /// Request many blocks at once; the stream ends when the request is
    /// exhausted or `cancel` fires
    async fn get_blocks(&self, cids: Vec<Cid>, cancel: CancellationToken) -> Result<BlockStream>;
}

/// Block exchange protocol (bitswap-like)
#[async_trait]
pub trait Exchange: Fetcher {
    /// Announce blocks we can now serve. Advisory only.
    async fn notify_new_blocks(&self, blocks: &[Block]) -> Result<()>;

    /// Whether `new_session` hands out protocol sessions
    fn supports_sessions(&self) -> bool {
        false
    }

    /// Open a session that groups related requests to the same peers
    fn new_session(&self, _scope: CancellationToken) -> Option<Arc<dyn Fetcher>> {
        None
    }

    async fn close(&self) -> Result<()>;
}

/// Fetches through either the exchange itself or one of its sessions, and
/// always announces through the exchange
#[derive(Clone)]
pub(crate) struct NotifyingFetcher {
    exchange: Arc<dyn Exchange>,
    session: Option<Arc<dyn Fetcher>>,
}

impl NotifyingFetcher {
    pub(crate) fn direct(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            session: None,
        }
    }

    pub(crate) fn session(exchange: Arc<dyn Exchange>, session: Arc<dyn Fetcher>) -> Self {
        Self {
            exchange,
            session: Some(session),
        }
    }

    pub(crate) async fn get_block(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Block> {
        match &self.session {
            Some(session) => session.get_block(cid, cancel).await,
            None => self.exchange.get_block(cid, cancel).await,
        }
    }

    pub(crate) async fn get_blocks(
        &self,
        cids: Vec<Cid>,
        cancel: CancellationToken,
    ) -> Result<BlockStream> {
        match &self.session {
            Some(session) => session.get_blocks(cids, cancel).await,
            None => self.exchange.get_blocks(cids, cancel).await,
        }
    }

    pub(crate) async fn notify_new_blocks(&self, blocks: &[Block]) -> Result<()> {
        self.exchange.notify_new_blocks(blocks).await
    }
}
