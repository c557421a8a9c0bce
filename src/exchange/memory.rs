//! In-process exchange
//!
//! Serves blocks from a local map as if they came from peers. Batch requests
//! answer in reverse request order so callers can't rely on ordering, and an
//! optional per-block delay makes arrival observable.

use async_trait::async_trait;
use cid::Cid;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{BlockStream, Exchange, Fetcher};
use crate::block::Block;
use crate::error::{BlockServiceError, Result};

#[derive(Default)]
struct Shared {
    blocks: DashMap<Cid, Block>,
    delay: Option<Duration>,
    get_block_calls: AtomicU64,
    get_blocks_calls: AtomicU64,
    session_calls: AtomicU64,
    sessions_created: AtomicU64,
    notified: AtomicU64,
    fail_notify: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    async fn fetch_one(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Block> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(BlockServiceError::Cancelled),
            }
        }
        self.blocks
            .get(cid)
            .map(|b| b.value().clone())
            .ok_or(BlockServiceError::NotFound(*cid))
    }

    fn fetch_many(&self, cids: Vec<Cid>, cancel: CancellationToken) -> BlockStream {
        let found: Vec<Block> = cids
            .iter()
            .rev()
            .filter_map(|c| self.blocks.get(c).map(|b| b.value().clone()))
            .collect();

        let stopped = async move { cancel.cancelled().await };
        match self.delay {
            Some(delay) => futures::stream::iter(found)
                .then(move |block| async move {
                    tokio::time::sleep(delay).await;
                    block
                })
                .take_until(stopped)
                .boxed(),
            None => futures::stream::iter(found).take_until(stopped).boxed(),
        }
    }
}

/// Exchange answering from an in-memory block map
#[derive(Clone, Default)]
pub struct MemoryExchange {
    shared: Arc<Shared>,
    sessions: bool,
}

impl MemoryExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange that also hands out protocol sessions
    pub fn with_sessions() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            sessions: true,
        }
    }

    /// Delay every block delivery by `delay`
    pub fn with_delay(delay: Duration, sessions: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                delay: Some(delay),
                ..Shared::default()
            }),
            sessions,
        }
    }

    /// Make a block available from "peers"
    pub fn insert(&self, block: Block) {
        self.shared.blocks.insert(*block.cid(), block);
    }

    pub fn fail_notifications(&self, fail: bool) {
        self.shared.fail_notify.store(fail, Ordering::Relaxed);
    }

    pub fn get_block_calls(&self) -> u64 {
        self.shared.get_block_calls.load(Ordering::Relaxed)
    }

    pub fn get_blocks_calls(&self) -> u64 {
        self.shared.get_blocks_calls.load(Ordering::Relaxed)
    }

    /// Fetches that went through a session rather than the exchange
    pub fn session_calls(&self) -> u64 {
        self.shared.session_calls.load(Ordering::Relaxed)
    }

    pub fn sessions_created(&self) -> u64 {
        self.shared.sessions_created.load(Ordering::Relaxed)
    }

    /// Blocks announced through `notify_new_blocks`
    pub fn notified(&self) -> u64 {
        self.shared.notified.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Fetcher for MemoryExchange {
    async fn get_block(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Block> {
        self.shared.get_block_calls.fetch_add(1, Ordering::Relaxed);
        self.shared.fetch_one(cid, cancel).await
    }

    async fn get_blocks(&self, cids: Vec<Cid>, cancel: CancellationToken) -> Result<BlockStream> {
        self.shared.get_blocks_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.shared.fetch_many(cids, cancel))
    }
}

#[async_trait]
impl Exchange for MemoryExchange {
    async fn notify_new_blocks(&self, blocks: &[Block]) -> Result<()> {
        if self.shared.fail_notify.load(Ordering::Relaxed) {
            return Err(BlockServiceError::exchange("no peers reachable"));
        }
        self.shared
            .notified
            .fetch_add(blocks.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn supports_sessions(&self) -> bool {
        self.sessions
    }

    fn new_session(&self, _scope: CancellationToken) -> Option<Arc<dyn Fetcher>> {
        if !self.sessions {
            return None;
        }
        self.shared.sessions_created.fetch_add(1, Ordering::Relaxed);
        Some(Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

struct MemorySession {
    shared: Arc<Shared>,
}

#[async_trait]
impl Fetcher for MemorySession {
    async fn get_block(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Block> {
        self.shared.session_calls.fetch_add(1, Ordering::Relaxed);
        self.shared.fetch_one(cid, cancel).await
    }

    async fn get_blocks(&self, cids: Vec<Cid>, cancel: CancellationToken) -> Result<BlockStream> {
        self.shared.session_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.shared.fetch_many(cids, cancel))
    }
}
