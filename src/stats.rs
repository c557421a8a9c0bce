//! Service counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) cdn_hits: AtomicU64,
    pub(crate) exchange_fetches: AtomicU64,
    pub(crate) dedup_skips: AtomicU64,
    pub(crate) blocks_stored: AtomicU64,
    pub(crate) packs_created: AtomicU64,
    pub(crate) appends: AtomicU64,
    pub(crate) write_back_batches: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            cdn_hits: self.cdn_hits.load(Ordering::Relaxed),
            exchange_fetches: self.exchange_fetches.load(Ordering::Relaxed),
            dedup_skips: self.dedup_skips.load(Ordering::Relaxed),
            blocks_stored: self.blocks_stored.load(Ordering::Relaxed),
            packs_created: self.packs_created.load(Ordering::Relaxed),
            appends: self.appends.load(Ordering::Relaxed),
            write_back_batches: self.write_back_batches.load(Ordering::Relaxed),
        }
    }
}

/// Public statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Blocks served from the CDN by ranged fetch
    pub cdn_hits: u64,
    /// Blocks received from the exchange
    pub exchange_fetches: u64,
    /// Writes skipped because the block was already indexed
    pub dedup_skips: u64,
    /// Blocks uploaded and indexed
    pub blocks_stored: u64,
    pub packs_created: u64,
    /// Append requests sent to existing packs
    pub appends: u64,
    /// Exchange batches written back into the local stores
    pub write_back_batches: u64,
}
