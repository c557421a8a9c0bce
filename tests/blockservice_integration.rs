//! Integration tests for the block service
//!
//! Every collaborator is in-process: pack store, placement index, exchange
//! and blockstore. The last tests swap in the sled index and filesystem
//! blockstore.

use async_trait::async_trait;
use cid::multihash::Multihash;
use cid::Cid;
use elohim_blockservice::{
    content_hash_hex, BandwidthUsage, Block, BlockGetter, BlockService, BlockServiceError,
    Blockstore, CallContext, FileRecord, FsBlockstore, MemoryBlockstore, MemoryExchange,
    MemoryIndex, MemoryRemoteStore, PlacementIndex, ServiceConfig, Session, SledIndex,
    UsageReporter, MAX_BATCH,
};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Collaborators behind one service, kept for inspection
struct Harness {
    service: BlockService,
    index: Arc<MemoryIndex>,
    remote: Arc<MemoryRemoteStore>,
    exchange: MemoryExchange,
    blockstore: Arc<CountingBlockstore>,
}

impl Harness {
    fn new(exchange: MemoryExchange) -> Self {
        let index = Arc::new(MemoryIndex::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let blockstore = Arc::new(CountingBlockstore::default());
        let service = BlockService::new(
            blockstore.clone(),
            Some(Arc::new(exchange.clone())),
            index.clone(),
            remote.clone(),
        );
        Self {
            service,
            index,
            remote,
            exchange,
            blockstore,
        }
    }

    fn placements(&self) -> PlacementIndex {
        PlacementIndex::new(self.index.clone())
    }
}

/// Blockstore that remembers the size of every multi-put
#[derive(Default)]
struct CountingBlockstore {
    inner: MemoryBlockstore,
    put_many_sizes: Mutex<Vec<usize>>,
}

impl CountingBlockstore {
    fn put_many_sizes(&self) -> Vec<usize> {
        self.put_many_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Blockstore for CountingBlockstore {
    async fn get(&self, cid: &Cid) -> elohim_blockservice::Result<Block> {
        self.inner.get(cid).await
    }

    async fn has(&self, cid: &Cid) -> elohim_blockservice::Result<bool> {
        self.inner.has(cid).await
    }

    async fn put(&self, block: &Block) -> elohim_blockservice::Result<()> {
        self.inner.put(block).await
    }

    async fn put_many(&self, blocks: &[Block]) -> elohim_blockservice::Result<()> {
        self.put_many_sizes.lock().unwrap().push(blocks.len());
        self.inner.put_many(blocks).await
    }

    async fn delete(&self, cid: &Cid) -> elohim_blockservice::Result<()> {
        self.inner.delete(cid).await
    }
}

struct RecordingReporter {
    tx: mpsc::UnboundedSender<BandwidthUsage>,
}

#[async_trait]
impl UsageReporter for RecordingReporter {
    async fn report_usage(&self, usage: BandwidthUsage) -> elohim_blockservice::Result<()> {
        let _ = self.tx.send(usage);
        Ok(())
    }
}

fn numbered_blocks(n: usize) -> Vec<Block> {
    (0..n)
        .map(|i| Block::new(format!("block number {}", i).into_bytes()))
        .collect()
}

/// CID hashed with sha1, which the validator refuses
fn sha1_cid() -> Cid {
    let hash = Multihash::<64>::wrap(0x11, &[7u8; 20]).unwrap();
    Cid::new_v1(0x55, hash)
}

async fn collect(stream: elohim_blockservice::BlockStream) -> Vec<Block> {
    stream.collect().await
}

#[tokio::test]
async fn test_add_block_is_idempotent() {
    let h = Harness::new(MemoryExchange::new());
    let block = Block::new(b"write me once".to_vec());
    let ctx = CallContext::new().with_owner("u1");

    h.service.add_block(block.clone(), &ctx).await.unwrap();
    h.service.add_block(block, &ctx).await.unwrap();

    assert_eq!(h.remote.upload_count(), 1);
    assert_eq!(h.remote.append_count(), 0);
    assert_eq!(h.service.stats().dedup_skips, 1);
}

#[tokio::test]
async fn test_round_trip_returns_identical_bytes() {
    let h = Harness::new(MemoryExchange::new());
    let ctx = CallContext::new().with_owner("u1");
    let blocks = vec![
        Block::new(Vec::new()),
        Block::new(b"x".to_vec()),
        Block::new(vec![0xab; 4096]),
    ];

    for block in &blocks {
        h.service.add_block(block.clone(), &ctx).await.unwrap();
    }
    for block in &blocks {
        let got = h.service.get_block(block.cid(), &ctx).await.unwrap();
        assert_eq!(got.data(), block.data());
    }
    assert_eq!(h.exchange.get_block_calls(), 0);
}

#[tokio::test]
async fn test_unsafe_cids_rejected_by_single_operations() {
    let h = Harness::new(MemoryExchange::new());
    let bad = Block::with_cid(b"weak".to_vec(), sha1_cid());
    let ctx = CallContext::new().with_owner("u1");

    let err = h.service.add_block(bad.clone(), &ctx).await.unwrap_err();
    assert!(err.is_security());

    let err = h.service.get_block(bad.cid(), &ctx).await.unwrap_err();
    assert!(err.is_security());

    let err = h.service.delete_block(bad.cid()).await.unwrap_err();
    assert!(err.is_security());

    assert_eq!(h.remote.upload_count(), 0);
    assert_eq!(h.exchange.get_block_calls(), 0);
}

#[tokio::test]
async fn test_unsafe_cid_aborts_whole_batch_write() {
    let h = Harness::new(MemoryExchange::new());
    let good = Block::new(b"fine".to_vec());
    let bad = Block::with_cid(b"weak".to_vec(), sha1_cid());

    let err = h
        .service
        .add_blocks(vec![good.clone(), bad], &CallContext::new().with_owner("u1"))
        .await
        .unwrap_err();

    assert!(err.is_security());
    assert_eq!(h.remote.upload_count(), 0);
    assert!(h.placements().file_info(good.cid()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unsafe_cid_dropped_from_batch_read() {
    let h = Harness::new(MemoryExchange::new());
    let good = Block::new(b"fine".to_vec());
    let ctx = CallContext::new().with_owner("u1");
    h.service.add_block(good.clone(), &ctx).await.unwrap();

    let got = collect(h.service.get_blocks(vec![sha1_cid(), *good.cid()], &ctx)).await;

    assert_eq!(got, vec![good]);
}

#[tokio::test]
async fn test_rotation_after_threshold() {
    let h = Harness::new(MemoryExchange::new());
    let placements = h.placements();
    placements
        .put_file_record(
            "u1",
            &FileRecord {
                pack_id: "legacy-pack".to_string(),
                size: 100 * 1024 * 1024 + 1,
            },
        )
        .await
        .unwrap();

    let block = Block::new(b"fresh pack please".to_vec());
    h.service
        .add_block(block.clone(), &CallContext::new().with_owner("u1"))
        .await
        .unwrap();

    assert_eq!(h.remote.upload_count(), 1);
    assert_eq!(h.remote.append_count(), 0);
    let info = placements.file_info(block.cid()).await.unwrap().unwrap();
    assert_ne!(info.pack_id, "legacy-pack");

    let record = placements.file_record("u1").await.unwrap().unwrap();
    assert_eq!(record.pack_id, info.pack_id);
    assert_eq!(record.size, block.len() as u64);
}

#[tokio::test]
async fn test_rotation_with_lowered_threshold() {
    let h = Harness::new(MemoryExchange::new());
    let service = h.service.clone().with_config(ServiceConfig {
        pack_rotation_bytes: 10,
        ..ServiceConfig::default()
    });
    let ctx = CallContext::new().with_owner("u1");
    let small = Block::new(b"tiny".to_vec());
    let large = Block::new(b"sixteen bytes!!!".to_vec());
    let next = Block::new(b"next".to_vec());

    service.add_block(small.clone(), &ctx).await.unwrap();
    service.add_block(large.clone(), &ctx).await.unwrap();
    service.add_block(next.clone(), &ctx).await.unwrap();

    let placements = h.placements();
    let first = placements.file_info(small.cid()).await.unwrap().unwrap();
    let second = placements.file_info(large.cid()).await.unwrap().unwrap();
    let third = placements.file_info(next.cid()).await.unwrap().unwrap();

    // 4 bytes is under the threshold, 20 is over it
    assert_eq!(first.pack_id, second.pack_id);
    assert_ne!(second.pack_id, third.pack_id);
    assert_eq!(h.remote.upload_count(), 2);
    assert_eq!(service.stats().packs_created, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batch_writes_rotate_once() {
    let h = Harness::new(MemoryExchange::new());
    let service = h.service.clone().with_config(ServiceConfig {
        pack_rotation_bytes: 100,
        ..ServiceConfig::default()
    });
    let ctx = CallContext::new().with_owner("u1");

    // 90 bytes: the next write appends, and that append crosses the threshold
    let seed = Block::new(vec![0xee; 90]);
    service.add_block(seed.clone(), &ctx).await.unwrap();
    let placements = h.placements();
    let old_pack = placements.file_info(seed.cid()).await.unwrap().unwrap().pack_id;

    let left: Vec<Block> = (0..2u8).map(|i| Block::new(vec![i; 10])).collect();
    let right: Vec<Block> = (10..12u8).map(|i| Block::new(vec![i; 10])).collect();
    let (a, b) = tokio::join!(
        service.add_blocks(left.clone(), &ctx),
        service.add_blocks(right.clone(), &ctx)
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(h.remote.upload_count(), 2);
    assert_eq!(h.remote.append_count(), 1);

    let mut packs = Vec::new();
    for batch in [&left, &right] {
        let first = placements.file_info(batch[0].cid()).await.unwrap().unwrap();
        let second = placements.file_info(batch[1].cid()).await.unwrap().unwrap();
        assert_eq!(first.pack_id, second.pack_id);
        packs.push(first.pack_id);
    }
    let in_old = packs.iter().filter(|p| **p == old_pack).count();
    assert_eq!(in_old, 1);

    let new_pack = packs.into_iter().find(|p| *p != old_pack).unwrap();
    let record = placements.file_record("u1").await.unwrap().unwrap();
    assert_eq!(record.pack_id, new_pack);
    assert_eq!(record.size, 20);
}

#[tokio::test]
async fn test_exchange_fallback_with_write_back() {
    let h = Harness::new(MemoryExchange::new());
    let block = Block::new(b"only peers have this".to_vec());
    h.exchange.insert(block.clone());
    let ctx = CallContext::new().with_owner("u1").with_cache(true);

    let first = h.service.get_block(block.cid(), &ctx).await.unwrap();
    let second = h.service.get_block(block.cid(), &ctx).await.unwrap();

    assert_eq!(first, block);
    assert_eq!(second, block);
    assert_eq!(h.exchange.get_block_calls(), 1);
    assert_eq!(h.remote.range_fetch_count(), 1);
    assert_eq!(h.exchange.notified(), 1);
    assert!(h.blockstore.has(block.cid()).await.unwrap());

    let stats = h.service.stats();
    assert_eq!(stats.exchange_fetches, 1);
    assert_eq!(stats.cdn_hits, 1);
}

#[tokio::test]
async fn test_fallback_without_cache_does_not_write_back() {
    let h = Harness::new(MemoryExchange::new());
    let block = Block::new(b"just passing through".to_vec());
    h.exchange.insert(block.clone());
    let ctx = CallContext::new().with_owner("u1");

    h.service.get_block(block.cid(), &ctx).await.unwrap();
    h.service.get_block(block.cid(), &ctx).await.unwrap();

    assert_eq!(h.exchange.get_block_calls(), 2);
    assert_eq!(h.remote.upload_count(), 0);
    assert!(!h.blockstore.has(block.cid()).await.unwrap());
}

#[tokio::test]
async fn test_batch_read_hits_precede_misses() {
    let h = Harness::new(MemoryExchange::new());
    let ctx = CallContext::new().with_owner("u1");
    let stored = numbered_blocks(3);
    for block in &stored {
        h.service.add_block(block.clone(), &ctx).await.unwrap();
    }
    let remote_only = Block::new(b"from the exchange".to_vec());
    h.exchange.insert(remote_only.clone());
    let missing = Block::new(b"nobody has this".to_vec());

    let request = vec![
        *remote_only.cid(),
        *stored[2].cid(),
        *missing.cid(),
        *stored[0].cid(),
        *stored[1].cid(),
    ];
    let got = collect(h.service.get_blocks(request, &ctx)).await;

    assert_eq!(
        got,
        vec![
            stored[2].clone(),
            stored[0].clone(),
            stored[1].clone(),
            remote_only
        ]
    );
    assert_eq!(h.exchange.get_blocks_calls(), 1);
}

#[tokio::test]
async fn test_batch_read_all_hits_skips_exchange() {
    let h = Harness::new(MemoryExchange::new());
    let ctx = CallContext::new().with_owner("u1");
    let blocks = numbered_blocks(4);
    h.service.add_blocks(blocks.clone(), &ctx).await.unwrap();

    let got = collect(h.service.get_blocks(blocks.iter().map(|b| *b.cid()).collect(), &ctx)).await;

    assert_eq!(got, blocks);
    assert_eq!(h.exchange.get_blocks_calls(), 0);
}

#[tokio::test]
async fn test_write_back_batches_never_exceed_cap() {
    let h = Harness::new(MemoryExchange::new());
    let blocks = numbered_blocks(70);
    for block in &blocks {
        h.exchange.insert(block.clone());
    }
    let ctx = CallContext::new().with_owner("u1").with_cache(true);

    let got = collect(h.service.get_blocks(blocks.iter().map(|b| *b.cid()).collect(), &ctx)).await;

    assert_eq!(got.len(), 70);
    let sizes = h.blockstore.put_many_sizes();
    assert!(sizes.iter().all(|&n| n <= MAX_BATCH));
    assert_eq!(sizes, vec![32, 32, 6]);
    assert_eq!(h.service.stats().write_back_batches, 3);
    assert_eq!(h.exchange.notified(), 70);

    // Everything written back is now served by the CDN
    let again = collect(h.service.get_blocks(blocks.iter().map(|b| *b.cid()).collect(), &ctx)).await;
    assert_eq!(again.len(), 70);
    assert_eq!(h.exchange.get_blocks_calls(), 1);
}

#[tokio::test]
async fn test_cancellation_stops_stream() {
    let exchange = MemoryExchange::with_delay(Duration::from_millis(20), false);
    let h = Harness::new(exchange);
    let blocks = numbered_blocks(20);
    for block in &blocks {
        h.exchange.insert(block.clone());
    }

    let cancel = CancellationToken::new();
    let ctx = CallContext::new().with_cancel(cancel.clone());
    let mut stream = h.service.get_blocks(blocks.iter().map(|b| *b.cid()).collect(), &ctx);

    let first = stream.next().await;
    assert!(first.is_some());
    cancel.cancel();

    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_cancelled_single_read() {
    let exchange = MemoryExchange::with_delay(Duration::from_secs(60), false);
    let h = Harness::new(exchange);
    let block = Block::new(b"slow peers".to_vec());
    h.exchange.insert(block.clone());

    let cancel = CancellationToken::new();
    let ctx = CallContext::new().with_cancel(cancel.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let err = h.service.get_block(block.cid(), &ctx).await.unwrap_err();
    assert!(matches!(err, BlockServiceError::Cancelled));
    canceller.await.unwrap();
}

#[tokio::test]
async fn test_three_block_pack_scenario() {
    let index = Arc::new(MemoryIndex::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let service = BlockService::write_through(
        Arc::new(MemoryBlockstore::new()),
        None,
        index.clone(),
        remote.clone(),
    );
    let b1 = Block::new(b"first block".to_vec());
    let b2 = Block::new(b"the second, somewhat longer block".to_vec());
    let b3 = Block::new(b"third".to_vec());
    let ctx = CallContext::new().with_owner("u1");

    service
        .add_blocks(vec![b1.clone(), b2.clone(), b3.clone()], &ctx)
        .await
        .unwrap();

    assert_eq!(remote.pack_count(), 1);
    let placements = PlacementIndex::new(index.clone());
    let mut infos = Vec::new();
    for block in [&b1, &b2, &b3] {
        infos.push(placements.file_info(block.cid()).await.unwrap().unwrap());
    }

    let pack_id = infos[0].pack_id.clone();
    assert!(infos.iter().all(|i| i.pack_id == pack_id));
    assert!(infos[0].offset < infos[1].offset && infos[1].offset < infos[2].offset);
    for pair in infos.windows(2) {
        assert!(pair[0].offset + pair[0].size <= pair[1].offset);
    }

    let total: u64 = [&b1, &b2, &b3].iter().map(|b| b.len() as u64).sum();
    assert_eq!(infos.iter().map(|i| i.size).sum::<u64>(), total);
    assert_eq!(remote.pack_size(&pack_id).await, Some(total));
    assert_eq!(placements.file_record("u1").await.unwrap().unwrap().size, total);

    let got = service.get_block(b2.cid(), &ctx).await.unwrap();
    assert_eq!(got.data(), b2.data());
    assert_eq!(
        remote.fetched_ranges().await,
        vec![(pack_id, infos[1].offset, infos[1].size)]
    );
}

#[tokio::test]
async fn test_partial_batch_failure_keeps_siblings() {
    let h = Harness::new(MemoryExchange::new());
    let service = h.service.clone().with_config(ServiceConfig {
        max_files_per_request: 2,
        ..ServiceConfig::default()
    });
    let blocks = numbered_blocks(6);
    h.remote.reject_file(blocks[5].content_hash());
    let ctx = CallContext::new().with_owner("u1");

    let err = service.add_blocks(blocks.clone(), &ctx).await.unwrap_err();

    let failed = match err {
        BlockServiceError::Aggregate(failed) => failed,
        other => panic!("expected aggregate error, got {:?}", other),
    };
    let failed: HashSet<Cid> = failed.into_iter().map(|(cid, _)| cid).collect();
    let expected: HashSet<Cid> = [*blocks[4].cid(), *blocks[5].cid()].into_iter().collect();
    assert_eq!(failed, expected);

    for block in &blocks[..4] {
        assert_eq!(&service.get_block(block.cid(), &ctx).await.unwrap(), block);
    }
    let err = service.get_block(blocks[4].cid(), &ctx).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.exchange.notified(), 0);
}

#[tokio::test]
async fn test_failed_pack_creation_fails_batch() {
    let h = Harness::new(MemoryExchange::new());
    let blocks = numbered_blocks(3);
    h.remote.reject_file(blocks[0].content_hash());

    let err = h
        .service
        .add_blocks(blocks, &CallContext::new().with_owner("u1"))
        .await
        .unwrap_err();

    assert!(matches!(err, BlockServiceError::Upstream { .. }));
    assert!(h.placements().file_record("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_created_once_under_concurrent_first_use() {
    let exchange = MemoryExchange::with_delay(Duration::from_millis(5), true);
    let h = Harness::new(exchange);
    let blocks = numbered_blocks(8);
    for block in &blocks {
        h.exchange.insert(block.clone());
    }

    let session = Arc::new(Session::new(&h.service, CancellationToken::new()));
    let reads = blocks.iter().map(|block| {
        let session = Arc::clone(&session);
        let cid = *block.cid();
        tokio::spawn(async move { session.get_block(&cid, &CallContext::new()).await })
    });
    let results = futures::future::join_all(reads).await;

    for (result, block) in results.into_iter().zip(&blocks) {
        assert_eq!(&result.unwrap().unwrap(), block);
    }
    assert_eq!(h.exchange.sessions_created(), 1);
    assert_eq!(h.exchange.session_calls(), 8);
    assert_eq!(h.exchange.get_block_calls(), 0);
}

#[tokio::test]
async fn test_session_not_opened_for_cdn_hits() {
    let h = Harness::new(MemoryExchange::with_sessions());
    let block = Block::new(b"on the cdn".to_vec());
    let ctx = CallContext::new().with_owner("u1");
    h.service.add_block(block.clone(), &ctx).await.unwrap();

    let session = Session::new(&h.service, CancellationToken::new());
    let getter: &dyn BlockGetter = &session;
    assert_eq!(getter.get_block(block.cid(), &ctx).await.unwrap(), block);
    let got = collect(getter.get_blocks(vec![*block.cid()], &ctx)).await;
    assert_eq!(got, vec![block]);

    assert_eq!(h.exchange.sessions_created(), 0);
}

#[tokio::test]
async fn test_offline_mode() {
    let service = BlockService::new(
        Arc::new(MemoryBlockstore::new()),
        None,
        Arc::new(MemoryIndex::new()),
        Arc::new(MemoryRemoteStore::new()),
    );
    let ctx = CallContext::new().with_owner("u1");
    let stored = Block::new(b"stored".to_vec());
    let unknown = Block::new(b"unknown".to_vec());
    service.add_block(stored.clone(), &ctx).await.unwrap();

    assert!(service.exchange().is_none());
    assert!(service
        .get_block(unknown.cid(), &ctx)
        .await
        .unwrap_err()
        .is_not_found());
    let got = collect(service.get_blocks(vec![*unknown.cid(), *stored.cid()], &ctx)).await;
    assert_eq!(got, vec![stored]);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_close_leaves_stores_usable() {
    let h = Harness::new(MemoryExchange::new());
    let ctx = CallContext::new().with_owner("u1");
    let block = Block::new(b"still here".to_vec());
    h.service.add_block(block.clone(), &ctx).await.unwrap();

    h.service.close().await.unwrap();

    assert!(h.exchange.is_closed());
    assert_eq!(h.service.get_block(block.cid(), &ctx).await.unwrap(), block);
}

#[tokio::test]
async fn test_delete_only_evicts_local_copy() {
    let h = Harness::new(MemoryExchange::new());
    let block = Block::new(b"cached locally".to_vec());
    h.exchange.insert(block.clone());
    let ctx = CallContext::new().with_owner("u1").with_cache(true);
    h.service.get_block(block.cid(), &ctx).await.unwrap();
    assert!(h.blockstore.has(block.cid()).await.unwrap());

    h.service.delete_block(block.cid()).await.unwrap();

    assert!(!h.blockstore.has(block.cid()).await.unwrap());
    assert!(h.placements().file_info(block.cid()).await.unwrap().is_some());
    assert_eq!(h.service.get_block(block.cid(), &ctx).await.unwrap(), block);

    let err = h.service.delete_block(block.cid()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_notify_failure_is_swallowed() {
    let h = Harness::new(MemoryExchange::new());
    h.exchange.fail_notifications(true);
    let ctx = CallContext::new().with_owner("u1").with_cache(true);

    h.service
        .add_block(Block::new(b"announce me".to_vec()), &ctx)
        .await
        .unwrap();

    let fetched = Block::new(b"and me".to_vec());
    h.exchange.insert(fetched.clone());
    assert_eq!(h.service.get_block(fetched.cid(), &ctx).await.unwrap(), fetched);

    let got = collect(h.service.get_blocks(vec![*Block::new(b"x".to_vec()).cid()], &ctx)).await;
    assert!(got.is_empty());
    assert_eq!(h.exchange.notified(), 0);
}

#[tokio::test]
async fn test_dedicated_gateway_reports_cdn_bandwidth() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = Harness::new(MemoryExchange::new());
    let service = h
        .service
        .clone()
        .with_config(ServiceConfig {
            dedicated_gateway: true,
            ..ServiceConfig::default()
        })
        .with_usage_reporter(Arc::new(RecordingReporter { tx }));
    let block = Block::new(b"metered bytes".to_vec());
    let ctx = CallContext::new().with_owner("u1");
    service.add_block(block.clone(), &ctx).await.unwrap();

    service.get_block(block.cid(), &ctx).await.unwrap();

    let usage = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.amount, block.len() as u64);
    assert_eq!(usage.cid, content_hash_hex(block.cid()));
}

#[tokio::test]
async fn test_no_metering_outside_dedicated_gateway() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = Harness::new(MemoryExchange::new());
    let service = h
        .service
        .clone()
        .with_usage_reporter(Arc::new(RecordingReporter { tx }));
    let block = Block::new(b"free bytes".to_vec());
    let ctx = CallContext::new().with_owner("u1");
    service.add_block(block.clone(), &ctx).await.unwrap();

    service.get_block(block.cid(), &ctx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_persistent_stores_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let exchange = MemoryExchange::new();
    let remote = Arc::new(MemoryRemoteStore::new());
    let from_peers = Block::new(b"fetched from peers".to_vec());
    exchange.insert(from_peers.clone());
    let added = Block::new(b"added locally".to_vec());
    let ctx = CallContext::new().with_owner("u1").with_cache(true);

    {
        let index = Arc::new(SledIndex::open(temp_dir.path().join("placements.sled")).unwrap());
        let blockstore = Arc::new(FsBlockstore::new(temp_dir.path().join("cache")).await.unwrap());
        let service = BlockService::new(
            blockstore.clone(),
            Some(Arc::new(exchange.clone())),
            index.clone(),
            remote.clone(),
        );

        service.add_block(added.clone(), &ctx).await.unwrap();
        service.get_block(from_peers.cid(), &ctx).await.unwrap();
        assert!(blockstore.has(from_peers.cid()).await.unwrap());
        index.flush().await.unwrap();
    }

    let index = Arc::new(SledIndex::open(temp_dir.path().join("placements.sled")).unwrap());
    let service = BlockService::new(
        Arc::new(FsBlockstore::new(temp_dir.path().join("cache")).await.unwrap()),
        None,
        index,
        remote,
    );
    assert_eq!(service.get_block(added.cid(), &ctx).await.unwrap(), added);
    assert_eq!(service.get_block(from_peers.cid(), &ctx).await.unwrap(), from_peers);
    assert_eq!(exchange.get_block_calls(), 1);
}
