use crate::{
    io::OutputMessage,
    pool::{AddBlockError, BlockPool},
    Config,
};
use assert_matches::assert_matches;
use quorum_consensus_roles::{
    node::PeerId,
    validator::{
        Block, BlockHeader, BlockHeight, BlockId, Commit, Hash, Payload, Timestamp,
    },
};
use std::collections::HashMap;
use zksync_concurrency::{ctx, time};

fn make_block(height: u64) -> Box<Block> {
    Box::new(Block {
        header: BlockHeader {
            chain_id: "testchain".to_string(),
            height: BlockHeight(height),
            time: Timestamp(height as i64),
            last_block_id: BlockId::nil(),
            last_commit_hash: Hash::zero(),
            validators_hash: Hash::zero(),
            app_hash: Hash::zero(),
            results_hash: Hash::zero(),
            proposer_address: Default::default(),
        },
        payload: Payload(vec![0; 128]),
        evidence: vec![],
        last_commit: Commit::initial(),
    })
}

fn test_pool(config: Config) -> (BlockPool, ctx::channel::UnboundedReceiver<OutputMessage>) {
    let (send, recv) = ctx::channel::unbounded();
    (BlockPool::new(config, BlockHeight(1), send), recv)
}

/// Runs scheduler steps until no new requests come out.
async fn drain_scheduler(
    ctx: &ctx::Ctx,
    pool: &BlockPool,
    outputs: &mut ctx::channel::UnboundedReceiver<OutputMessage>,
) -> Vec<(PeerId, BlockHeight)> {
    let mut requests = vec![];
    // Enough steps to exhaust all assignable heights.
    for _ in 0..2000 {
        pool.schedule_step(ctx).await.unwrap();
    }
    while let Some(msg) = outputs.try_recv() {
        if let OutputMessage::GetBlock { peer, height } = msg {
            requests.push((peer, height));
        }
    }
    requests
}

/// Two partially overlapping peers sync the chain: requests respect the
/// per-peer cap, the accounting stays consistent, heights past the first
/// peer's range go to the second one, and consumption advances in order.
#[tokio::test]
async fn syncs_across_two_peers() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let (pool, mut outputs) = test_pool(Config::default());
    let p1 = PeerId::from("p1");
    let p2 = PeerId::from("p2");

    pool.set_peer_range(ctx, p1.clone(), BlockHeight(1), BlockHeight(100))
        .await
        .unwrap();
    pool.set_peer_range(ctx, p2.clone(), BlockHeight(50), BlockHeight(200))
        .await
        .unwrap();

    let mut served: HashMap<BlockHeight, PeerId> = HashMap::new();
    let mut last_height = BlockHeight(0);
    for _ in 0..64 {
        let requests = drain_scheduler(ctx, &pool, &mut outputs).await;
        // Peers never carry more than their cap.
        for peer in [&p1, &p2] {
            let pending = pool.peer_pending(ctx, peer).await.unwrap().unwrap_or(0);
            assert!(pending <= 20, "{peer} carries {pending} requests");
        }
        assert_eq!(
            pool.status(ctx).await.unwrap().1,
            pool.pending_per_peer_sum(ctx).await.unwrap()
        );
        // Serve every request, then drain the consumer side.
        for (peer, height) in requests {
            assert!(served.insert(height, peer.clone()).is_none());
            pool.add_block(ctx, peer, make_block(height.0), 128)
                .await
                .unwrap()
                .unwrap();
        }
        let (_, _, buffered) = pool.status(ctx).await.unwrap();
        for _ in 0..buffered {
            let (_, block) = pool.next_block(ctx).await.unwrap();
            assert_eq!(block.header.height, last_height.next());
            last_height = block.header.height;
        }
        if last_height >= BlockHeight(150) {
            break;
        }
    }
    assert!(last_height >= BlockHeight(150), "sync stalled at {last_height}");
    // Heights past the first peer's range can only have come from the
    // second peer; early heights only from the first.
    for (height, peer) in &served {
        if height.0 > 100 {
            assert_eq!(peer, &p2, "height {height}");
        }
        if height.0 < 50 {
            assert_eq!(peer, &p1, "height {height}");
        }
    }
}

/// Blocks are consumed strictly in height order, even when deliveries
/// arrive out of order, and consumption frees capacity for new heights.
#[tokio::test]
async fn blocks_are_consumed_in_order() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let (pool, mut outputs) = test_pool(Config::default());
    let p1 = PeerId::from("p1");
    let p2 = PeerId::from("p2");

    pool.set_peer_range(ctx, p1.clone(), BlockHeight(1), BlockHeight(100))
        .await
        .unwrap();
    pool.set_peer_range(ctx, p2.clone(), BlockHeight(50), BlockHeight(200))
        .await
        .unwrap();

    let mut assigned: HashMap<BlockHeight, PeerId> = HashMap::new();
    for (peer, height) in drain_scheduler(ctx, &pool, &mut outputs).await {
        assigned.insert(height, peer);
    }
    assert!(!assigned.is_empty());

    // Deliver the assigned heights in reverse.
    let mut heights: Vec<_> = assigned.keys().copied().collect();
    heights.sort();
    for &height in heights.iter().rev() {
        let peer = assigned[&height].clone();
        pool.add_block(ctx, peer, make_block(height.0), 128)
            .await
            .unwrap()
            .unwrap();
    }

    // The consumer sees them strictly in order regardless.
    for &height in &heights {
        let (_, block) = pool.next_block(ctx).await.unwrap();
        assert_eq!(block.header.height, height);
    }
    let (next_height, num_pending, _) = pool.status(ctx).await.unwrap();
    assert_eq!(next_height, heights.last().unwrap().next());
    assert_eq!(num_pending, 0);
}

/// An unsolicited delivery is rejected and counted against the peer.
#[tokio::test]
async fn unsolicited_blocks_are_rejected() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let (pool, mut outputs) = test_pool(Config {
        max_peer_err_count: 2,
        ..Config::default()
    });
    let p1 = PeerId::from("p1");
    let p2 = PeerId::from("p2");
    pool.set_peer_range(ctx, p1.clone(), BlockHeight(1), BlockHeight(100))
        .await
        .unwrap();

    // Assign height 1 to p1, then have p2 deliver it.
    pool.schedule_step(ctx).await.unwrap();
    pool.set_peer_range(ctx, p2.clone(), BlockHeight(1), BlockHeight(100))
        .await
        .unwrap();
    let res = pool
        .add_block(ctx, p2.clone(), make_block(1), 128)
        .await
        .unwrap();
    assert_matches!(res, Err(AddBlockError::Unsolicited { .. }));

    // Exhausting the error budget evicts the peer.
    for _ in 0..3 {
        let _ = pool.add_block(ctx, p2.clone(), make_block(1), 128).await.unwrap();
    }
    assert!(pool.peer_pending(ctx, &p2).await.unwrap().is_none());
    let sanctioned = std::iter::from_fn(|| outputs.try_recv()).any(|msg| {
        matches!(&msg, OutputMessage::PeerError { peer, .. } if *peer == p2)
    });
    assert!(sanctioned);
}

/// A peer that stays silent past the timeout is evicted and its heights
/// are reassigned to another peer.
#[tokio::test]
async fn timed_out_peer_is_evicted_and_requests_requeued() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let (pool, mut outputs) = test_pool(Config {
        peer_timeout: time::Duration::milliseconds(50),
        max_block_lookahead: 3,
        max_pending_requests_per_peer: 3,
        ..Config::default()
    });
    let slow = PeerId::from("slow");
    pool.set_peer_range(ctx, slow.clone(), BlockHeight(1), BlockHeight(100))
        .await
        .unwrap();

    let requests = drain_scheduler(ctx, &pool, &mut outputs).await;
    assert!(requests.iter().all(|(peer, _)| *peer == slow));
    assert!(!requests.is_empty());

    // Let the per-peer timer expire, then reap.
    ctx.sleep(time::Duration::milliseconds(80)).await.unwrap();
    let fast = PeerId::from("fast");
    pool.set_peer_range(ctx, fast.clone(), BlockHeight(1), BlockHeight(100))
        .await
        .unwrap();
    let reassigned = drain_scheduler(ctx, &pool, &mut outputs).await;

    // The silent peer is gone and its heights went to the healthy one.
    assert!(pool.peer_pending(ctx, &slow).await.unwrap().is_none());
    for (_, height) in &requests {
        assert!(reassigned.iter().any(|(p, h)| p == &fast && h == height));
    }
    let (_, num_pending, _) = pool.status(ctx).await.unwrap();
    assert_eq!(num_pending, pool.pending_per_peer_sum(ctx).await.unwrap());
}

/// The lookahead cap bounds how far requests run past consumption.
#[tokio::test]
async fn lookahead_is_bounded() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let (pool, mut outputs) = test_pool(Config {
        max_block_lookahead: 5,
        ..Config::default()
    });
    let p1 = PeerId::from("p1");
    pool.set_peer_range(ctx, p1.clone(), BlockHeight(1), BlockHeight(1000))
        .await
        .unwrap();

    let requests = drain_scheduler(ctx, &pool, &mut outputs).await;
    assert_eq!(requests.len(), 5);
    assert!(requests.iter().all(|(_, h)| h.0 <= 5));

    // Consuming a block opens exactly one more slot.
    pool.add_block(ctx, p1.clone(), make_block(1), 128)
        .await
        .unwrap()
        .unwrap();
    let (_, block) = pool.next_block(ctx).await.unwrap();
    assert_eq!(block.header.height, BlockHeight(1));
    let more = drain_scheduler(ctx, &pool, &mut outputs).await;
    assert_eq!(more.len(), 1);
    assert_eq!(more[0].1, BlockHeight(6));
}
