//! The catch-up pool: tracks peers and in-flight block requests, orders
//! delivery by height, and evicts peers that time out, lag or misbehave.
use crate::{io::OutputMessage, Config};
use quorum_consensus_roles::{
    node::PeerId,
    validator::{Block, BlockHeight},
};
use std::collections::{BTreeMap, HashMap};
use zksync_concurrency::{ctx, sync, time};

/// One tracked height: which peer is fetching it, and the block once it
/// arrived. A requester with no peer is waiting to be (re)assigned.
#[derive(Debug, Default)]
struct Requester {
    peer: Option<PeerId>,
    block: Option<Box<Block>>,
}

#[derive(Debug)]
struct PoolPeer {
    base: BlockHeight,
    height: BlockHeight,
    num_pending: usize,
    did_timeout: bool,
    /// Armed while the peer has requests in flight.
    deadline: Option<time::Instant>,
    err_count: usize,
    bytes_received: u64,
    first_request_at: Option<time::Instant>,
}

impl PoolPeer {
    fn incr_pending(&mut self, now: time::Instant, timeout: time::Duration) {
        if self.num_pending == 0 {
            self.deadline = Some(now + timeout);
        }
        if self.first_request_at.is_none() {
            self.first_request_at = Some(now);
        }
        self.num_pending += 1;
    }

    fn decr_pending(&mut self, now: time::Instant, timeout: time::Duration) {
        self.num_pending -= 1;
        if self.num_pending == 0 {
            // Nothing left in flight; an armed timer would only fire
            // spuriously.
            self.deadline = None;
        } else {
            self.deadline = Some(now + timeout);
        }
    }

    /// Average receive rate in bytes/s since the first request.
    fn recv_rate(&self, now: time::Instant) -> Option<u64> {
        let since = now - self.first_request_at?;
        if since < time::Duration::seconds(1) {
            return None;
        }
        Some((self.bytes_received as f64 / since.as_seconds_f64()) as u64)
    }
}

#[derive(Debug)]
struct PoolInner {
    requesters: BTreeMap<BlockHeight, Requester>,
    peers: HashMap<PeerId, PoolPeer>,
    /// Next height the consumer needs.
    height: BlockHeight,
    /// Requests in flight across all peers.
    num_pending: usize,
    max_peer_height: BlockHeight,
}

/// Errors rejecting a block delivery.
#[derive(Debug, thiserror::Error)]
pub enum AddBlockError {
    /// Nobody asked this peer for this height.
    #[error("unsolicited block at height {height} from {peer}")]
    Unsolicited {
        /// The delivering peer.
        peer: PeerId,
        /// Height of the rejected block.
        height: BlockHeight,
    },
}

/// Shared state of the block-sync actor. The scheduler task, the message
/// loop and the consumer all operate through the coarse internal mutex;
/// none of them holds it across a suspension point.
#[derive(Debug)]
pub struct BlockPool {
    config: Config,
    inner: sync::Mutex<PoolInner>,
    output: ctx::channel::UnboundedSender<OutputMessage>,
    /// Bumped on every delivery; the consumer re-checks on change.
    delivered: sync::watch::Sender<u64>,
}

impl BlockPool {
    /// Creates a pool that will start requesting at `start_height`.
    pub(crate) fn new(
        config: Config,
        start_height: BlockHeight,
        output: ctx::channel::UnboundedSender<OutputMessage>,
    ) -> Self {
        Self {
            config,
            inner: sync::Mutex::new(PoolInner {
                requesters: BTreeMap::new(),
                peers: HashMap::new(),
                height: start_height,
                num_pending: 0,
                max_peer_height: BlockHeight(0),
            }),
            output,
            delivered: sync::watch::channel(0).0,
        }
    }

    /// Runs the request scheduler until the context is canceled.
    pub(crate) async fn run_scheduler(&self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        loop {
            ctx.sleep(self.config.request_interval).await?;
            self.schedule_step(ctx).await?;
        }
    }

    /// One scheduler wake-up: either hand out one more request, or, when
    /// saturated, reap dead peers.
    pub(crate) async fn schedule_step(&self, ctx: &ctx::Ctx) -> ctx::OrCanceled<()> {
        let now = ctx.now();
        let mut evictions = Vec::new();
        {
            let mut inner = sync::lock(ctx, &self.inner).await?;
            let inner = &mut *inner;
            let saturated = inner.num_pending >= self.config.max_pending_requests
                || inner.requesters.len() >= self.config.max_total_requesters;
            if saturated {
                Self::collect_dead_peers(&self.config, inner, now, &mut evictions);
            } else if let Some((height, peer)) = Self::next_assignment(&self.config, inner) {
                let entry = inner.requesters.entry(height).or_default();
                entry.peer = Some(peer.clone());
                inner.num_pending += 1;
                inner
                    .peers
                    .get_mut(&peer)
                    .expect("picked peer exists")
                    .incr_pending(now, self.config.peer_timeout);
                self.output.send(OutputMessage::GetBlock { peer, height });
            } else {
                // Nothing assignable right now; at least reap.
                Self::collect_dead_peers(&self.config, inner, now, &mut evictions);
            }
            for (peer, reason) in &evictions {
                Self::evict_locked(inner, peer);
                self.output.send(OutputMessage::PeerError {
                    peer: peer.clone(),
                    reason: reason.clone(),
                });
            }
        }
        Ok(())
    }

    /// The next (height, peer) worth requesting: an orphaned requester
    /// first, otherwise a fresh height within the lookahead window.
    fn next_assignment(config: &Config, inner: &PoolInner) -> Option<(BlockHeight, PeerId)> {
        let orphan = inner
            .requesters
            .iter()
            .find(|(_, r)| r.peer.is_none() && r.block.is_none())
            .map(|(&height, _)| height);
        let height = orphan.or_else(|| {
            let next = inner
                .requesters
                .keys()
                .next_back()
                .map(|h| h.next())
                .unwrap_or(inner.height);
            if next.0 - inner.height.0 >= config.max_block_lookahead {
                return None;
            }
            (next <= inner.max_peer_height).then_some(next)
        })?;
        let peer = Self::pick_incr_available_peer(config, inner, height)?;
        Some((height, peer))
    }

    /// The least loaded peer that covers `height`, has capacity left and
    /// has not timed out.
    fn pick_incr_available_peer(
        config: &Config,
        inner: &PoolInner,
        height: BlockHeight,
    ) -> Option<PeerId> {
        inner
            .peers
            .iter()
            .filter(|(_, p)| {
                !p.did_timeout
                    && p.base <= height
                    && height <= p.height
                    && p.num_pending < config.max_pending_requests_per_peer
            })
            .min_by_key(|(_, p)| p.num_pending)
            .map(|(id, _)| id.clone())
    }

    fn collect_dead_peers(
        config: &Config,
        inner: &mut PoolInner,
        now: time::Instant,
        evictions: &mut Vec<(PeerId, String)>,
    ) {
        for (id, peer) in &mut inner.peers {
            if peer.deadline.is_some_and(|at| at <= now) {
                peer.did_timeout = true;
                evictions.push((id.clone(), "peer did not send us anything for a while".into()));
                continue;
            }
            if peer.num_pending > 0 {
                if let Some(rate) = peer.recv_rate(now) {
                    if rate < config.min_recv_rate {
                        peer.did_timeout = true;
                        evictions.push((
                            id.clone(),
                            format!("peer is sending us data too slowly ({rate} B/s)"),
                        ));
                    }
                }
            }
        }
    }

    /// Registers the height range a peer can serve.
    pub(crate) async fn set_peer_range(
        &self,
        ctx: &ctx::Ctx,
        peer: PeerId,
        base: BlockHeight,
        height: BlockHeight,
    ) -> ctx::OrCanceled<()> {
        if base > height {
            tracing::warn!(%peer, %base, %height, "bogus peer status; ignoring");
            self.output.send(OutputMessage::PeerError {
                peer,
                reason: "advertised base above height".into(),
            });
            return Ok(());
        }
        let mut inner = sync::lock(ctx, &self.inner).await?;
        let entry = inner.peers.entry(peer).or_insert_with(|| PoolPeer {
            base,
            height,
            num_pending: 0,
            did_timeout: false,
            deadline: None,
            err_count: 0,
            bytes_received: 0,
            first_request_at: None,
        });
        entry.base = base;
        entry.height = height;
        inner.max_peer_height = inner.max_peer_height.max(height);
        Ok(())
    }

    /// Accepts a delivered block. The delivery must match the peer the
    /// height was requested from; anything else counts against the
    /// peer's error budget.
    pub(crate) async fn add_block(
        &self,
        ctx: &ctx::Ctx,
        peer: PeerId,
        block: Box<Block>,
        size: usize,
    ) -> ctx::OrCanceled<Result<(), AddBlockError>> {
        let height = block.header.height;
        let now = ctx.now();
        let mut inner = sync::lock(ctx, &self.inner).await?;
        let inner = &mut *inner;

        let solicited =
            inner.requesters.get(&height).and_then(|r| r.peer.as_ref()) == Some(&peer);
        if !solicited {
            self.record_error_locked(inner, &peer);
            return Ok(Err(AddBlockError::Unsolicited { peer, height }));
        }

        let requester = inner
            .requesters
            .get_mut(&height)
            .expect("checked above");
        if requester.block.is_some() {
            // Duplicate delivery; harmless.
            return Ok(Ok(()));
        }
        requester.block = Some(block);
        inner.num_pending -= 1;
        if let Some(state) = inner.peers.get_mut(&peer) {
            state.bytes_received += size as u64;
            state.decr_pending(now, self.config.peer_timeout);
        }
        self.delivered.send_modify(|n| *n += 1);
        Ok(Ok(()))
    }

    /// Removes a peer, re-queueing whatever it was fetching.
    pub(crate) async fn remove_peer(&self, ctx: &ctx::Ctx, peer: &PeerId) -> ctx::OrCanceled<()> {
        let mut inner = sync::lock(ctx, &self.inner).await?;
        Self::evict_locked(&mut inner, peer);
        Ok(())
    }

    fn evict_locked(inner: &mut PoolInner, peer: &PeerId) {
        if inner.peers.remove(peer).is_none() {
            return;
        }
        tracing::info!(%peer, "removing peer from the block pool");
        for requester in inner.requesters.values_mut() {
            if requester.peer.as_ref() == Some(peer) && requester.block.is_none() {
                requester.peer = None;
                inner.num_pending -= 1;
            }
        }
        inner.max_peer_height = inner
            .peers
            .values()
            .map(|p| p.height)
            .max()
            .unwrap_or(BlockHeight(0));
    }

    fn record_error_locked(&self, inner: &mut PoolInner, peer: &PeerId) {
        let Some(state) = inner.peers.get_mut(peer) else {
            return;
        };
        state.err_count += 1;
        if state.err_count > self.config.max_peer_err_count {
            tracing::warn!(%peer, "peer exhausted its error budget");
            Self::evict_locked(inner, peer);
            self.output.send(OutputMessage::PeerError {
                peer: peer.clone(),
                reason: "too many errors".into(),
            });
        }
    }

    /// Yields the next block in height order, waiting for it to arrive.
    /// Returns the peer that served it alongside the block.
    pub async fn next_block(&self, ctx: &ctx::Ctx) -> ctx::OrCanceled<(Option<PeerId>, Box<Block>)> {
        let mut delivered = self.delivered.subscribe();
        loop {
            {
                let mut inner = sync::lock(ctx, &self.inner).await?;
                let height = inner.height;
                let ready = inner
                    .requesters
                    .get(&height)
                    .is_some_and(|r| r.block.is_some());
                if ready {
                    let requester = inner
                        .requesters
                        .remove(&height)
                        .expect("checked above");
                    inner.height = height.next();
                    return Ok((
                        requester.peer,
                        requester.block.expect("checked above"),
                    ));
                }
            }
            sync::changed(ctx, &mut delivered).await?;
        }
    }

    /// Whether the pool has fetched everything the best peer it knows
    /// can serve.
    pub async fn is_caught_up(&self, ctx: &ctx::Ctx) -> ctx::OrCanceled<bool> {
        let inner = sync::lock(ctx, &self.inner).await?;
        Ok(!inner.peers.is_empty() && inner.height > inner.max_peer_height)
    }

    /// (next height, in-flight requests, tracked heights), for logs and
    /// tests.
    pub async fn status(&self, ctx: &ctx::Ctx) -> ctx::OrCanceled<(BlockHeight, usize, usize)> {
        let inner = sync::lock(ctx, &self.inner).await?;
        Ok((inner.height, inner.num_pending, inner.requesters.len()))
    }

    #[cfg(test)]
    pub(crate) async fn peer_pending(
        &self,
        ctx: &ctx::Ctx,
        peer: &PeerId,
    ) -> ctx::OrCanceled<Option<usize>> {
        let inner = sync::lock(ctx, &self.inner).await?;
        Ok(inner.peers.get(peer).map(|p| p.num_pending))
    }

    #[cfg(test)]
    pub(crate) async fn pending_per_peer_sum(&self, ctx: &ctx::Ctx) -> ctx::OrCanceled<usize> {
        let inner = sync::lock(ctx, &self.inner).await?;
        Ok(inner.peers.values().map(|p| p.num_pending).sum())
    }
}
