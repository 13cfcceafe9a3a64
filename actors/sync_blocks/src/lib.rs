//! # Block sync
//! This crate implements catch-up block syncing: while the node is
//! behind, a pool of requesters fans block requests out across peers,
//! tracks peer health, and hands blocks to the consumer strictly in
//! height order. Peers that time out, crawl or misbehave are evicted and
//! their in-flight heights reassigned.
use crate::io::{InputMessage, OutputMessage};
use quorum_consensus_roles::validator::BlockHeight;
use quorum_consensus_utils::pipe::ActorPipe;
use std::sync::Arc;
use zksync_concurrency::{ctx, scope};

mod config;
pub mod io;
mod metrics;
mod pool;
#[cfg(test)]
mod tests;

pub use crate::{config::Config, pool::BlockPool};

/// The block-sync actor. Owns the pool and pumps transport messages into
/// it; the consumer drains blocks through the shared [`BlockPool`]
/// handle.
#[derive(Debug)]
pub struct SyncBlocks {
    pool: Arc<BlockPool>,
    pipe: ActorPipe<InputMessage, OutputMessage>,
}

impl SyncBlocks {
    /// Creates the actor, returning the pool handle the consumer reads
    /// blocks from.
    pub fn new(
        config: Config,
        start_height: BlockHeight,
        pipe: ActorPipe<InputMessage, OutputMessage>,
    ) -> anyhow::Result<(Self, Arc<BlockPool>)> {
        config.validate()?;
        let pool = Arc::new(BlockPool::new(config, start_height, pipe.send.clone()));
        Ok((
            Self {
                pool: pool.clone(),
                pipe,
            },
            pool,
        ))
    }

    /// Runs the actor (scheduler plus message loop) until the context is
    /// canceled.
    pub async fn run(self, ctx: &ctx::Ctx) -> anyhow::Result<()> {
        let pool = self.pool;
        let mut pipe = self.pipe;
        let res: ctx::Result<()> = scope::run!(ctx, |ctx, s| async {
            s.spawn_bg(pool.run_scheduler(ctx));
            loop {
                let message = pipe.recv.recv(ctx).await?;
                Self::handle_message(ctx, &pool, message).await?;
            }
        })
        .await;
        match res {
            Ok(()) | Err(ctx::Error::Canceled(_)) => Ok(()),
            Err(ctx::Error::Internal(err)) => Err(err),
        }
    }

    async fn handle_message(
        ctx: &ctx::Ctx,
        pool: &BlockPool,
        message: InputMessage,
    ) -> ctx::OrCanceled<()> {
        match message {
            InputMessage::PeerStatus { peer, base, height } => {
                metrics::METRICS.peer_updates.inc();
                pool.set_peer_range(ctx, peer, base, height).await?;
            }
            InputMessage::Block { peer, block, size } => {
                let height = block.header.height;
                match pool.add_block(ctx, peer, block, size).await? {
                    Ok(()) => {
                        metrics::METRICS.blocks_received.inc();
                    }
                    Err(err) => {
                        tracing::warn!(%height, "dropping block: {err:#}");
                        metrics::METRICS.blocks_rejected.inc();
                    }
                }
            }
            InputMessage::PeerDisconnected { peer } => {
                pool.remove_peer(ctx, &peer).await?;
            }
        }
        Ok(())
    }
}
