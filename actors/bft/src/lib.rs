//! # Consensus
//! This crate implements the round-based BFT consensus protocol driving a
//! set of validators to agree on one block per height. Within a height a
//! round walks through proposal, prevote and precommit phases; a 2/3+
//! prevote majority (a polka) locks a value, a 2/3+ precommit majority
//! commits it. Up to one third of the voting power may be faulty.
//!
//! The driver is a single event-loop task owning the round state. Peer
//! messages, the driver's own signed messages and timer fires all funnel
//! through one queue, so every transition is serial. Block construction,
//! validation and execution belong to the [`Application`]; signing
//! belongs to the [`PrivValidator`]; both are injected through [`Config`].
//!
//! The node must have a chain state in its state store before the actor
//! starts (a fresh chain is seeded by saving the genesis state).
use crate::io::{InputMessage, OutputMessage};
use quorum_consensus_roles::validator;
use quorum_consensus_utils::pipe::{self, ActorPipe};
use std::{fmt, sync::Arc};
use zksync_concurrency::{ctx, scope};

mod config;
mod height_vote_set;
pub mod io;
mod metrics;
mod round_state;
mod state_machine;
pub mod testonly;
#[cfg(test)]
mod tests;
mod ticker;

pub use config::{Config, TimeoutConfig};

/// Application hook. Supplies block payloads, validates and executes the
/// blocks that consensus agrees on.
#[async_trait::async_trait]
pub trait Application: fmt::Debug + Send + Sync {
    /// Builds the block to propose at `height`, together with its part
    /// set. `last_commit` certifies the previous block; `evidence` is
    /// validator misbehavior observed since, to be embedded in the block.
    async fn create_proposal_block(
        &self,
        ctx: &ctx::Ctx,
        height: validator::BlockHeight,
        last_commit: &validator::Commit,
        evidence: &[validator::DuplicateVoteEvidence],
        proposer: &validator::Address,
    ) -> ctx::Result<(validator::Block, validator::PartSet)>;

    /// Checks a proposed block against the current chain state.
    async fn validate_block(
        &self,
        ctx: &ctx::Ctx,
        state: &validator::ChainState,
        block: &validator::Block,
    ) -> ctx::Result<()>;

    /// Executes a committed block, returning the next chain state and the
    /// per-transaction responses to persist.
    async fn apply_block(
        &self,
        ctx: &ctx::Ctx,
        state: &validator::ChainState,
        block: &validator::Block,
        commit: &validator::Commit,
    ) -> ctx::Result<(validator::ChainState, validator::AbciResponses)>;

    /// Checks the application-defined extension of a precommit.
    async fn verify_vote_extension(
        &self,
        ctx: &ctx::Ctx,
        vote: &validator::Vote,
    ) -> ctx::Result<()>;
}

/// Signing hook. Implementations must refuse to sign a vote or proposal
/// that would equivocate within the current height and round; consensus
/// treats a signing failure as "no vote this step", never as permission
/// to double-sign.
#[async_trait::async_trait]
pub trait PrivValidator: fmt::Debug + Send + Sync {
    /// The validator's public key.
    async fn pub_key(&self, ctx: &ctx::Ctx) -> ctx::Result<validator::PublicKey>;

    /// Signs the vote in place (signature and, for precommits, any
    /// extension the signer attaches).
    async fn sign_vote(
        &self,
        ctx: &ctx::Ctx,
        chain_id: &str,
        vote: &mut validator::Vote,
    ) -> ctx::Result<()>;

    /// Signs the proposal in place.
    async fn sign_proposal(
        &self,
        ctx: &ctx::Ctx,
        chain_id: &str,
        proposal: &mut validator::Proposal,
    ) -> ctx::Result<()>;
}

impl Config {
    /// Runs the consensus actor: processes inbound messages from `pipe`,
    /// publishes outbound messages onto it, and drives the round state
    /// machine until the context is canceled.
    pub async fn run(
        self,
        ctx: &ctx::Ctx,
        pipe: ActorPipe<InputMessage, OutputMessage>,
    ) -> anyhow::Result<()> {
        let cfg = Arc::new(self);
        let (peer_recv, outbound) = pipe.split();
        let res: ctx::Result<()> = scope::run!(ctx, |ctx, s| async {
            let (input_send, input_recv) = ctx::channel::unbounded();
            let (tick_send, tick_recv) = ctx::channel::unbounded();

            s.spawn_bg(ticker::run_ticker(ctx, tick_recv, input_send.clone()));
            // Forward peer messages into the serial input queue.
            let peer_input_send = input_send.clone();
            s.spawn_bg(async {
                pipe::forward(ctx, peer_recv, peer_input_send, |InputMessage::Network(req)| {
                    state_machine::Input::Message(req)
                })
                .await?;
                Ok(())
            });

            let machine = state_machine::StateMachine::start(
                ctx,
                cfg.clone(),
                outbound,
                input_send,
                tick_send,
            )
            .await?;

            tracing::info!("starting consensus actor");
            machine.run(ctx, input_recv).await
        })
        .await;
        match res {
            Ok(()) | Err(ctx::Error::Canceled(_)) => Ok(()),
            Err(ctx::Error::Internal(err)) => Err(err),
        }
    }
}
