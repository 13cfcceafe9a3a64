//! The Propose step and proposal ingress.
use super::StateMachine;
use crate::{io::BlockPartMsg, io::ConsensusMsg, round_state::Step};
use quorum_consensus_roles::validator::{
    BlockHeight, BlockId, Commit, PartSet, Proposal, Round, Timestamp,
};
use zksync_concurrency::{ctx, error::Wrap};

/// Errors that can occur when processing a proposal message.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// A proposal for this round was already accepted.
    #[error("already have a proposal for this round")]
    Duplicate,
    /// Proposal for a different height or round.
    #[error(
        "proposal does not apply (proposal: {height}/{round}, current: \
         {current_height}/{current_round})"
    )]
    Mismatch {
        /// Height of the rejected proposal.
        height: BlockHeight,
        /// Round of the rejected proposal.
        round: Round,
        /// Current height.
        current_height: BlockHeight,
        /// Current round.
        current_round: Round,
    },
    /// POL round outside `{-1} ∪ [0, round)`.
    #[error("invalid proposal POL round: {0:#}")]
    InvalidPolRound(#[source] anyhow::Error),
    /// Signature does not verify against the round's proposer.
    #[error("invalid proposal signature: {0:#}")]
    InvalidSignature(#[source] anyhow::Error),
    /// Internal error. Unlike other error types, this one isn't supposed
    /// to be easily recoverable.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for Error {
    fn with_wrap<C: std::fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            Error::Internal(err) => Error::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

impl StateMachine {
    /// Processes a proposal message. Accepts the first proposal at the
    /// matching (height, round) and rejects any subsequent one; setting
    /// the proposal is what lets block parts start accumulating.
    pub(crate) async fn on_proposal(
        &mut self,
        _ctx: &ctx::Ctx,
        proposal: Proposal,
    ) -> Result<(), Error> {
        let rs = &mut self.rs;
        if rs.proposal.is_some() {
            return Err(Error::Duplicate);
        }
        if proposal.height != rs.height || proposal.round != rs.round {
            return Err(Error::Mismatch {
                height: proposal.height,
                round: proposal.round,
                current_height: rs.height,
                current_round: rs.round,
            });
        }
        proposal
            .validate_pol_round()
            .map_err(Error::InvalidPolRound)?;
        proposal
            .verify(&self.state.chain_id, &rs.validators.proposer().pub_key)
            .map_err(Error::InvalidSignature)?;

        // Do not reset the part set if one is already tracked: that
        // happens when this round's polka pointed us at the block first.
        if rs.proposal_block_parts.is_none() {
            rs.proposal_block_parts = Some(PartSet::from_header(proposal.block_id.parts));
        }
        tracing::info!(
            height = %proposal.height,
            round = %proposal.round,
            block = %proposal.block_id,
            "received proposal",
        );
        rs.proposal = Some(proposal);
        Ok(())
    }

    /// Enters the Propose step: schedules the proposal timeout and, if
    /// this node is the round's proposer, builds, signs and publishes the
    /// proposal with its block parts.
    pub(crate) async fn enter_propose(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        round: Round,
    ) -> ctx::Result<()> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step >= Step::Propose)
        {
            tracing::debug!(
                %height, %round,
                current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
                "entering propose step with invalid args",
            );
            return Ok(());
        }
        tracing::debug!(
            current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
            "entering propose step",
        );

        // If the proposal and all its parts do not arrive quickly enough,
        // prevote nil.
        self.schedule_timeout(self.config.timeouts.propose(round), height, round, Step::Propose);

        'proposer: {
            if self.config.priv_validator.is_none() {
                tracing::debug!("propose step; node is not a validator");
                break 'proposer;
            }
            let Some(pub_key) = self.privval_pub_key.clone() else {
                // A validator without a working signer misses its slot.
                tracing::error!("propose step; signer public key is not set");
                break 'proposer;
            };
            let address = pub_key.address();
            if !self.rs.validators.contains(&address) {
                tracing::debug!("propose step; node is not in the validator set");
                break 'proposer;
            }
            if self.rs.validators.proposer().address != address {
                tracing::debug!("propose step; not our turn to propose");
                break 'proposer;
            }
            tracing::debug!("propose step; our turn to propose");
            self.decide_proposal(ctx, height, round).await?;
        }

        self.rs.round = round;
        self.rs.step = Step::Propose;
        self.new_step();
        if self.is_proposal_complete() {
            self.enter_prevote(ctx, height, self.rs.round).await?;
        }
        Ok(())
    }

    /// Builds and publishes this node's proposal for (height, round):
    /// the valid block if one is known, otherwise a fresh block from the
    /// application.
    async fn decide_proposal(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        round: Round,
    ) -> ctx::Result<()> {
        let (block, block_parts) = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            // A block that already gathered a polka is re-proposed as is.
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => {
                let last_commit = if height == self.state.initial_height {
                    Commit::initial()
                } else {
                    match &self.rs.last_commit {
                        Some(votes) if votes.has_two_thirds_majority() => {
                            votes.make_commit().map_err(ctx::Error::Internal)?
                        }
                        _ => {
                            tracing::error!(
                                "propose step; cannot propose without a commit for the previous \
                                 block"
                            );
                            return Ok(());
                        }
                    }
                };
                let proposer = self
                    .privval_pub_key
                    .as_ref()
                    .expect("checked by enter_propose")
                    .address();
                match self
                    .config
                    .application
                    .create_proposal_block(ctx, height, &last_commit, &self.evidence_pool, &proposer)
                    .await
                {
                    Ok(built) => built,
                    Err(ctx::Error::Canceled(err)) => return Err(err.into()),
                    Err(ctx::Error::Internal(err)) => {
                        tracing::warn!("propose step; failed building a block: {err:#}");
                        return Ok(());
                    }
                }
            }
        };

        let block_id = BlockId {
            hash: block.hash(),
            parts: block_parts.header(),
        };
        let mut proposal = Proposal::new(
            height,
            round,
            self.rs.valid_round,
            block_id,
            Timestamp::from_utc(ctx.now_utc()),
        );
        let Some(priv_validator) = &self.config.priv_validator else {
            return Ok(());
        };
        if let Err(err) = priv_validator
            .sign_proposal(ctx, &self.state.chain_id, &mut proposal)
            .await
        {
            if !ctx.is_active() {
                return Err(ctx::Canceled.into());
            }
            // Signer failure degrades this round; peers will time out.
            tracing::error!(%height, %round, "propose step; failed signing proposal: {err:#}");
            return Ok(());
        }

        self.publish(ConsensusMsg::Proposal(proposal));
        for part in block_parts.parts() {
            self.publish(ConsensusMsg::BlockPart(BlockPartMsg {
                height,
                round,
                part: part.clone(),
            }));
        }
        tracing::debug!(%height, %round, "signed and published proposal");
        Ok(())
    }

    /// Whether the proposal and the full proposal block are in, and a
    /// claimed proof-of-lock is backed by an actual polka.
    pub(crate) fn is_proposal_complete(&self) -> bool {
        let rs = &self.rs;
        let (Some(proposal), Some(_)) = (&rs.proposal, &rs.proposal_block) else {
            return false;
        };
        match proposal.pol_round {
            None => true,
            // If this is false, the proposer is lying or we have not
            // received the POL yet.
            Some(pol_round) => rs
                .votes
                .prevotes(pol_round)
                .is_some_and(|v| v.has_two_thirds_majority()),
        }
    }
}
