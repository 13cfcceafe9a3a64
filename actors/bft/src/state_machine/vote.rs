//! Vote ingress and this node's own vote casting.
use super::StateMachine;
use crate::{
    height_vote_set::HeightVoteSetError,
    io::ConsensusMsg,
    round_state::Step,
};
use quorum_consensus_roles::{
    node::PeerId,
    validator::{
        BlockHeight, BlockId, DuplicateVoteEvidence, PartSet, Round, Timestamp, Vote, VoteAdded,
        VoteType,
    },
};
use zksync_concurrency::{ctx, error::Wrap};

/// Errors that can occur when processing a vote message.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// Vote for an unrelated height.
    #[error("vote from wrong height (vote: {height}, current: {current_height})")]
    WrongHeight {
        /// Height of the ignored vote.
        height: BlockHeight,
        /// Current height.
        current_height: BlockHeight,
    },
    /// Vote extensions are only defined for precommits.
    #[error("prevote carries a vote extension")]
    ExtensionOnPrevote,
    /// The application rejected the vote extension.
    #[error("invalid vote extension: {0:#}")]
    InvalidExtension(#[source] anyhow::Error),
    /// The vote was rejected by the tally.
    #[error(transparent)]
    Tally(#[from] HeightVoteSetError),
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
    /// Processes a vote message, tallying it and firing whatever
    /// transition the new tally allows.
    pub(crate) async fn on_vote(
        &mut self,
        ctx: &ctx::Ctx,
        vote: Vote,
        peer: Option<&PeerId>,
    ) -> Result<(), Error> {
        tracing::debug!(
            height = %vote.height,
            round = %vote.round,
            vote_type = %vote.vote_type,
            index = vote.validator_index,
            "adding vote",
        );

        // A precommit for the previous height: these arrive while we wait
        // out the commit timeout and fill up `last_commit`.
        if vote.height.next() == self.rs.height && vote.vote_type == VoteType::Precommit {
            if self.rs.step != Step::NewHeight {
                tracing::debug!("precommit for the previous height after its window; ignored");
                return Ok(());
            }
            return self.on_last_commit_vote(ctx, vote).await;
        }

        // Height mismatch is ignored. Not necessarily a bad peer, but not
        // favorable behavior either.
        if vote.height != self.rs.height {
            return Err(Error::WrongHeight {
                height: vote.height,
                current_height: self.rs.height,
            });
        }

        match vote.vote_type {
            VoteType::Prevote => {
                if vote.extension.is_some() {
                    return Err(Error::ExtensionOnPrevote);
                }
            }
            VoteType::Precommit => {
                if vote.extension.is_some() {
                    self.config
                        .application
                        .verify_vote_extension(ctx, &vote)
                        .await
                        .map_err(|err| match err {
                            ctx::Error::Canceled(err) => Error::Internal(err.into()),
                            ctx::Error::Internal(err) => Error::InvalidExtension(err),
                        })?;
                }
            }
        }

        let height = self.rs.height;
        let vote_round = vote.round;
        let vote_type = vote.vote_type;
        match self.rs.votes.add_vote(vote, peer)? {
            VoteAdded::Added => {}
            VoteAdded::Duplicate => return Ok(()),
            VoteAdded::Conflict(evidence) => {
                tracing::info!(
                    validator = %evidence.validator_address(),
                    height = %evidence.height(),
                    "found conflicting vote; recording evidence",
                );
                self.record_evidence(*evidence);
                return Ok(());
            }
        }

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(ctx, height, vote_round).await?,
            VoteType::Precommit => self.on_precommit_added(ctx, height, vote_round).await?,
        }
        Ok(())
    }

    /// A precommit of the previous height arrived during NewHeight.
    async fn on_last_commit_vote(&mut self, ctx: &ctx::Ctx, vote: Vote) -> Result<(), Error> {
        let Some(last_commit) = &mut self.rs.last_commit else {
            return Ok(());
        };
        match last_commit
            .add_vote(vote)
            .map_err(HeightVoteSetError::VoteSet)?
        {
            VoteAdded::Added => tracing::debug!("added vote to last precommits"),
            VoteAdded::Duplicate => return Ok(()),
            VoteAdded::Conflict(evidence) => {
                self.record_evidence(*evidence);
                return Ok(());
            }
        }
        // If all the votes are in, the wait serves nobody; skip ahead.
        if self.config.timeouts.skip_timeout_commit
            && self.rs.last_commit.as_ref().is_some_and(|lc| lc.has_all())
        {
            self.enter_new_round(ctx, self.rs.height, Round(0)).await?;
        }
        Ok(())
    }

    /// Transitions unlocked by one more prevote at `vote_round`.
    async fn on_prevote_added(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        vote_round: Round,
    ) -> ctx::Result<()> {
        let prevotes = self
            .rs
            .votes
            .prevotes(vote_round)
            .expect("the round was just voted into existence");
        let polka = prevotes.two_thirds_majority();
        let any_quorum = prevotes.has_two_thirds_any();

        if let Some(polka_id) = polka {
            // There was a polka.
            // If we are locked but this is a newer polka for something
            // else, unlock; if it matches our proposal block, mark the
            // block valid.
            let unlock = self.rs.locked_block.as_ref().is_some_and(|locked| {
                self.rs.locked_round < Some(vote_round)
                    && vote_round <= self.rs.round
                    && !locked.hashes_to(&polka_id.hash)
            });
            if unlock {
                tracing::debug!(
                    locked_round = ?self.rs.locked_round,
                    pol_round = %vote_round,
                    "unlocking because of a newer polka",
                );
                self.rs.unlock();
            }

            if !polka_id.is_nil()
                && self.rs.valid_round < Some(vote_round)
                && vote_round == self.rs.round
            {
                if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&polka_id.hash))
                {
                    tracing::debug!(
                        valid_round = ?self.rs.valid_round,
                        pol_round = %vote_round,
                        "updating valid block because of the polka",
                    );
                    self.rs.valid_round = Some(vote_round);
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    // The polka is for a block we do not have; drop ours
                    // and get ready to fetch the right one.
                    tracing::debug!("polka for a block we do not know about");
                    self.rs.proposal_block = None;
                }
                let have_header = self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .is_some_and(|p| p.has_header(&polka_id.parts));
                if !have_header {
                    self.rs.proposal_block_parts = Some(PartSet::from_header(polka_id.parts));
                }
            }
        }

        if self.rs.round < vote_round && any_quorum {
            // Round-skip: 2/3+ of the power is voting ahead of us.
            self.enter_new_round(ctx, height, vote_round).await?;
        } else if self.rs.round == vote_round && self.rs.step >= Step::Prevote {
            if let Some(polka_id) = polka {
                if self.is_proposal_complete() || polka_id.is_nil() {
                    self.enter_precommit(ctx, height, vote_round).await?;
                } else if any_quorum {
                    self.enter_prevote_wait(height, vote_round)?;
                }
            } else if any_quorum {
                self.enter_prevote_wait(height, vote_round)?;
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .is_some_and(|p| p.pol_round == Some(vote_round))
        {
            // The proposal's proof-of-lock may just have completed.
            if self.is_proposal_complete() {
                self.enter_prevote(ctx, height, self.rs.round).await?;
            }
        }
        Ok(())
    }

    /// Transitions unlocked by one more precommit at `vote_round`.
    async fn on_precommit_added(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        vote_round: Round,
    ) -> ctx::Result<()> {
        let precommits = self
            .rs
            .votes
            .precommits(vote_round)
            .expect("the round was just voted into existence");
        let majority = precommits.two_thirds_majority();
        let any_quorum = precommits.has_two_thirds_any();
        let all = precommits.has_all();

        if let Some(block_id) = majority {
            // The majority could be from a higher round: catch up first.
            self.enter_new_round(ctx, height, vote_round).await?;
            self.enter_precommit(ctx, height, vote_round).await?;
            if !block_id.is_nil() {
                self.enter_commit(ctx, height, vote_round).await?;
                if self.config.timeouts.skip_timeout_commit && all {
                    self.enter_new_round(ctx, self.rs.height, Round(0)).await?;
                }
            } else {
                self.enter_precommit_wait(height, vote_round)?;
            }
        } else if self.rs.round <= vote_round && any_quorum {
            self.enter_new_round(ctx, height, vote_round).await?;
            self.enter_precommit_wait(height, vote_round)?;
        }
        Ok(())
    }

    /// Signs a vote of the given type for the given block id and
    /// publishes it. A missing or failing signer degrades this step to no
    /// vote; peers will time out.
    pub(crate) async fn sign_add_vote(
        &mut self,
        ctx: &ctx::Ctx,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> ctx::Result<()> {
        let Some(priv_validator) = &self.config.priv_validator else {
            return Ok(());
        };
        let Some(pub_key) = &self.privval_pub_key else {
            tracing::error!("sign_add_vote: signer public key is not set");
            return Ok(());
        };
        let address = pub_key.address();
        let Some(index) = self.rs.validators.index_of(&address) else {
            // Not in the validator set at this height; nothing to cast.
            return Ok(());
        };

        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.vote_time(ctx),
            validator_address: address,
            validator_index: index as u32,
            signature: None,
            extension: None,
        };
        // The vote timeout of the matching step bounds the signer call.
        let bound = match vote_type {
            VoteType::Prevote => self.config.timeouts.timeout_prevote,
            VoteType::Precommit => self.config.timeouts.timeout_precommit,
        };
        let bounded = ctx.with_timeout(bound);
        match priv_validator
            .sign_vote(&bounded, &self.state.chain_id, &mut vote)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    height = %vote.height,
                    round = %vote.round,
                    vote_type = %vote.vote_type,
                    "signed and published vote",
                );
                self.publish(ConsensusMsg::Vote(vote));
            }
            Err(err) => {
                if !ctx.is_active() {
                    return Err(ctx::Canceled.into());
                }
                tracing::error!(
                    height = %self.rs.height,
                    round = %self.rs.round,
                    "failed signing vote: {err:#}",
                );
            }
        }
        Ok(())
    }

    /// Records misbehavior, keeping one record per conflicting pair. The
    /// same equivocation re-gossiped by many peers must not multiply.
    fn record_evidence(&mut self, evidence: DuplicateVoteEvidence) {
        if !self.evidence_pool.contains(&evidence) {
            self.evidence_pool.push(evidence);
        }
    }

    /// BFT-time monotonicity: a vote is stamped no earlier than one
    /// millisecond past the block it builds on.
    fn vote_time(&self, ctx: &ctx::Ctx) -> Timestamp {
        let now = Timestamp::from_utc(ctx.now_utc());
        let min = if let Some(locked) = &self.rs.locked_block {
            locked.header.time.plus_millis(1)
        } else if let Some(proposal) = &self.rs.proposal_block {
            proposal.header.time.plus_millis(1)
        } else {
            now
        };
        now.max(min)
    }
}
