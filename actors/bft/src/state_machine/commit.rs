//! The Commit step, block finalization and the height rollover.
use super::StateMachine;
use crate::{height_vote_set::HeightVoteSet, metrics, round_state::Step};
use anyhow::Context as _;
use quorum_consensus_roles::validator::{BlockHeight, ChainState, PartSet, Round, VoteSet};
use zksync_concurrency::{ctx, error::Wrap as _};

impl StateMachine {
    /// Enters the Commit step after 2/3+ precommits formed for a block,
    /// and finalizes immediately if that block is fully assembled.
    pub(crate) async fn enter_commit(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        commit_round: Round,
    ) -> ctx::Result<()> {
        let rs = &mut self.rs;
        if rs.height != height || rs.step >= Step::Commit {
            tracing::debug!(
                %height, %commit_round,
                current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
                "entering commit step with invalid args",
            );
            return Ok(());
        }
        let block_id = rs
            .votes
            .precommits(commit_round)
            .and_then(|v| v.two_thirds_majority())
            .ok_or_else(|| {
                anyhow::format_err!("entering commit step without 2/3+ precommits")
            })?;
        tracing::debug!(
            current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
            "entering commit step",
        );

        // The locked block no longer matters; promote it to the proposal
        // slot if it is the one being committed, so finalization has it.
        if rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            tracing::debug!("commit is for the locked block; promoting it to proposal block");
            rs.proposal_block = rs.locked_block.clone();
            rs.proposal_block_parts = rs.locked_block_parts.clone();
        }

        // If we do not have the committed block, set up to receive it.
        let have_block = rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash));
        if !have_block {
            let have_header = rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&block_id.parts));
            if !have_header {
                tracing::info!("commit is for a block we do not have; waiting for its parts");
                rs.proposal_block = None;
                rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
            }
        }

        rs.round = commit_round;
        rs.step = Step::Commit;
        rs.commit_round = Some(commit_round);
        rs.commit_time = Some(ctx.now());
        self.new_step();

        // Maybe finalize immediately.
        self.try_finalize_commit(ctx, height).await
    }

    /// Finalizes the commit if the committed block is fully assembled;
    /// otherwise keeps waiting for block parts.
    pub(crate) async fn try_finalize_commit(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
    ) -> ctx::Result<()> {
        if self.rs.height != height {
            return Err(anyhow::format_err!(
                "try_finalize_commit: expected height {}, got {height}",
                self.rs.height
            )
            .into());
        }
        let commit_round = self.rs.commit_round.ok_or_else(|| {
            anyhow::format_err!("try_finalize_commit outside of a commit round")
        })?;
        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|v| v.two_thirds_majority());
        let Some(block_id) = block_id.filter(|id| !id.is_nil()) else {
            tracing::error!("cannot finalize commit; no 2/3+ majority, or 2/3+ was for nil");
            return Ok(());
        };
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash));
        if !have_block {
            tracing::debug!("cannot finalize commit yet; we do not have the committed block");
            return Ok(());
        }
        self.finalize_commit(ctx, height).await
    }

    /// Validates and applies the committed block, persists the new state,
    /// and rolls the round state over to the next height.
    async fn finalize_commit(&mut self, ctx: &ctx::Ctx, height: BlockHeight) -> ctx::Result<()> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            tracing::debug!(
                %height,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "finalize commit with invalid args",
            );
            return Ok(());
        }
        let commit_round = self
            .rs
            .commit_round
            .expect("the Commit step always has a commit round");
        let precommits = self
            .rs
            .votes
            .precommits(commit_round)
            .expect("the commit round is tracked");
        let block_id = precommits
            .two_thirds_majority()
            .ok_or_else(|| anyhow::format_err!("commit does not have a 2/3 majority"))?;
        let block = self
            .rs
            .proposal_block
            .clone()
            .ok_or_else(|| anyhow::format_err!("finalizing commit without the block"))?;
        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .ok_or_else(|| anyhow::format_err!("finalizing commit without the block parts"))?;
        if !parts.has_header(&block_id.parts) {
            return Err(
                anyhow::format_err!("proposal block parts do not match the commit header").into(),
            );
        }
        if !block.hashes_to(&block_id.hash) {
            return Err(
                anyhow::format_err!("proposal block does not hash to the commit hash").into(),
            );
        }
        let seen_commit = precommits.make_commit()?;

        self.config
            .application
            .validate_block(ctx, &self.state, &block)
            .await
            .wrap("validate_block()")?;

        tracing::info!(
            %height,
            block = %block_id,
            payload_bytes = block.payload.len(),
            "finalizing commit of block",
        );

        let (new_state, responses) = self
            .config
            .application
            .apply_block(ctx, &self.state, &block, &seen_commit)
            .await
            .wrap("apply_block()")?;

        // The commit is only acknowledged once it is durable; a failure
        // here halts the driver.
        self.config
            .state_store
            .save_abci_responses(ctx, height, &responses)
            .await
            .wrap("save_abci_responses()")?;
        self.config
            .state_store
            .save(ctx, &new_state)
            .await
            .wrap("state_store.save()")?;
        metrics::METRICS.finalized_height.set(height.0);

        // Evidence that made it into the block is settled.
        self.evidence_pool
            .retain(|pending| !block.evidence.contains(pending));

        // New height step.
        self.update_to_state(ctx, new_state)?;

        // The signer might have rotated its key; refetch it.
        self.update_priv_validator_pub_key(ctx).await?;

        // Schedule round 0 of the new height to start after the commit
        // timeout.
        self.schedule_round_0(ctx);
        Ok(())
    }

    /// Replaces the round state for the height following `state`'s last
    /// committed block. The round becomes 0 and the step NewHeight.
    pub(crate) fn update_to_state(
        &mut self,
        ctx: &ctx::Ctx,
        state: ChainState,
    ) -> ctx::Result<()> {
        let rs = &mut self.rs;
        if rs.commit_round.is_some() && rs.height.0 > 0 && rs.height != state.last_block_height {
            return Err(anyhow::format_err!(
                "update_to_state() expected state at height {}, got {}",
                rs.height,
                state.last_block_height
            )
            .into());
        }

        // Figure out the precommits that certify the previous block.
        let last_commit = if state.last_block_height.0 == 0 {
            // The very first commit is empty.
            None
        } else if let Some(commit_round) = rs.commit_round {
            let precommits = rs
                .votes
                .precommits(commit_round)
                .ok_or_else(|| anyhow::format_err!("commit round {commit_round} not tracked"))?;
            if !precommits.has_two_thirds_majority() {
                return Err(anyhow::format_err!(
                    "wanted to form a commit, but precommits ({}/{commit_round}) lack a 2/3+ \
                     majority",
                    state.last_block_height
                )
                .into());
            }
            Some(precommits.clone())
        } else if rs.last_commit.is_some() {
            // Restart path: the last commit was reconstructed from the
            // stored seen-commit before this call.
            rs.last_commit.take()
        } else {
            return Err(anyhow::format_err!(
                "last commit cannot be empty after the initial block (height {})",
                state.last_block_height.next()
            )
            .into());
        };

        let height = state.next_height();
        // Working copy of the validator set for the new height: baseline
        // priorities advanced to this height.
        let mut validators = state.validators.clone();
        validators.increment_proposer_priority(
            height.0.saturating_sub(state.last_height_validators_changed.0) as u32,
        );

        let start_time = match rs.commit_time {
            Some(commit_time) => commit_time + self.config.timeouts.timeout_commit,
            None => ctx.now() + self.config.timeouts.timeout_commit,
        };

        rs.height = height;
        rs.round = Round(0);
        rs.step = Step::NewHeight;
        rs.start_time = start_time;
        rs.commit_time = None;
        rs.votes = HeightVoteSet::new(state.chain_id.clone(), height, validators.clone());
        rs.validators = validators;
        rs.reset_proposal();
        rs.locked_round = None;
        rs.locked_block = None;
        rs.locked_block_parts = None;
        rs.valid_round = None;
        rs.valid_block = None;
        rs.valid_block_parts = None;
        rs.commit_round = None;
        rs.last_commit = last_commit;
        rs.last_validators = state.last_validators.clone();
        rs.triggered_timeout_precommit = false;

        self.state = state;
        self.new_step();
        Ok(())
    }

    /// Rebuilds the precommit set of the last committed block from the
    /// seen-commit handed over by the node assembly. Required to propose
    /// and to serve peers the previous height's votes after a restart.
    pub(crate) fn reconstruct_last_commit(&mut self, state: &ChainState) -> ctx::Result<()> {
        let seen_commit = self.config.seen_commit.as_ref().ok_or_else(|| {
            anyhow::format_err!(
                "state has committed blocks but no seen-commit was provided (height {})",
                state.last_block_height
            )
        })?;
        if seen_commit.height != state.last_block_height {
            return Err(anyhow::format_err!(
                "seen-commit is for height {}, state is at {}",
                seen_commit.height,
                state.last_block_height
            )
            .into());
        }
        let last_validators = state
            .last_validators
            .clone()
            .context("state carries no validators for the last committed block")?;
        let votes = VoteSet::from_commit(state.chain_id.clone(), last_validators, seen_commit)
            .context("VoteSet::from_commit()")?;
        self.rs.last_commit = Some(votes);
        Ok(())
    }
}
