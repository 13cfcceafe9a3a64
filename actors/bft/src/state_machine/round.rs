//! Round transitions: NewRound, Prevote, PrevoteWait, Precommit and
//! PrecommitWait. Every transition silently rejects stale invocations,
//! so callers may fire them optimistically.
use super::StateMachine;
use crate::round_state::Step;
use quorum_consensus_roles::validator::{BlockHeight, BlockId, PartSet, Round, VoteType};
use zksync_concurrency::{ctx, error::Wrap as _, time};

impl StateMachine {
    /// Enters a new round of the current height: advances the proposer
    /// rotation, clears the stale proposal and moves on to Propose.
    pub(crate) async fn enter_new_round(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        round: Round,
    ) -> ctx::Result<()> {
        let rs = &mut self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.step != Step::NewHeight)
        {
            tracing::debug!(
                %height, %round,
                current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
                "entering new round with invalid args",
            );
            return Ok(());
        }
        if rs.start_time > ctx.now() {
            tracing::debug!("entering new round before the height's start time");
        }
        tracing::info!(
            current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
            "entering new round",
        );

        if round > rs.round {
            rs.validators
                .increment_proposer_priority(round.0 - rs.round.0);
        }
        rs.round = round;
        rs.step = Step::NewRound;
        if round != Round(0) {
            // Round 0 keeps whatever proposal arrived while we were still
            // waiting out the commit of the previous height.
            tracing::debug!("resetting proposal info");
            rs.reset_proposal();
        }
        rs.votes.set_round(round.next());
        rs.triggered_timeout_precommit = false;
        self.new_step();

        let timeouts = &self.config.timeouts;
        let wait_for_payload = round == Round(0)
            && (!timeouts.create_empty_blocks
                || timeouts.create_empty_blocks_interval > time::Duration::ZERO);
        if wait_for_payload {
            self.schedule_timeout(
                timeouts.create_empty_blocks_interval,
                height,
                round,
                Step::NewRound,
            );
            return Ok(());
        }
        self.enter_propose(ctx, height, round).await
    }

    /// Enters the Prevote step and casts the prevote this node stands
    /// behind: the locked block, a valid proposal, or nil.
    pub(crate) async fn enter_prevote(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        round: Round,
    ) -> ctx::Result<()> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step >= Step::Prevote)
        {
            tracing::debug!(
                %height, %round,
                current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
                "entering prevote step with invalid args",
            );
            return Ok(());
        }
        tracing::debug!(
            current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
            "entering prevote step",
        );

        self.do_prevote(ctx).await?;

        self.rs.round = round;
        self.rs.step = Step::Prevote;
        self.new_step();
        // Once any 2/3+ of prevotes arrives, on_vote moves us to
        // PrevoteWait, buying time to collect 2/3 for a single block.
        Ok(())
    }

    async fn do_prevote(&mut self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        if let Some(locked) = &self.rs.locked_block {
            tracing::debug!("prevote step; already locked on a block; prevoting the locked block");
            let block_id = BlockId {
                hash: locked.hash(),
                parts: self
                    .rs
                    .locked_block_parts
                    .as_ref()
                    .expect("locked block always has its parts")
                    .header(),
            };
            return self.sign_add_vote(ctx, VoteType::Prevote, block_id).await;
        }

        let Some(block) = self.rs.proposal_block.clone() else {
            tracing::debug!("prevote step; no proposal block; prevoting nil");
            return self
                .sign_add_vote(ctx, VoteType::Prevote, BlockId::nil())
                .await;
        };

        if let Err(err) = self
            .config
            .application
            .validate_block(ctx, &self.state, &block)
            .await
        {
            match err {
                ctx::Error::Canceled(err) => return Err(err.into()),
                ctx::Error::Internal(err) => {
                    tracing::warn!("prevote step; invalid proposal block: {err:#}");
                    return self
                        .sign_add_vote(ctx, VoteType::Prevote, BlockId::nil())
                        .await;
                }
            }
        }

        tracing::debug!("prevote step; proposal block is valid; prevoting it");
        let block_id = BlockId {
            hash: block.hash(),
            parts: self
                .rs
                .proposal_block_parts
                .as_ref()
                .expect("proposal block always has its parts")
                .header(),
        };
        self.sign_add_vote(ctx, VoteType::Prevote, block_id).await
    }

    /// Enters PrevoteWait: 2/3-any prevotes are in, wait a bit longer for
    /// a polka to form.
    pub(crate) fn enter_prevote_wait(
        &mut self,
        height: BlockHeight,
        round: Round,
    ) -> ctx::Result<()> {
        let rs = &mut self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.step >= Step::PrevoteWait)
        {
            tracing::debug!(
                %height, %round,
                current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
                "entering prevote_wait step with invalid args",
            );
            return Ok(());
        }
        let quorum = rs
            .votes
            .prevotes(round)
            .is_some_and(|v| v.has_two_thirds_any());
        if !quorum {
            return Err(anyhow::format_err!(
                "entering prevote_wait step ({height}/{round}) without any 2/3+ prevotes"
            )
            .into());
        }
        tracing::debug!(
            current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
            "entering prevote_wait step",
        );
        rs.round = round;
        rs.step = Step::PrevoteWait;
        self.new_step();
        self.schedule_timeout(
            self.config.timeouts.prevote(round),
            height,
            round,
            Step::PrevoteWait,
        );
        Ok(())
    }

    /// Enters the Precommit step: locks and precommits the polka block if
    /// there is one this node can stand behind, otherwise precommits nil
    /// (unlocking if the polka was for nil).
    pub(crate) async fn enter_precommit(
        &mut self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        round: Round,
    ) -> ctx::Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Precommit)
        {
            tracing::debug!(
                %height, %round,
                current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
                "entering precommit step with invalid args",
            );
            return Ok(());
        }
        tracing::debug!(
            current = %format_args!("{}/{}/{}", self.rs.height, self.rs.round, self.rs.step),
            "entering precommit step",
        );

        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|v| v.two_thirds_majority());

        let vote_id = match polka {
            None => {
                if self.rs.locked_block.is_some() {
                    tracing::debug!("precommit step; no polka while locked; precommitting nil");
                } else {
                    tracing::debug!("precommit step; no polka; precommitting nil");
                }
                BlockId::nil()
            }
            Some(polka_id) => {
                // The latest POL round can never trail the round we just
                // saw a polka in.
                let pol_round = self.rs.votes.pol_info().map(|(r, _)| r);
                if pol_round.map_or(true, |r| r < round) {
                    return Err(anyhow::format_err!(
                        "POL round should be at least {round}, got {pol_round:?}"
                    )
                    .into());
                }
                if polka_id.is_nil() {
                    if self.rs.locked_block.is_some() {
                        tracing::debug!("precommit step; 2/3+ prevoted nil; unlocking");
                        self.rs.unlock();
                    } else {
                        tracing::debug!("precommit step; 2/3+ prevoted nil");
                    }
                    BlockId::nil()
                } else if self
                    .rs
                    .locked_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&polka_id.hash))
                {
                    tracing::debug!("precommit step; 2/3+ prevoted the locked block; relocking");
                    self.rs.locked_round = Some(round);
                    polka_id
                } else if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&polka_id.hash))
                {
                    tracing::debug!("precommit step; 2/3+ prevoted the proposal block; locking");
                    let block = self.rs.proposal_block.clone();
                    if let Err(err) = self
                        .config
                        .application
                        .validate_block(ctx, &self.state, block.as_ref().expect("checked above"))
                        .await
                    {
                        // A polka formed for a block this node considers
                        // invalid; that is not recoverable locally.
                        return Err(err.wrap("2/3+ prevoted an invalid block"));
                    }
                    self.rs.locked_round = Some(round);
                    self.rs.locked_block = block;
                    self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                    polka_id
                } else {
                    // A polka for a block we do not have. Unlock, get
                    // ready to fetch that block, precommit nil.
                    tracing::debug!(
                        "precommit step; 2/3+ prevotes for a block we do not have; voting nil"
                    );
                    self.rs.unlock();
                    let have_header = self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .is_some_and(|p| p.has_header(&polka_id.parts));
                    if !have_header {
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_parts = Some(PartSet::from_header(polka_id.parts));
                    }
                    BlockId::nil()
                }
            }
        };

        self.sign_add_vote(ctx, VoteType::Precommit, vote_id).await?;
        self.rs.round = round;
        self.rs.step = Step::Precommit;
        self.new_step();
        Ok(())
    }

    /// Enters PrecommitWait: 2/3-any precommits are in, wait a bit longer
    /// before moving to the next round.
    pub(crate) fn enter_precommit_wait(
        &mut self,
        height: BlockHeight,
        round: Round,
    ) -> ctx::Result<()> {
        let rs = &mut self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.triggered_timeout_precommit)
        {
            tracing::debug!(
                %height, %round,
                triggered = rs.triggered_timeout_precommit,
                "entering precommit_wait step with invalid args",
            );
            return Ok(());
        }
        let quorum = rs
            .votes
            .precommits(round)
            .is_some_and(|v| v.has_two_thirds_any());
        if !quorum {
            return Err(anyhow::format_err!(
                "entering precommit_wait step ({height}/{round}) without any 2/3+ precommits"
            )
            .into());
        }
        tracing::debug!(
            current = %format_args!("{}/{}/{}", rs.height, rs.round, rs.step),
            "entering precommit_wait step",
        );
        rs.triggered_timeout_precommit = true;
        self.new_step();
        self.schedule_timeout(
            self.config.timeouts.precommit(round),
            height,
            round,
            Step::PrecommitWait,
        );
        Ok(())
    }
}
