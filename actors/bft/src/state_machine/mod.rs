//! The consensus driver: a single task owning the round state and
//! processing peer messages, its own published messages and timer fires
//! strictly serially.
use crate::{
    height_vote_set::HeightVoteSet,
    io::{ConsensusMsg, ConsensusReq, OutputMessage},
    metrics,
    round_state::{RoundState, Step},
    ticker::TimeoutInfo,
    Config,
};
use quorum_consensus_roles::validator::{
    BlockHeight, ChainState, DuplicateVoteEvidence, PublicKey, Round,
};
use std::sync::Arc;
use zksync_concurrency::{ctx, error::Wrap as _, metrics::LatencyHistogramExt as _, time};

pub(crate) mod block_part;
mod commit;
pub(crate) mod proposal;
mod round;
pub(crate) mod vote;

/// One element of the driver's serial input queue.
#[derive(Debug)]
pub(crate) enum Input {
    /// A consensus message, from a peer or from this node itself.
    Message(ConsensusReq),
    /// An expired timeout.
    Tock(TimeoutInfo),
}

/// The consensus state machine. All transitions run on the task calling
/// [`StateMachine::run`]; nothing else touches the round state.
#[derive(Debug)]
pub(crate) struct StateMachine {
    /// Consensus configuration.
    pub(crate) config: Arc<Config>,
    /// Channel through which the driver sends network messages.
    outbound_pipe: ctx::channel::UnboundedSender<OutputMessage>,
    /// Loopback into the driver's own input queue; self-published
    /// messages re-enter through here.
    inbound_pipe: ctx::channel::UnboundedSender<Input>,
    /// Channel arming the timeout ticker.
    ticker_pipe: ctx::channel::UnboundedSender<TimeoutInfo>,
    /// State of the height in progress.
    pub(crate) rs: RoundState,
    /// Chain state after the last committed block. Validator sets in here
    /// carry their baseline rotation priorities (as of the height they
    /// last changed); per-height working copies live in `rs`.
    pub(crate) state: ChainState,
    /// Memoized public key of this node's signer.
    pub(crate) privval_pub_key: Option<PublicKey>,
    /// Misbehavior observed since the last block, awaiting inclusion.
    pub(crate) evidence_pool: Vec<DuplicateVoteEvidence>,
    /// Number of step changes, for logs and tests.
    pub(crate) steps: u64,
}

impl StateMachine {
    /// Creates the driver from the persisted chain state and schedules
    /// the first round of the next height.
    pub(crate) async fn start(
        ctx: &ctx::Ctx,
        config: Arc<Config>,
        outbound_pipe: ctx::channel::UnboundedSender<OutputMessage>,
        inbound_pipe: ctx::channel::UnboundedSender<Input>,
        ticker_pipe: ctx::channel::UnboundedSender<TimeoutInfo>,
    ) -> ctx::Result<Self> {
        let state = config
            .state_store
            .load(ctx)
            .await
            .wrap("state_store.load()")?
            .ok_or_else(|| {
                anyhow::format_err!("state store is empty; seed it with the genesis state first")
            })?;

        let mut this = Self {
            rs: RoundState {
                height: BlockHeight(0),
                round: Round(0),
                step: Step::NewHeight,
                start_time: ctx.now(),
                commit_time: None,
                validators: state.validators.clone(),
                proposal: None,
                proposal_block: None,
                proposal_block_parts: None,
                locked_round: None,
                locked_block: None,
                locked_block_parts: None,
                valid_round: None,
                valid_block: None,
                valid_block_parts: None,
                votes: HeightVoteSet::new(
                    state.chain_id.clone(),
                    BlockHeight(0),
                    state.validators.clone(),
                ),
                commit_round: None,
                last_commit: None,
                last_validators: state.last_validators.clone(),
                triggered_timeout_precommit: false,
            },
            config,
            outbound_pipe,
            inbound_pipe,
            ticker_pipe,
            state: state.clone(),
            privval_pub_key: None,
            evidence_pool: Vec::new(),
            steps: 0,
        };

        if state.last_block_height.0 > 0 {
            this.reconstruct_last_commit(&state)?;
        }
        this.update_to_state(ctx, state)?;
        this.update_priv_validator_pub_key(ctx).await?;
        this.schedule_round_0(ctx);
        Ok(this)
    }

    /// Runs the driver loop until the context is canceled. Recoverable
    /// errors are logged and dropped; internal errors abort the actor.
    pub(crate) async fn run(
        mut self,
        ctx: &ctx::Ctx,
        mut inbound: ctx::channel::UnboundedReceiver<Input>,
    ) -> ctx::Result<()> {
        loop {
            let input = inbound.recv(ctx).await?;
            let started = ctx.now();
            let label = self.process_input(ctx, input).await?;
            metrics::METRICS.processing_latency[&label].observe_latency(ctx.now() - started);
        }
    }

    /// Processes one input, triaging handler errors the way the run loop
    /// expects: `Internal` aborts, everything else is logged.
    pub(crate) async fn process_input(
        &mut self,
        ctx: &ctx::Ctx,
        input: Input,
    ) -> ctx::Result<metrics::ProcessingLabels> {
        let label = match input {
            Input::Tock(tock) => {
                let res = self.handle_timeout(ctx, tock).await;
                let label = metrics::InputLabel::Timeout.with_result(&res);
                res?;
                label
            }
            Input::Message(req) => {
                let peer = req.peer;
                match req.msg {
                    ConsensusMsg::Proposal(p) => {
                        let res = self.on_proposal(ctx, p).await.wrap("on_proposal()");
                        let label = metrics::InputLabel::Proposal.with_result(&res);
                        match res {
                            Ok(()) => {}
                            Err(proposal::Error::Internal(err)) => return Err(err),
                            Err(err @ proposal::Error::Duplicate)
                            | Err(err @ proposal::Error::Mismatch { .. }) => {
                                tracing::debug!("on_proposal: {err:#}");
                            }
                            Err(err) => tracing::warn!(?peer, "on_proposal: {err:#}"),
                        }
                        label
                    }
                    ConsensusMsg::BlockPart(bp) => {
                        let res = self.on_block_part(ctx, bp).await.wrap("on_block_part()");
                        let label = metrics::InputLabel::BlockPart.with_result(&res);
                        match res {
                            Ok(()) => {}
                            Err(block_part::Error::Internal(err)) => return Err(err),
                            Err(err @ block_part::Error::WrongHeight { .. })
                            | Err(err @ block_part::Error::NotExpecting { .. }) => {
                                tracing::debug!("on_block_part: {err:#}");
                            }
                            Err(err) => tracing::warn!(?peer, "on_block_part: {err:#}"),
                        }
                        label
                    }
                    ConsensusMsg::Vote(v) => {
                        let res = self.on_vote(ctx, v, peer.as_ref()).await.wrap("on_vote()");
                        let label = metrics::InputLabel::Vote.with_result(&res);
                        match res {
                            Ok(()) => {}
                            Err(vote::Error::Internal(err)) => return Err(err),
                            Err(err @ vote::Error::WrongHeight { .. }) => {
                                tracing::debug!("on_vote: {err:#}");
                            }
                            Err(err) => tracing::warn!(?peer, "on_vote: {err:#}"),
                        }
                        label
                    }
                }
            }
        };
        Ok(label)
    }

    /// Handles an expired timeout. Tocks that no longer match the
    /// driver's position are dropped.
    pub(crate) async fn handle_timeout(
        &mut self,
        ctx: &ctx::Ctx,
        tock: TimeoutInfo,
    ) -> ctx::Result<()> {
        if tock.height != self.rs.height
            || tock.round < self.rs.round
            || (tock.round == self.rs.round && tock.step < self.rs.step)
        {
            tracing::debug!(
                height = %tock.height,
                round = %tock.round,
                step = %tock.step,
                "ignoring tock because we are ahead",
            );
            return Ok(());
        }
        match tock.step {
            Step::NewHeight => self.enter_new_round(ctx, tock.height, Round(0)).await?,
            Step::NewRound => self.enter_propose(ctx, tock.height, tock.round).await?,
            Step::Propose => self.enter_prevote(ctx, tock.height, tock.round).await?,
            Step::PrevoteWait => self.enter_precommit(ctx, tock.height, tock.round).await?,
            Step::PrecommitWait => {
                self.enter_precommit(ctx, tock.height, tock.round).await?;
                self.enter_new_round(ctx, tock.height, tock.round.next())
                    .await?;
            }
            step => {
                return Err(anyhow::format_err!("invalid timeout step: {step}").into());
            }
        }
        Ok(())
    }

    /// Arms the timeout ticker.
    pub(crate) fn schedule_timeout(
        &self,
        duration: time::Duration,
        height: BlockHeight,
        round: Round,
        step: Step,
    ) {
        self.ticker_pipe.send(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    /// Schedules entering round 0 of the current height at its start
    /// time.
    pub(crate) fn schedule_round_0(&self, ctx: &ctx::Ctx) {
        let sleep = self.rs.start_time - ctx.now();
        self.schedule_timeout(sleep, self.rs.height, Round(0), Step::NewHeight);
    }

    /// Publishes a message: out to the peers and back into this node's
    /// own input queue.
    pub(crate) fn publish(&self, msg: ConsensusMsg) {
        self.outbound_pipe.send(OutputMessage::Network(msg.clone()));
        self.inbound_pipe
            .send(Input::Message(ConsensusReq { msg, peer: None }));
    }

    /// Registers a step change.
    pub(crate) fn new_step(&mut self) {
        self.steps += 1;
        metrics::METRICS.height.set(self.rs.height.0);
        metrics::METRICS.round.set(self.rs.round.0 as u64);
        tracing::trace!(
            height = %self.rs.height,
            round = %self.rs.round,
            step = %self.rs.step,
            "new step",
        );
    }

    /// Refreshes the memoized signer key, bounding the signer call by the
    /// larger of the vote timeouts. A timed-out or failing signer is not
    /// fatal: the stale key (if any) stays in place.
    pub(crate) async fn update_priv_validator_pub_key(&mut self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        let Some(priv_validator) = &self.config.priv_validator else {
            return Ok(());
        };
        let timeouts = &self.config.timeouts;
        let mut bound = std::cmp::max(timeouts.timeout_prevote, timeouts.timeout_precommit);
        if self.rs.step >= Step::Precommit {
            // Past the precommit there is no vote left to miss at this
            // height; do not stall the commit path on a slow signer.
            bound = time::Duration::ZERO;
        }
        let bounded = ctx.with_timeout(bound);
        match priv_validator.pub_key(&bounded).await {
            Ok(key) => self.privval_pub_key = Some(key),
            Err(err) => {
                if !ctx.is_active() {
                    return Err(ctx::Canceled.into());
                }
                tracing::warn!("failed fetching the signer key: {err:#}");
            }
        }
        Ok(())
    }
}
