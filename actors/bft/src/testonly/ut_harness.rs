//! Unit-test harness driving the state machine directly, without the
//! network or the ticker task: outbound messages, loopback inputs and
//! scheduled timeouts are all captured in channels the test can inspect.
use crate::{
    io::OutputMessage,
    round_state::Step,
    state_machine::{Input, StateMachine},
    testonly::{LocalSigner, RandomPayloadApp},
    ticker::TimeoutInfo,
    Config, TimeoutConfig,
};
use quorum_consensus_roles::{
    node::PeerId,
    validator::{testonly::Setup, BlockId, Commit, Round, VoteType},
};
use quorum_consensus_storage::{testonly::new_store, StateStore};
use std::sync::Arc;
use zksync_concurrency::ctx;

pub(crate) const PAYLOAD_SIZE: usize = 257;

/// `UTHarness` wires a [`StateMachine`] for one validator to in-memory
/// channels. It should be instantiated once per test case.
pub(crate) struct UTHarness {
    pub(crate) machine: StateMachine,
    pub(crate) setup: Setup,
    pub(crate) store: StateStore,
    pub(crate) outbound: ctx::channel::UnboundedReceiver<OutputMessage>,
    pub(crate) inbound: ctx::channel::UnboundedReceiver<Input>,
    pub(crate) ticks: ctx::channel::UnboundedReceiver<TimeoutInfo>,
    inbound_send: ctx::channel::UnboundedSender<Input>,
}

impl UTHarness {
    /// A harness whose node signs with the proposer of round 0 (the
    /// first validator in set order).
    pub(crate) async fn new(ctx: &ctx::Ctx, num_validators: usize) -> Self {
        Self::new_with_signer(ctx, num_validators, 0).await
    }

    /// A harness whose node signs with the key of validator
    /// `signer_index`.
    pub(crate) async fn new_with_signer(
        ctx: &ctx::Ctx,
        num_validators: usize,
        signer_index: usize,
    ) -> Self {
        let rng = &mut ctx.rng();
        let setup = Setup::new(rng, num_validators);
        let store = new_store();
        store.save(ctx, &setup.genesis).await.unwrap();
        Self::restart(ctx, setup, store, signer_index, None).await
    }

    /// Builds a machine over an existing store, as a node restart would.
    pub(crate) async fn restart(
        ctx: &ctx::Ctx,
        setup: Setup,
        store: StateStore,
        signer_index: usize,
        seen_commit: Option<Commit>,
    ) -> Self {
        let config = Arc::new(Config {
            priv_validator: Some(Arc::new(LocalSigner::new(setup.keys[signer_index].clone()))),
            application: Arc::new(RandomPayloadApp {
                payload_size: PAYLOAD_SIZE,
            }),
            state_store: store.clone(),
            seen_commit,
            timeouts: TimeoutConfig::default(),
        });
        let (outbound_send, outbound) = ctx::channel::unbounded();
        let (inbound_send, inbound) = ctx::channel::unbounded();
        let (tick_send, ticks) = ctx::channel::unbounded();
        let machine = StateMachine::start(
            ctx,
            config,
            outbound_send,
            inbound_send.clone(),
            tick_send,
        )
        .await
        .unwrap();
        Self {
            machine,
            setup,
            store,
            outbound,
            inbound,
            ticks,
            inbound_send,
        }
    }

    /// Feeds every queued loopback input (the node's own published
    /// messages) back into the machine, until the queue is drained.
    pub(crate) async fn process_ready(&mut self, ctx: &ctx::Ctx) {
        while let Some(input) = self.inbound.try_recv() {
            self.machine.process_input(ctx, input).await.unwrap();
        }
    }

    /// Pops all scheduled timeouts, returning the one for the given
    /// step.
    pub(crate) fn take_tick(&mut self, step: Step) -> TimeoutInfo {
        let mut found = None;
        while let Some(tick) = self.ticks.try_recv() {
            if tick.step == step {
                found = Some(tick);
            }
        }
        found.unwrap_or_else(|| panic!("no {step} timeout scheduled"))
    }

    /// Expires the given scheduled timeout.
    pub(crate) async fn fire(&mut self, ctx: &ctx::Ctx, tick: TimeoutInfo) {
        self.machine.handle_timeout(ctx, tick).await.unwrap();
    }

    /// Fires the pending NewHeight timeout, entering round 0 of the
    /// current height, and processes everything the node publishes in
    /// response.
    pub(crate) async fn start_height(&mut self, ctx: &ctx::Ctx) {
        let tick = self.take_tick(Step::NewHeight);
        self.fire(ctx, tick).await;
        self.process_ready(ctx).await;
    }

    /// The block id of the current proposal.
    pub(crate) fn proposal_block_id(&self) -> BlockId {
        self.machine
            .rs
            .proposal
            .as_ref()
            .expect("no proposal")
            .block_id
    }

    /// Feeds a signed vote from validator `index` as if it arrived from
    /// a peer, processing any messages the node publishes in response.
    pub(crate) async fn add_peer_vote(
        &mut self,
        ctx: &ctx::Ctx,
        index: usize,
        vote_type: VoteType,
        round: Round,
        block_id: BlockId,
    ) {
        let vote = self.setup.make_vote(
            index,
            vote_type,
            self.machine.rs.height,
            round,
            block_id,
        );
        let peer = PeerId(format!("peer{index}"));
        self.machine
            .on_vote(ctx, vote, Some(&peer))
            .await
            .unwrap();
        self.process_ready(ctx).await;
    }

    /// Queues an input as the dispatcher would.
    pub(crate) fn push_input(&self, input: Input) {
        self.inbound_send.send(input);
    }
}
