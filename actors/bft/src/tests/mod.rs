use crate::{
    io::{BlockPartMsg, ConsensusMsg, ConsensusReq, OutputMessage},
    round_state::Step,
    state_machine::{block_part, proposal, Input},
    testonly::ut_harness::UTHarness,
};
use assert_matches::assert_matches;
use quorum_consensus_roles::{
    node::PeerId,
    validator::{testonly, BlockHeight, BlockId, Round, VoteType},
};
use zksync_concurrency::ctx;

mod ticker;

/// Four healthy validators, an honest proposer: one round, one commit,
/// the height advances.
#[tokio::test]
async fn happy_path_commits_in_one_round() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let mut ut = UTHarness::new(ctx, 4).await;

    ut.start_height(ctx).await;
    // This node proposed, assembled its own parts and prevoted the block.
    assert_eq!(ut.machine.rs.step, Step::Prevote);
    let block_id = ut.proposal_block_id();
    assert!(!block_id.is_nil());

    for i in 1..=2 {
        ut.add_peer_vote(ctx, i, VoteType::Prevote, Round(0), block_id)
            .await;
    }
    // The polka locked us on the proposal and we precommitted it.
    assert_eq!(ut.machine.rs.step, Step::Precommit);
    assert_eq!(ut.machine.rs.locked_round, Some(Round(0)));
    assert!(ut.machine.rs.locked_block.is_some());

    for i in 1..=2 {
        ut.add_peer_vote(ctx, i, VoteType::Precommit, Round(0), block_id)
            .await;
    }
    // 3 of 4 precommits committed the block and rolled the height over.
    assert_eq!(ut.machine.rs.height, BlockHeight(2));
    assert_eq!(ut.machine.rs.step, Step::NewHeight);
    assert_eq!(ut.machine.rs.round, Round(0));
    assert!(ut.machine.steps > 0);

    // Everything the node acted on was also broadcast to the peers.
    let mut broadcast = vec![];
    while let Some(OutputMessage::Network(msg)) = ut.outbound.try_recv() {
        broadcast.push(msg);
    }
    assert!(broadcast
        .iter()
        .any(|m| matches!(m, ConsensusMsg::Proposal(_))));
    assert!(broadcast.iter().any(
        |m| matches!(m, ConsensusMsg::Vote(v) if v.vote_type == VoteType::Precommit && v.block_id == block_id)
    ));

    let state = ut.store.load(ctx).await.unwrap().unwrap();
    assert_eq!(state.last_block_height, BlockHeight(1));
    assert!(ut
        .store
        .load_abci_responses(ctx, BlockHeight(1))
        .await
        .unwrap()
        .is_some());
}

/// A silent proposer: the propose timeout elapses, everyone prevotes and
/// precommits nil, and the height moves to round 1.
#[tokio::test]
async fn silent_proposer_moves_to_next_round() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    // This node holds key 1; the round-0 proposer (validator 0) says
    // nothing.
    let mut ut = UTHarness::new_with_signer(ctx, 4, 1).await;

    ut.start_height(ctx).await;
    assert_eq!(ut.machine.rs.step, Step::Propose);

    let tick = ut.take_tick(Step::Propose);
    ut.fire(ctx, tick).await;
    ut.process_ready(ctx).await;
    // With no proposal in sight, this node prevoted nil.
    assert_eq!(ut.machine.rs.step, Step::Prevote);

    for i in [0, 2] {
        ut.add_peer_vote(ctx, i, VoteType::Prevote, Round(0), BlockId::nil())
            .await;
    }
    // A nil polka: precommit nil without ever locking.
    assert_eq!(ut.machine.rs.step, Step::Precommit);
    assert!(ut.machine.rs.locked_block.is_none());

    for i in [0, 2] {
        ut.add_peer_vote(ctx, i, VoteType::Precommit, Round(0), BlockId::nil())
            .await;
    }
    assert!(ut.machine.rs.triggered_timeout_precommit);

    let tick = ut.take_tick(Step::PrecommitWait);
    ut.fire(ctx, tick).await;
    ut.process_ready(ctx).await;
    assert_eq!(ut.machine.rs.height, BlockHeight(1));
    assert_eq!(ut.machine.rs.round, Round(1));
}

/// A validator locked on block X unlocks when a later round produces a
/// polka for a different block.
#[tokio::test]
async fn newer_polka_unlocks() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let mut ut = UTHarness::new(ctx, 4).await;

    // Round 0: propose, see a polka for our block X, lock on it.
    ut.start_height(ctx).await;
    let block_x = ut.proposal_block_id();
    for i in 1..=2 {
        ut.add_peer_vote(ctx, i, VoteType::Prevote, Round(0), block_x)
            .await;
    }
    assert_eq!(ut.machine.rs.locked_round, Some(Round(0)));

    // The rest of the network precommits nil and the round times out.
    for i in [1, 2] {
        ut.add_peer_vote(ctx, i, VoteType::Precommit, Round(0), BlockId::nil())
            .await;
    }
    let tick = ut.take_tick(Step::PrecommitWait);
    ut.fire(ctx, tick).await;
    ut.process_ready(ctx).await;
    assert_eq!(ut.machine.rs.round, Round(1));
    assert!(ut.machine.rs.locked_block.is_some());

    // Round 1 polka for an unrelated block Y: the lock must not survive.
    let block_y = testonly::random_block_id(rng);
    for i in 1..=3 {
        ut.add_peer_vote(ctx, i, VoteType::Prevote, Round(1), block_y)
            .await;
    }
    assert!(ut.machine.rs.locked_block.is_none());
    assert_eq!(ut.machine.rs.locked_round, None);
}

/// A double-signing validator produces exactly one evidence record and
/// does not move the tally.
#[tokio::test]
async fn double_sign_becomes_evidence() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let mut ut = UTHarness::new(ctx, 4).await;

    ut.start_height(ctx).await;
    let block_x = ut.proposal_block_id();
    let block_y = testonly::random_block_id(rng);

    ut.add_peer_vote(ctx, 1, VoteType::Prevote, Round(0), block_x)
        .await;
    let tally_before = ut
        .machine
        .rs
        .votes
        .prevotes(Round(0))
        .unwrap()
        .power_for(&block_x);

    ut.add_peer_vote(ctx, 1, VoteType::Prevote, Round(0), block_y)
        .await;
    assert_eq!(ut.machine.evidence_pool.len(), 1);
    let prevotes = ut.machine.rs.votes.prevotes(Round(0)).unwrap();
    assert_eq!(prevotes.power_for(&block_x), tally_before);
    assert_eq!(prevotes.power_for(&block_y), 0);

    // Feeding the same pair again adds nothing.
    ut.add_peer_vote(ctx, 1, VoteType::Prevote, Round(0), block_y)
        .await;
    assert_eq!(ut.machine.evidence_pool.len(), 1);
}

/// Only the first proposal at a (height, round) is accepted.
#[tokio::test]
async fn duplicate_proposal_is_rejected() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let mut ut = UTHarness::new(ctx, 4).await;

    ut.start_height(ctx).await;
    let first = ut.machine.rs.proposal.clone().unwrap();

    // A second proposal (even an identical one) bounces off.
    let res = ut.machine.on_proposal(ctx, first.clone()).await;
    assert_matches!(res, Err(proposal::Error::Duplicate));
    assert_eq!(ut.machine.rs.proposal, Some(first));
}

/// Precommits of the previous height keep accumulating while the node
/// waits out the commit timeout.
#[tokio::test]
async fn late_precommits_fill_last_commit() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let mut ut = UTHarness::new(ctx, 4).await;

    ut.start_height(ctx).await;
    let block_id = ut.proposal_block_id();
    for i in 1..=2 {
        ut.add_peer_vote(ctx, i, VoteType::Prevote, Round(0), block_id)
            .await;
    }
    for i in 1..=2 {
        ut.add_peer_vote(ctx, i, VoteType::Precommit, Round(0), block_id)
            .await;
    }
    assert_eq!(ut.machine.rs.height, BlockHeight(2));

    // The straggler's precommit for height 1 still lands in last_commit.
    let vote = ut
        .setup
        .make_vote(3, VoteType::Precommit, BlockHeight(1), Round(0), block_id);
    let peer = PeerId::from("peer3");
    ut.machine.on_vote(ctx, vote, Some(&peer)).await.unwrap();
    assert!(ut.machine.rs.last_commit.as_ref().unwrap().has_all());
}

/// Oversized block parts are rejected without being added.
#[tokio::test]
async fn oversized_block_part_is_rejected() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let mut ut = UTHarness::new_with_signer(ctx, 4, 1).await;

    ut.start_height(ctx).await;
    let max = ut.machine.state.consensus_params.block.max_bytes;

    // Hand-craft a proposal pointing at a huge part set, then feed a part
    // that would blow past the block size limit.
    let rng = &mut ctx.rng();
    let block_id = testonly::random_block_id(rng);
    let mut proposal = quorum_consensus_roles::validator::Proposal::new(
        BlockHeight(1),
        Round(0),
        None,
        block_id,
        quorum_consensus_roles::validator::Timestamp(0),
    );
    proposal.signature =
        Some(ut.setup.keys[0].sign(&proposal.sign_bytes(ut.setup.chain_id())));
    ut.machine.on_proposal(ctx, proposal).await.unwrap();

    let part = quorum_consensus_roles::validator::Part {
        index: 0,
        bytes: vec![0; max as usize + 1],
        proof: quorum_consensus_roles::validator::Proof {
            total: 1,
            index: 0,
            leaf_hash: quorum_consensus_roles::validator::Hash::zero(),
            aunts: vec![],
        },
    };
    let res = ut
        .machine
        .on_block_part(
            ctx,
            BlockPartMsg {
                height: BlockHeight(1),
                round: Round(0),
                part,
            },
        )
        .await;
    assert_matches!(res, Err(block_part::Error::Oversized { .. }));
    assert_eq!(
        ut.machine
            .rs
            .proposal_block_parts
            .as_ref()
            .unwrap()
            .count(),
        0
    );
}

/// Recovery: a machine restarted over the persisted state and the seen
/// commit resumes at the next height.
#[tokio::test]
async fn restart_resumes_from_store() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let mut ut = UTHarness::new(ctx, 4).await;

    ut.start_height(ctx).await;
    let block_id = ut.proposal_block_id();
    for i in 1..=2 {
        ut.add_peer_vote(ctx, i, VoteType::Prevote, Round(0), block_id)
            .await;
    }
    for i in 1..=2 {
        ut.add_peer_vote(ctx, i, VoteType::Precommit, Round(0), block_id)
            .await;
    }
    assert_eq!(ut.machine.rs.height, BlockHeight(2));
    let seen_commit = ut
        .machine
        .rs
        .last_commit
        .as_ref()
        .unwrap()
        .make_commit()
        .unwrap();

    let restarted = UTHarness::restart(
        ctx,
        ut.setup.clone(),
        ut.store.clone(),
        0,
        Some(seen_commit),
    )
    .await;
    assert_eq!(restarted.machine.rs.height, BlockHeight(2));
    assert_eq!(restarted.machine.rs.step, Step::NewHeight);
    assert!(restarted.machine.rs.last_commit.is_some());
}

/// Stale tocks (older height, round or step) never cause a transition.
#[tokio::test]
async fn stale_tock_is_ignored() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let mut ut = UTHarness::new_with_signer(ctx, 4, 1).await;

    ut.start_height(ctx).await;
    assert_eq!(ut.machine.rs.step, Step::Propose);

    // A tock from a bygone height does nothing.
    let stale = crate::ticker::TimeoutInfo {
        duration: zksync_concurrency::time::Duration::ZERO,
        height: BlockHeight(0),
        round: Round(0),
        step: Step::NewHeight,
    };
    ut.fire(ctx, stale).await;
    assert_eq!(ut.machine.rs.step, Step::Propose);
    assert_eq!(ut.machine.rs.height, BlockHeight(1));
}

/// The signer refuses to produce two different votes for one slot, which
/// is what keeps an honest node from ever equivocating.
#[tokio::test]
async fn signer_refuses_to_equivocate() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let rng = &mut ctx.rng();
    let setup = quorum_consensus_roles::validator::testonly::Setup::new(rng, 1);
    use crate::PrivValidator as _;
    let signer = crate::testonly::LocalSigner::new(setup.keys[0].clone());

    let block_x = testonly::random_block_id(rng);
    let block_y = testonly::random_block_id(rng);
    let mut vote = ut_vote(&setup, VoteType::Precommit, block_x);
    signer
        .sign_vote(ctx, setup.chain_id(), &mut vote)
        .await
        .unwrap();

    // Same slot, same content: fine. Same slot, different block: refused.
    let mut again = ut_vote(&setup, VoteType::Precommit, block_x);
    signer
        .sign_vote(ctx, setup.chain_id(), &mut again)
        .await
        .unwrap();
    let mut conflicting = ut_vote(&setup, VoteType::Precommit, block_y);
    assert!(signer
        .sign_vote(ctx, setup.chain_id(), &mut conflicting)
        .await
        .is_err());
    assert!(conflicting.signature.is_none());
}

fn ut_vote(
    setup: &quorum_consensus_roles::validator::testonly::Setup,
    vote_type: VoteType,
    block_id: BlockId,
) -> quorum_consensus_roles::validator::Vote {
    quorum_consensus_roles::validator::Vote {
        vote_type,
        height: BlockHeight(7),
        round: Round(0),
        block_id,
        timestamp: quorum_consensus_roles::validator::Timestamp(0),
        validator_address: setup.keys[0].public().address(),
        validator_index: 0,
        signature: None,
        extension: None,
    }
}

/// Input wrapping used by the dispatcher path keeps working end to end:
/// a vote pushed through the queue is processed like a direct call.
#[tokio::test]
async fn queued_inputs_are_processed() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let mut ut = UTHarness::new(ctx, 4).await;

    ut.start_height(ctx).await;
    let block_id = ut.proposal_block_id();
    let vote = ut
        .setup
        .make_vote(1, VoteType::Prevote, BlockHeight(1), Round(0), block_id);
    ut.push_input(Input::Message(ConsensusReq {
        msg: ConsensusMsg::Vote(vote),
        peer: Some(PeerId::from("peer1")),
    }));
    ut.process_ready(ctx).await;
    assert_eq!(
        ut.machine
            .rs
            .votes
            .prevotes(Round(0))
            .unwrap()
            .power_for(&block_id),
        200
    );
}
