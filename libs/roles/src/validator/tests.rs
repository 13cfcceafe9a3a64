use super::{testonly::Setup, *};
use assert_matches::assert_matches;
use rand::{rngs::StdRng, SeedableRng};

fn rng() -> StdRng {
    StdRng::seed_from_u64(0xdead_beef)
}

fn make_block(setup: &Setup, payload: Payload) -> Block {
    Block {
        header: BlockHeader {
            chain_id: setup.chain_id().to_string(),
            height: BlockHeight(1),
            time: Timestamp(1_700_000_000_000_000_000),
            last_block_id: BlockId::nil(),
            last_commit_hash: Commit::initial().hash(),
            validators_hash: setup.genesis.validators.hash(),
            app_hash: Hash::zero(),
            results_hash: Hash::zero(),
            proposer_address: setup.genesis.validators.proposer().address,
        },
        payload,
        evidence: vec![],
        last_commit: Commit::initial(),
    }
}

#[test]
fn merkle_proofs_verify() {
    let leaves: Vec<Vec<u8>> = (0u8..7).map(|i| vec![i; 100]).collect();
    let (root, proofs) = merkle::proofs(leaves.iter());
    assert_eq!(root, merkle::root(leaves.iter()));
    for (leaf, proof) in leaves.iter().zip(&proofs) {
        proof.verify(&root, leaf).unwrap();
    }
    // A proof must not verify against a different leaf or root.
    assert!(proofs[0].verify(&root, &leaves[1]).is_err());
    assert!(proofs[0].verify(&Hash::zero(), &leaves[0]).is_err());
    // Nor at a shifted index.
    let mut shifted = proofs[2].clone();
    shifted.index = 3;
    assert!(shifted.verify(&root, &leaves[2]).is_err());
}

#[test]
fn part_set_round_trip() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let block = make_block(&setup, testonly::random_payload(rng, 3 * PART_SIZE + 17));
    let complete = block.part_set();
    assert_eq!(complete.header().total, 4);
    assert!(complete.is_complete());

    // Feed the parts into a fresh set in arbitrary order.
    let mut partial = PartSet::from_header(complete.header());
    let mut parts: Vec<Part> = complete.parts().cloned().collect();
    parts.reverse();
    for part in parts {
        assert!(partial.add_part(part).unwrap());
    }
    assert!(partial.is_complete());
    assert_eq!(partial.assemble().unwrap(), block);
}

#[test]
fn part_set_rejects_bad_parts() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let block = make_block(&setup, testonly::random_payload(rng, 2 * PART_SIZE));
    let complete = block.part_set();
    let mut partial = PartSet::from_header(complete.header());

    let good = complete.part(0).unwrap().clone();
    assert!(partial.add_part(good.clone()).unwrap());
    // Adding the same part again is a no-op.
    assert!(!partial.add_part(good.clone()).unwrap());

    // Out-of-range index.
    let mut oob = good.clone();
    oob.index = complete.header().total;
    oob.proof.index = oob.index;
    assert_matches!(partial.add_part(oob), Err(PartSetError::OutOfRange { .. }));

    // Corrupted bytes fail the proof.
    let mut corrupt = complete.part(1).unwrap().clone();
    corrupt.bytes[0] ^= 0xff;
    assert_matches!(
        partial.add_part(corrupt),
        Err(PartSetError::InvalidProof(_))
    );
    assert_eq!(partial.count(), 1);
}

#[test]
fn proposer_rotation_is_fair() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let mut validators = setup.genesis.validators.clone();
    // With equal weights, 8 rounds give every validator exactly 2 turns.
    let mut turns = std::collections::BTreeMap::new();
    for _ in 0..8 {
        *turns.entry(validators.proposer().address).or_insert(0) += 1;
        validators.increment_proposer_priority(1);
    }
    assert_eq!(turns.len(), 4);
    assert!(turns.values().all(|&n| n == 2));
}

#[test]
fn proposer_rotation_weighted() {
    let rng = &mut rng();
    let setup = Setup::with_weights(rng, vec![100, 100, 200]);
    let mut validators = setup.genesis.validators.clone();
    let heavy = setup
        .genesis
        .validators
        .iter()
        .find(|v| v.voting_power == 200)
        .unwrap()
        .address;
    let mut heavy_turns = 0;
    for _ in 0..8 {
        if validators.proposer().address == heavy {
            heavy_turns += 1;
        }
        validators.increment_proposer_priority(1);
    }
    // The double-weight validator proposes half the rounds.
    assert_eq!(heavy_turns, 4);
}

#[test]
fn increment_many_equals_increment_repeatedly() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let mut a = setup.genesis.validators.clone();
    let mut b = setup.genesis.validators.clone();
    a.increment_proposer_priority(5);
    for _ in 0..5 {
        b.increment_proposer_priority(1);
    }
    assert_eq!(a, b);
}

#[test]
fn vote_set_detects_majorities() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let block_id = testonly::random_block_id(rng);
    let mut votes = VoteSet::new(
        setup.chain_id().to_string(),
        BlockHeight(1),
        Round(0),
        VoteType::Prevote,
        setup.genesis.validators.clone(),
    );

    for i in 0..2 {
        let vote = setup.make_vote(i, VoteType::Prevote, BlockHeight(1), Round(0), block_id);
        assert_matches!(votes.add_vote(vote), Ok(VoteAdded::Added));
    }
    assert!(!votes.has_two_thirds_any());
    assert!(votes.two_thirds_majority().is_none());

    // A third, diverging vote crosses 2/3-any but not 2/3-one.
    let nil = setup.make_vote(2, VoteType::Prevote, BlockHeight(1), Round(0), BlockId::nil());
    assert_matches!(votes.add_vote(nil), Ok(VoteAdded::Added));
    assert!(votes.has_two_thirds_any());
    assert!(votes.two_thirds_majority().is_none());

    let vote = setup.make_vote(3, VoteType::Prevote, BlockHeight(1), Round(0), block_id);
    assert_matches!(votes.add_vote(vote), Ok(VoteAdded::Added));
    assert_eq!(votes.two_thirds_majority(), Some(block_id));
    assert!(!votes.has_all());
}

#[test]
fn vote_set_rejects_malformed_votes() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let block_id = testonly::random_block_id(rng);
    let mut votes = VoteSet::new(
        setup.chain_id().to_string(),
        BlockHeight(5),
        Round(1),
        VoteType::Prevote,
        setup.genesis.validators.clone(),
    );

    let wrong_height = setup.make_vote(0, VoteType::Prevote, BlockHeight(4), Round(1), block_id);
    assert_matches!(
        votes.add_vote(wrong_height),
        Err(VoteSetError::UnexpectedHeight { .. })
    );
    let wrong_round = setup.make_vote(0, VoteType::Prevote, BlockHeight(5), Round(0), block_id);
    assert_matches!(
        votes.add_vote(wrong_round),
        Err(VoteSetError::UnexpectedRound { .. })
    );
    let wrong_type = setup.make_vote(0, VoteType::Precommit, BlockHeight(5), Round(1), block_id);
    assert_matches!(
        votes.add_vote(wrong_type),
        Err(VoteSetError::UnexpectedType { .. })
    );

    let mut bad_index = setup.make_vote(0, VoteType::Prevote, BlockHeight(5), Round(1), block_id);
    bad_index.validator_index = 17;
    assert_matches!(
        votes.add_vote(bad_index),
        Err(VoteSetError::IndexOutOfRange { .. })
    );

    // A vote signed by the wrong key is rejected.
    let mut forged = setup.make_vote(0, VoteType::Prevote, BlockHeight(5), Round(1), block_id);
    forged.signature = Some(setup.keys[1].sign(&forged.sign_bytes(setup.chain_id())));
    assert_matches!(
        votes.add_vote(forged),
        Err(VoteSetError::InvalidSignature(_))
    );
}

#[test]
fn conflicting_vote_becomes_evidence_once() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let block_x = testonly::random_block_id(rng);
    let block_y = testonly::random_block_id(rng);
    let mut votes = VoteSet::new(
        setup.chain_id().to_string(),
        BlockHeight(5),
        Round(0),
        VoteType::Prevote,
        setup.genesis.validators.clone(),
    );

    let first = setup.make_vote(1, VoteType::Prevote, BlockHeight(5), Round(0), block_x);
    assert_matches!(votes.add_vote(first.clone()), Ok(VoteAdded::Added));
    let power_before = votes.power_for(&block_x);

    // The equivocating vote yields evidence and leaves the tally alone.
    let second = setup.make_vote(1, VoteType::Prevote, BlockHeight(5), Round(0), block_y);
    let evidence = match votes.add_vote(second.clone()) {
        Ok(VoteAdded::Conflict(ev)) => ev,
        other => panic!("expected conflict, got {other:?}"),
    };
    assert_eq!(evidence.validator_address(), first.validator_address);
    assert_eq!(votes.power_for(&block_x), power_before);
    assert_eq!(votes.power_for(&block_y), 0);
    assert_eq!(votes.vote(1), Some(&first));

    // Re-sending the first vote is a plain duplicate.
    assert_matches!(votes.add_vote(first), Ok(VoteAdded::Duplicate));
}

#[test]
fn commit_round_trips_through_vote_set() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 4);
    let block_id = testonly::random_block_id(rng);
    let mut votes = VoteSet::new(
        setup.chain_id().to_string(),
        BlockHeight(3),
        Round(2),
        VoteType::Precommit,
        setup.genesis.validators.clone(),
    );
    for i in 0..3 {
        let vote = setup.make_vote(i, VoteType::Precommit, BlockHeight(3), Round(2), block_id);
        assert_matches!(votes.add_vote(vote), Ok(VoteAdded::Added));
    }
    let commit = votes.make_commit().unwrap();
    assert_eq!(commit.block_id, block_id);
    assert_eq!(commit.signatures.len(), 4);

    let rebuilt = VoteSet::from_commit(
        setup.chain_id().to_string(),
        setup.genesis.validators.clone(),
        &commit,
    )
    .unwrap();
    assert_eq!(rebuilt.two_thirds_majority(), Some(block_id));
    assert!(!rebuilt.has_all());
}

#[test]
fn proposal_signature_covers_chain_id() {
    let rng = &mut rng();
    let setup = Setup::new(rng, 1);
    let mut proposal = Proposal::new(
        BlockHeight(1),
        Round(0),
        None,
        testonly::random_block_id(rng),
        Timestamp(42),
    );
    let key = &setup.keys[0];
    proposal.signature = Some(key.sign(&proposal.sign_bytes(setup.chain_id())));
    proposal.verify(setup.chain_id(), &key.public()).unwrap();
    assert!(proposal.verify("otherchain", &key.public()).is_err());
}

#[test]
fn proposal_pol_round_must_precede_round() {
    let rng = &mut rng();
    let block_id = testonly::random_block_id(rng);
    let ok = Proposal::new(BlockHeight(1), Round(3), Some(Round(1)), block_id, Timestamp(0));
    ok.validate_pol_round().unwrap();
    let bad = Proposal::new(BlockHeight(1), Round(3), Some(Round(3)), block_id, Timestamp(0));
    assert!(bad.validate_pol_round().is_err());
}
