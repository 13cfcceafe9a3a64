//! All votes of one height, organized per round.
use quorum_consensus_roles::{
    node::PeerId,
    validator::{BlockHeight, BlockId, Round, ValidatorSet, Vote, VoteAdded, VoteSet, VoteSetError,
        VoteType},
};
use std::collections::{BTreeMap, HashMap};

/// A peer may open at most this many rounds ahead of the ones we track;
/// this bounds the memory a fast (or lying) peer can make us allocate.
const MAX_CATCHUP_ROUNDS_PER_PEER: usize = 2;

/// Errors rejecting a vote at the height level.
#[derive(Debug, thiserror::Error)]
pub(crate) enum HeightVoteSetError {
    /// Vote for a round this node does not track.
    #[error("vote for untracked round {round} (current round: {current})")]
    UnwantedRound {
        /// Round of the rejected vote.
        round: Round,
        /// Highest round tracked.
        current: Round,
    },
    /// The round's vote set rejected the vote.
    #[error(transparent)]
    VoteSet(#[from] VoteSetError),
}

#[derive(Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Ordered set of per-round vote sets for one height. Rounds are created
/// eagerly up to one past the current round, and lazily (bounded per
/// peer) for peers running ahead.
#[derive(Debug)]
pub(crate) struct HeightVoteSet {
    chain_id: String,
    height: BlockHeight,
    validators: ValidatorSet,
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<Round>>,
}

impl HeightVoteSet {
    /// Creates the vote sets for a new height, tracking rounds 0 and 1.
    pub(crate) fn new(chain_id: String, height: BlockHeight, validators: ValidatorSet) -> Self {
        let mut this = Self {
            chain_id,
            height,
            validators,
            round: Round(0),
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        this.add_round(Round(0));
        this.add_round(Round(1));
        this
    }

    fn add_round(&mut self, round: Round) {
        self.round_vote_sets.entry(round).or_insert_with(|| RoundVoteSet {
            prevotes: VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Prevote,
                self.validators.clone(),
            ),
            precommits: VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Precommit,
                self.validators.clone(),
            ),
        });
    }

    /// Advances the current round, creating vote sets up to one round
    /// past it.
    pub(crate) fn set_round(&mut self, round: Round) {
        for r in self.round.0..=round.0 + 1 {
            self.add_round(Round(r));
        }
        self.round = round;
    }

    /// Adds a vote. Votes for untracked rounds are accepted from a peer
    /// (within its catchup budget) and rejected otherwise.
    pub(crate) fn add_vote(
        &mut self,
        vote: Vote,
        peer: Option<&PeerId>,
    ) -> Result<VoteAdded, HeightVoteSetError> {
        let round = vote.round;
        if !self.round_vote_sets.contains_key(&round) {
            let Some(peer) = peer else {
                return Err(HeightVoteSetError::UnwantedRound {
                    round,
                    current: self.round,
                });
            };
            let opened = self.peer_catchup_rounds.entry(peer.clone()).or_default();
            if opened.len() >= MAX_CATCHUP_ROUNDS_PER_PEER && !opened.contains(&round) {
                return Err(HeightVoteSetError::UnwantedRound {
                    round,
                    current: self.round,
                });
            }
            if !opened.contains(&round) {
                opened.push(round);
            }
            self.add_round(round);
        }
        let set = self
            .round_vote_sets
            .get_mut(&round)
            .expect("round created above");
        let set = match vote.vote_type {
            VoteType::Prevote => &mut set.prevotes,
            VoteType::Precommit => &mut set.precommits,
        };
        Ok(set.add_vote(vote)?)
    }

    /// Prevotes of the given round.
    pub(crate) fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|s| &s.prevotes)
    }

    /// Precommits of the given round.
    pub(crate) fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|s| &s.precommits)
    }

    /// The most recent round at which prevotes gathered a 2/3 majority
    /// for some specific block id, with that id.
    pub(crate) fn pol_info(&self) -> Option<(Round, BlockId)> {
        self.round_vote_sets
            .iter()
            .rev()
            .find_map(|(&round, set)| Some((round, set.prevotes.two_thirds_majority()?)))
    }
}
