//! Tallying of votes for one (height, round, type).
use super::{
    BlockHeight, BlockId, BlockIdFlag, Commit, CommitSig, DuplicateVoteEvidence, Round,
    ValidatorSet, Vote, VoteType,
};
use std::collections::BTreeMap;

/// Errors rejecting a vote outright. A conflicting vote is not an error:
/// it is reported through [`VoteAdded::Conflict`] so that the caller can
/// turn it into evidence.
#[derive(Debug, thiserror::Error)]
pub enum VoteSetError {
    /// Vote for a different height.
    #[error("unexpected height (vote: {got}, set: {want})")]
    UnexpectedHeight {
        /// Height of the rejected vote.
        got: BlockHeight,
        /// Height of this vote set.
        want: BlockHeight,
    },
    /// Vote for a different round.
    #[error("unexpected round (vote: {got}, set: {want})")]
    UnexpectedRound {
        /// Round of the rejected vote.
        got: Round,
        /// Round of this vote set.
        want: Round,
    },
    /// Vote of a different type.
    #[error("unexpected vote type (vote: {got}, set: {want})")]
    UnexpectedType {
        /// Type of the rejected vote.
        got: VoteType,
        /// Type of this vote set.
        want: VoteType,
    },
    /// Validator index outside the validator set.
    #[error("validator index {index} out of range ({len} validators)")]
    IndexOutOfRange {
        /// Index carried by the vote.
        index: u32,
        /// Size of the validator set.
        len: usize,
    },
    /// Validator address does not match the validator at the index.
    #[error("validator address does not match index {index}")]
    AddressMismatch {
        /// Index carried by the vote.
        index: u32,
    },
    /// Vote signature does not verify.
    #[error("invalid vote signature: {0:#}")]
    InvalidSignature(#[source] anyhow::Error),
}

/// Outcome of adding a well-formed vote.
#[derive(Debug)]
pub enum VoteAdded {
    /// First vote from this validator; counted.
    Added,
    /// Exact duplicate of a vote already counted; ignored.
    Duplicate,
    /// A second, different vote from the same validator. The original
    /// vote stays authoritative; the pair is returned as evidence.
    Conflict(Box<DuplicateVoteEvidence>),
}

/// Votes of one type for one (height, round), tallied by block id.
///
/// Every vote is verified against the validator set before it is counted.
/// Once a single block id crosses 2/3 of the total voting power the
/// majority is latched and never changes for this set.
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: BlockHeight,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes: Vec<Option<Vote>>,
    sum_by_block_id: BTreeMap<BlockId, u64>,
    voted_power: u64,
    maj23: Option<BlockId>,
}

impl VoteSet {
    /// Creates an empty vote set.
    pub fn new(
        chain_id: String,
        height: BlockHeight,
        round: Round,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        let len = validators.len();
        Self {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; len],
            sum_by_block_id: BTreeMap::new(),
            voted_power: 0,
            maj23: None,
        }
    }

    /// Rebuilds the precommit set certified by a stored commit. Used to
    /// recover `last_commit` across a restart.
    pub fn from_commit(
        chain_id: String,
        validators: ValidatorSet,
        commit: &Commit,
    ) -> anyhow::Result<Self> {
        let mut this = Self::new(
            chain_id,
            commit.height,
            commit.round,
            VoteType::Precommit,
            validators,
        );
        for (index, sig) in commit.signatures.iter().enumerate() {
            let Some(block_id) = sig.block_id(&commit.block_id) else {
                continue;
            };
            let vote = Vote {
                vote_type: VoteType::Precommit,
                height: commit.height,
                round: commit.round,
                block_id,
                timestamp: sig.timestamp,
                validator_address: sig.validator_address,
                validator_index: index as u32,
                signature: sig.signature.clone(),
                extension: None,
            };
            match this.add_vote(vote)? {
                VoteAdded::Added => {}
                outcome => anyhow::bail!("commit signature {index} not addable: {outcome:?}"),
            }
        }
        anyhow::ensure!(
            this.has_two_thirds_majority(),
            "commit does not carry a 2/3 majority"
        );
        Ok(this)
    }

    /// Height this set tallies.
    pub fn height(&self) -> BlockHeight {
        self.height
    }

    /// Round this set tallies.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Vote type this set tallies.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Adds a vote. Verifies shape and signature, tallies the first vote
    /// per validator and reports conflicts as evidence.
    pub fn add_vote(&mut self, vote: Vote) -> Result<VoteAdded, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::UnexpectedHeight {
                got: vote.height,
                want: self.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::UnexpectedRound {
                got: vote.round,
                want: self.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::UnexpectedType {
                got: vote.vote_type,
                want: self.vote_type,
            });
        }
        let index = vote.validator_index;
        let Some(validator) = self.validators.get(index as usize) else {
            return Err(VoteSetError::IndexOutOfRange {
                index,
                len: self.validators.len(),
            });
        };
        if validator.address != vote.validator_address {
            return Err(VoteSetError::AddressMismatch { index });
        }
        vote.verify(&self.chain_id, &validator.pub_key)
            .map_err(VoteSetError::InvalidSignature)?;

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id {
                return Ok(VoteAdded::Duplicate);
            }
            // The first vote stays authoritative; the sums are untouched.
            return Ok(VoteAdded::Conflict(Box::new(DuplicateVoteEvidence::new(
                existing.clone(),
                vote,
            ))));
        }

        let power = validator.voting_power;
        let block_id = vote.block_id;
        self.votes[index as usize] = Some(vote);
        self.voted_power += power;
        let sum = self.sum_by_block_id.entry(block_id).or_insert(0);
        *sum += power;
        if self.maj23.is_none() && is_quorum(*sum, self.validators.total_voting_power()) {
            self.maj23 = Some(block_id);
        }
        Ok(VoteAdded::Added)
    }

    /// The block id that gathered more than 2/3 of the voting power, if
    /// any. Latched: stable once returned.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// Whether some specific block id has a 2/3 majority.
    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Whether votes of any kind sum past 2/3 of the voting power.
    pub fn has_two_thirds_any(&self) -> bool {
        is_quorum(self.voted_power, self.validators.total_voting_power())
    }

    /// Whether every validator has voted.
    pub fn has_all(&self) -> bool {
        self.voted_power == self.validators.total_voting_power()
    }

    /// The counted vote of the validator at the given index.
    pub fn vote(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index)?.as_ref()
    }

    /// Iterates over the counted votes.
    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }

    /// Power tallied for the given block id.
    pub fn power_for(&self, block_id: &BlockId) -> u64 {
        self.sum_by_block_id.get(block_id).copied().unwrap_or(0)
    }

    /// Builds the commit certified by this set. Requires a latched 2/3
    /// majority for a non-nil block.
    pub fn make_commit(&self) -> anyhow::Result<Commit> {
        anyhow::ensure!(
            self.vote_type == VoteType::Precommit,
            "only precommits can form a commit"
        );
        let block_id = self
            .maj23
            .ok_or_else(|| anyhow::anyhow!("no 2/3 majority"))?;
        anyhow::ensure!(!block_id.is_nil(), "2/3 majority is for nil");
        let signatures = self
            .votes
            .iter()
            .map(|slot| match slot {
                None => CommitSig::absent(),
                // A vote for some other block cannot be carried in the
                // commit (its signed block id is not reconstructible from
                // the commit alone), so it is recorded as absent.
                Some(vote) if vote.block_id != block_id && !vote.is_nil() => CommitSig::absent(),
                Some(vote) => CommitSig {
                    flag: if vote.is_nil() {
                        BlockIdFlag::Nil
                    } else {
                        BlockIdFlag::Commit
                    },
                    validator_address: vote.validator_address,
                    timestamp: vote.timestamp,
                    signature: vote.signature.clone(),
                },
            })
            .collect();
        Ok(Commit {
            height: self.height,
            round: self.round,
            block_id,
            signatures,
        })
    }
}

/// Strictly-greater-than-2/3 quorum test, overflow-safe.
fn is_quorum(power: u64, total: u64) -> bool {
    (power as u128) * 3 > (total as u128) * 2
}
