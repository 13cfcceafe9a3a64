//! Votes cast by validators, and the evidence produced when a validator
//! signs two conflicting votes.
use super::{Address, BlockHeight, BlockId, PublicKey, Round, Signature, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two voting phases of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// First phase vote, forming polkas.
    Prevote,
    /// Second phase vote, forming commits.
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prevote => f.write_str("prevote"),
            Self::Precommit => f.write_str("precommit"),
        }
    }
}

/// A single vote for a block id (or nil) at a (height, round).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Prevote or precommit.
    pub vote_type: VoteType,
    /// Height the vote is for.
    pub height: BlockHeight,
    /// Round the vote is for.
    pub round: Round,
    /// Voted block id; nil is an explicit vote for "no block".
    pub block_id: BlockId,
    /// Time at which the vote was signed.
    pub timestamp: Timestamp,
    /// Address of the voting validator.
    pub validator_address: Address,
    /// Index of the voting validator in the validator set.
    pub validator_index: u32,
    /// Signature over the canonical encoding of the vote.
    pub signature: Option<Signature>,
    /// Opaque application-defined extension; precommits only.
    pub extension: Option<Vec<u8>>,
}

/// The signed portion of a vote. Chain id is mixed in so that a vote can
/// never be replayed on another chain; index and extension are excluded
/// so that conflicting votes are comparable by their signed content.
#[derive(Serialize)]
struct CanonicalVote<'a> {
    chain_id: &'a str,
    vote_type: VoteType,
    height: BlockHeight,
    round: Round,
    block_id: BlockId,
    timestamp: Timestamp,
}

impl Vote {
    /// Canonical bytes covered by the vote signature.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let canonical = CanonicalVote {
            chain_id,
            vote_type: self.vote_type,
            height: self.height,
            round: self.round,
            block_id: self.block_id,
            timestamp: self.timestamp,
        };
        bincode::serialize(&canonical).expect("vote serialization is infallible")
    }

    /// Verifies the vote signature against the given key.
    pub fn verify(&self, chain_id: &str, key: &PublicKey) -> anyhow::Result<()> {
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("unsigned vote"))?;
        key.verify(&self.sign_bytes(chain_id), sig)?;
        Ok(())
    }

    /// Whether this is a vote for "no block".
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }
}

/// Proof that a validator signed two different votes at the same
/// (height, round, type). The pair is ordered by block id so that the
/// same misbehavior always yields the same evidence record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    /// The vote with the smaller block id.
    pub vote_a: Vote,
    /// The vote with the larger block id.
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    /// Builds the evidence record from two conflicting votes.
    pub fn new(first: Vote, second: Vote) -> Self {
        if first.block_id <= second.block_id {
            Self {
                vote_a: first,
                vote_b: second,
            }
        } else {
            Self {
                vote_a: second,
                vote_b: first,
            }
        }
    }

    /// The misbehaving validator.
    pub fn validator_address(&self) -> Address {
        self.vote_a.validator_address
    }

    /// Height at which the misbehavior happened.
    pub fn height(&self) -> BlockHeight {
        self.vote_a.height
    }
}
