//! Blocks, block ids and commits.
use super::{Address, DuplicateVoteEvidence, Hash, PartSet, PartSetHeader, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;
use zksync_concurrency::time;

/// 1-based index of the next block to commit.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, core::hash::Hash, Serialize, Deserialize,
)]
pub struct BlockHeight(pub u64);

impl BlockHeight {
    /// The next height.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The previous height, if any.
    pub fn prev(self) -> Option<Self> {
        Some(Self(self.0.checked_sub(1)?))
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An attempt within a height. Starts at 0 and increments every time the
/// height fails to commit.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, core::hash::Hash, Serialize, Deserialize,
)]
pub struct Round(pub u32);

impl Round {
    /// The next round.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// UTC wall-clock time with nanosecond precision, as it appears in signed
/// messages and persisted records.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, core::hash::Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Converts from the clock representation.
    pub fn from_utc(t: time::Utc) -> Self {
        Self((t - time::UNIX_EPOCH).whole_nanoseconds() as i64)
    }

    /// Converts to the clock representation.
    pub fn to_utc(self) -> time::Utc {
        time::UNIX_EPOCH + time::Duration::nanoseconds(self.0)
    }

    /// This timestamp shifted forward by the given number of milliseconds.
    pub fn plus_millis(self, millis: i64) -> Self {
        Self(self.0 + millis * 1_000_000)
    }
}

/// Raw application payload of a block.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({}B)", self.0.len())
    }
}

/// Identifier of a block: its hash plus the header of the part set that
/// carries it. An all-zero id is the explicit vote for "no block".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, core::hash::Hash, Serialize, Deserialize,
)]
pub struct BlockId {
    /// Hash of the block header.
    pub hash: Hash,
    /// Header of the part set carrying the block.
    pub parts: PartSetHeader,
}

impl BlockId {
    /// The explicit "no block" id.
    pub fn nil() -> Self {
        Self::default()
    }

    /// Whether this id denotes "no block".
    pub fn is_nil(&self) -> bool {
        self.hash.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else {
            self.hash.fmt(f)
        }
    }
}

/// Block header. The block hash is the hash of this struct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Chain this block belongs to.
    pub chain_id: String,
    /// Height of the block.
    pub height: BlockHeight,
    /// BFT time of the block.
    pub time: Timestamp,
    /// Id of the previous block.
    pub last_block_id: BlockId,
    /// Hash of the commit carried in this block.
    pub last_commit_hash: Hash,
    /// Hash of the validator set that produced this block.
    pub validators_hash: Hash,
    /// Application state hash after the previous block.
    pub app_hash: Hash,
    /// Hash of the execution results of the previous block.
    pub results_hash: Hash,
    /// Address of the proposer of this block.
    pub proposer_address: Address,
}

/// A block: header, application payload, misbehavior evidence and the
/// commit certifying the previous block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header of the block.
    pub header: BlockHeader,
    /// Application payload.
    pub payload: Payload,
    /// Evidence of validator misbehavior observed by the proposer.
    pub evidence: Vec<DuplicateVoteEvidence>,
    /// 2/3+ precommits for the previous block.
    pub last_commit: Commit,
}

impl Block {
    /// Hash of the block.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(&self.header).expect("header serialization is infallible");
        Hash::sha256(&bytes)
    }

    /// Whether the block hashes to the given hash.
    pub fn hashes_to(&self, hash: &Hash) -> bool {
        self.hash() == *hash
    }

    /// Splits the block into parts for gossip, committing to them with a
    /// Merkle root.
    pub fn part_set(&self) -> PartSet {
        let bytes = bincode::serialize(self).expect("block serialization is infallible");
        PartSet::from_data(&bytes)
    }

    /// The block id of this block.
    pub fn block_id(&self) -> BlockId {
        BlockId {
            hash: self.hash(),
            parts: self.part_set().header(),
        }
    }
}

/// How a validator's slot in a commit was filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockIdFlag {
    /// The validator did not precommit in the commit round.
    Absent,
    /// The validator precommitted the committed block.
    Commit,
    /// The validator precommitted nil.
    Nil,
}

/// A single validator's entry in a commit, in validator-set order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    /// How the slot was filled.
    pub flag: BlockIdFlag,
    /// Address of the validator.
    pub validator_address: Address,
    /// Timestamp of the precommit.
    pub timestamp: Timestamp,
    /// Signature of the precommit; absent iff the flag is `Absent`.
    pub signature: Option<Signature>,
}

impl CommitSig {
    /// An empty slot for a validator that did not vote.
    pub fn absent() -> Self {
        Self {
            flag: BlockIdFlag::Absent,
            validator_address: Address::default(),
            timestamp: Timestamp::default(),
            signature: None,
        }
    }

    /// The block id this slot votes for, reconstructed for signature
    /// verification.
    pub fn block_id(&self, commit_block_id: &BlockId) -> Option<BlockId> {
        match self.flag {
            BlockIdFlag::Absent => None,
            BlockIdFlag::Commit => Some(*commit_block_id),
            BlockIdFlag::Nil => Some(BlockId::nil()),
        }
    }
}

/// 2/3+ precommits for a block at a (height, round).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Height the commit is for.
    pub height: BlockHeight,
    /// Round at which the block was committed.
    pub round: Round,
    /// Id of the committed block.
    pub block_id: BlockId,
    /// Per-validator entries, in validator-set order.
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// The commit preceding the very first block of the chain.
    pub fn initial() -> Self {
        Self {
            height: BlockHeight(0),
            round: Round(0),
            block_id: BlockId::nil(),
            signatures: Vec::new(),
        }
    }

    /// Hash of the commit, carried in the next block's header.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("commit serialization is infallible");
        Hash::sha256(&bytes)
    }
}
