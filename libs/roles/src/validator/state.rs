//! The chain state threaded through block execution, and the consensus
//! parameters and execution results persisted alongside it.
use super::{BlockHeight, BlockId, Hash, Timestamp, ValidatorSet};
use serde::{Deserialize, Serialize};

/// Block-level consensus parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    /// Maximum serialized block size, in bytes.
    pub max_bytes: u64,
    /// Maximum gas per block; -1 means unlimited.
    pub max_gas: i64,
}

/// Evidence-related consensus parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    /// Maximum age of evidence, in blocks.
    pub max_age_num_blocks: u64,
}

/// Consensus parameters, adjustable by the application at every height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Block-level parameters.
    pub block: BlockParams,
    /// Evidence-related parameters.
    pub evidence: EvidenceParams,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            block: BlockParams {
                max_bytes: 4 << 20,
                max_gas: -1,
            },
            evidence: EvidenceParams {
                max_age_num_blocks: 100_000,
            },
        }
    }
}

/// Result of executing a single transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTxResult {
    /// Application response code; 0 is success.
    pub code: u32,
    /// Opaque application response data.
    pub data: Vec<u8>,
}

/// Application responses for one executed block, persisted per height.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbciResponses {
    /// Per-transaction results, in block order.
    pub results: Vec<ExecTxResult>,
}

impl AbciResponses {
    /// Hash of the responses, carried in the next block's header.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("serialization is infallible");
        Hash::sha256(&bytes)
    }
}

/// The state of the chain after the last committed block. This is what
/// the consensus driver snapshots per height and the state store persists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// Chain this state belongs to.
    pub chain_id: String,
    /// First height of the chain; 1 unless started from a snapshot.
    pub initial_height: BlockHeight,
    /// Height of the last committed block; 0 before the first commit.
    pub last_block_height: BlockHeight,
    /// Id of the last committed block.
    pub last_block_id: BlockId,
    /// BFT time of the last committed block.
    pub last_block_time: Timestamp,
    /// Validators for the next block (height last_block_height + 1).
    pub validators: ValidatorSet,
    /// Validators for the block after the next one.
    pub next_validators: ValidatorSet,
    /// Validators that signed the last committed block. Absent before the
    /// first commit, and in snapshot states that do not carry them.
    pub last_validators: Option<ValidatorSet>,
    /// Height at which `validators` last changed.
    pub last_height_validators_changed: BlockHeight,
    /// Consensus parameters for the next block.
    pub consensus_params: ConsensusParams,
    /// Height at which `consensus_params` last changed.
    pub last_height_consensus_params_changed: BlockHeight,
    /// Hash of the execution results of the last committed block.
    pub last_results_hash: Hash,
    /// Application state hash after the last committed block.
    pub app_hash: Hash,
}

impl ChainState {
    /// State of a fresh chain, before any block is committed.
    pub fn genesis(
        chain_id: String,
        initial_height: BlockHeight,
        validators: ValidatorSet,
        consensus_params: ConsensusParams,
    ) -> Self {
        Self {
            chain_id,
            initial_height,
            last_block_height: BlockHeight(0),
            last_block_id: BlockId::nil(),
            last_block_time: Timestamp::default(),
            validators: validators.clone(),
            next_validators: validators,
            last_validators: None,
            last_height_validators_changed: initial_height,
            consensus_params,
            last_height_consensus_params_changed: initial_height,
            last_results_hash: Hash::zero(),
            app_hash: Hash::zero(),
        }
    }

    /// The height consensus should be working on next.
    pub fn next_height(&self) -> BlockHeight {
        if self.last_block_height.0 == 0 {
            self.initial_height
        } else {
            self.last_block_height.next()
        }
    }
}
