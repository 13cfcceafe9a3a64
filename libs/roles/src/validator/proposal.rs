//! Block proposals.
use super::{BlockHeight, BlockId, PublicKey, Round, Signature, Timestamp};
use serde::{Deserialize, Serialize};

/// A proposal of a block for a (height, round), signed by the round's
/// proposer. `pol_round` justifies re-proposing a block that already
/// gathered a polka at an earlier round of this height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Height the proposal is for.
    pub height: BlockHeight,
    /// Round the proposal is for.
    pub round: Round,
    /// Round of the proof-of-lock-change polka, if any.
    pub pol_round: Option<Round>,
    /// Id of the proposed block.
    pub block_id: BlockId,
    /// Time at which the proposal was signed.
    pub timestamp: Timestamp,
    /// Signature of the proposer.
    pub signature: Option<Signature>,
}

/// The signed portion of a proposal.
#[derive(Serialize)]
struct CanonicalProposal<'a> {
    chain_id: &'a str,
    height: BlockHeight,
    round: Round,
    pol_round: Option<Round>,
    block_id: BlockId,
    timestamp: Timestamp,
}

impl Proposal {
    /// Creates an unsigned proposal.
    pub fn new(
        height: BlockHeight,
        round: Round,
        pol_round: Option<Round>,
        block_id: BlockId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: None,
        }
    }

    /// Canonical bytes covered by the proposal signature.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let canonical = CanonicalProposal {
            chain_id,
            height: self.height,
            round: self.round,
            pol_round: self.pol_round,
            block_id: self.block_id,
            timestamp: self.timestamp,
        };
        bincode::serialize(&canonical).expect("proposal serialization is infallible")
    }

    /// Verifies the proposal signature against the given key.
    pub fn verify(&self, chain_id: &str, key: &PublicKey) -> anyhow::Result<()> {
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("unsigned proposal"))?;
        key.verify(&self.sign_bytes(chain_id), sig)?;
        Ok(())
    }

    /// Checks that `pol_round`, if present, is in `[0, round)`.
    pub fn validate_pol_round(&self) -> anyhow::Result<()> {
        if let Some(pol_round) = self.pol_round {
            anyhow::ensure!(
                pol_round < self.round,
                "POL round {pol_round} out of range for proposal round {}",
                self.round,
            );
        }
        Ok(())
    }
}
