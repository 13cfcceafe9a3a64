//! Test implementations of the application and signer hooks.
use crate::{Application, PrivValidator};
use async_trait::async_trait;
use quorum_consensus_roles::validator::{
    self, AbciResponses, Block, BlockHeader, BlockHeight, ChainState, Commit,
    DuplicateVoteEvidence, PartSet, Payload, Proposal, PublicKey, SecretKey, Timestamp, Vote,
};
use std::sync::Mutex;
use zksync_concurrency::ctx;

#[cfg(test)]
pub(crate) mod ut_harness;

/// An application producing pseudo-random payloads of a fixed size and
/// accepting everything. The chain state is threaded through
/// `apply_block` without validator or parameter changes.
#[derive(Debug)]
pub struct RandomPayloadApp {
    /// Size of the produced payloads.
    pub payload_size: usize,
}

#[async_trait]
impl Application for RandomPayloadApp {
    async fn create_proposal_block(
        &self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        last_commit: &Commit,
        evidence: &[DuplicateVoteEvidence],
        proposer: &validator::Address,
    ) -> ctx::Result<(Block, PartSet)> {
        let payload = Payload(
            (0..self.payload_size)
                .map(|i| (height.0 as usize + i) as u8)
                .collect(),
        );
        let block = Block {
            header: BlockHeader {
                chain_id: String::new(),
                height,
                time: Timestamp::from_utc(ctx.now_utc()),
                last_block_id: last_commit.block_id,
                last_commit_hash: last_commit.hash(),
                validators_hash: validator::Hash::zero(),
                app_hash: validator::Hash::zero(),
                results_hash: validator::Hash::zero(),
                proposer_address: *proposer,
            },
            payload,
            evidence: evidence.to_vec(),
            last_commit: last_commit.clone(),
        };
        let parts = block.part_set();
        Ok((block, parts))
    }

    async fn validate_block(
        &self,
        _ctx: &ctx::Ctx,
        _state: &ChainState,
        _block: &Block,
    ) -> ctx::Result<()> {
        Ok(())
    }

    async fn apply_block(
        &self,
        _ctx: &ctx::Ctx,
        state: &ChainState,
        block: &Block,
        commit: &Commit,
    ) -> ctx::Result<(ChainState, AbciResponses)> {
        let responses = AbciResponses::default();
        let mut next = state.clone();
        next.last_block_height = block.header.height;
        next.last_block_id = commit.block_id;
        next.last_block_time = block.header.time;
        next.last_validators = Some(state.validators.clone());
        next.validators = state.next_validators.clone();
        next.last_results_hash = responses.hash();
        Ok((next, responses))
    }

    async fn verify_vote_extension(&self, _ctx: &ctx::Ctx, vote: &Vote) -> ctx::Result<()> {
        if vote.extension.as_deref() == Some(b"bad") {
            return Err(anyhow::format_err!("rejected extension").into());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SignerState {
    last_vote: Option<(BlockHeight, validator::Round, validator::VoteType, Vec<u8>)>,
    last_proposal: Option<(BlockHeight, validator::Round, Vec<u8>)>,
}

/// An in-process signer over a secret key. Refuses to sign a second,
/// different message for a slot it already signed, which is the
/// double-sign protection the driver relies on.
#[derive(Debug)]
pub struct LocalSigner {
    key: SecretKey,
    state: Mutex<SignerState>,
}

impl LocalSigner {
    /// Creates a signer over the given key.
    pub fn new(key: SecretKey) -> Self {
        Self {
            key,
            state: Mutex::new(SignerState::default()),
        }
    }
}

#[async_trait]
impl PrivValidator for LocalSigner {
    async fn pub_key(&self, _ctx: &ctx::Ctx) -> ctx::Result<PublicKey> {
        Ok(self.key.public())
    }

    async fn sign_vote(
        &self,
        _ctx: &ctx::Ctx,
        chain_id: &str,
        vote: &mut Vote,
    ) -> ctx::Result<()> {
        let bytes = vote.sign_bytes(chain_id);
        let mut state = self.state.lock().expect("signer lock is poisoned");
        if let Some((height, round, vote_type, signed)) = &state.last_vote {
            if (*height, *round, *vote_type) == (vote.height, vote.round, vote.vote_type)
                && *signed != bytes
            {
                return Err(anyhow::format_err!(
                    "refusing to double-sign a {} at {}/{}",
                    vote.vote_type,
                    vote.height,
                    vote.round
                )
                .into());
            }
        }
        state.last_vote = Some((vote.height, vote.round, vote.vote_type, bytes.clone()));
        drop(state);
        vote.signature = Some(self.key.sign(&bytes));
        Ok(())
    }

    async fn sign_proposal(
        &self,
        _ctx: &ctx::Ctx,
        chain_id: &str,
        proposal: &mut Proposal,
    ) -> ctx::Result<()> {
        let bytes = proposal.sign_bytes(chain_id);
        let mut state = self.state.lock().expect("signer lock is poisoned");
        if let Some((height, round, signed)) = &state.last_proposal {
            if (*height, *round) == (proposal.height, proposal.round) && *signed != bytes {
                return Err(anyhow::format_err!(
                    "refusing to double-sign a proposal at {}/{}",
                    proposal.height,
                    proposal.round
                )
                .into());
            }
        }
        state.last_proposal = Some((proposal.height, proposal.round, bytes.clone()));
        drop(state);
        proposal.signature = Some(self.key.sign(&bytes));
        Ok(())
    }
}
