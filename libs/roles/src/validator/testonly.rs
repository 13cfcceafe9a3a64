//! Test utilities.
use super::{
    BlockHeight, BlockId, ChainState, ConsensusParams, Payload, Round, SecretKey, Timestamp,
    Validator, ValidatorSet, Vote, VoteType,
};
use rand::Rng;

/// A deterministic test chain: secret keys plus the matching genesis
/// state. Keys are ordered to match the validator-set order, so
/// `keys[i]` signs for validator index `i`.
#[derive(Debug, Clone)]
pub struct Setup {
    /// Secret keys of the validators, in validator-set order.
    pub keys: Vec<SecretKey>,
    /// Genesis chain state.
    pub genesis: ChainState,
}

impl Setup {
    /// Creates a chain of `validators` equally-weighted validators.
    pub fn new(rng: &mut impl Rng, validators: usize) -> Self {
        Self::with_weights(rng, vec![100; validators])
    }

    /// Creates a chain with the given voting weights.
    pub fn with_weights(rng: &mut impl Rng, weights: Vec<u64>) -> Self {
        let mut keys: Vec<SecretKey> = weights
            .iter()
            .map(|_| SecretKey::generate(rng))
            .collect();
        keys.sort_by_key(|k| k.public().address());
        let validators = ValidatorSet::new(
            keys.iter()
                .zip(&weights)
                .map(|(k, &w)| Validator::new(k.public(), w)),
        )
        .expect("generated validator set is valid");
        let genesis = ChainState::genesis(
            "testchain".to_string(),
            BlockHeight(1),
            validators,
            ConsensusParams::default(),
        );
        Self { keys, genesis }
    }

    /// Chain id of the test chain.
    pub fn chain_id(&self) -> &str {
        &self.genesis.chain_id
    }

    /// Creates a signed vote from validator `index`.
    pub fn make_vote(
        &self,
        index: usize,
        vote_type: VoteType,
        height: BlockHeight,
        round: Round,
        block_id: BlockId,
    ) -> Vote {
        let key = &self.keys[index];
        let mut vote = Vote {
            vote_type,
            height,
            round,
            block_id,
            timestamp: Timestamp(1_700_000_000_000_000_000 + index as i64),
            validator_address: key.public().address(),
            validator_index: index as u32,
            signature: None,
            extension: None,
        };
        vote.signature = Some(key.sign(&vote.sign_bytes(self.chain_id())));
        vote
    }
}

/// A random payload of the given size.
pub fn random_payload(rng: &mut impl Rng, size: usize) -> Payload {
    Payload((0..size).map(|_| rng.gen()).collect())
}

/// A random non-nil block id.
pub fn random_block_id(rng: &mut impl Rng) -> BlockId {
    BlockId {
        hash: super::Hash(rng.gen()),
        parts: super::PartSetHeader {
            total: 1,
            hash: super::Hash(rng.gen()),
        },
    }
}
