//! The validator set and its weighted round-robin proposer rotation.
use super::{Address, Hash, PublicKey};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single validator: identity plus voting weight and rotation state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Address of the validator, derived from its public key.
    pub address: Address,
    /// Public key used to verify the validator's votes and proposals.
    pub pub_key: PublicKey,
    /// Voting weight.
    pub voting_power: u64,
    /// Rotation accumulator; the validator with the maximum priority
    /// proposes the next round.
    pub proposer_priority: i64,
}

impl Validator {
    /// Creates a validator with zeroed rotation state.
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// An ordered set of validators. The order (ascending by address) is part
/// of the protocol: vote sets and commits index validators by position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: u64,
}

impl ValidatorSet {
    /// Creates a validator set. Fails on an empty list, duplicate
    /// addresses or zero voting power.
    pub fn new(validators: impl IntoIterator<Item = Validator>) -> anyhow::Result<Self> {
        let mut validators: Vec<_> = validators.into_iter().collect();
        if validators.is_empty() {
            bail!("validator set must contain at least one validator");
        }
        let mut seen = BTreeSet::new();
        for v in &validators {
            if v.voting_power == 0 {
                bail!("validator {:?} has zero voting power", v.address);
            }
            if !seen.insert(v.address) {
                bail!("duplicate validator {:?}", v.address);
            }
        }
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let total_voting_power = validators
            .iter()
            .map(|v| v.voting_power)
            .try_fold(0u64, |acc, p| acc.checked_add(p))
            .ok_or_else(|| anyhow::anyhow!("total voting power overflows"))?;
        Ok(Self {
            validators,
            total_voting_power,
        })
    }

    /// Number of validators.
    #[allow(clippy::len_without_is_empty)] // the set is non-empty by construction
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Iterates over validators in set order.
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    /// Sum of all voting power.
    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    /// The validator at the given set index.
    pub fn get(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// The validator with the given address.
    pub fn get_by_address(&self, address: &Address) -> Option<&Validator> {
        self.index_of(address).map(|i| &self.validators[i])
    }

    /// The set index of the given address.
    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
    }

    /// Whether the given address is in the set.
    pub fn contains(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    /// The current proposer: the validator with the maximum proposer
    /// priority, ties broken by the lower address.
    pub fn proposer(&self) -> &Validator {
        self.validators
            .iter()
            .max_by(|a, b| {
                a.proposer_priority
                    .cmp(&b.proposer_priority)
                    .then(b.address.cmp(&a.address))
            })
            .expect("validator set is non-empty by construction")
    }

    /// Advances the rotation by `times` rounds. Each round the selected
    /// proposer pays the total voting power out of its priority and every
    /// validator earns its own voting power back.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        for _ in 0..times {
            let proposer = self.proposer().address;
            let total = self.total_voting_power as i64;
            for v in &mut self.validators {
                if v.address == proposer {
                    v.proposer_priority -= total;
                }
                v.proposer_priority += v.voting_power as i64;
            }
        }
    }

    /// Hash of the set, as carried in block headers. Covers identities
    /// and weights, not the transient rotation state.
    pub fn hash(&self) -> Hash {
        let entries: Vec<(&Address, &PublicKey, u64)> = self
            .validators
            .iter()
            .map(|v| (&v.address, &v.pub_key, v.voting_power))
            .collect();
        let bytes = bincode::serialize(&entries).expect("serialization is infallible");
        Hash::sha256(&bytes)
    }
}
