//! Configuration of the consensus actor.
use crate::{Application, PrivValidator};
use quorum_consensus_roles::validator::{Commit, Round};
use quorum_consensus_storage::StateStore;
use std::sync::Arc;
use zksync_concurrency::time;

/// Step timeouts and block-creation policy. The per-round deltas stretch
/// the timeouts as rounds fail, so that slow-but-honest validators
/// eventually hear each other.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How long to wait for a proposal at round 0.
    pub timeout_propose: time::Duration,
    /// Extra proposal wait per round.
    pub timeout_propose_delta: time::Duration,
    /// How long to wait for stragglers after a 2/3-any prevote quorum.
    pub timeout_prevote: time::Duration,
    /// Extra prevote wait per round.
    pub timeout_prevote_delta: time::Duration,
    /// How long to wait for stragglers after a 2/3-any precommit quorum.
    pub timeout_precommit: time::Duration,
    /// Extra precommit wait per round.
    pub timeout_precommit_delta: time::Duration,
    /// How long to linger on a committed height collecting precommits
    /// before starting the next one.
    pub timeout_commit: time::Duration,
    /// Start the next height as soon as all precommits are in, without
    /// waiting out `timeout_commit`.
    pub skip_timeout_commit: bool,
    /// Whether to propose blocks with an empty payload.
    pub create_empty_blocks: bool,
    /// If positive, how long to idle at the start of a height before
    /// proposing an empty block.
    pub create_empty_blocks_interval: time::Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_propose: time::Duration::seconds(3),
            timeout_propose_delta: time::Duration::milliseconds(500),
            timeout_prevote: time::Duration::seconds(1),
            timeout_prevote_delta: time::Duration::milliseconds(500),
            timeout_precommit: time::Duration::seconds(1),
            timeout_precommit_delta: time::Duration::milliseconds(500),
            timeout_commit: time::Duration::seconds(1),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: time::Duration::ZERO,
        }
    }
}

impl TimeoutConfig {
    /// Proposal timeout for the given round.
    pub fn propose(&self, round: Round) -> time::Duration {
        self.timeout_propose + self.timeout_propose_delta * (round.0 as i32)
    }

    /// Prevote-wait timeout for the given round.
    pub fn prevote(&self, round: Round) -> time::Duration {
        self.timeout_prevote + self.timeout_prevote_delta * (round.0 as i32)
    }

    /// Precommit-wait timeout for the given round.
    pub fn precommit(&self, round: Round) -> time::Duration {
        self.timeout_precommit + self.timeout_precommit_delta * (round.0 as i32)
    }
}

/// Configuration of the consensus actor.
#[derive(Debug)]
pub struct Config {
    /// Signer for this node's votes and proposals; `None` runs the node
    /// as a non-voting observer.
    pub priv_validator: Option<Arc<dyn PrivValidator>>,
    /// Application executing the chain.
    pub application: Arc<dyn Application>,
    /// Persistence of per-height consensus state.
    pub state_store: StateStore,
    /// The commit certifying the last persisted block, handed over by the
    /// node assembly on restart. Required when the stored state has
    /// committed blocks; ignored on a fresh chain.
    pub seen_commit: Option<Commit>,
    /// Step timeouts and block-creation policy.
    pub timeouts: TimeoutConfig,
}
