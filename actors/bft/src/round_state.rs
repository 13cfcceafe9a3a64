//! The in-memory snapshot of one consensus height.
use crate::height_vote_set::HeightVoteSet;
use quorum_consensus_roles::validator::{
    Block, BlockHeight, PartSet, Proposal, Round, ValidatorSet, VoteSet,
};
use std::fmt;
use zksync_concurrency::time;

/// Ordinal stage within a round. Within one (height, round) the step only
/// moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Step {
    /// Waiting out the commit timeout of the previous height.
    NewHeight,
    /// A round has started.
    NewRound,
    /// Waiting for the proposal and its block parts.
    Propose,
    /// Prevote cast; tallying prevotes.
    Prevote,
    /// 2/3-any prevotes seen; waiting out the prevote timeout.
    PrevoteWait,
    /// Precommit cast; tallying precommits.
    Precommit,
    /// 2/3-any precommits seen; waiting out the precommit timeout.
    PrecommitWait,
    /// 2/3 precommits for a block; assembling and finalizing it.
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Mutable state of the height in progress. Owned exclusively by the
/// driver task and replaced wholesale when a height commits.
///
/// Invariants, maintained by the driver:
/// - `step` advances monotonically within a (height, round); the round
///   only increases within a height; the height increases on commit.
/// - `locked_round <= valid_round <= round` (absent counts as -1).
/// - `locked_block`/`valid_block`/`proposal_block` always hash to the
///   root of their accompanying part sets.
/// - `last_commit` holds a 2/3 precommit majority for the previous block.
#[derive(Debug)]
pub(crate) struct RoundState {
    /// Height being decided.
    pub(crate) height: BlockHeight,
    /// Round in progress.
    pub(crate) round: Round,
    /// Stage within the round.
    pub(crate) step: Step,
    /// When round 0 of this height starts.
    pub(crate) start_time: time::Instant,
    /// When the height reached Commit, once it has.
    pub(crate) commit_time: Option<time::Instant>,
    /// Working copy of the validator set for this height, with proposer
    /// priorities advanced to the current round.
    pub(crate) validators: ValidatorSet,
    /// The proposal received for the current round.
    pub(crate) proposal: Option<Proposal>,
    /// The proposed block, once all its parts arrived.
    pub(crate) proposal_block: Option<Block>,
    /// Parts of the proposed block as they arrive.
    pub(crate) proposal_block_parts: Option<PartSet>,
    /// Round at which this node locked, if any.
    pub(crate) locked_round: Option<Round>,
    /// The block this node is locked on.
    pub(crate) locked_block: Option<Block>,
    /// Parts of the locked block.
    pub(crate) locked_block_parts: Option<PartSet>,
    /// Most recent round with a polka for `valid_block`.
    pub(crate) valid_round: Option<Round>,
    /// Most recent block known to have gathered a polka.
    pub(crate) valid_block: Option<Block>,
    /// Parts of the valid block.
    pub(crate) valid_block_parts: Option<PartSet>,
    /// All votes of this height, by round.
    pub(crate) votes: HeightVoteSet,
    /// Round at which the height committed, once it has.
    pub(crate) commit_round: Option<Round>,
    /// Precommits that committed the previous height.
    pub(crate) last_commit: Option<VoteSet>,
    /// Validators that signed the previous height, once there is one.
    pub(crate) last_validators: Option<ValidatorSet>,
    /// Whether the precommit-wait timeout was already scheduled for the
    /// current round.
    pub(crate) triggered_timeout_precommit: bool,
}

impl RoundState {
    /// Clears the per-round proposal fields.
    pub(crate) fn reset_proposal(&mut self) {
        self.proposal = None;
        self.proposal_block = None;
        self.proposal_block_parts = None;
    }

    /// Clears the lock.
    pub(crate) fn unlock(&mut self) {
        self.locked_round = None;
        self.locked_block = None;
        self.locked_block_parts = None;
    }
}
