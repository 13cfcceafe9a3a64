//! Input and output messages of the consensus actor. These are routed by
//! the dispatcher that connects the actor to the peer transport.
use quorum_consensus_roles::{node, validator};

/// A consensus protocol message, as gossiped between nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusMsg {
    /// A signed block proposal.
    Proposal(validator::Proposal),
    /// One part of a proposed block.
    BlockPart(BlockPartMsg),
    /// A signed vote.
    Vote(validator::Vote),
}

impl ConsensusMsg {
    /// Variant name, for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Proposal(_) => "Proposal",
            Self::BlockPart(_) => "BlockPart",
            Self::Vote(_) => "Vote",
        }
    }
}

/// One part of a proposed block, addressed by the (height, round) it was
/// proposed at.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPartMsg {
    /// Height the block was proposed at.
    pub height: validator::BlockHeight,
    /// Round the block was proposed at.
    pub round: validator::Round,
    /// The part itself.
    pub part: validator::Part,
}

/// A consensus message together with its origin. `peer` is `None` for
/// messages the node published itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusReq {
    /// The message.
    pub msg: ConsensusMsg,
    /// Originating peer, if any.
    pub peer: Option<node::PeerId>,
}

/// All the messages that other actors can send to the consensus actor.
#[derive(Debug)]
pub enum InputMessage {
    /// Message types from the network actor.
    Network(ConsensusReq),
}

/// All the messages that the consensus actor sends to other actors.
#[derive(Debug, PartialEq)]
pub enum OutputMessage {
    /// Message types to the network actor, to be broadcast to peers.
    Network(ConsensusMsg),
}
