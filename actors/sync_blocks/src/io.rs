//! Input and output messages of the block-sync actor.
use quorum_consensus_roles::{node::PeerId, validator};

/// All the messages that other actors can send to the block-sync actor.
#[derive(Debug)]
pub enum InputMessage {
    /// A peer advertised the range of heights it can serve.
    PeerStatus {
        /// The advertising peer.
        peer: PeerId,
        /// Lowest height the peer still stores.
        base: validator::BlockHeight,
        /// Highest height the peer stores.
        height: validator::BlockHeight,
    },
    /// A peer delivered a requested block.
    Block {
        /// The delivering peer.
        peer: PeerId,
        /// The delivered block.
        block: Box<validator::Block>,
        /// Serialized size of the block, for rate accounting.
        size: usize,
    },
    /// The transport dropped a peer.
    PeerDisconnected {
        /// The dropped peer.
        peer: PeerId,
    },
}

/// All the messages that the block-sync actor sends to other actors.
#[derive(Debug, PartialEq)]
pub enum OutputMessage {
    /// Request one block from a peer.
    GetBlock {
        /// The peer to ask.
        peer: PeerId,
        /// The height to ask for.
        height: validator::BlockHeight,
    },
    /// Report a misbehaving or useless peer to the transport.
    PeerError {
        /// The peer at fault.
        peer: PeerId,
        /// Human-readable reason.
        reason: String,
    },
}
