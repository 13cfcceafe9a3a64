//! Metrics for the block-sync actor.
use vise::{Counter, Metrics};

/// Metrics defined by the block-sync actor.
#[derive(Debug, Metrics)]
#[metrics(prefix = "sync_blocks")]
pub(crate) struct SyncBlocksMetrics {
    /// Valid blocks accepted from peers.
    pub(crate) blocks_received: Counter,
    /// Deliveries rejected (unsolicited or mismatched).
    pub(crate) blocks_rejected: Counter,
    /// Peer status updates processed.
    pub(crate) peer_updates: Counter,
}

/// Global instance of [`SyncBlocksMetrics`].
#[vise::register]
pub(crate) static METRICS: vise::Global<SyncBlocksMetrics> = vise::Global::new();
