//! Configuration for the block-sync actor.
use zksync_concurrency::time;

/// Tuning of the catch-up pool. The defaults match the wire peers can
/// reasonably sustain; tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the scheduler wakes up to hand out block requests.
    pub request_interval: time::Duration,
    /// Maximum block requests in flight across all peers.
    pub max_pending_requests: usize,
    /// Maximum heights tracked at once (in flight or buffered).
    pub max_total_requesters: usize,
    /// Maximum block requests in flight to a single peer.
    pub max_pending_requests_per_peer: usize,
    /// How long a peer may stay silent with requests in flight before it
    /// is evicted.
    pub peer_timeout: time::Duration,
    /// Minimum sustained receive rate (bytes/s) below which a peer is
    /// evicted.
    pub min_recv_rate: u64,
    /// How many errors a peer may accumulate before it is evicted.
    pub max_peer_err_count: usize,
    /// How far past the consumption height requests may run ahead; this
    /// bounds the memory spent on buffered blocks.
    pub max_block_lookahead: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_interval: time::Duration::milliseconds(2),
            max_pending_requests: 600,
            max_total_requesters: 600,
            max_pending_requests_per_peer: 20,
            peer_timeout: time::Duration::seconds(15),
            min_recv_rate: 7680,
            max_peer_err_count: 1000,
            max_block_lookahead: 100,
        }
    }
}

impl Config {
    /// Checks the configuration for nonsensical values.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.request_interval.is_positive(),
            "`request_interval` must be positive"
        );
        anyhow::ensure!(
            self.max_pending_requests_per_peer > 0,
            "`max_pending_requests_per_peer` must be positive"
        );
        anyhow::ensure!(
            self.max_pending_requests <= self.max_total_requesters,
            "`max_pending_requests` must not exceed `max_total_requesters`"
        );
        anyhow::ensure!(
            self.peer_timeout.is_positive(),
            "`peer_timeout` must be positive"
        );
        anyhow::ensure!(
            self.max_block_lookahead > 0,
            "`max_block_lookahead` must be positive"
        );
        Ok(())
    }
}
