//! Metrics for the consensus actor.
use std::time::Duration;
use vise::{Buckets, EncodeLabelSet, EncodeLabelValue, Family, Gauge, Histogram, Metrics, Unit};

/// Label for a consensus input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum InputLabel {
    /// A block proposal.
    Proposal,
    /// A block part.
    BlockPart,
    /// A vote.
    Vote,
    /// A timer fire.
    Timeout,
}

impl InputLabel {
    /// Attaches a processing result to this label.
    pub(crate) fn with_result<E>(self, result: &Result<(), E>) -> ProcessingLabels {
        ProcessingLabels {
            r#type: self,
            result: match result {
                Ok(()) => ResultLabel::Ok,
                Err(_) => ResultLabel::Err,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
enum ResultLabel {
    Ok,
    Err,
}

/// Labels for input-processing metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct ProcessingLabels {
    r#type: InputLabel,
    result: ResultLabel,
}

/// Metrics defined by the consensus actor.
#[derive(Debug, Metrics)]
#[metrics(prefix = "consensus")]
pub(crate) struct ConsensusMetrics {
    /// Height the driver is working on.
    pub(crate) height: Gauge<u64>,
    /// Round the driver is in at the current height.
    pub(crate) round: Gauge<u64>,
    /// Height of the last finalized block.
    pub(crate) finalized_height: Gauge<u64>,
    /// Latency of processing inputs by the driver.
    #[metrics(buckets = Buckets::LATENCIES, unit = Unit::Seconds)]
    pub(crate) processing_latency: Family<ProcessingLabels, Histogram<Duration>>,
}

/// Global instance of [`ConsensusMetrics`].
#[vise::register]
pub(crate) static METRICS: vise::Global<ConsensusMetrics> = vise::Global::new();
