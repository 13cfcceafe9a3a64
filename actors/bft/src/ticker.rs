//! The timeout ticker: a single-armed logical timer serializing all
//! step timeouts of the driver.
//!
//! Only one timeout is armed at a time. A schedule request replaces the
//! armed one iff its (height, round, step) is strictly greater in
//! lexicographic order, so re-submissions and stragglers from abandoned
//! rounds are dropped instead of firing late. On expiry the armed
//! (height, round, step) is delivered back to the driver, which ignores
//! tocks that no longer match its state.
use crate::{round_state::Step, state_machine::Input};
use quorum_consensus_roles::validator::{BlockHeight, Round};
use zksync_concurrency::{ctx, time};

/// A request to fire after `duration`, tagged with the driver position it
/// was armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutInfo {
    /// How long to wait.
    pub(crate) duration: time::Duration,
    /// Height the timeout belongs to.
    pub(crate) height: BlockHeight,
    /// Round the timeout belongs to.
    pub(crate) round: Round,
    /// Step ending when the timeout fires.
    pub(crate) step: Step,
}

impl TimeoutInfo {
    /// Whether this request replaces `armed`.
    pub(crate) fn supersedes(&self, armed: &TimeoutInfo) -> bool {
        (self.height, self.round, self.step) > (armed.height, armed.round, armed.step)
    }
}

/// Runs the ticker loop: consumes schedule requests from `ticks`, keeps
/// the single armed timer, and emits tocks into the driver queue.
pub(crate) async fn run_ticker(
    ctx: &ctx::Ctx,
    mut ticks: ctx::channel::UnboundedReceiver<TimeoutInfo>,
    tocks: ctx::channel::UnboundedSender<Input>,
) -> ctx::Result<()> {
    let mut armed: Option<(time::Instant, TimeoutInfo)> = None;
    loop {
        let deadline = match &armed {
            Some((at, _)) => time::Deadline::Finite(*at),
            None => time::Deadline::Infinite,
        };
        match ticks.recv(&ctx.with_deadline(deadline)).await {
            Ok(tick) => {
                let replaces = armed.map_or(true, |(_, cur)| tick.supersedes(&cur));
                if replaces {
                    armed = Some((ctx.now() + tick.duration, tick));
                } else {
                    tracing::trace!(?tick, "ignoring stale timeout request");
                }
            }
            Err(ctx::Canceled) => {
                if !ctx.is_active() {
                    return Ok(());
                }
                // The deadline of the armed timeout passed.
                if let Some((_, tick)) = armed.take() {
                    tracing::debug!(
                        height = %tick.height,
                        round = %tick.round,
                        step = %tick.step,
                        "timed out",
                    );
                    tocks.send(Input::Tock(tick));
                }
            }
        }
    }
}
