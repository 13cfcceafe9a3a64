//! Block-part ingress: assembling the proposed block as its parts
//! arrive, and the transitions a completed block triggers.
use super::StateMachine;
use crate::{io::BlockPartMsg, round_state::Step};
use quorum_consensus_roles::validator::{BlockHeight, PartSetError, Round};
use zksync_concurrency::{ctx, error::Wrap};

/// Errors that can occur when processing a block-part message.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// Part for a different height.
    #[error("block part from wrong height (part: {height}/{round}, current: {current_height})")]
    WrongHeight {
        /// Height of the rejected part.
        height: BlockHeight,
        /// Round of the rejected part.
        round: Round,
        /// Current height.
        current_height: BlockHeight,
    },
    /// No part set is being tracked. Happens legitimately when parts of
    /// an abandoned round straggle in.
    #[error("block part while not expecting any (part: {height}/{round})")]
    NotExpecting {
        /// Height of the rejected part.
        height: BlockHeight,
        /// Round of the rejected part.
        round: Round,
    },
    /// Accepting the part would push the block past the size limit.
    #[error("block exceeds maximum block bytes ({got} > {max})")]
    Oversized {
        /// Size the part set would reach.
        got: u64,
        /// Maximum allowed by the consensus params.
        max: u64,
    },
    /// The part does not fit the tracked part-set header.
    #[error("invalid block part: {0:#}")]
    InvalidPart(#[from] PartSetError),
    /// A complete part set did not decode into a block.
    #[error("malformed proposal block: {0:#}")]
    MalformedBlock(#[source] anyhow::Error),
    /// Internal error. Unlike other error types, this one isn't supposed
    /// to be easily recoverable.
    #[error(transparent)]
    Internal(#[from] ctx::Error),
}

impl Wrap for Error {
    fn with_wrap<C: std::fmt::Display + Send + Sync + 'static, F: FnOnce() -> C>(
        self,
        f: F,
    ) -> Self {
        match self {
            Error::Internal(err) => Error::Internal(err.with_wrap(f)),
            err => err,
        }
    }
}

impl StateMachine {
    /// Processes a block-part message. Completing the block triggers
    /// either the prevote (before the propose timeout) or the pending
    /// commit, depending on where the round stands.
    pub(crate) async fn on_block_part(
        &mut self,
        ctx: &ctx::Ctx,
        msg: BlockPartMsg,
    ) -> Result<(), Error> {
        let height = self.rs.height;
        if msg.height != height {
            return Err(Error::WrongHeight {
                height: msg.height,
                round: msg.round,
                current_height: height,
            });
        }
        if msg.round != self.rs.round {
            // Blocks may be reused across rounds; not necessarily a bad
            // peer.
            tracing::debug!(
                part_round = %msg.round,
                current_round = %self.rs.round,
                "received block part from a different round",
            );
        }
        let Some(parts) = &mut self.rs.proposal_block_parts else {
            return Err(Error::NotExpecting {
                height: msg.height,
                round: msg.round,
            });
        };

        let max_bytes = self.state.consensus_params.block.max_bytes;
        let projected = parts.byte_size() + msg.part.bytes.len() as u64;
        if projected > max_bytes {
            return Err(Error::Oversized {
                got: projected,
                max: max_bytes,
            });
        }

        let added = parts.add_part(msg.part)?;
        if !added || !parts.is_complete() {
            return Ok(());
        }

        // All parts are in; reassemble the block.
        let block = parts.assemble().map_err(Error::MalformedBlock)?;
        tracing::info!(height = %block.header.height, "received complete proposal block");
        self.rs.proposal_block = Some(block);

        // Update the valid block if the current round already has a
        // polka for what we just assembled.
        let round = self.rs.round;
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|v| v.two_thirds_majority());
        if let Some(polka_id) = polka {
            if !polka_id.is_nil() && self.rs.valid_round < Some(round) {
                let matches = self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&polka_id.hash));
                if matches {
                    tracing::debug!("updating valid block to the new proposal block");
                    self.rs.valid_round = Some(round);
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                }
            }
        }

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            // Move on to the prevote before the propose timeout fires.
            self.enter_prevote(ctx, height, round).await?;
            if polka.is_some() {
                self.enter_precommit(ctx, height, round).await?;
            }
        } else if self.rs.step == Step::Commit {
            // This was the block the pending commit is waiting on.
            self.try_finalize_commit(ctx, height)
                .await
                .map_err(Error::Internal)?;
        }
        Ok(())
    }
}
