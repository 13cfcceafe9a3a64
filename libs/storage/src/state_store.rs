//! The state store: chain state, validator sets, consensus parameters
//! and application responses, keyed per height with checkpointed
//! validator storage and range pruning.
use crate::kv::{KeyValueStore, WriteBatch};
use anyhow::Context as _;
use quorum_consensus_roles::validator::{
    AbciResponses, BlockHeight, ChainState, ConsensusParams, ValidatorSet,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use zksync_concurrency::ctx;

/// Full validator-set snapshots are persisted this often even when the
/// set does not change, so that any height can be reconstructed from a
/// nearby record.
const VALIDATOR_SET_CHECKPOINT_INTERVAL: u64 = 100_000;

/// Range deletes are chunked so that a single pruning batch stays small.
const PRUNE_CHUNK_SIZE: u64 = 1000;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Prefix {
    Validators = 5,
    ConsensusParams = 6,
    AbciResponses = 7,
    State = 8,
}

/// Key layout: one prefix byte plus the zero-padded hex height. The
/// state blob lives under the bare prefix byte.
fn key_at(prefix: Prefix, height: BlockHeight) -> Vec<u8> {
    let mut key = vec![prefix as u8];
    key.extend_from_slice(format!("{:08x}", height.0).as_bytes());
    key
}

fn state_key() -> Vec<u8> {
    vec![Prefix::State as u8]
}

/// Validator-set record for one height: the height the set last changed
/// at, plus the full set at change heights and checkpoints.
#[derive(Debug, Serialize, Deserialize)]
struct ValidatorsInfo {
    last_height_changed: BlockHeight,
    validator_set: Option<ValidatorSet>,
}

/// Consensus-params record for one height; full only at change heights.
#[derive(Debug, Serialize, Deserialize)]
struct ConsensusParamsInfo {
    last_height_changed: BlockHeight,
    params: Option<ConsensusParams>,
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("record serialization is infallible")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    bincode::deserialize(bytes).context("failed decoding stored record")
}

/// The most recent height ≤ `height` guaranteed to hold a full validator
/// set: the latest checkpoint, unless the set changed after it.
fn last_stored_height_for(height: BlockHeight, last_height_changed: BlockHeight) -> BlockHeight {
    let checkpoint = height.0 - height.0 % VALIDATOR_SET_CHECKPOINT_INTERVAL;
    BlockHeight(checkpoint.max(last_height_changed.0))
}

/// Persistence of per-height consensus state.
///
/// Validator sets are stored with their rotation priorities as of
/// `last_height_changed`; [`StateStore::load_validators`] advances them
/// to the requested height, so full snapshots written at checkpoints must
/// carry the same baseline (which they do, since [`ChainState`] keeps its
/// sets at the baseline as well).
#[derive(Debug, Clone)]
pub struct StateStore {
    db: Arc<dyn KeyValueStore>,
}

impl StateStore {
    /// Creates a store over the given backend.
    pub fn new(db: Arc<dyn KeyValueStore>) -> Self {
        Self { db }
    }

    /// Loads the current chain state, if any was saved.
    pub async fn load(&self, ctx: &ctx::Ctx) -> ctx::Result<Option<ChainState>> {
        let Some(bytes) = self.db.get(ctx, &state_key()).await? else {
            return Ok(None);
        };
        Ok(Some(decode(&bytes)?))
    }

    /// Persists the state committed at `state.last_block_height` in one
    /// atomic, durably-flushed batch: the validator set for two heights
    /// ahead, the params for the next height, and the state blob itself.
    pub async fn save(&self, ctx: &ctx::Ctx, state: &ChainState) -> ctx::Result<()> {
        let mut batch = WriteBatch::default();
        let mut next_height = state.last_block_height.next();
        if next_height.0 == 1 {
            next_height = state.initial_height;
            self.stage_validators(
                &mut batch,
                next_height,
                next_height,
                &state.validators,
            )?;
        }
        self.stage_validators(
            &mut batch,
            next_height.next(),
            state.last_height_validators_changed,
            &state.next_validators,
        )?;
        self.stage_params(
            &mut batch,
            next_height,
            state.last_height_consensus_params_changed,
            &state.consensus_params,
        )?;
        batch.put(state_key(), encode(state));
        self.db.write(ctx, batch).await
    }

    /// Loads the validator set for `height`, with proposer priorities
    /// advanced by `height - last_height_changed`. Returns `None` if the
    /// height was never populated (or was pruned away).
    pub async fn load_validators(
        &self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
    ) -> ctx::Result<Option<ValidatorSet>> {
        let Some(info) = self.load_validators_info(ctx, height).await? else {
            return Ok(None);
        };
        let last_height_changed = info.last_height_changed;
        let mut set = match info.validator_set {
            Some(set) => set,
            None => {
                let stored = last_stored_height_for(height, last_height_changed);
                let info = self
                    .load_validators_info(ctx, stored)
                    .await?
                    .with_context(|| format!("validator snapshot at {stored} missing"))?;
                info.validator_set
                    .with_context(|| format!("record at {stored} holds no validator set"))?
            }
        };
        set.increment_proposer_priority(height.0.saturating_sub(last_height_changed.0) as u32);
        Ok(Some(set))
    }

    /// Loads the consensus params effective at `height`.
    pub async fn load_consensus_params(
        &self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
    ) -> ctx::Result<Option<ConsensusParams>> {
        let Some(info) = self.load_params_info(ctx, height).await? else {
            return Ok(None);
        };
        match info.params {
            Some(params) => Ok(Some(params)),
            None => {
                let changed = info.last_height_changed;
                let info = self
                    .load_params_info(ctx, changed)
                    .await?
                    .with_context(|| format!("consensus params at {changed} missing"))?;
                Ok(Some(info.params.with_context(|| {
                    format!("record at {changed} holds no consensus params")
                })?))
            }
        }
    }

    /// Persists the application responses for `height`.
    pub async fn save_abci_responses(
        &self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
        responses: &AbciResponses,
    ) -> ctx::Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(key_at(Prefix::AbciResponses, height), encode(responses));
        self.db.write(ctx, batch).await
    }

    /// Loads the application responses for `height`.
    pub async fn load_abci_responses(
        &self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
    ) -> ctx::Result<Option<AbciResponses>> {
        let Some(bytes) = self.db.get(ctx, &key_at(Prefix::AbciResponses, height)).await? else {
            return Ok(None);
        };
        Ok(Some(decode(&bytes)?))
    }

    /// Populates validator records for every height in
    /// `[lower_height, upper_height]` with one set. Used when adopting a
    /// chain segment wholesale (e.g. after block sync).
    pub async fn save_validator_sets(
        &self,
        ctx: &ctx::Ctx,
        lower_height: BlockHeight,
        upper_height: BlockHeight,
        set: &ValidatorSet,
    ) -> ctx::Result<()> {
        let mut batch = WriteBatch::default();
        for height in lower_height.0..=upper_height.0 {
            self.stage_validators(&mut batch, BlockHeight(height), lower_height, set)?;
        }
        self.db.write(ctx, batch).await
    }

    /// Seeds the store from a known state without replaying the chain.
    /// The current validator set is snapshotted in full at the height
    /// after the next one, and also at the next height itself — except
    /// when bootstrapping at genesis or from a snapshot that does not
    /// carry the last block's validators. Params are written in full at
    /// the next height, so the node can load them without chasing a
    /// pointer into history it does not have.
    pub async fn bootstrap(&self, ctx: &ctx::Ctx, state: &ChainState) -> ctx::Result<()> {
        let mut batch = WriteBatch::default();
        let mut height = state.last_block_height.next();
        if height.0 == 1 {
            height = state.initial_height;
        } else if state.last_validators.is_some() {
            self.stage_validators(&mut batch, height, height, &state.validators)?;
        }
        self.stage_validators(&mut batch, height.next(), height.next(), &state.validators)?;
        self.stage_params(&mut batch, height, height, &state.consensus_params)?;
        batch.put(state_key(), encode(state));
        self.db.write(ctx, batch).await
    }

    /// Deletes records for heights `[1, retain_height)`, keeping exactly
    /// one recoverable validator-set and params record below
    /// `retain_height`. Deletes run high→low in bounded chunks so that an
    /// interrupted prune never strands a height without its snapshot.
    pub async fn prune_states(
        &self,
        ctx: &ctx::Ctx,
        retain_height: BlockHeight,
    ) -> ctx::Result<()> {
        if retain_height.0 <= 1 {
            return Ok(());
        }
        self.prune_consensus_params(ctx, retain_height).await?;
        self.prune_validator_sets(ctx, retain_height).await?;
        self.prune_range(ctx, Prefix::AbciResponses, BlockHeight(1), retain_height)
            .await?;
        Ok(())
    }

    async fn prune_consensus_params(
        &self,
        ctx: &ctx::Ctx,
        retain_height: BlockHeight,
    ) -> ctx::Result<()> {
        let Some(info) = self.load_params_info(ctx, retain_height).await? else {
            // Nothing recorded at the retain height; pruning blindly
            // could delete the only remaining snapshot.
            tracing::debug!("no consensus params at {retain_height}; skipping prune");
            return Ok(());
        };
        let changed = info.last_height_changed;
        if info.params.is_none() {
            // The record at the retain height is a pointer; make sure the
            // record it points at survives as the recoverable copy.
            let full = self
                .load_params_info(ctx, changed)
                .await?
                .with_context(|| format!("consensus params at {changed} missing"))?;
            if full.params.is_none() {
                return Err(
                    anyhow::format_err!("record at {changed} holds no consensus params").into(),
                );
            }
            self.prune_range(ctx, Prefix::ConsensusParams, changed.next(), retain_height)
                .await?;
        }
        self.prune_range(ctx, Prefix::ConsensusParams, BlockHeight(1), changed)
            .await
    }

    async fn prune_validator_sets(
        &self,
        ctx: &ctx::Ctx,
        retain_height: BlockHeight,
    ) -> ctx::Result<()> {
        let Some(info) = self.load_validators_info(ctx, retain_height).await? else {
            tracing::debug!("no validator record at {retain_height}; skipping prune");
            return Ok(());
        };
        let last_recorded = last_stored_height_for(retain_height, info.last_height_changed);
        if info.validator_set.is_none() {
            let full = self
                .load_validators_info(ctx, last_recorded)
                .await?
                .with_context(|| format!("validator snapshot at {last_recorded} missing"))?;
            if full.validator_set.is_none() {
                return Err(anyhow::format_err!(
                    "record at {last_recorded} holds no validator set"
                )
                .into());
            }
            if last_recorded < retain_height {
                self.prune_range(ctx, Prefix::Validators, last_recorded.next(), retain_height)
                    .await?;
            }
        }
        self.prune_range(ctx, Prefix::Validators, BlockHeight(1), last_recorded)
            .await
    }

    /// Deletes keys for heights `[start, end)`, walking downwards in
    /// chunks of [`PRUNE_CHUNK_SIZE`].
    async fn prune_range(
        &self,
        ctx: &ctx::Ctx,
        prefix: Prefix,
        start: BlockHeight,
        end: BlockHeight,
    ) -> ctx::Result<()> {
        let mut high = end.0;
        while high > start.0 {
            let low = high.saturating_sub(PRUNE_CHUNK_SIZE).max(start.0);
            let mut batch = WriteBatch::default();
            for height in (low..high).rev() {
                batch.delete(key_at(prefix, BlockHeight(height)));
            }
            self.db.write(ctx, batch).await?;
            high = low;
        }
        Ok(())
    }

    fn stage_validators(
        &self,
        batch: &mut WriteBatch,
        height: BlockHeight,
        last_height_changed: BlockHeight,
        set: &ValidatorSet,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            last_height_changed <= height,
            "validator change height {last_height_changed} is past {height}"
        );
        let full = height == last_height_changed
            || height.0 % VALIDATOR_SET_CHECKPOINT_INTERVAL == 0;
        let info = ValidatorsInfo {
            last_height_changed,
            validator_set: full.then(|| set.clone()),
        };
        batch.put(key_at(Prefix::Validators, height), encode(&info));
        Ok(())
    }

    fn stage_params(
        &self,
        batch: &mut WriteBatch,
        height: BlockHeight,
        last_height_changed: BlockHeight,
        params: &ConsensusParams,
    ) -> anyhow::Result<()> {
        let info = ConsensusParamsInfo {
            last_height_changed,
            params: (height == last_height_changed).then_some(*params),
        };
        batch.put(key_at(Prefix::ConsensusParams, height), encode(&info));
        Ok(())
    }

    async fn load_validators_info(
        &self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
    ) -> ctx::Result<Option<ValidatorsInfo>> {
        let Some(bytes) = self.db.get(ctx, &key_at(Prefix::Validators, height)).await? else {
            return Ok(None);
        };
        Ok(Some(decode(&bytes)?))
    }

    async fn load_params_info(
        &self,
        ctx: &ctx::Ctx,
        height: BlockHeight,
    ) -> ctx::Result<Option<ConsensusParamsInfo>> {
        let Some(bytes) = self
            .db
            .get(ctx, &key_at(Prefix::ConsensusParams, height))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(decode(&bytes)?))
    }
}
