//! The checkpoint codec (spec §4.G/§6 "Persisted state layout"): serializes
//! and restores this rank's shard of the optimizer state, keyed by
//! `world_order` on save and re-keyed to `state_order` on load — the one
//! variant of the original's several (mostly commented-out) checkpoint
//! schemes that has a matching, working loader (spec §9 Open Question
//! resolution).
//!
//! Serialized with `serde`/`bincode`, the same stack the teacher crate uses
//! for its wire types (`p2p::gradient::GradientMessage` and friends).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::base_optimizer::{GroupDescriptor, OptimizerStateDict, ParamState};
use crate::error::ShardError;
use crate::groups::ShardGroups;
use crate::param::ParamId;
use crate::partition::ParamRangeMap;

/// Loss-scaler state, persisted verbatim if the embedding framework attached
/// one; this crate does not implement loss scaling itself (spec §1
/// non-goal) and only round-trips whatever state it is handed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_tracker: u32,
}

/// One parameter's persisted shard (spec §6 `ShardRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRecord {
    pub param: ParamId,
    pub world_order: u64,
    pub state_order: u64,
    pub group_index: usize,
    pub position_in_group: usize,
    pub param_range_map: ParamRangeMap,
    pub master_param: Vec<f32>,
    pub inner_state: ParamState,
}

/// The full persisted checkpoint for this rank's shard (spec §6
/// `checkpoint`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub param_groups: Vec<GroupDescriptor>,
    /// Ordered ascending by `world_order`, as saved.
    pub state: Vec<ShardRecord>,
    pub grad_scaler: Option<ScalerState>,
}

impl Checkpoint {
    /// Serialize this rank's checkpoint to its on-disk wire form, the same
    /// `bincode` stack the teacher crate uses for its wire types
    /// (`p2p::gradient::GradientMessage` and friends).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ShardError> {
        Ok(bincode::serialize(self)?)
    }

    /// Restore a checkpoint previously produced by [`Checkpoint::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Checkpoint, ShardError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// The base-optimizer state recovered from a checkpoint, ready to be handed
/// to `BaseOptimizer::load_state_dict`.
pub struct LoadedCheckpoint {
    pub optimizer_state: OptimizerStateDict,
    pub grad_scaler: Option<ScalerState>,
}

/// The flat position of `(group_index, position_in_group)` in the order
/// `ShardedOptimizer::step` hands shards to the base optimizer: groups
/// ascending, then `shard_float ++ shard_master_from_low_precision` within
/// each group. This is also the base optimizer's own `state_order` keying
/// convention (spec §6), since the base optimizer receives shards in this
/// same flattened order every step.
fn flat_index(shard_groups: &ShardGroups, group_index: usize, position_in_group: usize) -> u64 {
    let mut base = 0u64;
    for g in 0..group_index {
        base += shard_groups.shard_float[g].len() as u64;
        base += shard_groups.shard_master_from_low_precision[g].len() as u64;
    }
    base + position_in_group as u64
}

/// Save this rank's shard of the optimizer state (spec §4.G "Save").
pub fn save_state(
    shard_groups: &ShardGroups,
    group_descriptors: &[GroupDescriptor],
    param_range_maps: &HashMap<ParamId, ParamRangeMap>,
    base_state: &OptimizerStateDict,
    grad_scaler: Option<ScalerState>,
) -> Result<Checkpoint, ShardError> {
    let mut records = Vec::new();

    for group_index in 0..shard_groups.model_float.len() {
        for (pos, &param_id) in shard_groups.model_float[group_index].iter().enumerate() {
            records.push(build_record(
                shard_groups,
                param_range_maps,
                base_state,
                group_index,
                pos,
                param_id,
                shard_groups.shard_float[group_index][pos].data.clone(),
            )?);
        }
        let float_len = shard_groups.model_float[group_index].len();
        for (pos, &param_id) in shard_groups.model_low_precision[group_index].iter().enumerate() {
            records.push(build_record(
                shard_groups,
                param_range_maps,
                base_state,
                group_index,
                float_len + pos,
                param_id,
                shard_groups.shard_master_from_low_precision[group_index][pos].data.clone(),
            )?);
        }
    }

    records.sort_by_key(|r| r.world_order);

    Ok(Checkpoint { param_groups: group_descriptors.to_vec(), state: records, grad_scaler })
}

fn build_record(
    shard_groups: &ShardGroups,
    param_range_maps: &HashMap<ParamId, ParamRangeMap>,
    base_state: &OptimizerStateDict,
    group_index: usize,
    position_in_group: usize,
    param_id: ParamId,
    master_param: Vec<f32>,
) -> Result<ShardRecord, ShardError> {
    let range_map = *param_range_maps
        .get(&param_id)
        .ok_or(ShardError::CheckpointShapeMismatch { world_order: 0 })?;
    let state_order = flat_index(shard_groups, group_index, position_in_group);
    let inner_state = base_state.state.get(&state_order).cloned().unwrap_or_default();

    Ok(ShardRecord {
        param: param_id,
        world_order: range_map.gbuf_world_order,
        state_order,
        group_index,
        position_in_group,
        param_range_map: range_map,
        master_param,
        inner_state,
    })
}

/// Restore this rank's shard of the optimizer state (spec §4.G "Load").
///
/// Every record's saved `param_range_map` is checked against the current
/// partition before any shard is mutated (spec §7 "no partial state
/// mutation"): a mismatch means the world size or model shape changed since
/// the checkpoint was taken, which is fatal.
pub fn load_state(
    checkpoint: Checkpoint,
    shard_groups: &mut ShardGroups,
    param_range_maps: &HashMap<ParamId, ParamRangeMap>,
) -> Result<LoadedCheckpoint, ShardError> {
    for record in &checkpoint.state {
        let current = param_range_maps
            .get(&record.param)
            .ok_or(ShardError::CheckpointShapeMismatch { world_order: record.world_order })?;
        if *current != record.param_range_map {
            return Err(ShardError::CheckpointShapeMismatch { world_order: record.world_order });
        }
    }

    for record in &checkpoint.state {
        let float_len = shard_groups.shard_float[record.group_index].len();
        if record.position_in_group < float_len {
            shard_groups.shard_float[record.group_index][record.position_in_group].data =
                record.master_param.clone();
        } else {
            let idx = record.position_in_group - float_len;
            shard_groups.shard_master_from_low_precision[record.group_index][idx].data =
                record.master_param.clone();
        }
    }

    let state = checkpoint
        .state
        .into_iter()
        .map(|r| (r.state_order, r.inner_state))
        .collect();

    Ok(LoadedCheckpoint {
        optimizer_state: OptimizerStateDict { param_groups: checkpoint.param_groups, state },
        grad_scaler: checkpoint.grad_scaler,
    })
}
