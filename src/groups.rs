//! The group builder (spec §3 "Shard groups", §4.C): rewrites the base
//! optimizer's parameter groups into groups of shards, allocating float32
//! master copies for low-precision parameters and aliasing float32
//! parameters by (logical) view.

use std::collections::HashMap;

use tracing::debug;

use crate::base_optimizer::GroupDescriptor;
use crate::dtype::Dtype;
use crate::error::ShardError;
use crate::param::{ModelParameter, ParamId, ShardTensor};
use crate::partition::GbufRangeMap;

/// The four parallel per-group sequences from spec §3, plus the reverse
/// maps used to navigate from a model parameter back to its group and its
/// (replica, dtype) home.
#[derive(Debug, Default)]
pub struct ShardGroups {
    pub model_low_precision: Vec<Vec<ParamId>>,
    pub model_float: Vec<Vec<ParamId>>,
    pub shard_low_precision: Vec<Vec<ShardTensor>>,
    pub shard_float: Vec<Vec<ShardTensor>>,
    pub shard_master_from_low_precision: Vec<Vec<ShardTensor>>,

    /// `param -> (model_index, dtype)`.
    pub param_to_model_dtype: HashMap<ParamId, (usize, Dtype)>,
    /// `param -> (group_index, position_in_group)`.
    pub param_to_group_pos: HashMap<ParamId, (usize, usize)>,
}

/// Gather, for each base-optimizer group, the locally-owned parameters that
/// fall into it, recording each one's `(group_index, position)` (spec
/// §4.C steps 1-3).
///
/// Returns the per-group parameter lists (empty groups dropped), the
/// `param -> (group_index, position)` map, and the original `base_groups`
/// index each surviving group came from (so its hyperparameters can be
/// carried forward).
pub fn build_optimizer_group_ranges(
    base_groups: &[GroupDescriptor],
    world_param_group: &HashMap<ParamId, usize>,
    model_gbuf_ranges: &[HashMap<Dtype, GbufRangeMap>],
) -> (HashMap<ParamId, (usize, usize)>, Vec<Vec<ParamId>>, Vec<usize>) {
    let mut group_ranges: Vec<Vec<ParamId>> = vec![Vec::new(); base_groups.len()];
    let mut local_param_group_map = HashMap::new();

    for model_gbuf_range_map in model_gbuf_ranges {
        for gbuf_range_map in model_gbuf_range_map.values() {
            let mut param_ids: Vec<ParamId> = gbuf_range_map.param_map.keys().copied().collect();
            param_ids.sort();
            for param in param_ids {
                let group_index = world_param_group[&param];
                let group_range = &mut group_ranges[group_index];
                group_range.push(param);
                local_param_group_map.insert(param, (group_index, group_range.len() - 1));
            }
        }
    }

    // Squeeze zero-size group ranges, but keep the index mapping consistent:
    // the caller re-keys group_index to the surviving groups' positions.
    let mut surviving_indices = Vec::new();
    let mut surviving_ranges = Vec::new();
    for (i, range) in group_ranges.into_iter().enumerate() {
        if !range.is_empty() {
            surviving_indices.push(i);
            surviving_ranges.push(range);
        }
    }

    let remap: HashMap<usize, usize> =
        surviving_indices.iter().enumerate().map(|(new, &old)| (old, new)).collect();
    let local_param_group_map = local_param_group_map
        .into_iter()
        .map(|(param, (old_group, pos))| (param, (remap[&old_group], pos)))
        .collect();

    (local_param_group_map, surviving_ranges, surviving_indices)
}

/// Build the model/shard/master parameter groups and rewrite each surviving
/// base-optimizer group's parameter list to `shard_float ++
/// shard_master_from_low_precision` (spec §3, §4.C steps 4-5).
///
/// Only the `params` list changes: each rewritten group keeps the
/// hyperparameters (`learning_rate`, `betas`, `eps`, `weight_decay`) of its
/// original `base_groups` entry, as named by `surviving_indices` (the
/// output of [`build_optimizer_group_ranges`]).
pub fn build_model_and_main_param_groups(
    group_ranges: &[Vec<ParamId>],
    base_groups: &[GroupDescriptor],
    surviving_indices: &[usize],
    params: &HashMap<ParamId, &dyn ModelParameter>,
    param_to_model_dtype: &HashMap<ParamId, (usize, Dtype)>,
    param_range_of: impl Fn(ParamId) -> crate::range::Range,
) -> Result<(ShardGroups, Vec<GroupDescriptor>), ShardError> {
    let mut groups = ShardGroups {
        param_to_model_dtype: param_to_model_dtype.clone(),
        ..Default::default()
    };
    let mut rewritten_groups = Vec::with_capacity(group_ranges.len());

    for (group_index, param_ids) in group_ranges.iter().enumerate() {
        let mut model_low_precision = Vec::new();
        let mut model_float = Vec::new();
        let mut shard_low_precision = Vec::new();
        let mut shard_float = Vec::new();
        let mut shard_master_from_low_precision = Vec::new();

        for (pos, &param_id) in param_ids.iter().enumerate() {
            groups.param_to_group_pos.insert(param_id, (group_index, pos));

            let param = *params.get(&param_id).expect("param registered in group must exist");
            if !param.requires_grad() {
                // spec §6: every registered parameter's requires_grad must be true.
                return Err(ShardError::UnsupportedDtype { param: param_id, dtype: param.dtype() });
            }

            let param_range = param_range_of(param_id);
            let full_data = param.data();
            let slice = &full_data[param_range.start..param_range.end];
            let marker = param.tensor_parallel_marker();

            match param.dtype() {
                Dtype::F16 | Dtype::Bf16 => {
                    let shard_model_param = ShardTensor {
                        data: slice.to_vec(),
                        grad: None,
                        shared: param.shared(),
                        tensor_parallel_marker: marker.clone(),
                    };
                    let shard_master_param = ShardTensor {
                        data: slice.to_vec(),
                        grad: None,
                        shared: param.shared(),
                        tensor_parallel_marker: marker,
                    };
                    model_low_precision.push(param_id);
                    shard_low_precision.push(shard_model_param);
                    shard_master_from_low_precision.push(shard_master_param);
                }
                Dtype::F32 => {
                    let shard_model_param = ShardTensor {
                        data: slice.to_vec(),
                        grad: None,
                        shared: param.shared(),
                        tensor_parallel_marker: marker,
                    };
                    model_float.push(param_id);
                    shard_float.push(shard_model_param);
                }
            }
        }

        debug!(
            group_index,
            float_params = shard_float.len(),
            low_precision_params = shard_low_precision.len(),
            "built sharded optimizer group"
        );

        let orig_group = base_groups[surviving_indices[group_index]].clone();

        groups.model_low_precision.push(model_low_precision);
        groups.model_float.push(model_float);
        groups.shard_low_precision.push(shard_low_precision);
        groups.shard_float.push(shard_float);
        groups.shard_master_from_low_precision.push(shard_master_from_low_precision);
        rewritten_groups.push(orig_group);
    }

    Ok((groups, rewritten_groups))
}
