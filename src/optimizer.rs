//! The lifecycle façade (spec §4.H): construction, `zero_grad`, and the
//! per-step orchestration of partition → group build → reduce → copy →
//! base step → copy → gather.
//!
//! `ShardedOptimizer` owns nothing the base optimizer or the embedding
//! framework doesn't hand it at construction time: the partition maps and
//! shard groups are computed once and never mutated afterward (spec §3
//! "Lifecycle").

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::base_optimizer::{BaseOptimizer, GroupShards};
use crate::checkpoint::{self, Checkpoint, LoadedCheckpoint, ScalerState};
use crate::collective::CollectiveBackend;
use crate::copy;
use crate::dtype::{Dtype, DTYPE_ORDER};
use crate::error::{Result, ShardError};
use crate::groups::{self, ShardGroups};
use crate::param::{GradBufferDescriptor, ModelParameter, ParamBufferView, ParamId};
use crate::partition::{self, GbufRangeMap};

/// Constructor-injected configuration (spec §9 "Global state" design note:
/// rank/world size/backend are passed in, never looked up process-wide).
#[derive(Debug, Clone)]
pub struct ShardedOptimizerConfig {
    pub world_size: usize,
    pub rank: usize,
    /// Whether `reduce_grads` should all-reduce layernorm gradients before
    /// the reduce-scatter (spec §4.F step 1).
    pub aux_allreduce_layernorm: bool,
    /// Whether `reduce_grads` should all-reduce embedding gradients before
    /// the reduce-scatter (spec §4.F step 2).
    pub aux_allreduce_embedding: bool,
}

impl Default for ShardedOptimizerConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            aux_allreduce_layernorm: true,
            aux_allreduce_embedding: true,
        }
    }
}

/// One (model-replica, dtype) gradient buffer plus its world-partition map
/// and parameter-buffer view, as built at construction time.
struct ReplicaBuffer {
    grad_buffer: GradBufferDescriptor,
    param_view: ParamBufferView,
    range_map: GbufRangeMap,
}

/// The sharding core orchestrating one base optimizer over one or more
/// model replicas (spec §4.H).
pub struct ShardedOptimizer<O: BaseOptimizer> {
    config: ShardedOptimizerConfig,
    backend: Arc<dyn CollectiveBackend>,
    base_optimizer: O,
    /// Indexed by model replica, then by dtype in [`DTYPE_ORDER`].
    replica_buffers: Vec<HashMap<Dtype, ReplicaBuffer>>,
    shard_groups: ShardGroups,
    param_range_maps: HashMap<ParamId, crate::partition::ParamRangeMap>,
    layernorm_grad_buffers: Vec<usize>,
    embedding_grad_buffers: Vec<usize>,
}

impl<O: BaseOptimizer> ShardedOptimizer<O> {
    /// Build the partition maps and shard groups for every model replica's
    /// gradient buffers, then rewrite `base_optimizer`'s parameter groups
    /// in place (spec §4.B, §4.C).
    /// `layernorm_grad_buffers`/`embedding_grad_buffers` name the model
    /// replica indices (into `grad_buffers`) whose gradients need the
    /// pass-through all-reduce before the reduce-scatter (spec §4.F steps
    /// 1-2); gated by `config.aux_allreduce_layernorm`/
    /// `aux_allreduce_embedding` so a caller can disable either axis
    /// without having to pass empty lists.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ShardedOptimizerConfig,
        backend: Arc<dyn CollectiveBackend>,
        mut base_optimizer: O,
        grad_buffers: Vec<HashMap<Dtype, GradBufferDescriptor>>,
        world_param_group: &HashMap<ParamId, usize>,
        params: &HashMap<ParamId, &dyn ModelParameter>,
        param_range_of: impl Fn(ParamId) -> crate::range::Range,
        layernorm_grad_buffers: Vec<usize>,
        embedding_grad_buffers: Vec<usize>,
    ) -> Result<Self> {
        if backend.rank() != config.rank || backend.world_size() != config.world_size {
            return Err(ShardError::SizeMismatch {
                expected: config.world_size,
                found: backend.world_size(),
            });
        }

        let mut replica_buffers = Vec::with_capacity(grad_buffers.len());
        let mut model_gbuf_ranges: Vec<HashMap<Dtype, GbufRangeMap>> =
            Vec::with_capacity(grad_buffers.len());
        let mut param_to_model_dtype = HashMap::new();

        for (model_index, mut buffers) in grad_buffers.into_iter().enumerate() {
            let mut per_dtype_ranges = HashMap::new();
            let mut replica_map = HashMap::new();

            for &dtype in DTYPE_ORDER.iter() {
                let Some(grad_buffer) = buffers.remove(&dtype) else { continue };
                for &id in grad_buffer.param_index.keys() {
                    param_to_model_dtype.insert(id, (model_index, dtype));
                }
                let range_map = partition::build_gbuf_range(
                    grad_buffer.padded_numel,
                    config.rank,
                    config.world_size,
                    &grad_buffer.param_index,
                )?;
                let param_view = ParamBufferView::from_grad_buffer(&grad_buffer, dtype)?;
                per_dtype_ranges.insert(dtype, range_map.clone());
                replica_map.insert(dtype, ReplicaBuffer { grad_buffer, param_view, range_map });
            }

            model_gbuf_ranges.push(per_dtype_ranges);
            replica_buffers.push(replica_map);
        }

        let mut param_range_maps = HashMap::new();
        for per_dtype in &model_gbuf_ranges {
            for range_map in per_dtype.values() {
                param_range_maps.extend(range_map.param_map.clone());
            }
        }

        let base_groups = base_optimizer.param_groups().to_vec();
        let (_local_param_group_map, group_ranges, surviving_indices) =
            groups::build_optimizer_group_ranges(&base_groups, world_param_group, &model_gbuf_ranges);

        let param_range_of_map = param_range_maps.clone();
        let (shard_groups, rewritten_groups) = groups::build_model_and_main_param_groups(
            &group_ranges,
            &base_groups,
            &surviving_indices,
            params,
            &param_to_model_dtype,
            move |id| {
                param_range_of_map
                    .get(&id)
                    .map(|m| m.param)
                    .unwrap_or_else(|| param_range_of(id))
            },
        )?;

        info!(
            replicas = shard_groups.model_float.len(),
            groups = rewritten_groups.len(),
            "built sharded optimizer groups"
        );

        base_optimizer.set_param_groups(rewritten_groups);

        Ok(Self {
            config,
            backend,
            base_optimizer,
            replica_buffers,
            shard_groups,
            param_range_maps,
            layernorm_grad_buffers,
            embedding_grad_buffers,
        })
    }

    /// Zero every group family's gradients (spec §4.H): the registered
    /// **model tensors'** `main_grad` is the correctness-required part (the
    /// next `reduce_grads` reads straight from the gradient buffer, but
    /// upstream autograd accumulates into `main_grad`, so a stale value
    /// there would leak into the next step's backward pass); the
    /// float/low-precision shard views and the master shards are zeroed
    /// too, but only as a memory-fragmentation mitigation, so a missing
    /// shard grad is a no-op rather than an error.
    pub fn zero_grad(
        &mut self,
        params: &mut HashMap<ParamId, &mut dyn ModelParameter>,
        set_to_none: bool,
    ) -> Result<()> {
        for group in self.shard_groups.model_float.iter().chain(self.shard_groups.model_low_precision.iter()) {
            for &id in group {
                let param = params
                    .get_mut(&id)
                    .ok_or(ShardError::SizeMismatch { expected: 1, found: 0 })?;
                if set_to_none {
                    param.set_main_grad(None);
                } else if let Some(mut grad) = param.main_grad() {
                    grad.iter_mut().for_each(|v| *v = 0.0);
                    param.set_main_grad(Some(grad));
                }
            }
        }

        for group in self.shard_groups.shard_float.iter_mut() {
            for shard in group.iter_mut() {
                zero_one(shard, set_to_none);
            }
        }
        for group in self.shard_groups.shard_low_precision.iter_mut() {
            for shard in group.iter_mut() {
                zero_one(shard, set_to_none);
            }
        }
        for group in self.shard_groups.shard_master_from_low_precision.iter_mut() {
            for shard in group.iter_mut() {
                zero_one(shard, set_to_none);
            }
        }
        Ok(())
    }

    /// Reduce gradients across the data-parallel group (spec §4.F): the
    /// pass-through layernorm/embedding all-reduces, the `1/W` scale, then
    /// one reduce-scatter per (replica, dtype) buffer, in deterministic
    /// replica-then-dtype order (spec §9).
    pub async fn reduce_grads(&mut self) -> Result<()> {
        info!("reduce_grads: start");
        let world_size = self.config.world_size as f32;

        if self.config.aux_allreduce_layernorm {
            for &idx in &self.layernorm_grad_buffers {
                let replica = find_replica_mut(&mut self.replica_buffers, idx)?;
                for buf in replica.values() {
                    let mut data = buf.grad_buffer.data.write();
                    self.backend.all_reduce(&mut data).await?;
                }
            }
        }
        if self.config.aux_allreduce_embedding {
            for &idx in &self.embedding_grad_buffers {
                let replica = find_replica_mut(&mut self.replica_buffers, idx)?;
                for buf in replica.values() {
                    let mut data = buf.grad_buffer.data.write();
                    self.backend.all_reduce(&mut data).await?;
                }
            }
        }

        for (model_index, per_dtype) in self.replica_buffers.iter_mut().enumerate() {
            for &dtype in DTYPE_ORDER.iter() {
                let Some(buf) = per_dtype.get_mut(&dtype) else { continue };
                debug!(model_index, ?dtype, "reduce_scatter");
                let mut data = buf.grad_buffer.data.write();
                for v in data.iter_mut() {
                    *v /= world_size;
                }
                let local = buf.range_map.local;
                let mut dst = vec![0.0f32; local.size()];
                self.backend.reduce_scatter(&mut dst, &data).await?;
                data[local.start..local.end].copy_from_slice(&dst);
            }
        }
        Ok(())
    }

    /// Copy this rank's owned slice of every reduced gradient buffer into
    /// the corresponding master (or float) shard's `grad` field (spec
    /// §4.E "grads → main").
    pub fn copy_grads_to_main(
        &mut self,
        params: &HashMap<ParamId, &dyn ModelParameter>,
    ) -> Result<()> {
        let param_range_maps = self.param_range_maps.clone();
        let param_to_model_dtype = self.shard_groups.param_to_model_dtype.clone();
        for group_index in 0..self.shard_groups.model_float.len() {
            let ids = self.shard_groups.model_float[group_index].clone();
            for (pos, id) in ids.into_iter().enumerate() {
                let param = *params.get(&id).ok_or(ShardError::SizeMismatch { expected: 1, found: 0 })?;
                let (model_index, dtype) = param_to_model_dtype[&id];
                let gbuf_local = param_range_maps[&id].gbuf_local;
                let replica = self.replica_buffers[model_index]
                    .get(&dtype)
                    .ok_or(ShardError::SizeMismatch { expected: 1, found: 0 })?;
                copy::copy_grad_to_shard(
                    param,
                    &replica.grad_buffer,
                    gbuf_local,
                    &mut self.shard_groups.shard_float[group_index][pos],
                )?;
            }
        }
        for group_index in 0..self.shard_groups.model_low_precision.len() {
            let ids = self.shard_groups.model_low_precision[group_index].clone();
            for (pos, id) in ids.into_iter().enumerate() {
                let param = *params.get(&id).ok_or(ShardError::SizeMismatch { expected: 1, found: 0 })?;
                let (model_index, dtype) = param_to_model_dtype[&id];
                let gbuf_local = param_range_maps[&id].gbuf_local;
                let replica = self.replica_buffers[model_index]
                    .get(&dtype)
                    .ok_or(ShardError::SizeMismatch { expected: 1, found: 0 })?;
                copy::copy_grad_to_shard(
                    param,
                    &replica.grad_buffer,
                    gbuf_local,
                    &mut self.shard_groups.shard_master_from_low_precision[group_index][pos],
                )?;
            }
        }
        Ok(())
    }

    /// Run the base optimizer's step rule on the rewritten groups
    /// (`shard_float[g] ++ shard_master_from_low_precision[g]`, spec §3).
    pub fn step_base_optimizer(&mut self) -> Result<()> {
        let descriptors = self.base_optimizer.param_groups().to_vec();
        let mut groups = Vec::with_capacity(descriptors.len());
        let mut float_groups: Vec<_> = self.shard_groups.shard_float.iter_mut().collect();
        let mut master_groups: Vec<_> =
            self.shard_groups.shard_master_from_low_precision.iter_mut().collect();

        for (descriptor, (float, master)) in
            descriptors.iter().zip(float_groups.iter_mut().zip(master_groups.iter_mut()))
        {
            let mut shards: Vec<&mut crate::param::ShardTensor> = Vec::new();
            shards.extend(float.iter_mut());
            shards.extend(master.iter_mut());
            groups.push(GroupShards { descriptor, shards });
        }

        self.base_optimizer.step(&mut groups)
    }

    /// Copy updated master (and float) shards into each replica's
    /// parameter-buffer view, at `gbuf_world` coordinates (spec §4.E
    /// "main → params").
    pub fn copy_main_to_params(&mut self) -> Result<()> {
        let param_range_maps = self.param_range_maps.clone();
        let param_to_model_dtype = self.shard_groups.param_to_model_dtype.clone();

        for group_index in 0..self.shard_groups.model_float.len() {
            let ids = self.shard_groups.model_float[group_index].clone();
            for (pos, id) in ids.into_iter().enumerate() {
                let (model_index, dtype) = param_to_model_dtype[&id];
                let world_range = param_range_maps[&id].gbuf_world;
                let replica = self.replica_buffers[model_index]
                    .get(&dtype)
                    .ok_or(ShardError::SizeMismatch { expected: 1, found: 0 })?;
                copy::copy_shard_to_paramview(
                    &self.shard_groups.shard_float[group_index][pos],
                    world_range,
                    &replica.param_view,
                )?;
            }
        }
        for group_index in 0..self.shard_groups.model_low_precision.len() {
            let ids = self.shard_groups.model_low_precision[group_index].clone();
            for (pos, id) in ids.into_iter().enumerate() {
                let (model_index, dtype) = param_to_model_dtype[&id];
                let world_range = param_range_maps[&id].gbuf_world;
                let replica = self.replica_buffers[model_index]
                    .get(&dtype)
                    .ok_or(ShardError::SizeMismatch { expected: 1, found: 0 })?;
                copy::copy_shard_to_paramview(
                    &self.shard_groups.shard_master_from_low_precision[group_index][pos],
                    world_range,
                    &replica.param_view,
                )?;
            }
        }
        Ok(())
    }

    /// All-gather every replica's parameter-buffer view, then refresh each
    /// registered parameter tensor from its `[world_start, world_end)`
    /// slice (spec §4.F "gather_params").
    pub async fn gather_params(
        &mut self,
        params: &mut HashMap<ParamId, &mut dyn ModelParameter>,
    ) -> Result<()> {
        info!("gather_params: start");
        for (model_index, per_dtype) in self.replica_buffers.iter().enumerate() {
            for &dtype in DTYPE_ORDER.iter() {
                let Some(buf) = per_dtype.get(&dtype) else { continue };
                debug!(model_index, ?dtype, "all_gather");
                // `copy_main_to_params` staged this rank's updated shard at
                // `gbuf_world` coordinates (spec §4.E), not `local` — the
                // all-gather's source slice must match that same origin or
                // every rank but 0 broadcasts the wrong region.
                let world = buf.range_map.world;
                let mut full = buf.param_view.data.write();
                let src: Vec<f32> = full[world.start..world.end].to_vec();
                self.backend.all_gather(&mut full, &src).await?;
            }
        }

        for (&id, &(model_index, dtype)) in self.shard_groups.param_to_model_dtype.iter() {
            let Some(param) = params.get_mut(&id) else { continue };
            let Some(buf) = self.replica_buffers[model_index].get(&dtype) else { continue };
            let Some(entry) = buf.grad_buffer.param_index.get(&id) else { continue };
            copy::copy_paramview_to_param(&buf.param_view, entry.world_start, entry.world_end, *param)?;
        }
        Ok(())
    }

    /// A full training step (spec §4.H): reduce → copy grads→main →
    /// `base_optimizer.step` → copy main→params → gather.
    pub async fn step(
        &mut self,
        params_ref: &HashMap<ParamId, &dyn ModelParameter>,
        params_mut: &mut HashMap<ParamId, &mut dyn ModelParameter>,
    ) -> Result<()> {
        self.reduce_grads().await?;
        self.copy_grads_to_main(params_ref)?;
        self.step_base_optimizer()?;
        self.copy_main_to_params()?;
        self.gather_params(params_mut).await?;
        Ok(())
    }

    pub fn save_state(&self, grad_scaler: Option<ScalerState>) -> Result<Checkpoint> {
        let descriptors = self.base_optimizer.param_groups().to_vec();
        let base_state = self.base_optimizer.state_dict();
        checkpoint::save_state(&self.shard_groups, &descriptors, &self.param_range_maps, &base_state, grad_scaler)
    }

    pub fn load_state(&mut self, checkpoint: Checkpoint, scaler_currently_configured: bool) -> Result<()> {
        let had_scaler = checkpoint.grad_scaler.is_some();
        let loaded: LoadedCheckpoint =
            checkpoint::load_state(checkpoint, &mut self.shard_groups, &self.param_range_maps)?;
        if had_scaler != scaler_currently_configured {
            tracing::warn!(
                had_scaler,
                scaler_currently_configured,
                "loss-scaler presence mismatch between checkpoint and current configuration"
            );
        }
        self.base_optimizer.load_state_dict(loaded.optimizer_state)?;
        Ok(())
    }

    /// [`Self::save_state`], serialized to its on-disk wire form.
    pub fn save_state_bytes(&self, grad_scaler: Option<ScalerState>) -> Result<Vec<u8>> {
        self.save_state(grad_scaler)?.to_bytes()
    }

    /// [`Self::load_state`] from bytes previously produced by
    /// [`Self::save_state_bytes`].
    pub fn load_state_bytes(&mut self, bytes: &[u8], scaler_currently_configured: bool) -> Result<()> {
        let checkpoint = Checkpoint::from_bytes(bytes)?;
        self.load_state(checkpoint, scaler_currently_configured)
    }
}

fn zero_one(shard: &mut crate::param::ShardTensor, set_to_none: bool) {
    if set_to_none {
        shard.grad = None;
    } else if let Some(grad) = shard.grad.as_mut() {
        grad.iter_mut().for_each(|v| *v = 0.0);
    }
}

fn find_replica_mut(
    replica_buffers: &mut [HashMap<Dtype, ReplicaBuffer>],
    idx: usize,
) -> Result<&mut HashMap<Dtype, ReplicaBuffer>> {
    replica_buffers
        .get_mut(idx)
        .ok_or(ShardError::SizeMismatch { expected: replica_buffers.len(), found: idx })
}
