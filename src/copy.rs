//! The copy engine (spec §4.E): the two fast paths that move data between
//! the gradient buffer / parameter buffer and a shard's owned storage.
//!
//! Neither function logs — these run once per parameter per step and sit on
//! the hot path, matching the teacher's habit of leaving tight inner loops
//! uninstrumented (`_copy_model_grads_to_main_grads` and
//! `_copy_main_params_to_model_params` in the original carry no logging
//! either).
//!
//! In the original implementation a parameter's `main_grad` and the
//! contiguous gradient buffer are the same aliased memory, so reading
//! `main_grad[param_range]` after a reduce-scatter on the buffer already
//! observes the reduced values. This crate does not alias (spec §9): the
//! grad buffer is the single source of truth for reduced gradients, and
//! `copy_grad_to_shard` still requires a live, correctly-sized
//! `main_grad` from the parameter (the Open Question resolution in spec
//! §9 — a missing or mis-sized one is fatal) even though the values it
//! copies into the shard come from the buffer.

use crate::error::ShardError;
use crate::param::{GradBufferDescriptor, ModelParameter, ParamBufferView, ShardTensor};
use crate::range::Range;

/// Copy `grad_buffer`'s (already reduced) `gbuf_local` slice into
/// `shard.grad`, after checking `param`'s `main_grad` is present and the
/// right size.
pub fn copy_grad_to_shard(
    param: &dyn ModelParameter,
    grad_buffer: &GradBufferDescriptor,
    gbuf_local: Range,
    shard: &mut ShardTensor,
) -> Result<(), ShardError> {
    let main_grad = param.main_grad().ok_or(ShardError::SizeMismatch { expected: param.numel(), found: 0 })?;
    if main_grad.len() != param.numel() {
        return Err(ShardError::SizeMismatch { expected: param.numel(), found: main_grad.len() });
    }

    let data = grad_buffer.data.read();
    if gbuf_local.end > data.len() {
        return Err(ShardError::SizeMismatch { expected: data.len(), found: gbuf_local.end });
    }
    let slice = &data[gbuf_local.start..gbuf_local.end];
    if slice.len() != shard.data.len() {
        return Err(ShardError::SizeMismatch { expected: shard.data.len(), found: slice.len() });
    }
    shard.grad = Some(slice.to_vec());
    Ok(())
}

/// Copy `shard.data` (a master shard, post-step) into the parameter-buffer
/// view's `gbuf_world` slice, the staging area an all-gather later
/// completes (spec §4.E "main → params").
pub fn copy_shard_to_paramview(
    shard: &ShardTensor,
    gbuf_world: Range,
    param_view: &ParamBufferView,
) -> Result<(), ShardError> {
    if shard.data.len() != gbuf_world.size() {
        return Err(ShardError::SizeMismatch { expected: gbuf_world.size(), found: shard.data.len() });
    }
    let mut data = param_view.data.write();
    if gbuf_world.end > data.len() {
        return Err(ShardError::SizeMismatch { expected: data.len(), found: gbuf_world.end });
    }
    data[gbuf_world.start..gbuf_world.end].copy_from_slice(&shard.data);
    Ok(())
}

/// After an all-gather has completed `param_view`, copy one parameter's
/// full `[world_start, world_end)` slice back into the parameter (spec
/// §4.F "a final pass copies each parameter tensor from the parameter
/// buffer").
pub fn copy_paramview_to_param(
    param_view: &ParamBufferView,
    world_start: usize,
    world_end: usize,
    param: &mut dyn ModelParameter,
) -> Result<(), ShardError> {
    let data = param_view.data.read();
    if world_end > data.len() {
        return Err(ShardError::SizeMismatch { expected: data.len(), found: world_end });
    }
    let slice = &data[world_start..world_end];
    if slice.len() != param.numel() {
        return Err(ShardError::SizeMismatch { expected: param.numel(), found: slice.len() });
    }
    param.set_data(slice);
    Ok(())
}
