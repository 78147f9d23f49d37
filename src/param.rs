//! The external parameter/buffer contract (spec §6) and the owned shard
//! tensors this crate allocates.
//!
//! Tensors throughout this crate are represented as flat `Vec<f32>`, the
//! same stand-in the surrounding `daa-compute` family uses for
//! `ModelParameters`/`Gradient` payloads. Shard views never alias the
//! model parameter's storage through a raw pointer (spec §9): they hold an
//! owned snapshot plus the `Range` needed to copy changes back, and the
//! optimizer looks parameters up by [`ParamId`] through a registry rather
//! than keeping a borrowed or reference-counted handle to them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::dtype::Dtype;
use crate::error::ShardError;

/// Opaque, stable handle to a parameter. Stands in for the identity-based
/// dict keys the original Python implementation uses (`param_world_index_map`
/// keyed by the parameter object itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub u64);

/// Marker attributes carried from a model parameter onto every shard cut
/// from it (spec §6 "optional marker attributes").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TensorParallelMarker {
    pub partition_dim: Option<i32>,
    pub partition_stride: Option<usize>,
}

/// The contract this crate requires from each registered model parameter.
pub trait ModelParameter: Send + Sync {
    fn id(&self) -> ParamId;
    fn dtype(&self) -> Dtype;
    fn numel(&self) -> usize;
    fn requires_grad(&self) -> bool;
    fn shared(&self) -> bool;
    fn tensor_parallel_marker(&self) -> Option<TensorParallelMarker>;
    /// Flattened parameter data.
    fn data(&self) -> Vec<f32>;
    /// Overwrite flattened parameter data (called after `gather_params`).
    fn set_data(&mut self, values: &[f32]);
    /// Flattened `main_grad`, if autograd has populated it this step.
    fn main_grad(&self) -> Option<Vec<f32>>;
    /// Overwrite `main_grad` (called by `zero_grad`).
    fn set_main_grad(&mut self, values: Option<Vec<f32>>);
}

/// An owned tensor this crate allocates: a master shard, or a snapshot of a
/// model parameter's shard. `grad` mirrors the parameter's `main_grad`
/// field once the grads→main copy has run.
#[derive(Debug, Clone, Default)]
pub struct ShardTensor {
    pub data: Vec<f32>,
    pub grad: Option<Vec<f32>>,
    pub shared: bool,
    pub tensor_parallel_marker: Option<TensorParallelMarker>,
}

impl ShardTensor {
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// A parameter's placement within a (replica, dtype) gradient buffer, as
/// given by the distributed-data-parallel layer (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamIndexEntry {
    pub world_order: u64,
    pub world_start: usize,
    pub world_end: usize,
}

/// A flat, contiguous, padded per-(replica, dtype) gradient buffer, as
/// contributed by the distributed-data-parallel layer (spec §6). `numel`
/// elements belong to registered parameters (possibly fewer than
/// `padded_numel`, since the buffer is padded to a multiple of the
/// world size).
pub struct GradBufferDescriptor {
    pub dtype: Dtype,
    pub padded_numel: usize,
    pub data: Arc<RwLock<Vec<f32>>>,
    pub param_index: HashMap<ParamId, ParamIndexEntry>,
}

impl GradBufferDescriptor {
    pub fn new(dtype: Dtype, padded_numel: usize) -> Self {
        Self {
            dtype,
            padded_numel,
            data: Arc::new(RwLock::new(vec![0.0; padded_numel])),
            param_index: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: ParamId, world_order: u64, world_start: usize, world_end: usize) {
        self.param_index.insert(id, ParamIndexEntry { world_order, world_start, world_end });
    }
}

/// A reinterpret-view of a gradient buffer's storage as parameter-typed
/// elements (spec §4.D). In this crate's `Vec<f32>`-based tensor model the
/// "reinterpretation" is a shared handle to the same storage rather than a
/// byte-level pointer cast; the dtype-width precondition is still enforced
/// so the error path (`BufferAliasUnsafe`) exercises the same logic a
/// pointer-cast implementation would need.
pub struct ParamBufferView {
    pub dtype: Dtype,
    pub numel: usize,
    pub data: Arc<RwLock<Vec<f32>>>,
}

impl ParamBufferView {
    /// Build the parameter-buffer view sharing storage with `grad_buffer`.
    pub fn from_grad_buffer(grad_buffer: &GradBufferDescriptor, param_dtype: Dtype) -> Result<Self, ShardError> {
        let param_size = param_dtype.size_bytes();
        let grad_size = grad_buffer.dtype.size_bytes();
        if param_size > grad_size {
            return Err(ShardError::BufferAliasUnsafe { param_size, grad_size });
        }
        Ok(Self {
            dtype: param_dtype,
            numel: grad_buffer.padded_numel,
            data: grad_buffer.data.clone(),
        })
    }
}

/// A plain in-memory [`ModelParameter`] backed by owned `Vec<f32>` storage.
/// Used throughout this crate's tests and available to embedders that don't
/// need a real tensor library behind the trait (e.g. for exercising the
/// sharding core against synthetic data).
#[derive(Debug, Clone)]
pub struct SimpleParameter {
    pub id: ParamId,
    pub dtype: Dtype,
    pub data: Vec<f32>,
    pub grad: Option<Vec<f32>>,
    pub shared: bool,
    pub tensor_parallel_marker: Option<TensorParallelMarker>,
}

impl SimpleParameter {
    pub fn new(id: u64, dtype: Dtype, data: Vec<f32>) -> Self {
        Self { id: ParamId(id), dtype, data, grad: None, shared: false, tensor_parallel_marker: None }
    }
}

impl ModelParameter for SimpleParameter {
    fn id(&self) -> ParamId {
        self.id
    }

    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn numel(&self) -> usize {
        self.data.len()
    }

    fn requires_grad(&self) -> bool {
        true
    }

    fn shared(&self) -> bool {
        self.shared
    }

    fn tensor_parallel_marker(&self) -> Option<TensorParallelMarker> {
        self.tensor_parallel_marker.clone()
    }

    fn data(&self) -> Vec<f32> {
        self.data.clone()
    }

    fn set_data(&mut self, values: &[f32]) {
        self.data = values.to_vec();
    }

    fn main_grad(&self) -> Option<Vec<f32>> {
        self.grad.clone()
    }

    fn set_main_grad(&mut self, values: Option<Vec<f32>>) {
        self.grad = values;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_buffer_view_rejects_wider_param_dtype() {
        let mut gbuf = GradBufferDescriptor::new(Dtype::F16, 8);
        gbuf.register(ParamId(1), 0, 0, 8);
        let err = ParamBufferView::from_grad_buffer(&gbuf, Dtype::F32).unwrap_err();
        assert!(matches!(err, ShardError::BufferAliasUnsafe { .. }));
    }

    #[test]
    fn param_buffer_view_shares_storage() {
        let gbuf = GradBufferDescriptor::new(Dtype::F32, 8);
        let view = ParamBufferView::from_grad_buffer(&gbuf, Dtype::F16).unwrap();
        gbuf.data.write()[0] = 42.0;
        assert_eq!(view.data.read()[0], 42.0);
    }
}
