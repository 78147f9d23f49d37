//! DAA Sharded Optimizer - ZeRO-style distributed optimizer sharding core
//!
//! Partitions the gradient buffer of a replicated model across a
//! data-parallel group so each participant reduces only its assigned slice
//! of gradients, updates only the corresponding shard of optimizer state
//! and master parameters, and gathers the freshly updated parameters back
//! into a full replica.
//!
//! The inner step rule, loss scaling, the contiguous gradient buffer's
//! construction, the collective-communication transport, the model graph,
//! and the CLI/config loader are external collaborators (see
//! [`base_optimizer`], [`param`], [`collective`]); this crate owns the
//! index algebra, the group rewriting, the copy fast paths, the collective
//! schedule, and the checkpoint codec.

pub mod base_optimizer;
pub mod checkpoint;
pub mod collective;
pub mod copy;
pub mod dtype;
pub mod error;
pub mod groups;
pub mod optimizer;
pub mod param;
pub mod partition;
pub mod range;

pub use base_optimizer::{BaseOptimizer, GroupDescriptor, GroupShards, OptimizerStateDict, ParamState};
pub use checkpoint::{Checkpoint, LoadedCheckpoint, ScalerState, ShardRecord};
pub use collective::{CollectiveBackend, LoopbackBackend, LoopbackWorld};
pub use dtype::{Dtype, DTYPE_ORDER};
pub use error::{Result, ShardError};
pub use groups::ShardGroups;
pub use optimizer::{ShardedOptimizer, ShardedOptimizerConfig};
pub use param::{
    GradBufferDescriptor, ModelParameter, ParamBufferView, ParamId, ParamIndexEntry,
    ShardTensor, SimpleParameter, TensorParallelMarker,
};
pub use partition::{build_gbuf_range, build_param_range_map, world_partition, GbufRangeMap, ParamRangeMap};
pub use range::Range;
