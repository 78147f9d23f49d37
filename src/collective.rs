//! The collective-backend contract (spec §6) and an in-process loopback
//! test double.
//!
//! `CollectiveBackend` is deliberately narrow: this crate's non-goal list
//! excludes collective *transport* (spec §1), so the trait only names the
//! four primitives spec §6 requires, plus `rank`/`world_size`. A single
//! data-parallel group is assumed — tensor/pipeline-parallel axes are a
//! pass-through the embedding framework handles before handing gradients to
//! this crate (spec §4.F "pass-through all-reduce").

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Barrier, Mutex};

use crate::error::ShardError;
use crate::partition::world_partition;

/// The collective primitives this crate needs from the network layer.
#[async_trait]
pub trait CollectiveBackend: Send + Sync {
    /// Sum `full_buffer` across the group and write this participant's
    /// owned shard of the result into `dst_slice`.
    async fn reduce_scatter(&self, dst_slice: &mut [f32], full_buffer: &[f32]) -> Result<(), ShardError>;

    /// Gather every participant's owned shard of `full_buffer` (each
    /// contributing `src_slice`) so every participant ends up with the
    /// complete buffer.
    async fn all_gather(&self, full_buffer: &mut [f32], src_slice: &[f32]) -> Result<(), ShardError>;

    /// Average `buffer` across the group, in place, at every participant.
    async fn all_reduce(&self, buffer: &mut [f32]) -> Result<(), ShardError>;

    /// Rendezvous with every other participant in the group.
    async fn barrier(&self) -> Result<(), ShardError>;

    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
}

/// Shared state for an in-process simulated collective group. Every
/// participant's [`LoopbackBackend`] handle points at the same world.
pub struct LoopbackWorld {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

impl LoopbackWorld {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        })
    }

    pub fn backend(self: &Arc<Self>, rank: usize) -> LoopbackBackend {
        LoopbackBackend { world: self.clone(), rank }
    }
}

/// Runs every participant's collective calls in-process over a shared,
/// mutex-guarded buffer table, rendezvousing on a [`Barrier`]. Generalizes
/// the teacher's `GradientManager::ring_allreduce` peer-sum math
/// (`p2p/gradient.rs`) from a hard-coded ring into addressable
/// reduce-scatter/all-gather primitives, so integration tests can drive the
/// full step pipeline across a simulated `W`-way world without real
/// networking.
pub struct LoopbackBackend {
    world: Arc<LoopbackWorld>,
    rank: usize,
}

impl LoopbackBackend {
    async fn publish_and_sum(&self, contribution: &[f32]) -> Vec<f32> {
        {
            let mut slots = self.world.slots.lock().await;
            slots[self.rank] = contribution.to_vec();
        }
        self.world.barrier.wait().await;

        let slots = self.world.slots.lock().await;
        let mut summed = vec![0.0f32; contribution.len()];
        for slot in slots.iter() {
            for (s, v) in summed.iter_mut().zip(slot.iter()) {
                *s += v;
            }
        }
        drop(slots);
        self.world.barrier.wait().await;
        summed
    }
}

#[async_trait]
impl CollectiveBackend for LoopbackBackend {
    async fn reduce_scatter(&self, dst_slice: &mut [f32], full_buffer: &[f32]) -> Result<(), ShardError> {
        let summed = self.publish_and_sum(full_buffer).await;

        let shards = world_partition(full_buffer.len(), self.world.world_size)?;
        let my_range = shards[self.rank];
        if dst_slice.len() != my_range.size() {
            return Err(ShardError::SizeMismatch { expected: my_range.size(), found: dst_slice.len() });
        }
        dst_slice.copy_from_slice(&summed[my_range.start..my_range.end]);
        Ok(())
    }

    async fn all_gather(&self, full_buffer: &mut [f32], src_slice: &[f32]) -> Result<(), ShardError> {
        let len = full_buffer.len();
        let shards = world_partition(len, self.world.world_size)?;
        let my_range = shards[self.rank];
        if src_slice.len() != my_range.size() {
            return Err(ShardError::SizeMismatch { expected: my_range.size(), found: src_slice.len() });
        }

        {
            let mut slots = self.world.slots.lock().await;
            slots[self.rank] = src_slice.to_vec();
        }
        self.world.barrier.wait().await;

        {
            let slots = self.world.slots.lock().await;
            for (r, range) in shards.iter().enumerate() {
                full_buffer[range.start..range.end].copy_from_slice(&slots[r]);
            }
        }
        self.world.barrier.wait().await;
        Ok(())
    }

    async fn all_reduce(&self, buffer: &mut [f32]) -> Result<(), ShardError> {
        let summed = self.publish_and_sum(buffer).await;
        let scale = 1.0 / self.world.world_size as f32;
        for (b, s) in buffer.iter_mut().zip(summed.iter()) {
            *b = s * scale;
        }
        Ok(())
    }

    async fn barrier(&self) -> Result<(), ShardError> {
        self.world.barrier.wait().await;
        Ok(())
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world.world_size
    }
}
