//! Minimal end-to-end walkthrough: two simulated ranks share a model's
//! gradient buffer, each owning half of it, and run one full training step
//! through [`ShardedOptimizer`] over an in-process [`LoopbackBackend`].
//!
//! Run with `cargo run --example sharded_step`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, Level};

use daa_sharded_optimizer::base_optimizer::{BaseOptimizer, GroupDescriptor, GroupShards, OptimizerStateDict};
use daa_sharded_optimizer::collective::LoopbackWorld;
use daa_sharded_optimizer::param::{GradBufferDescriptor, ModelParameter, ParamId, SimpleParameter};
use daa_sharded_optimizer::{Dtype, Result, ShardedOptimizer, ShardedOptimizerConfig};

/// A plain SGD step rule, standing in for the real base optimizer this
/// crate always delegates to (spec's inner step-rule non-goal).
struct Sgd {
    param_groups: Vec<GroupDescriptor>,
}

impl BaseOptimizer for Sgd {
    fn param_groups(&self) -> &[GroupDescriptor] {
        &self.param_groups
    }

    fn set_param_groups(&mut self, groups: Vec<GroupDescriptor>) {
        self.param_groups = groups;
    }

    fn step(&mut self, groups: &mut [GroupShards<'_>]) -> std::result::Result<(), daa_sharded_optimizer::ShardError> {
        for group in groups.iter_mut() {
            let lr = group.descriptor.learning_rate;
            for shard in group.shards.iter_mut() {
                let Some(grad) = shard.grad.clone() else { continue };
                for (d, g) in shard.data.iter_mut().zip(grad.iter()) {
                    *d -= lr * g;
                }
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> OptimizerStateDict {
        OptimizerStateDict { param_groups: self.param_groups.clone(), state: HashMap::new() }
    }

    fn load_state_dict(&mut self, state: OptimizerStateDict) -> std::result::Result<(), daa_sharded_optimizer::ShardError> {
        self.param_groups = state.param_groups;
        Ok(())
    }
}

async fn run_rank(world: Arc<LoopbackWorld>, rank: usize) -> Result<Vec<f32>> {
    let backend = Arc::new(world.backend(rank));

    // A single float32 parameter of 4 elements, replicated on every rank,
    // world-partitioned 2/2 across the two participants.
    let mut param = SimpleParameter::new(0, Dtype::F32, vec![1.0, 2.0, 3.0, 4.0]);
    param.grad = Some(vec![0.1, 0.1, 0.1, 0.1]);

    let mut grad_buffer = GradBufferDescriptor::new(Dtype::F32, 4);
    grad_buffer.register(ParamId(0), 0, 0, 4);
    *grad_buffer.data.write() = vec![0.1, 0.1, 0.1, 0.1];

    let mut buffers = HashMap::new();
    buffers.insert(Dtype::F32, grad_buffer);

    let mut world_param_group = HashMap::new();
    world_param_group.insert(ParamId(0), 0);
    let mut params: HashMap<ParamId, &dyn ModelParameter> = HashMap::new();
    params.insert(ParamId(0), &param);

    let config = ShardedOptimizerConfig { world_size: 2, rank, ..Default::default() };
    let mut base = Sgd { param_groups: Vec::new() };
    base.set_param_groups(vec![GroupDescriptor { learning_rate: 0.5, ..Default::default() }]);

    let mut optimizer = ShardedOptimizer::new(
        config,
        backend,
        base,
        vec![buffers],
        &world_param_group,
        &params,
        |_| unreachable!("every param is covered by the partitioner's own range map"),
        Vec::new(),
        Vec::new(),
    )?;
    drop(params);

    let mut params_ref: HashMap<ParamId, &dyn ModelParameter> = HashMap::new();
    params_ref.insert(ParamId(0), &param);
    let mut param_out = param.clone();
    let mut params_mut: HashMap<ParamId, &mut dyn ModelParameter> = HashMap::new();
    params_mut.insert(ParamId(0), &mut param_out);

    optimizer.step(&params_ref, &mut params_mut).await?;
    info!(rank, data = ?param_out.data(), "step complete");
    Ok(param_out.data())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let world = LoopbackWorld::new(2);
    let mut handles = Vec::new();
    for rank in 0..2 {
        let world = world.clone();
        handles.push(tokio::spawn(async move { run_rank(world, rank).await }));
    }
    for handle in handles {
        let data = handle.await.expect("rank task panicked")?;
        println!("{data:?}");
    }
    Ok(())
}
