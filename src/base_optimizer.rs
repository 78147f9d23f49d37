//! The base-optimizer contract (spec §6): the step rule, hyperparameters,
//! and state mapping this crate delegates to and never implements itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::param::ShardTensor;

/// Hyperparameters the base optimizer associates with one parameter group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub learning_rate: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
}

/// Opaque per-parameter optimizer state (moments, step counter, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamState {
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
    pub step: u64,
}

/// The base optimizer's full state, as handed to/from this crate's
/// checkpoint codec. `state` is keyed by `state_order`, the base
/// optimizer's own stable integer keying convention (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    pub param_groups: Vec<GroupDescriptor>,
    pub state: HashMap<u64, ParamState>,
}

/// One rewritten group handed to the base optimizer's step rule: its
/// hyperparameters, plus mutable access to every shard in
/// `shard_float[g] ++ shard_master_from_low_precision[g]` order (spec §3
/// "this order is a contract").
pub struct GroupShards<'a> {
    pub descriptor: &'a GroupDescriptor,
    pub shards: Vec<&'a mut ShardTensor>,
}

/// The contract this crate requires from the inner step-rule optimizer
/// (Adam, SGD, ...). The core never implements this itself (spec §1).
pub trait BaseOptimizer: Send + Sync {
    fn param_groups(&self) -> &[GroupDescriptor];
    fn set_param_groups(&mut self, groups: Vec<GroupDescriptor>);
    fn step(&mut self, groups: &mut [GroupShards<'_>]) -> Result<(), ShardError>;
    fn state_dict(&self) -> OptimizerStateDict;
    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<(), ShardError>;
}

#[cfg(test)]
pub(crate) struct MockBaseOptimizer {
    pub param_groups: Vec<GroupDescriptor>,
    pub state: Vec<ParamState>,
    /// When true, `step` leaves shard data unchanged (spec §8 scenario E's
    /// "zeroed step-rule").
    pub identity: bool,
}

#[cfg(test)]
impl MockBaseOptimizer {
    pub fn new(identity: bool) -> Self {
        Self { param_groups: Vec::new(), state: Vec::new(), identity }
    }
}

#[cfg(test)]
impl BaseOptimizer for MockBaseOptimizer {
    fn param_groups(&self) -> &[GroupDescriptor] {
        &self.param_groups
    }

    fn set_param_groups(&mut self, groups: Vec<GroupDescriptor>) {
        self.param_groups = groups;
    }

    fn step(&mut self, groups: &mut [GroupShards<'_>]) -> Result<(), ShardError> {
        self.state.clear();
        for group in groups.iter_mut() {
            let lr = group.descriptor.learning_rate;
            for shard in group.shards.iter_mut() {
                let grad = shard.grad.clone().unwrap_or_else(|| vec![0.0; shard.data.len()]);
                let mut state = ParamState {
                    exp_avg: vec![0.0; shard.data.len()],
                    exp_avg_sq: vec![0.0; shard.data.len()],
                    step: 1,
                };
                if !self.identity {
                    for (i, (d, g)) in shard.data.iter_mut().zip(grad.iter()).enumerate() {
                        state.exp_avg[i] = *g;
                        state.exp_avg_sq[i] = g * g;
                        *d -= lr * g;
                    }
                }
                self.state.push(state);
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> OptimizerStateDict {
        OptimizerStateDict {
            param_groups: self.param_groups.clone(),
            state: self.state.iter().enumerate().map(|(i, s)| (i as u64, s.clone())).collect(),
        }
    }

    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<(), ShardError> {
        self.param_groups = state.param_groups;
        let mut ordered: Vec<(u64, ParamState)> = state.state.into_iter().collect();
        ordered.sort_by_key(|(order, _)| *order);
        self.state = ordered.into_iter().map(|(_, s)| s).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_step_leaves_data_unchanged() {
        let mut opt = MockBaseOptimizer::new(true);
        let descriptor = GroupDescriptor { learning_rate: 0.1, ..Default::default() };
        let mut shard = ShardTensor { data: vec![1.0, 2.0], grad: Some(vec![0.5, 0.5]), ..Default::default() };
        {
            let mut groups = [GroupShards { descriptor: &descriptor, shards: vec![&mut shard] }];
            opt.step(&mut groups).unwrap();
        }
        assert_eq!(shard.data, vec![1.0, 2.0]);
    }

    #[test]
    fn non_identity_step_applies_gradient_descent() {
        let mut opt = MockBaseOptimizer::new(false);
        let descriptor = GroupDescriptor { learning_rate: 0.1, ..Default::default() };
        let mut shard = ShardTensor { data: vec![1.0, 2.0], grad: Some(vec![1.0, 1.0]), ..Default::default() };
        {
            let mut groups = [GroupShards { descriptor: &descriptor, shards: vec![&mut shard] }];
            opt.step(&mut groups).unwrap();
        }
        assert_eq!(shard.data, vec![0.9, 1.9]);
    }

    #[test]
    fn state_dict_round_trips() {
        let mut opt = MockBaseOptimizer::new(false);
        opt.set_param_groups(vec![GroupDescriptor { learning_rate: 0.01, ..Default::default() }]);
        let descriptor = opt.param_groups()[0].clone();
        let mut shard = ShardTensor { data: vec![1.0], grad: Some(vec![1.0]), ..Default::default() };
        {
            let mut groups = [GroupShards { descriptor: &descriptor, shards: vec![&mut shard] }];
            opt.step(&mut groups).unwrap();
        }
        let dict = opt.state_dict();

        let mut restored = MockBaseOptimizer::new(false);
        restored.load_state_dict(dict.clone()).unwrap();
        assert_eq!(restored.state_dict().param_groups, dict.param_groups);
        assert_eq!(restored.state.len(), opt.state.len());
    }
}
