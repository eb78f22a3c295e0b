//! # Tensor-Parallel Layouts
//!
//! Tensor parallelism splits individual parameters across ranks. How a
//! parameter is split is described by a [`TensorSpec`]:
//!
//! - a [`DistSpec`]: replicated, or sharded along some dims into some number
//!   of pieces over a [`ProcessGroup`];
//! - a [`ParallelAction`]: which [`ComputePattern`] the owning op runs with.
//!
//! A module's math is only correct for particular *combinations* of its
//! parameters' layouts. A row-split linear layer (`W` split on the input dim)
//! produces partial sums and must keep its bias whole, while a column-split
//! one produces a slice of the output and needs its bias split the same way.
//! The [`ModuleRegistry`] records the valid combinations per module type, and
//! the [`ShardingValidator`] assigns and checks them across the module graph.

use serde::{Deserialize, Serialize};

pub mod registry;
pub mod validator;

pub use registry::{ModuleDescriptor, ModuleRegistry, ParamSpecs};
pub use validator::{ShardingValidator, DEFAULT_MODE};

/// Tensor-parallel algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComputePattern {
    /// 1D (Megatron-style) row/column splitting.
    TP1D,
    TP2D,
    TP2P5D,
    TP3D,
}

/// Ranks participating in a layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessGroup {
    ranks: Vec<usize>,
}

impl ProcessGroup {
    pub fn new(ranks: Vec<usize>) -> Self {
        Self { ranks }
    }

    /// Ranks `0..world_size`.
    pub fn world(world_size: usize) -> Self {
        Self::new((0..world_size).collect())
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }
}

/// Physical layout of a tensor across a process group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistSpec {
    Replicate {
        group: ProcessGroup,
    },
    /// Split along `dims` (negative counts from the last dim) into
    /// `num_partitions[i]` pieces along `dims[i]`.
    Shard {
        group: ProcessGroup,
        dims: Vec<isize>,
        num_partitions: Vec<usize>,
    },
}

impl DistSpec {
    pub fn replicate(group: ProcessGroup) -> Self {
        DistSpec::Replicate { group }
    }

    pub fn shard(group: ProcessGroup, dims: Vec<isize>, num_partitions: Vec<usize>) -> Self {
        DistSpec::Shard {
            group,
            dims,
            num_partitions,
        }
    }

    pub fn group(&self) -> &ProcessGroup {
        match self {
            DistSpec::Replicate { group } | DistSpec::Shard { group, .. } => group,
        }
    }
}

/// The compute pattern an op uses, plus auxiliary flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelAction {
    pub compute_pattern: ComputePattern,
    /// Gather the op's output back to a replicated tensor.
    pub gather_out: bool,
}

impl ParallelAction {
    pub fn new(compute_pattern: ComputePattern) -> Self {
        Self {
            compute_pattern,
            gather_out: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dist_spec: DistSpec,
    pub parallel_action: ParallelAction,
}

impl TensorSpec {
    pub fn new(dist_spec: DistSpec, parallel_action: ParallelAction) -> Self {
        Self {
            dist_spec,
            parallel_action,
        }
    }

    pub fn compute_pattern(&self) -> ComputePattern {
        self.parallel_action.compute_pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dist_spec_equality_covers_group_and_dims() {
        let g2 = ProcessGroup::world(2);
        let a = DistSpec::shard(g2.clone(), vec![0], vec![2]);
        assert_eq!(a, DistSpec::shard(g2.clone(), vec![0], vec![2]));
        assert_ne!(a, DistSpec::shard(g2.clone(), vec![-1], vec![2]));
        assert_ne!(a, DistSpec::shard(ProcessGroup::new(vec![2, 3]), vec![0], vec![2]));
        assert_ne!(a, DistSpec::replicate(g2));
    }

    #[test]
    fn test_parallel_action_defaults_to_gather() {
        let action = ParallelAction::new(ComputePattern::TP1D);
        assert!(action.gather_out);
        let spec = TensorSpec::new(DistSpec::replicate(ProcessGroup::world(1)), action);
        assert_eq!(spec.compute_pattern(), ComputePattern::TP1D);
        assert_eq!(spec.dist_spec.group().size(), 1);
    }
}
