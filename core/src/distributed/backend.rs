use crate::error::Result;
use crate::tensor::TensorElem;
use serde::{Deserialize, Serialize};

/// How a reduction combines contributions from the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    /// Plain sum across ranks.
    Sum,
    /// Sum divided by the group size.
    #[default]
    Average,
}

/// Abstraction for a distributed communication backend.
///
/// One backend instance is one process's membership in a process group.
/// Every collective blocks the caller until this rank's part of the
/// operation is complete, and all ranks must issue collectives in the same
/// order; the backend does not detect mismatched call sequences.
///
/// Implementations:
/// - [`CpuBackend`](super::cpu_backend::CpuBackend): ring algorithms over
///   channels, one thread per rank.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Sums `buffer` element-wise across the group, in place, on every rank.
    fn all_reduce_sum<T: TensorElem>(&self, buffer: &mut [T]) -> Result<()>;

    /// Sums `buffer` across the group and returns this rank's segment.
    ///
    /// `buffer.len()` must be a multiple of `world_size()`; rank `r` receives
    /// elements `[r * n / w, (r + 1) * n / w)` of the sum.
    fn reduce_scatter_sum<T: TensorElem>(&self, buffer: &[T]) -> Result<Vec<T>>;

    /// Concatenates equally sized shards from every rank, in rank order.
    fn all_gather<T: TensorElem>(&self, shard: &[T]) -> Result<Vec<T>>;

    /// Overwrites `buffer` on every rank with the contents held by `root`.
    fn broadcast<T: TensorElem>(&self, buffer: &mut [T], root: usize) -> Result<()>;

    /// Whether collectives actually move data.
    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }
}
