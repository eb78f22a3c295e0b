use super::backend::CollectiveBackend;
use crate::error::{Result, ZeroError};
use crate::tensor::TensorElem;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::ops::Range;
use tracing::trace;
use zero_rs_kernels::cpu_add_assign;

/// A CPU-based collective backend.
///
/// Implements ring **reduce-scatter**, **all-gather** (and their composition,
/// **all-reduce**) plus a ring **broadcast** using `crossbeam` channels. Each
/// rank runs on its own thread and only talks to its two ring neighbours,
/// which is the same data movement NCCL performs between GPUs.
///
/// Elements travel as `f64` and are converted back on arrival, so any
/// `TensorElem` whose values fit in an `f64` round-trips exactly.
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Vec<f64>>, // Receive from rank - 1
    right_tx: Sender<Vec<f64>>,  // Send to rank + 1
}

impl CpuBackend {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Vec<f64>>,
        right_tx: Sender<Vec<f64>>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        }
    }

    /// A one-process group. Every collective is a local no-op.
    pub fn single() -> Self {
        let (tx, rx) = unbounded();
        Self::new(0, 1, rx, tx)
    }

    /// Builds a fully wired ring of `world_size` backends, indexed by rank.
    ///
    /// Channel `i` connects rank `i` to rank `i + 1`: rank `i` sends on it and
    /// rank `i + 1` receives from it.
    pub fn ring(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();

        (0..world_size)
            .map(|rank| {
                let left = (rank + world_size - 1) % world_size;
                Self::new(rank, world_size, rxs[left].clone(), txs[rank].clone())
            })
            .collect()
    }

    fn send<T: TensorElem>(&self, data: &[T]) -> Result<()> {
        let payload = data
            .iter()
            .map(|v| {
                v.to_f64()
                    .ok_or_else(|| ZeroError::Collective("element not representable as f64".into()))
            })
            .collect::<Result<Vec<f64>>>()?;
        self.right_tx
            .send(payload)
            .map_err(|_| ZeroError::Collective(format!("rank {}: right neighbour hung up", self.rank)))
    }

    fn recv<T: TensorElem>(&self, expected: usize) -> Result<Vec<T>> {
        let payload = self
            .left_rx
            .recv()
            .map_err(|_| ZeroError::Collective(format!("rank {}: left neighbour hung up", self.rank)))?;
        if payload.len() != expected {
            return Err(ZeroError::Collective(format!(
                "rank {}: expected segment of {} elements, received {}",
                self.rank,
                expected,
                payload.len()
            )));
        }
        payload
            .into_iter()
            .map(|v| {
                T::from_f64(v)
                    .ok_or_else(|| ZeroError::Collective("received element out of range".into()))
            })
            .collect()
    }

    /// Bounds of segment `idx` when `len` elements are split into `seg`-sized pieces.
    fn segment(len: usize, seg: usize, idx: usize) -> Range<usize> {
        let start = (idx * seg).min(len);
        let end = (start + seg).min(len);
        start..end
    }

    /// Ring reduce-scatter in place. Afterwards segment `rank` holds the full sum.
    ///
    /// Rank `r` sends segment `(r - step - 1) mod w` and accumulates segment
    /// `(r - step - 2) mod w`, so the chain for segment `k` starts at rank
    /// `k + 1` and ends, fully reduced, at rank `k`.
    fn ring_reduce_scatter<T: TensorElem>(&self, data: &mut [T], seg: usize) -> Result<()> {
        let w = self.world_size;
        let r = self.rank;
        for step in 0..w - 1 {
            let send_idx = (r + 2 * w - step - 1) % w;
            let recv_idx = (r + 2 * w - step - 2) % w;

            self.send(&data[Self::segment(data.len(), seg, send_idx)])?;

            let recv_range = Self::segment(data.len(), seg, recv_idx);
            let received: Vec<T> = self.recv(recv_range.len())?;
            cpu_add_assign(&mut data[recv_range], &received)?;
        }
        Ok(())
    }

    /// Ring all-gather in place, starting from "segment `rank` is valid".
    fn ring_all_gather<T: TensorElem>(&self, data: &mut [T], seg: usize) -> Result<()> {
        let w = self.world_size;
        let r = self.rank;
        for step in 0..w - 1 {
            let send_idx = (r + w - step) % w;
            let recv_idx = (r + 2 * w - step - 1) % w;

            self.send(&data[Self::segment(data.len(), seg, send_idx)])?;

            let recv_range = Self::segment(data.len(), seg, recv_idx);
            let received: Vec<T> = self.recv(recv_range.len())?;
            data[recv_range].copy_from_slice(&received);
        }
        Ok(())
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum<T: TensorElem>(&self, buffer: &mut [T]) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        trace!(rank = self.rank, len = buffer.len(), "ring all-reduce");

        // --- Phase 1: Reduce-Scatter ---
        // --- Phase 2: All-Gather ---
        let seg = buffer.len().div_ceil(self.world_size);
        self.ring_reduce_scatter(buffer, seg)?;
        self.ring_all_gather(buffer, seg)
    }

    fn reduce_scatter_sum<T: TensorElem>(&self, buffer: &[T]) -> Result<Vec<T>> {
        if buffer.len() % self.world_size != 0 {
            return Err(ZeroError::SizeMismatch {
                expected: buffer.len().div_ceil(self.world_size) * self.world_size,
                got: buffer.len(),
            });
        }
        if self.world_size <= 1 {
            return Ok(buffer.to_vec());
        }
        trace!(rank = self.rank, len = buffer.len(), "ring reduce-scatter");

        let seg = buffer.len() / self.world_size;
        let mut data = buffer.to_vec();
        self.ring_reduce_scatter(&mut data, seg)?;
        Ok(data[Self::segment(data.len(), seg, self.rank)].to_vec())
    }

    fn all_gather<T: TensorElem>(&self, shard: &[T]) -> Result<Vec<T>> {
        if self.world_size <= 1 {
            return Ok(shard.to_vec());
        }
        trace!(rank = self.rank, shard = shard.len(), "ring all-gather");

        let seg = shard.len();
        let mut data = vec![T::zero(); seg * self.world_size];
        let own = Self::segment(data.len(), seg, self.rank);
        data[own].copy_from_slice(shard);
        self.ring_all_gather(&mut data, seg)?;
        Ok(data)
    }

    fn broadcast<T: TensorElem>(&self, buffer: &mut [T], root: usize) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        if root >= self.world_size {
            return Err(ZeroError::InvalidConfig(format!(
                "broadcast root {} outside group of {}",
                root, self.world_size
            )));
        }
        // The payload travels root -> root + 1 -> ... and stops before wrapping back.
        if self.rank != root {
            let received: Vec<T> = self.recv(buffer.len())?;
            buffer.copy_from_slice(&received);
        }
        if (self.rank + 1) % self.world_size != root {
            self.send(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Runs `f` on every rank of a fresh ring and returns the results by rank.
    fn run_ring<R, F>(world_size: usize, f: F) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(CpuBackend) -> R + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = CpuBackend::ring(world_size)
            .into_iter()
            .map(|backend| {
                let f = f.clone();
                thread::spawn(move || f(backend))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_single_is_noop() {
        let backend = CpuBackend::single();
        let mut data = vec![1.0f32, 2.0];
        backend.all_reduce_sum(&mut data).unwrap();
        assert_eq!(data, vec![1.0, 2.0]);
        assert_eq!(backend.all_gather(&data).unwrap(), vec![1.0, 2.0]);
        assert_eq!(backend.reduce_scatter_sum(&data).unwrap(), vec![1.0, 2.0]);
        assert!(!backend.is_distributed());
    }

    #[test]
    fn test_all_reduce_uneven_length() {
        // 7 elements over 3 ranks: segments of 3, 3, 1.
        let results = run_ring(3, |backend| {
            let mut data: Vec<f32> = (0..7).map(|i| (i * (backend.rank() + 1)) as f32).collect();
            backend.all_reduce_sum(&mut data).unwrap();
            data
        });
        let expected: Vec<f32> = (0..7).map(|i| (i * 6) as f32).collect();
        for data in results {
            assert_eq!(data, expected);
        }
    }

    #[test]
    fn test_reduce_scatter_owns_own_segment() {
        let results = run_ring(4, |backend| {
            let data = vec![1.0f64 + backend.rank() as f64; 8];
            (backend.rank(), backend.reduce_scatter_sum(&data).unwrap())
        });
        for (_, shard) in results {
            assert_eq!(shard, vec![10.0, 10.0]);
        }

        // Distinct values per segment to check which segment lands where.
        let results = run_ring(2, |backend| {
            let data = vec![1.0f32, 2.0, 3.0, 4.0];
            (backend.rank(), backend.reduce_scatter_sum(&data).unwrap())
        });
        for (rank, shard) in results {
            if rank == 0 {
                assert_eq!(shard, vec![2.0, 4.0]);
            } else {
                assert_eq!(shard, vec![6.0, 8.0]);
            }
        }
    }

    #[test]
    fn test_reduce_scatter_rejects_uneven() {
        let backend = CpuBackend::ring(2).remove(0);
        let err = backend.reduce_scatter_sum(&[1.0f32; 3]).unwrap_err();
        assert!(matches!(err, ZeroError::SizeMismatch { expected: 4, got: 3 }));
    }

    #[test]
    fn test_all_gather_rank_order() {
        let results = run_ring(3, |backend| {
            let shard = vec![backend.rank() as f32; 2];
            backend.all_gather(&shard).unwrap()
        });
        for data in results {
            assert_eq!(data, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn test_broadcast_from_non_zero_root() {
        let results = run_ring(4, |backend| {
            let mut data = if backend.rank() == 2 {
                vec![7.0f32, 8.0]
            } else {
                vec![0.0, 0.0]
            };
            backend.broadcast(&mut data, 2).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![7.0, 8.0]);
        }
    }

    #[test]
    fn test_peer_hangup_is_error() {
        let mut ring = CpuBackend::ring(2);
        let rank1 = ring.pop().unwrap();
        let rank0 = ring.pop().unwrap();
        drop(rank1);
        let mut data = vec![1.0f32; 4];
        let err = rank0.all_reduce_sum(&mut data).unwrap_err();
        assert!(matches!(err, ZeroError::Collective(_)));
    }
}
