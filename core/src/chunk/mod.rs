//! # Chunks
//!
//! A chunk is one contiguous buffer that packs many tensors back to back.
//! Communication and residency are decided per chunk rather than per tensor:
//! one all-gather materializes every member, one reduction syncs every
//! member's gradient.
//!
//! ```text
//!  logical chunk (capacity 10, padded to 12 for world_size = 4)
//!  ┌──────── a ────────┬──── b ────┬─────┬─pad─┐
//!  │ 0 1 2 3 4         │ 5 6 7     │ 8 9 │     │
//!  └───────────────────┴───────────┴─────┴─────┘
//!   rank0: [0,3)  rank1: [3,6)  rank2: [6,9)  rank3: [9,12)
//! ```
//!
//! With distributed storage a chunk at rest holds only its rank's segment
//! ([`Residency::Shard`]). `access` all-gathers the full buffer, `release`
//! drops back to the segment once nobody uses it. Without distributed
//! storage the buffer is either fully resident or released entirely.
//!
//! Slot offsets never move once appended, so a tensor's position inside the
//! chunk is a stable identity for the whole run.

use crate::distributed::backend::{CollectiveBackend, ReduceOp};
use crate::error::{Result, ZeroError};
use crate::tensor::{Storage, TensorElem, TensorId, TensorState};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use tracing::debug;
use zero_rs_kernels::{cpu_div_scalar, overlap, padded_len, shard_range};

pub mod config;
pub mod manager;

pub use config::{AfterReduce, ChunkConfig};
pub use manager::{ChunkManager, MemoryStats};

/// Index of a chunk inside its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub usize);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// How much of a chunk's buffer is held by this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// No storage at all.
    Free,
    /// Only this rank's segment.
    Shard,
    /// The whole (padded) buffer.
    Full,
}

/// Where a chunk lives in the process group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub rank: usize,
    pub world_size: usize,
    /// Whether the chunk is sharded across the group at rest.
    pub distributed: bool,
}

impl Placement {
    pub fn local() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            distributed: false,
        }
    }

    pub fn from_backend<B: CollectiveBackend>(backend: &B, distributed: bool) -> Self {
        Self {
            rank: backend.rank(),
            world_size: backend.world_size(),
            distributed,
        }
    }
}

/// A tensor's fixed position inside a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub tensor: TensorId,
    pub offset: usize,
    pub len: usize,
    pub state: TensorState,
}

impl Slot {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// The resident part of one tensor.
///
/// `range` is expressed in the tensor's own element coordinates: a fully
/// gathered tensor yields `0..numel`, a sharded one the slice that overlaps
/// this rank's segment (possibly empty).
#[derive(Debug, PartialEq)]
pub struct LocalView<'a, T> {
    pub range: Range<usize>,
    pub data: &'a [T],
}

impl<T> LocalView<'_, T> {
    pub fn is_complete(&self, numel: usize) -> bool {
        self.range == (0..numel)
    }
}

/// A capacity-bounded buffer of packed tensor slots.
#[derive(Debug, Clone)]
pub struct Chunk<T: TensorElem, S: Storage<T> = Vec<T>> {
    id: ChunkId,
    group: String,
    capacity: usize,
    padded: usize,
    used: usize,
    slots: Vec<Slot>,
    payload: S,
    residency: Residency,
    access_count: usize,
    placement: Placement,
    _elem: PhantomData<T>,
}

impl<T, S> Chunk<T, S>
where
    T: TensorElem,
    S: Storage<T> + Default,
{
    /// Allocates an empty chunk.
    ///
    /// A distributed chunk starts as its zeroed local segment; a local one
    /// starts fully resident.
    pub fn new(id: ChunkId, group: impl Into<String>, capacity: usize, placement: Placement) -> Self {
        let padded = if placement.distributed {
            padded_len(capacity, placement.world_size)
        } else {
            capacity
        };
        let mut chunk = Self {
            id,
            group: group.into(),
            capacity,
            padded,
            used: 0,
            slots: Vec::new(),
            payload: S::default(),
            residency: Residency::Free,
            access_count: 0,
            placement,
            _elem: PhantomData,
        };
        if placement.distributed {
            let local = chunk.local_range();
            chunk.payload.resize(local.len());
            chunk.residency = Residency::Shard;
        } else {
            chunk.payload.resize(padded);
            chunk.residency = Residency::Full;
        }
        debug!(chunk = %id, group = %chunk.group, capacity, padded, distributed = placement.distributed, "chunk created");
        chunk
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements occupied by slots.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn access_count(&self) -> usize {
        self.access_count
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Elements currently held in memory by this process.
    pub fn resident_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_free(&self) -> bool {
        self.residency == Residency::Free
    }

    pub fn has_space(&self, numel: usize) -> bool {
        self.used + numel <= self.capacity
    }

    /// This rank's segment of the padded buffer.
    pub fn local_range(&self) -> Range<usize> {
        if self.placement.distributed {
            shard_range(self.padded, self.placement.rank, self.placement.world_size)
        } else {
            0..self.padded
        }
    }

    fn resident_range(&self) -> Option<Range<usize>> {
        match self.residency {
            Residency::Free => None,
            Residency::Shard => Some(self.local_range()),
            Residency::Full => Some(0..self.padded),
        }
    }

    fn slot_index(&self, tensor: TensorId) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| s.tensor == tensor)
            .ok_or(ZeroError::UnknownTensor(tensor))
    }

    pub fn slot(&self, tensor: TensorId) -> Result<&Slot> {
        let idx = self.slot_index(tensor)?;
        Ok(&self.slots[idx])
    }

    pub fn contains(&self, tensor: TensorId) -> bool {
        self.slots.iter().any(|s| s.tensor == tensor)
    }

    /// Packs `data` after the last slot.
    ///
    /// Only the part of the slot that is resident is written. On a sharded
    /// chunk every rank holds the same replicated `data`, so each rank keeps
    /// exactly its own segment and no communication is needed.
    pub fn append(&mut self, tensor: TensorId, data: &[T]) -> Result<()> {
        if self.contains(tensor) {
            return Err(ZeroError::DuplicateRegistration(tensor));
        }
        if !self.has_space(data.len()) {
            return Err(ZeroError::CapacityExceeded {
                tensor,
                numel: data.len(),
                capacity: self.capacity - self.used,
            });
        }
        if self.residency == Residency::Free {
            self.payload.resize(self.padded);
            self.residency = Residency::Full;
        }

        let slot = Slot {
            tensor,
            offset: self.used,
            len: data.len(),
            state: if self.residency == Residency::Full {
                TensorState::Hold
            } else {
                TensorState::Free
            },
        };
        self.write_resident(slot.range(), data);
        self.used += slot.len;
        self.slots.push(slot);
        Ok(())
    }

    /// Copies the part of `data` (laid out over `range`) that overlaps the
    /// resident storage.
    fn write_resident(&mut self, range: Range<usize>, data: &[T]) {
        let Some(resident) = self.resident_range() else {
            return;
        };
        if let Some(hit) = overlap(&range, &resident) {
            let src = &data[hit.start - range.start..hit.end - range.start];
            let dst = &mut self.payload.as_mut_slice()[hit.start - resident.start..hit.end - resident.start];
            dst.copy_from_slice(src);
        }
    }

    /// Makes the whole chunk resident and bumps the access counter.
    ///
    /// Returns `true` when this call had to materialize storage. Accessing an
    /// already gathered chunk only counts the access.
    pub fn access<B: CollectiveBackend>(&mut self, backend: &B) -> Result<bool> {
        let materialized = match self.residency {
            Residency::Full => false,
            Residency::Shard => {
                let full = backend.all_gather(self.payload.as_slice())?;
                if full.len() != self.padded {
                    return Err(ZeroError::SizeMismatch {
                        expected: self.padded,
                        got: full.len(),
                    });
                }
                self.payload.resize(self.padded);
                self.payload.copy_from_slice(&full);
                debug!(chunk = %self.id, len = self.padded, "chunk gathered");
                true
            }
            Residency::Free => {
                self.payload.resize(self.padded);
                debug!(chunk = %self.id, len = self.padded, "chunk re-allocated");
                true
            }
        };
        if materialized {
            self.residency = Residency::Full;
            for slot in &mut self.slots {
                if slot.state == TensorState::Free {
                    slot.state = TensorState::Hold;
                }
            }
        }
        self.access_count += 1;
        Ok(materialized)
    }

    /// Drops one access. Returns `true` if storage was given back.
    ///
    /// Storage is only dropped once the counter reaches zero and no member is
    /// in `Compute` or `ReadyForReduce`. A sharded chunk shrinks to its
    /// segment; a local chunk frees its buffer only when every member is
    /// already `Free`.
    pub fn release(&mut self) -> bool {
        if self.access_count == 0 {
            return false;
        }
        self.access_count -= 1;
        if self.access_count > 0 || self.residency != Residency::Full {
            return false;
        }
        if self.slots.iter().any(|s| s.state.is_busy()) {
            return false;
        }

        if self.placement.distributed {
            self.shrink_to_shard();
            true
        } else if self.slots.iter().all(|s| s.state == TensorState::Free) {
            self.payload.free();
            self.residency = Residency::Free;
            debug!(chunk = %self.id, "chunk freed");
            true
        } else {
            false
        }
    }

    fn shrink_to_shard(&mut self) {
        let local = self.local_range();
        let mut shard = S::default();
        shard.resize(local.len());
        shard.copy_from_slice(&self.payload.as_slice()[local.clone()]);
        self.payload = shard;
        self.residency = Residency::Shard;
        for slot in &mut self.slots {
            if slot.state == TensorState::Hold {
                slot.state = TensorState::Free;
            }
        }
        debug!(chunk = %self.id, shard = ?local, "chunk released to shard");
    }

    /// Applies a state-machine edge to one member.
    pub fn transition(&mut self, tensor: TensorId, to: TensorState) -> Result<TensorState> {
        let idx = self.slot_index(tensor)?;
        let from = self.slots[idx].state;
        if !from.can_transition_to(to) {
            return Err(ZeroError::InvalidStateTransition { tensor, from, to });
        }
        if to.is_resident() && self.residency != Residency::Full {
            return Err(ZeroError::ChunkFree(tensor));
        }
        self.slots[idx].state = to;
        Ok(from)
    }

    pub fn can_reduce(&self) -> bool {
        !self.slots.is_empty()
            && self
                .slots
                .iter()
                .all(|s| s.state == TensorState::ReadyForReduce)
    }

    /// Reduces the chunk across the group once every member is ready.
    ///
    /// Fails with [`ZeroError::PrematureReduce`] naming the first member that
    /// is not `ReadyForReduce`; nothing is modified in that case.
    pub fn reduce<B: CollectiveBackend>(
        &mut self,
        backend: &B,
        op: ReduceOp,
        after: AfterReduce,
    ) -> Result<()> {
        if let Some(slot) = self
            .slots
            .iter()
            .find(|s| s.state != TensorState::ReadyForReduce)
        {
            return Err(ZeroError::PrematureReduce {
                tensor: slot.tensor,
                state: slot.state,
            });
        }
        let world = backend.world_size();

        if self.placement.distributed && after == AfterReduce::Free {
            let mut shard = backend.reduce_scatter_sum(self.payload.as_slice())?;
            if op == ReduceOp::Average {
                cpu_div_scalar(&mut shard, world)?;
            }
            let mut payload = S::default();
            payload.resize(shard.len());
            payload.copy_from_slice(&shard);
            self.payload = payload;
            self.residency = Residency::Shard;
            self.access_count = 0;
        } else {
            backend.all_reduce_sum(self.payload.as_mut_slice())?;
            if op == ReduceOp::Average {
                cpu_div_scalar(self.payload.as_mut_slice(), world)?;
            }
        }

        let next = match after {
            AfterReduce::Hold => TensorState::Hold,
            AfterReduce::Free => TensorState::Free,
        };
        for slot in &mut self.slots {
            slot.state = next;
        }
        debug!(chunk = %self.id, ?op, ?after, resident = self.payload.len(), "chunk reduced");
        Ok(())
    }

    /// Overwrites a member's slot with `data`, keeping only the resident part.
    pub fn copy_into_slot(&mut self, tensor: TensorId, data: &[T]) -> Result<()> {
        let slot = *self.slot(tensor)?;
        if data.len() != slot.len {
            return Err(ZeroError::SizeMismatch {
                expected: slot.len,
                got: data.len(),
            });
        }
        if self.is_free() {
            return Err(ZeroError::ChunkFree(tensor));
        }
        self.write_resident(slot.range(), data);
        Ok(())
    }

    /// The full contents of a member. The chunk must be gathered and the
    /// member resident.
    pub fn tensor_data(&self, tensor: TensorId) -> Result<&[T]> {
        let slot = self.slot(tensor)?;
        if self.residency != Residency::Full || !slot.state.is_resident() {
            return Err(ZeroError::ChunkFree(tensor));
        }
        Ok(&self.payload.as_slice()[slot.range()])
    }

    /// Whatever part of a member this process currently holds.
    pub fn local_view(&self, tensor: TensorId) -> Result<LocalView<'_, T>> {
        let slot = self.slot(tensor)?;
        let resident = self.resident_range().ok_or(ZeroError::ChunkFree(tensor))?;
        let range = slot.range();
        Ok(match overlap(&range, &resident) {
            Some(hit) => LocalView {
                range: hit.start - range.start..hit.end - range.start,
                data: &self.payload.as_slice()[hit.start - resident.start..hit.end - resident.start],
            },
            None => LocalView {
                range: 0..0,
                data: &[],
            },
        })
    }
}
