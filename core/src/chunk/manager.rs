use super::{Chunk, ChunkConfig, ChunkId, LocalView, Placement, Residency};
use crate::distributed::backend::CollectiveBackend;
use crate::error::{Result, ZeroError};
use crate::tensor::{TensorElem, TensorId, TensorState};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace, warn};

/// Resident element counts, overall and per group tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total: usize,
    pub per_group: BTreeMap<String, usize>,
}

/// Process-wide registry of chunks.
///
/// Every managed tensor lives in exactly one chunk for the lifetime of the
/// manager. Methods take `&mut self`, so callers on the compute thread are
/// serialized and a chunk is never gathered twice concurrently: a second
/// `access_chunk` joins the already gathered state and only bumps the count.
///
/// # Example
///
/// ```rust
/// use zero_rs::chunk::{ChunkConfig, ChunkManager};
/// use zero_rs::distributed::CpuBackend;
/// use zero_rs::tensor::{TensorId, TensorState};
///
/// let mut manager = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(8), false), CpuBackend::single())?;
/// let w = TensorId::new();
/// manager.append_tensor(w, &[1.0; 4], "params")?;
///
/// manager.access_chunk(w)?;
/// manager.trans_tensor_state(w, TensorState::Compute)?;
/// assert_eq!(manager.tensor_data(w)?, &[1.0; 4]);
/// manager.trans_tensor_state(w, TensorState::Hold)?;
/// manager.release_chunk(w)?;
/// # Ok::<(), zero_rs::error::ZeroError>(())
/// ```
pub struct ChunkManager<T: TensorElem, B: CollectiveBackend> {
    config: ChunkConfig,
    backend: B,
    chunks: Vec<Chunk<T>>,
    groups: HashMap<String, Vec<ChunkId>>,
    tensor_chunk: HashMap<TensorId, ChunkId>,
    lazy_release: Vec<TensorId>,
}

impl<T, B> ChunkManager<T, B>
where
    T: TensorElem,
    B: CollectiveBackend,
{
    pub fn new(config: ChunkConfig, backend: B) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            chunks: Vec::new(),
            groups: HashMap::new(),
            tensor_chunk: HashMap::new(),
            lazy_release: Vec::new(),
        })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Registers `tensor` with its initial contents.
    ///
    /// The tensor goes into the first chunk of `group` with enough room left.
    /// When none has, a new chunk of `chunk_size` elements is opened, or one
    /// sized exactly to the tensor if no chunk size is configured.
    pub fn append_tensor(&mut self, tensor: TensorId, data: &[T], group: &str) -> Result<ChunkId> {
        if self.tensor_chunk.contains_key(&tensor) {
            return Err(ZeroError::DuplicateRegistration(tensor));
        }
        let numel = data.len();
        if let Some(capacity) = self.config.chunk_size {
            if numel > capacity {
                return Err(ZeroError::CapacityExceeded {
                    tensor,
                    numel,
                    capacity,
                });
            }
        }

        let existing = self.config.chunk_size.and_then(|_| {
            self.groups
                .get(group)
                .and_then(|ids| ids.iter().copied().find(|id| self.chunks[id.0].has_space(numel)))
        });
        let chunk_id = match existing {
            Some(id) => id,
            None => self.open_chunk(group, self.config.chunk_size.unwrap_or(numel)),
        };

        self.chunks[chunk_id.0].append(tensor, data)?;
        self.tensor_chunk.insert(tensor, chunk_id);
        trace!(%tensor, chunk = %chunk_id, group, numel, "tensor appended");
        Ok(chunk_id)
    }

    fn open_chunk(&mut self, group: &str, capacity: usize) -> ChunkId {
        let id = ChunkId(self.chunks.len());
        let placement = Placement::from_backend(&self.backend, self.config.distributed_storage);
        self.chunks.push(Chunk::new(id, group, capacity, placement));
        self.groups.entry(group.to_string()).or_default().push(id);
        id
    }

    pub fn chunk_of(&self, tensor: TensorId) -> Result<ChunkId> {
        self.tensor_chunk
            .get(&tensor)
            .copied()
            .ok_or(ZeroError::UnknownTensor(tensor))
    }

    fn owner(&self, tensor: TensorId) -> Result<&Chunk<T>> {
        let id = self.chunk_of(tensor)?;
        Ok(&self.chunks[id.0])
    }

    fn owner_mut(&mut self, tensor: TensorId) -> Result<&mut Chunk<T>> {
        let id = self.chunk_of(tensor)?;
        Ok(&mut self.chunks[id.0])
    }

    pub fn is_registered(&self, tensor: TensorId) -> bool {
        self.tensor_chunk.contains_key(&tensor)
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk<T>> {
        self.chunks.get(id.0)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks opened for `group`, in creation order.
    pub fn group_chunks(&self, group: &str) -> &[ChunkId] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Gathers the chunk holding `tensor` (if needed) and counts the access.
    pub fn access_chunk(&mut self, tensor: TensorId) -> Result<()> {
        let id = self.chunk_of(tensor)?;
        let chunk = &mut self.chunks[id.0];
        if chunk.access(&self.backend)? {
            debug!(chunk = %id, %tensor, "chunk materialized on access");
        }
        Ok(())
    }

    pub fn release_chunk(&mut self, tensor: TensorId) -> Result<()> {
        let chunk = self.owner_mut(tensor)?;
        chunk.release();
        Ok(())
    }

    pub fn trans_tensor_state(&mut self, tensor: TensorId, state: TensorState) -> Result<()> {
        let from = self.owner_mut(tensor)?.transition(tensor, state)?;
        trace!(%tensor, ?from, to = ?state, "tensor state");
        Ok(())
    }

    pub fn tensor_state(&self, tensor: TensorId) -> Result<TensorState> {
        Ok(self.owner(tensor)?.slot(tensor)?.state)
    }

    pub fn can_reduce_chunk(&self, tensor: TensorId) -> Result<bool> {
        Ok(self.owner(tensor)?.can_reduce())
    }

    /// Reduces the chunk holding `tensor` with the configured op and policy.
    pub fn reduce_chunk(&mut self, tensor: TensorId) -> Result<()> {
        let id = self.chunk_of(tensor)?;
        let (op, after) = (self.config.reduce_op, self.config.after_reduce);
        self.chunks[id.0].reduce(&self.backend, op, after)
    }

    pub fn copy_tensor_to_chunk_slice(&mut self, tensor: TensorId, data: &[T]) -> Result<()> {
        self.owner_mut(tensor)?.copy_into_slot(tensor, data)
    }

    /// Queues a `release_chunk` for the end of the current pass.
    pub fn add_lazy_release(&mut self, tensor: TensorId) -> Result<()> {
        self.chunk_of(tensor)?;
        self.lazy_release.push(tensor);
        Ok(())
    }

    pub fn pending_lazy_releases(&self) -> usize {
        self.lazy_release.len()
    }

    /// Runs every queued release, in queue order.
    pub fn exec_lazy_release(&mut self) -> Result<()> {
        let queued = std::mem::take(&mut self.lazy_release);
        if !queued.is_empty() {
            debug!(count = queued.len(), "executing lazy releases");
        }
        for tensor in queued {
            let chunk = self.owner_mut(tensor)?;
            chunk.release();
            if chunk.access_count() == 0
                && chunk.residency() == Residency::Full
                && chunk.slots().iter().any(|s| s.state.is_busy())
            {
                warn!(chunk = %chunk.id(), %tensor, "deferred release kept chunk resident: member still busy");
            }
        }
        Ok(())
    }

    pub fn is_chunk_free(&self, tensor: TensorId) -> Result<bool> {
        Ok(self.owner(tensor)?.is_free())
    }

    /// The full contents of a resident tensor.
    pub fn tensor_data(&self, tensor: TensorId) -> Result<&[T]> {
        self.owner(tensor)?.tensor_data(tensor)
    }

    /// The part of `tensor` this process currently holds.
    pub fn local_view(&self, tensor: TensorId) -> Result<LocalView<'_, T>> {
        self.owner(tensor)?.local_view(tensor)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        for chunk in &self.chunks {
            let resident = chunk.resident_len();
            stats.total += resident;
            *stats.per_group.entry(chunk.group().to_string()).or_default() += resident;
        }
        stats
    }
}
