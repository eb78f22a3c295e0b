use super::backend::{CollectiveBackend, ReduceOp};
use crate::autograd::{accumulate_grad, HookTable, Network, OpContext};
use crate::chunk::{AfterReduce, ChunkConfig, ChunkManager, LocalView};
use crate::error::{Result, ZeroError};
use crate::nn::ModuleGraph;
use crate::tensor::{TensorElem, TensorId, TensorState};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use zero_rs_kernels::cpu_div_scalar;

/// Group tag of the compute copies (what forward/backward read).
pub const COMPUTE_GROUP: &str = "compute_param";
/// Group tag of the master copies (what an optimizer updates).
pub const MASTER_GROUP: &str = "master_param";

/// Context that reads parameters out of chunks and pushes gradients back in.
///
/// Around every load the chunk is accessed and the tensor goes
/// `Hold -> Compute -> Hold`; the matching release is deferred to the end of
/// the pass. Gradients of hooked parameters are reduced through the chunk
/// the moment they arrive.
struct ChunkedContext<'a, T: TensorElem, B: CollectiveBackend> {
    graph: &'a mut ModuleGraph<T>,
    manager: &'a mut ChunkManager<T, B>,
    hooks: &'a HookTable,
    emitted: &'a mut HashSet<TensorId>,
}

impl<T: TensorElem, B: CollectiveBackend> ChunkedContext<'_, T, B> {
    fn reduce_grad(&mut self, param: TensorId, mut grad: Vec<T>) -> Result<()> {
        let world_size = self.manager.backend().world_size();
        self.manager.access_chunk(param)?;
        self.manager
            .trans_tensor_state(param, TensorState::ReadyForReduce)?;
        // An averaging reduce divides once itself.
        if self.manager.config().reduce_op == ReduceOp::Sum && world_size > 1 {
            cpu_div_scalar(&mut grad, world_size)?;
        }
        self.manager.copy_tensor_to_chunk_slice(param, &grad)?;
        if self.manager.can_reduce_chunk(param)? {
            self.manager.reduce_chunk(param)?;
        }
        self.manager.release_chunk(param)
    }
}

impl<T: TensorElem, B: CollectiveBackend> OpContext<T> for ChunkedContext<'_, T, B> {
    fn load(&mut self, param: TensorId) -> Result<Vec<T>> {
        if !self.manager.is_registered(param) {
            return Ok(self.graph.parameter(param)?.data.clone());
        }
        self.manager.access_chunk(param)?;
        self.manager.trans_tensor_state(param, TensorState::Compute)?;
        let data = self.manager.tensor_data(param)?.to_vec();
        self.manager.trans_tensor_state(param, TensorState::Hold)?;
        self.manager.add_lazy_release(param)?;
        Ok(data)
    }

    fn emit_grad(&mut self, param: TensorId, grad: Vec<T>) -> Result<()> {
        let grad = if self.hooks.contains(param) {
            self.reduce_grad(param, grad)?;
            self.emitted.insert(param);
            Vec::new()
        } else {
            grad
        };
        accumulate_grad(&mut self.graph.parameter_mut(param)?.grad, grad)
    }
}

/// Memory-partitioned data parallelism.
///
/// Every trainable parameter is moved into a [`ChunkManager`] twice: a
/// compute copy (group [`COMPUTE_GROUP`]) that forward and backward read,
/// and a master copy (group [`MASTER_GROUP`]) that an optimizer would update.
/// Both copies use the same element type here.
///
/// Gradients overwrite the compute copy's slot and are reduced chunk by
/// chunk as soon as the last member of a chunk is ready, then released, so
/// at most the chunks in flight are ever gathered. Before the next forward
/// the compute copies are refreshed from the masters.
///
/// After [`backward`](Self::backward), [`grad`](Self::grad) exposes each
/// parameter's reduced gradient as a view into its chunk (only this rank's
/// part when chunks are sharded). A parameter that produced no gradient
/// while other members of its chunk did is reduced as zeros, so that every
/// rank issues the same collectives.
pub struct ChunkedDataParallel<T: TensorElem, N: Network<T>, B: CollectiveBackend> {
    network: N,
    graph: ModuleGraph<T>,
    manager: ChunkManager<T, B>,
    hooks: HookTable,
    masters: Vec<(TensorId, TensorId)>,
    /// Members of compute chunks reduced in the last backward.
    reduced: HashSet<TensorId>,
}

impl<T, N, B> ChunkedDataParallel<T, N, B>
where
    T: TensorElem,
    N: Network<T>,
    B: CollectiveBackend,
{
    pub fn new(network: N, mut graph: ModuleGraph<T>, backend: B, config: ChunkConfig) -> Result<Self> {
        if config.after_reduce == AfterReduce::Free && !config.distributed_storage {
            // Freed local chunks would drop the only copy of the reduced gradient.
            return Err(ZeroError::InvalidConfig(
                "after_reduce = free requires distributed_storage".into(),
            ));
        }
        let mut manager = ChunkManager::new(config, backend)?;
        let mut hooks = HookTable::new();
        let mut masters = Vec::new();

        for p in graph.parameters_mut().filter(|p| p.requires_grad) {
            let data = std::mem::take(&mut p.data);
            manager.append_tensor(p.id, &data, COMPUTE_GROUP)?;
            let master = TensorId::new();
            manager.append_tensor(master, &data, MASTER_GROUP)?;
            hooks.register(p.id);
            masters.push((p.id, master));
        }
        info!(
            rank = manager.backend().rank(),
            params = masters.len(),
            compute_chunks = manager.group_chunks(COMPUTE_GROUP).len(),
            master_chunks = manager.group_chunks(MASTER_GROUP).len(),
            "chunked data parallel wrapper ready"
        );

        Ok(Self {
            network,
            graph,
            manager,
            hooks,
            masters,
            reduced: HashSet::new(),
        })
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn graph(&self) -> &ModuleGraph<T> {
        &self.graph
    }

    pub fn manager(&self) -> &ChunkManager<T, B> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ChunkManager<T, B> {
        &mut self.manager
    }

    /// Identity of the master copy of `param`.
    pub fn master_of(&self, param: TensorId) -> Option<TensorId> {
        self.masters
            .iter()
            .find(|(p, _)| *p == param)
            .map(|&(_, m)| m)
    }

    /// Copies every master into its compute slot, for compute chunks that
    /// still hold storage. Each master chunk is gathered at most once.
    fn refresh_compute_copies(&mut self) -> Result<()> {
        for &(param, master) in &self.masters {
            if self.manager.is_chunk_free(param)? {
                continue;
            }
            self.manager.access_chunk(master)?;
            self.manager.add_lazy_release(master)?;
            let data = self.manager.tensor_data(master)?.to_vec();
            self.manager.copy_tensor_to_chunk_slice(param, &data)?;
        }
        self.manager.exec_lazy_release()
    }

    /// Finishes every compute chunk whose reduce was started but not
    /// completed, by staging zeros for the members that emitted nothing.
    fn reduce_partial_chunks(&mut self) -> Result<()> {
        for id in self.manager.group_chunks(COMPUTE_GROUP).to_vec() {
            let Some(chunk) = self.manager.chunk(id) else {
                continue;
            };
            if !chunk.slots().iter().any(|s| s.state == TensorState::ReadyForReduce) {
                continue;
            }
            let silent: Vec<(TensorId, usize)> = chunk
                .slots()
                .iter()
                .filter(|s| s.state != TensorState::ReadyForReduce)
                .map(|s| (s.tensor, s.len))
                .collect();
            warn!(chunk = %id, silent = silent.len(), "members without gradient reduced as zeros");

            for (tensor, len) in silent {
                self.manager.access_chunk(tensor)?;
                if self.manager.tensor_state(tensor)? == TensorState::Free {
                    self.manager.trans_tensor_state(tensor, TensorState::Hold)?;
                }
                self.manager
                    .trans_tensor_state(tensor, TensorState::ReadyForReduce)?;
                self.manager
                    .copy_tensor_to_chunk_slice(tensor, &vec![T::zero(); len])?;
                if self.manager.can_reduce_chunk(tensor)? {
                    self.manager.reduce_chunk(tensor)?;
                }
                self.manager.release_chunk(tensor)?;
            }
        }
        Ok(())
    }

    pub fn forward(&mut self, input: &[T]) -> Result<Vec<T>> {
        for p in self.graph.parameters_mut() {
            p.grad = None;
        }
        self.reduced.clear();
        self.refresh_compute_copies()?;

        let mut emitted = HashSet::new();
        let output = {
            let mut ctx = ChunkedContext {
                graph: &mut self.graph,
                manager: &mut self.manager,
                hooks: &self.hooks,
                emitted: &mut emitted,
            };
            self.network.forward(input, &mut ctx)?
        };
        self.manager.exec_lazy_release()?;
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &[T]) -> Result<Vec<T>> {
        let mut emitted = HashSet::new();
        let grad_input = {
            let mut ctx = ChunkedContext {
                graph: &mut self.graph,
                manager: &mut self.manager,
                hooks: &self.hooks,
                emitted: &mut emitted,
            };
            self.network.backward(grad_output, &mut ctx)?
        };
        self.reduce_partial_chunks()?;
        self.manager.exec_lazy_release()?;
        for p in self.graph.parameters_mut() {
            if self.hooks.contains(p.id) {
                p.grad = None;
            }
        }

        self.reduced.clear();
        for &id in self.manager.group_chunks(COMPUTE_GROUP) {
            let Some(chunk) = self.manager.chunk(id) else {
                continue;
            };
            if chunk.slots().iter().any(|s| emitted.contains(&s.tensor)) {
                self.reduced.extend(chunk.slots().iter().map(|s| s.tensor));
            }
        }
        debug!(stats = ?self.manager.memory_stats(), "backward finished");
        Ok(grad_input)
    }

    /// The reduced gradient of `param` as held in its chunk.
    ///
    /// `None` before the first backward, for parameters that do not require
    /// gradients, for parameters whose chunk saw no gradient at all, and when
    /// the chunk has no storage on this process.
    pub fn grad(&self, param: TensorId) -> Result<Option<LocalView<'_, T>>> {
        if !self.graph.parameter(param)?.requires_grad || !self.reduced.contains(&param) {
            return Ok(None);
        }
        if self.manager.is_chunk_free(param)? {
            return Ok(None);
        }
        self.manager.local_view(param).map(Some)
    }

    /// Reduced gradients live in the chunks and are overwritten by the next
    /// pass; only the exposed views are reset.
    pub fn zero_grad(&mut self) {
        for p in self.graph.parameters_mut() {
            p.grad = None;
        }
        self.reduced.clear();
    }
}
