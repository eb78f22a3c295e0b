use super::backend::CollectiveBackend;
use super::stream::CommStream;
use crate::autograd::{EagerContext, GradHook, HookTable, Network};
use crate::error::Result;
use crate::nn::ModuleGraph;
use crate::tensor::{TensorElem, TensorId};
use std::collections::hash_map::{Entry, HashMap};
use tracing::{debug, info};
use zero_rs_kernels::{cpu_add_assign, cpu_div_scalar};

/// Gradient side table plus the stream that fills it.
struct GradSync<T: TensorElem> {
    stream: Option<CommStream<T>>,
    world_size: usize,
    saved: HashMap<TensorId, Vec<T>>,
}

impl<T: TensorElem> GradSync<T> {
    fn save(&mut self, param: TensorId, grad: Vec<T>) -> Result<()> {
        match self.saved.entry(param) {
            Entry::Occupied(mut e) => cpu_add_assign(e.get_mut(), &grad)?,
            Entry::Vacant(e) => {
                e.insert(grad);
            }
        }
        Ok(())
    }

    /// Joins the stream and folds every reduced gradient into the side table.
    fn flush(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        for (param, grad) in stream.synchronize()? {
            self.save(param, grad)?;
        }
        Ok(())
    }
}

impl<T: TensorElem> GradHook<T> for GradSync<T> {
    fn on_grad(&mut self, param: TensorId, mut grad: Vec<T>) -> Result<Vec<T>> {
        match self.stream.as_mut() {
            Some(stream) => {
                cpu_div_scalar(&mut grad, self.world_size)?;
                stream.submit(param, grad)?;
            }
            None => self.save(param, grad)?,
        }
        // Zero-size placeholder: the native gradient is not kept.
        Ok(Vec::new())
    }
}

/// Plain data parallelism.
///
/// Each trainable parameter's gradient is intercepted as soon as backprop
/// produces it, divided by the group size and all-reduced on a
/// [`CommStream`] while backprop continues. Reduced gradients accumulate in a
/// side table keyed by parameter; [`backward`](Self::backward) joins the
/// stream and exposes them as `Parameter::grad`.
///
/// With a single process nothing is divided or communicated, so the exposed
/// gradient is exactly the one backprop produced.
pub struct DataParallel<T: TensorElem, N: Network<T>> {
    network: N,
    graph: ModuleGraph<T>,
    hooks: HookTable,
    sync: GradSync<T>,
}

impl<T, N> DataParallel<T, N>
where
    T: TensorElem,
    N: Network<T>,
{
    pub fn new<B>(network: N, graph: ModuleGraph<T>, backend: B) -> Result<Self>
    where
        B: CollectiveBackend + 'static,
    {
        let world_size = backend.world_size();
        let rank = backend.rank();
        let mut hooks = HookTable::new();
        for p in graph.parameters().filter(|p| p.requires_grad) {
            hooks.register(p.id);
        }
        let stream = if world_size > 1 {
            Some(CommStream::spawn(backend)?)
        } else {
            None
        };
        info!(rank, world_size, hooked = hooks.len(), "data parallel wrapper ready");

        Ok(Self {
            network,
            graph,
            hooks,
            sync: GradSync {
                stream,
                world_size,
                saved: HashMap::new(),
            },
        })
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn graph(&self) -> &ModuleGraph<T> {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ModuleGraph<T> {
        &mut self.graph
    }

    pub fn world_size(&self) -> usize {
        self.sync.world_size
    }

    /// Accumulated, reduced gradient of `param`.
    pub fn saved_grad(&self, param: TensorId) -> Option<&[T]> {
        self.sync.saved.get(&param).map(Vec::as_slice)
    }

    pub fn forward(&mut self, input: &[T]) -> Result<Vec<T>> {
        for p in self.graph.parameters_mut() {
            p.grad = None;
        }
        let mut ctx = EagerContext::new(&mut self.graph);
        self.network.forward(input, &mut ctx)
    }

    /// Runs backprop, waits for every in-flight all-reduce and publishes the
    /// reduced gradients. Returns the gradient w.r.t. the input.
    pub fn backward(&mut self, grad_output: &[T]) -> Result<Vec<T>> {
        let grad_input = {
            let mut ctx = EagerContext::new(&mut self.graph).with_hooks(&self.hooks, &mut self.sync);
            self.network.backward(grad_output, &mut ctx)?
        };
        self.sync.flush()?;
        debug!(params = self.sync.saved.len(), "gradients synchronized");

        for p in self.graph.parameters_mut() {
            p.grad = self.sync.saved.get(&p.id).cloned();
        }
        Ok(grad_input)
    }

    /// Clears gradients. With `set_to_none` the side table is dropped,
    /// otherwise every saved gradient is zeroed in place.
    pub fn zero_grad(&mut self, set_to_none: bool) {
        for p in self.graph.parameters_mut() {
            p.grad = None;
        }
        if set_to_none {
            self.sync.saved.clear();
        } else {
            for grad in self.sync.saved.values_mut() {
                grad.iter_mut().for_each(|g| *g = T::zero());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::CpuBackend;
    use crate::nn::Linear;

    fn build() -> (Linear<f32>, ModuleGraph<f32>) {
        let mut graph = ModuleGraph::new();
        let fc = Linear::new(
            &mut graph,
            None,
            "fc",
            3,
            2,
            vec![0.1, -0.2, 0.3, 0.4, 0.5, -0.6],
            Some(vec![0.01, 0.02]),
        )
        .unwrap();
        (fc, graph)
    }

    const X: [f32; 6] = [0.7, 0.3, -1.1, 2.0, 0.25, 0.125];
    const DY: [f32; 4] = [0.3, -0.9, 1.7, 0.05];

    #[test]
    fn test_single_process_matches_native_bitwise() {
        let (mut fc, mut graph) = build();
        {
            let mut ctx = EagerContext::new(&mut graph);
            fc.forward(&X, &mut ctx).unwrap();
            fc.backward(&DY, &mut ctx).unwrap();
        }
        let native_w = graph.parameter(fc.weight()).unwrap().grad.clone().unwrap();
        let native_b = graph.parameter(fc.bias().unwrap()).unwrap().grad.clone().unwrap();

        let (fc2, graph2) = build();
        let (w, b) = (fc2.weight(), fc2.bias().unwrap());
        let mut ddp = DataParallel::new(fc2, graph2, CpuBackend::single()).unwrap();
        ddp.forward(&X).unwrap();
        ddp.backward(&DY).unwrap();

        let saved_w = ddp.saved_grad(w).unwrap();
        assert_eq!(
            saved_w.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            native_w.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
        assert_eq!(ddp.saved_grad(b).unwrap(), native_b.as_slice());
        assert_eq!(ddp.graph().parameter(w).unwrap().grad.as_deref(), Some(saved_w));
    }

    #[test]
    fn test_side_table_accumulates_until_zeroed() {
        let (fc, graph) = build();
        let b = fc.bias().unwrap();
        let mut ddp = DataParallel::new(fc, graph, CpuBackend::single()).unwrap();

        ddp.forward(&X).unwrap();
        ddp.backward(&DY).unwrap();
        let once = ddp.saved_grad(b).unwrap().to_vec();
        ddp.forward(&X).unwrap();
        ddp.backward(&DY).unwrap();
        let twice = ddp.saved_grad(b).unwrap();
        assert_eq!(twice, &[once[0] * 2.0, once[1] * 2.0]);

        ddp.zero_grad(false);
        assert_eq!(ddp.saved_grad(b).unwrap(), &[0.0, 0.0]);
        assert!(ddp.graph().parameter(b).unwrap().grad.is_none());

        ddp.zero_grad(true);
        assert!(ddp.saved_grad(b).is_none());
    }

    #[test]
    fn test_frozen_parameter_not_hooked() {
        let (fc, mut graph) = build();
        let (w, b) = (fc.weight(), fc.bias().unwrap());
        graph.parameter_mut(b).unwrap().requires_grad = false;
        let mut ddp = DataParallel::new(fc, graph, CpuBackend::single()).unwrap();
        ddp.forward(&X).unwrap();
        ddp.backward(&DY).unwrap();
        assert!(ddp.saved_grad(w).is_some());
        assert!(ddp.saved_grad(b).is_none());
    }
}
