//! Gradient interception surface.
//!
//! # What is this?
//!
//! The synchronization wrappers do not differentiate anything themselves.
//! They only need two things from the autodiff machinery:
//!
//! 1. A place to stand **around every op that reads a parameter**, so the
//!    parameter's chunk can be gathered and its state moved to `Compute`.
//! 2. A callback **the moment a parameter's gradient is produced**, so the
//!    gradient can be reduced (and its memory dropped) while backprop keeps
//!    walking earlier layers.
//!
//! Both are expressed through an [`OpContext`] that a [`Network`] is driven
//! with. A network asks the context for parameter data with
//! [`OpContext::load`] and hands back gradients with
//! [`OpContext::emit_grad`]. What happens in between is up to the context:
//!
//! - [`EagerContext`] reads parameters straight from the [`ModuleGraph`] and
//!   accumulates gradients into `Parameter::grad`, optionally routing them
//!   through a [`GradHook`] first.
//! - The chunked wrapper's context reads from chunks instead.
//!
//! # Example
//!
//! ```rust
//! use zero_rs::autograd::{EagerContext, Network};
//! use zero_rs::nn::{Linear, ModuleGraph};
//!
//! let mut graph = ModuleGraph::<f32>::new();
//! let mut layer = Linear::new(&mut graph, None, "fc", 2, 1, vec![1.0, 2.0], Some(vec![0.5]))?;
//!
//! let mut ctx = EagerContext::new(&mut graph);
//! let y = layer.forward(&[3.0, 4.0], &mut ctx)?;
//! assert_eq!(y, vec![11.5]);
//!
//! layer.backward(&[1.0], &mut ctx)?;
//! assert_eq!(graph.parameter(layer.weight())?.grad, Some(vec![3.0, 4.0]));
//! # Ok::<(), zero_rs::error::ZeroError>(())
//! ```

use crate::error::Result;
use crate::nn::ModuleGraph;
use crate::tensor::{TensorElem, TensorId};
use std::collections::HashSet;
use zero_rs_kernels::cpu_add_assign;

/// Execution context a [`Network`] runs against.
pub trait OpContext<T: TensorElem> {
    /// Fetches the full data of `param` for one op.
    fn load(&mut self, param: TensorId) -> Result<Vec<T>>;

    /// Reports the gradient of `param` produced by backprop.
    fn emit_grad(&mut self, param: TensorId, grad: Vec<T>) -> Result<()>;
}

/// A differentiable computation over flat buffers.
///
/// Implementations cache whatever the backward pass needs during `forward`
/// and must emit a gradient for each trainable parameter they read.
pub trait Network<T: TensorElem> {
    fn forward(&mut self, input: &[T], ctx: &mut dyn OpContext<T>) -> Result<Vec<T>>;

    /// Propagates `grad_output` and returns the gradient w.r.t. the input.
    fn backward(&mut self, grad_output: &[T], ctx: &mut dyn OpContext<T>) -> Result<Vec<T>>;
}

/// Callback invoked when a subscribed parameter's gradient is produced.
///
/// The returned buffer replaces the gradient that would have been stored.
/// Returning an empty buffer leaves a zero-size placeholder instead, which
/// is how the wrappers stop the default accumulation from keeping memory.
pub trait GradHook<T: TensorElem> {
    fn on_grad(&mut self, param: TensorId, grad: Vec<T>) -> Result<Vec<T>>;
}

/// Set of parameters whose gradients are intercepted.
#[derive(Debug, Clone, Default)]
pub struct HookTable {
    subscribed: HashSet<TensorId>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `param` was already subscribed.
    pub fn register(&mut self, param: TensorId) -> bool {
        self.subscribed.insert(param)
    }

    pub fn remove(&mut self, param: TensorId) -> bool {
        self.subscribed.remove(&param)
    }

    pub fn contains(&self, param: TensorId) -> bool {
        self.subscribed.contains(&param)
    }

    pub fn len(&self) -> usize {
        self.subscribed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribed.is_empty()
    }
}

/// Runs ops directly against a [`ModuleGraph`].
pub struct EagerContext<'a, T: TensorElem> {
    graph: &'a mut ModuleGraph<T>,
    hooks: Option<(&'a HookTable, &'a mut dyn GradHook<T>)>,
}

impl<'a, T: TensorElem> EagerContext<'a, T> {
    pub fn new(graph: &'a mut ModuleGraph<T>) -> Self {
        Self { graph, hooks: None }
    }

    /// Routes gradients of every parameter in `table` through `hook`.
    pub fn with_hooks(mut self, table: &'a HookTable, hook: &'a mut dyn GradHook<T>) -> Self {
        self.hooks = Some((table, hook));
        self
    }
}

impl<T: TensorElem> OpContext<T> for EagerContext<'_, T> {
    fn load(&mut self, param: TensorId) -> Result<Vec<T>> {
        Ok(self.graph.parameter(param)?.data.clone())
    }

    fn emit_grad(&mut self, param: TensorId, grad: Vec<T>) -> Result<()> {
        let grad = match &mut self.hooks {
            Some((table, hook)) if table.contains(param) => hook.on_grad(param, grad)?,
            _ => grad,
        };
        accumulate_grad(&mut self.graph.parameter_mut(param)?.grad, grad)
    }
}

/// Default accumulation: add into an existing gradient of the same size,
/// otherwise replace it. An empty `grad` becomes the placeholder.
pub fn accumulate_grad<T: TensorElem>(slot: &mut Option<Vec<T>>, grad: Vec<T>) -> Result<()> {
    match slot {
        Some(existing) if !grad.is_empty() && existing.len() == grad.len() => {
            cpu_add_assign(existing, &grad)?;
        }
        _ => *slot = Some(grad),
    }
    Ok(())
}
