use super::linear::Linear;
use super::module::{ModuleGraph, ModuleId};
use crate::autograd::{Network, OpContext};
use crate::error::Result;
use crate::tensor::TensorElem;

/// Layers applied in order; backward visits them in reverse.
pub struct Sequential<T: TensorElem> {
    module: ModuleId,
    layers: Vec<Box<dyn Network<T> + Send>>,
}

impl<T: TensorElem> Sequential<T> {
    pub fn new(graph: &mut ModuleGraph<T>, name: &str) -> Self {
        Self {
            module: graph.add_module("Sequential", name, None),
            layers: Vec::new(),
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn push(&mut self, layer: impl Network<T> + Send + 'static) {
        self.layers.push(Box::new(layer));
    }

    /// Appends a [`Linear`] registered as a child of this container.
    pub fn push_linear(
        &mut self,
        graph: &mut ModuleGraph<T>,
        in_features: usize,
        out_features: usize,
        weight: Vec<T>,
        bias: Option<Vec<T>>,
    ) -> Result<&mut Self> {
        let name = self.layers.len().to_string();
        let layer = Linear::new(graph, Some(self.module), &name, in_features, out_features, weight, bias)?;
        self.push(layer);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<T: TensorElem> Network<T> for Sequential<T> {
    fn forward(&mut self, input: &[T], ctx: &mut dyn OpContext<T>) -> Result<Vec<T>> {
        let mut x = input.to_vec();
        for layer in &mut self.layers {
            x = layer.forward(&x, ctx)?;
        }
        Ok(x)
    }

    fn backward(&mut self, grad_output: &[T], ctx: &mut dyn OpContext<T>) -> Result<Vec<T>> {
        let mut g = grad_output.to_vec();
        for layer in self.layers.iter_mut().rev() {
            g = layer.backward(&g, ctx)?;
        }
        Ok(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::EagerContext;

    #[test]
    fn test_two_layer_chain() {
        let mut graph = ModuleGraph::<f64>::new();
        let mut net = Sequential::new(&mut graph, "mlp");
        net.push_linear(&mut graph, 2, 2, vec![1.0, 0.0, 0.0, 1.0], None)
            .unwrap()
            .push_linear(&mut graph, 2, 1, vec![2.0, 3.0], Some(vec![1.0]))
            .unwrap();
        assert_eq!(net.len(), 2);
        assert_eq!(graph.descendants(net.module()).len(), 3);

        let mut ctx = EagerContext::new(&mut graph);
        let y = net.forward(&[1.0, 1.0], &mut ctx).unwrap();
        assert_eq!(y, vec![6.0]);
        let dx = net.backward(&[1.0], &mut ctx).unwrap();
        assert_eq!(dx, vec![2.0, 3.0]);
    }
}
