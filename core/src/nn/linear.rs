use super::module::{ModuleGraph, ModuleId};
use crate::autograd::{Network, OpContext};
use crate::error::{Result, ZeroError};
use crate::tensor::{TensorElem, TensorId};

/// Linear Layer: `y = xW^T + b`
///
/// Parameters live in the [`ModuleGraph`]; the layer only keeps their ids,
/// so the same layer runs unchanged whether weights are read from the graph
/// or from gathered chunks.
///
/// - `weight`: `[out_features, in_features]`
/// - `bias`: `[out_features]`
///
/// Inputs are flat `[batch, in_features]` buffers.
#[derive(Debug)]
pub struct Linear<T: TensorElem> {
    module: ModuleId,
    weight: TensorId,
    bias: Option<TensorId>,
    in_features: usize,
    out_features: usize,
    input: Option<Vec<T>>,
}

impl<T: TensorElem> Linear<T> {
    /// Registers a `Linear` module named `name` under `parent`.
    pub fn new(
        graph: &mut ModuleGraph<T>,
        parent: Option<ModuleId>,
        name: &str,
        in_features: usize,
        out_features: usize,
        weight: Vec<T>,
        bias: Option<Vec<T>>,
    ) -> Result<Self> {
        let module = graph.add_module("Linear", name, parent);
        let weight = graph.add_parameter(module, "weight", vec![out_features, in_features], weight)?;
        let bias = bias
            .map(|b| graph.add_parameter(module, "bias", vec![out_features], b))
            .transpose()?;
        Ok(Self {
            module,
            weight,
            bias,
            in_features,
            out_features,
            input: None,
        })
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn weight(&self) -> TensorId {
        self.weight
    }

    pub fn bias(&self) -> Option<TensorId> {
        self.bias
    }

    fn batch(&self, len: usize, features: usize) -> Result<usize> {
        if features == 0 || len % features != 0 {
            return Err(ZeroError::SizeMismatch {
                expected: features,
                got: len,
            });
        }
        Ok(len / features)
    }
}

impl<T: TensorElem> Network<T> for Linear<T> {
    fn forward(&mut self, x: &[T], ctx: &mut dyn OpContext<T>) -> Result<Vec<T>> {
        let batch = self.batch(x.len(), self.in_features)?;
        let w = ctx.load(self.weight)?;
        let bias = self.bias.map(|b| ctx.load(b)).transpose()?;

        let (n_in, n_out) = (self.in_features, self.out_features);
        let mut y = vec![T::zero(); batch * n_out];
        for (x_row, y_row) in x.chunks(n_in).zip(y.chunks_mut(n_out)) {
            for (o, y_val) in y_row.iter_mut().enumerate() {
                let w_row = &w[o * n_in..(o + 1) * n_in];
                *y_val = x_row
                    .iter()
                    .zip(w_row)
                    .fold(T::zero(), |acc, (&a, &b)| acc + a * b);
                if let Some(b) = &bias {
                    *y_val += b[o];
                }
            }
        }

        self.input = Some(x.to_vec());
        Ok(y)
    }

    fn backward(&mut self, dy: &[T], ctx: &mut dyn OpContext<T>) -> Result<Vec<T>> {
        let x = self.input.take().ok_or_else(|| {
            ZeroError::InvalidConfig("Linear::backward called before forward".into())
        })?;
        let batch = self.batch(dy.len(), self.out_features)?;
        let (n_in, n_out) = (self.in_features, self.out_features);
        if x.len() != batch * n_in {
            return Err(ZeroError::SizeMismatch {
                expected: batch * n_in,
                got: x.len(),
            });
        }
        let w = ctx.load(self.weight)?;

        // dX = dY W, dW = dY^T X, db = sum_b dY
        let mut dx = vec![T::zero(); batch * n_in];
        let mut dw = vec![T::zero(); n_out * n_in];
        let mut db = vec![T::zero(); n_out];
        for b in 0..batch {
            let x_row = &x[b * n_in..(b + 1) * n_in];
            let dy_row = &dy[b * n_out..(b + 1) * n_out];
            let dx_row = &mut dx[b * n_in..(b + 1) * n_in];
            for (o, &g) in dy_row.iter().enumerate() {
                db[o] += g;
                let w_row = &w[o * n_in..(o + 1) * n_in];
                let dw_row = &mut dw[o * n_in..(o + 1) * n_in];
                for i in 0..n_in {
                    dx_row[i] += g * w_row[i];
                    dw_row[i] += g * x_row[i];
                }
            }
        }

        ctx.emit_grad(self.weight, dw)?;
        if let Some(bias) = self.bias {
            ctx.emit_grad(bias, db)?;
        }
        Ok(dx)
    }
}
