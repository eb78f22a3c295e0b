use crate::error::{Result, ZeroError};
use crate::sharding::TensorSpec;
use crate::tensor::{numel, TensorElem, TensorId};
use std::collections::HashMap;

/// Index of a module inside its [`ModuleGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

/// A trainable tensor owned by the graph.
#[derive(Debug, Clone)]
pub struct Parameter<T: TensorElem> {
    pub id: TensorId,
    pub shape: Vec<usize>,
    pub requires_grad: bool,
    /// Contents. Emptied when a chunk manager takes over the storage.
    pub data: Vec<T>,
    /// `Some(vec![])` is the zero-size placeholder left by gradient hooks.
    pub grad: Option<Vec<T>>,
    /// Tensor-parallel layout, if one was assigned.
    pub spec: Option<TensorSpec>,
}

impl<T: TensorElem> Parameter<T> {
    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }
}

/// A node of the module tree.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Key into the sharding registry, e.g. `"Linear"`.
    pub type_name: String,
    pub name: String,
    params: Vec<(String, TensorId)>,
    children: Vec<ModuleId>,
}

impl ModuleNode {
    /// Parameters registered directly on this module, in registration order.
    pub fn params(&self) -> &[(String, TensorId)] {
        &self.params
    }

    pub fn children(&self) -> &[ModuleId] {
        &self.children
    }
}

/// An arena of modules and the parameters they own.
///
/// A parameter may be registered on several modules (tied weights). The
/// graph stores it once; every owner refers to it by [`TensorId`], so a layout
/// assigned through one owner is seen by all of them.
///
/// # Example
///
/// ```rust
/// use zero_rs::nn::ModuleGraph;
///
/// let mut graph = ModuleGraph::<f32>::new();
/// let model = graph.add_module("Model", "model", None);
/// let embed = graph.add_module("Embedding", "embed", Some(model));
/// let head = graph.add_module("Linear", "head", Some(model));
///
/// let w = graph.add_parameter(embed, "weight", vec![4, 2], vec![0.0; 8])?;
/// graph.share_parameter(head, "weight", w)?;
///
/// assert_eq!(graph.owners(w), vec![embed, head]);
/// assert_eq!(graph.parameters().count(), 1);
/// # Ok::<(), zero_rs::error::ZeroError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ModuleGraph<T: TensorElem> {
    modules: Vec<ModuleNode>,
    params: Vec<Parameter<T>>,
    index: HashMap<TensorId, usize>,
}

impl<T: TensorElem> Default for ModuleGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TensorElem> ModuleGraph<T> {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            params: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn add_module(
        &mut self,
        type_name: impl Into<String>,
        name: impl Into<String>,
        parent: Option<ModuleId>,
    ) -> ModuleId {
        let id = ModuleId(self.modules.len());
        self.modules.push(ModuleNode {
            type_name: type_name.into(),
            name: name.into(),
            params: Vec::new(),
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.modules[parent.0].children.push(id);
        }
        id
    }

    /// Creates a parameter owned by `module`.
    pub fn add_parameter(
        &mut self,
        module: ModuleId,
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<T>,
    ) -> Result<TensorId> {
        if data.len() != numel(&shape) {
            return Err(ZeroError::SizeMismatch {
                expected: numel(&shape),
                got: data.len(),
            });
        }
        let id = TensorId::new();
        self.index.insert(id, self.params.len());
        self.params.push(Parameter {
            id,
            shape,
            requires_grad: true,
            data,
            grad: None,
            spec: None,
        });
        self.modules[module.0].params.push((name.into(), id));
        Ok(id)
    }

    /// Registers an existing parameter on another module under `name`.
    pub fn share_parameter(&mut self, module: ModuleId, name: impl Into<String>, param: TensorId) -> Result<()> {
        if !self.index.contains_key(&param) {
            return Err(ZeroError::UnknownTensor(param));
        }
        self.modules[module.0].params.push((name.into(), param));
        Ok(())
    }

    pub fn module(&self, id: ModuleId) -> &ModuleNode {
        &self.modules[id.0]
    }

    pub fn module_ids(&self) -> impl Iterator<Item = ModuleId> {
        (0..self.modules.len()).map(ModuleId)
    }

    pub fn parameter(&self, id: TensorId) -> Result<&Parameter<T>> {
        self.index
            .get(&id)
            .map(|&i| &self.params[i])
            .ok_or(ZeroError::UnknownTensor(id))
    }

    pub fn parameter_mut(&mut self, id: TensorId) -> Result<&mut Parameter<T>> {
        match self.index.get(&id) {
            Some(&i) => Ok(&mut self.params[i]),
            None => Err(ZeroError::UnknownTensor(id)),
        }
    }

    /// Every distinct parameter, in registration order.
    pub fn parameters(&self) -> impl Iterator<Item = &Parameter<T>> {
        self.params.iter()
    }

    pub fn parameters_mut(&mut self) -> impl Iterator<Item = &mut Parameter<T>> {
        self.params.iter_mut()
    }

    /// Looks up the parameter `module` registered as `name`.
    pub fn get_parameter(&self, module: ModuleId, name: &str) -> Result<TensorId> {
        let node = self.module(module);
        node.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, id)| id)
            .ok_or_else(|| ZeroError::MissingParameter {
                module: node.name.clone(),
                name: name.to_string(),
            })
    }

    /// Every module that registers `param` directly, in module order.
    pub fn owners(&self, param: TensorId) -> Vec<ModuleId> {
        self.module_ids()
            .filter(|m| self.module(*m).params.iter().any(|(_, id)| *id == param))
            .collect()
    }

    /// `root` followed by all of its submodules, depth first.
    pub fn descendants(&self, root: ModuleId) -> Vec<ModuleId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.module(id).children.iter().rev().copied());
        }
        out
    }
}
