use super::{ComputePattern, ModuleRegistry, ParallelAction, TensorSpec};
use crate::error::{Result, ZeroError};
use crate::nn::{ModuleGraph, ModuleId};
use crate::tensor::TensorElem;
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Mode name used when a module type has a single layout per pattern.
pub const DEFAULT_MODE: &str = "default";

/// Assigns and checks parameter layouts against a [`ModuleRegistry`].
///
/// Assignment is a graph-wide step: a parameter shared by several modules
/// (tied weights) gets one layout, so every module owning a touched
/// parameter is re-checked, not just the one being initialized.
///
/// # Example
///
/// ```rust
/// use zero_rs::nn::{Linear, ModuleGraph};
/// use zero_rs::sharding::{ComputePattern, ModuleRegistry, ParallelAction, ProcessGroup, ShardingValidator};
///
/// let mut graph = ModuleGraph::<f32>::new();
/// let fc = Linear::new(&mut graph, None, "fc", 4, 8, vec![0.0; 32], Some(vec![0.0; 8]))?;
///
/// let validator = ShardingValidator::new(ModuleRegistry::with_defaults(&ProcessGroup::world(2)));
/// let action = ParallelAction::new(ComputePattern::TP1D);
/// validator.init_module(&mut graph, fc.module(), &action, true, "col")?;
///
/// assert!(graph.parameter(fc.bias().unwrap())?.spec.is_some());
/// validator.check_module(&graph, fc.module(), true)?;
/// # Ok::<(), zero_rs::error::ZeroError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ShardingValidator {
    registry: ModuleRegistry,
}

impl ShardingValidator {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Applies the layouts `mode` of `action`'s compute pattern prescribes to
    /// `module`'s parameters, then re-checks every module affected.
    ///
    /// Parameters the mode maps to `None` keep whatever layout they had.
    /// Unregistered modules are left alone; with `recursive` their children
    /// are still visited.
    pub fn init_module<T: TensorElem>(
        &self,
        graph: &mut ModuleGraph<T>,
        module: ModuleId,
        action: &ParallelAction,
        recursive: bool,
        mode: &str,
    ) -> Result<()> {
        let node = graph.module(module);
        if let Some(descriptor) = self.registry.get(&node.type_name) {
            let pattern = action.compute_pattern;
            let specs = descriptor.specs(pattern, mode).ok_or_else(|| {
                ZeroError::UnsupportedComputePattern {
                    module: node.name.clone(),
                    pattern,
                    mode: Some(mode.to_string()),
                }
            })?;

            let mut affected = BTreeSet::from([module]);
            for (name, dist_spec) in specs {
                let Some(dist_spec) = dist_spec else {
                    continue;
                };
                let param = graph.get_parameter(module, name)?;
                graph.parameter_mut(param)?.spec =
                    Some(TensorSpec::new(dist_spec.clone(), action.clone()));
                affected.extend(graph.owners(param));
            }
            debug!(
                module = %graph.module(module).name,
                ?pattern,
                mode,
                affected = affected.len(),
                "layouts assigned"
            );
            for m in affected {
                self.check_module(graph, m, false)?;
            }
        }

        if recursive {
            let children = graph.module(module).children().to_vec();
            for child in children {
                self.init_module(graph, child, action, true, mode)?;
            }
        }
        Ok(())
    }

    /// Verifies that `module`'s current layouts form one of the combinations
    /// its descriptor allows.
    pub fn check_module<T: TensorElem>(
        &self,
        graph: &ModuleGraph<T>,
        module: ModuleId,
        recursive: bool,
    ) -> Result<()> {
        let node = graph.module(module);
        if let Some(descriptor) = self.registry.get(&node.type_name) {
            let mut pattern: Option<ComputePattern> = None;
            for name in descriptor.param_names() {
                let Some(spec) = self.spec_of(graph, module, name)? else {
                    continue;
                };
                match pattern {
                    None => pattern = Some(spec.compute_pattern()),
                    Some(p) if p != spec.compute_pattern() => {
                        return Err(ZeroError::InconsistentComputePattern {
                            module: node.name.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }

            if let Some(pattern) = pattern {
                if !descriptor.has_compute_pattern(pattern) {
                    return Err(ZeroError::UnsupportedComputePattern {
                        module: node.name.clone(),
                        pattern,
                        mode: None,
                    });
                }

                let mut matched = None;
                for (mode, specs) in descriptor.modes(pattern) {
                    if self.matches(graph, module, specs)? {
                        matched = Some(mode);
                        break;
                    }
                }
                match matched {
                    Some(mode) => trace!(module = %node.name, ?pattern, mode, "layout valid"),
                    None => {
                        return Err(ZeroError::IncompatibleSharding {
                            module: node.name.clone(),
                        })
                    }
                }
            }
        }

        if recursive {
            for &child in node.children() {
                self.check_module(graph, child, true)?;
            }
        }
        Ok(())
    }

    /// The layout of `module.name`, treating an absent parameter as unsharded.
    fn spec_of<'g, T: TensorElem>(
        &self,
        graph: &'g ModuleGraph<T>,
        module: ModuleId,
        name: &str,
    ) -> Result<Option<&'g TensorSpec>> {
        match graph.get_parameter(module, name) {
            Ok(id) => Ok(graph.parameter(id)?.spec.as_ref()),
            Err(ZeroError::MissingParameter { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn matches<T: TensorElem>(
        &self,
        graph: &ModuleGraph<T>,
        module: ModuleId,
        specs: &super::ParamSpecs,
    ) -> Result<bool> {
        for (name, required) in specs {
            let actual = self.spec_of(graph, module, name)?.map(|s| &s.dist_spec);
            if actual != required.as_ref() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
