use super::{ComputePattern, DistSpec, ProcessGroup};
use std::collections::{BTreeMap, HashMap};

/// Required layout per parameter name for one mode. `None` means the
/// parameter must carry no layout.
pub type ParamSpecs = BTreeMap<String, Option<DistSpec>>;

/// The valid layout combinations of one module type.
///
/// For every supported compute pattern there is one or more named *modes*
/// (e.g. `"row"`, `"col"`); each mode is one jointly valid assignment.
#[derive(Debug, Clone, Default)]
pub struct ModuleDescriptor {
    param_names: Vec<String>,
    patterns: HashMap<ComputePattern, BTreeMap<String, ParamSpecs>>,
}

impl ModuleDescriptor {
    pub fn new<I, S>(param_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            param_names: param_names.into_iter().map(Into::into).collect(),
            patterns: HashMap::new(),
        }
    }

    /// Adds `mode` as a valid combination under `pattern`.
    pub fn allow<'a, I>(mut self, pattern: ComputePattern, mode: &str, specs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<DistSpec>)>,
    {
        let specs = specs
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect();
        self.patterns
            .entry(pattern)
            .or_default()
            .insert(mode.to_string(), specs);
        self
    }

    /// Linear layer, weight `[out, in]`.
    ///
    /// - `row`: weight split on the input dim, bias replicated in full.
    /// - `col`: weight and bias split on the output dim.
    pub fn linear(group: &ProcessGroup) -> Self {
        let n = group.size();
        Self::new(["weight", "bias"])
            .allow(
                ComputePattern::TP1D,
                "row",
                [
                    ("weight", Some(DistSpec::shard(group.clone(), vec![-1], vec![n]))),
                    ("bias", None),
                ],
            )
            .allow(
                ComputePattern::TP1D,
                "col",
                [
                    ("weight", Some(DistSpec::shard(group.clone(), vec![0], vec![n]))),
                    ("bias", Some(DistSpec::shard(group.clone(), vec![0], vec![n]))),
                ],
            )
    }

    /// Embedding table, weight `[vocab, dim]`.
    pub fn embedding(group: &ProcessGroup) -> Self {
        let n = group.size();
        Self::new(["weight"])
            .allow(
                ComputePattern::TP1D,
                "row",
                [("weight", Some(DistSpec::shard(group.clone(), vec![0], vec![n])))],
            )
            .allow(
                ComputePattern::TP1D,
                "col",
                [("weight", Some(DistSpec::shard(group.clone(), vec![-1], vec![n])))],
            )
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn has_compute_pattern(&self, pattern: ComputePattern) -> bool {
        self.patterns.contains_key(&pattern)
    }

    pub fn specs(&self, pattern: ComputePattern, mode: &str) -> Option<&ParamSpecs> {
        self.patterns.get(&pattern)?.get(mode)
    }

    /// All modes of `pattern`, in name order.
    pub fn modes(&self, pattern: ComputePattern) -> impl Iterator<Item = (&str, &ParamSpecs)> {
        self.patterns
            .get(&pattern)
            .into_iter()
            .flat_map(|modes| modes.iter().map(|(m, s)| (m.as_str(), s)))
    }
}

/// Module type name to descriptor.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    descriptors: HashMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `Linear` and `Embedding` descriptors.
    pub fn with_defaults(group: &ProcessGroup) -> Self {
        let mut registry = Self::new();
        registry.register("Linear", ModuleDescriptor::linear(group));
        registry.register("Embedding", ModuleDescriptor::embedding(group));
        registry
    }

    /// Replaces any previous descriptor for `type_name`.
    pub fn register(&mut self, type_name: impl Into<String>, descriptor: ModuleDescriptor) {
        self.descriptors.insert(type_name.into(), descriptor);
    }

    pub fn get(&self, type_name: &str) -> Option<&ModuleDescriptor> {
        self.descriptors.get(type_name)
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.descriptors.contains_key(type_name)
    }
}
