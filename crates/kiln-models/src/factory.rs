//! Construction of empty component skeletons.
//!
//! A skeleton is the parameter layout of a module with no data behind it.
//! The loader fills it from a state dict, so building one never initializes
//! (and never allocates) weights that are about to be overwritten.

use crate::component::ComponentKind;
use kiln_common::{KilnError, Result, WeightBlob};
use serde_json::Value;
use std::collections::BTreeMap;

/// How the loader treats a parameter when materializing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterRole {
    /// Weight of a linear layer: eligible for 4-bit or float8 storage.
    Linear,
    /// Any other learned tensor (biases, norms, convolutions, embeddings).
    Dense,
    /// Non-learned state kept in its checkpoint dtype (e.g. `position_ids`).
    Buffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub role: ParameterRole,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, role: ParameterRole) -> Self {
        Self { name: name.into(), role }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSkeleton {
    pub class_name: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ModuleSkeleton {
    pub fn new(class_name: impl Into<String>, parameters: Vec<ParameterSpec>) -> Self {
        Self { class_name: class_name.into(), parameters }
    }

    /// Skeleton matching the layout of an existing state dict.
    ///
    /// Rank-2 `.weight` tensors outside embeddings are linear weights, integer
    /// tensors and `position_ids` are buffers, everything else is dense.
    pub fn from_state_dict(class_name: impl Into<String>, blob: &WeightBlob) -> Self {
        let parameters = blob
            .iter()
            .map(|(name, tensor)| {
                let role = if name.ends_with("position_ids") || !tensor.dtype().is_float() {
                    ParameterRole::Buffer
                } else if name.ends_with(".weight")
                    && tensor.shape().len() == 2
                    && !name.contains("embed")
                {
                    ParameterRole::Linear
                } else {
                    ParameterRole::Dense
                };
                ParameterSpec::new(name.as_str(), role)
            })
            .collect();
        Self::new(class_name, parameters)
    }
}

/// What a factory is asked to build.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub component: &'a str,
    pub class: &'a str,
    pub kind: ComponentKind,
    /// Structural configuration. For the backbone this is the configuration
    /// reconciled during recognition, not the repository's file.
    pub config: &'a Value,
}

pub trait ComponentFactory: Send + Sync {
    fn build(&self, request: &BuildRequest<'_>) -> Result<ModuleSkeleton>;
}

/// Factory serving pre-registered skeletons, looked up by component name
/// first and class name second.
#[derive(Debug, Clone, Default)]
pub struct StaticFactory {
    by_component: BTreeMap<String, ModuleSkeleton>,
    by_class: BTreeMap<String, ModuleSkeleton>,
}

impl StaticFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, component: &str, skeleton: ModuleSkeleton) -> Self {
        self.by_component.insert(component.to_string(), skeleton);
        self
    }

    pub fn with_class(mut self, skeleton: ModuleSkeleton) -> Self {
        self.by_class.insert(skeleton.class_name.clone(), skeleton);
        self
    }
}

impl ComponentFactory for StaticFactory {
    fn build(&self, request: &BuildRequest<'_>) -> Result<ModuleSkeleton> {
        self.by_component
            .get(request.component)
            .or_else(|| self.by_class.get(request.class))
            .cloned()
            .ok_or_else(|| {
                KilnError::Repository(format!(
                    "no module layout registered for {} ({})",
                    request.component, request.class
                ))
            })
    }
}
