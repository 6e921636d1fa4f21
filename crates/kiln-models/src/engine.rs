//! Engine registry and top-level assembly.

use crate::arch::{ArchitectureGuess, ArchitectureId};
use crate::component::{ConfigComponent, LoadedComponent};
use crate::dispatcher::{BuiltComponent, LoadContext, load_component};
use crate::factory::ComponentFactory;
use crate::partition::{self, PartitionedStateDicts};
use crate::repository::{ArchitectureRepository, ComponentSpec, DiskRepository, StaticRepository};
use kiln_common::{
    DType, Device, DtypePolicy, KilnError, LoaderConfig, MemoryBudget, Result, SystemBudget,
    WeightBlob,
};
use kiln_quantization::{QuantKernel, ReferenceKernel};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use tracing::{debug, info, warn};

/// Runnable pipeline families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineKind {
    StableDiffusion,
    StableDiffusion2,
    StableDiffusionXl,
    Flux,
}

impl EngineKind {
    /// Architectures this engine can run.
    pub const fn accepts(self) -> &'static [ArchitectureId] {
        match self {
            Self::StableDiffusion => &[ArchitectureId::Sd15],
            Self::StableDiffusion2 => &[ArchitectureId::Sd20],
            Self::StableDiffusionXl => &[ArchitectureId::Sdxl],
            Self::Flux => &[ArchitectureId::Flux, ArchitectureId::FluxSchnell],
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::StableDiffusion => "StableDiffusion",
            Self::StableDiffusion2 => "StableDiffusion2",
            Self::StableDiffusionXl => "StableDiffusionXL",
            Self::Flux => "Flux",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engines in match order; the first that accepts an architecture wins.
pub const ENGINE_REGISTRY: [EngineKind; 4] = [
    EngineKind::StableDiffusion,
    EngineKind::StableDiffusion2,
    EngineKind::StableDiffusionXl,
    EngineKind::Flux,
];

pub fn select_engine(architecture: ArchitectureId) -> Option<EngineKind> {
    ENGINE_REGISTRY.into_iter().find(|e| e.accepts().contains(&architecture))
}

/// What happened to one pipeline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOutcome {
    Loaded { storage_dtype: DType, device: Device },
    Configured,
    Skipped { reason: String },
    Failed { error: String },
}

impl fmt::Display for ComponentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded { storage_dtype, device } => write!(f, "loaded ({storage_dtype} on {device})"),
            Self::Configured => write!(f, "configured"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Per-component outcomes, in load order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    entries: Vec<(String, ComponentOutcome)>,
}

impl LoadReport {
    fn record(&mut self, component: &str, outcome: ComponentOutcome) {
        self.entries.push((component.to_string(), outcome));
    }

    pub fn entries(&self) -> &[(String, ComponentOutcome)] {
        &self.entries
    }

    pub fn outcome(&self, component: &str) -> Option<&ComponentOutcome> {
        self.entries.iter().find(|(name, _)| name == component).map(|(_, o)| o)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(name, o)| match o {
            ComponentOutcome::Failed { error } => Some((name.as_str(), error.as_str())),
            _ => None,
        })
    }

    /// One `name: outcome` line per component.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (name, outcome) in &self.entries {
            let _ = writeln!(out, "{name}: {outcome}");
        }
        out
    }
}

/// A recognized checkpoint with its components built.
#[derive(Debug)]
pub struct Engine {
    kind: EngineKind,
    guess: ArchitectureGuess,
    components: BTreeMap<String, LoadedComponent>,
    configs: BTreeMap<String, ConfigComponent>,
    report: LoadReport,
}

impl Engine {
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn guess(&self) -> &ArchitectureGuess {
        &self.guess
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn backbone(&self) -> &LoadedComponent {
        // Presence is checked when the engine is assembled.
        &self.components[self.guess.backbone_target()]
    }

    pub fn vae(&self) -> &LoadedComponent {
        &self.components[self.guess.vae_target()]
    }

    pub fn component(&self, name: &str) -> Option<&LoadedComponent> {
        self.components.get(name)
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut LoadedComponent> {
        self.components.get_mut(name)
    }

    pub fn components(&self) -> impl Iterator<Item = &LoadedComponent> {
        self.components.values()
    }

    pub fn config_component(&self, name: &str) -> Option<&ConfigComponent> {
        self.configs.get(name)
    }

    pub fn text_encoders(&self) -> impl Iterator<Item = &LoadedComponent> {
        self.components.values().filter(|c| c.kind().is_text_encoder())
    }

    /// Text encoders the architecture has but this engine could not load.
    pub fn missing_text_encoders(&self) -> Vec<&'static str> {
        self.guess
            .text_encoder_targets
            .iter()
            .map(|(_, target)| *target)
            .filter(|target| !self.components.contains_key(*target))
            .collect()
    }
}

/// Loads engines from weight blobs.
pub struct EngineLoader {
    config: LoaderConfig,
    budget: Box<dyn MemoryBudget>,
    repository: Box<dyn ArchitectureRepository>,
    factory: Box<dyn ComponentFactory>,
    kernel: Box<dyn QuantKernel>,
}

impl EngineLoader {
    /// Loader reading system memory, with no accelerator and the reference
    /// 4-bit kernel.
    pub fn new(
        config: LoaderConfig,
        repository: Box<dyn ArchitectureRepository>,
        factory: Box<dyn ComponentFactory>,
    ) -> Self {
        Self {
            config,
            budget: Box::new(SystemBudget::default()),
            repository,
            factory,
            kernel: Box::new(ReferenceKernel),
        }
    }

    /// Uses the on-disk repository under `repository_root` when configured,
    /// the built-in layouts otherwise.
    pub fn from_config(config: LoaderConfig, factory: Box<dyn ComponentFactory>) -> Result<Self> {
        config.validate()?;
        let repository: Box<dyn ArchitectureRepository> = match &config.repository_root {
            Some(root) => Box::new(DiskRepository::new(root)),
            None => Box::new(StaticRepository::known()),
        };
        Ok(Self::new(config, repository, factory))
    }

    pub fn with_budget(mut self, budget: Box<dyn MemoryBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_kernel(mut self, kernel: Box<dyn QuantKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn kernel(&self) -> &dyn QuantKernel {
        self.kernel.as_ref()
    }

    pub fn recognize(
        &self,
        blob: &WeightBlob,
        vae: Option<WeightBlob>,
    ) -> Result<(PartitionedStateDicts, ArchitectureGuess)> {
        partition::recognize(blob, vae)
    }

    /// Recognize, partition and load every component, then assemble.
    ///
    /// Component failures are recorded in the engine's [`LoadReport`] and do
    /// not stop the others. Recognition failures, architectures without an
    /// engine, and engines missing their backbone or autoencoder fail the
    /// whole load.
    pub fn load_engine(&self, blob: &WeightBlob, vae: Option<WeightBlob>) -> Result<Engine> {
        let (mut parts, guess) = self.recognize(blob, vae)?;
        let architecture = guess.architecture;
        let kind = select_engine(architecture).ok_or_else(|| KilnError::Assembly {
            architecture: architecture.to_string(),
            reason: "no registered engine accepts this architecture".to_string(),
        })?;

        let mut specs = self.repository.components(guess.repo_name())?;
        // The backbone is the largest component and gets placed first.
        specs.sort_by_key(|s| s.name != guess.backbone_target());

        let ctx = LoadContext {
            config: &self.config,
            policy: DtypePolicy::from_config(&self.config),
            budget: self.budget.as_ref(),
            repository: self.repository.as_ref(),
            factory: self.factory.as_ref(),
            kernel: self.kernel.as_ref(),
            guess: &guess,
        };

        let mut components = BTreeMap::new();
        let mut configs = BTreeMap::new();
        let mut report = LoadReport::default();
        for spec in &specs {
            let state = parts.take(&spec.name);
            match load_component(&ctx, spec, state) {
                Ok(BuiltComponent::Weighted(c)) => {
                    let outcome = ComponentOutcome::Loaded {
                        storage_dtype: c.placement().storage_dtype,
                        device: c.device(),
                    };
                    report.record(&spec.name, outcome);
                    components.insert(spec.name.clone(), c);
                }
                Ok(BuiltComponent::Config(c)) => {
                    report.record(&spec.name, ComponentOutcome::Configured);
                    configs.insert(spec.name.clone(), c);
                }
                Ok(BuiltComponent::Skipped { reason }) => {
                    report.record(&spec.name, ComponentOutcome::Skipped { reason });
                }
                Err(err) => {
                    warn!(component = %spec.name, error = %err, "component failed to load");
                    report.record(&spec.name, ComponentOutcome::Failed { error: err.to_string() });
                }
            }
        }
        for unused in parts.components() {
            debug!(component = unused, "state dict has no matching pipeline component");
        }

        assemble(kind, guess, components, configs, report, &specs)
    }
}

fn assemble(
    kind: EngineKind,
    guess: ArchitectureGuess,
    components: BTreeMap<String, LoadedComponent>,
    configs: BTreeMap<String, ConfigComponent>,
    report: LoadReport,
    specs: &[ComponentSpec],
) -> Result<Engine> {
    for required in [guess.backbone_target(), guess.vae_target()] {
        if components.contains_key(required) {
            continue;
        }
        let reason = match report.outcome(required) {
            Some(outcome) => format!("required component {required} {outcome}"),
            None if !specs.iter().any(|s| s.name == required) => {
                format!("pipeline layout has no {required} component")
            }
            None => format!("required component {required} was not loaded"),
        };
        return Err(KilnError::Assembly { architecture: guess.architecture.to_string(), reason });
    }
    info!(engine = %kind, architecture = %guess.architecture, components = components.len(), "assembled engine");
    Ok(Engine { kind, guess, components, configs, report })
}
