//! Per-component load strategies.
//!
//! Every pipeline entry is classified into a [`ComponentKind`] and handed to
//! the strategy registered for that kind. Weighted strategies share one path:
//! placement decision, skeleton, then state-dict load.

use crate::arch::ArchitectureGuess;
use crate::component::{
    ComponentKind, ConfigComponent, KeyTolerance, LoadPlan, LoadedComponent, load_state_dict,
};
use crate::factory::{BuildRequest, ComponentFactory};
use crate::repository::{ArchitectureRepository, ComponentSpec};
use kiln_common::{
    ComponentRole, DType, DtypePolicy, KilnError, LoaderConfig, MemoryBudget, PolicyRequest,
    Result, WeightBlob,
};
use kiln_quantization::QuantKernel;
use serde_json::Value;
use tracing::{info, warn};

/// Everything a strategy may consult. Lives for one engine load.
pub struct LoadContext<'a> {
    pub config: &'a LoaderConfig,
    pub policy: DtypePolicy,
    pub budget: &'a dyn MemoryBudget,
    pub repository: &'a dyn ArchitectureRepository,
    pub factory: &'a dyn ComponentFactory,
    pub kernel: &'a dyn QuantKernel,
    pub guess: &'a ArchitectureGuess,
}

/// Result of handling one pipeline entry.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltComponent {
    Weighted(LoadedComponent),
    Config(ConfigComponent),
    Skipped { reason: String },
}

pub trait LoadStrategy: Send + Sync {
    fn load(
        &self,
        ctx: &LoadContext<'_>,
        spec: &ComponentSpec,
        kind: ComponentKind,
        state: Option<WeightBlob>,
    ) -> Result<BuiltComponent>;
}

/// Tokenizers and schedulers: configuration only, weights ignored.
pub struct ConfigStrategy;

/// Feature extractors and safety checkers are never built.
pub struct SkipStrategy;

/// Weights from the partitioned state dict under a fixed key tolerance.
pub struct WeightedStrategy {
    pub tolerance: KeyTolerance,
}

/// The generative backbone: structural config comes from recognition.
pub struct BackboneStrategy;

/// Pairs no rule handles.
pub struct UnsupportedStrategy;

static CONFIG: ConfigStrategy = ConfigStrategy;
static SKIP: SkipStrategy = SkipStrategy;
static AUTOENCODER: WeightedStrategy = WeightedStrategy { tolerance: KeyTolerance::AUTOENCODER };
static CLIP: WeightedStrategy = WeightedStrategy { tolerance: KeyTolerance::CLIP };
static T5: WeightedStrategy = WeightedStrategy { tolerance: KeyTolerance::T5 };
static BACKBONE: BackboneStrategy = BackboneStrategy;
static UNSUPPORTED: UnsupportedStrategy = UnsupportedStrategy;

/// The strategy registered for `kind`.
pub fn strategy_for(kind: ComponentKind) -> &'static dyn LoadStrategy {
    match kind {
        ComponentKind::Tokenizer | ComponentKind::Scheduler => &CONFIG,
        ComponentKind::FeatureExtractor | ComponentKind::SafetyChecker => &SKIP,
        ComponentKind::Autoencoder => &AUTOENCODER,
        ComponentKind::ClipTextEncoder => &CLIP,
        ComponentKind::T5TextEncoder => &T5,
        ComponentKind::Backbone => &BACKBONE,
        ComponentKind::Unsupported => &UNSUPPORTED,
    }
}

/// Classify `spec` and run its strategy.
pub fn load_component(
    ctx: &LoadContext<'_>,
    spec: &ComponentSpec,
    state: Option<WeightBlob>,
) -> Result<BuiltComponent> {
    let kind = ComponentKind::classify(&spec.name, &spec.library, &spec.class);
    strategy_for(kind).load(ctx, spec, kind, state)
}

impl LoadStrategy for ConfigStrategy {
    fn load(
        &self,
        ctx: &LoadContext<'_>,
        spec: &ComponentSpec,
        kind: ComponentKind,
        _state: Option<WeightBlob>,
    ) -> Result<BuiltComponent> {
        let config = ctx.repository.load_config(ctx.guess.repo_name(), &spec.name)?;
        Ok(BuiltComponent::Config(ConfigComponent {
            name: spec.name.clone(),
            kind,
            class_name: spec.class.clone(),
            config,
        }))
    }
}

impl LoadStrategy for SkipStrategy {
    fn load(
        &self,
        _ctx: &LoadContext<'_>,
        spec: &ComponentSpec,
        kind: ComponentKind,
        _state: Option<WeightBlob>,
    ) -> Result<BuiltComponent> {
        info!(component = %spec.name, %kind, "not loading");
        Ok(BuiltComponent::Skipped { reason: format!("{kind} components are never loaded") })
    }
}

impl LoadStrategy for UnsupportedStrategy {
    fn load(
        &self,
        _ctx: &LoadContext<'_>,
        spec: &ComponentSpec,
        _kind: ComponentKind,
        _state: Option<WeightBlob>,
    ) -> Result<BuiltComponent> {
        let diagnostic = KilnError::ComponentSkipped {
            component: spec.name.clone(),
            library: spec.library.clone(),
            class: spec.class.clone(),
        };
        warn!("{diagnostic}");
        Ok(BuiltComponent::Skipped { reason: diagnostic.to_string() })
    }
}

impl LoadStrategy for WeightedStrategy {
    fn load(
        &self,
        ctx: &LoadContext<'_>,
        spec: &ComponentSpec,
        kind: ComponentKind,
        state: Option<WeightBlob>,
    ) -> Result<BuiltComponent> {
        let config = ctx.repository.load_config(ctx.guess.repo_name(), &spec.name)?;
        let loaded = load_weighted(ctx, spec, kind, &config, &[], self.tolerance, state)?;
        Ok(BuiltComponent::Weighted(loaded))
    }
}

impl LoadStrategy for BackboneStrategy {
    fn load(
        &self,
        ctx: &LoadContext<'_>,
        spec: &ComponentSpec,
        kind: ComponentKind,
        state: Option<WeightBlob>,
    ) -> Result<BuiltComponent> {
        let reconciled = &ctx.guess.backbone_config;
        let config = serde_json::to_value(reconciled)?;
        let loaded = load_weighted(
            ctx,
            spec,
            kind,
            &config,
            ctx.guess.supported_dtypes,
            KeyTolerance::STRICT,
            state,
        )?;
        Ok(BuiltComponent::Weighted(loaded.with_backbone_config(reconciled.clone())))
    }
}

fn load_weighted(
    ctx: &LoadContext<'_>,
    spec: &ComponentSpec,
    kind: ComponentKind,
    config: &Value,
    supported: &[DType],
    tolerance: KeyTolerance,
    state: Option<WeightBlob>,
) -> Result<LoadedComponent> {
    let role = kind.role().unwrap_or(ComponentRole::Backbone);
    let state = state.unwrap_or_default();
    let checkpoint_dtype = state.detected_dtype();
    let request = PolicyRequest {
        component: &spec.name,
        role,
        parameter_count: state.parameter_count(),
        checkpoint_dtype,
        supported,
        storage_override: role.storage_override(ctx.config),
    };
    let memory = ctx.budget.snapshot().capped(&ctx.config.memory);
    let placement = ctx.policy.decide(&request, &memory)?;
    if checkpoint_dtype.is_some_and(DType::is_quantized)
        && checkpoint_dtype == Some(placement.storage_dtype)
    {
        info!(component = %spec.name, dtype = %placement.storage_dtype, "using pre-quantized checkpoint dtype");
    }

    let skeleton = ctx.factory.build(&BuildRequest {
        component: &spec.name,
        class: &spec.class,
        kind,
        config,
    })?;
    let plan = LoadPlan {
        name: &spec.name,
        kind,
        placement,
        tolerance,
        quantization: &ctx.config.quantization,
    };
    let loaded = load_state_dict(plan, skeleton, state, ctx.kernel)?;
    info!(
        component = %spec.name,
        class = %spec.class,
        params = loaded.parameter_count(),
        storage = %placement.storage_dtype,
        compute = %placement.computation_dtype,
        device = %placement.initial_device,
        "loaded component"
    );
    Ok(loaded)
}
