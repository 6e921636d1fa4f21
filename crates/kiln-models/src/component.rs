//! Loaded components and the state-dict → skeleton load routine.

use crate::arch::BackboneConfig;
use crate::factory::{ModuleSkeleton, ParameterRole};
use kiln_common::{
    ComponentRole, DType, Device, KilnError, Placement, QuantizationConfig, Result, TensorData,
    WeightBlob,
};
use kiln_quantization::{Param4bit, QuantKernel, QuantSettings, QuantType};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// The closed set of component kinds a pipeline can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Tokenizer,
    Scheduler,
    FeatureExtractor,
    SafetyChecker,
    Autoencoder,
    ClipTextEncoder,
    T5TextEncoder,
    Backbone,
    Unsupported,
}

impl ComponentKind {
    /// Classify a `(name, library, class)` entry of a pipeline layout.
    pub fn classify(name: &str, library: &str, class: &str) -> Self {
        match name {
            "feature_extractor" => return Self::FeatureExtractor,
            "safety_checker" => return Self::SafetyChecker,
            _ => {}
        }
        if !matches!(library, "transformers" | "diffusers") {
            return Self::Unsupported;
        }
        if name == "scheduler" {
            return Self::Scheduler;
        }
        if name.starts_with("tokenizer") {
            return Self::Tokenizer;
        }
        match class {
            "AutoencoderKL" => Self::Autoencoder,
            "CLIPTextModel" | "CLIPTextModelWithProjection" if name.starts_with("text_encoder") => {
                Self::ClipTextEncoder
            }
            "T5EncoderModel" => Self::T5TextEncoder,
            "UNet2DConditionModel" | "FluxTransformer2DModel" => Self::Backbone,
            _ => Self::Unsupported,
        }
    }

    /// Placement role of kinds that carry weights.
    pub const fn role(self) -> Option<ComponentRole> {
        match self {
            Self::Autoencoder => Some(ComponentRole::Autoencoder),
            Self::ClipTextEncoder | Self::T5TextEncoder => Some(ComponentRole::TextEncoder),
            Self::Backbone => Some(ComponentRole::Backbone),
            _ => None,
        }
    }

    pub const fn is_text_encoder(self) -> bool {
        matches!(self, Self::ClipTextEncoder | Self::T5TextEncoder)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tokenizer => "tokenizer",
            Self::Scheduler => "scheduler",
            Self::FeatureExtractor => "feature_extractor",
            Self::SafetyChecker => "safety_checker",
            Self::Autoencoder => "autoencoder",
            Self::ClipTextEncoder => "clip_text_encoder",
            Self::T5TextEncoder => "t5_text_encoder",
            Self::Backbone => "backbone",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys a load may leave unmatched on either side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyTolerance {
    /// Keys starting with this prefix are ignored entirely.
    pub ignore_prefix: Option<&'static str>,
    /// Keys that may be absent from the checkpoint or present without a slot.
    pub allow_missing: &'static [&'static str],
}

impl KeyTolerance {
    pub const STRICT: Self = Self { ignore_prefix: None, allow_missing: &[] };

    /// Legacy loss-tracking tensors are never used at inference.
    pub const AUTOENCODER: Self = Self { ignore_prefix: Some("loss."), allow_missing: &[] };

    pub const CLIP: Self = Self {
        ignore_prefix: None,
        allow_missing: &[
            "transformer.text_projection.weight",
            "transformer.text_model.embeddings.position_ids",
            "logit_scale",
        ],
    };

    pub const T5: Self =
        Self { ignore_prefix: None, allow_missing: &["transformer.encoder.embed_tokens.weight"] };

    pub fn tolerates(&self, key: &str) -> bool {
        self.ignore_prefix.is_some_and(|p| key.starts_with(p)) || self.allow_missing.contains(&key)
    }
}

/// A materialized parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Dense(TensorData),
    FourBit(Param4bit),
}

impl Parameter {
    pub fn device(&self) -> Device {
        match self {
            Self::Dense(t) => t.device(),
            Self::FourBit(p) => p.device(),
        }
    }

    pub fn numel(&self) -> usize {
        match self {
            Self::Dense(t) => t.numel(),
            Self::FourBit(p) => p.numel(),
        }
    }

    /// Element dtype of dense parameters; the 4-bit storage dtype otherwise.
    pub fn dtype(&self) -> DType {
        match self {
            Self::Dense(t) => t.dtype(),
            Self::FourBit(p) => p.quant_type().storage_dtype(),
        }
    }

    pub fn as_four_bit(&self) -> Option<&Param4bit> {
        match self {
            Self::FourBit(p) => Some(p),
            Self::Dense(_) => None,
        }
    }

    pub fn to_device(&self, device: Device, kernel: &dyn QuantKernel) -> Result<Self> {
        Ok(match self {
            Self::Dense(t) => Self::Dense(t.to_device(device)),
            Self::FourBit(p) => Self::FourBit(p.to_device(device, kernel)?),
        })
    }
}

/// A weighted component with its placement decision attached.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedComponent {
    name: String,
    kind: ComponentKind,
    class_name: String,
    placement: Placement,
    device: Device,
    parameters: BTreeMap<String, Parameter>,
    backbone_config: Option<BackboneConfig>,
}

impl LoadedComponent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Where the weights currently are.
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn parameters(&self) -> &BTreeMap<String, Parameter> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    /// Reconciled structural configuration, for the backbone only.
    pub fn backbone_config(&self) -> Option<&BackboneConfig> {
        self.backbone_config.as_ref()
    }

    pub(crate) fn with_backbone_config(mut self, config: BackboneConfig) -> Self {
        self.backbone_config = Some(config);
        self
    }

    /// Logical parameter count (4-bit weights count unpacked elements).
    pub fn parameter_count(&self) -> u64 {
        self.parameters.values().map(|p| p.numel() as u64).sum()
    }

    /// Move every parameter to `device`. Pending 4-bit weights are quantized
    /// when the target is an accelerator.
    pub fn to_device(&mut self, device: Device, kernel: &dyn QuantKernel) -> Result<()> {
        if device == self.device && self.parameters.values().all(|p| p.device() == device) {
            return Ok(());
        }
        let moved = self
            .parameters
            .iter()
            .map(|(name, p)| Ok((name.clone(), p.to_device(device, kernel)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        debug!(component = %self.name, from = %self.device, to = %device, "moved component");
        self.parameters = moved;
        self.device = device;
        Ok(())
    }

    /// Flat state dict; 4-bit statistics appear as ordinary named tensors.
    pub fn state_dict(&self) -> Result<WeightBlob> {
        let mut out = WeightBlob::new();
        for (name, p) in &self.parameters {
            match p {
                Parameter::Dense(t) => {
                    out.insert(name.as_str(), t.clone());
                }
                Parameter::FourBit(q) => out.extend(q.state_dict(name)?),
            }
        }
        Ok(out)
    }

    /// Replace the placement decision and move to its initial device.
    ///
    /// Only devices can change: weights are not re-cast or re-quantized, so a
    /// different storage dtype is rejected.
    pub fn reconfigure(&mut self, placement: Placement, kernel: &dyn QuantKernel) -> Result<()> {
        if placement.storage_dtype != self.placement.storage_dtype {
            return Err(KilnError::Config(format!(
                "{}: cannot change storage dtype from {} to {} after load",
                self.name, self.placement.storage_dtype, placement.storage_dtype
            )));
        }
        self.to_device(placement.initial_device, kernel)?;
        self.placement = placement;
        Ok(())
    }
}

/// A component built from configuration alone.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigComponent {
    pub name: String,
    pub kind: ComponentKind,
    pub class_name: String,
    pub config: Value,
}

/// Inputs of one load: what to build, where, and how strictly.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadPlan<'a> {
    pub name: &'a str,
    pub kind: ComponentKind,
    pub placement: Placement,
    pub tolerance: KeyTolerance,
    pub quantization: &'a QuantizationConfig,
}

/// Fill `skeleton` from `state`.
///
/// Every skeleton parameter must be present and every state-dict key must
/// have a slot, modulo `tolerance`. Statistics of pre-quantized 4-bit weights
/// are consumed together with their weight.
pub(crate) fn load_state_dict(
    plan: LoadPlan<'_>,
    skeleton: ModuleSkeleton,
    mut state: WeightBlob,
    kernel: &dyn QuantKernel,
) -> Result<LoadedComponent> {
    let placement = plan.placement;
    let device = placement.initial_device;
    let four_bit = QuantType::from_storage_dtype(placement.storage_dtype);

    let mut parameters = BTreeMap::new();
    let mut missing = Vec::new();
    for spec in &skeleton.parameters {
        let Some(tensor) = state.remove(&spec.name) else {
            if !plan.tolerance.tolerates(&spec.name) {
                missing.push(spec.name.clone());
            }
            continue;
        };
        let param = match (spec.role, four_bit) {
            (ParameterRole::Linear, Some(quant_type)) => {
                let stats = state.take_prefix(&format!("{}.", spec.name));
                let param = if stats.is_empty() {
                    let data = tensor.to_dtype(placement.computation_dtype)?;
                    // Quantized right away when the component starts on an accelerator.
                    Param4bit::pending(data, QuantSettings::from_config(quant_type, plan.quantization))
                        .to_device(device, kernel)?
                } else {
                    Param4bit::from_prequantized(tensor, &stats, device).map_err(|e| {
                        KilnError::Quantization(format!("{}.{}: {e}", plan.name, spec.name))
                    })?
                };
                Parameter::FourBit(param)
            }
            (role, _) => {
                Parameter::Dense(materialize_dense(&tensor, role, &placement).map_err(|e| {
                    KilnError::Tensor(format!("{}.{}: {e}", plan.name, spec.name))
                })?)
            }
        };
        parameters.insert(spec.name.clone(), param);
    }

    let unexpected: Vec<String> =
        state.keys().filter(|k| !plan.tolerance.tolerates(k)).map(str::to_string).collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        warn!(
            component = plan.name,
            missing = missing.len(),
            unexpected = unexpected.len(),
            "state dict does not match module layout"
        );
        return Err(KilnError::LoadKeyMismatch {
            component: plan.name.to_string(),
            missing,
            unexpected,
        });
    }

    debug!(
        component = plan.name,
        class = %skeleton.class_name,
        parameters = parameters.len(),
        storage = %placement.storage_dtype,
        %device,
        "loaded state dict"
    );
    Ok(LoadedComponent {
        name: plan.name.to_string(),
        kind: plan.kind,
        class_name: skeleton.class_name,
        placement,
        device,
        parameters,
        backbone_config: None,
    })
}

/// Dense parameters take the storage dtype, or the compute dtype when the
/// storage format is a quantized one that only linear weights use. Buffers
/// and integer tensors keep their dtype.
fn materialize_dense(tensor: &TensorData, role: ParameterRole, placement: &Placement) -> Result<TensorData> {
    let storage = placement.storage_dtype;
    let target = match role {
        ParameterRole::Buffer => return Ok(tensor.to_device(placement.initial_device)),
        _ if !tensor.dtype().is_float() => return Ok(tensor.to_device(placement.initial_device)),
        ParameterRole::Linear if storage.is_float8() => storage,
        _ if storage.is_quantized() => {
            // Already-narrow tensors in a float8 checkpoint stay as stored.
            if tensor.dtype().is_float8() {
                return Ok(tensor.to_device(placement.initial_device));
            }
            placement.computation_dtype
        }
        _ => storage,
    };
    Ok(tensor.to_dtype(target)?.to_device(placement.initial_device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ParameterSpec;
    use kiln_quantization::ReferenceKernel;

    fn placement(storage: DType, compute: DType, device: Device) -> Placement {
        Placement {
            storage_dtype: storage,
            computation_dtype: compute,
            load_device: device,
            initial_device: device,
            offload_device: Device::Cpu,
            manual_cast: storage != compute,
        }
    }

    fn plan(placement: Placement, tolerance: KeyTolerance) -> LoadPlan<'static> {
        static QUANT: QuantizationConfig = QuantizationConfig { blocksize: 64, compress_statistics: false };
        LoadPlan { name: "unet", kind: ComponentKind::Backbone, placement, tolerance, quantization: &QUANT }
    }

    fn skeleton() -> ModuleSkeleton {
        ModuleSkeleton::new(
            "UNet2DConditionModel",
            vec![
                ParameterSpec::new("proj.weight", ParameterRole::Linear),
                ParameterSpec::new("proj.bias", ParameterRole::Dense),
            ],
        )
    }

    fn state() -> WeightBlob {
        let w: Vec<f32> = (0..128).map(|i| (i as f32 / 64.0) - 1.0).collect();
        let mut blob = WeightBlob::new();
        blob.insert("proj.weight", TensorData::from_f32(vec![16, 8], &w).unwrap());
        blob.insert("proj.bias", TensorData::from_f32(vec![16], &[0.5; 16]).unwrap());
        blob
    }

    #[test]
    fn classify_follows_layout_rules() {
        use ComponentKind as K;
        assert_eq!(K::classify("safety_checker", "stable_diffusion", "X"), K::SafetyChecker);
        assert_eq!(K::classify("scheduler", "diffusers", "PNDMScheduler"), K::Scheduler);
        assert_eq!(K::classify("tokenizer_2", "transformers", "CLIPTokenizer"), K::Tokenizer);
        assert_eq!(K::classify("text_encoder_2", "transformers", "CLIPTextModelWithProjection"), K::ClipTextEncoder);
        assert_eq!(K::classify("image_encoder", "transformers", "CLIPTextModel"), K::Unsupported);
        assert_eq!(K::classify("text_encoder_2", "transformers", "T5EncoderModel"), K::T5TextEncoder);
        assert_eq!(K::classify("transformer", "diffusers", "FluxTransformer2DModel"), K::Backbone);
        assert_eq!(K::classify("unet", "custom_lib", "UNet2DConditionModel"), K::Unsupported);
        assert_eq!(K::classify("controlnet", "diffusers", "ControlNetModel"), K::Unsupported);
    }

    #[test]
    fn dense_load_casts_to_storage() {
        let p = placement(DType::F16, DType::F16, Device::Cpu);
        let loaded = load_state_dict(plan(p, KeyTolerance::STRICT), skeleton(), state(), &ReferenceKernel).unwrap();
        assert_eq!(loaded.parameter("proj.weight").unwrap().dtype(), DType::F16);
        assert_eq!(loaded.parameter_count(), 128 + 16);
        assert!(loaded.backbone_config().is_none());
    }

    #[test]
    fn four_bit_storage_defers_quantization() {
        let p = placement(DType::Nf4, DType::BF16, Device::Cpu);
        let mut loaded = load_state_dict(plan(p, KeyTolerance::STRICT), skeleton(), state(), &ReferenceKernel).unwrap();
        let weight = loaded.parameter("proj.weight").unwrap().as_four_bit().unwrap();
        assert!(!weight.is_quantized());
        assert_eq!(loaded.parameter("proj.bias").unwrap().dtype(), DType::BF16);

        loaded.to_device(Device::Cuda(0), &ReferenceKernel).unwrap();
        let weight = loaded.parameter("proj.weight").unwrap().as_four_bit().unwrap();
        assert!(weight.is_quantized());
        assert_eq!(loaded.device(), Device::Cuda(0));

        let sd = loaded.state_dict().unwrap();
        assert!(sd.contains_key("proj.weight.quant_state.bitsandbytes__nf4"));
        assert_eq!(sd.parameter_count(), 128 + 16);
    }

    #[test]
    fn prequantized_weights_load_without_requantizing() {
        let p = placement(DType::Nf4, DType::BF16, Device::Cuda(0));
        let source = load_state_dict(plan(p, KeyTolerance::STRICT), skeleton(), state(), &ReferenceKernel).unwrap();
        assert!(source.parameter("proj.weight").unwrap().as_four_bit().unwrap().is_quantized());
        let saved = source.state_dict().unwrap();

        let p = placement(DType::Nf4, DType::BF16, Device::Cpu);
        let reloaded = load_state_dict(plan(p, KeyTolerance::STRICT), skeleton(), saved.clone(), &ReferenceKernel).unwrap();
        let weight = reloaded.parameter("proj.weight").unwrap().as_four_bit().unwrap();
        assert!(weight.is_quantized());
        assert_eq!(weight.device(), Device::Cpu);
        let resaved = reloaded.state_dict().unwrap();
        assert_eq!(resaved.keys().collect::<Vec<_>>(), saved.keys().collect::<Vec<_>>());
        for (key, tensor) in &saved {
            assert_eq!(resaved.get(key).unwrap().bytes(), tensor.bytes(), "{key}");
        }
    }

    #[test]
    fn mismatch_reports_both_sides() {
        let mut sd = state();
        sd.remove("proj.bias");
        sd.insert("extra.weight", TensorData::from_f32(vec![1], &[0.0]).unwrap());
        sd.insert("loss.discriminator.weight", TensorData::from_f32(vec![1], &[0.0]).unwrap());
        let p = placement(DType::F32, DType::F32, Device::Cpu);
        let err = load_state_dict(plan(p, KeyTolerance::AUTOENCODER), skeleton(), sd, &ReferenceKernel).unwrap_err();
        let KilnError::LoadKeyMismatch { component, missing, unexpected } = err else {
            panic!("expected a key mismatch, got {err}");
        };
        assert_eq!(component, "unet");
        assert_eq!(missing, vec!["proj.bias".to_string()]);
        assert_eq!(unexpected, vec!["extra.weight".to_string()]);
    }

    #[test]
    fn clip_tolerance_allows_absent_position_ids() {
        let skeleton = ModuleSkeleton::new(
            "CLIPTextModel",
            vec![
                ParameterSpec::new("transformer.text_model.embeddings.position_ids", ParameterRole::Buffer),
                ParameterSpec::new("proj.bias", ParameterRole::Dense),
            ],
        );
        let mut sd = WeightBlob::new();
        sd.insert("proj.bias", TensorData::from_f32(vec![2], &[1.0, 2.0]).unwrap());
        sd.insert("logit_scale", TensorData::from_f32(vec![], &[4.6]).unwrap());
        let p = placement(DType::F16, DType::F16, Device::Cpu);
        let loaded = load_state_dict(plan(p, KeyTolerance::CLIP), skeleton, sd, &ReferenceKernel).unwrap();
        assert_eq!(loaded.parameters().len(), 1);
    }

    #[test]
    fn float8_linear_storage_keeps_checkpoint_bytes() {
        let mut sd = WeightBlob::new();
        sd.insert("proj.weight", TensorData::zeros(vec![16, 8], DType::F8E4M3).unwrap());
        sd.insert("proj.bias", TensorData::zeros(vec![16], DType::F8E4M3).unwrap());
        let p = placement(DType::F8E4M3, DType::BF16, Device::Cpu);
        let loaded = load_state_dict(plan(p, KeyTolerance::STRICT), skeleton(), sd, &ReferenceKernel).unwrap();
        assert_eq!(loaded.parameter("proj.weight").unwrap().dtype(), DType::F8E4M3);
        assert_eq!(loaded.parameter("proj.bias").unwrap().dtype(), DType::F8E4M3);
    }

    #[test]
    fn float8_storage_cannot_be_produced_from_wider_floats() {
        let p = placement(DType::F8E5M2, DType::BF16, Device::Cpu);
        let err = load_state_dict(plan(p, KeyTolerance::STRICT), skeleton(), state(), &ReferenceKernel).unwrap_err();
        assert!(err.to_string().contains("unet.proj.weight"));
    }

    #[test]
    fn reconfigure_rejects_storage_change() {
        let p = placement(DType::F16, DType::F16, Device::Cpu);
        let mut loaded = load_state_dict(plan(p, KeyTolerance::STRICT), skeleton(), state(), &ReferenceKernel).unwrap();
        let mut next = p;
        next.initial_device = Device::Metal;
        loaded.reconfigure(next, &ReferenceKernel).unwrap();
        assert_eq!(loaded.device(), Device::Metal);
        assert_eq!(loaded.placement().initial_device, Device::Metal);

        next.storage_dtype = DType::F32;
        assert!(matches!(loaded.reconfigure(next, &ReferenceKernel), Err(KilnError::Config(_))));
    }
}
