//! Structural configuration of the backbone, reconciled against the checkpoint.

use super::ArchitectureId;
use super::fingerprint::BackboneView;
use kiln_common::{KilnError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub model_channels: usize,
    pub context_dim: usize,
    pub adm_in_channels: Option<usize>,
    pub channel_mult: Vec<usize>,
    pub num_res_blocks: usize,
    /// Transformer blocks per resolution level.
    pub transformer_depth: Vec<usize>,
    pub use_linear_in_transformer: bool,
    pub num_heads: Option<usize>,
    pub num_head_channels: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxConfig {
    pub in_channels: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub depth: usize,
    pub depth_single_blocks: usize,
    pub guidance_embed: bool,
    pub vec_in_dim: usize,
    pub context_in_dim: usize,
    pub axes_dim: Vec<usize>,
    pub theta: u32,
    pub mlp_ratio: f32,
    pub qkv_bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackboneConfig {
    Unet(UnetConfig),
    Flux(FluxConfig),
}

impl UnetConfig {
    pub fn family_defaults(arch: ArchitectureId) -> Self {
        let base = UnetConfig {
            in_channels: 4,
            out_channels: 4,
            model_channels: 320,
            context_dim: 768,
            adm_in_channels: None,
            channel_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            transformer_depth: vec![1, 1, 1, 0],
            use_linear_in_transformer: false,
            num_heads: Some(8),
            num_head_channels: None,
        };
        match arch {
            ArchitectureId::Sd20 => UnetConfig {
                context_dim: 1024,
                use_linear_in_transformer: true,
                num_heads: None,
                num_head_channels: Some(64),
                ..base
            },
            ArchitectureId::Sdxl => UnetConfig {
                context_dim: 2048,
                adm_in_channels: Some(2816),
                channel_mult: vec![1, 2, 4],
                transformer_depth: vec![0, 2, 10],
                use_linear_in_transformer: true,
                num_heads: None,
                num_head_channels: Some(64),
                ..base
            },
            ArchitectureId::SdxlRefiner => UnetConfig {
                model_channels: 384,
                context_dim: 1280,
                adm_in_channels: Some(2560),
                transformer_depth: vec![0, 4, 4, 0],
                use_linear_in_transformer: true,
                num_heads: None,
                num_head_channels: Some(64),
                ..base
            },
            _ => base,
        }
    }

    /// Family defaults overridden by whatever the checkpoint determines.
    pub fn from_checkpoint(arch: ArchitectureId, view: &BackboneView<'_>) -> Result<Self> {
        let mut cfg = Self::family_defaults(arch);
        let conv_in = view.shape("input_blocks.0.0.weight").ok_or_else(|| {
            KilnError::Tensor("unet checkpoint has no input_blocks.0.0.weight".to_string())
        })?;
        let &[model_channels, in_channels, ..] = conv_in.as_slice() else {
            return Err(KilnError::Tensor(format!(
                "input_blocks.0.0.weight has shape {conv_in:?}, expected a convolution"
            )));
        };
        cfg.model_channels = model_channels;
        cfg.in_channels = in_channels;
        if let Some(out) = view.dim("out.2.weight", 0) {
            cfg.out_channels = out;
        }
        if let Some(width) = view.context_dim() {
            cfg.context_dim = width;
        }
        cfg.adm_in_channels = view.dim("label_emb.0.0.weight", 1);
        if let Some(linear) = view.uses_linear_projection() {
            cfg.use_linear_in_transformer = linear;
        }
        let stride = cfg.num_res_blocks + 1;
        cfg.transformer_depth = (0..cfg.channel_mult.len())
            .map(|level| {
                view.count_indices(&format!("input_blocks.{}.1.transformer_blocks", 1 + level * stride))
            })
            .collect();
        Ok(cfg)
    }
}

impl FluxConfig {
    pub fn family_defaults(arch: ArchitectureId) -> Self {
        FluxConfig {
            in_channels: 64,
            hidden_size: 3072,
            num_heads: 24,
            depth: 19,
            depth_single_blocks: 38,
            guidance_embed: arch == ArchitectureId::Flux,
            vec_in_dim: 768,
            context_in_dim: 4096,
            axes_dim: vec![16, 56, 56],
            theta: 10_000,
            mlp_ratio: 4.0,
            qkv_bias: true,
        }
    }

    pub fn from_checkpoint(arch: ArchitectureId, view: &BackboneView<'_>) -> Result<Self> {
        let mut cfg = Self::family_defaults(arch);
        if let Some(shape) = view.shape("img_in.weight") {
            let &[hidden, in_channels] = shape.as_slice() else {
                return Err(KilnError::Tensor(format!(
                    "img_in.weight has shape {shape:?}, expected a linear weight"
                )));
            };
            cfg.hidden_size = hidden;
            cfg.in_channels = in_channels;
            cfg.num_heads = hidden / 128;
        }
        if let Some(width) = view.dim("txt_in.weight", 1) {
            cfg.context_in_dim = width;
        }
        if let Some(width) = view.dim("vector_in.in_layer.weight", 1) {
            cfg.vec_in_dim = width;
        }
        let depth = view.count_indices("double_blocks");
        if depth > 0 {
            cfg.depth = depth;
        }
        // A checkpoint may legitimately carry no single-stream blocks.
        cfg.depth_single_blocks = view.count_indices("single_blocks");
        cfg.guidance_embed = view.contains("guidance_in.in_layer.weight");
        Ok(cfg)
    }
}

impl BackboneConfig {
    pub fn from_checkpoint(arch: ArchitectureId, view: &BackboneView<'_>) -> Result<Self> {
        if arch.is_flux() {
            FluxConfig::from_checkpoint(arch, view).map(Self::Flux)
        } else {
            UnetConfig::from_checkpoint(arch, view).map(Self::Unet)
        }
    }

    pub fn as_unet(&self) -> Option<&UnetConfig> {
        match self {
            Self::Unet(cfg) => Some(cfg),
            Self::Flux(_) => None,
        }
    }

    pub fn as_flux(&self) -> Option<&FluxConfig> {
        match self {
            Self::Flux(cfg) => Some(cfg),
            Self::Unet(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::{DType, TensorData, WeightBlob};

    fn t(shape: &[usize]) -> TensorData {
        TensorData::zeros(shape.to_vec(), DType::F16).unwrap()
    }

    #[test]
    fn unet_config_counts_transformer_depth() {
        let mut blob = WeightBlob::new();
        blob.insert("input_blocks.0.0.weight", t(&[320, 9, 3, 3]));
        blob.insert("out.2.weight", t(&[4, 320, 3, 3]));
        blob.insert("input_blocks.1.1.proj_in.weight", t(&[320, 320]));
        blob.insert("input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight", t(&[320, 1024]));
        blob.insert("input_blocks.4.1.transformer_blocks.0.attn2.to_k.weight", t(&[640, 1024]));
        blob.insert("input_blocks.7.1.transformer_blocks.0.attn1.to_q.weight", t(&[1280, 1280]));
        let cfg =
            UnetConfig::from_checkpoint(ArchitectureId::Sd20, &BackboneView::new(&blob, "")).unwrap();
        assert_eq!(cfg.in_channels, 9);
        assert_eq!(cfg.context_dim, 1024);
        assert!(cfg.use_linear_in_transformer);
        assert_eq!(cfg.transformer_depth, vec![1, 1, 1, 0]);
        assert_eq!(cfg.num_head_channels, Some(64));
    }

    #[test]
    fn unet_config_requires_conv_in() {
        let blob = WeightBlob::new();
        let err = UnetConfig::from_checkpoint(ArchitectureId::Sd15, &BackboneView::new(&blob, ""))
            .unwrap_err();
        assert!(err.to_string().contains("input_blocks.0.0.weight"));
    }

    #[test]
    fn flux_config_reads_widths_and_depths() {
        let mut blob = WeightBlob::new();
        blob.insert("img_in.weight", t(&[256, 64]));
        blob.insert("txt_in.weight", t(&[256, 512]));
        for i in 0..2 {
            blob.insert(format!("double_blocks.{i}.img_attn.norm.key_norm.scale"), t(&[128]));
        }
        blob.insert("single_blocks.0.linear1.weight", t(&[4, 4]));
        let cfg = FluxConfig::from_checkpoint(ArchitectureId::FluxSchnell, &BackboneView::new(&blob, ""))
            .unwrap();
        assert_eq!(cfg.hidden_size, 256);
        assert_eq!(cfg.num_heads, 2);
        assert_eq!(cfg.context_in_dim, 512);
        assert_eq!(cfg.depth, 2);
        assert_eq!(cfg.depth_single_blocks, 1);
        assert!(!cfg.guidance_embed);
    }

    #[test]
    fn backbone_config_serializes_tagged() {
        let cfg = BackboneConfig::Flux(FluxConfig::family_defaults(ArchitectureId::Flux));
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["type"], "flux");
        assert_eq!(json["hidden_size"], 3072);
        let back: BackboneConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }
}
