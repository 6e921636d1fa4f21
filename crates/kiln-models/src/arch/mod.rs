//! Known model architectures and recognition of checkpoints from key names.

mod config;
mod fingerprint;
mod guess;

pub use config::{BackboneConfig, FluxConfig, UnetConfig};
pub use fingerprint::{BACKBONE_PREFIXES, BackboneView, FINGERPRINTS, Fingerprint, detect_backbone_prefix};
pub use guess::{ArchitectureGuess, guess_architecture};

use kiln_common::DType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a supported model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchitectureId {
    Sd15,
    Sd20,
    Sdxl,
    SdxlRefiner,
    Flux,
    FluxSchnell,
}

const SD_INFERENCE_DTYPES: &[DType] = &[DType::F16, DType::F32];
const SDXL_INFERENCE_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];
const FLUX_INFERENCE_DTYPES: &[DType] = &[DType::BF16, DType::F16, DType::F32];

const UNET_ROOTS: &[&str] =
    &["input_blocks", "middle_block", "output_blocks", "time_embed", "label_emb", "out"];
const FLUX_ROOTS: &[&str] = &[
    "img_in",
    "txt_in",
    "time_in",
    "vector_in",
    "guidance_in",
    "double_blocks",
    "single_blocks",
    "final_layer",
];

/// Whether `segment` is a top-level module of any supported backbone.
pub(crate) fn is_backbone_root(segment: &str) -> bool {
    UNET_ROOTS.contains(&segment) || FLUX_ROOTS.contains(&segment)
}

impl ArchitectureId {
    pub const ALL: [ArchitectureId; 6] =
        [Self::Sd15, Self::Sd20, Self::Sdxl, Self::SdxlRefiner, Self::Flux, Self::FluxSchnell];

    /// Name of the pipeline layout in the known-architecture repository.
    pub const fn repo_name(self) -> &'static str {
        match self {
            Self::Sd15 => "runwayml/stable-diffusion-v1-5",
            Self::Sd20 => "stabilityai/stable-diffusion-2-1",
            Self::Sdxl => "stabilityai/stable-diffusion-xl-base-1.0",
            Self::SdxlRefiner => "stabilityai/stable-diffusion-xl-refiner-1.0",
            Self::Flux => "black-forest-labs/FLUX.1-dev",
            Self::FluxSchnell => "black-forest-labs/FLUX.1-schnell",
        }
    }

    pub const fn is_flux(self) -> bool {
        matches!(self, Self::Flux | Self::FluxSchnell)
    }

    /// Component name the backbone subset is assigned to.
    pub const fn backbone_target(self) -> &'static str {
        if self.is_flux() { "transformer" } else { "unet" }
    }

    pub const fn vae_prefix(self) -> &'static str {
        if self.is_flux() { "vae." } else { "first_stage_model." }
    }

    /// Text-encoder key prefix (without the trailing dot) → component name,
    /// after key-convention processing.
    pub const fn text_encoder_targets(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Sd15 => &[("clip_l", "text_encoder")],
            Self::Sd20 => &[("clip_h", "text_encoder")],
            Self::Sdxl => &[("clip_l", "text_encoder"), ("clip_g", "text_encoder_2")],
            Self::SdxlRefiner => &[("clip_g", "text_encoder_2")],
            Self::Flux | Self::FluxSchnell => &[
                ("text_encoders.clip_l", "text_encoder"),
                ("text_encoders.t5xxl", "text_encoder_2"),
            ],
        }
    }

    /// Inference dtypes in preference order.
    pub const fn supported_dtypes(self) -> &'static [DType] {
        match self {
            Self::Sd15 | Self::Sd20 => SD_INFERENCE_DTYPES,
            Self::Sdxl | Self::SdxlRefiner => SDXL_INFERENCE_DTYPES,
            Self::Flux | Self::FluxSchnell => FLUX_INFERENCE_DTYPES,
        }
    }

    /// Top-level module names of the backbone, used for bare checkpoints.
    pub const fn backbone_roots(self) -> &'static [&'static str] {
        if self.is_flux() { FLUX_ROOTS } else { UNET_ROOTS }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sd15 => "sd15",
            Self::Sd20 => "sd20",
            Self::Sdxl => "sdxl",
            Self::SdxlRefiner => "sdxl_refiner",
            Self::Flux => "flux",
            Self::FluxSchnell => "flux_schnell",
        }
    }
}

impl fmt::Display for ArchitectureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchitectureId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "sd15" | "sd1" | "sd1.5" => Ok(Self::Sd15),
            "sd20" | "sd2" | "sd2.1" => Ok(Self::Sd20),
            "sdxl" => Ok(Self::Sdxl),
            "sdxl_refiner" | "refiner" => Ok(Self::SdxlRefiner),
            "flux" | "flux_dev" => Ok(Self::Flux),
            "flux_schnell" | "schnell" => Ok(Self::FluxSchnell),
            other => Err(format!("unknown architecture: {other}")),
        }
    }
}
