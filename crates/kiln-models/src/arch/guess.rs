use super::ArchitectureId;
use super::config::BackboneConfig;
use super::fingerprint::{BackboneView, best_match, detect_backbone_prefix};
use crate::clip;
use kiln_common::{DType, KilnError, Result, WeightBlob};
use serde::Serialize;
use tracing::{debug, info};

/// What recognition learned about a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchitectureGuess {
    pub architecture: ArchitectureId,
    /// Prefix of the backbone keys, `""` for a bare backbone checkpoint.
    pub backbone_prefix: String,
    pub vae_prefix: &'static str,
    /// Text-encoder key prefix → component name, after key processing.
    pub text_encoder_targets: &'static [(&'static str, &'static str)],
    pub backbone_config: BackboneConfig,
    pub supported_dtypes: &'static [DType],
    /// Number of distinguishing evidence rules that held.
    pub score: usize,
}

impl ArchitectureGuess {
    pub fn repo_name(&self) -> &'static str {
        self.architecture.repo_name()
    }

    pub fn backbone_target(&self) -> &'static str {
        self.architecture.backbone_target()
    }

    pub fn vae_target(&self) -> &'static str {
        "vae"
    }

    /// Rename text-encoder keys to the layout the encoder loaders expect.
    pub fn process_text_encoder_keys(&self, blob: WeightBlob) -> Result<WeightBlob> {
        clip::process_keys(self.architecture, blob)
    }
}

/// Identify the family of a weight blob from its key names and shapes.
///
/// Fails with a recognition error when no fingerprint matches, or when one
/// matches but the backbone configuration cannot be read from the
/// checkpoint. The underlying cause is kept as the error source.
pub fn guess_architecture(blob: &WeightBlob) -> Result<ArchitectureGuess> {
    let prefix = detect_backbone_prefix(blob);
    let view = BackboneView::new(blob, prefix);
    let Some((fingerprint, score)) = best_match(&view) else {
        return Err(KilnError::unrecognized(format!(
            "no fingerprint matched {} keys (backbone prefix {prefix:?})",
            blob.len()
        )));
    };
    let architecture = fingerprint.architecture;
    debug!(%architecture, score, prefix, "fingerprint matched");

    let backbone_config = BackboneConfig::from_checkpoint(architecture, &view).map_err(|e| {
        KilnError::recognition(
            format!("{architecture} matched but its backbone configuration is unreadable"),
            e,
        )
    })?;
    info!(%architecture, backbone_prefix = prefix, "recognized checkpoint");

    Ok(ArchitectureGuess {
        architecture,
        backbone_prefix: prefix.to_string(),
        vae_prefix: architecture.vae_prefix(),
        text_encoder_targets: architecture.text_encoder_targets(),
        backbone_config,
        supported_dtypes: architecture.supported_dtypes(),
        score,
    })
}
