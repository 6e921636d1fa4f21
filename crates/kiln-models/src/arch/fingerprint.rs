//! Family fingerprints evaluated over backbone-relative key names and shapes.

use super::{ArchitectureId, is_backbone_root};
use kiln_common::{FP4_STATE_MARKER, NF4_STATE_MARKER, WeightBlob};
use std::collections::BTreeSet;

/// Backbone key prefixes seen in single-file checkpoints.
pub const BACKBONE_PREFIXES: [&str; 3] = ["model.diffusion_model.", "model.model.", "net."];

/// The candidate prefix holding the most keys; `""` for bare backbones.
pub fn detect_backbone_prefix(blob: &WeightBlob) -> &'static str {
    let mut best = ("", 0usize);
    for prefix in BACKBONE_PREFIXES {
        let count = blob.count_prefix(prefix);
        if count > best.1 {
            best = (prefix, count);
        }
    }
    best.0
}

/// Read-only view of the backbone keys with the prefix stripped.
///
/// A bare view (empty prefix) only sees keys under a backbone root module,
/// so text-encoder and autoencoder keys stored alongside never count.
#[derive(Debug, Clone, Copy)]
pub struct BackboneView<'a> {
    blob: &'a WeightBlob,
    prefix: &'a str,
}

impl<'a> BackboneView<'a> {
    pub fn new(blob: &'a WeightBlob, prefix: &'a str) -> Self {
        Self { blob, prefix }
    }

    pub fn prefix(&self) -> &'a str {
        self.prefix
    }

    fn in_scope(prefix: &str, key: &str) -> bool {
        !prefix.is_empty() || key.split('.').next().is_some_and(is_backbone_root)
    }

    pub fn contains(&self, key: &str) -> bool {
        Self::in_scope(self.prefix, key) && self.blob.contains_key(&format!("{}{key}", self.prefix))
    }

    /// Backbone-relative keys.
    pub fn keys(&self) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = self.prefix;
        self.blob
            .keys()
            .filter_map(move |k| k.strip_prefix(prefix))
            .filter(move |k| Self::in_scope(prefix, k))
    }

    /// Logical shape of a weight. Packed 4-bit weights report the shape
    /// recorded in their statistics, not the shape of the packed bytes.
    pub fn shape(&self, key: &str) -> Option<Vec<usize>> {
        if !Self::in_scope(self.prefix, key) {
            return None;
        }
        let full = format!("{}{key}", self.prefix);
        let tensor = self.blob.get(&full)?;
        self.packed_shape(&full).or_else(|| Some(tensor.shape().to_vec()))
    }

    fn packed_shape(&self, full: &str) -> Option<Vec<usize>> {
        let stats = [NF4_STATE_MARKER, FP4_STATE_MARKER]
            .iter()
            .find_map(|m| self.blob.get(&format!("{full}.quant_state.{m}")))?;
        let fields: serde_json::Value = serde_json::from_slice(stats.bytes()).ok()?;
        fields
            .get("shape")?
            .as_array()?
            .iter()
            .map(|d| d.as_u64().map(|d| d as usize))
            .collect()
    }

    pub fn dim(&self, key: &str, axis: usize) -> Option<usize> {
        self.shape(key)?.get(axis).copied()
    }

    /// Width of the cross-attention context, read from the first key
    /// projection of a cross-attention block.
    pub fn context_dim(&self) -> Option<usize> {
        let key = self.keys().find(|k| k.ends_with(".attn2.to_k.weight"))?;
        self.dim(key, 1)
    }

    /// Whether the first spatial transformer projects with a linear layer.
    pub fn uses_linear_projection(&self) -> Option<bool> {
        let key = self.keys().find(|k| k.ends_with(".proj_in.weight"))?;
        Some(self.shape(key)?.len() == 2)
    }

    /// Number of distinct `N` in keys of the form `root.N.*`.
    pub fn count_indices(&self, root: &str) -> usize {
        self.keys()
            .filter_map(|k| k.strip_prefix(root)?.strip_prefix('.'))
            .filter_map(|rest| rest.split('.').next()?.parse::<usize>().ok())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// One piece of evidence about the family of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Present(&'static str),
    Absent(&'static str),
    Dim { key: &'static str, axis: usize, value: usize },
    Rank { key: &'static str, rank: usize },
    ContextDim(usize),
}

impl Rule {
    pub fn holds(&self, view: &BackboneView<'_>) -> bool {
        match *self {
            Rule::Present(key) => view.contains(key),
            Rule::Absent(key) => !view.contains(key),
            Rule::Dim { key, axis, value } => view.dim(key, axis) == Some(value),
            Rule::Rank { key, rank } => view.shape(key).is_some_and(|s| s.len() == rank),
            Rule::ContextDim(width) => view.context_dim() == Some(width),
        }
    }
}

/// Rules identifying one family: all `required` rules must hold, each
/// satisfied `evidence` rule scores a point.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprint {
    pub architecture: ArchitectureId,
    pub required: &'static [Rule],
    pub evidence: &'static [Rule],
}

impl Fingerprint {
    /// `None` when a required rule fails, otherwise the evidence score.
    pub fn score(&self, view: &BackboneView<'_>) -> Option<usize> {
        if !self.required.iter().all(|r| r.holds(view)) {
            return None;
        }
        Some(self.evidence.iter().filter(|r| r.holds(view)).count())
    }
}

const CONV_IN: &str = "input_blocks.0.0.weight";
const LABEL_EMB: &str = "label_emb.0.0.weight";
const FIRST_PROJ_IN: &str = "input_blocks.1.1.proj_in.weight";
const FLUX_KEY_NORM: &str = "double_blocks.0.img_attn.norm.key_norm.scale";
const FLUX_GUIDANCE: &str = "guidance_in.in_layer.weight";

/// Ordered most specific first; equal scores go to the earlier entry.
pub const FINGERPRINTS: &[Fingerprint] = &[
    Fingerprint {
        architecture: ArchitectureId::Sdxl,
        required: &[Rule::Dim { key: LABEL_EMB, axis: 1, value: 2816 }, Rule::ContextDim(2048)],
        evidence: &[Rule::Dim { key: CONV_IN, axis: 0, value: 320 }],
    },
    Fingerprint {
        architecture: ArchitectureId::SdxlRefiner,
        required: &[Rule::Dim { key: LABEL_EMB, axis: 1, value: 2560 }, Rule::ContextDim(1280)],
        evidence: &[Rule::Dim { key: CONV_IN, axis: 0, value: 384 }],
    },
    Fingerprint {
        architecture: ArchitectureId::Flux,
        required: &[Rule::Present(FLUX_KEY_NORM)],
        evidence: &[Rule::Present(FLUX_GUIDANCE)],
    },
    Fingerprint {
        architecture: ArchitectureId::FluxSchnell,
        required: &[Rule::Present(FLUX_KEY_NORM)],
        evidence: &[Rule::Absent(FLUX_GUIDANCE)],
    },
    Fingerprint {
        architecture: ArchitectureId::Sd20,
        required: &[Rule::Present(CONV_IN), Rule::ContextDim(1024)],
        evidence: &[
            Rule::Absent(LABEL_EMB),
            Rule::Dim { key: CONV_IN, axis: 0, value: 320 },
            Rule::Rank { key: FIRST_PROJ_IN, rank: 2 },
        ],
    },
    Fingerprint {
        architecture: ArchitectureId::Sd15,
        required: &[Rule::Present(CONV_IN), Rule::ContextDim(768)],
        evidence: &[
            Rule::Absent(LABEL_EMB),
            Rule::Dim { key: CONV_IN, axis: 0, value: 320 },
            Rule::Rank { key: FIRST_PROJ_IN, rank: 4 },
        ],
    },
];

/// Best-scoring fingerprint, first in list order on ties.
pub(crate) fn best_match(view: &BackboneView<'_>) -> Option<(&'static Fingerprint, usize)> {
    let mut best: Option<(&'static Fingerprint, usize)> = None;
    for fp in FINGERPRINTS {
        if let Some(score) = fp.score(view)
            && best.is_none_or(|(_, s)| score > s)
        {
            best = Some((fp, score));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::TensorData;

    fn t(shape: &[usize]) -> TensorData {
        TensorData::zeros(shape.to_vec(), kiln_common::DType::F16).unwrap()
    }

    fn sd15_blob(prefix: &str) -> WeightBlob {
        let mut blob = WeightBlob::new();
        blob.insert(format!("{prefix}input_blocks.0.0.weight"), t(&[320, 4, 3, 3]));
        blob.insert(format!("{prefix}input_blocks.1.1.proj_in.weight"), t(&[320, 320, 1, 1]));
        blob.insert(
            format!("{prefix}input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight"),
            t(&[320, 768]),
        );
        blob
    }

    #[test]
    fn backbone_prefix_prefers_most_keys() {
        let mut blob = sd15_blob("model.diffusion_model.");
        blob.insert("net.x", t(&[1]));
        assert_eq!(detect_backbone_prefix(&blob), "model.diffusion_model.");
        assert_eq!(detect_backbone_prefix(&sd15_blob("")), "");
    }

    #[test]
    fn sd15_scores_full_evidence() {
        let blob = sd15_blob("model.diffusion_model.");
        let view = BackboneView::new(&blob, "model.diffusion_model.");
        let (fp, score) = best_match(&view).unwrap();
        assert_eq!(fp.architecture, ArchitectureId::Sd15);
        assert_eq!(score, 3);
    }

    #[test]
    fn context_width_separates_sd2() {
        let mut blob = sd15_blob("");
        blob.insert("input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight", t(&[320, 1024]));
        blob.insert("input_blocks.1.1.proj_in.weight", t(&[320, 320]));
        let view = BackboneView::new(&blob, "");
        assert_eq!(best_match(&view).unwrap().0.architecture, ArchitectureId::Sd20);
    }

    #[test]
    fn flux_guidance_decides_variant() {
        let mut blob = WeightBlob::new();
        blob.insert(FLUX_KEY_NORM, t(&[128]));
        let view = BackboneView::new(&blob, "");
        assert_eq!(best_match(&view).unwrap().0.architecture, ArchitectureId::FluxSchnell);
        blob.insert(FLUX_GUIDANCE, t(&[3072, 256]));
        let view = BackboneView::new(&blob, "");
        assert_eq!(best_match(&view).unwrap().0.architecture, ArchitectureId::Flux);
    }

    #[test]
    fn packed_weights_report_logical_shape() {
        let mut blob = sd15_blob("");
        let key = "input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight";
        blob.insert(key, TensorData::from_u8(vec![320 * 768 / 2, 1], vec![0; 320 * 768 / 2]).unwrap());
        let json = br#"{"quant_type":"nf4","blocksize":64,"dtype":"float16","shape":[320,768]}"#;
        blob.insert(
            format!("{key}.quant_state.bitsandbytes__nf4"),
            TensorData::from_u8(vec![json.len()], json.to_vec()).unwrap(),
        );
        let view = BackboneView::new(&blob, "");
        assert_eq!(view.context_dim(), Some(768));
    }

    #[test]
    fn count_indices_counts_distinct_blocks() {
        let mut blob = WeightBlob::new();
        for i in [0, 1, 1, 3] {
            blob.insert(format!("double_blocks.{i}.img_mod.lin.weight"), t(&[1]));
        }
        blob.insert("double_blocks_extra.0.w", t(&[1]));
        assert_eq!(BackboneView::new(&blob, "").count_indices("double_blocks"), 3);
    }

    #[test]
    fn bare_view_ignores_keys_outside_backbone_roots() {
        let mut blob = sd15_blob("");
        // Sorts ahead of the backbone keys and would otherwise set the context width.
        blob.insert("cond_stage_model.model.transformer.resblocks.0.attn2.to_k.weight", t(&[1024, 1024]));
        blob.insert("first_stage_model.input_blocks.0.0.weight", t(&[128, 3, 3, 3]));
        let view = BackboneView::new(&blob, "");
        assert_eq!(view.context_dim(), Some(768));
        assert!(!view.contains("first_stage_model.input_blocks.0.0.weight"));
        assert_eq!(view.shape("first_stage_model.input_blocks.0.0.weight"), None);
        assert_eq!(view.keys().count(), 3);
        assert_eq!(best_match(&view).unwrap().0.architecture, ArchitectureId::Sd15);

        // Prefixed views are already scoped by their prefix.
        let mut blob = sd15_blob("model.diffusion_model.");
        blob.insert("model.diffusion_model.extra.w", t(&[1]));
        assert!(BackboneView::new(&blob, "model.diffusion_model.").contains("extra.w"));
    }

    #[test]
    fn nothing_matches_random_keys() {
        let mut blob = WeightBlob::new();
        blob.insert("encoder.layer.0.weight", t(&[4, 4]));
        assert!(best_match(&BackboneView::new(&blob, "")).is_none());
    }
}
