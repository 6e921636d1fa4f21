//! Text-encoder key conventions.
//!
//! Single-file checkpoints store their text encoders under source-specific
//! prefixes and, for OpenCLIP encoders, in a flattened layout with fused
//! attention projections. [`process_keys`] rewrites them into the
//! hierarchical `<encoder>.transformer.text_model.*` layout the encoder
//! loaders expect. Applying it to an already processed blob changes nothing.

use crate::arch::ArchitectureId;
use kiln_common::{KilnError, Result, TensorData, WeightBlob};
use tracing::debug;

const SD1_SOURCE: &str = "cond_stage_model.transformer.";
const SD2_SOURCE: &str = "cond_stage_model.model.";
const SDXL_CLIP_L_SOURCE: &str = "conditioner.embedders.0.transformer.";
const SDXL_CLIP_G_SOURCE: &str = "conditioner.embedders.1.model.";
const REFINER_CLIP_G_SOURCE: &str = "conditioner.embedders.0.model.";

/// OpenCLIP names outside the residual blocks → names under `text_model.`.
const OPEN_CLIP_TOP_LEVEL: &[(&str, &str)] = &[
    ("token_embedding.weight", "embeddings.token_embedding.weight"),
    ("positional_embedding", "embeddings.position_embedding.weight"),
    ("ln_final.weight", "final_layer_norm.weight"),
    ("ln_final.bias", "final_layer_norm.bias"),
];

/// OpenCLIP residual-block sub-paths → encoder-layer sub-paths.
const OPEN_CLIP_BLOCK: &[(&str, &str)] = &[
    ("ln_1.", "layer_norm1."),
    ("ln_2.", "layer_norm2."),
    ("mlp.c_fc.", "mlp.fc1."),
    ("mlp.c_proj.", "mlp.fc2."),
    ("attn.out_proj.", "self_attn.out_proj."),
];

/// Rewrite the text-encoder keys of `blob` for `arch`.
pub fn process_keys(arch: ArchitectureId, mut blob: WeightBlob) -> Result<WeightBlob> {
    match arch {
        ArchitectureId::Sd15 => {
            move_hf_clip(&mut blob, SD1_SOURCE, "clip_l");
        }
        ArchitectureId::Sd20 => {
            convert_open_clip(&mut blob, SD2_SOURCE, "clip_h")?;
        }
        ArchitectureId::Sdxl => {
            move_hf_clip(&mut blob, SDXL_CLIP_L_SOURCE, "clip_l");
            convert_open_clip(&mut blob, SDXL_CLIP_G_SOURCE, "clip_g")?;
        }
        ArchitectureId::SdxlRefiner => {
            convert_open_clip(&mut blob, REFINER_CLIP_G_SOURCE, "clip_g")?;
        }
        ArchitectureId::Flux | ArchitectureId::FluxSchnell => return Ok(blob),
    }
    round_position_ids(&mut blob)?;
    Ok(blob)
}

/// Move an encoder already in the HF layout, inserting `text_model.` when a
/// legacy checkpoint flattened it away.
fn move_hf_clip(blob: &mut WeightBlob, source: &str, target: &str) {
    let moved = blob.take_prefix(source);
    if moved.is_empty() {
        return;
    }
    debug!(source, target, keys = moved.len(), "moving clip text encoder");
    for (rest, tensor) in moved {
        let key = if rest.starts_with("text_model.") {
            format!("{target}.transformer.{rest}")
        } else {
            format!("{target}.transformer.text_model.{rest}")
        };
        blob.insert(key, tensor);
    }
}

fn convert_open_clip(blob: &mut WeightBlob, source: &str, target: &str) -> Result<()> {
    let moved = blob.take_prefix(source);
    if moved.is_empty() {
        return Ok(());
    }
    debug!(source, target, keys = moved.len(), "converting OpenCLIP text encoder");
    let text_model = format!("{target}.transformer.text_model");
    for (rest, tensor) in moved {
        if let Some((_, to)) = OPEN_CLIP_TOP_LEVEL.iter().find(|(from, _)| *from == rest) {
            blob.insert(format!("{text_model}.{to}"), tensor);
            continue;
        }
        match rest.as_str() {
            "text_projection" => {
                blob.insert(
                    format!("{target}.transformer.text_projection.weight"),
                    tensor.transpose_2d()?,
                );
                continue;
            }
            "logit_scale" => {
                blob.insert(format!("{target}.logit_scale"), tensor);
                continue;
            }
            _ => {}
        }
        let Some((layer, sub)) = rest
            .strip_prefix("transformer.resblocks.")
            .and_then(|r| r.split_once('.'))
        else {
            // Unknown OpenCLIP entries (e.g. `attn_mask`) stay put and are
            // dropped by the partitioner.
            blob.insert(format!("{source}{rest}"), tensor);
            continue;
        };
        let layer_prefix = format!("{text_model}.encoder.layers.{layer}");
        match sub {
            "attn.in_proj_weight" | "attn.in_proj_bias" => {
                let suffix = if sub.ends_with("weight") { "weight" } else { "bias" };
                let parts = tensor.split_rows(3).map_err(|e| {
                    KilnError::Tensor(format!("{source}{rest}: fused q/k/v projection: {e}"))
                })?;
                for (proj, part) in ["q_proj", "k_proj", "v_proj"].iter().zip(parts) {
                    blob.insert(format!("{layer_prefix}.self_attn.{proj}.{suffix}"), part);
                }
            }
            _ => match OPEN_CLIP_BLOCK.iter().find(|(from, _)| sub.starts_with(from)) {
                Some((from, to)) => {
                    blob.insert(format!("{layer_prefix}.{to}{}", &sub[from.len()..]), tensor);
                }
                None => {
                    blob.insert(format!("{source}{rest}"), tensor);
                }
            },
        }
    }
    Ok(())
}

/// Some checkpoints store CLIP `position_ids` as floats, occasionally with
/// drift such as `76.99998`. The encoder indexes with them, so round to int64.
fn round_position_ids(blob: &mut WeightBlob) -> Result<()> {
    let keys: Vec<String> = blob
        .iter()
        .filter(|(k, t)| k.ends_with(".embeddings.position_ids") && t.dtype().is_castable_float())
        .map(|(k, _)| k.clone())
        .collect();
    for key in keys {
        let Some(tensor) = blob.remove(&key) else { continue };
        let ids: Vec<i64> = tensor.to_f32_vec()?.into_iter().map(|v| v.round() as i64).collect();
        let fixed = TensorData::from_i64(tensor.shape().to_vec(), &ids)?.with_device(tensor.device());
        debug!(key, "rounded float position_ids");
        blob.insert(key, fixed);
    }
    Ok(())
}
