//! Splitting a recognized weight blob into per-component state dicts.

use crate::arch::{ArchitectureGuess, guess_architecture};
use kiln_common::{Result, WeightBlob};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Component name → its slice of the checkpoint, plus the keys nobody claimed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionedStateDicts {
    subsets: BTreeMap<String, WeightBlob>,
    dropped: Vec<String>,
}

impl PartitionedStateDicts {
    pub fn get(&self, component: &str) -> Option<&WeightBlob> {
        self.subsets.get(component)
    }

    /// Remove and return a component's subset.
    pub fn take(&mut self, component: &str) -> Option<WeightBlob> {
        self.subsets.remove(component)
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.subsets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WeightBlob)> {
        self.subsets.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys that matched no component prefix, sorted.
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    /// Keys assigned to any component.
    pub fn assigned_len(&self) -> usize {
        self.subsets.values().map(WeightBlob::len).sum()
    }

    fn assign(&mut self, component: &str, blob: WeightBlob) {
        if blob.is_empty() {
            return;
        }
        debug!(component, keys = blob.len(), "assigned state dict");
        self.subsets.insert(component.to_string(), blob);
    }
}

/// Recognize the architecture of `blob` and split it.
///
/// `vae`, when given, replaces whatever autoencoder weights `blob` carries.
pub fn recognize(
    blob: &WeightBlob,
    vae: Option<WeightBlob>,
) -> Result<(PartitionedStateDicts, ArchitectureGuess)> {
    let guess = guess_architecture(blob)?;
    let parts = split_state_dict(blob, &guess, vae)?;
    Ok((parts, guess))
}

/// Split `blob` according to an existing guess. The input is left untouched.
pub fn split_state_dict(
    blob: &WeightBlob,
    guess: &ArchitectureGuess,
    vae: Option<WeightBlob>,
) -> Result<PartitionedStateDicts> {
    let mut rest = blob.clone();
    let mut parts = PartitionedStateDicts::default();

    let backbone = take_backbone(&mut rest, guess);
    parts.assign(guess.backbone_target(), backbone);

    let embedded_vae = rest.take_prefix(guess.vae_prefix);
    match vae {
        Some(external) => {
            info!(keys = external.len(), replaced = embedded_vae.len(), "using external VAE");
            parts.dropped.extend(embedded_vae.keys().map(|k| format!("{}{k}", guess.vae_prefix)));
            parts.assign(guess.vae_target(), external);
        }
        None => parts.assign(guess.vae_target(), embedded_vae),
    }

    // Key processing may be global to the remainder, so it runs once before
    // any per-encoder filtering.
    let mut rest = guess.process_text_encoder_keys(rest)?;
    for (prefix, target) in guess.text_encoder_targets {
        let subset = rest.take_prefix(&format!("{prefix}."));
        parts.assign(target, subset);
    }

    parts.dropped.extend(rest.keys().map(str::to_string));
    parts.dropped.sort();
    if !parts.dropped.is_empty() {
        info!(count = parts.dropped.len(), "dropped unclaimed checkpoint keys");
        debug!(keys = ?parts.dropped, "dropped keys");
    }
    Ok(parts)
}

/// Backbone keys: everything under the detected prefix, or for bare
/// checkpoints every key whose first segment is a backbone root module.
fn take_backbone(rest: &mut WeightBlob, guess: &ArchitectureGuess) -> WeightBlob {
    if !guess.backbone_prefix.is_empty() {
        return rest.take_prefix(&guess.backbone_prefix);
    }
    let roots = guess.architecture.backbone_roots();
    let keys: Vec<String> = rest
        .keys()
        .filter(|k| roots.contains(&k.split('.').next().unwrap_or_default()))
        .map(str::to_string)
        .collect();
    keys.into_iter()
        .filter_map(|k| rest.remove(&k).map(|t| (k, t)))
        .collect()
}
