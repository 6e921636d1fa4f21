//! Known-architecture repositories: which components a pipeline has, and
//! their configuration files.

use crate::arch::ArchitectureId;
use kiln_common::{KilnError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One entry of a pipeline's component list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub name: String,
    pub library: String,
    pub class: String,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, library: impl Into<String>, class: impl Into<String>) -> Self {
        Self { name: name.into(), library: library.into(), class: class.into() }
    }
}

pub trait ArchitectureRepository: Send + Sync {
    /// Components of `repo`, in declaration order.
    fn components(&self, repo: &str) -> Result<Vec<ComponentSpec>>;

    /// Structural configuration of one component.
    fn load_config(&self, repo: &str, component: &str) -> Result<Value>;
}

/// Config file names tried, in order, inside a component directory.
const CONFIG_FILES: [&str; 3] = ["config.json", "tokenizer_config.json", "scheduler_config.json"];

/// Diffusers-style layout on disk: `<root>/<repo>/model_index.json` plus one
/// directory per component.
#[derive(Debug, Clone)]
pub struct DiskRepository {
    root: PathBuf,
}

impl DiskRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_json(path: &Path) -> Result<Value> {
        let bytes = fs::read(path).map_err(|e| {
            KilnError::Repository(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| KilnError::Repository(format!("invalid JSON in {}: {e}", path.display())))
    }
}

impl ArchitectureRepository for DiskRepository {
    fn components(&self, repo: &str) -> Result<Vec<ComponentSpec>> {
        let path = self.root.join(repo).join("model_index.json");
        let Value::Object(index) = Self::read_json(&path)? else {
            return Err(KilnError::Repository(format!("{} is not a JSON object", path.display())));
        };
        Ok(parse_model_index(&index))
    }

    fn load_config(&self, repo: &str, component: &str) -> Result<Value> {
        let dir = self.root.join(repo).join(component);
        if !dir.is_dir() {
            return Err(KilnError::Repository(format!(
                "component directory {} does not exist",
                dir.display()
            )));
        }
        for name in CONFIG_FILES {
            let path = dir.join(name);
            if path.is_file() {
                debug!(path = %path.display(), "reading component config");
                return Self::read_json(&path);
            }
        }
        // Tokenizers may ship vocabulary files only.
        Ok(Value::Object(Map::new()))
    }
}

/// `"name": [library, class]` entries; metadata keys (leading `_`) and
/// placeholder entries such as `[null, null]` are skipped.
fn parse_model_index(index: &Map<String, Value>) -> Vec<ComponentSpec> {
    index
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .filter_map(|(name, v)| match v.as_array().map(Vec::as_slice) {
            Some([Value::String(library), Value::String(class)]) => {
                Some(ComponentSpec::new(name.as_str(), library.as_str(), class.as_str()))
            }
            _ => None,
        })
        .collect()
}

/// In-memory repository.
#[derive(Debug, Clone, Default)]
pub struct StaticRepository {
    components: BTreeMap<String, Vec<ComponentSpec>>,
    configs: BTreeMap<(String, String), Value>,
}

impl StaticRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(
        mut self,
        repo: &str,
        name: &str,
        library: &str,
        class: &str,
    ) -> Self {
        self.components
            .entry(repo.to_string())
            .or_default()
            .push(ComponentSpec::new(name, library, class));
        self
    }

    pub fn with_config(mut self, repo: &str, component: &str, config: Value) -> Self {
        self.configs.insert((repo.to_string(), component.to_string()), config);
        self
    }

    /// Component layouts of every supported family, with empty configs.
    pub fn known() -> Self {
        const T: &str = "transformers";
        const D: &str = "diffusers";
        let sd1 = ArchitectureId::Sd15.repo_name();
        let sd2 = ArchitectureId::Sd20.repo_name();
        let xl = ArchitectureId::Sdxl.repo_name();
        let refiner = ArchitectureId::SdxlRefiner.repo_name();
        let flux_dev = ArchitectureId::Flux.repo_name();
        let flux_schnell = ArchitectureId::FluxSchnell.repo_name();

        let mut repo = Self::new()
            .with_component(sd1, "feature_extractor", T, "CLIPImageProcessor")
            .with_component(sd1, "safety_checker", "stable_diffusion", "StableDiffusionSafetyChecker")
            .with_component(sd1, "scheduler", D, "PNDMScheduler")
            .with_component(sd1, "text_encoder", T, "CLIPTextModel")
            .with_component(sd1, "tokenizer", T, "CLIPTokenizer")
            .with_component(sd1, "unet", D, "UNet2DConditionModel")
            .with_component(sd1, "vae", D, "AutoencoderKL")
            .with_component(sd2, "feature_extractor", T, "CLIPImageProcessor")
            .with_component(sd2, "scheduler", D, "DDIMScheduler")
            .with_component(sd2, "text_encoder", T, "CLIPTextModel")
            .with_component(sd2, "tokenizer", T, "CLIPTokenizer")
            .with_component(sd2, "unet", D, "UNet2DConditionModel")
            .with_component(sd2, "vae", D, "AutoencoderKL")
            .with_component(xl, "scheduler", D, "EulerDiscreteScheduler")
            .with_component(xl, "text_encoder", T, "CLIPTextModel")
            .with_component(xl, "text_encoder_2", T, "CLIPTextModelWithProjection")
            .with_component(xl, "tokenizer", T, "CLIPTokenizer")
            .with_component(xl, "tokenizer_2", T, "CLIPTokenizer")
            .with_component(xl, "unet", D, "UNet2DConditionModel")
            .with_component(xl, "vae", D, "AutoencoderKL")
            .with_component(refiner, "scheduler", D, "EulerDiscreteScheduler")
            .with_component(refiner, "text_encoder_2", T, "CLIPTextModelWithProjection")
            .with_component(refiner, "tokenizer_2", T, "CLIPTokenizer")
            .with_component(refiner, "unet", D, "UNet2DConditionModel")
            .with_component(refiner, "vae", D, "AutoencoderKL");
        for flux in [flux_dev, flux_schnell] {
            repo = repo
                .with_component(flux, "scheduler", D, "FlowMatchEulerDiscreteScheduler")
                .with_component(flux, "text_encoder", T, "CLIPTextModel")
                .with_component(flux, "text_encoder_2", T, "T5EncoderModel")
                .with_component(flux, "tokenizer", T, "CLIPTokenizer")
                .with_component(flux, "tokenizer_2", T, "T5TokenizerFast")
                .with_component(flux, "transformer", D, "FluxTransformer2DModel")
                .with_component(flux, "vae", D, "AutoencoderKL");
        }
        repo
    }
}

impl ArchitectureRepository for StaticRepository {
    fn components(&self, repo: &str) -> Result<Vec<ComponentSpec>> {
        self.components
            .get(repo)
            .cloned()
            .ok_or_else(|| KilnError::Repository(format!("unknown repository {repo}")))
    }

    fn load_config(&self, repo: &str, component: &str) -> Result<Value> {
        Ok(self
            .configs
            .get(&(repo.to_string(), component.to_string()))
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())))
    }
}
