//! Loader configuration.
//!
//! Loads [`LoaderConfig`] from a TOML file (`kiln.toml`) with environment
//! variable overrides via `KILN_*` prefixed variables. The configuration is
//! owned by a single load invocation and threaded explicitly into the
//! placement policy; nothing here is process-global.

use crate::DType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How aggressively components are kept in accelerator memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VramMode {
    /// Place by budget: components that fit start in fast memory.
    #[default]
    Normal,
    /// Everything lives in fast memory, offloading is disabled.
    High,
    /// Everything starts in slow memory and is moved in only while in use.
    Low,
}

impl std::fmt::Display for VramMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for VramMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown vram mode: {other}")),
        }
    }
}

/// Explicit storage dtype overrides per component role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    /// Override: `KILN_BACKBONE_DTYPE`
    pub backbone: Option<DType>,
    /// Override: `KILN_TEXT_ENCODER_DTYPE`
    pub text_encoder: Option<DType>,
    /// Override: `KILN_AUTOENCODER_DTYPE`
    pub autoencoder: Option<DType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Override: `KILN_VRAM_MODE`
    pub vram_mode: VramMode,
    /// Cap on usable fast memory in bytes.
    /// Override: `KILN_FAST_MEMORY_LIMIT`
    pub fast_limit_bytes: Option<u64>,
    /// Cap on usable slow memory in bytes.
    /// Override: `KILN_SLOW_MEMORY_LIMIT`
    pub slow_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Elements per absmax block when quantizing at placement time.
    /// Override: `KILN_QUANT_BLOCKSIZE`
    pub blocksize: usize,
    /// Compress the per-block statistics with a nested 8-bit state.
    /// Override: `KILN_QUANT_COMPRESS_STATISTICS`
    pub compress_statistics: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self { blocksize: 64, compress_statistics: true }
    }
}

/// Configuration for one engine load.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub storage: StorageOverrides,
    pub memory: MemoryConfig,
    pub quantization: QuantizationConfig,
    /// Root of the on-disk known-architecture repository.
    /// Override: `KILN_REPOSITORY_ROOT`
    pub repository_root: Option<PathBuf>,
}

/// Errors that can occur when loading or validating a [`LoaderConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl From<ConfigError> for crate::KilnError {
    fn from(err: ConfigError) -> Self {
        crate::KilnError::Config(err.to_string())
    }
}

impl LoaderConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: LoaderConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let blocksize = self.quantization.blocksize;
        if !blocksize.is_power_of_two() || !(64..=4096).contains(&blocksize) {
            return Err(ConfigError::Validation(format!(
                "quantization.blocksize must be a power of two in 64..=4096, got {blocksize}"
            )));
        }
        for (role, dtype) in [
            ("text_encoder", self.storage.text_encoder),
            ("autoencoder", self.storage.autoencoder),
        ] {
            if let Some(dtype) = dtype
                && dtype.is_four_bit()
            {
                return Err(ConfigError::Validation(format!(
                    "storage.{role} cannot be {dtype}; 4-bit storage is only supported for the backbone"
                )));
            }
        }
        if let Some(dtype) = self.storage.backbone
            && !dtype.is_float()
            && !dtype.is_four_bit()
        {
            return Err(ConfigError::Validation(format!(
                "storage.backbone must be a float or 4-bit format, got {dtype}"
            )));
        }
        if self.memory.fast_limit_bytes == Some(0) && self.memory.vram_mode == VramMode::High {
            return Err(ConfigError::Validation(
                "memory.vram_mode = \"high\" with a zero fast memory limit".into(),
            ));
        }
        Ok(())
    }

    /// Apply `KILN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            match std::env::var(key) {
                Ok(val) => val.parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
                    key: key.into(),
                    value: val.clone(),
                    reason: e.to_string(),
                }),
                Err(_) => Ok(None),
            }
        }

        if let Some(dtype) = parse_env::<DType>("KILN_BACKBONE_DTYPE")? {
            self.storage.backbone = Some(dtype);
        }
        if let Some(dtype) = parse_env::<DType>("KILN_TEXT_ENCODER_DTYPE")? {
            self.storage.text_encoder = Some(dtype);
        }
        if let Some(dtype) = parse_env::<DType>("KILN_AUTOENCODER_DTYPE")? {
            self.storage.autoencoder = Some(dtype);
        }
        if let Some(mode) = parse_env::<VramMode>("KILN_VRAM_MODE")? {
            self.memory.vram_mode = mode;
        }
        if let Some(limit) = parse_env::<u64>("KILN_FAST_MEMORY_LIMIT")? {
            self.memory.fast_limit_bytes = Some(limit);
        }
        if let Some(limit) = parse_env::<u64>("KILN_SLOW_MEMORY_LIMIT")? {
            self.memory.slow_limit_bytes = Some(limit);
        }
        if let Some(blocksize) = parse_env::<usize>("KILN_QUANT_BLOCKSIZE")? {
            self.quantization.blocksize = blocksize;
        }
        if let Ok(val) = std::env::var("KILN_QUANT_COMPRESS_STATISTICS") {
            self.quantization.compress_statistics = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("KILN_REPOSITORY_ROOT") {
            self.repository_root = Some(PathBuf::from(val));
        }
        Ok(())
    }
}
