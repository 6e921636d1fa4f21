//! Storage/computation dtype and device placement policy.
//!
//! One decision per component, taken at load time from the component's
//! parameter count, the dtype found in its checkpoint, the architecture's
//! supported dtypes, an optional explicit override and a memory snapshot.

use crate::config::{LoaderConfig, VramMode};
use crate::memory::MemorySnapshot;
use crate::{DType, Device, KilnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// What a component is for, as far as placement is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentRole {
    Backbone,
    TextEncoder,
    Autoencoder,
}

impl ComponentRole {
    /// Preference list used when the caller supplies none.
    pub const fn default_supported(self) -> &'static [DType] {
        match self {
            Self::Backbone => &[DType::F16, DType::BF16, DType::F32],
            Self::TextEncoder => &[DType::F16, DType::BF16, DType::F32],
            Self::Autoencoder => &[DType::BF16, DType::F32],
        }
    }

    /// The configured override for this role.
    pub fn storage_override(self, config: &LoaderConfig) -> Option<DType> {
        match self {
            Self::Backbone => config.storage.backbone,
            Self::TextEncoder => config.storage.text_encoder,
            Self::Autoencoder => config.storage.autoencoder,
        }
    }
}

impl fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backbone => write!(f, "backbone"),
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Autoencoder => write!(f, "autoencoder"),
        }
    }
}

/// Inputs for one placement decision.
#[derive(Debug, Clone)]
pub struct PolicyRequest<'a> {
    pub component: &'a str,
    pub role: ComponentRole,
    pub parameter_count: u64,
    /// Dtype detected in the component's checkpoint subset.
    pub checkpoint_dtype: Option<DType>,
    /// Supported dtypes in preference order. Empty means the role default.
    pub supported: &'a [DType],
    pub storage_override: Option<DType>,
}

/// The outcome of a placement decision, kept on the loaded component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub storage_dtype: DType,
    pub computation_dtype: DType,
    /// Device weights are materialized against while loading.
    pub load_device: Device,
    /// Device the component lives on right after loading.
    pub initial_device: Device,
    /// Device the component returns to when not in use.
    pub offload_device: Device,
    /// Activations must be cast per forward pass.
    pub manual_cast: bool,
}

impl Placement {
    /// Whether the component is kept in slow memory and moved in on use.
    pub fn is_offloaded(&self) -> bool {
        !self.initial_device.is_accelerator() && self.load_device.is_accelerator()
    }
}

/// Placement policy bound to one loader configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DtypePolicy {
    vram_mode: VramMode,
}

impl DtypePolicy {
    pub fn new(vram_mode: VramMode) -> Self {
        Self { vram_mode }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.memory.vram_mode)
    }

    pub fn vram_mode(&self) -> VramMode {
        self.vram_mode
    }

    /// Decide storage dtype, computation dtype and devices for a component.
    pub fn decide(&self, req: &PolicyRequest<'_>, memory: &MemorySnapshot) -> Result<Placement> {
        let supported =
            if req.supported.is_empty() { req.role.default_supported() } else { req.supported };

        let storage_dtype = self.storage_dtype(req, supported, memory)?;
        let computation_dtype = supported
            .iter()
            .copied()
            .find(|d| d.is_castable_float() && memory.is_native(*d))
            .unwrap_or(DType::F32);

        // 4-bit weights are quantized only after transfer, so they arrive at
        // the compute width.
        let placement_dtype =
            if storage_dtype.is_four_bit() { computation_dtype } else { storage_dtype };
        let footprint = placement_dtype.footprint_bytes(req.parameter_count);

        let compute = memory.compute_device;
        let initial_device = match (self.vram_mode, req.role) {
            (_, ComponentRole::TextEncoder | ComponentRole::Autoencoder) => Device::Cpu,
            (VramMode::High, ComponentRole::Backbone) => compute,
            (VramMode::Low, ComponentRole::Backbone) => Device::Cpu,
            (VramMode::Normal, ComponentRole::Backbone) => {
                if compute.is_accelerator()
                    && memory.fast_free_bytes > memory.slow_free_bytes
                    && footprint <= memory.fast_free_bytes
                {
                    compute
                } else {
                    Device::Cpu
                }
            }
        };
        let offload_device = if self.vram_mode == VramMode::High { compute } else { Device::Cpu };

        let placement = Placement {
            storage_dtype,
            computation_dtype,
            load_device: compute,
            initial_device,
            offload_device,
            manual_cast: storage_dtype != computation_dtype,
        };
        debug!(
            component = req.component,
            role = %req.role,
            params = req.parameter_count,
            storage = %placement.storage_dtype,
            compute = %placement.computation_dtype,
            initial = %placement.initial_device,
            offload = %placement.offload_device,
            manual_cast = placement.manual_cast,
            "placement decided"
        );
        Ok(placement)
    }

    fn storage_dtype(
        &self,
        req: &PolicyRequest<'_>,
        supported: &[DType],
        memory: &MemorySnapshot,
    ) -> Result<DType> {
        let on_disk = req.checkpoint_dtype.filter(|d| d.is_quantized());

        if let Some(requested) = req.storage_override {
            if let Some(on_disk) = on_disk
                && on_disk != requested
            {
                return Err(KilnError::ConflictingStorageOverride {
                    component: req.component.to_string(),
                    requested,
                    on_disk,
                });
            }
            return Ok(requested);
        }

        if let Some(on_disk) = on_disk {
            debug!(component = req.component, dtype = %on_disk, "preserving pre-quantized storage");
            return Ok(on_disk);
        }

        if self.vram_mode == VramMode::High {
            return supported.first().copied().ok_or_else(|| empty_supported(req));
        }
        let fits = |d: &DType| d.footprint_bytes(req.parameter_count) <= memory.fast_free_bytes;
        if let Some(dtype) = supported.iter().copied().find(fits) {
            return Ok(dtype);
        }
        // Smallest footprint; min_by_key keeps the earliest on ties.
        supported
            .iter()
            .copied()
            .min_by_key(|d| d.footprint_bytes(req.parameter_count))
            .ok_or_else(|| empty_supported(req))
    }
}

fn empty_supported(req: &PolicyRequest<'_>) -> KilnError {
    KilnError::Config(format!("{}: no supported storage dtypes", req.component))
}
