//! Memory budget providers.
//!
//! A [`MemoryBudget`] reports how much memory each tier has free and which
//! device computation runs on. The placement policy consults one snapshot per
//! component.

use crate::config::MemoryConfig;
use crate::{DType, Device};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Free memory per tier at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Preferred device for computation.
    pub compute_device: Device,
    pub fast_free_bytes: u64,
    pub slow_free_bytes: u64,
    /// Element dtypes the compute device executes natively.
    pub native_compute: Vec<DType>,
}

impl MemorySnapshot {
    /// Apply configured caps on top of what the provider reported.
    pub fn capped(mut self, config: &MemoryConfig) -> Self {
        if let Some(limit) = config.fast_limit_bytes {
            self.fast_free_bytes = self.fast_free_bytes.min(limit);
        }
        if let Some(limit) = config.slow_limit_bytes {
            self.slow_free_bytes = self.slow_free_bytes.min(limit);
        }
        self
    }

    pub fn is_native(&self, dtype: DType) -> bool {
        self.native_compute.contains(&dtype)
    }
}

/// Native compute dtypes for a device class.
pub fn native_compute_dtypes(device: Device) -> Vec<DType> {
    match device {
        Device::Cpu => vec![DType::F32],
        Device::Cuda(_) => vec![DType::F32, DType::F16, DType::BF16],
        Device::Metal => vec![DType::F32, DType::F16],
    }
}

/// Source of memory availability.
pub trait MemoryBudget {
    fn snapshot(&self) -> MemorySnapshot;
}

/// A budget with explicit numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBudget {
    snapshot: MemorySnapshot,
}

impl FixedBudget {
    /// CPU-only budget: all computation on the slow tier.
    pub fn cpu_only(slow_free_bytes: u64) -> Self {
        Self {
            snapshot: MemorySnapshot {
                compute_device: Device::Cpu,
                fast_free_bytes: 0,
                slow_free_bytes,
                native_compute: native_compute_dtypes(Device::Cpu),
            },
        }
    }

    pub fn accelerator(device: Device, fast_free_bytes: u64, slow_free_bytes: u64) -> Self {
        Self {
            snapshot: MemorySnapshot {
                compute_device: device,
                fast_free_bytes,
                slow_free_bytes,
                native_compute: native_compute_dtypes(device),
            },
        }
    }
}

impl MemoryBudget for FixedBudget {
    fn snapshot(&self) -> MemorySnapshot {
        self.snapshot.clone()
    }
}

/// Description of the accelerator, supplied by whoever owns the device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub device: Device,
    pub free_bytes: u64,
}

/// Slow tier read from the operating system, fast tier from the caller.
#[derive(Debug, Clone, Default)]
pub struct SystemBudget {
    accelerator: Option<AcceleratorInfo>,
}

impl SystemBudget {
    pub fn new(accelerator: Option<AcceleratorInfo>) -> Self {
        Self { accelerator }
    }

    fn available_system_memory() -> u64 {
        let mut sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        sys.available_memory()
    }
}

impl MemoryBudget for SystemBudget {
    fn snapshot(&self) -> MemorySnapshot {
        let slow_free_bytes = Self::available_system_memory();
        match self.accelerator {
            Some(info) if info.device.is_accelerator() => MemorySnapshot {
                compute_device: info.device,
                fast_free_bytes: info.free_bytes,
                slow_free_bytes,
                native_compute: native_compute_dtypes(info.device),
            },
            _ => MemorySnapshot {
                compute_device: Device::Cpu,
                fast_free_bytes: 0,
                slow_free_bytes,
                native_compute: native_compute_dtypes(Device::Cpu),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    #[test]
    fn caps_apply_with_min() {
        let config = MemoryConfig {
            fast_limit_bytes: Some(4 * GIB),
            slow_limit_bytes: Some(64 * GIB),
            ..Default::default()
        };
        let snap = FixedBudget::accelerator(Device::Cuda(0), 24 * GIB, 32 * GIB)
            .snapshot()
            .capped(&config);
        assert_eq!(snap.fast_free_bytes, 4 * GIB);
        assert_eq!(snap.slow_free_bytes, 32 * GIB);
    }

    #[test]
    fn cpu_only_has_no_fast_tier() {
        let snap = FixedBudget::cpu_only(16 * GIB).snapshot();
        assert_eq!(snap.compute_device, Device::Cpu);
        assert_eq!(snap.fast_free_bytes, 0);
        assert!(snap.is_native(DType::F32));
        assert!(!snap.is_native(DType::F16));
    }

    #[test]
    fn system_budget_without_accelerator_computes_on_cpu() {
        let snap = SystemBudget::new(None).snapshot();
        assert_eq!(snap.compute_device, Device::Cpu);
        assert_eq!(snap.fast_free_bytes, 0);
    }

    #[test]
    fn system_budget_ignores_cpu_as_accelerator() {
        let snap = SystemBudget::new(Some(AcceleratorInfo { device: Device::Cpu, free_bytes: GIB }))
            .snapshot();
        assert_eq!(snap.fast_free_bytes, 0);
    }

    #[test]
    fn system_budget_reports_accelerator() {
        let snap = SystemBudget::new(Some(AcceleratorInfo {
            device: Device::Cuda(1),
            free_bytes: 8 * GIB,
        }))
        .snapshot();
        assert_eq!(snap.compute_device, Device::Cuda(1));
        assert_eq!(snap.fast_free_bytes, 8 * GIB);
        assert!(snap.is_native(DType::BF16));
    }
}
