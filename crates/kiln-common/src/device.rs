//! Devices and the memory tiers they belong to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a tensor's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal,
}

/// Memory tier of a device.
///
/// `Fast` is accelerator memory able to run quantized kernels, `Slow` is
/// general system memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    Slow,
    Fast,
}

impl Device {
    pub const fn tier(self) -> MemoryTier {
        match self {
            Self::Cpu => MemoryTier::Slow,
            Self::Cuda(_) | Self::Metal => MemoryTier::Fast,
        }
    }

    pub const fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu)
    }

    pub const fn is_cuda(self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    /// True when the device sits on the compute-capable tier.
    pub const fn is_accelerator(self) -> bool {
        matches!(self.tier(), MemoryTier::Fast)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{idx}"),
            Self::Metal => write!(f, "metal"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "cpu" => return Ok(Self::Cpu),
            "cuda" => return Ok(Self::Cuda(0)),
            "metal" | "mps" => return Ok(Self::Metal),
            _ => {}
        }
        if let Some(idx) = lower.strip_prefix("cuda:") {
            return idx
                .parse::<usize>()
                .map(Self::Cuda)
                .map_err(|e| format!("invalid cuda device index '{idx}': {e}"));
        }
        Err(format!("unknown device: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers() {
        assert_eq!(Device::Cpu.tier(), MemoryTier::Slow);
        assert_eq!(Device::Cuda(1).tier(), MemoryTier::Fast);
        assert!(Device::Metal.is_accelerator());
        assert!(!Device::Cpu.is_accelerator());
    }

    #[test]
    fn display_round_trip() {
        for device in [Device::Cpu, Device::Cuda(0), Device::Cuda(3), Device::Metal] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
    }
}
