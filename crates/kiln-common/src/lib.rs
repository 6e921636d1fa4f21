//! Common types for kiln
//!
//! Dtypes, devices, raw tensors and the flat weight blob, the workspace error
//! type, loader configuration, memory budget providers and the per-component
//! placement policy.

pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod memory;
pub mod policy;
pub mod tensor;
pub mod weights;

pub use config::{ConfigError, LoaderConfig, MemoryConfig, QuantizationConfig, StorageOverrides, VramMode};
pub use device::{Device, MemoryTier};
pub use dtype::DType;
pub use error::{KilnError, Result};
pub use memory::{AcceleratorInfo, FixedBudget, MemoryBudget, MemorySnapshot, SystemBudget};
pub use policy::{ComponentRole, DtypePolicy, Placement, PolicyRequest};
pub use tensor::TensorData;
pub use weights::{FP4_STATE_MARKER, NF4_STATE_MARKER, WeightBlob, is_quant_statistic_key};
