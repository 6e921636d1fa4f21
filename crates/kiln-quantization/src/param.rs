//! A linear weight stored in a 4-bit format.
//!
//! The weight is either still in plain float form, waiting for its first move
//! onto a compute-capable device, or fully quantized with its statistics.
//! There is no state in between.

use crate::codebook::QuantType;
use crate::kernel::QuantKernel;
use crate::state::QuantState;
use kiln_common::{DType, Device, KilnError, QuantizationConfig, Result, TensorData, WeightBlob};
use tracing::debug;

/// How a pending weight will be quantized once placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantSettings {
    pub quant_type: QuantType,
    pub blocksize: usize,
    pub compress_statistics: bool,
}

impl QuantSettings {
    pub fn new(quant_type: QuantType) -> Self {
        let defaults = QuantizationConfig::default();
        Self {
            quant_type,
            blocksize: defaults.blocksize,
            compress_statistics: defaults.compress_statistics,
        }
    }

    pub fn from_config(quant_type: QuantType, config: &QuantizationConfig) -> Self {
        Self {
            quant_type,
            blocksize: config.blocksize,
            compress_statistics: config.compress_statistics,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Param4bit {
    /// Plain float data, quantized on the first move to an accelerator.
    Pending { data: TensorData, settings: QuantSettings },
    /// Packed 4-bit payload plus reconstruction statistics.
    Quantized { packed: TensorData, state: QuantState },
}

impl Param4bit {
    pub fn pending(data: TensorData, settings: QuantSettings) -> Self {
        Self::Pending { data, settings }
    }

    /// Adopt a checkpoint that is already packed.
    ///
    /// `stats` holds the statistics entries with the parameter name stripped
    /// (`absmax`, `quant_map`, `quant_state.bitsandbytes__nf4`, ...).
    pub fn from_prequantized(packed: TensorData, stats: &WeightBlob, device: Device) -> Result<Self> {
        if packed.dtype() != DType::U8 {
            return Err(KilnError::Quantization(format!(
                "pre-quantized payload must be uint8, got {}",
                packed.dtype()
            )));
        }
        let state = QuantState::unpack(stats)?;
        if packed.byte_len() != state.numel().div_ceil(2) {
            return Err(KilnError::Quantization(format!(
                "pre-quantized payload has {} bytes for {} elements",
                packed.byte_len(),
                state.numel()
            )));
        }
        Ok(Self::Quantized { packed: packed.to_device(device), state: state.to_device(device) })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized { .. })
    }

    pub fn quant_state(&self) -> Option<&QuantState> {
        match self {
            Self::Pending { .. } => None,
            Self::Quantized { state, .. } => Some(state),
        }
    }

    pub fn quant_type(&self) -> QuantType {
        match self {
            Self::Pending { settings, .. } => settings.quant_type,
            Self::Quantized { state, .. } => state.quant_type,
        }
    }

    pub fn device(&self) -> Device {
        match self {
            Self::Pending { data, .. } => data.device(),
            Self::Quantized { packed, .. } => packed.device(),
        }
    }

    /// Logical (unquantized) shape.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Pending { data, .. } => data.shape(),
            Self::Quantized { state, .. } => &state.shape,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Move to `device`.
    ///
    /// A pending weight moved onto an accelerator is quantized there. Any
    /// other move relocates the data and statistics without requantizing.
    pub fn to_device(&self, device: Device, kernel: &dyn QuantKernel) -> Result<Self> {
        match self {
            Self::Pending { data, settings } if device.is_accelerator() => {
                debug!(shape = ?data.shape(), %device, quant_type = %settings.quant_type, "deferred 4-bit quantization");
                let (packed, state) = kernel.quantize_4bit(
                    data,
                    settings.quant_type,
                    settings.blocksize,
                    settings.compress_statistics,
                    device,
                )?;
                Ok(Self::Quantized { packed, state })
            }
            Self::Pending { data, settings } => {
                Ok(Self::Pending { data: data.to_device(device), settings: *settings })
            }
            Self::Quantized { packed, state } => Ok(Self::Quantized {
                packed: packed.to_device(device),
                state: state.to_device(device),
            }),
        }
    }

    /// Entries a generic weight writer stores for this parameter under `name`.
    pub fn state_dict(&self, name: &str) -> Result<Vec<(String, TensorData)>> {
        match self {
            Self::Pending { data, .. } => Ok(vec![(name.to_string(), data.clone())]),
            Self::Quantized { packed, state } => {
                let mut out = vec![(name.to_string(), packed.clone())];
                out.extend(state.pack()?.into_iter().map(|(k, v)| (format!("{name}.{k}"), v)));
                Ok(out)
            }
        }
    }

    /// Float view of the weight.
    pub fn dequantize(&self, kernel: &dyn QuantKernel) -> Result<TensorData> {
        match self {
            Self::Pending { data, .. } => Ok(data.clone()),
            Self::Quantized { packed, state } => kernel.dequantize_4bit(packed, state),
        }
    }
}
