//! Reconstruction statistics for a 4-bit block-quantized tensor.
//!
//! A [`QuantState`] travels next to the packed payload. It can be flattened
//! into ordinary named tensors ([`QuantState::pack`]) so a generic weight
//! writer stores it without knowing about quantization, and rebuilt from
//! those tensors ([`QuantState::unpack`]) without dequantizing anything.
//!
//! Packed layout under the owning parameter name:
//!
//! | key | contents |
//! |---|---|
//! | `absmax` | per-block scales (`F32`), or their 8-bit codes (`U8`) when nested |
//! | `quant_map` | the 16-entry codebook |
//! | `nested_absmax` | second-level scales, nested only |
//! | `nested_quant_map` | the 256-entry dynamic map, nested only |
//! | `quant_state.bitsandbytes__<nf4\|fp4>` | `U8` UTF-8 JSON of the scalar fields |

use crate::codebook::QuantType;
use kiln_common::{DType, Device, KilnError, Result, TensorData, WeightBlob};
use serde::{Deserialize, Serialize};

const ABSMAX: &str = "absmax";
const QUANT_MAP: &str = "quant_map";
const NESTED_ABSMAX: &str = "nested_absmax";
const NESTED_QUANT_MAP: &str = "nested_quant_map";
const STATE_PREFIX: &str = "quant_state.";

/// Second-level statistics: the first-level absmax vector, offset by its
/// mean and blockwise quantized to 8 bits.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedState {
    pub absmax: TensorData,
    pub code: TensorData,
    pub blocksize: usize,
    pub dtype: DType,
    /// Mean subtracted from the first-level absmax before quantizing it.
    pub offset: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantState {
    pub quant_type: QuantType,
    /// Logical shape of the unquantized tensor.
    pub shape: Vec<usize>,
    pub blocksize: usize,
    /// Precision the tensor is reconstructed into.
    pub dtype: DType,
    pub absmax: TensorData,
    pub code: TensorData,
    pub nested: Option<NestedState>,
}

/// Scalar fields carried in the JSON statistics entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackedFields {
    quant_type: QuantType,
    blocksize: usize,
    dtype: DType,
    shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nested_blocksize: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nested_dtype: Option<DType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nested_offset: Option<f32>,
}

impl QuantState {
    pub fn is_nested(&self) -> bool {
        self.nested.is_some()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of first-level blocks.
    pub fn num_blocks(&self) -> usize {
        self.numel().div_ceil(self.blocksize)
    }

    /// Device of the statistics.
    pub fn device(&self) -> Device {
        self.absmax.device()
    }

    /// Check that every statistics tensor sits on one device.
    pub fn validate(&self) -> Result<()> {
        if self.blocksize == 0 {
            return Err(KilnError::Quantization("quant state blocksize must be positive".to_string()));
        }
        if let Some(nested) = &self.nested
            && nested.blocksize == 0
        {
            return Err(KilnError::Quantization(
                "quant state nested blocksize must be positive".to_string(),
            ));
        }
        let device = self.device();
        let mut devices = vec![self.code.device()];
        if let Some(nested) = &self.nested {
            devices.push(nested.absmax.device());
            devices.push(nested.code.device());
        }
        if let Some(other) = devices.into_iter().find(|d| *d != device) {
            return Err(KilnError::Quantization(format!(
                "quant state split across devices: absmax on {device}, another statistic on {other}"
            )));
        }
        let expected_absmax = self.num_blocks();
        if self.absmax.numel() != expected_absmax {
            return Err(KilnError::Quantization(format!(
                "absmax has {} entries, expected {expected_absmax} for shape {:?} at blocksize {}",
                self.absmax.numel(),
                self.shape,
                self.blocksize
            )));
        }
        let absmax_dtype = if self.is_nested() { DType::U8 } else { DType::F32 };
        if self.absmax.dtype() != absmax_dtype {
            return Err(KilnError::Quantization(format!(
                "absmax is {}, expected {absmax_dtype}",
                self.absmax.dtype()
            )));
        }
        if let Some(nested) = &self.nested {
            let expected_nested = expected_absmax.div_ceil(nested.blocksize);
            if nested.absmax.numel() != expected_nested {
                return Err(KilnError::Quantization(format!(
                    "nested absmax has {} entries, expected {expected_nested} for {expected_absmax} blocks at nested blocksize {}",
                    nested.absmax.numel(),
                    nested.blocksize
                )));
            }
        }
        Ok(())
    }

    /// Relocate every statistic to `device`. Nothing is requantized.
    pub fn to_device(&self, device: Device) -> QuantState {
        QuantState {
            quant_type: self.quant_type,
            shape: self.shape.clone(),
            blocksize: self.blocksize,
            dtype: self.dtype,
            absmax: self.absmax.to_device(device),
            code: self.code.to_device(device),
            nested: self.nested.as_ref().map(|n| NestedState {
                absmax: n.absmax.to_device(device),
                code: n.code.to_device(device),
                blocksize: n.blocksize,
                dtype: n.dtype,
                offset: n.offset,
            }),
        }
    }

    /// Flatten into named tensors, keys relative to the owning parameter.
    pub fn pack(&self) -> Result<WeightBlob> {
        let fields = PackedFields {
            quant_type: self.quant_type,
            blocksize: self.blocksize,
            dtype: self.dtype,
            shape: self.shape.clone(),
            nested_blocksize: self.nested.as_ref().map(|n| n.blocksize),
            nested_dtype: self.nested.as_ref().map(|n| n.dtype),
            nested_offset: self.nested.as_ref().map(|n| n.offset),
        };
        let json = serde_json::to_vec(&fields)?;
        let json = TensorData::from_u8(vec![json.len()], json)?.with_device(self.device());

        let mut out = WeightBlob::new();
        out.insert(ABSMAX, self.absmax.clone());
        out.insert(QUANT_MAP, self.code.clone());
        if let Some(nested) = &self.nested {
            out.insert(NESTED_ABSMAX, nested.absmax.clone());
            out.insert(NESTED_QUANT_MAP, nested.code.clone());
        }
        out.insert(format!("{STATE_PREFIX}{}", self.quant_type.marker()), json);
        Ok(out)
    }

    /// Rebuild from the entries produced by [`QuantState::pack`].
    pub fn unpack(stats: &WeightBlob) -> Result<QuantState> {
        let mut json_entry = None;
        for (key, tensor) in stats {
            match key.as_str() {
                ABSMAX | QUANT_MAP | NESTED_ABSMAX | NESTED_QUANT_MAP => {}
                other => match other.strip_prefix(STATE_PREFIX).and_then(QuantType::from_marker) {
                    Some(qt) => {
                        if json_entry.replace((qt, tensor)).is_some() {
                            return Err(KilnError::Quantization(
                                "more than one packed quant_state entry".to_string(),
                            ));
                        }
                    }
                    None => {
                        return Err(KilnError::Quantization(format!(
                            "unknown quantization statistic '{other}'"
                        )));
                    }
                },
            }
        }
        let Some((marker_type, json)) = json_entry else {
            return Err(KilnError::Quantization("missing packed quant_state entry".to_string()));
        };
        if json.dtype() != DType::U8 {
            return Err(KilnError::Quantization(format!(
                "packed quant_state must be uint8, got {}",
                json.dtype()
            )));
        }
        let fields: PackedFields = serde_json::from_slice(json.bytes())?;
        if fields.quant_type != marker_type {
            return Err(KilnError::Quantization(format!(
                "quant_state key says {marker_type} but its contents say {}",
                fields.quant_type
            )));
        }

        let required = |key: &str| {
            stats.get(key).cloned().ok_or_else(|| {
                KilnError::Quantization(format!("missing quantization statistic '{key}'"))
            })
        };

        let nested = match (fields.nested_blocksize, fields.nested_dtype, fields.nested_offset) {
            (Some(blocksize), Some(dtype), Some(offset)) => Some(NestedState {
                absmax: required(NESTED_ABSMAX)?,
                code: required(NESTED_QUANT_MAP)?,
                blocksize,
                dtype,
                offset,
            }),
            (None, None, None) => {
                if stats.contains_key(NESTED_ABSMAX) || stats.contains_key(NESTED_QUANT_MAP) {
                    return Err(KilnError::Quantization(
                        "nested statistics present but quant_state is not nested".to_string(),
                    ));
                }
                None
            }
            _ => {
                return Err(KilnError::Quantization(
                    "incomplete nested fields in quant_state".to_string(),
                ));
            }
        };

        let state = QuantState {
            quant_type: fields.quant_type,
            shape: fields.shape,
            blocksize: fields.blocksize,
            dtype: fields.dtype,
            absmax: required(ABSMAX)?,
            code: required(QUANT_MAP)?,
            nested,
        };
        state.validate()?;
        Ok(state)
    }
}
