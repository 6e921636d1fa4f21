//! Numeric kernel seam for 4-bit quantization.
//!
//! The loader only manages quantization state; the arithmetic lives behind
//! [`QuantKernel`]. [`ReferenceKernel`] is a portable implementation usable
//! on any device tag, accelerator backends plug in through the same trait.

use crate::codebook::{NESTED_BLOCKSIZE, QuantType, nearest_code, signed_dynamic_map};
use crate::state::{NestedState, QuantState};
use kiln_common::{DType, Device, KilnError, Result, TensorData};
use rayon::prelude::*;
use tracing::trace;

pub trait QuantKernel: Send + Sync {
    /// Quantize a float tensor into a packed payload plus its statistics,
    /// both placed on `device`.
    fn quantize_4bit(
        &self,
        tensor: &TensorData,
        quant_type: QuantType,
        blocksize: usize,
        compress_statistics: bool,
        device: Device,
    ) -> Result<(TensorData, QuantState)>;

    /// Reconstruct the tensor described by `state` from its packed payload.
    fn dequantize_4bit(&self, packed: &TensorData, state: &QuantState) -> Result<TensorData>;
}

/// Pure-Rust blockwise absmax quantizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernel;

impl ReferenceKernel {
    pub fn new() -> Self {
        Self
    }

    /// Quantize `values` blockwise against `code`, returning one index per
    /// value and one absmax per block.
    fn quantize_blockwise(values: &[f32], code: &[f32], blocksize: usize) -> (Vec<u8>, Vec<f32>) {
        let blocks: Vec<(Vec<u8>, f32)> = values
            .par_chunks(blocksize)
            .map(|block| {
                let absmax = block.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
                let scale = if absmax > 0.0 { 1.0 / absmax } else { 0.0 };
                let indices = block.iter().map(|v| nearest_code(code, v * scale)).collect();
                (indices, absmax)
            })
            .collect();
        let mut indices = Vec::with_capacity(values.len());
        let mut absmax = Vec::with_capacity(blocks.len());
        for (block_indices, block_absmax) in blocks {
            indices.extend(block_indices);
            absmax.push(block_absmax);
        }
        (indices, absmax)
    }

    /// Recover first-level absmax values from their nested encoding.
    fn first_level_absmax(state: &QuantState) -> Result<Vec<f32>> {
        let Some(nested) = &state.nested else {
            return state.absmax.to_f32_vec();
        };
        let code2 = nested.code.to_f32_vec()?;
        let absmax2 = nested.absmax.to_f32_vec()?;
        state
            .absmax
            .bytes()
            .iter()
            .enumerate()
            .map(|(i, idx)| {
                let scale = absmax2.get(i / nested.blocksize).copied().ok_or_else(|| {
                    KilnError::Quantization(format!("nested absmax too short for block {i}"))
                })?;
                let value = code2.get(*idx as usize).copied().ok_or_else(|| {
                    KilnError::Quantization(format!("nested code index {idx} out of range"))
                })?;
                Ok(value * scale + nested.offset)
            })
            .collect()
    }
}

/// Two 4-bit indices per byte, first in the high nibble.
pub fn pack_nibbles(indices: &[u8]) -> Vec<u8> {
    indices
        .chunks(2)
        .map(|pair| {
            let hi = pair[0] & 0x0f;
            let lo = pair.get(1).copied().unwrap_or(0) & 0x0f;
            (hi << 4) | lo
        })
        .collect()
}

pub fn unpack_nibbles(packed: &[u8], n: usize) -> Vec<u8> {
    packed.iter().flat_map(|b| [b >> 4, b & 0x0f]).take(n).collect()
}

impl QuantKernel for ReferenceKernel {
    fn quantize_4bit(
        &self,
        tensor: &TensorData,
        quant_type: QuantType,
        blocksize: usize,
        compress_statistics: bool,
        device: Device,
    ) -> Result<(TensorData, QuantState)> {
        if !tensor.dtype().is_castable_float() {
            return Err(KilnError::Quantization(format!(
                "cannot 4-bit quantize a {} tensor",
                tensor.dtype()
            )));
        }
        if blocksize == 0 {
            return Err(KilnError::Quantization("blocksize must be positive".to_string()));
        }
        let values = tensor.to_f32_vec()?;
        let code = quant_type.code();
        let (indices, absmax) = Self::quantize_blockwise(&values, &code, blocksize);
        let packed = pack_nibbles(&indices);
        let packed = TensorData::from_u8(vec![packed.len(), 1], packed)?.with_device(device);

        let (absmax, nested) = if compress_statistics {
            let offset = if absmax.is_empty() {
                0.0
            } else {
                absmax.iter().sum::<f32>() / absmax.len() as f32
            };
            let centered: Vec<f32> = absmax.iter().map(|a| a - offset).collect();
            let map = signed_dynamic_map();
            let (codes, absmax2) = Self::quantize_blockwise(&centered, &map, NESTED_BLOCKSIZE);
            let nested = NestedState {
                absmax: TensorData::from_f32(vec![absmax2.len()], &absmax2)?.with_device(device),
                code: TensorData::from_f32(vec![map.len()], &map)?.with_device(device),
                blocksize: NESTED_BLOCKSIZE,
                dtype: DType::F32,
                offset,
            };
            (TensorData::from_u8(vec![codes.len()], codes)?, Some(nested))
        } else {
            (TensorData::from_f32(vec![absmax.len()], &absmax)?, None)
        };

        let state = QuantState {
            quant_type,
            shape: tensor.shape().to_vec(),
            blocksize,
            dtype: tensor.dtype(),
            absmax: absmax.with_device(device),
            code: TensorData::from_f32(vec![code.len()], &code)?.with_device(device),
            nested,
        };
        trace!(
            shape = ?state.shape,
            quant_type = %quant_type,
            blocksize,
            nested = state.is_nested(),
            %device,
            "quantized tensor to 4 bits"
        );
        Ok((packed, state))
    }

    fn dequantize_4bit(&self, packed: &TensorData, state: &QuantState) -> Result<TensorData> {
        if packed.dtype() != DType::U8 {
            return Err(KilnError::Quantization(format!(
                "packed 4-bit payload must be uint8, got {}",
                packed.dtype()
            )));
        }
        state.validate()?;
        let n = state.numel();
        if packed.byte_len() != n.div_ceil(2) {
            return Err(KilnError::Quantization(format!(
                "packed payload has {} bytes, expected {} for shape {:?}",
                packed.byte_len(),
                n.div_ceil(2),
                state.shape
            )));
        }
        let code = state.code.to_f32_vec()?;
        if code.len() != 16 {
            return Err(KilnError::Quantization(format!(
                "4-bit codebook has {} entries",
                code.len()
            )));
        }
        let absmax = Self::first_level_absmax(state)?;
        let indices = unpack_nibbles(packed.bytes(), n);
        let values: Vec<f32> = indices
            .par_iter()
            .enumerate()
            .map(|(i, idx)| code[*idx as usize] * absmax[i / state.blocksize])
            .collect();
        let out = TensorData::from_f32(state.shape.clone(), &values)?;
        Ok(out.to_dtype(state.dtype)?.with_device(packed.device()))
    }
}
