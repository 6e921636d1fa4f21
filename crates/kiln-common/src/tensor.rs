//! Raw tensor storage.
//!
//! [`TensorData`] is the unit the weight blob is made of: a shape, an element
//! dtype, the device the bytes are attributed to, and the bytes themselves.
//! Bytes are reference counted so partitioning a blob or slicing rows out of a
//! fused tensor never duplicates the payload.

use crate::{DType, Device, KilnError, Result};
use half::{bf16, f16};
use std::fmt;
use std::sync::Arc;

/// Immutable tensor payload with its metadata.
#[derive(Clone)]
pub struct TensorData {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    buf: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl TensorData {
    /// Build a tensor from raw little-endian bytes.
    ///
    /// Fails when `dtype` is a packed 4-bit storage format or the byte length
    /// does not match `shape`.
    pub fn new(shape: Vec<usize>, dtype: DType, data: impl Into<Arc<[u8]>>) -> Result<Self> {
        let elem = dtype.element_size().ok_or_else(|| {
            KilnError::Tensor(format!("{dtype} is a storage format, not an element dtype"))
        })?;
        let buf: Arc<[u8]> = data.into();
        let expected = shape.iter().product::<usize>() * elem;
        if buf.len() != expected {
            return Err(KilnError::Tensor(format!(
                "byte length {} does not match shape {:?} of {dtype} (expected {expected})",
                buf.len(),
                shape
            )));
        }
        let end = buf.len();
        Ok(Self { shape, dtype, device: Device::Cpu, buf, start: 0, end })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::new(shape, DType::F32, bytemuck::cast_slice::<f32, u8>(values).to_vec())
    }

    pub fn from_u8(shape: Vec<usize>, values: Vec<u8>) -> Result<Self> {
        Self::new(shape, DType::U8, values)
    }

    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Result<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(shape, DType::I64, bytes)
    }

    /// Zero-filled tensor.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let elem = dtype.element_size().ok_or_else(|| {
            KilnError::Tensor(format!("cannot allocate zeros of storage format {dtype}"))
        })?;
        let len = shape.iter().product::<usize>() * elem;
        Self::new(shape, dtype, vec![0u8; len])
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.end - self.start
    }

    /// True when both tensors view the same underlying allocation.
    pub fn shares_storage(&self, other: &TensorData) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    /// Relocate to `device`. The payload is shared, only the placement changes.
    pub fn to_device(&self, device: Device) -> Self {
        self.clone().with_device(device)
    }

    /// Cast between float element types.
    ///
    /// Supported among F64/F32/F16/BF16; any other pair fails, including
    /// float8 sources, which are kept in their on-disk format.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        if !self.dtype.is_castable_float() || !dtype.is_castable_float() {
            return Err(KilnError::Tensor(format!(
                "unsupported cast {} -> {dtype}",
                self.dtype
            )));
        }
        let bytes: Vec<u8> = if dtype == DType::F64 {
            self.to_f64_vec()?.iter().flat_map(|v| v.to_le_bytes()).collect()
        } else {
            let values = self.to_f32_vec()?;
            encode_f32(&values, dtype)
        };
        Ok(Self::new(self.shape.clone(), dtype, bytes)?.with_device(self.device))
    }

    /// Decode float elements to `f32`.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let b = self.bytes();
        let values = match self.dtype {
            DType::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(b),
            DType::F16 => {
                bytemuck::pod_collect_to_vec::<u8, f16>(b).into_iter().map(f16::to_f32).collect()
            }
            DType::BF16 => {
                bytemuck::pod_collect_to_vec::<u8, bf16>(b).into_iter().map(bf16::to_f32).collect()
            }
            DType::F64 => self.to_f64_vec()?.into_iter().map(|v| v as f32).collect(),
            other => {
                return Err(KilnError::Tensor(format!("cannot decode {other} as f32")));
            }
        };
        Ok(values)
    }

    fn to_f64_vec(&self) -> Result<Vec<f64>> {
        match self.dtype {
            DType::F64 => Ok(self
                .bytes()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap_or([0u8; 8])))
                .collect()),
            _ => Ok(self.to_f32_vec()?.into_iter().map(f64::from).collect()),
        }
    }

    /// Split along the first dimension into `parts` equal row blocks.
    ///
    /// The returned tensors view the same allocation as `self`.
    pub fn split_rows(&self, parts: usize) -> Result<Vec<TensorData>> {
        let rows = *self
            .shape
            .first()
            .ok_or_else(|| KilnError::Tensor("cannot split a scalar".to_string()))?;
        if parts == 0 || rows % parts != 0 {
            return Err(KilnError::Tensor(format!(
                "cannot split {rows} rows into {parts} equal parts"
            )));
        }
        let chunk_bytes = self.byte_len() / parts;
        let mut shape = self.shape.clone();
        shape[0] = rows / parts;
        Ok((0..parts)
            .map(|i| TensorData {
                shape: shape.clone(),
                dtype: self.dtype,
                device: self.device,
                buf: Arc::clone(&self.buf),
                start: self.start + i * chunk_bytes,
                end: self.start + (i + 1) * chunk_bytes,
            })
            .collect())
    }

    /// Transpose a 2-D tensor.
    pub fn transpose_2d(&self) -> Result<Self> {
        let &[rows, cols] = self.shape.as_slice() else {
            return Err(KilnError::Tensor(format!(
                "transpose_2d expects a 2-D tensor, got shape {:?}",
                self.shape
            )));
        };
        let elem = self
            .dtype
            .element_size()
            .ok_or_else(|| KilnError::Tensor("transpose of packed storage".to_string()))?;
        let src = self.bytes();
        let mut out = vec![0u8; src.len()];
        for r in 0..rows {
            for c in 0..cols {
                let from = (r * cols + c) * elem;
                let to = (c * rows + r) * elem;
                out[to..to + elem].copy_from_slice(&src[from..from + elem]);
            }
        }
        Ok(Self::new(vec![cols, rows], self.dtype, out)?.with_device(self.device))
    }
}

fn encode_f32(values: &[f32], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F16 => values.iter().flat_map(|v| f16::from_f32(*v).to_le_bytes()).collect(),
        DType::BF16 => values.iter().flat_map(|v| bf16::from_f32(*v).to_le_bytes()).collect(),
        _ => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
    }
}

impl PartialEq for TensorData {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.dtype == other.dtype
            && self.device == other.device
            && self.bytes() == other.bytes()
    }
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("bytes", &self.byte_len())
            .finish()
    }
}
