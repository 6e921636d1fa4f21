//! `.safetensors` reader and writer for weight blobs.

use kiln_common::{DType, KilnError, Result, TensorData, WeightBlob};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype as SafeDtype, SafeTensors};
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

fn from_safe_dtype(dtype: SafeDtype) -> Result<DType> {
    Ok(match dtype {
        SafeDtype::BOOL => DType::Bool,
        SafeDtype::U8 => DType::U8,
        SafeDtype::I8 => DType::I8,
        SafeDtype::I16 => DType::I16,
        SafeDtype::I32 => DType::I32,
        SafeDtype::I64 => DType::I64,
        SafeDtype::F8_E4M3 => DType::F8E4M3,
        SafeDtype::F8_E5M2 => DType::F8E5M2,
        SafeDtype::F16 => DType::F16,
        SafeDtype::BF16 => DType::BF16,
        SafeDtype::F32 => DType::F32,
        SafeDtype::F64 => DType::F64,
        other => {
            return Err(KilnError::Safetensors(format!("unsupported element dtype {other:?}")));
        }
    })
}

fn to_safe_dtype(dtype: DType) -> Result<SafeDtype> {
    Ok(match dtype {
        DType::Bool => SafeDtype::BOOL,
        DType::U8 => SafeDtype::U8,
        DType::I8 => SafeDtype::I8,
        DType::I16 => SafeDtype::I16,
        DType::I32 => SafeDtype::I32,
        DType::I64 => SafeDtype::I64,
        DType::F8E4M3 => SafeDtype::F8_E4M3,
        DType::F8E5M2 => SafeDtype::F8_E5M2,
        DType::F16 => SafeDtype::F16,
        DType::BF16 => SafeDtype::BF16,
        DType::F32 => SafeDtype::F32,
        DType::F64 => SafeDtype::F64,
        DType::Nf4 | DType::Fp4 => {
            return Err(KilnError::Safetensors(format!(
                "{dtype} is a storage format; write its packed uint8 payload instead"
            )));
        }
    })
}

/// Read every tensor of a `.safetensors` file.
///
/// The file is memory-mapped and each tensor copied out, so the returned
/// blob does not keep the file open. Names and element dtypes are kept as
/// stored.
pub fn read_weight_blob(path: impl AsRef<Path>) -> Result<WeightBlob> {
    let path = path.as_ref();
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file) }?;
    let st = SafeTensors::deserialize(&mmap)
        .map_err(|e| KilnError::Safetensors(format!("{}: {e}", path.display())))?;

    let mut blob = WeightBlob::new();
    for (name, view) in st.tensors() {
        let dtype = from_safe_dtype(view.dtype())
            .map_err(|e| KilnError::Safetensors(format!("{name}: {e}")))?;
        let tensor = TensorData::new(view.shape().to_vec(), dtype, view.data().to_vec())?;
        blob.insert(name, tensor);
    }
    info!(path = %path.display(), tensors = blob.len(), bytes = blob.byte_size(), "read weight blob");
    Ok(blob)
}

/// Write `blob` as a `.safetensors` file.
pub fn write_weight_blob(blob: &WeightBlob, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let views = blob
        .iter()
        .map(|(name, tensor)| {
            let view = TensorView::new(to_safe_dtype(tensor.dtype())?, tensor.shape().to_vec(), tensor.bytes())
                .map_err(|e| KilnError::Safetensors(format!("{name}: {e}")))?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| KilnError::Safetensors(format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), tensors = blob.len(), "wrote weight blob");
    Ok(())
}
