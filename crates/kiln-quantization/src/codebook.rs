//! 4-bit codebooks and the signed 8-bit dynamic map used for nested statistics.

use kiln_common::{DType, FP4_STATE_MARKER, NF4_STATE_MARKER};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Normal-float 4-bit code values, each the quantile of a unit normal
/// rescaled to `[-1, 1]`.
pub const NF4_CODE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// Unscaled FP4 (e2m1) values; divided by 12 to normalize to `[-1, 1]`.
const FP4_RAW: [f32; 16] =
    [0.0, 0.0625, 8.0, 12.0, 4.0, 6.0, 2.0, 3.0, -0.0, -0.0625, -8.0, -12.0, -4.0, -6.0, -2.0, -3.0];

/// Blocksize of the nested second-level quantization of absmax statistics.
pub const NESTED_BLOCKSIZE: usize = 256;

/// Which 4-bit codebook a tensor was quantized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    Nf4,
    Fp4,
}

impl QuantType {
    /// The 16 code values, normalized to `[-1, 1]`.
    pub fn code(self) -> [f32; 16] {
        match self {
            Self::Nf4 => NF4_CODE,
            Self::Fp4 => FP4_RAW.map(|v| v / 12.0),
        }
    }

    /// Storage dtype a component reports for weights of this type.
    pub const fn storage_dtype(self) -> DType {
        match self {
            Self::Nf4 => DType::Nf4,
            Self::Fp4 => DType::Fp4,
        }
    }

    pub fn from_storage_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::Nf4 => Some(Self::Nf4),
            DType::Fp4 => Some(Self::Fp4),
            _ => None,
        }
    }

    /// Suffix of the packed statistics key carrying the JSON fields.
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Nf4 => NF4_STATE_MARKER,
            Self::Fp4 => FP4_STATE_MARKER,
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            NF4_STATE_MARKER => Some(Self::Nf4),
            FP4_STATE_MARKER => Some(Self::Fp4),
            _ => None,
        }
    }
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nf4 => write!(f, "nf4"),
            Self::Fp4 => write!(f, "fp4"),
        }
    }
}

impl FromStr for QuantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nf4" => Ok(Self::Nf4),
            "fp4" => Ok(Self::Fp4),
            other => Err(format!("unknown 4-bit quant type: {other}")),
        }
    }
}

/// The signed dynamic 8-bit map: 7 exponent levels with linearly spaced
/// fractions, mirrored around zero, plus `0` and `1`. Sorted ascending,
/// 256 entries.
pub fn signed_dynamic_map() -> Vec<f32> {
    const MAX_EXPONENT_BITS: i32 = 7;
    let mut data: Vec<f64> = Vec::with_capacity(256);
    for i in 0..MAX_EXPONENT_BITS {
        let items = (1usize << i) + 1;
        let scale = 10f64.powi(-(MAX_EXPONENT_BITS - 1) + i);
        let boundaries: Vec<f64> = (0..items)
            .map(|k| 0.1 + 0.9 * k as f64 / (items - 1) as f64)
            .collect();
        for pair in boundaries.windows(2) {
            let mean = (pair[0] + pair[1]) / 2.0;
            data.push(scale * mean);
            data.push(-scale * mean);
        }
    }
    data.push(0.0);
    data.push(1.0);
    data.resize(256, 0.0);
    data.sort_by(f64::total_cmp);
    data.into_iter().map(|v| v as f32).collect()
}

/// Index of the code value closest to `x`; the first index wins on ties.
pub fn nearest_code(code: &[f32], x: f32) -> u8 {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for (i, c) in code.iter().enumerate() {
        let d = (c - x).abs();
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best as u8
}
