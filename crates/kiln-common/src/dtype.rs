//! Element and storage data types.
//!
//! A single [`DType`] covers both the element type of a raw tensor and the
//! storage format a component keeps its weights in. The packed 4-bit formats
//! ([`DType::Nf4`], [`DType::Fp4`]) only ever appear as storage formats: the
//! raw tensor carrying packed 4-bit codes is a plain `U8` tensor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric precision or packed format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "float64", alias = "f64", alias = "fp64")]
    F64,
    #[serde(rename = "float32", alias = "f32", alias = "fp32")]
    F32,
    #[serde(rename = "float16", alias = "f16", alias = "fp16")]
    F16,
    #[serde(rename = "bfloat16", alias = "bf16")]
    BF16,
    #[serde(rename = "float8_e4m3fn", alias = "fp8_e4m3fn", alias = "f8e4m3")]
    F8E4M3,
    #[serde(rename = "float8_e5m2", alias = "fp8_e5m2", alias = "f8e5m2")]
    F8E5M2,
    #[serde(rename = "int64", alias = "i64")]
    I64,
    #[serde(rename = "int32", alias = "i32")]
    I32,
    #[serde(rename = "int16", alias = "i16")]
    I16,
    #[serde(rename = "int8", alias = "i8")]
    I8,
    #[serde(rename = "uint8", alias = "u8")]
    U8,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "nf4")]
    Nf4,
    #[serde(rename = "fp4")]
    Fp4,
}

impl DType {
    /// Storage width of one element in bits.
    pub const fn bits(self) -> u64 {
        match self {
            Self::F64 | Self::I64 => 64,
            Self::F32 | Self::I32 => 32,
            Self::F16 | Self::BF16 | Self::I16 => 16,
            Self::F8E4M3 | Self::F8E5M2 | Self::I8 | Self::U8 | Self::Bool => 8,
            Self::Nf4 | Self::Fp4 => 4,
        }
    }

    /// Size of one element of a raw tensor, `None` for packed 4-bit formats.
    pub const fn element_size(self) -> Option<usize> {
        match self {
            Self::Nf4 | Self::Fp4 => None,
            other => Some((other.bits() / 8) as usize),
        }
    }

    /// Bytes needed to store `params` values in this format.
    pub const fn footprint_bytes(self, params: u64) -> u64 {
        (params * self.bits()).div_ceil(8)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32 | Self::F16 | Self::BF16 | Self::F8E4M3 | Self::F8E5M2)
    }

    pub const fn is_float8(self) -> bool {
        matches!(self, Self::F8E4M3 | Self::F8E5M2)
    }

    pub const fn is_four_bit(self) -> bool {
        matches!(self, Self::Nf4 | Self::Fp4)
    }

    /// Formats that lose information when converted from a wider float.
    ///
    /// Checkpoints already stored in one of these are kept as-is on load.
    pub const fn is_quantized(self) -> bool {
        self.is_float8() || self.is_four_bit()
    }

    /// Whether raw tensors of this dtype can be cast by [`crate::TensorData::to_dtype`].
    pub const fn is_castable_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32 | Self::F16 | Self::BF16)
    }

    /// Canonical lowercase name, as used in configuration and packed statistics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F64 => "float64",
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F8E4M3 => "float8_e4m3fn",
            Self::F8E5M2 => "float8_e5m2",
            Self::I64 => "int64",
            Self::I32 => "int32",
            Self::I16 => "int16",
            Self::I8 => "int8",
            Self::U8 => "uint8",
            Self::Bool => "bool",
            Self::Nf4 => "nf4",
            Self::Fp4 => "fp4",
        }
    }

    pub const ALL: [DType; 14] = [
        Self::F64,
        Self::F32,
        Self::F16,
        Self::BF16,
        Self::F8E4M3,
        Self::F8E5M2,
        Self::I64,
        Self::I32,
        Self::I16,
        Self::I8,
        Self::U8,
        Self::Bool,
        Self::Nf4,
        Self::Fp4,
    ];
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "float64" | "f64" | "fp64" | "double" => Ok(Self::F64),
            "float32" | "f32" | "fp32" | "float" => Ok(Self::F32),
            "float16" | "f16" | "fp16" | "half" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            "float8_e4m3fn" | "fp8_e4m3fn" | "f8e4m3" | "f8_e4m3" => Ok(Self::F8E4M3),
            "float8_e5m2" | "fp8_e5m2" | "f8e5m2" | "f8_e5m2" => Ok(Self::F8E5M2),
            "int64" | "i64" | "long" => Ok(Self::I64),
            "int32" | "i32" | "int" => Ok(Self::I32),
            "int16" | "i16" => Ok(Self::I16),
            "int8" | "i8" => Ok(Self::I8),
            "uint8" | "u8" => Ok(Self::U8),
            "bool" => Ok(Self::Bool),
            "nf4" | "bnb-nf4" => Ok(Self::Nf4),
            "fp4" | "bnb-fp4" => Ok(Self::Fp4),
            other => Err(format!("unknown dtype: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_from_str() {
        for dtype in DType::ALL {
            let parsed: DType = dtype.to_string().parse().unwrap();
            assert_eq!(parsed, dtype);
        }
    }

    #[test]
    fn aliases_parse() {
        assert_eq!("fp16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("BF16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("fp8_e4m3fn".parse::<DType>().unwrap(), DType::F8E4M3);
        assert!("int4".parse::<DType>().is_err());
    }

    #[test]
    fn four_bit_has_no_element_size() {
        assert_eq!(DType::Nf4.element_size(), None);
        assert_eq!(DType::BF16.element_size(), Some(2));
        assert_eq!(DType::Nf4.footprint_bytes(3), 2);
        assert_eq!(DType::F32.footprint_bytes(3), 12);
    }

    #[test]
    fn quantized_formats() {
        assert!(DType::Nf4.is_quantized());
        assert!(DType::F8E5M2.is_quantized());
        assert!(!DType::F16.is_quantized());
        assert!(!DType::U8.is_float());
    }

    #[test]
    fn serde_uses_canonical_names() {
        let json = serde_json::to_string(&DType::BF16).unwrap();
        assert_eq!(json, "\"bfloat16\"");
        let back: DType = serde_json::from_str("\"fp16\"").unwrap();
        assert_eq!(back, DType::F16);
    }
}
