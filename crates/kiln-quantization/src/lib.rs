//! 4-bit block quantization for kiln
//!
//! This crate manages the lifecycle of 4-bit quantized weights:
//! - codebooks for NF4 and FP4 plus the dynamic 8-bit map for nested statistics
//! - [`QuantState`]: reconstruction statistics with pack/unpack to named tensors
//! - [`Param4bit`]: a weight that is quantized lazily on its first move to an
//!   accelerator and only relocated afterwards
//! - [`QuantKernel`]: the numeric seam, with a portable [`ReferenceKernel`]

pub mod codebook;
pub mod kernel;
pub mod param;
pub mod state;

pub use codebook::{NESTED_BLOCKSIZE, NF4_CODE, QuantType, signed_dynamic_map};
pub use kernel::{QuantKernel, ReferenceKernel};
pub use param::{Param4bit, QuantSettings};
pub use state::{NestedState, QuantState};
