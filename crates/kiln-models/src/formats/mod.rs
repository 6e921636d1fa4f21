//! On-disk weight formats.

pub mod safetensors;

pub use self::safetensors::{read_weight_blob, write_weight_blob};
