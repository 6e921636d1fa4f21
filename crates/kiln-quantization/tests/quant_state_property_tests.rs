//! Property tests for the 4-bit quantization state.
//!
//! 1. **Pack → unpack round trip** reconstructs an identical state, nested or not.
//! 2. **Kernel output round trips** through the packed layout.
//! 3. **Nibble packing** recovers the original indices.
//! 4. **Relocation never requantizes**: payload bytes are unchanged by moves.

use kiln_common::{DType, Device, TensorData, WeightBlob};
use kiln_quantization::kernel::{pack_nibbles, unpack_nibbles};
use kiln_quantization::{
    NestedState, Param4bit, QuantKernel, QuantSettings, QuantState, QuantType, ReferenceKernel,
    signed_dynamic_map,
};
use proptest::prelude::*;

fn quant_type() -> impl Strategy<Value = QuantType> {
    prop_oneof![Just(QuantType::Nf4), Just(QuantType::Fp4)]
}

fn target_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::F32), Just(DType::F16), Just(DType::BF16)]
}

/// Arbitrary well-formed states: shapes and blocksizes with matching absmax lengths.
fn arb_state() -> impl Strategy<Value = QuantState> {
    (
        quant_type(),
        target_dtype(),
        prop::collection::vec(1usize..48, 1..=3),
        prop_oneof![Just(64usize), Just(128), Just(256)],
        any::<bool>(),
        -4.0f32..4.0,
    )
        .prop_flat_map(|(qt, dtype, shape, blocksize, nested, offset)| {
            let numel: usize = shape.iter().product();
            let blocks = numel.div_ceil(blocksize);
            let nested_blocks = blocks.div_ceil(256);
            (
                Just((qt, dtype, shape, blocksize, nested, offset)),
                prop::collection::vec(0.0f32..8.0, blocks),
                prop::collection::vec(any::<u8>(), blocks),
                prop::collection::vec(0.0f32..2.0, nested_blocks),
            )
        })
        .prop_map(|((qt, dtype, shape, blocksize, nested, offset), absmax, codes, absmax2)| {
            let code = TensorData::from_f32(vec![16], &qt.code()).unwrap();
            if nested {
                let map = signed_dynamic_map();
                QuantState {
                    quant_type: qt,
                    shape,
                    blocksize,
                    dtype,
                    absmax: TensorData::from_u8(vec![codes.len()], codes).unwrap(),
                    code,
                    nested: Some(NestedState {
                        absmax: TensorData::from_f32(vec![absmax2.len()], &absmax2).unwrap(),
                        code: TensorData::from_f32(vec![map.len()], &map).unwrap(),
                        blocksize: 256,
                        dtype: DType::F32,
                        offset,
                    }),
                }
            } else {
                QuantState {
                    quant_type: qt,
                    shape,
                    blocksize,
                    dtype,
                    absmax: TensorData::from_f32(vec![absmax.len()], &absmax).unwrap(),
                    code,
                    nested: None,
                }
            }
        })
}

proptest! {
    #[test]
    fn prop_pack_unpack_reconstructs_state(state in arb_state()) {
        let packed = state.pack().unwrap();
        let expected_keys = if state.is_nested() { 5 } else { 3 };
        prop_assert_eq!(packed.len(), expected_keys);
        let back = QuantState::unpack(&packed).unwrap();
        prop_assert_eq!(back, state);
    }

    #[test]
    fn prop_kernel_state_round_trips(
        qt in quant_type(),
        values in prop::collection::vec(-3.0f32..3.0, 1..600),
        compress in any::<bool>(),
    ) {
        let n = values.len();
        let tensor = TensorData::from_f32(vec![n], &values).unwrap();
        let (packed, state) = ReferenceKernel
            .quantize_4bit(&tensor, qt, 64, compress, Device::Cpu)
            .unwrap();
        prop_assert_eq!(packed.byte_len(), n.div_ceil(2));
        prop_assert_eq!(state.is_nested(), compress);
        let back = QuantState::unpack(&state.pack().unwrap()).unwrap();
        prop_assert_eq!(&back, &state);
        let a = ReferenceKernel.dequantize_4bit(&packed, &state).unwrap();
        let b = ReferenceKernel.dequantize_4bit(&packed, &back).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_nibbles_round_trip(indices in prop::collection::vec(0u8..16, 0..300)) {
        let packed = pack_nibbles(&indices);
        prop_assert_eq!(packed.len(), indices.len().div_ceil(2));
        prop_assert_eq!(unpack_nibbles(&packed, indices.len()), indices);
    }

    #[test]
    fn prop_relocation_keeps_payload(
        values in prop::collection::vec(-1.0f32..1.0, 64..256),
        qt in quant_type(),
    ) {
        let tensor = TensorData::from_f32(vec![values.len()], &values).unwrap();
        let quantized = Param4bit::pending(tensor, QuantSettings::new(qt))
            .to_device(Device::Cuda(0), &ReferenceKernel)
            .unwrap();
        let moved = quantized
            .to_device(Device::Cpu, &ReferenceKernel)
            .unwrap()
            .to_device(Device::Metal, &ReferenceKernel)
            .unwrap();
        prop_assert!(moved.is_quantized());
        prop_assert_eq!(moved.device(), Device::Metal);
        let before: WeightBlob = quantized.state_dict("w").unwrap().into_iter().collect();
        let after: WeightBlob = moved.state_dict("w").unwrap().into_iter().collect();
        for (key, tensor) in &before {
            let other = after.get(key).unwrap();
            prop_assert_eq!(tensor.bytes(), other.bytes(), "payload changed for {}", key);
        }
    }
}
