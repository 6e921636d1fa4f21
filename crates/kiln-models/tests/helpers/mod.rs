//! Shared fixtures for kiln-models integration tests.
//!
//! Checkpoints here are tiny: only the keys and shapes recognition looks at,
//! plus a handful of tensors per component so every load path has work.

#![allow(dead_code)]

use kiln_common::{Device, FixedBudget, LoaderConfig, TensorData, WeightBlob};
use kiln_models::{EngineLoader, ModuleSkeleton, StaticFactory, StaticRepository, recognize};
use kiln_quantization::{Param4bit, QuantSettings, QuantType, ReferenceKernel};
use tracing_subscriber::EnvFilter;

pub const UNET: &str = "model.diffusion_model.";
pub const SD15_TO_K: &str = "input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic values in [-0.5, 0.5].
pub fn ramp(shape: &[usize]) -> TensorData {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|i| (i % 17) as f32 / 16.0 - 0.5).collect();
    TensorData::from_f32(shape.to_vec(), &values).unwrap()
}

pub fn filled(shape: &[usize], value: f32) -> TensorData {
    let n: usize = shape.iter().product();
    TensorData::from_f32(shape.to_vec(), &vec![value; n]).unwrap()
}

fn insert_vae(blob: &mut WeightBlob, prefix: &str) {
    blob.insert(format!("{prefix}decoder.conv_in.weight"), ramp(&[8, 4, 3, 3]));
    blob.insert(format!("{prefix}decoder.conv_in.bias"), ramp(&[8]));
    blob.insert(format!("{prefix}encoder.conv_out.weight"), ramp(&[8, 8, 3, 3]));
    blob.insert(format!("{prefix}quant_conv.weight"), ramp(&[8, 8, 1, 1]));
}

fn insert_hf_clip(blob: &mut WeightBlob, prefix: &str) {
    let p = format!("{prefix}text_model.");
    blob.insert(format!("{p}embeddings.token_embedding.weight"), ramp(&[16, 8]));
    blob.insert(format!("{p}embeddings.position_embedding.weight"), ramp(&[4, 8]));
    blob.insert(
        format!("{p}embeddings.position_ids"),
        TensorData::from_f32(vec![1, 4], &[0.0, 1.0, 2.0, 3.0]).unwrap(),
    );
    blob.insert(format!("{p}encoder.layers.0.self_attn.q_proj.weight"), ramp(&[8, 8]));
    blob.insert(format!("{p}encoder.layers.0.self_attn.q_proj.bias"), ramp(&[8]));
    blob.insert(format!("{p}final_layer_norm.weight"), filled(&[8], 1.0));
}

/// Single-file SD 1.5 checkpoint with backbone, autoencoder and CLIP-L.
pub fn sd15_checkpoint() -> WeightBlob {
    let mut blob = WeightBlob::new();
    blob.insert(format!("{UNET}input_blocks.0.0.weight"), ramp(&[320, 4, 3, 3]));
    blob.insert(format!("{UNET}input_blocks.0.0.bias"), ramp(&[320]));
    blob.insert(format!("{UNET}input_blocks.1.1.proj_in.weight"), ramp(&[8, 8, 1, 1]));
    blob.insert(format!("{UNET}{SD15_TO_K}"), ramp(&[64, 768]));
    blob.insert(format!("{UNET}out.2.weight"), ramp(&[4, 8, 3, 3]));
    insert_vae(&mut blob, "first_stage_model.");
    insert_hf_clip(&mut blob, "cond_stage_model.transformer.");
    blob
}

/// Single-file Flux checkpoint; `guidance` selects dev over schnell.
pub fn flux_checkpoint(guidance: bool) -> WeightBlob {
    let mut blob = WeightBlob::new();
    blob.insert(format!("{UNET}img_in.weight"), ramp(&[256, 64]));
    blob.insert(format!("{UNET}txt_in.weight"), ramp(&[256, 32]));
    blob.insert(format!("{UNET}double_blocks.0.img_attn.norm.key_norm.scale"), filled(&[128], 1.0));
    blob.insert(format!("{UNET}double_blocks.0.img_attn.qkv.weight"), ramp(&[24, 8]));
    blob.insert(format!("{UNET}single_blocks.0.linear1.weight"), ramp(&[16, 8]));
    if guidance {
        blob.insert(format!("{UNET}guidance_in.in_layer.weight"), ramp(&[8, 256]));
    }
    insert_vae(&mut blob, "vae.");
    insert_hf_clip(&mut blob, "text_encoders.clip_l.transformer.");
    blob.insert("text_encoders.t5xxl.transformer.shared.weight", ramp(&[16, 8]));
    blob.insert(
        "text_encoders.t5xxl.transformer.encoder.block.0.layer.0.SelfAttention.q.weight",
        ramp(&[8, 8]),
    );
    blob.insert("text_encoders.t5xxl.transformer.encoder.final_layer_norm.weight", filled(&[8], 1.0));
    blob
}

/// SDXL refiner backbone. Recognized, but no engine runs it.
pub fn refiner_checkpoint() -> WeightBlob {
    let mut blob = WeightBlob::new();
    blob.insert(format!("{UNET}input_blocks.0.0.weight"), ramp(&[384, 4, 3, 3]));
    blob.insert(format!("{UNET}label_emb.0.0.weight"), ramp(&[8, 2560]));
    blob.insert(
        format!("{UNET}input_blocks.4.1.transformer_blocks.0.attn2.to_k.weight"),
        ramp(&[8, 1280]),
    );
    insert_vae(&mut blob, "first_stage_model.");
    blob
}

/// Factory whose skeletons mirror every component subset of `blob`.
pub fn factory_for(blob: &WeightBlob) -> StaticFactory {
    let (parts, _) = recognize(blob, None).unwrap();
    parts.iter().fold(StaticFactory::new(), |factory, (name, subset)| {
        factory.with_component(name, ModuleSkeleton::from_state_dict(name, subset))
    })
}

/// Loader over the built-in layouts with no accelerator.
pub fn cpu_loader(config: LoaderConfig, factory: StaticFactory) -> EngineLoader {
    EngineLoader::new(config, Box::new(StaticRepository::known()), Box::new(factory))
        .with_budget(Box::new(FixedBudget::cpu_only(64 << 30)))
}

/// Loader with a roomy CUDA device.
pub fn cuda_loader(config: LoaderConfig, factory: StaticFactory) -> EngineLoader {
    EngineLoader::new(config, Box::new(StaticRepository::known()), Box::new(factory))
        .with_budget(Box::new(FixedBudget::accelerator(Device::Cuda(0), 24 << 30, 16 << 30)))
}

/// Replace the float weight at `key` with its NF4 packing and statistics,
/// the way a quantized single-file checkpoint stores it.
pub fn prequantize(blob: &mut WeightBlob, key: &str) -> TensorData {
    let weight = blob.remove(key).unwrap();
    let packed = Param4bit::pending(weight, QuantSettings::new(QuantType::Nf4))
        .to_device(Device::Cuda(0), &ReferenceKernel)
        .unwrap();
    let mut payload = None;
    for (name, tensor) in packed.state_dict(key).unwrap() {
        let tensor = tensor.to_device(Device::Cpu);
        if name == key {
            payload = Some(tensor.clone());
        }
        blob.insert(name, tensor);
    }
    payload.unwrap()
}
