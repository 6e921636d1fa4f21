//! Loading engines from checkpoints on disk.

mod helpers;

use helpers::*;
use kiln_common::{DType, LoaderConfig};
use kiln_models::{EngineKind, EngineLoader, read_weight_blob, write_weight_blob};
use serial_test::serial;

#[test]
fn engine_loads_from_a_safetensors_file() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sd15.safetensors");
    let blob = sd15_checkpoint();
    write_weight_blob(&blob, &path)?;

    let on_disk = read_weight_blob(&path)?;
    assert_eq!(on_disk, blob);

    let engine = cpu_loader(LoaderConfig::default(), factory_for(&blob)).load_engine(&on_disk, None)?;
    assert_eq!(engine.kind(), EngineKind::StableDiffusion);
    assert!(engine.report().failures().next().is_none());
    Ok(())
}

#[test]
fn prequantized_checkpoint_survives_the_file_format() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sd15-nf4.safetensors");
    let mut blob = sd15_checkpoint();
    let factory = factory_for(&blob);
    prequantize(&mut blob, &format!("{UNET}{SD15_TO_K}"));
    write_weight_blob(&blob, &path)?;

    let engine = cpu_loader(LoaderConfig::default(), factory).load_engine(&read_weight_blob(&path)?, None)?;
    assert_eq!(engine.backbone().placement().storage_dtype, DType::Nf4);
    Ok(())
}

const ENV_KEYS: [&str; 3] = ["KILN_BACKBONE_DTYPE", "KILN_REPOSITORY_ROOT", "KILN_VRAM_MODE"];

fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
    let vars: Vec<(&str, Option<&str>)> = ENV_KEYS
        .iter()
        .map(|k| (*k, set.iter().find(|(sk, _)| sk == k).map(|(_, v)| *v)))
        .collect();
    temp_env::with_vars(vars, f);
}

#[test]
#[serial]
fn environment_override_reaches_the_backbone() {
    with_env(&[("KILN_BACKBONE_DTYPE", "float32")], || {
        let blob = sd15_checkpoint();
        let config = LoaderConfig::from_env().unwrap();
        let loader = EngineLoader::from_config(config, Box::new(factory_for(&blob)))
            .unwrap()
            .with_budget(Box::new(kiln_common::FixedBudget::cpu_only(64 << 30)));
        let engine = loader.load_engine(&blob, None).unwrap();
        assert_eq!(engine.backbone().placement().storage_dtype, DType::F32);
        assert_eq!(engine.vae().placement().storage_dtype, DType::BF16);
    });
}

#[test]
#[serial]
fn repository_root_switches_to_disk_layouts() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("runwayml/stable-diffusion-v1-5");
    let index = serde_json::json!({
        "_class_name": "StableDiffusionPipeline",
        "scheduler": ["diffusers", "DDIMScheduler"],
        "unet": ["diffusers", "UNet2DConditionModel"],
        "vae": ["diffusers", "AutoencoderKL"]
    });
    std::fs::create_dir_all(repo.join("scheduler")).unwrap();
    std::fs::create_dir_all(repo.join("unet")).unwrap();
    std::fs::create_dir_all(repo.join("vae")).unwrap();
    std::fs::write(repo.join("model_index.json"), index.to_string()).unwrap();
    std::fs::write(
        repo.join("scheduler/scheduler_config.json"),
        r#"{"num_train_timesteps": 1000, "prediction_type": "epsilon"}"#,
    )
    .unwrap();

    let root = dir.path().to_string_lossy().into_owned();
    with_env(&[("KILN_REPOSITORY_ROOT", root.as_str())], || {
        let blob = sd15_checkpoint();
        let loader = EngineLoader::from_config(LoaderConfig::from_env().unwrap(), Box::new(factory_for(&blob)))
            .unwrap()
            .with_budget(Box::new(kiln_common::FixedBudget::cpu_only(64 << 30)));
        let engine = loader.load_engine(&blob, None).unwrap();
        let scheduler = engine.config_component("scheduler").unwrap();
        assert_eq!(scheduler.class_name, "DDIMScheduler");
        assert_eq!(scheduler.config["prediction_type"], "epsilon");
        // This layout has no text encoder, so its weights go unused.
        assert_eq!(engine.text_encoders().count(), 0);
        assert_eq!(engine.report().entries().len(), 3);
    });
}
