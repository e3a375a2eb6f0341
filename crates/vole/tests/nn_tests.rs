// Integration tests for vole's serialization formats
//
// These tests save real module trees to disk, load them into freshly
// initialised modules, and check that parameters and persistent buffers
// come back bit for bit, on the right device, with the right diagnostics.

use std::path::PathBuf;

use vole::prelude::*;
use vole::{checkpoint, safetensors, Error};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vole_test_{}_{name}", std::process::id()))
}

fn assert_same_state(a: &StateDict<CpuBackend>, b: &StateDict<CpuBackend>) -> vole::Result<()> {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (key, ta) in a.iter() {
        let tb = b.get(key).unwrap();
        assert!(ta.equal(tb)?, "entry '{key}' differs");
    }
    Ok(())
}

/// Attention followed by batch norm, with the batch norm having seen one
/// training batch so its running buffers and counter are non-trivial.
fn model(dev: &CpuDevice) -> vole::Result<Sequential<CpuBackend>> {
    let attn_config = CausalAttentionConfig::new(3, 2, 6);
    let attn = CausalAttention::<CpuBackend>::new(&attn_config, DType::F32, dev)?;
    let bn = BatchNorm2d::<CpuBackend>::new(&BatchNormConfig::new(2), DType::F32, dev)?;
    let x = CpuTensor::randn((4, 2, 1, 3), DType::F32, dev)?;
    bn.forward(&x)?;
    Sequential::new().add(attn)?.add(bn)
}

fn fresh_model(dev: &CpuDevice) -> vole::Result<Sequential<CpuBackend>> {
    let attn_config = CausalAttentionConfig::new(3, 2, 6);
    let attn = CausalAttention::<CpuBackend>::new(&attn_config, DType::F32, dev)?;
    let bn = BatchNorm2d::<CpuBackend>::new(&BatchNormConfig::new(2), DType::F32, dev)?;
    Sequential::new().add(attn)?.add(bn)
}

// Safetensors

#[test]
fn test_safetensors_module_roundtrip_is_bit_exact() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let source = model(&dev)?;
    let target = fresh_model(&dev)?;

    let path = temp_path("roundtrip.safetensors");
    safetensors::save_module(&path, &source)?;
    let report = safetensors::load_module(&path, &target, true)?;
    std::fs::remove_file(&path).ok();

    assert!(report.is_complete());
    assert_eq!(report.applied.len(), 9);
    assert_same_state(&source.state_dict(), &target.state_dict())?;

    let counter = target.state_dict().get("1.num_batches_tracked").unwrap().clone();
    assert_eq!(counter.dtype(), DType::I64);
    assert_eq!(counter.to_scalar_f64()?, 1.0);
    Ok(())
}

#[test]
fn test_safetensors_file_keeps_export_order() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let source = model(&dev)?;
    let path = temp_path("order.safetensors");
    safetensors::save_module(&path, &source)?;
    let loaded = safetensors::load_state_dict::<CpuBackend>(&path, &dev)?;
    std::fs::remove_file(&path).ok();

    let keys: Vec<&str> = loaded.keys().collect();
    assert_eq!(
        keys,
        vec![
            "0.mask",
            "0.w_query.weight",
            "0.w_key.weight",
            "0.w_value.weight",
            "1.weight",
            "1.bias",
            "1.running_mean",
            "1.running_var",
            "1.num_batches_tracked",
        ]
    );
    Ok(())
}

#[test]
fn test_mutated_mask_survives_the_file() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let attn =
        CausalAttention::<CpuBackend>::new(&CausalAttentionConfig::new(3, 2, 6), DType::F32, &dev)?;
    let mask = attn.mask().unwrap();
    mask.copy_from(&mask.affine(2.0, 0.0)?)?;

    let bytes = safetensors::to_bytes(&attn.state_dict())?;
    let loaded = safetensors::from_bytes::<CpuBackend>(&bytes, &dev)?;
    let row0 = loaded.get("mask").unwrap().to_vec2()?[0].clone();
    assert_eq!(row0, vec![0.0, 2.0, 2.0, 2.0, 2.0, 2.0]);
    Ok(())
}

#[test]
fn test_safetensors_strict_load_names_missing_key() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let without_bias = Linear::<CpuBackend>::new(3, 2, false, DType::F32, &dev)?;
    let with_bias = Linear::<CpuBackend>::new(3, 2, true, DType::F32, &dev)?;
    let bias_before = with_bias.bias().unwrap().to_f64_vec()?;

    let path = temp_path("missing.safetensors");
    safetensors::save_module(&path, &without_bias)?;

    match safetensors::load_module(&path, &with_bias, true) {
        Err(Error::KeyMismatch {
            missing,
            unexpected,
        }) => {
            assert_eq!(missing, vec!["bias".to_string()]);
            assert!(unexpected.is_empty());
        }
        other => panic!("expected a key mismatch, got {other:?}"),
    }

    let report = safetensors::load_module(&path, &with_bias, false)?;
    std::fs::remove_file(&path).ok();

    assert_eq!(report.applied, vec!["weight".to_string()]);
    assert_eq!(report.missing, vec!["bias".to_string()]);
    assert!(with_bias.weight()?.equal(without_bias.weight()?)?);
    assert_eq!(with_bias.bias().unwrap().to_f64_vec()?, bias_before);
    Ok(())
}

#[test]
fn test_load_module_lands_on_module_device() -> vole::Result<()> {
    let source = model(&CpuDevice::new(0))?;
    let mut target = fresh_model(&CpuDevice::new(0))?;
    target.to_device(&CpuDevice::new(2))?;

    let path = temp_path("device.safetensors");
    safetensors::save_module(&path, &source)?;
    safetensors::load_module(&path, &target, true)?;
    std::fs::remove_file(&path).ok();

    for (key, tensor) in target.state_dict().iter() {
        assert_eq!(tensor.device(), &CpuDevice::new(2), "{key} left its device");
    }
    let moved_back = target.state_dict().to_device(&CpuDevice::new(0))?;
    assert_same_state(&source.state_dict(), &moved_back)?;
    Ok(())
}

#[test]
fn test_load_into_module_without_state_reports_every_key() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let path = temp_path("empty.safetensors");
    safetensors::save_module(&path, &Linear::<CpuBackend>::new(2, 2, true, DType::F32, &dev)?)?;

    let empty = Sequential::<CpuBackend>::new();
    let strict = safetensors::load_module(&path, &empty, true);
    let report = safetensors::load_module(&path, &empty, false)?;
    std::fs::remove_file(&path).ok();

    assert!(matches!(strict, Err(Error::KeyMismatch { .. })));
    assert!(report.applied.is_empty());
    assert_eq!(report.unexpected, vec!["weight".to_string(), "bias".to_string()]);
    Ok(())
}

#[test]
fn test_loaded_model_computes_the_same_output() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let config = CausalAttentionConfig::new(3, 2, 6).with_qkv_bias(true);
    let source = CausalAttention::<CpuBackend>::new(&config, DType::F32, &dev)?;
    let target = CausalAttention::<CpuBackend>::new(&config, DType::F32, &dev)?;

    let bytes = safetensors::to_bytes(&source.state_dict())?;
    target.load_state_dict(&safetensors::from_bytes(&bytes, &dev)?, true)?;

    let x = CpuTensor::rand((2, 6, 3), DType::F32, &dev)?;
    assert!(source.forward(&x)?.equal(&target.forward(&x)?)?);
    Ok(())
}

// Native checkpoint

#[test]
fn test_checkpoint_module_roundtrip_is_bit_exact() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let source = model(&dev)?;
    let target = fresh_model(&dev)?;

    let path = temp_path("roundtrip.vole");
    checkpoint::save_module(&path, &source)?;
    let report = checkpoint::load_module(&path, &target, true)?;
    std::fs::remove_file(&path).ok();

    assert!(report.is_complete());
    assert_same_state(&source.state_dict(), &target.state_dict())?;
    Ok(())
}

#[test]
fn test_checkpoint_load_module_needs_a_device() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let path = temp_path("nodevice.vole");
    checkpoint::save_module(&path, &Linear::<CpuBackend>::new(2, 2, false, DType::F32, &dev)?)?;
    let result = checkpoint::load_module(&path, &Sequential::<CpuBackend>::new(), false);
    std::fs::remove_file(&path).ok();
    assert!(result.is_err());
    Ok(())
}

#[test]
fn test_training_checkpoint_resume() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let source = model(&dev)?;
    let ckpt = TrainingCheckpoint::from_module(&source)?
        .with_epoch(3)
        .with_global_step(750)
        .with_best_loss(0.42)
        .with_loss_history(vec![1.3, 0.8, 0.42]);

    let path = temp_path("training.vole");
    checkpoint::save_training(&path, &ckpt)?;
    let loaded = checkpoint::load_training::<CpuBackend>(&path, &CpuDevice::new(1))?;
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.epoch, 3);
    assert_eq!(loaded.global_step, 750);
    assert_eq!(loaded.best_loss, 0.42);
    assert_eq!(loaded.loss_history, vec![1.3, 0.8, 0.42]);

    let target = fresh_model(&dev)?;
    let report = loaded.restore(&target, true)?;
    assert_eq!(report.applied.len(), 9);
    assert_same_state(&source.state_dict(), &target.state_dict())?;
    for (key, tensor) in target.state_dict().iter() {
        assert_eq!(tensor.device(), &dev, "{key} moved off the module's device");
    }
    Ok(())
}

#[test]
fn test_training_checkpoint_ignores_later_training_steps() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let bn = BatchNorm2d::<CpuBackend>::new(&BatchNormConfig::new(2), DType::F32, &dev)?;
    let ckpt = TrainingCheckpoint::from_module(&bn)?.with_epoch(1);

    bn.forward(&CpuTensor::randn((4, 2, 1, 3), DType::F32, &dev)?)?;

    let bytes = checkpoint::training_to_bytes(&ckpt)?;
    let loaded = checkpoint::training_from_bytes::<CpuBackend>(&bytes, &dev)?;
    let counter = loaded.model.get("num_batches_tracked").unwrap();
    assert_eq!(counter.to_scalar_f64()?, 0.0);
    assert_eq!(
        bn.state_dict().get("num_batches_tracked").unwrap().to_scalar_f64()?,
        1.0
    );
    Ok(())
}

#[test]
fn test_checkpoint_and_safetensors_agree() -> vole::Result<()> {
    let dev = CpuDevice::new(0);
    let state = model(&dev)?.state_dict();
    let via_st = safetensors::from_bytes::<CpuBackend>(&safetensors::to_bytes(&state)?, &dev)?;
    let via_ckpt = checkpoint::from_bytes::<CpuBackend>(&checkpoint::to_bytes(&state)?, &dev)?;
    assert_same_state(&via_st, &via_ckpt)?;
    assert_eq!(via_st.num_elements(), state.num_elements());
    Ok(())
}
