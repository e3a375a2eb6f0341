// Tensor front-end tests on the CPU backend
//
// Covers the runtime contract the module registry relies on: device
// transfer, in-place copies visible through aliases, device mismatch
// failures, and the handful of ops the layers use.

use vole_core::{DType, Error, Result};
use vole_cpu::{CpuDevice, CpuTensor};

type T = CpuTensor;

fn assert_approx_vec(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!((a - e).abs() < tol, "index {i}: {a} != {e} (tol={tol})");
    }
}

// Creation

#[test]
fn test_creation_and_introspection() -> Result<()> {
    let dev = CpuDevice::default();
    let t = T::full((3, 2), 42.0, DType::F32, &dev)?;
    assert_eq!(t.dims(), &[3, 2]);
    assert_eq!(t.dtype(), DType::F32);
    assert_eq!(t.device(), &dev);
    assert_eq!(t.to_f64_vec()?, vec![42.0; 6]);

    let counts = T::from_slice(&[1i64, 2, 3], 3, &dev)?;
    assert_eq!(counts.dtype(), DType::I64);
    assert_eq!(counts.to_f64_vec()?, vec![1.0, 2.0, 3.0]);

    let halves = T::from_slice(&[half::f16::from_f32(0.5), half::f16::from_f32(-2.0)], 2, &dev)?;
    assert_eq!(halves.dtype(), DType::F16);
    assert_eq!(halves.to_f64_vec()?, vec![0.5, -2.0]);
    assert!(T::from_f64_slice(&[1.0, 2.0], (2, 2), DType::F32, &dev).is_err());
    Ok(())
}

#[test]
fn test_triu_diagonal_one() -> Result<()> {
    let dev = CpuDevice::default();
    let mask = T::triu(3, 3, 1, DType::F32, &dev)?;
    assert_eq!(
        mask.to_vec2()?,
        vec![
            vec![0.0, 1.0, 1.0],
            vec![0.0, 0.0, 1.0],
            vec![0.0, 0.0, 0.0],
        ]
    );
    let lower = T::tril(2, 2, 0, DType::F32, &dev)?;
    assert_eq!(lower.to_f64_vec()?, vec![1.0, 0.0, 1.0, 1.0]);
    Ok(())
}

// Device transfer

#[test]
fn test_to_device_copies_into_new_storage() -> Result<()> {
    let cpu0 = CpuDevice::new(0);
    let cpu1 = CpuDevice::new(1);
    let a = T::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F32, &cpu0)?;
    let b = a.to_device(&cpu1)?;

    assert_eq!(b.device(), &cpu1);
    assert_eq!(a.device(), &cpu0);
    assert!(!a.same_storage(&b));
    assert!(a.equal(&b)?);

    // Writes to the original never reach the copy.
    a.update_data_inplace(&[7.0, 8.0, 9.0])?;
    assert_eq!(b.to_f64_vec()?, vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn test_to_device_same_device_keeps_storage() -> Result<()> {
    let dev = CpuDevice::new(2);
    let a = T::ones(4, DType::F64, &dev)?.set_variable();
    let b = a.to_device(&dev)?;
    assert!(a.same_storage(&b));
    assert!(b.is_variable());
    Ok(())
}

#[test]
fn test_to_device_keeps_variable_flag() -> Result<()> {
    let a = T::zeros((2, 2), DType::F32, &CpuDevice::new(0))?.set_variable();
    let b = a.to_device(&CpuDevice::new(1))?;
    assert!(b.is_variable());
    assert!(!a.freeze().to_device(&CpuDevice::new(1))?.is_variable());
    Ok(())
}

#[test]
fn test_binary_op_device_mismatch() -> Result<()> {
    let a = T::ones(2, DType::F32, &CpuDevice::new(0))?;
    let b = T::ones(2, DType::F32, &CpuDevice::new(1))?;
    match a.add(&b) {
        Err(Error::DeviceMismatch { expected, got }) => {
            assert_eq!(expected, "cpu:0");
            assert_eq!(got, "cpu:1");
        }
        other => panic!("expected DeviceMismatch, got {other:?}"),
    }
    assert!(a.matmul(&b.reshape((2, 1))?).is_err());
    Ok(())
}

#[test]
fn test_masked_fill_device_mismatch() -> Result<()> {
    let scores = T::zeros((2, 2), DType::F32, &CpuDevice::new(1))?;
    let mask = T::triu(2, 2, 1, DType::F32, &CpuDevice::new(0))?;
    assert!(matches!(
        scores.masked_fill(&mask, f64::NEG_INFINITY),
        Err(Error::DeviceMismatch { .. })
    ));
    Ok(())
}

// In-place writes

#[test]
fn test_copy_from_is_visible_through_aliases() -> Result<()> {
    let dev = CpuDevice::default();
    let target = T::zeros((2, 2), DType::F32, &dev)?;
    let alias = target.clone();
    let view = target.narrow(0, 1, 1)?;
    let frozen = target.freeze();

    let src = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &dev)?;
    target.copy_from(&src)?;

    assert_eq!(alias.to_f64_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(view.to_f64_vec()?, vec![3.0, 4.0]);
    assert_eq!(frozen.to_f64_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn test_copy_from_other_device_lands_on_target_device() -> Result<()> {
    let target = T::zeros(3, DType::F64, &CpuDevice::new(0))?;
    let src = T::from_f64_slice(&[0.1, 0.2, 0.3], 3, DType::F64, &CpuDevice::new(1))?;
    target.copy_from(&src)?;
    assert_eq!(target.device(), &CpuDevice::new(0));
    assert_eq!(target.to_f64_vec()?, vec![0.1, 0.2, 0.3]);
    Ok(())
}

#[test]
fn test_copy_from_transposed_source() -> Result<()> {
    let dev = CpuDevice::default();
    let target = T::zeros((3, 2), DType::F32, &dev)?;
    let src = T::from_f64_slice(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], (2, 3), DType::F32, &dev)?.t()?;
    target.copy_from(&src)?;
    assert_eq!(target.to_f64_vec()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    Ok(())
}

#[test]
fn test_copy_from_rejects_shape_and_dtype_mismatch() -> Result<()> {
    let dev = CpuDevice::default();
    let target = T::zeros((2, 2), DType::F32, &dev)?;
    assert!(matches!(
        target.copy_from(&T::zeros(4, DType::F32, &dev)?),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        target.copy_from(&T::zeros((2, 2), DType::F64, &dev)?),
        Err(Error::DTypeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_copy_from_into_partial_view_writes_through() -> Result<()> {
    let dev = CpuDevice::default();
    let base = T::zeros((3, 3), DType::F32, &dev)?;
    let corner = base.narrow(0, 1, 2)?.narrow(1, 1, 2)?;
    corner.copy_from(&T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &dev)?)?;

    assert_eq!(corner.to_f64_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(
        base.to_f64_vec()?,
        vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]
    );
    Ok(())
}

#[test]
fn test_update_data_inplace_on_transposed_view() -> Result<()> {
    let dev = CpuDevice::default();
    let base = T::zeros((2, 3), DType::I64, &dev)?;
    let view = base.t()?;
    view.update_data_inplace(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    assert_eq!(base.to_f64_vec()?, vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    Ok(())
}

// Ops used by the layers

#[test]
fn test_broadcast_add() -> Result<()> {
    let dev = CpuDevice::default();
    let x = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F32, &dev)?;
    let bias = T::from_f64_slice(&[10.0, 20.0, 30.0], (1, 3), DType::F32, &dev)?;
    assert_eq!(
        x.add(&bias)?.to_f64_vec()?,
        vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
    );
    Ok(())
}

#[test]
fn test_matmul_batched_and_shared_rhs() -> Result<()> {
    let dev = CpuDevice::default();
    let a = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (1, 2, 2), DType::F64, &dev)?;
    let w = T::from_f64_slice(&[1.0, 0.0, 0.0, 1.0], (2, 2), DType::F64, &dev)?;
    let shared = a.matmul(&w)?;
    assert_eq!(shared.dims(), &[1, 2, 2]);
    assert_eq!(shared.to_f64_vec()?, vec![1.0, 2.0, 3.0, 4.0]);

    let at = a.transpose(1, 2)?;
    let gram = a.matmul(&at)?;
    assert_eq!(gram.to_f64_vec()?, vec![5.0, 11.0, 11.0, 25.0]);
    Ok(())
}

#[test]
fn test_softmax_rows_sum_to_one() -> Result<()> {
    let dev = CpuDevice::default();
    let x = T::from_f64_slice(&[1.0, 2.0, 3.0, 0.0, 0.0, f64::NEG_INFINITY], (2, 3), DType::F64, &dev)?;
    let p = x.softmax(1)?;
    let sums = p.sum(1, false)?.to_f64_vec()?;
    assert_approx_vec(&sums, &[1.0, 1.0], 1e-12);
    assert_eq!(p.to_vec2()?[1][2], 0.0);
    Ok(())
}

#[test]
fn test_mean_and_var() -> Result<()> {
    let dev = CpuDevice::default();
    let x = T::from_f64_slice(&[1.0, 3.0, 5.0, 7.0], (2, 2), DType::F64, &dev)?;
    assert_eq!(x.mean(0, false)?.to_f64_vec()?, vec![3.0, 5.0]);
    assert_eq!(x.var(1, true)?.dims(), &[2, 1]);
    assert_eq!(x.var(1, false)?.to_f64_vec()?, vec![1.0, 1.0]);
    assert_eq!(x.mean_all()?.to_scalar_f64()?, 4.0);
    Ok(())
}

#[test]
fn test_half_precision_transfer_is_exact() -> Result<()> {
    let a = T::from_f64_slice(&[0.5, -1.25, 3.0], 3, DType::BF16, &CpuDevice::new(0))?;
    let b = a.to_device(&CpuDevice::new(1))?;
    assert!(a.equal(&b)?);
    assert_eq!(b.dtype(), DType::BF16);
    Ok(())
}
