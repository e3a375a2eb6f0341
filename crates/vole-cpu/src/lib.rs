// CPU Backend: host-memory compute backend
//
// This crate implements the vole Backend trait on plain Rust vectors.
//
// ARCHITECTURE:
// - CpuDevice is addressed by ordinal ("cpu:0", "cpu:1", ...). Each ordinal
//   is an independent logical memory space: moving a tensor between ordinals
//   copies its elements into fresh storage, exactly like a host/GPU transfer.
//   Tensors on different ordinals cannot be combined in one operation.
// - CpuStorage is an enum over Vec<T> for each supported dtype
// - Data movement (to_contiguous, to_device) copies typed elements, so it is
//   exact for every dtype
// - Arithmetic is computed in f64 and converted back to the storage dtype
// - Matmul parallelises over output rows with rayon
//
// USAGE:
//   let device = CpuDevice::new(1);
//   let tensor = CpuTensor::zeros((2, 3), DType::F32, &device)?;

use half::{bf16, f16};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use vole_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use vole_core::dtype::{DType, WithDType};
use vole_core::error::{Error, Result};
use vole_core::layout::Layout;
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

// CpuDevice: an ordinal-addressed host memory space

/// A host memory space. `CpuDevice::default()` is `cpu:0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuDevice {
    ordinal: usize,
}

impl CpuDevice {
    pub fn new(ordinal: usize) -> Self {
        CpuDevice { ordinal }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        format!("cpu:{}", self.ordinal)
    }
}

// CpuStorage: host memory for each supported dtype

/// Host-side storage. Each variant owns a vector of the corresponding dtype.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
}

/// Apply a type-generic expression to the vector inside any variant and
/// wrap the result in the same variant.
macro_rules! map_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            CpuStorage::F16($v) => CpuStorage::F16($body),
            CpuStorage::BF16($v) => CpuStorage::BF16($body),
            CpuStorage::F32($v) => CpuStorage::F32($body),
            CpuStorage::F64($v) => CpuStorage::F64($body),
            CpuStorage::U8($v) => CpuStorage::U8($body),
            CpuStorage::U32($v) => CpuStorage::U32($body),
            CpuStorage::I64($v) => CpuStorage::I64($body),
        }
    };
}

/// Evaluate a type-generic expression against the vector inside any variant.
macro_rules! with_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            CpuStorage::F16($v) => $body,
            CpuStorage::BF16($v) => $body,
            CpuStorage::F32($v) => $body,
            CpuStorage::F64($v) => $body,
            CpuStorage::U8($v) => $body,
            CpuStorage::U32($v) => $body,
            CpuStorage::I64($v) => $body,
        }
    };
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        with_storage!(self, v => v.len())
    }
}

impl CpuStorage {
    /// Build storage of `dtype` from f64 values.
    fn from_f64(data: &[f64], dtype: DType) -> CpuStorage {
        fn convert<T: WithDType>(data: &[f64]) -> Vec<T> {
            data.iter().map(|&v| T::from_f64(v)).collect()
        }
        match dtype {
            DType::F16 => CpuStorage::F16(convert(data)),
            DType::BF16 => CpuStorage::BF16(convert(data)),
            DType::F32 => CpuStorage::F32(convert(data)),
            DType::F64 => CpuStorage::F64(convert(data)),
            DType::U8 => CpuStorage::U8(convert(data)),
            DType::U32 => CpuStorage::U32(convert(data)),
            DType::I64 => CpuStorage::I64(convert(data)),
        }
    }

    /// Elements selected by `layout`, in logical order, as f64.
    fn strided_f64(&self, layout: &Layout) -> Vec<f64> {
        with_storage!(self, v => gather(v, layout).into_iter().map(|x| x.to_f64()).collect())
    }
}

/// Copy the elements selected by `layout` into a new contiguous vector.
fn gather<T: Copy>(data: &[T], layout: &Layout) -> Vec<T> {
    if layout.is_contiguous() {
        return data[..layout.elem_count()].to_vec();
    }
    layout.strided_indices().map(|i| data[i]).collect()
}

/// Write `src` into the positions of `data` selected by `layout`.
fn scatter<T: Copy>(data: &mut [T], layout: &Layout, src: &[T]) {
    if layout.is_contiguous() {
        data[..src.len()].copy_from_slice(src);
        return;
    }
    for (i, &v) in layout.strided_indices().zip(src) {
        data[i] = v;
    }
}

fn ensure_same_dtype(lhs: &CpuStorage, rhs: &CpuStorage) -> Result<()> {
    if lhs.dtype() != rhs.dtype() {
        return Err(Error::DTypeMismatch {
            expected: lhs.dtype(),
            got: rhs.dtype(),
        });
    }
    Ok(())
}

// CpuBackend

#[derive(Debug, Clone, Copy)]
pub struct CpuBackend;

/// Tensor on the CPU backend.
pub type CpuTensor = Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(&vec![val; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::msg(format!("rand_uniform not supported for {dtype}")));
        }
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(CpuStorage::from_f64(&data, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::msg(format!("rand_normal not supported for {dtype}")));
        }
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Ok(CpuStorage::from_f64(&data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        ensure_same_dtype(lhs, rhs)?;
        let a = lhs.strided_f64(lhs_layout);
        let b = rhs.strided_f64(rhs_layout);
        let f: fn(f64, f64) -> f64 = match op {
            BinaryOp::Add => |x, y| x + y,
            BinaryOp::Sub => |x, y| x - y,
            BinaryOp::Mul => |x, y| x * y,
            BinaryOp::Div => |x, y| x / y,
        };
        let out: Vec<f64> = a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect();
        Ok(CpuStorage::from_f64(&out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let f: fn(f64) -> f64 = match op {
            UnaryOp::Exp => f64::exp,
            UnaryOp::Sqrt => f64::sqrt,
            UnaryOp::Square => |x| x * x,
        };
        let out: Vec<f64> = input.strided_f64(layout).into_iter().map(f).collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let out: Vec<f64> = input
            .strided_f64(layout)
            .into_iter()
            .map(|x| x * mul + add)
            .collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn powf(input: &CpuStorage, layout: &Layout, exponent: f64) -> Result<CpuStorage> {
        let out: Vec<f64> = input
            .strided_f64(layout)
            .into_iter()
            .map(|x| x.powf(exponent))
            .collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn where_cond(
        mask: &CpuStorage,
        mask_layout: &Layout,
        on_true: &CpuStorage,
        on_true_layout: &Layout,
        on_false: &CpuStorage,
        on_false_layout: &Layout,
    ) -> Result<CpuStorage> {
        ensure_same_dtype(on_true, on_false)?;
        let m = mask.strided_f64(mask_layout);
        let t = on_true.strided_f64(on_true_layout);
        let f = on_false.strided_f64(on_false_layout);
        let out: Vec<f64> = m
            .iter()
            .zip(t.iter().zip(f.iter()))
            .map(|(&c, (&x, &y))| if c != 0.0 { x } else { y })
            .collect();
        Ok(CpuStorage::from_f64(&out, on_true.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
    ) -> Result<CpuStorage> {
        let in_dims = layout.dims();
        let rank = in_dims.len();
        let out_dims: Vec<usize> = in_dims
            .iter()
            .enumerate()
            .map(|(i, &d)| if dims.is_empty() || dims.contains(&i) { 1 } else { d })
            .collect();
        let out_strides = Shape::new(out_dims.clone()).stride_contiguous();
        let out_len: usize = out_dims.iter().product();

        let init = match op {
            ReduceOp::Sum | ReduceOp::Mean => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
        };
        let mut acc = vec![init; out_len];
        let mut index = vec![0usize; rank];
        for v in input.strided_f64(layout) {
            let out_i: usize = (0..rank)
                .filter(|&d| out_dims[d] != 1)
                .map(|d| index[d] * out_strides[d])
                .sum();
            acc[out_i] = match op {
                ReduceOp::Sum | ReduceOp::Mean => acc[out_i] + v,
                ReduceOp::Max => acc[out_i].max(v),
            };
            for d in (0..rank).rev() {
                index[d] += 1;
                if index[d] < in_dims[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        if op == ReduceOp::Mean && out_len > 0 {
            let count = (layout.elem_count() / out_len).max(1) as f64;
            for a in acc.iter_mut() {
                *a /= count;
            }
        }
        Ok(CpuStorage::from_f64(&acc, input.dtype()))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        ensure_same_dtype(lhs, rhs)?;
        let l_dims = lhs_layout.dims();
        let r_dims = rhs_layout.dims();
        let rank = l_dims.len();
        if rank < 2 || r_dims.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank.max(2),
                got: r_dims.len(),
            });
        }
        let (m, k) = (l_dims[rank - 2], l_dims[rank - 1]);
        let n = r_dims[rank - 1];
        if r_dims[rank - 2] != k {
            return Err(Error::MatmulShapeMismatch {
                m,
                k1: k,
                k2: r_dims[rank - 2],
                n,
            });
        }
        let batch: usize = l_dims[..rank - 2].iter().product();

        let a = lhs.strided_f64(lhs_layout);
        let b = rhs.strided_f64(rhs_layout);
        let mut out = vec![0.0f64; batch * m * n];
        if !out.is_empty() {
            out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
                let (bi, i) = (row / m, row % m);
                let a_row = &a[bi * m * k + i * k..bi * m * k + (i + 1) * k];
                let b_mat = &b[bi * k * n..(bi + 1) * k * n];
                for (p, &a_ip) in a_row.iter().enumerate() {
                    let b_row = &b_mat[p * n..(p + 1) * n];
                    for (o, &b_pj) in out_row.iter_mut().zip(b_row.iter()) {
                        *o += a_ip * b_pj;
                    }
                }
            });
        }
        Ok(CpuStorage::from_f64(&out, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(map_storage!(input, v => gather(v, layout)))
    }

    fn to_device(input: &CpuStorage, layout: &Layout, _device: &CpuDevice) -> Result<CpuStorage> {
        // Host ordinals share one address space; a fresh typed copy is
        // what keeps them independent.
        Ok(map_storage!(input, v => gather(v, layout)))
    }

    fn write_strided(dst: &mut CpuStorage, dst_layout: &Layout, src: &CpuStorage) -> Result<()> {
        if src.len() != dst_layout.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: dst_layout.shape().clone(),
                expected: dst_layout.elem_count(),
                got: src.len(),
            });
        }
        if dst_layout.storage_end() > dst.len() {
            return Err(Error::msg(format!(
                "layout reaches index {} of a storage holding {} elements",
                dst_layout.storage_end(),
                dst.len()
            )));
        }
        match (dst, src) {
            (CpuStorage::F16(d), CpuStorage::F16(s)) => scatter(d, dst_layout, s),
            (CpuStorage::BF16(d), CpuStorage::BF16(s)) => scatter(d, dst_layout, s),
            (CpuStorage::F32(d), CpuStorage::F32(s)) => scatter(d, dst_layout, s),
            (CpuStorage::F64(d), CpuStorage::F64(s)) => scatter(d, dst_layout, s),
            (CpuStorage::U8(d), CpuStorage::U8(s)) => scatter(d, dst_layout, s),
            (CpuStorage::U32(d), CpuStorage::U32(s)) => scatter(d, dst_layout, s),
            (CpuStorage::I64(d), CpuStorage::I64(s)) => scatter(d, dst_layout, s),
            (d, s) => {
                return Err(Error::DTypeMismatch {
                    expected: d.dtype(),
                    got: s.dtype(),
                })
            }
        }
        Ok(())
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(input.strided_f64(layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(CpuDevice::default().name(), "cpu:0");
        assert_eq!(CpuDevice::new(3).name(), "cpu:3");
        assert_ne!(CpuDevice::new(0), CpuDevice::new(1));
    }

    #[test]
    fn test_storage_dtype_and_len() {
        let s = CpuStorage::from_f64(&[1.0, 2.0, 3.0], DType::I64);
        assert_eq!(s.dtype(), DType::I64);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn test_to_device_copies_strided_elements() {
        let s = CpuStorage::from_f64(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], DType::F32);
        let layout = Layout::contiguous(Shape::from((2, 3)))
            .transpose(0, 1)
            .unwrap();
        let moved = CpuBackend::to_device(&s, &layout, &CpuDevice::new(1)).unwrap();
        let contiguous = Layout::contiguous(Shape::from((3, 2)));
        assert_eq!(
            CpuBackend::to_f64_vec(&moved, &contiguous).unwrap(),
            vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
        );
    }

    #[test]
    fn test_reduce_keeps_dim_order() {
        let s = CpuStorage::from_f64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], DType::F64);
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let rows = CpuBackend::reduce_op(ReduceOp::Sum, &s, &layout, &[1]).unwrap();
        let cols = CpuBackend::reduce_op(ReduceOp::Max, &s, &layout, &[0]).unwrap();
        let all = CpuBackend::reduce_op(ReduceOp::Mean, &s, &layout, &[]).unwrap();
        assert_eq!(rows.strided_f64(&Layout::contiguous(Shape::from(2))), vec![6.0, 15.0]);
        assert_eq!(
            cols.strided_f64(&Layout::contiguous(Shape::from(3))),
            vec![4.0, 5.0, 6.0]
        );
        assert_eq!(all.strided_f64(&Layout::contiguous(Shape::from(()))), vec![3.5]);
    }

    #[test]
    fn test_write_strided_touches_only_the_view() {
        let mut s = CpuStorage::from_f64(&[0.0; 6], DType::U8);
        let column = Layout::contiguous(Shape::from((2, 3))).narrow(1, 1, 1).unwrap();
        let src = CpuStorage::from_f64(&[5.0, 7.0], DType::U8);
        CpuBackend::write_strided(&mut s, &column, &src).unwrap();
        match &s {
            CpuStorage::U8(v) => assert_eq!(v, &vec![0, 5, 0, 0, 7, 0]),
            other => panic!("unexpected storage {other:?}"),
        }

        let wrong_dtype = CpuStorage::from_f64(&[1.0, 1.0], DType::F32);
        assert!(CpuBackend::write_strided(&mut s, &column, &wrong_dtype).is_err());
        let too_short = CpuStorage::from_f64(&[1.0], DType::U8);
        assert!(CpuBackend::write_strided(&mut s, &column, &too_short).is_err());
    }

    #[test]
    fn test_i64_round_trip_is_exact() {
        let s = CpuStorage::from_f64(&[9_007_199_254_740_000.0], DType::I64);
        let copy = CpuBackend::to_contiguous(&s, &Layout::contiguous(Shape::from(1))).unwrap();
        match copy {
            CpuStorage::I64(v) => assert_eq!(v, vec![9_007_199_254_740_000i64]),
            other => panic!("unexpected storage {other:?}"),
        }
    }
}
