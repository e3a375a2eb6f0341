use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{Backend, BackendDevice, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor: n-dimensional array on a specific device
//
// MEMORY MODEL:
//
//   Tensor is a handle: Arc<TensorInner>. Cloning a handle is O(1) and the
//   clone observes every in-place write made through any other handle.
//
//   The storage sits behind Arc<RwLock<Storage>>. Views (narrow, transpose,
//   reshape of a contiguous tensor) share that Arc with a different layout.
//   `copy_from` and `update_data_inplace` write through the target's layout
//   while holding the lock, so every handle and view sharing the storage
//   sees the new values. Writing into a view touches only its elements.
//
//   `to_device` does the opposite: it allocates new storage on the target
//   device and returns a new handle. Handles to the old tensor keep reading
//   the old storage on the old device.

/// Unique identifier for a tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(u64);

impl TensorId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// Whether this tensor tracks gradients (a trainable parameter).
    is_variable: bool,
}

/// An n-dimensional array of numbers on a specific backend.
///
/// # Example
/// ```ignore
/// let dev = CpuDevice::default();
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &dev)?;
/// let b = Tensor::<CpuBackend>::ones((2, 2), DType::F32, &dev)?;
/// let c = a.add(&b)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={}, variable={})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device.name(),
            self.inner.is_variable,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    fn from_storage(storage: B::Storage, layout: Layout, dtype: DType, device: B::Device) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                is_variable: false,
            }),
        }
    }

    /// New handle on the same storage with a different layout.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                is_variable: false,
            }),
        }
    }

    /// Same id, storage and layout; only the gradient flag differs.
    fn with_variable_flag(&self, is_variable: bool) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                is_variable,
            }),
        }
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether this tensor tracks gradients.
    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// Whether both handles read the same underlying storage.
    pub fn same_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn ensure_same_device(&self, other: &Self) -> Result<()> {
        if self.device() != other.device() {
            return Err(Error::DeviceMismatch {
                expected: self.device().name(),
                got: other.device().name(),
            });
        }
        Ok(())
    }

    // In-place mutation

    /// Write contiguous `values` through this tensor's layout.
    ///
    /// Only the elements the layout selects change, so a narrowed view
    /// updates its slice of the shared storage and nothing else.
    fn write_values(&self, values: &B::Storage) -> Result<()> {
        let mut guard = self.write_storage()?;
        B::write_strided(&mut guard, self.layout(), values)
    }

    /// Overwrite this tensor's values with `new_data`.
    ///
    /// Every handle sharing the storage (e.g. the copy a module holds, or a
    /// view handed out by `state_dict`) sees the new values.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected,
                got: new_data.len(),
            });
        }
        let values = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        self.write_values(&values)
    }

    /// Overwrite this tensor's values with those of `src`, in place.
    ///
    /// Shape and dtype must match. `src` may live on another device; its
    /// values are copied onto this tensor's device. The copy is exact for
    /// every dtype.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        if self.shape() != src.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: src.shape().clone(),
            });
        }
        if self.dtype() != src.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: src.dtype(),
            });
        }
        let values = {
            let guard = src.read_storage()?;
            B::to_device(&guard, src.layout(), self.device())?
        };
        self.write_values(&values)
    }

    // Creation

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Create a tensor from a flat slice of f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                shape,
                got: data.len(),
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Create a tensor from typed data; the dtype follows `T`.
    pub fn from_slice<T: WithDType>(
        data: &[T],
        shape: impl Into<Shape>,
        device: &B::Device,
    ) -> Result<Self> {
        let data: Vec<f64> = data.iter().map(|&v| WithDType::to_f64(v)).collect();
        Self::from_f64_slice(&data, shape, T::DTYPE, device)
    }

    /// Uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Normal values (mean 0, std 1).
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// `[n, m]` matrix with ones on and above the `diagonal`-th diagonal.
    ///
    /// `diagonal = 0` keeps the main diagonal, `diagonal = 1` gives the
    /// strictly-upper mask used to hide future positions in causal attention.
    pub fn triu(
        n: usize,
        m: usize,
        diagonal: i64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let mut data = vec![0.0f64; n * m];
        for i in 0..n {
            for j in 0..m {
                if (j as i64) >= (i as i64) + diagonal {
                    data[i * m + j] = 1.0;
                }
            }
        }
        Self::from_f64_slice(&data, (n, m), dtype, device)
    }

    /// `[n, m]` matrix with ones on and below the `diagonal`-th diagonal.
    pub fn tril(
        n: usize,
        m: usize,
        diagonal: i64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let mut data = vec![0.0f64; n * m];
        for i in 0..n {
            for j in 0..m {
                if (j as i64) <= (i as i64) + diagonal {
                    data[i * m + j] = 1.0;
                }
            }
        }
        Self::from_f64_slice(&data, (n, m), dtype, device)
    }

    // Gradient tracking flag

    /// Mark this tensor as trainable. Storage is shared with `self`.
    pub fn set_variable(self) -> Self {
        self.with_variable_flag(true)
    }

    /// Same data and id, `is_variable = false`. Storage is shared.
    pub fn freeze(&self) -> Self {
        self.with_variable_flag(false)
    }

    /// New handle on the same storage with a fresh id and no gradient flag.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone())
    }

    // Views (no data copy)

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let layout = self.inner.layout.transpose(dim0, dim1)?;
        Ok(self.view_with_layout(layout))
    }

    /// Transpose a 2D matrix.
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Slice `len` entries along `dim` starting at `start`. Shares storage.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let layout = self.inner.layout.narrow(dim, start, len)?;
        Ok(self.view_with_layout(layout))
    }

    /// Reshape; copies first when the tensor is not contiguous.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if self.elem_count() != new_shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        let tensor = self.contiguous()?;
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape)))
    }

    /// Contiguous tensor with the same values. A no-op handle clone when
    /// already contiguous.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = {
            let guard = self.read_storage()?;
            B::to_contiguous(&guard, self.layout())?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            self.device().clone(),
        ))
    }

    /// Contiguous copy in fresh storage on the same device. Later in-place
    /// writes to `self` do not reach the copy.
    pub fn copy(&self) -> Result<Self> {
        let storage = {
            let guard = self.read_storage()?;
            B::to_contiguous(&guard, self.layout())?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            self.device().clone(),
        ))
    }

    /// Broadcast view of this tensor with shape `target`.
    pub fn broadcast_as(&self, target: impl Into<Shape>) -> Result<Self> {
        let layout = self.inner.layout.broadcast_as(&target.into())?;
        Ok(self.view_with_layout(layout))
    }

    // Element-wise binary ops (with broadcasting)

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        self.ensure_same_device(rhs)?;
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_layout = self.layout().broadcast_as(&out_shape)?;
        let rhs_layout = rhs.layout().broadcast_as(&out_shape)?;
        let storage = {
            let lhs_s = self.read_storage()?;
            let rhs_s = rhs.read_storage()?;
            B::binary_op(op, &lhs_s, &lhs_layout, &rhs_s, &rhs_layout)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(out_shape),
            self.dtype(),
            self.device().clone(),
        ))
    }

    // Unary ops

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = {
            let guard = self.read_storage()?;
            B::unary_op(op, &guard, self.layout())?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            self.device().clone(),
        ))
    }

    /// result[i] = self[i] * mul + add
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = {
            let guard = self.read_storage()?;
            B::affine(&guard, self.layout(), mul, add)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            self.device().clone(),
        ))
    }

    pub fn powf(&self, exponent: f64) -> Result<Self> {
        let storage = {
            let guard = self.read_storage()?;
            B::powf(&guard, self.layout(), exponent)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            self.device().clone(),
        ))
    }

    /// result[i] = if mask[i] != 0 { on_true[i] } else { on_false[i] }
    ///
    /// All three operands broadcast to a common shape and must share a
    /// device. `on_true` and `on_false` must share a dtype.
    pub fn where_cond(mask: &Self, on_true: &Self, on_false: &Self) -> Result<Self> {
        on_true.ensure_same_device(mask)?;
        on_true.ensure_same_device(on_false)?;
        if on_true.dtype() != on_false.dtype() {
            return Err(Error::DTypeMismatch {
                expected: on_true.dtype(),
                got: on_false.dtype(),
            });
        }
        let values_shape = Shape::broadcast_shape(on_true.shape(), on_false.shape())?;
        let out_shape = Shape::broadcast_shape(mask.shape(), &values_shape)?;
        let mask_layout = mask.layout().broadcast_as(&out_shape)?;
        let true_layout = on_true.layout().broadcast_as(&out_shape)?;
        let false_layout = on_false.layout().broadcast_as(&out_shape)?;
        let storage = {
            let mask_s = mask.read_storage()?;
            let true_s = on_true.read_storage()?;
            let false_s = on_false.read_storage()?;
            B::where_cond(
                &mask_s,
                &mask_layout,
                &true_s,
                &true_layout,
                &false_s,
                &false_layout,
            )?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(out_shape),
            on_true.dtype(),
            on_true.device().clone(),
        ))
    }

    /// result[i] = if mask[i] != 0 { value } else { self[i] }
    pub fn masked_fill(&self, mask: &Self, value: f64) -> Result<Self> {
        let fill = Self::full((), value, self.dtype(), self.device())?;
        Self::where_cond(mask, &fill, self)
    }

    // Reductions

    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    /// Mean over several dimensions at once.
    pub fn mean_dims(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        if dims.is_empty() {
            return Ok(self.clone());
        }
        self.reduce_op(ReduceOp::Mean, dims, keep_dim)
    }

    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[dim], keep_dim)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        let storage = {
            let guard = self.read_storage()?;
            B::reduce_op(op, &guard, self.layout(), dims)?
        };
        let out_dims: Vec<usize> = if dims.is_empty() {
            if keep_dim {
                vec![1; self.rank()]
            } else {
                vec![]
            }
        } else {
            self.dims()
                .iter()
                .enumerate()
                .filter_map(|(i, &d)| match (dims.contains(&i), keep_dim) {
                    (false, _) => Some(d),
                    (true, true) => Some(1),
                    (true, false) => None,
                })
                .collect()
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(Shape::new(out_dims)),
            self.dtype(),
            self.device().clone(),
        ))
    }

    // Composite ops

    /// Numerically stable softmax along `dim`.
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let max = self.max(dim, true)?;
        let exp = self.sub(&max)?.exp()?;
        let sum = exp.sum(dim, true)?;
        exp.div(&sum)
    }

    /// Population variance along `dim`: mean((x - mean(x))^2).
    pub fn var(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        let mu = self.mean(dim, true)?;
        self.sub(&mu)?.square()?.mean(dim, keep_dim)
    }

    // Matrix multiplication

    /// Matrix multiplication.
    ///
    /// - `[m, k] @ [k, n] -> [m, n]`
    /// - `[..., m, k] @ [..., k, n] -> [..., m, n]` with equal batch dims
    /// - `[..., m, k] @ [k, n] -> [..., m, n]` (a 2D right operand is shared
    ///   across the batch, as in a linear projection)
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.ensure_same_device(rhs)?;
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if self.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let lhs_dims = self.dims();
        let rhs_dims = rhs.dims();
        let (m, k1) = (lhs_dims[lhs_dims.len() - 2], lhs_dims[lhs_dims.len() - 1]);
        let (k2, n) = (rhs_dims[rhs_dims.len() - 2], rhs_dims[rhs_dims.len() - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }

        if rhs.rank() == 2 && self.rank() > 2 {
            let batch: usize = lhs_dims[..lhs_dims.len() - 2].iter().product();
            let flat = self.reshape((batch * m, k1))?;
            let out = flat.matmul(rhs)?;
            let mut out_dims = lhs_dims[..lhs_dims.len() - 1].to_vec();
            out_dims.push(n);
            return out.reshape(out_dims);
        }

        if lhs_dims[..lhs_dims.len() - 2] != rhs_dims[..rhs_dims.len() - 2] {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: rhs.shape().clone(),
            });
        }

        let storage = {
            let lhs_s = self.read_storage()?;
            let rhs_s = rhs.read_storage()?;
            B::matmul(&lhs_s, self.layout(), &rhs_s, rhs.layout())?
        };
        let mut out_dims = lhs_dims[..lhs_dims.len() - 2].to_vec();
        out_dims.push(m);
        out_dims.push(n);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(Shape::new(out_dims)),
            self.dtype(),
            self.device().clone(),
        ))
    }

    // Conversion and transfer

    /// All elements in logical order as f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let guard = self.read_storage()?;
        B::to_f64_vec(&guard, self.layout())
    }

    /// Rows of a 2D tensor.
    pub fn to_vec2(&self) -> Result<Vec<Vec<f64>>> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let cols = self.dims()[1];
        let data = self.to_f64_vec()?;
        if cols == 0 {
            return Ok(vec![Vec::new(); self.dims()[0]]);
        }
        Ok(data.chunks(cols).map(|row| row.to_vec()).collect())
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    /// Cast to another dtype. Returns a handle clone when the dtype already
    /// matches.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let storage = {
            let guard = self.read_storage()?;
            B::cast(&guard, self.layout(), dtype, self.device())?
        };
        let out = Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            dtype,
            self.device().clone(),
        );
        Ok(out.with_variable_flag(self.is_variable()))
    }

    /// Copy of this tensor on `device`, keeping shape, dtype and the
    /// gradient flag.
    ///
    /// When the tensor already lives on `device` this returns a handle on
    /// the same storage. Otherwise the result owns new storage and the
    /// original keeps its old storage on its old device.
    pub fn to_device(&self, device: &B::Device) -> Result<Self> {
        if self.device() == device {
            return Ok(self.clone());
        }
        let storage = {
            let guard = self.read_storage()?;
            B::to_device(&guard, self.layout(), device)?
        };
        let out = Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            device.clone(),
        );
        Ok(out.with_variable_flag(self.is_variable()))
    }

    /// Bit-for-bit equality of shape, dtype and values. Devices may differ.
    pub fn equal(&self, other: &Self) -> Result<bool> {
        if self.shape() != other.shape() || self.dtype() != other.dtype() {
            return Ok(false);
        }
        let a = self.to_f64_vec()?;
        let b = other.to_f64_vec()?;
        Ok(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()))
    }

}
