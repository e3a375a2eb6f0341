use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;

// Backend: abstraction over compute devices
//
// Each backend supplies a storage type and the kernels that operate on it.
// `Tensor<B>` only ever talks to its storage through these functions, so the
// tensor front end, the module registry and the layers are written once and
// run on any backend.
//
// Kernels take storage + layout and return freshly allocated contiguous
// storage. `write_strided` is the one kernel that mutates existing storage;
// `Tensor::copy_from` and `Tensor::update_data_inplace` call it under the
// tensor's write lock.

/// Identifies a storage location (e.g. "cpu:0", "cpu:1", "cuda:0").
///
/// Two tensors can only be combined when their devices compare equal.
pub trait BackendDevice: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Human-readable name, used in error messages and logs.
    fn name(&self) -> String;
}

/// A buffer holding tensor elements on one device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    fn dtype(&self) -> DType;

    /// Number of elements in the buffer.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Exp,
    Sqrt,
    Square,
}

/// Reductions along dimension(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
}

/// A complete compute backend.
///
/// Binary kernels receive layouts that already share the broadcast output
/// shape (the tensor front end broadcasts them), so implementations only
/// walk strides.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    //  Creation

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Normal values with mean 0 and std 1.
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    //  Element-wise

    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// result = input * mul + add
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    fn powf(input: &Self::Storage, layout: &Layout, exponent: f64) -> Result<Self::Storage>;

    /// result[i] = if mask[i] != 0 { on_true[i] } else { on_false[i] }
    fn where_cond(
        mask: &Self::Storage,
        mask_layout: &Layout,
        on_true: &Self::Storage,
        on_true_layout: &Layout,
        on_false: &Self::Storage,
        on_false_layout: &Layout,
    ) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce along `dims`; an empty `dims` reduces over all elements.
    /// The result is contiguous in the `keep_dim = true` shape (which has
    /// the same element order as the squeezed shape).
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
    ) -> Result<Self::Storage>;

    //  Matrix multiplication

    /// C = A @ B, batched over leading dimensions (which must match).
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    //  Data movement

    /// Contiguous copy of the elements described by `layout`. Always
    /// allocates, so the result never aliases `input`.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy the elements described by `layout` into storage that lives on
    /// `device`. The result is contiguous and never aliases `input`.
    fn to_device(
        input: &Self::Storage,
        layout: &Layout,
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    /// Overwrite the elements of `dst` selected by `dst_layout` with the
    /// contiguous elements of `src`, in logical order. Elements outside the
    /// layout keep their values.
    fn write_strided(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
    ) -> Result<()>;

    /// Elements described by `layout`, in logical order, as f64.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Cast to another dtype. The default goes through an f64 host copy.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }
}
