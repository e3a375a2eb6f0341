// Linear: Fully-connected (dense) layer
//
// y = xW^T + b
//
// Linear(in_features, out_features) transforms an input of shape
// [..., in_features] to [..., out_features].
//
// WEIGHT INITIALIZATION:
//
// Kaiming (He) uniform: weights drawn from U(-k, k) with k = sqrt(1/in_features).
//
// REGISTERED STATE:
//
//   weight: [out_features, in_features]  parameter
//   bias:   [1, out_features]            parameter (only when use_bias)

use vole_core::backend::Backend;
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::module::Module;
use crate::state::ModuleState;

/// A fully-connected (dense) layer: y = xW^T + b.
///
/// # Examples
/// ```ignore
/// let linear = Linear::<CpuBackend>::new(784, 128, true, DType::F32, &dev)?;
/// let x = CpuTensor::rand((32, 784), DType::F32, &dev)?;
/// let y = linear.forward(&x)?; // [32, 128]
/// ```
pub struct Linear<B: Backend> {
    state: ModuleState<B>,
    in_features: usize,
    out_features: usize,
}

impl<B: Backend> Linear<B> {
    /// Create a new Linear layer with Kaiming uniform initialization.
    pub fn new(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = (1.0 / in_features.max(1) as f64).sqrt();

        // rand in [0, 1) * 2k - k  →  uniform in [-k, k)
        let weight = Tensor::<B>::rand((out_features, in_features), dtype, device)?.affine(2.0 * k, -k)?;
        let bias = if use_bias {
            Some(Tensor::<B>::rand((1, out_features), dtype, device)?.affine(2.0 * k, -k)?)
        } else {
            None
        };
        Self::from_tensors(weight, bias)
    }

    /// Create a Linear layer from existing weight and bias tensors.
    ///
    /// The layer registers the given tensors themselves, so it shares
    /// storage with the caller's handles.
    pub fn from_tensors(weight: Tensor<B>, bias: Option<Tensor<B>>) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(Error::msg(format!(
                "Linear weight must be 2D, got shape {}",
                weight.shape()
            )));
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        if let Some(b) = &bias {
            if b.elem_count() != out_features {
                return Err(Error::msg(format!(
                    "Linear bias must have {out_features} elements, got shape {}",
                    b.shape()
                )));
            }
        }
        let state = ModuleState::builder()
            .parameter("weight", weight)
            .maybe_parameter("bias", bias)
            .build()?;
        Ok(Linear {
            state,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> Result<&Tensor<B>> {
        self.state.get("weight")
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.state.get("bias").ok()
    }
}

impl<B: Backend> Module<B> for Linear<B> {
    /// Input `[..., in_features]`, output `[..., out_features]`.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let wt = self.weight()?.t()?.contiguous()?;
        let output = x.matmul(&wt)?;
        match self.bias() {
            Some(bias) => output.add(bias),
            None => Ok(output),
        }
    }

    fn state(&self) -> &ModuleState<B> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState<B> {
        &mut self.state
    }
}
