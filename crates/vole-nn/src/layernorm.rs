// LayerNorm: Layer Normalization
//
// y = (x - mean(x)) / sqrt(var(x) + ε) * γ + β
//
// mean and var are taken over the last dimension of each sample, so unlike
// BatchNorm there are no running statistics: γ and β are the only state,
// and both are parameters.
//
// SHAPES:
//   Input:  [*, normalized_size]
//   Output: same shape as input
//   γ, β:   [normalized_size]

use vole_core::backend::Backend;
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::module::Module;
use crate::state::ModuleState;

/// Layer Normalization over the last dimension.
///
/// # Example
/// ```ignore
/// let ln = LayerNorm::<CpuBackend>::new(512, 1e-5, DType::F64, &dev)?;
/// let y = ln.forward(&x)?; // same shape, normalized
/// ```
pub struct LayerNorm<B: Backend> {
    state: ModuleState<B>,
    normalized_size: usize,
    eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    pub fn new(normalized_size: usize, eps: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        let state = ModuleState::builder()
            .parameter("weight", Tensor::<B>::ones(normalized_size, dtype, device)?)
            .parameter("bias", Tensor::<B>::zeros(normalized_size, dtype, device)?)
            .build()?;
        Ok(LayerNorm {
            state,
            normalized_size,
            eps,
        })
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn normalized_size(&self) -> usize {
        self.normalized_size
    }
}

impl<B: Backend> Module<B> for LayerNorm<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let rank = x.rank();
        if rank == 0 {
            return Err(Error::msg("LayerNorm: input must have at least 1 dimension"));
        }
        let last_dim = rank - 1;

        let mu = x.mean(last_dim, true)?;
        let centered = x.sub(&mu)?;
        let variance = centered.square()?.mean(last_dim, true)?;
        let std = variance.affine(1.0, self.eps)?.sqrt()?;
        let x_norm = centered.div(&std)?;

        x_norm
            .mul(self.state.get("weight")?)?
            .add(self.state.get("bias")?)
    }

    fn state(&self) -> &ModuleState<B> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState<B> {
        &mut self.state
    }
}
