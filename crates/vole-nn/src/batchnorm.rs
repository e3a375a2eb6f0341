// BatchNorm2d: 2D Batch Normalization
//
// Normalizes each channel across the batch:
//   x_hat = (x - mean) / sqrt(var + ε)
//   y = γ * x_hat + β
//
// In training mode mean/var are the batch statistics over (N, H, W). In
// eval mode they are the running statistics accumulated during training.
//
// RUNNING STATISTICS:
//
// The running statistics are persistent buffers, not parameters: the
// optimizer never sees them, but they move with the module and are part of
// its state dict. Each training-mode forward pass updates them in place:
//
//   running_mean = (1 - momentum) * running_mean + momentum * mean_batch
//   running_var  = (1 - momentum) * running_var  + momentum * var_batch_unbiased
//   num_batches_tracked += 1
//
// REGISTERED STATE:
//
//   weight (γ)            [C]  parameter
//   bias (β)              [C]  parameter
//   running_mean          [C]  persistent buffer
//   running_var           [C]  persistent buffer
//   num_batches_tracked   []   persistent buffer, I64

use serde::{Deserialize, Serialize};

use vole_core::backend::Backend;
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

use crate::module::Module;
use crate::state::ModuleState;

/// Hyper-parameters of a [`BatchNorm2d`] layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    /// Number of channels (C).
    pub num_features: usize,
    /// Numerical stability constant.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Weight of the current batch in the running statistics.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
}

fn default_eps() -> f64 {
    1e-5
}

fn default_momentum() -> f64 {
    0.1
}

impl BatchNormConfig {
    pub fn new(num_features: usize) -> Self {
        BatchNormConfig {
            num_features,
            eps: default_eps(),
            momentum: default_momentum(),
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

/// 2D Batch Normalization layer for convolutional feature maps.
///
/// # Examples
/// ```ignore
/// let bn = BatchNorm2d::<CpuBackend>::new(&BatchNormConfig::new(16), DType::F64, &dev)?;
/// let y = bn.forward(&x)?; // x: [batch, 16, H, W]
/// ```
pub struct BatchNorm2d<B: Backend> {
    state: ModuleState<B>,
    config: BatchNormConfig,
}

impl<B: Backend> BatchNorm2d<B> {
    pub fn new(config: &BatchNormConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        let c = config.num_features;
        let state = ModuleState::builder()
            .parameter("weight", Tensor::<B>::ones(c, dtype, device)?)
            .parameter("bias", Tensor::<B>::zeros(c, dtype, device)?)
            .buffer("running_mean", Tensor::<B>::zeros(c, dtype, device)?)
            .buffer("running_var", Tensor::<B>::ones(c, dtype, device)?)
            .buffer("num_batches_tracked", Tensor::<B>::zeros((), DType::I64, device)?)
            .build()?;
        Ok(BatchNorm2d {
            state,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    pub fn num_features(&self) -> usize {
        self.config.num_features
    }

    pub fn running_mean(&self) -> Result<&Tensor<B>> {
        self.state.get("running_mean")
    }

    pub fn running_var(&self) -> Result<&Tensor<B>> {
        self.state.get("running_var")
    }

    /// Number of training-mode forward passes seen so far.
    pub fn num_batches_tracked(&self) -> Result<i64> {
        Ok(self.state.get("num_batches_tracked")?.to_scalar_f64()? as i64)
    }

    /// Blend the batch statistics into the running buffers, in place.
    fn update_running_stats(&self, mean_batch: &Tensor<B>, var_batch: &Tensor<B>, n: usize) -> Result<()> {
        let m = self.config.momentum;
        let running_mean = self.state.get("running_mean")?;
        let running_var = self.state.get("running_var")?;

        let mean_batch = mean_batch.to_dtype(running_mean.dtype())?;
        // Running variance tracks the unbiased estimate.
        let correction = if n > 1 { n as f64 / (n as f64 - 1.0) } else { 1.0 };
        let var_batch = var_batch
            .to_dtype(running_var.dtype())?
            .affine(correction, 0.0)?;

        let new_mean = running_mean
            .affine(1.0 - m, 0.0)?
            .add(&mean_batch.affine(m, 0.0)?)?;
        let new_var = running_var
            .affine(1.0 - m, 0.0)?
            .add(&var_batch.affine(m, 0.0)?)?;
        running_mean.copy_from(&new_mean)?;
        running_var.copy_from(&new_var)?;

        let tracked = self.state.get("num_batches_tracked")?;
        tracked.copy_from(&tracked.affine(1.0, 1.0)?)
    }

    /// x_hat = (x - mean) / sqrt(var + eps), then y = γ * x_hat + β.
    /// `mean` and `var` have shape [C].
    fn normalize(&self, x: &Tensor<B>, mean: &Tensor<B>, var: &Tensor<B>, c: usize) -> Result<Tensor<B>> {
        let bshape = Shape::new(vec![1, c, 1, 1]);
        let mean_b = mean.reshape(bshape.clone())?;
        let invstd = var
            .reshape(bshape.clone())?
            .affine(1.0, self.config.eps)?
            .sqrt()?
            .powf(-1.0)?;
        let x_hat = x.sub(&mean_b)?.mul(&invstd)?;

        let gamma = self.state.get("weight")?.reshape(bshape.clone())?;
        let beta = self.state.get("bias")?.reshape(bshape)?;
        x_hat.mul(&gamma)?.add(&beta)
    }
}

impl<B: Backend> Module<B> for BatchNorm2d<B> {
    /// Training: normalize with batch statistics and update the running
    /// buffers. Eval: normalize with the running buffers.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        if x.rank() != 4 {
            return Err(Error::msg(format!(
                "BatchNorm2d: expected 4D input [N,C,H,W], got rank {}",
                x.rank()
            )));
        }
        let dims = x.dims();
        let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        if c != self.config.num_features {
            return Err(Error::msg(format!(
                "BatchNorm2d: expected {} channels, got {}",
                self.config.num_features, c
            )));
        }

        if self.is_training() {
            // [N,C,H,W] → [N,C,H*W], reduce over dims 0 and 2
            let x_flat = x.reshape((n, c, h * w))?;
            let mean_batch = x_flat.mean_dims(&[0, 2], false)?;
            let centered = x.sub(&mean_batch.reshape((1, c, 1, 1))?)?;
            let var_batch = centered
                .square()?
                .reshape((n, c, h * w))?
                .mean_dims(&[0, 2], false)?;

            self.update_running_stats(&mean_batch, &var_batch, n * h * w)?;
            self.normalize(x, &mean_batch, &var_batch, c)
        } else {
            let mean = self.running_mean()?.to_dtype(x.dtype())?;
            let var = self.running_var()?.to_dtype(x.dtype())?;
            self.normalize(x, &mean, &var, c)
        }
    }

    fn state(&self) -> &ModuleState<B> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState<B> {
        &mut self.state
    }
}
