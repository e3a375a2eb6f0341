// CausalAttention: single-head self-attention with a causal mask
//
// For input x of shape [batch, seq, d_in]:
//
//   Q = x @ W_query    K = x @ W_key    V = x @ W_value     [batch, seq, d_out]
//   scores  = Q @ K^T                                       [batch, seq, seq]
//   scores[i, j] = -∞  where j > i      (no peeking at future positions)
//   weights = softmax(scores / √d_out, dim=-1)
//   out     = weights @ V                                   [batch, seq, d_out]
//
// THE MASK:
//
// The mask is the strictly upper triangular matrix triu(ones(L, L), 1) for
// L = context_length; a 1 marks a position that must be hidden. It is not
// learned, but it must live on the same device as the scores. Two ways to
// get it there:
//
//   MaskStrategy::Buffer     build it once and register it as a persistent
//                            buffer named "mask". It moves with the module
//                            and is saved in the state dict. Each forward
//                            pass slices the top-left [seq, seq] block.
//
//   MaskStrategy::OnTheFly   rebuild it on every forward pass from the
//                            input's sequence length and device. Nothing is
//                            registered, so the state dict holds only the
//                            projection weights.
//
// Keeping the mask as a plain struct field instead would leave it behind on
// the old device after `to_device`, and the next forward pass would fail
// with a device mismatch.

use serde::{Deserialize, Serialize};

use vole_core::backend::Backend;
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::linear::Linear;
use crate::module::Module;
use crate::state::ModuleState;

/// Where the causal mask comes from. See the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskStrategy {
    #[default]
    Buffer,
    OnTheFly,
}

/// Hyper-parameters of a [`CausalAttention`] layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalAttentionConfig {
    pub d_in: usize,
    pub d_out: usize,
    /// Longest sequence the registered mask covers.
    pub context_length: usize,
    #[serde(default)]
    pub qkv_bias: bool,
    #[serde(default)]
    pub mask_strategy: MaskStrategy,
}

impl CausalAttentionConfig {
    pub fn new(d_in: usize, d_out: usize, context_length: usize) -> Self {
        CausalAttentionConfig {
            d_in,
            d_out,
            context_length,
            qkv_bias: false,
            mask_strategy: MaskStrategy::default(),
        }
    }

    pub fn with_qkv_bias(mut self, qkv_bias: bool) -> Self {
        self.qkv_bias = qkv_bias;
        self
    }

    pub fn with_mask_strategy(mut self, mask_strategy: MaskStrategy) -> Self {
        self.mask_strategy = mask_strategy;
        self
    }
}

/// Single-head causal self-attention.
///
/// # Examples
/// ```ignore
/// let config = CausalAttentionConfig::new(3, 2, 6);
/// let attn = CausalAttention::<CpuBackend>::new(&config, DType::F32, &dev)?;
/// let y = attn.forward(&x)?; // x: [batch, 6, 3] → y: [batch, 6, 2]
/// ```
pub struct CausalAttention<B: Backend> {
    state: ModuleState<B>,
    w_query: Linear<B>,
    w_key: Linear<B>,
    w_value: Linear<B>,
    config: CausalAttentionConfig,
}

impl<B: Backend> CausalAttention<B> {
    pub fn new(config: &CausalAttentionConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        let w_query = Linear::new(config.d_in, config.d_out, config.qkv_bias, dtype, device)?;
        let w_key = Linear::new(config.d_in, config.d_out, config.qkv_bias, dtype, device)?;
        let w_value = Linear::new(config.d_in, config.d_out, config.qkv_bias, dtype, device)?;

        let mut builder = ModuleState::builder()
            .child("w_query")
            .child("w_key")
            .child("w_value");
        if config.mask_strategy == MaskStrategy::Buffer {
            let l = config.context_length;
            builder = builder.buffer("mask", Tensor::<B>::triu(l, l, 1, dtype, device)?);
        }

        Ok(CausalAttention {
            state: builder.build()?,
            w_query,
            w_key,
            w_value,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &CausalAttentionConfig {
        &self.config
    }

    /// The registered mask, if this layer uses [`MaskStrategy::Buffer`].
    pub fn mask(&self) -> Option<&Tensor<B>> {
        self.state.get("mask").ok()
    }

    /// The `[seq, seq]` mask for this forward pass, on `like`'s device.
    fn causal_mask(&self, seq: usize, like: &Tensor<B>) -> Result<Tensor<B>> {
        match self.config.mask_strategy {
            MaskStrategy::Buffer => {
                if seq > self.config.context_length {
                    return Err(Error::msg(format!(
                        "CausalAttention: sequence length {seq} exceeds context length {}",
                        self.config.context_length
                    )));
                }
                self.state.get("mask")?.narrow(0, 0, seq)?.narrow(1, 0, seq)
            }
            MaskStrategy::OnTheFly => Tensor::<B>::triu(seq, seq, 1, like.dtype(), like.device()),
        }
    }
}

impl<B: Backend> Module<B> for CausalAttention<B> {
    /// Input `[batch, seq, d_in]`, output `[batch, seq, d_out]`.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        if x.rank() != 3 {
            return Err(Error::msg(format!(
                "CausalAttention: expected 3D input [batch, seq, d_in], got rank {}",
                x.rank()
            )));
        }
        let seq = x.dims()[1];

        let queries = self.w_query.forward(x)?;
        let keys = self.w_key.forward(x)?;
        let values = self.w_value.forward(x)?;

        let scores = queries.matmul(&keys.transpose(1, 2)?)?;
        let mask = self.causal_mask(seq, &scores)?;
        let masked = scores.masked_fill(&mask, f64::NEG_INFINITY)?;

        let scale = (self.config.d_out as f64).sqrt();
        let weights = masked.affine(1.0 / scale, 0.0)?.softmax(2)?;
        weights.matmul(&values)
    }

    fn state(&self) -> &ModuleState<B> {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ModuleState<B> {
        &mut self.state
    }

    fn children(&self) -> Vec<(&str, &dyn Module<B>)> {
        vec![
            ("w_query", &self.w_query as &dyn Module<B>),
            ("w_key", &self.w_key as &dyn Module<B>),
            ("w_value", &self.w_value as &dyn Module<B>),
        ]
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn Module<B>)> {
        vec![
            ("w_query", &mut self.w_query as &mut dyn Module<B>),
            ("w_key", &mut self.w_key as &mut dyn Module<B>),
            ("w_value", &mut self.w_value as &mut dyn Module<B>),
        ]
    }
}
