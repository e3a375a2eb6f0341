//! # Vole
//!
//! Device-aware parameter and buffer state for neural network modules.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Tensor, Shape, DType, Layout, Backend trait, errors |
//! | `vole-cpu` | CPU backend with per-ordinal devices and rayon matmul |
//! | `vole-nn` | Module trait, parameter/buffer registry, state dicts, layers |
//!
//! ## Modules
//!
//! - [`checkpoint`]: native state dict files and training checkpoints
//! - [`safetensors`]: HuggingFace-compatible serialization

/// Re-export core types.
pub use vole_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp},
    DType, Error, Layout, Result, Shape, Tensor, TensorId, WithDType,
};

/// Re-export CPU backend.
pub use vole_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export modules, the state registry and layers.
pub mod nn {
    pub use vole_nn::*;
}

mod codec;

/// Checkpoint: native binary state dict and training resume files.
pub mod checkpoint;

/// Safetensors: interoperable tensor serialization (HuggingFace format).
pub mod safetensors;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::checkpoint::TrainingCheckpoint;
    pub use crate::nn::{
        BatchNorm2d, BatchNormConfig, CausalAttention, CausalAttentionConfig, LayerNorm, Linear,
        LoadReport, MaskStrategy, Module, ModuleState, Sequential, SlotKind, StateDict,
    };
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, Shape, Tensor};
}
