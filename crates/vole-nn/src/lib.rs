//! # vole-nn
//!
//! Modules, their parameter/buffer registry, and the layers built on it.
//!
//! 1. **ModuleState**: per-module registry separating trainable parameters
//!    from non-trainable buffers (persistent or transient)
//! 2. **Module trait**: `forward()` plus tree-wide `to_device`,
//!    `state_dict` and `load_state_dict`
//! 3. **StateDict / LoadReport**: ordered export and import diagnostics
//! 4. **Layers**: Linear, LayerNorm, BatchNorm2d (running statistics as
//!    buffers), CausalAttention (causal mask as a buffer), Sequential
//!
//! Modules are generic over `Backend`, so the same definition works on any
//! backend and any of its devices.

pub mod attention;
pub mod batchnorm;
pub mod layernorm;
pub mod linear;
pub mod module;
pub mod sequential;
pub mod state;
pub mod state_dict;

pub use attention::{CausalAttention, CausalAttentionConfig, MaskStrategy};
pub use batchnorm::{BatchNorm2d, BatchNormConfig};
pub use layernorm::LayerNorm;
pub use linear::Linear;
pub use module::Module;
pub use sequential::Sequential;
pub use state::{ModuleState, ModuleStateBuilder, Slot, SlotKind};
pub use state_dict::{LoadReport, StateDict};
