//! # vole-core
//!
//! Core tensor primitives, types and backend traits for vole.
//!
//! This crate provides:
//! - [`Tensor`]: n-dimensional array handle with shared, lock-guarded storage
//! - [`Shape`] / [`Layout`]: shape, strides, and memory layout
//! - [`DType`]: data types (F16, BF16, F32, F64, U8, U32, I64)
//! - [`Backend`] / [`BackendDevice`]: abstraction over storage locations
//! - [`Error`]: the single error type used across the workspace

pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::Shape;
pub use tensor::{Tensor, TensorId};
