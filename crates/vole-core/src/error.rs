use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within vole.
///
/// One enum covers the tensor runtime and the module state registry, so a
/// single `?` chain works from a tensor op up to `load_state_dict`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., trying to add [2,3] + [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in a binary operation.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Two operands of one operation live on different devices.
    #[error("device mismatch: expected a tensor on {expected}, got one on {got}")]
    DeviceMismatch { expected: String, got: String },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to access a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A module-local name is already bound to a parameter, buffer or child.
    #[error("name collision: '{name}' is already registered as a {existing}")]
    NameCollision { name: String, existing: String },

    /// A module asked its registry for a slot that was never declared.
    #[error("unknown state entry '{name}'")]
    UnknownState { name: String },

    /// An imported value disagrees with the registered tensor it targets.
    #[error(
        "state shape mismatch for '{key}': module has {expected_shape} ({expected_dtype}), \
         state dict has {got_shape} ({got_dtype})"
    )]
    StateShapeMismatch {
        key: String,
        expected_shape: Shape,
        expected_dtype: DType,
        got_shape: Shape,
        got_dtype: DType,
    },

    /// Strict import with a key set that differs from the module's.
    #[error(
        "state dict key mismatch: missing [{}], unexpected [{}]",
        .missing.join(", "),
        .unexpected.join(", ")
    )]
    KeyMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// I/O failure while reading or writing serialized state.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
