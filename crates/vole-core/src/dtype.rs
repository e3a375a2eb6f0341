use std::fmt;

// DType: element types a tensor can hold
//
//   F16 / BF16: half precision, stored through the `half` crate
//   F32 / F64: parameters and floating buffers
//   U8: boolean masks
//   U32: indices
//   I64: counters such as BatchNorm's `num_batches_tracked`

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    U8,
    U32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Floating dtypes can hold parameters and be sampled randomly.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Lowercase Rust-style name, as used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I64 => "i64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rust element types that can back a tensor.
///
/// Connects a concrete type to its [`DType`] tag and to the f64 lingua franca
/// the backends use for generic numeric code.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype_cast {
    ($ty:ty, $dtype:expr) => {
        impl WithDType for $ty {
            const DTYPE: DType = $dtype;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

with_dtype_cast!(f32, DType::F32);
with_dtype_cast!(f64, DType::F64);
with_dtype_cast!(u8, DType::U8);
with_dtype_cast!(u32, DType::U32);
with_dtype_cast!(i64, DType::I64);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}
