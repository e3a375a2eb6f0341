use std::fmt;

use crate::error::{Error, Result};

/// N-dimensional shape of a tensor. A scalar has shape `[]` and one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Row-major strides: for `[2, 3, 4]` this is `[12, 4, 1]`.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1;
        for (stride, &dim) in strides.iter_mut().zip(self.0.iter()).rev() {
            *stride = acc;
            acc *= dim;
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// NumPy-style broadcast of two shapes.
    ///
    /// Shapes are aligned from the right. A pair of dims is compatible when
    /// they are equal or one of them is 1. Missing leading dims count as 1.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(rank);

        for i in 0..rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            let d = match (ld, rd) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(Error::msg(format!(
                        "shapes {lhs} and {rhs} are not broadcast-compatible \
                         (dim {i} from the right: {ld} vs {rd})"
                    )))
                }
            };
            result.push(d);
        }

        result.reverse();
        Ok(Shape::new(result))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(Vec::new())
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

macro_rules! shape_from_tuple {
    ($($d:ident),+) => {
        impl From<($(shape_from_tuple!(@usize $d),)+)> for Shape {
            fn from(($($d,)+): ($(shape_from_tuple!(@usize $d),)+)) -> Self {
                Shape(vec![$($d),+])
            }
        }
    };
    (@usize $d:ident) => { usize };
}

shape_from_tuple!(d0);
shape_from_tuple!(d0, d1);
shape_from_tuple!(d0, d1, d2);
shape_from_tuple!(d0, d1, d2, d3);

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}
