use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: shape + strides + offset
//
// A layout maps logical element positions to indices in a flat storage
// buffer. Transpose, narrow and broadcast only rewrite the layout; the
// storage is untouched. A registered buffer can therefore be sliced by
// computation code without copying, and the slice keeps reading the
// buffer's storage.

/// Describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Index of the first element inside the storage buffer.
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at offset 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major strides and a zero offset.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Swap two dimensions (and their strides).
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut dims = self.shape.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// View of `len` entries along `dim`, starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.shape.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut dims = self.shape.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::new(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// View of this layout expanded to `target` by broadcasting.
    ///
    /// Broadcast dimensions (size 1 here, larger in `target`) and missing
    /// leading dimensions get stride 0, so the same element is read again.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let src = self.dims();
        let dst = target.dims();
        if src.len() > dst.len() {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: self.shape.clone(),
            });
        }
        let lead = dst.len() - src.len();
        let mut strides = vec![0usize; dst.len()];
        for (i, &d) in src.iter().enumerate() {
            if d == dst[lead + i] {
                strides[lead + i] = self.strides[i];
            } else if d != 1 {
                return Err(Error::ShapeMismatch {
                    expected: target.clone(),
                    got: self.shape.clone(),
                });
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Flat storage index of a multi-dimensional index.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        self.offset
            + index
                .iter()
                .zip(self.strides.iter())
                .map(|(i, s)| i * s)
                .sum::<usize>()
    }

    /// One past the largest storage index this layout reads.
    pub fn storage_end(&self) -> usize {
        if self.elem_count() == 0 {
            return self.offset;
        }
        self.offset
            + self
                .dims()
                .iter()
                .zip(self.strides.iter())
                .map(|(d, s)| (d - 1) * s)
                .sum::<usize>()
            + 1
    }

    /// Storage indices of every element, in logical row-major order.
    pub fn strided_indices(&self) -> StridedIndices<'_> {
        StridedIndices {
            layout: self,
            position: 0,
            len: self.elem_count(),
        }
    }
}

/// Iterator over the flat storage indices of a [`Layout`].
///
/// Each logical position is split into per-dimension coordinates from the
/// innermost dimension outwards and mapped through the strides.
pub struct StridedIndices<'a> {
    layout: &'a Layout,
    position: usize,
    len: usize,
}

impl Iterator for StridedIndices<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.position == self.len {
            return None;
        }
        let mut rest = self.position;
        let mut index = self.layout.offset;
        for (&dim, &stride) in self.layout.dims().iter().zip(&self.layout.strides).rev() {
            index += (rest % dim) * stride;
            rest /= dim;
        }
        self.position += 1;
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.len - self.position;
        (left, Some(left))
    }
}

impl ExactSizeIterator for StridedIndices<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_indices() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_indices() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let t = layout.transpose(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert!(!t.is_contiguous());
        let indices: Vec<usize> = t.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_narrow_offsets_into_storage() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let n = layout.narrow(1, 2, 3).unwrap();
        assert_eq!(n.dims(), &[4, 3]);
        assert_eq!(n.offset(), 2);
        let indices: Vec<usize> = n.strided_indices().take(4).collect();
        assert_eq!(indices, vec![2, 3, 4, 8]);
        assert!(layout.narrow(1, 5, 3).is_err());
        assert_eq!(n.storage_end(), 3 * 6 + 4 + 1);
        assert_eq!(layout.storage_end(), 24);
        assert_eq!(layout.narrow(0, 1, 0).unwrap().storage_end(), 6);
    }

    #[test]
    fn test_broadcast_as_repeats_rows() {
        let layout = Layout::contiguous(Shape::from((1, 3)));
        let b = layout.broadcast_as(&Shape::from((2, 3))).unwrap();
        assert_eq!(b.strides(), &[0, 1]);
        let indices: Vec<usize> = b.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
        assert!(layout.broadcast_as(&Shape::from((2, 4))).is_err());
    }

    #[test]
    fn test_scalar_layout_yields_one_index() {
        let layout = Layout::contiguous(Shape::from(()));
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0]);
    }
}
