use smallvec::SmallVec;
use std::fmt;

use crate::layout::Strides;

/// Tensor shape with stack-allocated storage for ≤4 dimensions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Scalar shape (0 dimensions).
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements. A scalar holds one. Saturates at
    /// `usize::MAX`; use [`Shape::try_numel`] where overflow must be an error.
    pub fn numel(&self) -> usize {
        self.try_numel().unwrap_or(usize::MAX)
    }

    /// Total number of elements, or `None` if the product overflows.
    pub fn try_numel(&self) -> Option<usize> {
        if self.is_empty() {
            return Some(0);
        }
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Get dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Get size of a specific dimension.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Whether any extent is zero.
    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }

    /// Element strides of a contiguous row-major layout.
    pub fn contiguous_strides(&self) -> Strides {
        let ndim = self.dims.len();
        let mut strides: Strides = SmallVec::from_elem(1, ndim);
        for i in (0..ndim.saturating_sub(1)).rev() {
            let extent = isize::try_from(self.dims[i + 1].max(1)).unwrap_or(isize::MAX);
            strides[i] = strides[i + 1].saturating_mul(extent);
        }
        strides
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4, 5, 6);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar() {
        let s = Shape::scalar();
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1);
        assert!(!s.is_empty());
        assert!(s.contiguous_strides().is_empty());
    }

    #[test]
    fn test_basic_shape() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.dim(0), Some(2));
        assert_eq!(s.dim(3), None);
    }

    #[test]
    fn test_contiguous_strides() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.contiguous_strides().as_slice(), &[12, 4, 1]);

        // zero extents don't collapse the outer strides
        let s = Shape::new(&[2, 0, 4]);
        assert_eq!(s.contiguous_strides().as_slice(), &[4, 4, 1]);
        assert!(s.is_empty());
        assert_eq!(s.numel(), 0);
    }

    #[test]
    fn test_numel_overflow() {
        let s = Shape::new(&[1 << 63, 2]);
        assert_eq!(s.try_numel(), None);
        assert_eq!(s.numel(), usize::MAX);
        // an empty extent wins even when the other extents overflow
        assert_eq!(Shape::new(&[1 << 63, 2, 0]).try_numel(), Some(0));
        assert_eq!(Shape::new(&[2, 3, 4]).try_numel(), Some(24));
    }

    #[test]
    fn test_from_array() {
        let s: Shape = [10, 1].into();
        assert_eq!(s.dims(), &[10, 1]);
        assert_eq!(format!("{s}"), "[10, 1]");
    }
}
