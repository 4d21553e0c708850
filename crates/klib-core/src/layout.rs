//! Strided layout math.
//!
//! A layout is a shape plus one signed element stride per dimension. The
//! routines here answer how much backing storage a layout addresses and
//! where its first logical element sits inside that storage.

use smallvec::SmallVec;

use crate::{KlibError, Result};

/// Per-dimension element strides. Zero and negative strides are allowed.
pub type Strides = SmallVec<[isize; 4]>;

/// Range of element offsets reachable through a layout, relative to the
/// address of logical element 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Lowest reachable offset (≤ 0).
    pub min_offset: isize,
    /// Highest reachable offset (≥ 0).
    pub max_offset: isize,
    /// Minimal number of elements a flat buffer needs to back the layout.
    pub cosize: usize,
}

impl Span {
    /// Element index inside the backing buffer where logical element 0 lives.
    pub fn base_offset(&self) -> usize {
        self.min_offset.unsigned_abs()
    }
}

/// Compute the reachable span of `shape` walked with `strides`.
///
/// Positive strides extend the span upwards and negative strides downwards,
/// so for all-non-negative strides `cosize == 1 + Σ (shape[i] - 1) * strides[i]`.
/// A shape with any zero extent addresses nothing and has `cosize == 0`.
pub fn span(shape: &[usize], strides: &[isize]) -> Result<Span> {
    if shape.len() != strides.len() {
        return Err(KlibError::RankMismatch {
            shape: shape.len(),
            strides: strides.len(),
        });
    }
    if shape.iter().any(|&d| d == 0) {
        return Ok(Span { min_offset: 0, max_offset: 0, cosize: 0 });
    }

    let mut min_offset: isize = 0;
    let mut max_offset: isize = 0;
    for (&extent, &stride) in shape.iter().zip(strides) {
        let reach = isize::try_from(extent - 1)
            .ok()
            .and_then(|last| last.checked_mul(stride))
            .ok_or(KlibError::LayoutOverflow)?;
        if reach >= 0 {
            max_offset = max_offset.checked_add(reach).ok_or(KlibError::LayoutOverflow)?;
        } else {
            min_offset = min_offset.checked_add(reach).ok_or(KlibError::LayoutOverflow)?;
        }
    }

    let cosize = max_offset
        .checked_sub(min_offset)
        .and_then(|d| usize::try_from(d).ok())
        .and_then(|d| d.checked_add(1))
        .ok_or(KlibError::LayoutOverflow)?;

    Ok(Span { min_offset, max_offset, cosize })
}

/// Minimal backing-buffer element count for a layout.
pub fn cosize(shape: &[usize], strides: &[isize]) -> Result<usize> {
    span(shape, strides).map(|s| s.cosize)
}

/// Whether the layout is dense row-major. Extents of 1 place no constraint
/// on their stride.
pub fn is_contiguous(shape: &[usize], strides: &[isize]) -> bool {
    if shape.len() != strides.len() {
        return false;
    }
    if shape.iter().any(|&d| d == 0) {
        return true;
    }
    let mut expected: isize = 1;
    for (&extent, &stride) in shape.iter().zip(strides).rev() {
        if extent == 1 {
            continue;
        }
        if stride != expected {
            return false;
        }
        expected = match isize::try_from(extent).ok().and_then(|e| expected.checked_mul(e)) {
            Some(e) => e,
            None => return false,
        };
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosize_row_major() {
        assert_eq!(cosize(&[3, 4], &[4, 1]).unwrap(), 12);
        assert_eq!(cosize(&[4], &[1]).unwrap(), 4);
    }

    #[test]
    fn test_cosize_column_major() {
        assert_eq!(cosize(&[2, 3], &[1, 2]).unwrap(), 6);
    }

    #[test]
    fn test_cosize_padded_rows() {
        // torch.empty_strided([10, 1], [100, 1])
        assert_eq!(cosize(&[10, 1], &[100, 1]).unwrap(), 901);
    }

    #[test]
    fn test_cosize_broadcast_and_scalar() {
        assert_eq!(cosize(&[5, 3], &[0, 1]).unwrap(), 3);
        assert_eq!(cosize(&[], &[]).unwrap(), 1);
    }

    #[test]
    fn test_zero_extent_addresses_nothing() {
        let s = span(&[3, 0, 2], &[8, 2, 1]).unwrap();
        assert_eq!(s.cosize, 0);
        assert_eq!(s.base_offset(), 0);
    }

    #[test]
    fn test_negative_strides() {
        // reversed 1-D view of 5 elements
        let s = span(&[5], &[-1]).unwrap();
        assert_eq!(s.min_offset, -4);
        assert_eq!(s.max_offset, 0);
        assert_eq!(s.cosize, 5);
        assert_eq!(s.base_offset(), 4);

        // rows reversed, columns forward
        let s = span(&[3, 4], &[-4, 1]).unwrap();
        assert_eq!((s.min_offset, s.max_offset, s.cosize), (-8, 3, 12));
    }

    #[test]
    fn test_rank_mismatch() {
        assert!(matches!(
            span(&[2, 3], &[1]),
            Err(KlibError::RankMismatch { shape: 2, strides: 1 })
        ));
    }

    #[test]
    fn test_overflow_is_reported() {
        assert!(matches!(
            span(&[usize::MAX], &[2]),
            Err(KlibError::LayoutOverflow)
        ));
        assert!(matches!(
            span(&[3, 3], &[isize::MAX / 2, -(isize::MAX / 2)]),
            Err(KlibError::LayoutOverflow)
        ));
    }

    #[test]
    fn test_is_contiguous() {
        assert!(is_contiguous(&[3, 4], &[4, 1]));
        assert!(is_contiguous(&[10, 1], &[1, 100]));
        assert!(!is_contiguous(&[10, 1], &[100, 1]));
        assert!(!is_contiguous(&[2, 3], &[1, 2]));
        assert!(is_contiguous(&[], &[]));
        assert!(!is_contiguous(&[4], &[-1]));
    }

    #[test]
    fn test_is_contiguous_huge_extent() {
        // usize::MAX must not wrap to -1 and match a negative stride
        assert!(!is_contiguous(&[2, usize::MAX], &[-1, 1]));
    }
}
