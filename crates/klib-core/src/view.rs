//! Views over device memory.
//!
//! A `DeviceView` is the descriptor handed across the kernel boundary: the
//! address of logical element 0 plus shape, strides, dtype and device. It
//! never dereferences its address on the host.

use std::fmt;
use std::sync::Arc;

use crate::layout::{self, Strides};
use crate::{DType, Device, KlibError, Result, Shape};

/// A device allocation that can back one or more views.
///
/// Implementors release their memory on drop; views hold them through an
/// `Arc` so the memory lives as long as the last view over it.
pub trait Allocation: Send + Sync + fmt::Debug {
    /// Device address of the first byte.
    fn device_ptr(&self) -> u64;
    /// Size of the allocation in bytes.
    fn nbytes(&self) -> usize;
}

/// A strided view over device memory.
#[derive(Debug, Clone)]
pub struct DeviceView {
    data: u64,
    shape: Shape,
    strides: Strides,
    dtype: DType,
    device: Device,
    owner: Option<Arc<dyn Allocation>>,
}

impl DeviceView {
    /// Describe caller-owned memory. The address must stay valid for as long
    /// as the view is used; nothing here checks it.
    pub fn from_raw(
        data: u64,
        shape: Shape,
        strides: Strides,
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        if shape.ndim() != strides.len() {
            return Err(KlibError::RankMismatch {
                shape: shape.ndim(),
                strides: strides.len(),
            });
        }
        Ok(Self { data, shape, strides, dtype, device, owner: None })
    }

    /// Contiguous row-major view covering the start of `owner`.
    pub fn from_allocation(
        owner: Arc<dyn Allocation>,
        shape: Shape,
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        let needed = shape
            .try_numel()
            .and_then(|n| dtype.storage_bytes(n))
            .ok_or(KlibError::LayoutOverflow)?;
        if needed > owner.nbytes() {
            return Err(KlibError::StorageTooSmall { needed, available: owner.nbytes() });
        }
        let strides = shape.contiguous_strides();
        Ok(Self {
            data: owner.device_ptr(),
            shape,
            strides,
            dtype,
            device,
            owner: Some(owner),
        })
    }

    /// Re-stripe the owning allocation with a new layout.
    ///
    /// The allocation start is treated as the lowest address the layout may
    /// reach, so logical element 0 lands at the layout's base offset.
    pub fn restride(&self, shape: Shape, strides: Strides) -> Result<Self> {
        let owner = self.owner.as_ref().ok_or(KlibError::Unowned)?;
        let span = layout::span(shape.dims(), &strides)?;
        let elem = self.dtype.size_in_bytes();
        let needed = span.cosize.checked_mul(elem).ok_or(KlibError::LayoutOverflow)?;
        if needed > owner.nbytes() {
            return Err(KlibError::StorageTooSmall { needed, available: owner.nbytes() });
        }
        let base_bytes = (span.base_offset() * elem) as u64;
        Ok(Self {
            data: owner.device_ptr() + base_bytes,
            shape,
            strides,
            dtype: self.dtype,
            device: self.device,
            owner: Some(Arc::clone(owner)),
        })
    }

    /// Device address of logical element 0.
    pub fn data_ptr(&self) -> u64 {
        self.data
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn is_contiguous(&self) -> bool {
        layout::is_contiguous(self.shape.dims(), &self.strides)
    }

    /// The allocation keeping this view's memory alive, if any.
    pub fn owner(&self) -> Option<&Arc<dyn Allocation>> {
        self.owner.as_ref()
    }

    /// Bytes between the lowest and highest addressable element, inclusive.
    pub fn nbytes_spanned(&self) -> Result<usize> {
        let cosize = layout::cosize(self.shape.dims(), &self.strides)?;
        self.dtype
            .storage_bytes(cosize)
            .ok_or(KlibError::LayoutOverflow)
    }
}
