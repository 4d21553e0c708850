//! Allocation ops.

use klib_core::{DType, DeviceView};

use super::expect_args;
use crate::runtime::Runtime;
use crate::{alloc, Result};

/// `empty_like(v)`: fresh storage with `v`'s shape, strides, dtype and device.
pub fn empty_like(rt: &Runtime, args: &[DeviceView]) -> Result<Option<DeviceView>> {
    expect_args("empty_like", args, 1)?;
    alloc::empty_like(rt.env(), &args[0]).map(Some)
}

/// `empty_bf16_like(v)`: contiguous BF16 storage with `v`'s shape and device.
/// The source strides and dtype are ignored.
pub fn empty_bf16_like(rt: &Runtime, args: &[DeviceView]) -> Result<Option<DeviceView>> {
    expect_args("empty_bf16_like", args, 1)?;
    let like = &args[0];
    alloc::empty_contiguous(rt.env(), like.shape(), DType::BF16, like.device()).map(Some)
}
