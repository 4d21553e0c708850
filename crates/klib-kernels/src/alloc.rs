//! Strided allocation.
//!
//! A strided request is served with one contiguous buffer just large enough
//! to back every element the layout can address (its cosize), then viewed
//! through the requested strides.

use klib_core::{layout, DType, Device, DeviceView, Shape, Strides};

use crate::env::Environment;
use crate::Result;

/// Allocate storage for `shape` walked with `strides`.
///
/// The view's element 0 sits at the layout's base offset inside the buffer,
/// so negative strides stay in bounds. A shape with a zero extent allocates
/// nothing.
pub fn empty_strided(
    env: &dyn Environment,
    shape: &Shape,
    strides: &[isize],
    dtype: DType,
    device: Device,
) -> Result<DeviceView> {
    let span = layout::span(shape.dims(), strides)?;
    tracing::debug!(
        "empty_strided shape={} strides={:?} dtype={} on {}: cosize={}",
        shape,
        strides,
        dtype,
        device,
        span.cosize,
    );
    let backing = env.alloc(&Shape::new(&[span.cosize]), dtype, device)?;
    Ok(backing.restride(shape.clone(), Strides::from_slice(strides))?)
}

/// Allocate a view with the same shape, strides, dtype and device as `like`.
pub fn empty_like(env: &dyn Environment, like: &DeviceView) -> Result<DeviceView> {
    empty_strided(env, like.shape(), like.strides(), like.dtype(), like.device())
}

/// Allocate a contiguous view of `shape`.
pub fn empty_contiguous(
    env: &dyn Environment,
    shape: &Shape,
    dtype: DType,
    device: Device,
) -> Result<DeviceView> {
    env.alloc(shape, dtype, device)
}
