//! Launch geometry, argument marshalling and asynchronous enqueue.

use std::ffi::c_void;

use crate::cache::Kernel;
use crate::driver::{DevicePtr, Driver, StreamHandle};
use crate::{KernelError, Result};

/// Threads per block for 1-D element-wise launches.
pub const DEFAULT_BLOCK_SIZE: u32 = 256;
/// Largest block the driver accepts.
pub const MAX_BLOCK_SIZE: u32 = 1024;
/// Largest grid x-dimension the driver accepts.
pub const MAX_GRID_X: u64 = (1 << 31) - 1;

/// Grid/block dimensions for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

/// Compute grid dimensions for a 1D kernel launch.
///
/// `grid = ceil(n / block_size)`, so the last block may be partial and the
/// kernel must bounds-check. `n == 0` yields an empty grid.
pub fn grid_1d(n: usize, block_size: u32) -> Result<LaunchConfig> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(KernelError::InvalidLaunch(format!(
            "block size {block_size} outside 1..={MAX_BLOCK_SIZE}"
        )));
    }
    let grid = (n as u64).div_ceil(block_size as u64);
    if grid > MAX_GRID_X {
        return Err(KernelError::InvalidLaunch(format!(
            "{n} elements need {grid} blocks of {block_size}, limit is {MAX_GRID_X}"
        )));
    }
    Ok(LaunchConfig {
        grid_dim: (grid as u32, 1, 1),
        block_dim: (block_size, 1, 1),
        shared_mem_bytes: 0,
    })
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct ArgSlot([u8; 8]);

impl ArgSlot {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut slot = [0u8; 8];
        slot[..bytes.len()].copy_from_slice(bytes);
        ArgSlot(slot)
    }
}

/// Kernel parameters in declaration order.
///
/// Each value lives in its own 8-byte aligned slot; the driver receives a
/// contiguous array of pointers to those slots.
#[derive(Clone, Default)]
pub struct KernelArgs {
    slots: Vec<ArgSlot>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a device address.
    pub fn push_ptr(&mut self, ptr: DevicePtr) -> &mut Self {
        self.push_u64(ptr)
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.slots.push(ArgSlot::from_bytes(&v.to_ne_bytes()));
        self
    }

    pub fn push_i32(&mut self, v: i32) -> &mut Self {
        self.slots.push(ArgSlot::from_bytes(&v.to_ne_bytes()));
        self
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.slots.push(ArgSlot::from_bytes(&v.to_ne_bytes()));
        self
    }

    pub fn push_i64(&mut self, v: i64) -> &mut Self {
        self.slots.push(ArgSlot::from_bytes(&v.to_ne_bytes()));
        self
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        self.slots.push(ArgSlot::from_bytes(&v.to_ne_bytes()));
        self
    }

    pub fn push_f64(&mut self, v: f64) -> &mut Self {
        self.slots.push(ArgSlot::from_bytes(&v.to_ne_bytes()));
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Pointers to each slot, valid while `self` is neither moved nor mutated.
    fn param_ptrs(&mut self) -> Vec<*mut c_void> {
        self.slots
            .iter_mut()
            .map(|s| s.0.as_mut_ptr() as *mut c_void)
            .collect()
    }
}

/// Enqueue `kernel` on `stream` and return without waiting for completion.
///
/// A failing driver status is returned as [`KernelError::Launch`]; nothing is
/// retried.
///
/// # Safety
/// `args` must match the kernel's parameter list, and every device address
/// in it must stay valid until the launch has finished on the device.
pub unsafe fn launch(
    driver: &dyn Driver,
    kernel: &Kernel,
    config: &LaunchConfig,
    stream: StreamHandle,
    args: &mut KernelArgs,
) -> Result<()> {
    let mut params = args.param_ptrs();
    tracing::trace!(
        "launch {} on cuda:{} grid={:?} block={:?} stream={:#x}",
        kernel.name(),
        kernel.device(),
        config.grid_dim,
        config.block_dim,
        stream.0,
    );
    driver
        .launch_kernel(kernel.device(), kernel.handle(), config, stream, &mut params)
        .map_err(|status| KernelError::Launch {
            kernel: kernel.name().to_string(),
            status,
        })
}

/// Launch `kernel` over `n` elements with a 1-D grid.
///
/// `n == 0` is a no-op: the driver is not called and `Ok` is returned.
///
/// # Safety
/// Same contract as [`launch`].
pub unsafe fn launch_1d(
    driver: &dyn Driver,
    kernel: &Kernel,
    args: &mut KernelArgs,
    n: usize,
    block_size: u32,
    stream: StreamHandle,
) -> Result<()> {
    if n == 0 {
        tracing::trace!("skipping empty launch of {}", kernel.name());
        return Ok(());
    }
    let config = grid_1d(n, block_size)?;
    launch(driver, kernel, &config, stream, args)
}
