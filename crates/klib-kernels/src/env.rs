//! The execution environment a kernel call runs in: which stream to enqueue
//! on and where output memory comes from.

use std::collections::HashMap;
use std::sync::Arc;

use klib_core::{DType, Device, DeviceView, KlibError, Shape};
use parking_lot::RwLock;

use crate::driver::{Driver, StreamHandle};
use crate::memory::DeviceBuffer;
use crate::{KernelError, Result};

/// Stream lookup and allocation for kernel calls.
pub trait Environment: Send + Sync {
    /// The stream currently associated with `device`.
    fn stream(&self, device: Device) -> Result<StreamHandle>;

    /// A new contiguous view of `shape` on `device`. Contents are unspecified.
    fn alloc(&self, shape: &Shape, dtype: DType, device: Device) -> Result<DeviceView>;
}

/// Environment backed directly by a [`Driver`].
///
/// Every device starts on its default stream; callers may bind another one
/// with [`DriverEnvironment::set_stream`].
pub struct DriverEnvironment {
    driver: Arc<dyn Driver>,
    streams: RwLock<HashMap<usize, StreamHandle>>,
}

impl DriverEnvironment {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver, streams: RwLock::new(HashMap::new()) }
    }

    /// Bind `stream` to `device`, returning the stream it replaces.
    pub fn set_stream(&self, device: Device, stream: StreamHandle) -> Result<StreamHandle> {
        let idx = cuda_index(device)?;
        let prev = self.streams.write().insert(idx, stream);
        Ok(prev.unwrap_or_default())
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

impl Environment for DriverEnvironment {
    fn stream(&self, device: Device) -> Result<StreamHandle> {
        let idx = cuda_index(device)?;
        Ok(self.streams.read().get(&idx).copied().unwrap_or_default())
    }

    fn alloc(&self, shape: &Shape, dtype: DType, device: Device) -> Result<DeviceView> {
        let idx = cuda_index(device)?;
        let nbytes = shape
            .try_numel()
            .and_then(|n| dtype.storage_bytes(n))
            .ok_or(KlibError::LayoutOverflow)?;
        let buffer = DeviceBuffer::alloc(Arc::clone(&self.driver), idx, nbytes)?;
        Ok(DeviceView::from_allocation(Arc::new(buffer), shape.clone(), dtype, device)?)
    }
}

/// Index of a CUDA device; anything else is rejected.
pub(crate) fn cuda_index(device: Device) -> Result<usize> {
    device
        .cuda_index()
        .ok_or(KernelError::UnsupportedDevice(device))
}
