//! Device memory owned through a [`Driver`].

use std::fmt;
use std::sync::Arc;

use klib_core::Allocation;

use crate::driver::{DevicePtr, Driver};
use crate::{KernelError, Result};

/// A device allocation of raw bytes on one device.
///
/// Freed through the allocating driver on drop. A zero-byte buffer has a null
/// address and never touches the driver.
pub struct DeviceBuffer {
    driver: Arc<dyn Driver>,
    ptr: DevicePtr,
    device_idx: usize,
    nbytes: usize,
}

impl DeviceBuffer {
    /// Allocate uninitialized device memory.
    pub fn alloc(driver: Arc<dyn Driver>, device_idx: usize, nbytes: usize) -> Result<Self> {
        if nbytes == 0 {
            return Ok(Self { driver, ptr: 0, device_idx, nbytes: 0 });
        }
        let ptr = driver
            .mem_alloc(device_idx, nbytes)
            .map_err(|status| KernelError::Allocation {
                bytes: nbytes,
                device: klib_core::Device::Cuda(device_idx),
                status,
            })?;
        tracing::debug!("allocated {} bytes at {:#x} on cuda:{}", nbytes, ptr, device_idx);
        Ok(Self { driver, ptr, device_idx, nbytes })
    }

    /// Copy host bytes into a new device buffer.
    pub fn from_host(driver: Arc<dyn Driver>, device_idx: usize, data: &[u8]) -> Result<Self> {
        let buf = Self::alloc(driver, device_idx, data.len())?;
        buf.write(data)?;
        Ok(buf)
    }

    /// Overwrite the start of the buffer with `data`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.nbytes {
            return Err(KernelError::Layout(klib_core::KlibError::StorageTooSmall {
                needed: data.len(),
                available: self.nbytes,
            }));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.driver
            .copy_htod(self.device_idx, self.ptr, data)
            .map_err(KernelError::Driver)
    }

    /// Copy the whole buffer back to the host.
    ///
    /// Does not wait for kernels still queued against this memory; synchronize
    /// the stream first.
    pub fn to_host(&self) -> Result<Vec<u8>> {
        let mut host = vec![0u8; self.nbytes];
        if self.nbytes > 0 {
            self.driver
                .copy_dtoh(self.device_idx, &mut host, self.ptr)
                .map_err(KernelError::Driver)?;
        }
        Ok(host)
    }

    pub fn len(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn device_idx(&self) -> usize {
        self.device_idx
    }

    /// Raw device address for kernel launches.
    pub fn as_device_ptr(&self) -> DevicePtr {
        self.ptr
    }
}

impl Allocation for DeviceBuffer {
    fn device_ptr(&self) -> u64 {
        self.ptr
    }

    fn nbytes(&self) -> usize {
        self.nbytes
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("driver", &self.driver.name())
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("device_idx", &self.device_idx)
            .field("nbytes", &self.nbytes)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.ptr != 0 {
            if let Err(status) = self.driver.mem_free(self.device_idx, self.ptr) {
                tracing::warn!("freeing {:#x} on cuda:{} failed: {}", self.ptr, self.device_idx, status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{status, MockDriver};

    #[test]
    fn test_alloc_and_free() {
        let mock = Arc::new(MockDriver::new());
        let drv: Arc<dyn Driver> = mock.clone();
        let buf = DeviceBuffer::alloc(drv, 0, 64).unwrap();
        assert_eq!(buf.len(), 64);
        assert_ne!(buf.as_device_ptr(), 0);
        assert_eq!(mock.bytes_in_use(), 64);
        drop(buf);
        assert_eq!(mock.bytes_in_use(), 0);
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_zero_bytes_skips_driver() {
        let mock = Arc::new(MockDriver::new());
        mock.set_memory_limit(Some(0));
        let buf = DeviceBuffer::alloc(mock.clone(), 0, 0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.as_device_ptr(), 0);
        assert!(buf.to_host().unwrap().is_empty());
        drop(buf);
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_host_round_trip() {
        let mock = Arc::new(MockDriver::new());
        let buf = DeviceBuffer::from_host(mock.clone(), 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.to_host().unwrap(), vec![1, 2, 3, 4]);
        assert!(buf.write(&[0; 5]).is_err());
    }

    #[test]
    fn test_out_of_memory() {
        let mock = Arc::new(MockDriver::new());
        mock.set_memory_limit(Some(100));
        let err = DeviceBuffer::alloc(mock.clone(), 0, 101).unwrap_err();
        match err {
            KernelError::Allocation { bytes, device, status: st } => {
                assert_eq!(bytes, 101);
                assert_eq!(device, klib_core::Device::Cuda(0));
                assert_eq!(st.code, status::OUT_OF_MEMORY);
            }
            other => panic!("expected allocation error, got {other:?}"),
        }
    }
}
