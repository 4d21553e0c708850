//! [`Driver`] backed by the CUDA driver API.
//!
//! Each device index uses its primary context, retained on first use and
//! made current before every call, so callers may come from any thread.

use std::collections::HashMap;
use std::ffi::{c_uint, c_void, CStr};
use std::path::Path;

use parking_lot::Mutex;

use super::ffi::{CudaApi, CuContext, CuDevice, CuDeviceptr, CuFunction, CuModule, CuStream};
use super::{check, DevicePtr, Driver, DriverStatus, FunctionHandle, ModuleHandle, StreamHandle};
use crate::launch::LaunchConfig;
use crate::{KernelError, Result};

pub struct CudaDriver {
    api: CudaApi,
    /// Retained primary contexts, keyed by device index. Stored as `usize`
    /// so the driver stays `Send + Sync`.
    contexts: Mutex<HashMap<usize, usize>>,
}

impl CudaDriver {
    /// Bind the driver library and initialize CUDA.
    pub fn new(library: Option<&Path>) -> Result<Self> {
        let api = CudaApi::load(library)?;
        check(unsafe { (api.cu_init)(0) }, "cuInit")
            .map_err(|s| KernelError::DriverUnavailable(s.to_string()))?;
        let driver = Self { api, contexts: Mutex::new(HashMap::new()) };
        let count = driver.device_count().unwrap_or(0);
        tracing::info!("CUDA driver initialized, {} device(s) visible", count);
        Ok(driver)
    }

    fn make_current(&self, device: usize) -> std::result::Result<(), DriverStatus> {
        // The table lock covers retain only; setting the context is per thread.
        let ctx = {
            let mut contexts = self.contexts.lock();
            match contexts.get(&device) {
                Some(&ctx) => ctx as CuContext,
                None => {
                    let ordinal = i32::try_from(device)
                        .map_err(|_| DriverStatus::new(super::status::INVALID_DEVICE, "cuDeviceGet"))?;
                    let mut dev: CuDevice = 0;
                    check(unsafe { (self.api.cu_device_get)(&mut dev, ordinal) }, "cuDeviceGet")?;
                    let mut ctx: CuContext = std::ptr::null_mut();
                    check(
                        unsafe { (self.api.cu_device_primary_ctx_retain)(&mut ctx, dev) },
                        "cuDevicePrimaryCtxRetain",
                    )?;
                    tracing::debug!("retained primary context for cuda:{}", device);
                    contexts.insert(device, ctx as usize);
                    ctx
                }
            }
        };
        check(unsafe { (self.api.cu_ctx_set_current)(ctx) }, "cuCtxSetCurrent")
    }
}

impl Driver for CudaDriver {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> std::result::Result<usize, DriverStatus> {
        let mut count = 0;
        check(unsafe { (self.api.cu_device_get_count)(&mut count) }, "cuDeviceGetCount")?;
        Ok(count.max(0) as usize)
    }

    fn load_module(
        &self,
        device: usize,
        image: &[u8],
    ) -> std::result::Result<ModuleHandle, DriverStatus> {
        self.make_current(device)?;
        let mut module: CuModule = std::ptr::null_mut();
        check(
            unsafe { (self.api.cu_module_load_data)(&mut module, image.as_ptr() as *const c_void) },
            "cuModuleLoadData",
        )?;
        Ok(ModuleHandle(module as usize))
    }

    fn get_function(
        &self,
        device: usize,
        module: ModuleHandle,
        name: &CStr,
    ) -> std::result::Result<FunctionHandle, DriverStatus> {
        self.make_current(device)?;
        let mut func: CuFunction = std::ptr::null_mut();
        check(
            unsafe {
                (self.api.cu_module_get_function)(&mut func, module.0 as CuModule, name.as_ptr())
            },
            "cuModuleGetFunction",
        )?;
        Ok(FunctionHandle(func as usize))
    }

    unsafe fn launch_kernel(
        &self,
        device: usize,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        params: &mut [*mut c_void],
    ) -> std::result::Result<(), DriverStatus> {
        self.make_current(device)?;
        check(
            (self.api.cu_launch_kernel)(
                function.0 as CuFunction,
                config.grid_dim.0 as c_uint,
                config.grid_dim.1 as c_uint,
                config.grid_dim.2 as c_uint,
                config.block_dim.0 as c_uint,
                config.block_dim.1 as c_uint,
                config.block_dim.2 as c_uint,
                config.shared_mem_bytes as c_uint,
                stream.0 as CuStream,
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            ),
            "cuLaunchKernel",
        )
    }

    fn mem_alloc(&self, device: usize, bytes: usize) -> std::result::Result<DevicePtr, DriverStatus> {
        self.make_current(device)?;
        let mut ptr: CuDeviceptr = 0;
        check(unsafe { (self.api.cu_mem_alloc)(&mut ptr, bytes) }, "cuMemAlloc_v2")?;
        Ok(ptr)
    }

    fn mem_free(&self, device: usize, ptr: DevicePtr) -> std::result::Result<(), DriverStatus> {
        self.make_current(device)?;
        check(unsafe { (self.api.cu_mem_free)(ptr) }, "cuMemFree_v2")
    }

    fn copy_htod(
        &self,
        device: usize,
        dst: DevicePtr,
        src: &[u8],
    ) -> std::result::Result<(), DriverStatus> {
        if src.is_empty() {
            return Ok(());
        }
        self.make_current(device)?;
        check(
            unsafe { (self.api.cu_memcpy_htod)(dst, src.as_ptr() as *const c_void, src.len()) },
            "cuMemcpyHtoD_v2",
        )
    }

    fn copy_dtoh(
        &self,
        device: usize,
        dst: &mut [u8],
        src: DevicePtr,
    ) -> std::result::Result<(), DriverStatus> {
        if dst.is_empty() {
            return Ok(());
        }
        self.make_current(device)?;
        check(
            unsafe { (self.api.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src, dst.len()) },
            "cuMemcpyDtoH_v2",
        )
    }

    fn stream_synchronize(
        &self,
        device: usize,
        stream: StreamHandle,
    ) -> std::result::Result<(), DriverStatus> {
        self.make_current(device)?;
        check(
            unsafe { (self.api.cu_stream_synchronize)(stream.0 as CuStream) },
            "cuStreamSynchronize",
        )
    }
}
