//! Runtime-loaded CUDA driver API function pointers via dlopen.
//!
//! Nothing links against libcuda at build time; a missing library surfaces as
//! `KernelError::DriverUnavailable` when the driver is created.

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::path::Path;

use libloading::Library;

use crate::{KernelError, Result};

pub type CuResult = c_int;
pub type CuDevice = c_int;
pub type CuContext = *mut c_void;
pub type CuModule = *mut c_void;
pub type CuFunction = *mut c_void;
pub type CuStream = *mut c_void;
pub type CuDeviceptr = u64;

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> CuResult;
type FnCuDeviceGet = unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult;
type FnCuDevicePrimaryCtxRetain = unsafe extern "C" fn(*mut CuContext, CuDevice) -> CuResult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuModuleLoadData = unsafe extern "C" fn(*mut CuModule, *const c_void) -> CuResult;
type FnCuModuleGetFunction = unsafe extern "C" fn(
    *mut CuFunction, CuModule, *const c_char,
) -> CuResult;
type FnCuLaunchKernel = unsafe extern "C" fn(
    CuFunction,
    c_uint, c_uint, c_uint,   // grid x, y, z
    c_uint, c_uint, c_uint,   // block x, y, z
    c_uint,                   // shared mem bytes
    CuStream,                 // stream (null = default)
    *mut *mut c_void,         // kernel params
    *mut *mut c_void,         // extra (null)
) -> CuResult;
type FnCuMemAlloc = unsafe extern "C" fn(*mut CuDeviceptr, usize) -> CuResult;
type FnCuMemFree = unsafe extern "C" fn(CuDeviceptr) -> CuResult;
type FnCuMemcpyHtoD = unsafe extern "C" fn(CuDeviceptr, *const c_void, usize) -> CuResult;
type FnCuMemcpyDtoH = unsafe extern "C" fn(*mut c_void, CuDeviceptr, usize) -> CuResult;
type FnCuStreamSynchronize = unsafe extern "C" fn(CuStream) -> CuResult;

pub struct CudaApi {
    _lib: Library,
    pub cu_init: FnCuInit,
    pub cu_device_get_count: FnCuDeviceGetCount,
    pub cu_device_get: FnCuDeviceGet,
    pub cu_device_primary_ctx_retain: FnCuDevicePrimaryCtxRetain,
    pub cu_ctx_set_current: FnCuCtxSetCurrent,
    pub cu_module_load_data: FnCuModuleLoadData,
    pub cu_module_get_function: FnCuModuleGetFunction,
    pub cu_launch_kernel: FnCuLaunchKernel,
    pub cu_mem_alloc: FnCuMemAlloc,
    pub cu_mem_free: FnCuMemFree,
    pub cu_memcpy_htod: FnCuMemcpyHtoD,
    pub cu_memcpy_dtoh: FnCuMemcpyDtoH,
    pub cu_stream_synchronize: FnCuStreamSynchronize,
}

// Safety: the function pointers are process-global and the CUDA driver is
// internally synchronized.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

const LIBRARY_CANDIDATES: &[&str] = &["libcuda.so.1", "libcuda.so", "nvcuda.dll"];

impl CudaApi {
    /// Open the driver library and resolve every entry point used by klib.
    ///
    /// With `path` set only that file is tried; otherwise the platform's
    /// usual names are probed in order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let lib = match path {
            Some(p) => unsafe { Library::new(p) }.map_err(|e| {
                KernelError::DriverUnavailable(format!("{}: {e}", p.display()))
            })?,
            None => open_default()?,
        };
        unsafe {
            Ok(CudaApi {
                cu_init: symbol(&lib, b"cuInit\0")?,
                cu_device_get_count: symbol(&lib, b"cuDeviceGetCount\0")?,
                cu_device_get: symbol(&lib, b"cuDeviceGet\0")?,
                cu_device_primary_ctx_retain: symbol(&lib, b"cuDevicePrimaryCtxRetain\0")?,
                cu_ctx_set_current: symbol(&lib, b"cuCtxSetCurrent\0")?,
                cu_module_load_data: symbol(&lib, b"cuModuleLoadData\0")?,
                cu_module_get_function: symbol(&lib, b"cuModuleGetFunction\0")?,
                cu_launch_kernel: symbol(&lib, b"cuLaunchKernel\0")?,
                cu_mem_alloc: symbol(&lib, b"cuMemAlloc_v2\0")?,
                cu_mem_free: symbol(&lib, b"cuMemFree_v2\0")?,
                cu_memcpy_htod: symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
                cu_memcpy_dtoh: symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
                cu_stream_synchronize: symbol(&lib, b"cuStreamSynchronize\0")?,
                _lib: lib,
            })
        }
    }
}

fn open_default() -> Result<Library> {
    for candidate in LIBRARY_CANDIDATES {
        // SAFETY: probing only; no symbol is called until all are resolved.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(KernelError::DriverUnavailable(format!(
        "no CUDA driver library found (tried {})",
        LIBRARY_CANDIDATES.join(", ")
    )))
}

/// # Safety
/// `T` must be the C signature of the named symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    let sym = lib.get::<T>(name).map_err(|e| {
        KernelError::DriverUnavailable(format!(
            "missing symbol {}: {e}",
            String::from_utf8_lossy(&name[..name.len() - 1])
        ))
    })?;
    Ok(*sym)
}
