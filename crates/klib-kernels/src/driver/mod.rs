//! The device-code loader seam.
//!
//! Everything above this module talks to the device through the [`Driver`]
//! trait and opaque handles. Fallible calls hand back the raw [`DriverStatus`];
//! callers translate it into a typed [`KernelError`](crate::KernelError) that
//! says which stage failed.

use std::ffi::{c_void, CStr};
use std::fmt;

use crate::launch::LaunchConfig;

pub mod cuda;
pub mod ffi;
pub mod mock;

pub use cuda::CudaDriver;
pub use mock::{mock_image, MockDriver};

/// Device address as seen by kernels.
pub type DevicePtr = u64;

/// Loaded module (`CUmodule`). Owned by the driver for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// Resolved entry point (`CUfunction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub usize);

/// Execution stream (`CUstream`). Zero is the device's default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

/// A non-success status code returned by a driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStatus {
    pub code: i32,
    pub call: &'static str,
}

impl DriverStatus {
    pub fn new(code: i32, call: &'static str) -> Self {
        Self { code, call }
    }

    /// Symbolic name of the status code, when known.
    pub fn name(&self) -> &'static str {
        status_name(self.code)
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} returned {} ({})", self.call, self.code, self.name())
    }
}

/// Turn a raw driver return code into a `Result`.
pub fn check(code: i32, call: &'static str) -> Result<(), DriverStatus> {
    if code == status::SUCCESS {
        Ok(())
    } else {
        Err(DriverStatus::new(code, call))
    }
}

/// CUDA driver API status codes.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_VALUE: i32 = 1;
    pub const OUT_OF_MEMORY: i32 = 2;
    pub const NOT_INITIALIZED: i32 = 3;
    pub const NO_DEVICE: i32 = 100;
    pub const INVALID_DEVICE: i32 = 101;
    pub const INVALID_IMAGE: i32 = 200;
    pub const INVALID_CONTEXT: i32 = 201;
    pub const NO_BINARY_FOR_GPU: i32 = 209;
    pub const INVALID_PTX: i32 = 218;
    pub const INVALID_HANDLE: i32 = 400;
    pub const NOT_FOUND: i32 = 500;
    pub const ILLEGAL_ADDRESS: i32 = 700;
    pub const LAUNCH_OUT_OF_RESOURCES: i32 = 701;
    pub const LAUNCH_TIMEOUT: i32 = 702;
    pub const LAUNCH_FAILED: i32 = 719;
}

fn status_name(code: i32) -> &'static str {
    match code {
        status::SUCCESS => "CUDA_SUCCESS",
        status::INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE",
        status::OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY",
        status::NOT_INITIALIZED => "CUDA_ERROR_NOT_INITIALIZED",
        status::NO_DEVICE => "CUDA_ERROR_NO_DEVICE",
        status::INVALID_DEVICE => "CUDA_ERROR_INVALID_DEVICE",
        status::INVALID_IMAGE => "CUDA_ERROR_INVALID_IMAGE",
        status::INVALID_CONTEXT => "CUDA_ERROR_INVALID_CONTEXT",
        status::NO_BINARY_FOR_GPU => "CUDA_ERROR_NO_BINARY_FOR_GPU",
        status::INVALID_PTX => "CUDA_ERROR_INVALID_PTX",
        status::INVALID_HANDLE => "CUDA_ERROR_INVALID_HANDLE",
        status::NOT_FOUND => "CUDA_ERROR_NOT_FOUND",
        status::ILLEGAL_ADDRESS => "CUDA_ERROR_ILLEGAL_ADDRESS",
        status::LAUNCH_OUT_OF_RESOURCES => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
        status::LAUNCH_TIMEOUT => "CUDA_ERROR_LAUNCH_TIMEOUT",
        status::LAUNCH_FAILED => "CUDA_ERROR_LAUNCH_FAILED",
        _ => "unknown status",
    }
}

/// Host-side access to a device runtime.
///
/// Implementations must be callable from any thread. Handles they return stay
/// valid for the life of the driver; nothing above this trait unloads modules.
pub trait Driver: Send + Sync {
    /// Short identifier for logs (`"cuda"`, `"mock"`).
    fn name(&self) -> &'static str;

    fn device_count(&self) -> Result<usize, DriverStatus>;

    /// Load a device-code image into `device`'s context.
    fn load_module(&self, device: usize, image: &[u8]) -> Result<ModuleHandle, DriverStatus>;

    /// Look up an entry point in a loaded module.
    fn get_function(
        &self,
        device: usize,
        module: ModuleHandle,
        name: &CStr,
    ) -> Result<FunctionHandle, DriverStatus>;

    /// Enqueue `function` on `stream` and return without waiting for it.
    ///
    /// # Safety
    /// Each entry of `params` must point to a live value whose type and size
    /// match the kernel's corresponding parameter, and any device addresses
    /// among them must be valid for what the kernel does with them.
    unsafe fn launch_kernel(
        &self,
        device: usize,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        params: &mut [*mut c_void],
    ) -> Result<(), DriverStatus>;

    fn mem_alloc(&self, device: usize, bytes: usize) -> Result<DevicePtr, DriverStatus>;

    fn mem_free(&self, device: usize, ptr: DevicePtr) -> Result<(), DriverStatus>;

    fn copy_htod(&self, device: usize, dst: DevicePtr, src: &[u8]) -> Result<(), DriverStatus>;

    fn copy_dtoh(&self, device: usize, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverStatus>;

    /// Block until all work enqueued on `stream` has finished.
    fn stream_synchronize(&self, device: usize, stream: StreamHandle) -> Result<(), DriverStatus>;
}
