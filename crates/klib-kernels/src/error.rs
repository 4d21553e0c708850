use klib_core::{Device, KlibError};
use thiserror::Error;

use crate::driver::DriverStatus;

/// Errors surfaced by image loading, kernel resolution, launch and allocation.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Device driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Failed to load image '{image}' on cuda:{device}: {status}")]
    ModuleLoad { image: String, device: usize, status: DriverStatus },

    #[error("Function '{func}' not found in image '{image}': {status}")]
    FuncNotFound { image: String, func: String, status: DriverStatus },

    #[error("Kernel '{kernel}' launch failed: {status}")]
    Launch { kernel: String, status: DriverStatus },

    #[error("Invalid launch configuration: {0}")]
    InvalidLaunch(String),

    #[error("Failed to allocate {bytes} bytes on {device}: {status}")]
    Allocation { bytes: usize, device: Device, status: DriverStatus },

    #[error("Device call failed: {0}")]
    Driver(DriverStatus),

    #[error("Operation requires a CUDA device, got {0}")]
    UnsupportedDevice(Device),

    #[error("Image '{0}' is not registered")]
    UnknownImage(String),

    #[error("Image '{0}' is already registered with different contents")]
    DuplicateImage(String),

    #[error("Failed to read image '{path}': {source}")]
    ImageRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Expected a contiguous view, got shape {shape} with strides {strides:?}")]
    NonContiguous { shape: String, strides: Vec<isize> },

    #[error("Unknown op '{0}'")]
    UnknownOp(String),

    #[error("Bad arguments for op '{op}': {msg}")]
    BadArguments { op: String, msg: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Layout(#[from] KlibError),
}
