//! # klib-kernels
//!
//! Device-kernel dispatch over the CUDA driver API.
//!
//! Provides:
//! - Runtime-loaded CUDA driver bindings and an in-process mock driver
//! - A registry of device-code images
//! - Single-flight module loading and kernel resolution
//! - 1-D launch geometry and argument marshalling
//! - Strided allocation sized by cosize
//! - A name → op registry and a process-wide runtime

pub mod driver;
pub mod image;
pub mod cache;
pub mod launch;
pub mod memory;
pub mod env;
pub mod alloc;
pub mod ops;
pub mod config;
pub mod runtime;
pub mod error;

pub use driver::{CudaDriver, Driver, DriverStatus, MockDriver, StreamHandle};
pub use image::{BinaryImage, ImageRegistry};
pub use cache::{Kernel, KernelCache};
pub use launch::{grid_1d, KernelArgs, LaunchConfig, DEFAULT_BLOCK_SIZE};
pub use memory::DeviceBuffer;
pub use env::{DriverEnvironment, Environment};
pub use alloc::{empty_contiguous, empty_like, empty_strided};
pub use ops::{OpFn, OpRegistry};
pub use config::{ImageSource, RuntimeConfig};
pub use runtime::Runtime;
pub use error::KernelError;

pub type Result<T> = std::result::Result<T, KernelError>;
