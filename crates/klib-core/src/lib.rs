//! # klib-core
//!
//! Descriptor types shared by the klib kernel crates.
//!
//! Provides:
//! - `DType` and `Device` tags
//! - `Shape` and signed strides
//! - Layout math (span, cosize, contiguity)
//! - `DeviceView`, a strided view over device memory

pub mod dtype;
pub mod device;
pub mod shape;
pub mod layout;
pub mod view;
pub mod error;

pub use dtype::DType;
pub use device::Device;
pub use shape::Shape;
pub use layout::{Span, Strides};
pub use view::{Allocation, DeviceView};
pub use error::KlibError;

pub type Result<T> = std::result::Result<T, KlibError>;
