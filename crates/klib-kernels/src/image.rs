//! Device-code images and the table that names them.
//!
//! An image is an opaque blob (cubin, fatbin or PTX) handed to the driver
//! unchanged. Images live for the whole process: embedded ones are
//! `'static` already and run-time ones are leaked on registration.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;

use crate::{KernelError, Result};

/// Identity of an image's bytes, used as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId {
    addr: usize,
    len: usize,
}

/// An immutable device-code image.
#[derive(Debug, Clone, Copy)]
pub struct BinaryImage {
    name: &'static str,
    bytes: &'static [u8],
}

impl BinaryImage {
    /// Wrap bytes embedded at build time, e.g. with `include_bytes!`.
    pub const fn new(name: &'static str, bytes: &'static [u8]) -> Self {
        Self { name, bytes }
    }

    /// Take ownership of run-time bytes for the rest of the process.
    pub fn leak(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: Box::leak(name.into().into_boxed_str()),
            bytes: Box::leak(bytes.into_boxed_slice()),
        }
    }

    /// Read an image file and leak it.
    pub fn from_file(name: impl Into<String>, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| KernelError::ImageRead {
            path: path.display().to_string(),
            source,
        })?;
        let image = Self::leak(name, bytes);
        tracing::debug!("read image '{}' ({} bytes) from {}", image.name, image.len(), path.display());
        Ok(image)
    }

    pub fn id(&self) -> ImageId {
        ImageId {
            addr: self.bytes.as_ptr() as usize,
            len: self.bytes.len(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bytes(&self) -> &'static [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Name → image table, filled at startup and read on every kernel lookup.
#[derive(Default)]
pub struct ImageRegistry {
    images: RwLock<HashMap<String, BinaryImage>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `image` under its name.
    ///
    /// Registering identical bytes again is a no-op; different bytes under a
    /// taken name are rejected.
    pub fn register(&self, image: BinaryImage) -> Result<()> {
        let mut images = self.images.write();
        if let Some(existing) = images.get(image.name()) {
            if existing.bytes() == image.bytes() {
                return Ok(());
            }
            return Err(KernelError::DuplicateImage(image.name().to_string()));
        }
        tracing::debug!("registered image '{}' ({} bytes)", image.name(), image.len());
        images.insert(image.name().to_string(), image);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<BinaryImage> {
        self.images
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::UnknownImage(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.images.read().keys().cloned().collect();
        names.sort();
        names
    }
}
