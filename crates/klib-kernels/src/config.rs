//! Runtime configuration.
//!
//! Read from a JSON file, the environment, or both: `KLIB_CONFIG` names a
//! file to start from, and the other `KLIB_*` variables override it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::launch::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
use crate::{KernelError, Result};

pub const ENV_CONFIG: &str = "KLIB_CONFIG";
pub const ENV_DRIVER_LIBRARY: &str = "KLIB_DRIVER_LIBRARY";
pub const ENV_BLOCK_SIZE: &str = "KLIB_BLOCK_SIZE";
pub const ENV_SYNC_LAUNCH: &str = "KLIB_SYNC_LAUNCH";

/// A device-code image to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    /// Registry name ops refer to.
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Explicit path to the CUDA driver library. Probed from the usual
    /// names when unset.
    pub driver_library: Option<PathBuf>,

    /// Threads per block for 1-D launches.
    pub block_size: u32,

    /// Wait for each launch to finish before returning, so device faults
    /// are reported by the call that caused them.
    pub sync_after_launch: bool,

    /// Images loaded into the registry when the runtime starts.
    pub images: Vec<ImageSource>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            driver_library: None,
            block_size: DEFAULT_BLOCK_SIZE,
            sync_after_launch: false,
            images: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| KernelError::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from `KLIB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(ENV_CONFIG) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(lib) = lookup(ENV_DRIVER_LIBRARY) {
            config.driver_library = Some(PathBuf::from(lib));
        }
        if let Some(raw) = lookup(ENV_BLOCK_SIZE) {
            config.block_size = raw.trim().parse().map_err(|_| {
                KernelError::Config(format!("{ENV_BLOCK_SIZE}={raw:?} is not a block size"))
            })?;
        }
        if let Some(raw) = lookup(ENV_SYNC_LAUNCH) {
            config.sync_after_launch = parse_flag(&raw).ok_or_else(|| {
                KernelError::Config(format!("{ENV_SYNC_LAUNCH}={raw:?} is not a boolean"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(reject(format!(
                "block_size {} outside 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        let mut seen = HashSet::new();
        for image in &self.images {
            if image.name.is_empty() {
                return Err(reject(format!("image at {} has no name", image.path.display())));
            }
            if !seen.insert(image.name.as_str()) {
                return Err(reject(format!("image '{}' listed twice", image.name)));
            }
        }
        Ok(())
    }
}

fn reject(msg: String) -> KernelError {
    tracing::warn!("rejected runtime config: {}", msg);
    KernelError::Config(msg)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
