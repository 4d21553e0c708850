//! Named operations callable through a [`Runtime`].
//!
//! Ops are registered by name at startup and looked up at call time. Each op
//! takes a slice of views and returns a new view (allocating ops) or nothing
//! (in-place kernel ops).

pub mod alloc;
pub mod elementwise;

use std::collections::HashMap;
use std::sync::Arc;

use klib_core::DeviceView;
use parking_lot::RwLock;

use crate::runtime::Runtime;
use crate::{KernelError, Result};

pub type OpFn = Arc<dyn Fn(&Runtime, &[DeviceView]) -> Result<Option<DeviceView>> + Send + Sync>;

/// Name → op table.
#[derive(Default)]
pub struct OpRegistry {
    ops: RwLock<HashMap<String, OpFn>>,
}

impl OpRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the allocation ops `empty_like` and
    /// `empty_bf16_like`.
    pub fn with_builtins() -> Self {
        let reg = Self::new();
        reg.register("empty_like", alloc::empty_like);
        reg.register("empty_bf16_like", alloc::empty_bf16_like);
        reg
    }

    /// Register `f` under `name`, replacing any op already there.
    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(&Runtime, &[DeviceView]) -> Result<Option<DeviceView>> + Send + Sync + 'static,
    {
        if self.ops.write().insert(name.to_string(), Arc::new(f)).is_some() {
            tracing::debug!("replaced op '{}'", name);
        }
    }

    /// Register `op` as a launch of `entry` from image `image` over the
    /// elements of a single contiguous view, modified in place.
    pub fn register_inplace_kernel(&self, op: &str, image: &str, entry: &str) {
        self.register(op, elementwise::inplace_kernel(op, image, entry));
    }

    pub fn get(&self, name: &str) -> Result<OpFn> {
        self.ops
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::UnknownOp(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.read().contains_key(name)
    }

    /// Registered op names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Fail with [`KernelError::BadArguments`] unless exactly `n` views were passed.
pub(crate) fn expect_args(op: &str, args: &[DeviceView], n: usize) -> Result<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(KernelError::BadArguments {
            op: op.to_string(),
            msg: format!("expected {} view(s), got {}", n, args.len()),
        })
    }
}
