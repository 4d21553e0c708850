//! Lazily loaded modules and resolved kernels, memoized per process.
//!
//! Loading an image and resolving an entry point each happen at most once
//! per key, however many threads ask at the same time. Concurrent first
//! callers block until the single in-flight initialization completes, then
//! all observe the same value. Failures are not stored: the caller gets the
//! error and a later call starts over.

use std::collections::HashMap;
use std::ffi::CString;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::driver::{status, Driver, DriverStatus, FunctionHandle, ModuleHandle};
use crate::image::{BinaryImage, ImageId};
use crate::{KernelError, Result};

struct Cell<V> {
    value: OnceLock<V>,
    init: Mutex<()>,
}

impl<V> Default for Cell<V> {
    fn default() -> Self {
        Self { value: OnceLock::new(), init: Mutex::new(()) }
    }
}

/// Keyed exactly-once initialization.
pub struct SingleFlight<K, V> {
    cells: RwLock<HashMap<K, Arc<Cell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self { cells: RwLock::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value for `key`, running `init` if no caller has
    /// completed it yet. Only one `init` per key runs at a time.
    pub fn get_or_try_init<E>(
        &self,
        key: &K,
        init: impl FnOnce() -> std::result::Result<V, E>,
    ) -> std::result::Result<V, E> {
        let cell = self.cell(key);
        if let Some(v) = cell.value.get() {
            return Ok(v.clone());
        }
        let _guard = cell.init.lock();
        if let Some(v) = cell.value.get() {
            return Ok(v.clone());
        }
        let v = init()?;
        // We hold the init lock, so nobody else can have set it.
        let _ = cell.value.set(v.clone());
        Ok(v)
    }

    /// Completed value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        self.cells.read().get(key).and_then(|c| c.value.get().cloned())
    }

    /// Number of keys with a completed value.
    pub fn len(&self) -> usize {
        self.cells
            .read()
            .values()
            .filter(|c| c.value.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, key: &K) -> Arc<Cell<V>> {
        if let Some(cell) = self.cells.read().get(key) {
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write();
        Arc::clone(cells.entry(key.clone()).or_default())
    }
}

/// A resolved, launchable entry point.
#[derive(Debug, Clone)]
pub struct Kernel {
    handle: FunctionHandle,
    name: Arc<str>,
    image: &'static str,
    device: usize,
}

impl Kernel {
    pub fn handle(&self) -> FunctionHandle {
        self.handle
    }

    /// Entry-point name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the image the kernel came from.
    pub fn image(&self) -> &'static str {
        self.image
    }

    pub fn device(&self) -> usize {
        self.device
    }
}

type ModuleKey = (usize, ImageId);
type KernelKey = (usize, ImageId, String);

/// Module and kernel memo for one driver.
///
/// Modules belong to a device context, so the "once" is per device: an image
/// used on two GPUs is loaded twice. A cache must always be used with the
/// same driver; handles from one driver mean nothing to another.
#[derive(Default)]
pub struct KernelCache {
    modules: SingleFlight<ModuleKey, ModuleHandle>,
    kernels: SingleFlight<KernelKey, Kernel>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name` from `image` on `device`, loading the image first if
    /// this device has not seen it.
    ///
    /// Errors: [`KernelError::ModuleLoad`] when the driver rejects the image,
    /// [`KernelError::FuncNotFound`] when the entry point is absent.
    pub fn resolve(
        &self,
        driver: &dyn Driver,
        device: usize,
        image: &BinaryImage,
        name: &str,
    ) -> Result<Kernel> {
        let key = (device, image.id(), name.to_string());
        self.kernels.get_or_try_init(&key, || {
            let module = self.module(driver, device, image)?;
            let not_found = |status: DriverStatus| KernelError::FuncNotFound {
                image: image.name().to_string(),
                func: name.to_string(),
                status,
            };
            let c_name = CString::new(name)
                .map_err(|_| not_found(DriverStatus::new(status::INVALID_VALUE, "cuModuleGetFunction")))?;
            let handle = driver
                .get_function(device, module, &c_name)
                .map_err(not_found)?;
            tracing::debug!("resolved {}::{} on cuda:{}", image.name(), name, device);
            Ok(Kernel {
                handle,
                name: Arc::from(name),
                image: image.name(),
                device,
            })
        })
    }

    /// Number of modules loaded so far.
    pub fn loaded_modules(&self) -> usize {
        self.modules.len()
    }

    /// Number of kernels resolved so far.
    pub fn resolved_kernels(&self) -> usize {
        self.kernels.len()
    }

    fn module(&self, driver: &dyn Driver, device: usize, image: &BinaryImage) -> Result<ModuleHandle> {
        self.modules.get_or_try_init(&(device, image.id()), || {
            let start = Instant::now();
            let module = driver
                .load_module(device, image.bytes())
                .map_err(|status| KernelError::ModuleLoad {
                    image: image.name().to_string(),
                    device,
                    status,
                })?;
            tracing::info!(
                "loaded image '{}' ({} bytes) on cuda:{} via {} in {:.2}ms",
                image.name(),
                image.len(),
                device,
                driver.name(),
                start.elapsed().as_secs_f64() * 1e3,
            );
            Ok(module)
        })
    }
}
