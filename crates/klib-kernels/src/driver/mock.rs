//! In-process [`Driver`] with host-backed device memory.
//!
//! Images are `KLIBMOCK` followed by NUL-separated entry names; kernels are
//! host closures registered with [`MockDriver::define_kernel`]. Launches are
//! queued per stream and only run on [`Driver::stream_synchronize`], so
//! callers observe the same enqueue-then-complete ordering as on a GPU.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::{c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{status, DevicePtr, Driver, DriverStatus, FunctionHandle, ModuleHandle, StreamHandle};
use crate::launch::LaunchConfig;

pub const MOCK_IMAGE_MAGIC: &[u8] = b"KLIBMOCK";

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALLOC_ALIGN: u64 = 256;

/// Build a mock image exporting `entries`.
pub fn mock_image(entries: &[&str]) -> Vec<u8> {
    let mut bytes = MOCK_IMAGE_MAGIC.to_vec();
    for entry in entries {
        bytes.extend_from_slice(entry.as_bytes());
        bytes.push(0);
    }
    bytes
}

/// What a mock kernel sees of its launch.
#[derive(Debug, Clone)]
pub struct MockLaunch {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    /// Parameters snapshotted at enqueue time, one 8-byte word each.
    pub params: Vec<u64>,
}

impl MockLaunch {
    /// Total threads in the launch.
    pub fn threads(&self) -> usize {
        let g = self.grid.0 as usize * self.grid.1 as usize * self.grid.2 as usize;
        let b = self.block.0 as usize * self.block.1 as usize * self.block.2 as usize;
        g * b
    }
}

pub type MockKernelFn = Arc<dyn Fn(&MockLaunch, &mut MockMemory) + Send + Sync>;

/// Host buffers addressed by fake device pointers.
#[derive(Debug, Default)]
pub struct MockMemory {
    buffers: BTreeMap<u64, Vec<u8>>,
}

impl MockMemory {
    /// Bytes from `addr` to the end of its buffer, if `addr` is mapped.
    pub fn bytes_mut(&mut self, addr: u64) -> Option<&mut [u8]> {
        let (&base, buf) = self.buffers.range_mut(..=addr).next_back()?;
        let off = (addr - base) as usize;
        if off >= buf.len() {
            return None;
        }
        Some(&mut buf[off..])
    }

    /// Read `n` native-endian f32 values starting at `addr`.
    pub fn read_f32s(&mut self, addr: u64, n: usize) -> Option<Vec<f32>> {
        let bytes = self.bytes_mut(addr)?;
        if bytes.len() < n * 4 {
            return None;
        }
        Some(
            bytes[..n * 4]
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Write native-endian f32 values starting at `addr`.
    pub fn write_f32s(&mut self, addr: u64, values: &[f32]) -> bool {
        match self.bytes_mut(addr) {
            Some(bytes) if bytes.len() >= values.len() * 4 => {
                for (dst, v) in bytes.chunks_exact_mut(4).zip(values) {
                    dst.copy_from_slice(&v.to_ne_bytes());
                }
                true
            }
            _ => false,
        }
    }
}

struct Queued {
    entry: String,
    launch: MockLaunch,
}

struct State {
    memory: MockMemory,
    next_addr: u64,
    bytes_in_use: usize,
    memory_limit: Option<usize>,
    /// Entry names exported by each loaded module; handle = index + 1.
    modules: Vec<Vec<String>>,
    /// Entry name behind each resolved function; handle = index + 1.
    functions: Vec<String>,
    queues: HashMap<(usize, StreamHandle), VecDeque<Queued>>,
    fail_next_launch: Option<i32>,
}

pub struct MockDriver {
    device_count: usize,
    kernels: RwLock<HashMap<String, MockKernelFn>>,
    state: Mutex<State>,
    load_delay: Mutex<Option<Duration>>,
    loads: AtomicUsize,
    resolves: AtomicUsize,
    launches: AtomicUsize,
    executed: AtomicUsize,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::with_devices(1)
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(device_count: usize) -> Self {
        Self {
            device_count,
            kernels: RwLock::new(HashMap::new()),
            state: Mutex::new(State {
                memory: MockMemory::default(),
                next_addr: BASE_ADDRESS,
                bytes_in_use: 0,
                memory_limit: None,
                modules: Vec::new(),
                functions: Vec::new(),
                queues: HashMap::new(),
                fail_next_launch: None,
            }),
            load_delay: Mutex::new(None),
            loads: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
        }
    }

    /// Give entry point `name` a body.
    pub fn define_kernel<F>(&self, name: &str, body: F)
    where
        F: Fn(&MockLaunch, &mut MockMemory) + Send + Sync + 'static,
    {
        self.kernels.write().insert(name.to_string(), Arc::new(body));
    }

    /// Define `name` as an in-place "add one" over f32 data: parameter 0 is
    /// the data address, and threads past the end of the buffer do nothing.
    pub fn define_add_one(&self, name: &str) {
        self.define_kernel(name, |launch, mem| {
            let addr = launch.params[0];
            let available = mem.bytes_mut(addr).map(|b| b.len() / 4).unwrap_or(0);
            let n = launch.threads().min(available);
            if let Some(mut values) = mem.read_f32s(addr, n) {
                values.iter_mut().for_each(|v| *v += 1.0);
                mem.write_f32s(addr, &values);
            }
        });
    }

    /// Make the next launch fail with `code` without enqueueing anything.
    pub fn fail_next_launch(&self, code: i32) {
        self.state.lock().fail_next_launch = Some(code);
    }

    /// Cap total live allocation bytes; `None` removes the cap.
    pub fn set_memory_limit(&self, limit: Option<usize>) {
        self.state.lock().memory_limit = limit;
    }

    /// Sleep inside every module load, widening first-use races in tests.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Launches that have actually run.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Launches queued on `stream` and not yet run.
    pub fn pending(&self, device: usize, stream: StreamHandle) -> usize {
        self.state
            .lock()
            .queues
            .get(&(device, stream))
            .map_or(0, VecDeque::len)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.state.lock().bytes_in_use
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.buffers.len()
    }

    fn check_device(&self, device: usize, call: &'static str) -> Result<(), DriverStatus> {
        if device < self.device_count {
            Ok(())
        } else {
            Err(DriverStatus::new(status::INVALID_DEVICE, call))
        }
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn device_count(&self) -> Result<usize, DriverStatus> {
        Ok(self.device_count)
    }

    fn load_module(&self, device: usize, image: &[u8]) -> Result<ModuleHandle, DriverStatus> {
        const CALL: &str = "cuModuleLoadData";
        self.check_device(device, CALL)?;
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        let body = image
            .strip_prefix(MOCK_IMAGE_MAGIC)
            .ok_or(DriverStatus::new(status::INVALID_IMAGE, CALL))?;
        let entries = body
            .split(|&b| b == 0)
            .filter(|e| !e.is_empty())
            .map(|e| String::from_utf8_lossy(e).into_owned())
            .collect();

        let mut state = self.state.lock();
        state.modules.push(entries);
        Ok(ModuleHandle(state.modules.len()))
    }

    fn get_function(
        &self,
        device: usize,
        module: ModuleHandle,
        name: &CStr,
    ) -> Result<FunctionHandle, DriverStatus> {
        const CALL: &str = "cuModuleGetFunction";
        self.check_device(device, CALL)?;
        let name = name.to_string_lossy();
        let mut state = self.state.lock();
        let entries = module
            .0
            .checked_sub(1)
            .and_then(|i| state.modules.get(i))
            .ok_or(DriverStatus::new(status::INVALID_HANDLE, CALL))?;
        if !entries.iter().any(|e| *e == name) {
            return Err(DriverStatus::new(status::NOT_FOUND, CALL));
        }
        self.resolves.fetch_add(1, Ordering::SeqCst);
        state.functions.push(name.into_owned());
        Ok(FunctionHandle(state.functions.len()))
    }

    unsafe fn launch_kernel(
        &self,
        device: usize,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        params: &mut [*mut c_void],
    ) -> Result<(), DriverStatus> {
        const CALL: &str = "cuLaunchKernel";
        self.check_device(device, CALL)?;
        let mut state = self.state.lock();
        if let Some(code) = state.fail_next_launch.take() {
            return Err(DriverStatus::new(code, CALL));
        }
        let entry = function
            .0
            .checked_sub(1)
            .and_then(|i| state.functions.get(i))
            .cloned()
            .ok_or(DriverStatus::new(status::INVALID_HANDLE, CALL))?;

        let (g, b) = (config.grid_dim, config.block_dim);
        if g.0 == 0 || g.1 == 0 || g.2 == 0 || b.0 == 0 || b.1 == 0 || b.2 == 0 {
            return Err(DriverStatus::new(status::INVALID_VALUE, CALL));
        }
        if b.0 as u64 * b.1 as u64 * b.2 as u64 > 1024 {
            return Err(DriverStatus::new(status::INVALID_VALUE, CALL));
        }

        // Every parameter slot handed to the mock is at least 8 bytes wide.
        let params = params
            .iter()
            .map(|&p| std::ptr::read_unaligned(p as *const u64))
            .collect();
        state
            .queues
            .entry((device, stream))
            .or_default()
            .push_back(Queued {
                entry,
                launch: MockLaunch { grid: g, block: b, params },
            });
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mem_alloc(&self, device: usize, bytes: usize) -> Result<DevicePtr, DriverStatus> {
        const CALL: &str = "cuMemAlloc_v2";
        self.check_device(device, CALL)?;
        let mut state = self.state.lock();
        let in_use = state.bytes_in_use.saturating_add(bytes);
        if state.memory_limit.is_some_and(|limit| in_use > limit) {
            return Err(DriverStatus::new(status::OUT_OF_MEMORY, CALL));
        }
        let addr = state.next_addr;
        let reserved = (bytes as u64).div_ceil(ALLOC_ALIGN).max(1) * ALLOC_ALIGN;
        state.next_addr += reserved + ALLOC_ALIGN;
        state.memory.buffers.insert(addr, vec![0u8; bytes]);
        state.bytes_in_use = in_use;
        Ok(addr)
    }

    fn mem_free(&self, device: usize, ptr: DevicePtr) -> Result<(), DriverStatus> {
        const CALL: &str = "cuMemFree_v2";
        self.check_device(device, CALL)?;
        let mut state = self.state.lock();
        let buf = state
            .memory
            .buffers
            .remove(&ptr)
            .ok_or(DriverStatus::new(status::INVALID_VALUE, CALL))?;
        state.bytes_in_use -= buf.len();
        Ok(())
    }

    fn copy_htod(&self, device: usize, dst: DevicePtr, src: &[u8]) -> Result<(), DriverStatus> {
        const CALL: &str = "cuMemcpyHtoD_v2";
        self.check_device(device, CALL)?;
        let mut state = self.state.lock();
        match state.memory.bytes_mut(dst) {
            Some(bytes) if bytes.len() >= src.len() => {
                bytes[..src.len()].copy_from_slice(src);
                Ok(())
            }
            _ => Err(DriverStatus::new(status::INVALID_VALUE, CALL)),
        }
    }

    fn copy_dtoh(&self, device: usize, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverStatus> {
        const CALL: &str = "cuMemcpyDtoH_v2";
        self.check_device(device, CALL)?;
        let mut state = self.state.lock();
        match state.memory.bytes_mut(src) {
            Some(bytes) if bytes.len() >= dst.len() => {
                let n = dst.len();
                dst.copy_from_slice(&bytes[..n]);
                Ok(())
            }
            _ => Err(DriverStatus::new(status::INVALID_VALUE, CALL)),
        }
    }

    fn stream_synchronize(&self, device: usize, stream: StreamHandle) -> Result<(), DriverStatus> {
        const CALL: &str = "cuStreamSynchronize";
        self.check_device(device, CALL)?;
        let mut state = self.state.lock();
        // A job without a body fails the sync; jobs behind it stay queued.
        while let Some(job) = state
            .queues
            .get_mut(&(device, stream))
            .and_then(VecDeque::pop_front)
        {
            let body = self
                .kernels
                .read()
                .get(&job.entry)
                .cloned()
                .ok_or(DriverStatus::new(status::LAUNCH_FAILED, CALL))?;
            body(&job.launch, &mut state.memory);
            self.executed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(grid: u32, block: u32) -> LaunchConfig {
        LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (block, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    #[test]
    fn test_image_parsing_and_lookup() {
        let drv = MockDriver::new();
        let module = drv.load_module(0, &mock_image(&["a", "b"])).unwrap();
        assert!(drv.get_function(0, module, c"b").is_ok());
        let err = drv.get_function(0, module, c"c").unwrap_err();
        assert_eq!(err.code, status::NOT_FOUND);
    }

    #[test]
    fn test_rejects_foreign_image() {
        let drv = MockDriver::new();
        let err = drv.load_module(0, b"\x7fELF....").unwrap_err();
        assert_eq!(err.code, status::INVALID_IMAGE);
        assert_eq!(drv.loads(), 1);
    }

    #[test]
    fn test_invalid_device() {
        let drv = MockDriver::with_devices(1);
        let err = drv.load_module(1, &mock_image(&["a"])).unwrap_err();
        assert_eq!(err.code, status::INVALID_DEVICE);
    }

    #[test]
    fn test_launch_runs_on_synchronize() {
        let drv = MockDriver::new();
        drv.define_add_one("inc");
        let module = drv.load_module(0, &mock_image(&["inc"])).unwrap();
        let func = drv.get_function(0, module, c"inc").unwrap();

        let ptr = drv.mem_alloc(0, 16).unwrap();
        let mut arg = ptr;
        let mut params = [&mut arg as *mut u64 as *mut c_void];
        unsafe {
            drv.launch_kernel(0, func, &config(1, 4), StreamHandle::DEFAULT, &mut params)
                .unwrap();
        }
        assert_eq!(drv.pending(0, StreamHandle::DEFAULT), 1);
        assert_eq!(drv.executed(), 0);

        drv.stream_synchronize(0, StreamHandle::DEFAULT).unwrap();
        assert_eq!(drv.executed(), 1);
        let mut out = [0u8; 16];
        drv.copy_dtoh(0, &mut out, ptr).unwrap();
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![1.0; 4]);
    }

    #[test]
    fn test_failed_job_leaves_rest_queued() {
        let drv = MockDriver::new();
        drv.define_add_one("inc");
        let module = drv.load_module(0, &mock_image(&["ghost", "inc"])).unwrap();
        let ghost = drv.get_function(0, module, c"ghost").unwrap();
        let inc = drv.get_function(0, module, c"inc").unwrap();

        let ptr = drv.mem_alloc(0, 16).unwrap();
        let mut arg = ptr;
        let mut params = [&mut arg as *mut u64 as *mut c_void];
        unsafe {
            drv.launch_kernel(0, ghost, &config(1, 4), StreamHandle::DEFAULT, &mut params)
                .unwrap();
            drv.launch_kernel(0, inc, &config(1, 4), StreamHandle::DEFAULT, &mut params)
                .unwrap();
        }

        let err = drv.stream_synchronize(0, StreamHandle::DEFAULT).unwrap_err();
        assert_eq!(err.code, status::LAUNCH_FAILED);
        assert_eq!(drv.executed(), 0);
        assert_eq!(drv.pending(0, StreamHandle::DEFAULT), 1);

        drv.stream_synchronize(0, StreamHandle::DEFAULT).unwrap();
        assert_eq!(drv.executed(), 1);
        assert_eq!(drv.pending(0, StreamHandle::DEFAULT), 0);
    }

    #[test]
    fn test_memory_limit_and_free() {
        let drv = MockDriver::new();
        drv.set_memory_limit(Some(100));
        let a = drv.mem_alloc(0, 64).unwrap();
        let err = drv.mem_alloc(0, 64).unwrap_err();
        assert_eq!(err.code, status::OUT_OF_MEMORY);
        drv.mem_free(0, a).unwrap();
        assert_eq!(drv.bytes_in_use(), 0);
        assert!(drv.mem_alloc(0, 64).is_ok());
    }

    #[test]
    fn test_addresses_do_not_overlap() {
        let drv = MockDriver::new();
        let a = drv.mem_alloc(0, 300).unwrap();
        let b = drv.mem_alloc(0, 8).unwrap();
        assert!(b >= a + 300);
        // one byte past the end of `a` is unmapped
        let mut byte = [0u8; 1];
        assert!(drv.copy_dtoh(0, &mut byte, a + 300).is_err());
    }
}
