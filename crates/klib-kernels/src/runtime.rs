//! The runtime: one driver plus everything needed to call ops through it.

use std::sync::{Arc, OnceLock};

use klib_core::{Device, DeviceView};

use crate::cache::{Kernel, KernelCache};
use crate::config::RuntimeConfig;
use crate::driver::{CudaDriver, Driver};
use crate::env::{cuda_index, DriverEnvironment, Environment};
use crate::image::{BinaryImage, ImageRegistry};
use crate::launch::{self, KernelArgs};
use crate::ops::OpRegistry;
use crate::{KernelError, Result};

/// Driver, environment, images, kernel cache and ops for one process.
pub struct Runtime {
    driver: Arc<dyn Driver>,
    env: DriverEnvironment,
    images: ImageRegistry,
    kernels: KernelCache,
    ops: OpRegistry,
    config: RuntimeConfig,
}

impl Runtime {
    /// Build a runtime over `driver`, registering the built-in ops and every
    /// image listed in `config`.
    pub fn new(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let images = ImageRegistry::new();
        for source in &config.images {
            images.register(BinaryImage::from_file(source.name.clone(), &source.path)?)?;
        }
        tracing::info!(
            "runtime ready: driver={} images={} block_size={} sync_after_launch={}",
            driver.name(),
            config.images.len(),
            config.block_size,
            config.sync_after_launch,
        );
        Ok(Self {
            env: DriverEnvironment::new(Arc::clone(&driver)),
            driver,
            images,
            kernels: KernelCache::new(),
            ops: OpRegistry::with_builtins(),
            config,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn env(&self) -> &DriverEnvironment {
        &self.env
    }

    pub fn images(&self) -> &ImageRegistry {
        &self.images
    }

    pub fn kernels(&self) -> &KernelCache {
        &self.kernels
    }

    pub fn ops(&self) -> &OpRegistry {
        &self.ops
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn register_image(&self, image: BinaryImage) -> Result<()> {
        self.images.register(image)
    }

    /// Shorthand for [`OpRegistry::register_inplace_kernel`].
    pub fn register_inplace_kernel(&self, op: &str, image: &str, entry: &str) {
        self.ops.register_inplace_kernel(op, image, entry);
    }

    /// Resolve `entry` from the registered image `image_name` on `device`,
    /// loading the image on first use.
    pub fn resolve(&self, image_name: &str, entry: &str, device: Device) -> Result<Kernel> {
        let idx = cuda_index(device)?;
        let image = self.images.get(image_name)?;
        self.kernels.resolve(self.driver.as_ref(), idx, &image, entry)
    }

    /// Launch `kernel` over `n` elements on its device's current stream.
    ///
    /// Returns once the launch is enqueued, or once it has finished when
    /// `sync_after_launch` is set.
    ///
    /// # Safety
    /// Same contract as [`launch::launch`].
    pub unsafe fn launch_1d(&self, kernel: &Kernel, args: &mut KernelArgs, n: usize) -> Result<()> {
        let stream = self.env.stream(Device::Cuda(kernel.device()))?;
        launch::launch_1d(self.driver.as_ref(), kernel, args, n, self.config.block_size, stream)?;
        if self.config.sync_after_launch && n > 0 {
            self.driver
                .stream_synchronize(kernel.device(), stream)
                .map_err(|status| KernelError::Launch {
                    kernel: kernel.name().to_string(),
                    status,
                })?;
        }
        Ok(())
    }

    /// Run the registered op `op` on `args`.
    pub fn call(&self, op: &str, args: &[DeviceView]) -> Result<Option<DeviceView>> {
        let f = self.ops.get(op)?;
        tracing::debug!("call {} with {} view(s)", op, args.len());
        f(self, args)
    }

    /// Block until the current stream of `device` is idle.
    pub fn synchronize(&self, device: Device) -> Result<()> {
        let idx = cuda_index(device)?;
        let stream = self.env.stream(device)?;
        self.driver
            .stream_synchronize(idx, stream)
            .map_err(KernelError::Driver)
    }

    /// Copy host bytes into the start of a contiguous view.
    pub fn write_bytes(&self, view: &DeviceView, data: &[u8]) -> Result<()> {
        let (idx, nbytes) = self.contiguous_extent(view)?;
        if data.len() > nbytes {
            return Err(klib_core::KlibError::StorageTooSmall { needed: data.len(), available: nbytes }.into());
        }
        if data.is_empty() {
            return Ok(());
        }
        self.driver
            .copy_htod(idx, view.data_ptr(), data)
            .map_err(KernelError::Driver)
    }

    /// Copy a contiguous view's elements back to the host. Does not wait for
    /// queued kernels.
    pub fn read_bytes(&self, view: &DeviceView) -> Result<Vec<u8>> {
        let (idx, nbytes) = self.contiguous_extent(view)?;
        let mut host = vec![0u8; nbytes];
        if nbytes > 0 {
            self.driver
                .copy_dtoh(idx, &mut host, view.data_ptr())
                .map_err(KernelError::Driver)?;
        }
        Ok(host)
    }

    fn contiguous_extent(&self, view: &DeviceView) -> Result<(usize, usize)> {
        let idx = cuda_index(view.device())?;
        if !view.is_contiguous() {
            return Err(KernelError::NonContiguous {
                shape: view.shape().to_string(),
                strides: view.strides().to_vec(),
            });
        }
        let nbytes = view
            .shape()
            .try_numel()
            .and_then(|n| view.dtype().storage_bytes(n))
            .ok_or(klib_core::KlibError::LayoutOverflow)?;
        Ok((idx, nbytes))
    }
}

static GLOBAL: OnceLock<std::result::Result<Arc<Runtime>, String>> = OnceLock::new();

/// The process-wide runtime over the CUDA driver, configured from the
/// environment on first use.
///
/// Initialization runs once; a failure is remembered and returned to every
/// later caller as [`KernelError::DriverUnavailable`].
pub fn global() -> Result<Arc<Runtime>> {
    GLOBAL
        .get_or_init(|| {
            init_global().map(Arc::new).map_err(|e| {
                tracing::warn!("global runtime unavailable: {}", e);
                e.to_string()
            })
        })
        .clone()
        .map_err(KernelError::DriverUnavailable)
}

fn init_global() -> Result<Runtime> {
    let config = RuntimeConfig::from_env()?;
    let driver = CudaDriver::new(config.driver_library.as_deref())?;
    Runtime::new(Arc::new(driver), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{mock_image, status, MockDriver, StreamHandle};
    use klib_core::{DType, Shape};

    fn runtime(config: RuntimeConfig) -> (Arc<MockDriver>, Runtime) {
        let mock = Arc::new(MockDriver::new());
        mock.define_add_one("AddOneKernel");
        let rt = Runtime::new(mock.clone(), config).unwrap();
        rt.register_image(BinaryImage::leak("add", mock_image(&["AddOneKernel"])))
            .unwrap();
        rt.register_inplace_kernel("add", "add", "AddOneKernel");
        (mock, rt)
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn f32_values(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_add_runs_after_synchronize() {
        let (mock, rt) = runtime(RuntimeConfig::default());
        let x = rt.env().alloc(&Shape::new(&[300]), DType::F32, Device::Cuda(0)).unwrap();
        rt.write_bytes(&x, &f32_bytes(&[0.0; 300])).unwrap();

        assert!(rt.call("add", &[x.clone()]).unwrap().is_none());
        assert_eq!(mock.executed(), 0);
        assert_eq!(mock.pending(0, StreamHandle::DEFAULT), 1);

        rt.synchronize(Device::Cuda(0)).unwrap();
        assert_eq!(mock.executed(), 1);
        assert!(f32_values(&rt.read_bytes(&x).unwrap()).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_sync_after_launch() {
        let config = RuntimeConfig { sync_after_launch: true, ..Default::default() };
        let (mock, rt) = runtime(config);
        let x = rt.env().alloc(&Shape::new(&[4]), DType::F32, Device::Cuda(0)).unwrap();
        rt.call("add", &[x]).unwrap();
        assert_eq!(mock.executed(), 1);
        assert_eq!(mock.pending(0, StreamHandle::DEFAULT), 0);
    }

    #[test]
    fn test_sync_after_launch_reports_device_fault() {
        let config = RuntimeConfig { sync_after_launch: true, ..Default::default() };
        let (mock, rt) = runtime(config);
        // exported by the image, but the device has no body for it
        rt.register_image(BinaryImage::leak("broken", mock_image(&["NoBody"])))
            .unwrap();
        rt.register_inplace_kernel("broken", "broken", "NoBody");
        let x = rt.env().alloc(&Shape::new(&[4]), DType::F32, Device::Cuda(0)).unwrap();

        let err = rt.call("broken", &[x]).unwrap_err();
        match err {
            KernelError::Launch { kernel, status: st } => {
                assert_eq!(kernel, "NoBody");
                assert_eq!(st.code, status::LAUNCH_FAILED);
                assert_eq!(st.call, "cuStreamSynchronize");
            }
            other => panic!("expected launch error, got {other:?}"),
        }
        assert_eq!(mock.launches(), 1);
        assert_eq!(mock.executed(), 0);
    }

    #[test]
    fn test_launch_uses_bound_stream() {
        let (mock, rt) = runtime(RuntimeConfig::default());
        rt.env().set_stream(Device::Cuda(0), StreamHandle(3)).unwrap();
        let x = rt.env().alloc(&Shape::new(&[4]), DType::F32, Device::Cuda(0)).unwrap();
        rt.call("add", &[x]).unwrap();
        assert_eq!(mock.pending(0, StreamHandle(3)), 1);
        assert_eq!(mock.pending(0, StreamHandle::DEFAULT), 0);
    }

    #[test]
    fn test_configured_block_size() {
        let config = RuntimeConfig { block_size: 128, ..Default::default() };
        let (mock, rt) = runtime(config);
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let record = Arc::clone(&seen);
        mock.define_kernel("AddOneKernel", move |launch, _| {
            *record.lock() = Some((launch.grid.0, launch.block.0));
        });
        let x = rt.env().alloc(&Shape::new(&[1000]), DType::F32, Device::Cuda(0)).unwrap();
        rt.call("add", &[x]).unwrap();
        rt.synchronize(Device::Cuda(0)).unwrap();
        assert_eq!(*seen.lock(), Some((8, 128)));
    }

    #[test]
    fn test_empty_view_launches_nothing() {
        let (mock, rt) = runtime(RuntimeConfig::default());
        let x = rt.env().alloc(&Shape::new(&[0]), DType::F32, Device::Cuda(0)).unwrap();
        rt.call("add", &[x]).unwrap();
        assert_eq!(mock.launches(), 0);
    }

    #[test]
    fn test_add_rejects_bad_views() {
        let (mock, rt) = runtime(RuntimeConfig::default());
        let strided = rt
            .call("empty_like", &[DeviceView::from_raw(
                0,
                Shape::new(&[4, 2]),
                [1, 4].into_iter().collect(),
                DType::F32,
                Device::Cuda(0),
            )
            .unwrap()])
            .unwrap()
            .unwrap();
        assert!(matches!(rt.call("add", &[strided]), Err(KernelError::BadArguments { .. })));

        let host = DeviceView::from_raw(0, Shape::new(&[4]), [1].into_iter().collect(), DType::F32, Device::Cpu)
            .unwrap();
        assert!(matches!(rt.call("add", &[host]), Err(KernelError::UnsupportedDevice(Device::Cpu))));
        assert!(matches!(rt.call("add", &[]), Err(KernelError::BadArguments { .. })));
        assert_eq!(mock.launches(), 0);
    }

    #[test]
    fn test_overflowing_shape_is_rejected() {
        let (mock, rt) = runtime(RuntimeConfig::default());
        let huge = DeviceView::from_raw(
            0x1000,
            Shape::new(&[1 << 63, 2]),
            [0, 0].into_iter().collect(),
            DType::F32,
            Device::Cuda(0),
        )
        .unwrap();
        let err = rt.call("empty_bf16_like", &[huge]).unwrap_err();
        assert!(matches!(err, KernelError::Layout(klib_core::KlibError::LayoutOverflow)));
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_launch_failure_propagates() {
        let (mock, rt) = runtime(RuntimeConfig::default());
        let x = rt.env().alloc(&Shape::new(&[4]), DType::F32, Device::Cuda(0)).unwrap();
        mock.fail_next_launch(status::LAUNCH_FAILED);
        let err = rt.call("add", &[x]).unwrap_err();
        assert!(matches!(
            err,
            KernelError::Launch { status: st, .. } if st.code == status::LAUNCH_FAILED
        ));
        rt.synchronize(Device::Cuda(0)).unwrap();
        assert_eq!(mock.executed(), 0);
    }

    #[test]
    fn test_unknown_image_and_op() {
        let (_mock, rt) = runtime(RuntimeConfig::default());
        rt.register_inplace_kernel("sub", "sub", "SubOneKernel");
        let x = rt.env().alloc(&Shape::new(&[4]), DType::F32, Device::Cuda(0)).unwrap();
        assert!(matches!(rt.call("sub", &[x.clone()]), Err(KernelError::UnknownImage(_))));
        assert!(matches!(rt.call("mul", &[x]), Err(KernelError::UnknownOp(_))));
    }

    #[test]
    fn test_empty_bf16_like() {
        let (_mock, rt) = runtime(RuntimeConfig::default());
        let src = rt.env().alloc(&Shape::new(&[2, 3]), DType::F32, Device::Cuda(0)).unwrap();
        let out = rt.call("empty_bf16_like", &[src]).unwrap().unwrap();
        assert_eq!(out.dtype(), DType::BF16);
        assert_eq!(out.shape().dims(), &[2, 3]);
        assert!(out.is_contiguous());
    }

    #[test]
    fn test_config_images_loaded_at_startup() {
        let path = std::env::temp_dir().join(format!("klib-rt-{}.bin", std::process::id()));
        std::fs::write(&path, mock_image(&["AddOneKernel"])).unwrap();
        let config = RuntimeConfig {
            images: vec![crate::config::ImageSource { name: "disk".into(), path: path.clone() }],
            ..Default::default()
        };
        let rt = Runtime::new(Arc::new(MockDriver::new()), config).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(rt.images().names(), vec!["disk"]);
        assert!(rt.resolve("disk", "AddOneKernel", Device::Cuda(0)).is_ok());
    }

    #[test]
    fn test_missing_config_image() {
        let config = RuntimeConfig {
            images: vec![crate::config::ImageSource {
                name: "gone".into(),
                path: "/nonexistent/klib/gone.cubin".into(),
            }],
            ..Default::default()
        };
        let err = Runtime::new(Arc::new(MockDriver::new()), config).err();
        assert!(matches!(err, Some(KernelError::ImageRead { .. })));
    }
}
