//! GPU integration tests for the CUDA driver.
//! Run with: KLIB_TEST_CUBIN=/path/add_one.cubin cargo test -p klib-kernels --test cuda_tests -- --nocapture
//!
//! The image must export `AddOneKernel(float*)`, adding 1.0 to each element.
//! Tests print a message and return when no driver, device or image is found.

use std::path::PathBuf;
use std::sync::Arc;

use klib_core::{DType, Device, Shape};
use klib_kernels::{BinaryImage, CudaDriver, Driver, Environment, KernelError, Runtime, RuntimeConfig};

fn cuda_runtime() -> Option<Runtime> {
    let driver = match CudaDriver::new(None) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("skipping: {e}");
            return None;
        }
    };
    match driver.device_count() {
        Ok(n) if n > 0 => {}
        _ => {
            eprintln!("skipping: no CUDA device");
            return None;
        }
    }
    Runtime::new(Arc::new(driver), RuntimeConfig::default()).ok()
}

fn test_image() -> Option<BinaryImage> {
    let path = PathBuf::from(std::env::var_os("KLIB_TEST_CUBIN")?);
    BinaryImage::from_file("add", &path).ok()
}

#[test]
fn test_cuda_alloc_round_trip() {
    let Some(rt) = cuda_runtime() else { return };
    let view = klib_kernels::empty_strided(rt.env(), &Shape::new(&[10, 1]), &[100, 1], DType::F32, Device::Cuda(0))
        .unwrap();
    assert_eq!(view.strides(), &[100, 1]);
    assert_eq!(view.nbytes_spanned().unwrap(), 901 * 4);

    let flat = rt.env().alloc(&Shape::new(&[4]), DType::F32, Device::Cuda(0)).unwrap();
    let bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
    rt.write_bytes(&flat, &bytes).unwrap();
    assert_eq!(rt.read_bytes(&flat).unwrap(), bytes);
}

#[test]
fn test_cuda_add_one() {
    let Some(rt) = cuda_runtime() else { return };
    let Some(image) = test_image() else {
        eprintln!("skipping: KLIB_TEST_CUBIN not set");
        return;
    };
    rt.register_image(image).unwrap();
    rt.register_inplace_kernel("add", "add", "AddOneKernel");

    let n = 1000;
    let x = rt.env().alloc(&Shape::new(&[n]), DType::F32, Device::Cuda(0)).unwrap();
    rt.write_bytes(&x, &vec![0u8; n * 4]).unwrap();
    rt.call("add", &[x.clone()]).unwrap();
    rt.synchronize(Device::Cuda(0)).unwrap();

    let out: Vec<f32> = rt
        .read_bytes(&x)
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert!(out.iter().all(|&v| v == 1.0));
}

#[test]
fn test_cuda_rejects_garbage_image() {
    let Some(rt) = cuda_runtime() else { return };
    rt.register_image(BinaryImage::leak("junk", b"definitely not a cubin".to_vec()))
        .unwrap();
    let err = rt.resolve("junk", "AddOneKernel", Device::Cuda(0)).unwrap_err();
    assert!(matches!(err, KernelError::ModuleLoad { .. }));
}

#[test]
fn test_cuda_concurrent_alloc_and_copy() {
    let Some(rt) = cuda_runtime() else { return };
    std::thread::scope(|s| {
        for t in 0..8u8 {
            let rt = &rt;
            s.spawn(move || {
                for round in 0..16u8 {
                    let view = rt.env().alloc(&Shape::new(&[256]), DType::U8, Device::Cuda(0)).unwrap();
                    let bytes = vec![t.wrapping_mul(31).wrapping_add(round); 256];
                    rt.write_bytes(&view, &bytes).unwrap();
                    assert_eq!(rt.read_bytes(&view).unwrap(), bytes);
                }
            });
        }
    });
}
