//! Benchmark: hot-path costs of dispatch against the mock driver.

use std::sync::Arc;
use std::time::Instant;

use klib_core::{layout, DType, Device, Shape};
use klib_kernels::driver::mock_image;
use klib_kernels::{grid_1d, BinaryImage, Environment, MockDriver, Runtime, RuntimeConfig, DEFAULT_BLOCK_SIZE};

fn per_iter_ns(iters: usize, mut f: impl FnMut()) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    start.elapsed().as_secs_f64() * 1e9 / iters as f64
}

fn main() {
    let mock = Arc::new(MockDriver::new());
    mock.define_kernel("AddOneKernel", |_, _| {});
    let rt = match Runtime::new(mock.clone(), RuntimeConfig::default()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime setup failed: {e}");
            return;
        }
    };
    let registered = rt.register_image(BinaryImage::leak("add", mock_image(&["AddOneKernel"])));
    if let Err(e) = registered {
        eprintln!("image registration failed: {e}");
        return;
    }
    rt.register_inplace_kernel("add", "add", "AddOneKernel");
    let cuda0 = Device::Cuda(0);

    println!("=== klib Dispatch Benchmark ===\n");
    println!("{:<28} {:>12}", "Operation", "ns/iter");
    println!("{}", "-".repeat(41));

    let first = Instant::now();
    let _ = rt.resolve("add", "AddOneKernel", cuda0);
    println!("{:<28} {:>12.0}", "first resolve (load)", first.elapsed().as_secs_f64() * 1e9);

    let ns = per_iter_ns(200_000, || {
        let _ = rt.resolve("add", "AddOneKernel", cuda0);
    });
    println!("{:<28} {:>12.1}", "cached resolve", ns);

    let ns = per_iter_ns(1_000_000, || {
        let _ = grid_1d(1 << 20, DEFAULT_BLOCK_SIZE);
    });
    println!("{:<28} {:>12.1}", "grid_1d", ns);

    let shape = [8usize, 16, 32, 64];
    let strides = [-32768isize, 2048, 64, 1];
    let ns = per_iter_ns(1_000_000, || {
        let _ = layout::span(&shape, &strides);
    });
    println!("{:<28} {:>12.1}", "span (rank 4)", ns);

    let x = match rt.env().alloc(&Shape::new(&[1 << 16]), DType::F32, cuda0) {
        Ok(x) => x,
        Err(e) => {
            eprintln!("allocation failed: {e}");
            return;
        }
    };
    let args = [x];
    let ns = per_iter_ns(100_000, || {
        let _ = rt.call("add", &args);
    });
    println!("{:<28} {:>12.1}", "call add (enqueue)", ns);

    let start = Instant::now();
    let _ = rt.synchronize(cuda0);
    println!("{:<28} {:>12.0}", "drain 100k queued", start.elapsed().as_secs_f64() * 1e9);
    println!("\nlaunches={} executed={} loads={}", mock.launches(), mock.executed(), mock.loads());
}
