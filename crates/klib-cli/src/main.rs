use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use klib_core::{layout, Allocation, DType, Device, DeviceView, Shape};
use klib_kernels::driver::mock_image;
use klib_kernels::{
    empty_strided, runtime, BinaryImage, Driver, Environment, KernelError, MockDriver, Result,
    Runtime, RuntimeConfig,
};

#[derive(Parser)]
#[command(
    name = "klib",
    about = "klib kernel dispatch CLI",
    long_about = "Load device-code images, launch kernels and inspect strided layouts.\n\nUse --mock to run against the in-process driver when no GPU is present.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show driver, device and op information
    Info {
        /// Use the in-process mock driver
        #[arg(long)]
        mock: bool,
    },
    /// Show the span and backing size of a strided layout
    Layout {
        /// Extents (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        shape: Vec<usize>,
        /// Element strides (comma-separated, may be negative)
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        strides: Vec<isize>,
        #[arg(long, default_value = "f32")]
        dtype: DType,
    },
    /// Launch an in-place kernel over a buffer of zeros and report the result
    Run {
        /// Op name to register the kernel under
        op: String,
        /// Device-code image (cubin/fatbin). Optional with --mock
        #[arg(long)]
        image: Option<PathBuf>,
        /// Entry point inside the image
        #[arg(long, default_value = "AddOneKernel")]
        entry: String,
        /// Number of f32 elements
        #[arg(long, default_value = "1024")]
        len: usize,
        #[arg(long, default_value = "cuda:0")]
        device: Device,
        /// Use the in-process mock driver
        #[arg(long)]
        mock: bool,
    },
    /// Allocate a strided view and print it
    Alloc {
        #[arg(long, value_delimiter = ',', required = true)]
        shape: Vec<usize>,
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        strides: Vec<isize>,
        #[arg(long, default_value = "f32")]
        dtype: DType,
        #[arg(long, default_value = "cuda:0")]
        device: Device,
        /// Use the in-process mock driver
        #[arg(long)]
        mock: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Info { mock } => cmd_info(mock),
        Commands::Layout { shape, strides, dtype } => cmd_layout(&shape, &strides, dtype),
        Commands::Run { op, image, entry, len, device, mock } => {
            cmd_run(&op, image, &entry, len, device, mock)
        }
        Commands::Alloc { shape, strides, dtype, device, mock } => {
            cmd_alloc(&shape, &strides, dtype, device, mock)
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// The global CUDA runtime, or a fresh one over a mock driver.
fn open_runtime(mock: bool) -> Result<(Arc<Runtime>, Option<Arc<MockDriver>>)> {
    tracing::debug!("opening {} runtime", if mock { "mock" } else { "cuda" });
    if mock {
        let driver = Arc::new(MockDriver::new());
        let rt = Runtime::new(driver.clone(), RuntimeConfig::from_env()?)?;
        Ok((Arc::new(rt), Some(driver)))
    } else {
        Ok((runtime::global()?, None))
    }
}

fn cmd_info(mock: bool) -> Result<()> {
    println!("klib v{}\n", env!("CARGO_PKG_VERSION"));
    let rt = match open_runtime(mock) {
        Ok((rt, _)) => rt,
        Err(e) => {
            println!("Driver");
            println!("  unavailable: {e}");
            return Ok(());
        }
    };
    let driver = rt.driver();
    println!("Driver");
    println!("  backend: {}", driver.name());
    println!("  devices: {}", driver.device_count().map_err(KernelError::Driver)?);

    let cfg = rt.config();
    println!("\nConfig");
    println!("  block_size:        {}", cfg.block_size);
    println!("  sync_after_launch: {}", cfg.sync_after_launch);
    if let Some(lib) = &cfg.driver_library {
        println!("  driver_library:    {}", lib.display());
    }

    println!("\nImages ({})", rt.images().names().len());
    for name in rt.images().names() {
        println!("  {name}");
    }
    println!("\nOps ({})", rt.ops().names().len());
    for name in rt.ops().names() {
        println!("  {name}");
    }
    Ok(())
}

fn cmd_layout(shape: &[usize], strides: &[isize], dtype: DType) -> Result<()> {
    let span = layout::span(shape, strides)?;
    let bytes = dtype
        .storage_bytes(span.cosize)
        .ok_or(klib_core::KlibError::LayoutOverflow)?;
    println!("shape:       {}", Shape::new(shape));
    println!("strides:     {strides:?}");
    println!("offsets:     {}..={}", span.min_offset, span.max_offset);
    println!("base offset: {}", span.base_offset());
    println!("cosize:      {}", span.cosize);
    println!("bytes:       {bytes} ({dtype})");
    println!("contiguous:  {}", layout::is_contiguous(shape, strides));
    Ok(())
}

fn cmd_run(
    op: &str,
    image: Option<PathBuf>,
    entry: &str,
    len: usize,
    device: Device,
    mock: bool,
) -> Result<()> {
    let (rt, mock_driver) = open_runtime(mock)?;
    let image = match (image, &mock_driver) {
        (Some(path), _) => BinaryImage::from_file(op, &path)?,
        (None, Some(driver)) => {
            driver.define_add_one(entry);
            BinaryImage::leak(op, mock_image(&[entry]))
        }
        (None, None) => {
            return Err(KernelError::BadArguments {
                op: op.to_string(),
                msg: "--image is required without --mock".into(),
            })
        }
    };
    rt.register_image(image)?;
    rt.register_inplace_kernel(op, op, entry);

    let x = rt.env().alloc(&Shape::new(&[len]), DType::F32, device)?;
    rt.write_bytes(&x, &vec![0u8; len * 4])?;

    let start = Instant::now();
    rt.call(op, &[x.clone()])?;
    rt.synchronize(device)?;
    let elapsed = start.elapsed();

    let out = read_f32(&rt, &x)?;
    let ones = out.iter().filter(|&&v| v == 1.0).count();
    println!("{op}: {entry} over {len} elements on {device} ({})", rt.driver().name());
    println!("  first/last: {:?} / {:?}", out.first(), out.last());
    println!("  elements == 1.0: {ones}/{len}");
    println!("  time (incl. first load): {:.3}ms", elapsed.as_secs_f64() * 1e3);
    Ok(())
}

fn cmd_alloc(
    shape: &[usize],
    strides: &[isize],
    dtype: DType,
    device: Device,
    mock: bool,
) -> Result<()> {
    let (rt, _) = open_runtime(mock)?;
    let view = empty_strided(rt.env(), &Shape::new(shape), strides, dtype, device)?;
    print_view(&view)
}

fn print_view(view: &DeviceView) -> Result<()> {
    println!("view on {}", view.device());
    println!("  data:    {:#x}", view.data_ptr());
    println!("  shape:   {}", view.shape());
    println!("  strides: {:?}", view.strides());
    println!("  dtype:   {}", view.dtype());
    println!("  spanned: {} bytes", view.nbytes_spanned()?);
    if let Some(owner) = view.owner() {
        println!("  backing: {} bytes at {:#x}", owner.nbytes(), owner.device_ptr());
    }
    Ok(())
}

fn read_f32(rt: &Runtime, view: &DeviceView) -> Result<Vec<f32>> {
    Ok(rt
        .read_bytes(view)?
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
