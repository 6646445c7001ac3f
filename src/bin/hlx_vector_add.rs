//! hlx-vector-add: run the element-wise add kernel and check the result
//!
//! Usage:
//!   hlx-vector-add --kernel shaders/add.spv
//!   hlx-vector-add --kernel shaders/add.spv --config dispatch.json --validation
//!
//! Computes result[i] = a[i] + b[i] for
//!   a = [1, 2, 3, 4, 5, 6, 7, 8]
//!   b = [3, 1, 4, 1, 5, 9, 2, 6]
//! and exits non-zero unless result = [4, 3, 7, 5, 10, 15, 9, 14].

use std::path::PathBuf;

use clap::Parser;
use hlx_dispatch::{BufferSpec, ComputeConfig, KernelBinary, KernelSession, WORKGROUP_SIZE};

/// Element-wise vector add on the first Vulkan device
#[derive(Parser)]
#[command(name = "hlx-vector-add")]
#[command(version)]
#[command(about = "Dispatch a SPIR-V add kernel over two float vectors")]
struct Cli {
    /// Compiled kernel (glslc shaders/add.comp -o shaders/add.spv)
    #[arg(long, default_value = "shaders/add.spv")]
    kernel: PathBuf,

    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Kernel entry point
    #[arg(long)]
    entry_point: Option<String>,

    /// Host wait limit for the dispatch, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enable VK_LAYER_KHRONOS_validation if installed
    #[arg(long)]
    validation: bool,
}

// =============================================================================
// TEST DATA
// =============================================================================

const SLOT_A: u32 = 0;
const SLOT_B: u32 = 1;
const SLOT_RESULT: u32 = 2;

const INPUT_A: [f32; 8] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
const INPUT_B: [f32; 8] = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
const EXPECTED: [f32; 8] = [4.0, 3.0, 7.0, 5.0, 10.0, 15.0, 9.0, 14.0];

fn load_config(cli: &Cli) -> hlx_dispatch::Result<ComputeConfig> {
    let mut config = match &cli.config {
        Some(path) => ComputeConfig::from_json_file(path)?,
        None => ComputeConfig::default(),
    };
    if let Some(entry_point) = &cli.entry_point {
        config.entry_point = entry_point.clone();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.dispatch_timeout_ms = timeout_ms;
    }
    if cli.validation {
        config.enable_validation = true;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// MAIN
// =============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    println!("=== Vector Add Dispatch ===\n");

    println!("Loading kernel {}...", cli.kernel.display());
    let binary = KernelBinary::load(&cli.kernel)?;

    let n = INPUT_A.len();
    let specs = [
        BufferSpec::elements::<f32>(SLOT_A, n)?,
        BufferSpec::elements::<f32>(SLOT_B, n)?,
        BufferSpec::elements::<f32>(SLOT_RESULT, n)?,
    ];

    println!("Initializing Vulkan...");
    let mut session = KernelSession::new(&config, &binary, &specs)?;
    println!("  Device: {}", session.context().device_name());

    println!("A = {:?}", INPUT_A);
    println!("B = {:?}", INPUT_B);
    session.upload(SLOT_A, &INPUT_A)?;
    session.upload(SLOT_B, &INPUT_B)?;
    session.upload(SLOT_RESULT, &[0.0f32; 8])?;

    let grid = session.run(n as u32)?;
    println!("Dispatched {} workgroup(s) of {}", grid.x, WORKGROUP_SIZE);

    let result: Vec<f32> = session.read(SLOT_RESULT)?;
    println!("Result = {:?}", result);

    let ledger = session.teardown();
    ledger.verify_monotonic()?;
    println!("Teardown: {} handles released in order", ledger.events().len());

    if result != EXPECTED {
        println!("\n❌ FAIL: expected {:?}", EXPECTED);
        std::process::exit(1);
    }

    println!("\n✅ PASS");
    Ok(())
}
