//! HLX Vulkan Compute Dispatch
//!
//! Runs one precompiled compute kernel over a set of storage buffers on
//! the first available Vulkan device, and reads the results back once the
//! device has signalled completion.
//!
//! # Architecture
//!
//! This crate provides a thin Rust layer over Vulkan (via ash) that:
//! 1. Initializes a Vulkan instance, device and compute queue
//! 2. Allocates one host-coherent storage buffer per kernel argument
//! 3. Derives a descriptor layout from the arguments' binding slots
//! 4. Builds a compute pipeline from a SPIR-V binary and entry point
//! 5. Records, submits and fence-waits a single 1-D dispatch
//! 6. Tears everything down in dependency order, recording each release
//!
//! # Example
//!
//! ```rust,no_run
//! use hlx_dispatch::{BufferSpec, ComputeConfig, KernelBinary, KernelSession};
//!
//! # fn main() -> hlx_dispatch::Result<()> {
//! let binary = KernelBinary::load("shaders/add.spv")?;
//! let specs = [
//!     BufferSpec::elements::<f32>(0, 8)?,
//!     BufferSpec::elements::<f32>(1, 8)?,
//!     BufferSpec::elements::<f32>(2, 8)?,
//! ];
//! let mut session = KernelSession::new(&ComputeConfig::default(), &binary, &specs)?;
//! session.upload(0, &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])?;
//! session.upload(1, &[3.0f32, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0])?;
//! session.run(8)?;
//! let sum: Vec<f32> = session.read(2)?;
//! assert_eq!(sum, [4.0, 3.0, 7.0, 5.0, 10.0, 15.0, 9.0, 14.0]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod compute;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod layout;
pub mod session;
pub mod shader;
pub mod teardown;
pub mod validation;

pub use buffer::{BufferResource, BufferSet};
pub use compute::KernelPipeline;
pub use config::ComputeConfig;
pub use context::DeviceContext;
pub use descriptor::DescriptorBinding;
pub use dispatch::{
    CompletedDispatch, CompletionSignal, DispatchEngine, DispatchJob, DispatchState, GridSize,
    HostGate, WORKGROUP_SIZE,
};
pub use error::{ComputeError, Result};
pub use layout::{BindingEntry, BindingLayout, BindingLayoutBuilder, PipelineLayout};
pub use session::{BufferSpec, KernelSession};
pub use shader::KernelBinary;
pub use teardown::{ReleaseEvent, ReleaseStage, TeardownLedger};
