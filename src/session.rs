//! One kernel, its arguments and everything needed to run it
//!
//! [`KernelSession`] bundles the objects a single-kernel program otherwise
//! juggles by hand: device context, argument buffers, pipeline, descriptor
//! binding and command pool. Its fields are declared in release order, so
//! dropping a session tears down in the same dependency order as an
//! explicit [`KernelSession::teardown`].
//!
//! [`KernelSession::run`] never waits longer than the configured timeout.
//! A dispatch that has not finished by then is parked on the engine; later
//! host access to the buffers first waits for it (again bounded), and
//! teardown drains it before any buffer is released.
//!
//! # Example
//!
//! ```rust,no_run
//! use hlx_dispatch::{BufferSpec, ComputeConfig, KernelBinary, KernelSession};
//!
//! # fn main() -> hlx_dispatch::Result<()> {
//! let config = ComputeConfig::default();
//! let binary = KernelBinary::load("shaders/add.spv")?;
//! let specs = [
//!     BufferSpec::elements::<f32>(0, 4)?,
//!     BufferSpec::elements::<f32>(1, 4)?,
//!     BufferSpec::elements::<f32>(2, 4)?,
//! ];
//! let mut session = KernelSession::new(&config, &binary, &specs)?;
//! session.upload(0, &[1.0f32, 2.0, 3.0, 4.0])?;
//! session.upload(1, &[10.0f32, 20.0, 30.0, 40.0])?;
//! session.run(4)?;
//! let sum: Vec<f32> = session.read(2)?;
//! session.teardown().verify()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use crate::buffer::{byte_size_of, BufferResource, BufferSet};
use crate::compute::KernelPipeline;
use crate::config::ComputeConfig;
use crate::context::DeviceContext;
use crate::descriptor::DescriptorBinding;
use crate::dispatch::{DispatchEngine, GridSize, HostGate};
use crate::error::{ComputeError, Result};
use crate::layout::{BindingLayout, PipelineLayout};
use crate::shader::KernelBinary;
use crate::teardown::TeardownLedger;

/// Size and slot of one kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Descriptor binding slot
    pub slot: u32,

    /// Buffer size in bytes
    pub size: vk::DeviceSize,
}

impl BufferSpec {
    pub fn bytes(slot: u32, size: vk::DeviceSize) -> Self {
        Self { slot, size }
    }

    /// Room for `count` values of `T`.
    ///
    /// # Errors
    ///
    /// `InvalidBufferSize` if the byte size overflows.
    pub fn elements<T: Pod>(slot: u32, count: usize) -> Result<Self> {
        Ok(Self {
            slot,
            size: byte_size_of::<T>(count)?,
        })
    }
}

/// Owner of one kernel's full resource graph.
pub struct KernelSession {
    // Field order is release order.
    buffers: BufferSet,
    descriptor: DescriptorBinding,
    pipeline: KernelPipeline,
    engine: DispatchEngine,
    ctx: DeviceContext,

    config: ComputeConfig,
}

impl KernelSession {
    /// Open a device and build everything needed to dispatch `binary`.
    pub fn new(config: &ComputeConfig, binary: &KernelBinary, specs: &[BufferSpec]) -> Result<Self> {
        config.validate()?;
        let ctx = DeviceContext::new(config)?;
        Self::with_context(ctx, config, binary, specs)
    }

    /// Build on an existing device context.
    ///
    /// Buffers are allocated in slot order, the binding layout is derived
    /// from them, then the pipeline, descriptor binding and command pool are
    /// created against that layout.
    pub fn with_context(
        ctx: DeviceContext,
        config: &ComputeConfig,
        binary: &KernelBinary,
        specs: &[BufferSpec],
    ) -> Result<Self> {
        let mut buffers = BufferSet::new();
        for spec in specs {
            buffers.insert(BufferResource::allocate(&ctx, spec.size, spec.slot)?)?;
        }

        let bindings = BindingLayout::from_buffers(&buffers)?;
        let layout = PipelineLayout::new(&ctx, &bindings)?;
        let pipeline = KernelPipeline::new(&ctx, Arc::clone(&layout), binary, &config.entry_point)?;
        let descriptor = DescriptorBinding::new(&ctx, layout, &buffers)?;
        let engine = DispatchEngine::new(&ctx)?;

        log::info!(
            "KernelSession ready on {}: entry={}, slots={:?}",
            ctx.device_name(),
            config.entry_point,
            buffers.slots()
        );

        Ok(Self {
            buffers,
            descriptor,
            pipeline,
            engine,
            ctx,
            config: config.clone(),
        })
    }

    /// Copy a typed array into the argument at `slot`; sizes must match.
    ///
    /// # Errors
    ///
    /// `DispatchTimeout` if an earlier dispatch is still running after the
    /// configured timeout.
    pub fn upload<T: Pod>(&self, slot: u32, data: &[T]) -> Result<()> {
        self.engine.wait_idle(self.config.dispatch_timeout())?;
        self.buffers.get(slot)?.upload_slice(data)
    }

    /// Dispatch over `element_count` elements and wait for completion
    /// with the configured timeout.
    ///
    /// # Errors
    ///
    /// `DispatchTimeout` within the configured timeout if the dispatch (or
    /// an earlier parked one) has not finished; the device keeps running it.
    pub fn run(&mut self, element_count: u32) -> Result<GridSize> {
        self.dispatch(element_count, None)
    }

    /// Like [`run`](Self::run), but the dispatch waits for `gate` to open.
    pub fn run_with_gate(&mut self, element_count: u32, gate: &HostGate) -> Result<GridSize> {
        self.dispatch(element_count, Some(gate))
    }

    fn dispatch(&mut self, element_count: u32, gate: Option<&HostGate>) -> Result<GridSize> {
        let timeout = self.config.dispatch_timeout();
        self.engine.wait_idle(timeout)?;

        let mut job = self.engine.job(
            &self.pipeline,
            &mut self.descriptor,
            &mut self.buffers,
            element_count,
        )?;
        if let Some(gate) = gate {
            job = job.with_gate(gate)?;
        }
        job.record()?;
        job.submit()?;

        match job.wait(timeout) {
            Ok(()) => Ok(job.finish()?.grid()),
            Err(e @ ComputeError::DispatchTimeout(_)) => {
                // Buffers stay owned by this session until the engine drains.
                job.park();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Whole contents of the argument at `slot`.
    ///
    /// # Errors
    ///
    /// `DispatchTimeout` if an earlier dispatch is still running after the
    /// configured timeout.
    pub fn read<T: Pod>(&self, slot: u32) -> Result<Vec<T>> {
        self.engine.wait_idle(self.config.dispatch_timeout())?;
        self.buffers.get(slot)?.read_vec()
    }

    /// Release everything in dependency order and hand back the ledger
    /// that recorded it.
    ///
    /// Parked dispatches are drained first. Device and instance are only
    /// destroyed here if no other clone of the context is still alive.
    pub fn teardown(self) -> Arc<TeardownLedger> {
        let ledger = self.ctx.ledger();
        log::info!("Tearing down KernelSession ({} buffers)", self.buffers.len());
        drop(self);
        ledger
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn buffers(&self) -> &BufferSet {
        &self.buffers
    }

    pub fn pipeline(&self) -> &KernelPipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    /// Parked dispatches still owned by the engine.
    pub fn in_flight(&self) -> usize {
        self.engine.in_flight()
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        // Device work must end before the buffers it uses are released;
        // fields then drop in declaration order.
        self.engine.drain();
    }
}
