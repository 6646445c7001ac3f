//! Command recording, submission and the completion wait
//!
//! A [`DispatchJob`] walks a strict state machine:
//!
//! ```text
//! Idle --record--> Recording --end--> Recorded --submit--> Submitted --wait ok--> Completed
//!                                                              |
//!                                                              +--wait timeout--> Submitted
//! ```
//!
//! Submission never implies completion. The only way to reach `Completed`
//! is a host wait on the job's [`CompletionSignal`] returning success, and
//! the only way to read kernel output is through the [`CompletedDispatch`]
//! handed out afterwards. While a job exists it holds its `BufferSet`
//! mutably, so the host cannot touch kernel arguments while the device may
//! be using them.
//!
//! Dropping a job that is still `Submitted` blocks until the device is done
//! with it. Owners that also hold the buffers (see
//! [`KernelSession`](crate::session::KernelSession)) can instead park a
//! timed-out job on its engine and return at once; the engine reclaims it
//! when its fence fires and always drains before it is destroyed.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = DispatchEngine::new(&ctx)?;
//! let mut job = engine.job(&pipeline, &mut descriptor, &mut buffers, 8)?;
//! job.record()?;
//! job.submit_and_wait(Duration::from_secs(5))?;
//! let done = job.finish()?;
//! let sum: Vec<f32> = done.read(2)?;
//! ```

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use bytemuck::Pod;

use crate::buffer::BufferSet;
use crate::compute::KernelPipeline;
use crate::context::DeviceContext;
use crate::descriptor::DescriptorBinding;
use crate::error::{ComputeError, Result};
use crate::teardown::{next_owner_id, ReleaseStage};

/// Threads per workgroup along x; kernels are compiled with local_size_x = 256
pub const WORKGROUP_SIZE: u32 = 256;

// =============================================================================
// GRID
// =============================================================================

/// Workgroup counts for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    /// Workgroups along x; each covers [`WORKGROUP_SIZE`] elements
    pub x: u32,

    /// Always 1 for the 1-D kernels dispatched here
    pub y: u32,
    pub z: u32,
}

impl GridSize {
    /// 1-D grid covering `element_count` elements.
    ///
    /// # Arguments
    ///
    /// * `element_count` - Number of elements the kernel indexes
    ///
    /// # Returns
    ///
    /// `ceil(element_count / WORKGROUP_SIZE)` groups along x, one along y and z.
    pub fn for_elements(element_count: u32) -> Self {
        Self {
            x: element_count.div_ceil(WORKGROUP_SIZE),
            y: 1,
            z: 1,
        }
    }

    /// No workgroups at all; recording skips vkCmdDispatch.
    pub fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Recording,
    Recorded,
    Submitted,
    Completed,
}

impl DispatchState {
    /// The state that must hold before moving to `self`.
    fn predecessor(self) -> Option<DispatchState> {
        match self {
            DispatchState::Idle => None,
            DispatchState::Recording => Some(DispatchState::Idle),
            DispatchState::Recorded => Some(DispatchState::Recording),
            DispatchState::Submitted => Some(DispatchState::Recorded),
            DispatchState::Completed => Some(DispatchState::Submitted),
        }
    }

    /// Move to `next` if the edge exists.
    ///
    /// # Errors
    ///
    /// `InvalidDispatchState` naming the state `next` requires.
    pub fn advance(self, next: DispatchState) -> Result<DispatchState> {
        match next.predecessor() {
            Some(required) if required == self => Ok(next),
            Some(required) => Err(ComputeError::InvalidDispatchState {
                expected: required,
                actual: self,
            }),
            None => Err(ComputeError::InvalidDispatchState {
                expected: next,
                actual: self,
            }),
        }
    }

    /// Fail unless the job is currently in `expected`.
    pub fn require(self, expected: DispatchState) -> Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(ComputeError::InvalidDispatchState {
                expected,
                actual: self,
            })
        }
    }
}

// =============================================================================
// SYNCHRONIZATION PRIMITIVES
// =============================================================================

/// One-shot fence attached to a single submission.
pub struct CompletionSignal {
    fence: vk::Fence,
    ctx: DeviceContext,
}

impl CompletionSignal {
    /// Create an unsignaled fence.
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let fence = unsafe { ctx.device().create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| ComputeError::CommandRecordingFailed(format!("Failed to create fence: {:?}", e)))?;
        Ok(Self {
            fence,
            ctx: ctx.clone(),
        })
    }

    /// Block until the fence fires or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `DispatchTimeout` if the wait expired; the fence is untouched and may
    /// be waited on again.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.ctx.device().wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(ComputeError::DispatchTimeout(timeout)),
            Err(e) => Err(ComputeError::VulkanApi(e)),
        }
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> Result<bool> {
        Ok(unsafe { self.ctx.device().get_fence_status(self.fence) }?)
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_fence(self.fence, None);
        }
    }
}

struct GateInner {
    event: vk::Event,
    opened: AtomicBool,
    ctx: DeviceContext,
}

impl Drop for GateInner {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_event(self.event, None);
        }
    }
}

/// Host-signalled event a job can be told to wait on before its dispatch.
///
/// Holding the gate closed stalls the queue, which is how the timeout
/// path is exercised deterministically. Clones share one event; a job
/// keeps its own clone so the event outlives any command buffer waiting
/// on it.
#[derive(Clone)]
pub struct HostGate {
    inner: Arc<GateInner>,
}

impl HostGate {
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let event = unsafe { ctx.device().create_event(&vk::EventCreateInfo::default(), None) }
            .map_err(|e| ComputeError::CommandRecordingFailed(format!("Failed to create event: {:?}", e)))?;
        Ok(Self {
            inner: Arc::new(GateInner {
                event,
                opened: AtomicBool::new(false),
                ctx: ctx.clone(),
            }),
        })
    }

    /// Release every command buffer waiting on this gate.
    pub fn open(&self) -> Result<()> {
        unsafe { self.inner.ctx.device().set_event(self.inner.event) }?;
        self.inner.opened.store(true, Ordering::Release);
        log::debug!("Host gate opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> vk::Event {
        self.inner.event
    }

    /// Open if still closed; used before blocking on work behind the gate.
    fn release_for_wait(&self) {
        if self.is_open() {
            return;
        }
        log::warn!("Opening host gate ahead of a blocking wait");
        if let Err(e) = self.open() {
            log::error!("Failed to open host gate: {}", e);
        }
    }
}

/// A submission whose job was parked before its fence fired.
struct InFlight {
    command_buffer: vk::CommandBuffer,
    signal: CompletionSignal,

    /// Keeps the event alive while the command buffer may wait on it
    gate: Option<HostGate>,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Owns the command pool that dispatch jobs allocate from.
///
/// Not `Sync`: the pool is externally synchronized and this core drives it
/// from a single host thread.
pub struct DispatchEngine {
    command_pool: vk::CommandPool,

    /// Parked submissions, reclaimed once their fence fires
    in_flight: RefCell<Vec<InFlight>>,

    owner: u64,
    ctx: DeviceContext,
}

impl DispatchEngine {
    /// Create a command pool on the context's compute queue family.
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family_index())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { ctx.device().create_command_pool(&pool_info, None) }.map_err(|e| {
            ComputeError::CommandRecordingFailed(format!("Failed to create command pool: {:?}", e))
        })?;

        log::info!("Created DispatchEngine: queue_family={}", ctx.queue_family_index());

        Ok(Self {
            command_pool,
            in_flight: RefCell::new(Vec::new()),
            owner: next_owner_id(),
            ctx: ctx.clone(),
        })
    }

    /// Prepare a job that runs `pipeline` over `buffers`.
    ///
    /// The descriptor set is re-pointed at `buffers` if it currently refers
    /// to something else. Parked submissions that have finished are
    /// reclaimed first.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - Kernel to run
    /// * `descriptor` - Descriptor set built against the pipeline's layout
    /// * `buffers` - Kernel arguments, held for the life of the job
    /// * `element_count` - Elements to cover; the grid is `ceil(n / WORKGROUP_SIZE)`
    ///
    /// # Errors
    ///
    /// * `LayoutMismatch` - descriptor and pipeline were built from different
    ///   layouts, or `buffers` does not fit the layout
    /// * `CommandRecordingFailed` - command buffer allocation failed
    pub fn job<'a>(
        &'a self,
        pipeline: &'a KernelPipeline,
        descriptor: &'a mut DescriptorBinding,
        buffers: &'a mut BufferSet,
        element_count: u32,
    ) -> Result<DispatchJob<'a>> {
        self.reclaim()?;

        let pipeline_layout = pipeline.layout().bindings();
        let descriptor_layout = descriptor.layout().bindings();
        if pipeline_layout != descriptor_layout {
            return Err(ComputeError::LayoutMismatch {
                layout: pipeline_layout.slots(),
                buffers: descriptor_layout.slots(),
            });
        }

        if !descriptor.is_bound_to(buffers) {
            descriptor.rebind(buffers)?;
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe { self.ctx.device().allocate_command_buffers(&alloc_info) }
            .map_err(|e| {
                ComputeError::CommandRecordingFailed(format!("Failed to allocate command buffer: {:?}", e))
            })?
            .into_iter()
            .next()
            .ok_or_else(|| ComputeError::CommandRecordingFailed("no command buffer returned".to_string()))?;

        let grid = GridSize::for_elements(element_count);
        log::debug!(
            "New dispatch job: {} elements, grid=({}, {}, {})",
            element_count,
            grid.x,
            grid.y,
            grid.z
        );

        Ok(DispatchJob {
            engine: self,
            pipeline,
            descriptor,
            buffers: Some(buffers),
            gate: None,
            command_buffer,
            signal: None,
            grid,
            state: DispatchState::Idle,
        })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Number of parked submissions not yet reclaimed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.borrow().len()
    }

    /// Free every parked submission whose fence has fired.
    ///
    /// # Returns
    ///
    /// How many are still running.
    pub fn reclaim(&self) -> Result<usize> {
        let mut in_flight = self.in_flight.borrow_mut();
        let mut still_running = Vec::with_capacity(in_flight.len());
        let mut result = Ok(());
        for entry in in_flight.drain(..) {
            match entry.signal.is_signaled() {
                Ok(true) => self.free(entry),
                Ok(false) => still_running.push(entry),
                Err(e) => {
                    still_running.push(entry);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        *in_flight = still_running;
        result.map(|()| in_flight.len())
    }

    /// Wait up to `timeout` for each parked submission, then reclaim.
    ///
    /// # Errors
    ///
    /// `DispatchTimeout` if any submission is still running.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        {
            let in_flight = self.in_flight.borrow();
            for entry in in_flight.iter() {
                entry.signal.wait(timeout)?;
            }
        }
        match self.reclaim()? {
            0 => Ok(()),
            _ => Err(ComputeError::DispatchTimeout(timeout)),
        }
    }

    /// Block until every parked submission has finished and free them all.
    ///
    /// Closed gates are opened first so this cannot wait forever on the host.
    pub fn drain(&self) {
        let parked: Vec<InFlight> = self.in_flight.borrow_mut().drain(..).collect();
        if parked.is_empty() {
            return;
        }
        log::warn!("Draining {} parked dispatch(es)", parked.len());
        for entry in parked {
            if let Some(gate) = &entry.gate {
                gate.release_for_wait();
            }
            if let Err(e) = entry.signal.wait(Duration::MAX) {
                log::error!("Wait on parked dispatch failed: {}", e);
            }
            self.free(entry);
        }
    }

    fn park(&self, entry: InFlight) {
        log::warn!("Parking in-flight dispatch on its engine");
        self.in_flight.borrow_mut().push(entry);
    }

    fn free(&self, entry: InFlight) {
        unsafe {
            self.ctx
                .device()
                .free_command_buffers(self.command_pool, &[entry.command_buffer]);
        }
        // fence and gate clone go with `entry`
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        log::debug!("Dropping DispatchEngine");
        self.drain();
        unsafe {
            self.ctx.device().destroy_command_pool(self.command_pool, None);
        }
        self.ctx.ledger().record(self.owner, ReleaseStage::CommandPool);
    }
}

// =============================================================================
// JOB
// =============================================================================

/// One recorded-and-submitted kernel dispatch.
pub struct DispatchJob<'a> {
    engine: &'a DispatchEngine,
    pipeline: &'a KernelPipeline,
    descriptor: &'a DescriptorBinding,

    /// Taken by `finish`
    buffers: Option<&'a mut BufferSet>,

    gate: Option<HostGate>,

    /// Null once parked on the engine
    command_buffer: vk::CommandBuffer,
    signal: Option<CompletionSignal>,
    grid: GridSize,
    state: DispatchState,
}

impl<'a> DispatchJob<'a> {
    /// Make the dispatch wait for `gate` to be opened from the host.
    pub fn with_gate(mut self, gate: &HostGate) -> Result<Self> {
        self.state.require(DispatchState::Idle)?;
        self.gate = Some(gate.clone());
        Ok(self)
    }

    /// Record bind-pipeline, bind-descriptors, dispatch and a shader-write to
    /// host-read barrier.
    ///
    /// A zero-sized grid records the binds but no dispatch.
    pub fn record(&mut self) -> Result<()> {
        let recording = self.state.advance(DispatchState::Recording)?;
        let device = self.engine.ctx.device();
        let cmd = self.command_buffer;

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { device.begin_command_buffer(cmd, &begin_info) }.map_err(|e| {
            ComputeError::CommandRecordingFailed(format!("Failed to begin command buffer: {:?}", e))
        })?;
        self.state = recording;

        unsafe {
            if let Some(gate) = &self.gate {
                device.cmd_wait_events(
                    cmd,
                    &[gate.handle()],
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    &[],
                    &[],
                    &[],
                );
            }

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline.handle());

            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline.layout().handle(),
                0,
                &[self.descriptor.handle()],
                &[],
            );

            if self.grid.is_empty() {
                log::debug!("Empty grid, skipping vkCmdDispatch");
            } else {
                device.cmd_dispatch(cmd, self.grid.x, self.grid.y, self.grid.z);
            }

            // Shader writes must be made available to the host domain before
            // the fence signals.
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );

            device.end_command_buffer(cmd).map_err(|e| {
                ComputeError::CommandRecordingFailed(format!("Failed to end command buffer: {:?}", e))
            })?;
        }

        self.state = self.state.advance(DispatchState::Recorded)?;
        log::debug!(
            "Recorded dispatch: workgroups=({}, {}, {})",
            self.grid.x,
            self.grid.y,
            self.grid.z
        );
        Ok(())
    }

    /// Submit to the context's compute queue with a fresh completion signal.
    ///
    /// # Errors
    ///
    /// `DispatchSubmitFailed` if the queue rejects the submission; the job
    /// stays `Recorded`.
    pub fn submit(&mut self) -> Result<()> {
        let submitted = self.state.advance(DispatchState::Submitted)?;
        let ctx = &self.engine.ctx;
        let signal = CompletionSignal::new(ctx)?;

        let submit_info =
            vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&self.command_buffer));

        unsafe {
            ctx.device()
                .queue_submit(ctx.compute_queue(), &[submit_info], signal.handle())
        }
        .map_err(ComputeError::DispatchSubmitFailed)?;

        self.signal = Some(signal);
        self.state = submitted;
        log::debug!("Dispatch submitted");
        Ok(())
    }

    /// Block until the completion signal fires or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `DispatchTimeout` leaves the job `Submitted`; device work is not
    /// cancelled and `wait` may be called again.
    pub fn wait(&mut self, timeout: Duration) -> Result<()> {
        let completed = self.state.advance(DispatchState::Completed)?;
        let signal = self.signal.as_ref().ok_or(ComputeError::InvalidDispatchState {
            expected: DispatchState::Submitted,
            actual: self.state,
        })?;

        signal.wait(timeout)?;

        self.state = completed;
        log::debug!("Dispatch completed");
        Ok(())
    }

    /// `submit` followed by `wait`.
    pub fn submit_and_wait(&mut self, timeout: Duration) -> Result<()> {
        self.submit()?;
        self.wait(timeout)
    }

    /// Hand back the buffers for readback.
    ///
    /// # Errors
    ///
    /// `InvalidDispatchState` unless the job is `Completed`.
    pub fn finish(mut self) -> Result<CompletedDispatch<'a>> {
        self.state.require(DispatchState::Completed)?;
        let buffers = self.buffers.take().ok_or(ComputeError::InvalidDispatchState {
            expected: DispatchState::Completed,
            actual: self.state,
        })?;
        Ok(CompletedDispatch {
            buffers,
            grid: self.grid,
        })
    }

    /// Hand a still-running submission to the engine and return at once.
    ///
    /// The caller must keep the job's buffers alive and untouched until the
    /// engine has reclaimed or drained it; only owners that also hold the
    /// buffers may do this. Jobs in any other state are simply dropped.
    pub(crate) fn park(mut self) {
        if self.state != DispatchState::Submitted {
            return;
        }
        if let Some(signal) = self.signal.take() {
            self.engine.park(InFlight {
                command_buffer: self.command_buffer,
                signal,
                gate: self.gate.take(),
            });
            self.command_buffer = vk::CommandBuffer::null();
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn grid(&self) -> GridSize {
        self.grid
    }
}

impl Drop for DispatchJob<'_> {
    fn drop(&mut self) {
        if self.command_buffer == vk::CommandBuffer::null() {
            return;
        }
        if self.state == DispatchState::Submitted {
            // Device work cannot be cancelled; the command buffer and fence
            // must outlive it.
            if let Some(gate) = &self.gate {
                gate.release_for_wait();
            }
            if let Some(signal) = &self.signal {
                log::warn!("Dropping an in-flight dispatch; waiting for completion");
                if let Err(e) = signal.wait(Duration::MAX) {
                    log::error!("Wait on in-flight dispatch failed: {}", e);
                }
            }
        }

        unsafe {
            self.engine
                .ctx
                .device()
                .free_command_buffers(self.engine.command_pool, &[self.command_buffer]);
        }
    }
}

/// Kernel output access, only obtainable from a completed job.
pub struct CompletedDispatch<'a> {
    buffers: &'a mut BufferSet,
    grid: GridSize,
}

impl CompletedDispatch<'_> {
    /// Whole contents of the buffer at `slot` as `T`s.
    pub fn read<T: Pod>(&self, slot: u32) -> Result<Vec<T>> {
        self.buffers.get(slot)?.read_vec()
    }

    /// Raw byte readback from the buffer at `slot`.
    pub fn download(&self, slot: u32, out: &mut [u8], offset: vk::DeviceSize) -> Result<()> {
        self.buffers.get(slot)?.download(out, offset)
    }

    pub fn buffers(&self) -> &BufferSet {
        self.buffers
    }

    pub fn grid(&self) -> GridSize {
        self.grid
    }
}
