//! Compute pipeline construction
//!
//! [`KernelPipeline`] wraps the `VkPipeline` built from one kernel binary
//! and entry point against a [`PipelineLayout`]. It is built once per
//! distinct kernel and reused across dispatches whose buffer sets match
//! the layout.
//!
//! # Example
//!
//! ```rust,no_run
//! use hlx_dispatch::{BindingLayout, ComputeConfig, DeviceContext, KernelBinary, KernelPipeline, PipelineLayout};
//!
//! # fn main() -> hlx_dispatch::Result<()> {
//! let ctx = DeviceContext::new(&ComputeConfig::default())?;
//! let layout = PipelineLayout::new(&ctx, &BindingLayout::from_slots(&[0, 1, 2])?)?;
//! let binary = KernelBinary::load("shaders/add.spv")?;
//! let pipeline = KernelPipeline::new(&ctx, layout, &binary, "main")?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::layout::PipelineLayout;
use crate::shader::{KernelBinary, ShaderModule};
use crate::teardown::{next_owner_id, ReleaseStage};

/// Executable compute pipeline for one kernel entry point.
pub struct KernelPipeline {
    pipeline: vk::Pipeline,

    /// Destroyed right after the pipeline (field order)
    shader: ShaderModule,

    layout: Arc<PipelineLayout>,

    owner: u64,
    ctx: DeviceContext,
}

impl KernelPipeline {
    /// Build a compute pipeline from `binary` entered at `entry_point`.
    ///
    /// # Errors
    ///
    /// `PipelineCreationFailed` carrying `entry_point` if either the shader
    /// module or the pipeline is rejected.
    pub fn new(
        ctx: &DeviceContext,
        layout: Arc<PipelineLayout>,
        binary: &KernelBinary,
        entry_point: &str,
    ) -> Result<Self> {
        log::info!(
            "Creating KernelPipeline: entry={}, bindings={:?}, sha256={}",
            entry_point,
            layout.bindings().slots(),
            binary.digest_hex()
        );

        let owner = next_owner_id();
        let shader = ShaderModule::new(ctx, binary, entry_point, owner)?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.handle)
            .name(shader.entry_point_cstr());

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout.handle());

        let pipelines = unsafe {
            ctx.device()
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| ComputeError::PipelineCreationFailed {
            entry_point: entry_point.to_string(),
            reason: format!("vkCreateComputePipelines: {:?}", e),
        })?;

        let pipeline = pipelines.into_iter().next().ok_or_else(|| {
            ComputeError::PipelineCreationFailed {
                entry_point: entry_point.to_string(),
                reason: "driver returned no pipeline".to_string(),
            }
        })?;

        log::debug!("Created compute pipeline for '{}'", entry_point);

        Ok(Self {
            pipeline,
            shader,
            layout,
            owner,
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn entry_point(&self) -> &str {
        &self.shader.entry_point
    }
}

impl Drop for KernelPipeline {
    fn drop(&mut self) {
        log::debug!("Dropping KernelPipeline ({})", self.shader.entry_point);
        unsafe {
            self.ctx.device().destroy_pipeline(self.pipeline, None);
        }
        self.ctx.ledger().record(self.owner, ReleaseStage::Pipeline);
    }
}
