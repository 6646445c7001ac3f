//! Descriptor pool and set for one dispatch
//!
//! A [`DescriptorBinding`] points one descriptor set at the buffers of a
//! [`BufferSet`]. It is created against the same [`PipelineLayout`] the
//! kernel pipeline was built with, and refuses buffer sets whose slots do
//! not match that layout exactly.

use std::sync::Arc;

use ash::vk;

use crate::buffer::BufferSet;
use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::layout::PipelineLayout;
use crate::teardown::{next_owner_id, ReleaseStage};

/// Descriptor pool, the one set allocated from it, and what it points at.
pub struct DescriptorBinding {
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    layout: Arc<PipelineLayout>,

    /// (slot, buffer id) pairs currently written into the set. Ids, not
    /// `vk::Buffer` values: drivers hand out recycled handle values.
    bound: Vec<(u32, u64)>,

    owner: u64,
    ctx: DeviceContext,
}

impl DescriptorBinding {
    /// Create a pool sized for one set of `layout`, allocate the set and
    /// write every buffer of `buffers` into it.
    ///
    /// # Errors
    ///
    /// * `LayoutMismatch` - buffer slots differ from the layout's slots
    /// * `DescriptorCreationFailed` - pool creation or set allocation failed
    pub fn new(ctx: &DeviceContext, layout: Arc<PipelineLayout>, buffers: &BufferSet) -> Result<Self> {
        layout.bindings().check_slots(&buffers.slots())?;

        let device = ctx.device();

        let storage_count = layout.bindings().storage_buffer_count().max(1);
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: storage_count,
        }];

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(1);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
            ComputeError::DescriptorCreationFailed(format!("Failed to create descriptor pool: {:?}", e))
        })?;

        let set_layouts = [layout.set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);

        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) if !sets.is_empty() => sets[0],
            Ok(_) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(ComputeError::DescriptorCreationFailed(
                    "driver returned no descriptor set".to_string(),
                ));
            }
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(ComputeError::DescriptorCreationFailed(format!(
                    "Failed to allocate descriptor set: {:?}",
                    e
                )));
            }
        };

        let mut binding = Self {
            pool,
            set,
            layout,
            bound: Vec::new(),
            owner: next_owner_id(),
            ctx: ctx.clone(),
        };
        binding.write(buffers);

        log::debug!("Created descriptor binding for slots {:?}", buffers.slots());
        Ok(binding)
    }

    /// Re-point the existing set at a different buffer set with the same slots.
    ///
    /// Only valid while no dispatch using this set is in flight, which the
    /// borrow held by [`DispatchJob`](crate::dispatch::DispatchJob) guarantees.
    pub fn rebind(&mut self, buffers: &BufferSet) -> Result<()> {
        self.layout.bindings().check_slots(&buffers.slots())?;
        self.write(buffers);
        log::debug!("Rebound descriptor set to {} buffers", buffers.len());
        Ok(())
    }

    fn write(&mut self, buffers: &BufferSet) {
        let infos: Vec<(u32, vk::DescriptorBufferInfo)> =
            buffers.iter().map(|b| (b.binding(), b.descriptor_info())).collect();
        let ids: Vec<(u32, u64)> = buffers.iter().map(|b| (b.binding(), b.id())).collect();

        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(slot, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(*slot)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();

        unsafe {
            self.ctx.device().update_descriptor_sets(&writes, &[]);
        }

        self.bound = ids;
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    /// Whether this set currently points at exactly `buffers`.
    pub fn is_bound_to(&self, buffers: &BufferSet) -> bool {
        self.bound.len() == buffers.len()
            && buffers
                .iter()
                .zip(&self.bound)
                .all(|(b, (slot, id))| b.binding() == *slot && b.id() == *id)
    }
}

impl Drop for DescriptorBinding {
    fn drop(&mut self) {
        log::debug!("Destroying descriptor pool ({} bindings)", self.bound.len());
        unsafe {
            // frees the set with it
            self.ctx.device().destroy_descriptor_pool(self.pool, None);
        }
        self.ctx.ledger().record(self.owner, ReleaseStage::DescriptorPool);
    }
}
