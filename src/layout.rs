//! Binding layout and pipeline layout construction
//!
//! A [`BindingLayout`] is the host-side description of which slots a kernel
//! reads: one storage buffer per slot, visible to the compute stage only.
//! It is derived from a [`BufferSet`] (or built slot by slot) and then turned
//! into a single `VkDescriptorSetLayout` + `VkPipelineLayout` pair by
//! [`PipelineLayout::new`]. Both the pipeline and its descriptor sets are
//! built from that same `PipelineLayout`, so they cannot disagree.

use std::collections::BTreeSet;
use std::sync::Arc;

use ash::vk;

use crate::buffer::BufferSet;
use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::teardown::{next_owner_id, ReleaseStage};

/// One binding in a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingEntry {
    pub slot: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stage: vk::ShaderStageFlags,
}

impl BindingEntry {
    pub fn storage_buffer(slot: u32) -> Self {
        Self {
            slot,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            stage: vk::ShaderStageFlags::COMPUTE,
        }
    }

    fn to_vk(self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.slot)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(1)
            .stage_flags(self.stage)
    }
}

/// Immutable, slot-ordered set of storage-buffer bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayout {
    entries: Vec<BindingEntry>,
}

impl BindingLayout {
    /// Layout with one storage-buffer binding per slot.
    ///
    /// # Errors
    ///
    /// `DuplicateBindingSlot` if any slot appears twice.
    pub fn from_slots(slots: &[u32]) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for &slot in slots {
            if !seen.insert(slot) {
                return Err(ComputeError::DuplicateBindingSlot(slot));
            }
        }
        let entries = seen.into_iter().map(BindingEntry::storage_buffer).collect();
        Ok(Self { entries })
    }

    /// Layout matching every buffer in the set.
    pub fn from_buffers(buffers: &BufferSet) -> Result<Self> {
        let slots: Vec<u32> = buffers.iter().map(|b| b.binding()).collect();
        Self::from_slots(&slots)
    }

    pub fn entries(&self) -> &[BindingEntry] {
        &self.entries
    }

    pub fn slots(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.slot).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Storage descriptors needed for one set.
    pub fn storage_buffer_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.descriptor_type == vk::DescriptorType::STORAGE_BUFFER)
            .count() as u32
    }

    /// Fail unless `slots` is exactly this layout's slot set.
    pub fn check_slots(&self, slots: &[u32]) -> Result<()> {
        let mut sorted = slots.to_vec();
        sorted.sort_unstable();
        let layout = self.slots();
        if sorted != layout {
            return Err(ComputeError::LayoutMismatch {
                layout,
                buffers: sorted,
            });
        }
        Ok(())
    }

    pub fn vk_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.entries.iter().map(|e| e.to_vk()).collect()
    }
}

/// Builder for layouts that are declared before any buffer exists.
#[derive(Debug, Default)]
pub struct BindingLayoutBuilder {
    slots: Vec<u32>,
}

impl BindingLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a storage buffer binding (read/write from the kernel)
    pub fn add_storage_buffer(mut self, slot: u32) -> Self {
        self.slots.push(slot);
        self
    }

    /// Validate and freeze. Duplicates are reported here, not silently merged.
    pub fn build(self) -> Result<BindingLayout> {
        BindingLayout::from_slots(&self.slots)
    }
}

/// Descriptor set layout plus the single-set pipeline layout wrapping it.
///
/// Shared (via `Arc`) by the kernel pipeline and every descriptor binding
/// created against it.
pub struct PipelineLayout {
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    bindings: BindingLayout,
    owner: u64,
    ctx: DeviceContext,
}

impl PipelineLayout {
    /// Create the descriptor set layout and a pipeline layout with exactly
    /// that one set and no push-constant ranges.
    pub fn new(ctx: &DeviceContext, bindings: &BindingLayout) -> Result<Arc<Self>> {
        let device = ctx.device();
        let vk_bindings = bindings.vk_bindings();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);

        let set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| {
                ComputeError::DescriptorCreationFailed(format!(
                    "Failed to create descriptor set layout: {:?}",
                    e
                ))
            })?;

        let set_layouts = [set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);

        let pipeline_layout = match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(ComputeError::DescriptorCreationFailed(format!(
                    "Failed to create pipeline layout: {:?}",
                    e
                )));
            }
        };

        log::debug!("Created pipeline layout with bindings {:?}", bindings.slots());

        Ok(Arc::new(Self {
            set_layout,
            pipeline_layout,
            bindings: bindings.clone(),
            owner: next_owner_id(),
            ctx: ctx.clone(),
        }))
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn bindings(&self) -> &BindingLayout {
        &self.bindings
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        log::debug!("Destroying pipeline layout {:?}", self.bindings.slots());
        let ledger = self.ctx.ledger();
        unsafe {
            self.ctx.device().destroy_descriptor_set_layout(self.set_layout, None);
            ledger.record(self.owner, ReleaseStage::DescriptorSetLayout);
            self.ctx.device().destroy_pipeline_layout(self.pipeline_layout, None);
            ledger.record(self.owner, ReleaseStage::PipelineLayout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_slots_build() {
        let layout = BindingLayout::from_slots(&[0, 1, 2]).unwrap();
        assert_eq!(layout.slots(), vec![0, 1, 2]);
        assert_eq!(layout.storage_buffer_count(), 3);
        for entry in layout.entries() {
            assert_eq!(entry.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
            assert_eq!(entry.stage, vk::ShaderStageFlags::COMPUTE);
        }
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let err = BindingLayout::from_slots(&[0, 1, 1]).unwrap_err();
        assert!(matches!(err, ComputeError::DuplicateBindingSlot(1)));
    }

    #[test]
    fn test_order_follows_slots_not_input() {
        let layout = BindingLayoutBuilder::new()
            .add_storage_buffer(2)
            .add_storage_buffer(0)
            .add_storage_buffer(5)
            .build()
            .unwrap();
        assert_eq!(layout.slots(), vec![0, 2, 5]);

        let bindings = layout.vk_bindings();
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[1].binding, 2);
        assert_eq!(bindings[1].descriptor_count, 1);
    }

    #[test]
    fn test_builder_duplicate() {
        let result = BindingLayoutBuilder::new()
            .add_storage_buffer(3)
            .add_storage_buffer(3)
            .build();
        assert!(matches!(result, Err(ComputeError::DuplicateBindingSlot(3))));
    }

    #[test]
    fn test_check_slots() {
        let layout = BindingLayout::from_slots(&[0, 1, 2]).unwrap();
        layout.check_slots(&[2, 0, 1]).unwrap();
        match layout.check_slots(&[0, 1]) {
            Err(ComputeError::LayoutMismatch { layout, buffers }) => {
                assert_eq!(layout, vec![0, 1, 2]);
                assert_eq!(buffers, vec![0, 1]);
            }
            other => panic!("expected mismatch, got {:?}", other.err()),
        }
        assert!(layout.check_slots(&[0, 1, 3]).is_err());
    }

    #[test]
    fn test_empty_layout() {
        let layout = BindingLayoutBuilder::new().build().unwrap();
        assert!(layout.is_empty());
        assert_eq!(layout.storage_buffer_count(), 0);
    }
}
