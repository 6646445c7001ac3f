//! Storage buffers backed by host-visible, host-coherent memory
//!
//! Each [`BufferResource`] owns exactly one `VkBuffer` and one
//! `VkDeviceMemory` allocation sized to that buffer's own requirements.
//! Nothing is sub-allocated: no two kernel arguments ever share an
//! allocation, so there is no offset arithmetic to get wrong.
//!
//! Host copies go through a map / memcpy / unmap cycle. Because the memory
//! type is HOST_COHERENT no explicit flush or invalidate is issued, but a
//! copy out of a buffer the kernel writes is only meaningful after the
//! dispatch's completion signal has fired; see
//! [`CompletedDispatch`](crate::dispatch::CompletedDispatch).

use std::collections::BTreeMap;

use ash::vk;
use bytemuck::Pod;

use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::teardown::{next_owner_id, ReleaseStage};

/// Properties every kernel argument allocation must have.
pub const HOST_COPY_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// One kernel argument: a storage buffer, its private memory, and the
/// binding slot it fills.
pub struct BufferResource {
    /// Storage buffer handle
    buffer: vk::Buffer,

    /// Dedicated allocation bound at offset 0
    memory: vk::DeviceMemory,

    /// Requested size; also the descriptor range
    size: vk::DeviceSize,

    /// Descriptor slot this argument fills
    binding: u32,

    /// (buffer, offset 0, range = size), written into the descriptor set
    descriptor: vk::DescriptorBufferInfo,

    /// Ledger identity of the buffer/memory pair
    owner: u64,

    /// Keeps the device alive until both handles are gone
    ctx: DeviceContext,
}

impl BufferResource {
    /// Create a storage buffer of exactly `size` bytes for `binding`.
    ///
    /// Searches the device's memory types for one allowed by the buffer's
    /// requirement bitmask that is also HOST_VISIBLE and HOST_COHERENT.
    ///
    /// # Errors
    ///
    /// * `InvalidBufferSize` - `size` is zero
    /// * `NoSuitableMemoryType` - no host-coherent type is allowed
    /// * `BufferCreationFailed` - driver rejected buffer, allocation or bind
    pub fn allocate(ctx: &DeviceContext, size: vk::DeviceSize, binding: u32) -> Result<Self> {
        if size == 0 {
            return Err(ComputeError::InvalidBufferSize(size));
        }

        let device = ctx.device();

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&create_info, None) }.map_err(|e| {
            ComputeError::BufferCreationFailed(format!("vkCreateBuffer: {:?}", e))
        })?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = match find_memory_type(
            ctx.memory_properties(),
            requirements.memory_type_bits,
            HOST_COPY_MEMORY,
        ) {
            Some(index) => index,
            None => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(ComputeError::NoSuitableMemoryType {
                    type_bits: requirements.memory_type_bits,
                });
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(ComputeError::BufferCreationFailed(format!(
                    "vkAllocateMemory({} bytes): {:?}",
                    requirements.size, e
                )));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(ComputeError::BufferCreationFailed(format!(
                "vkBindBufferMemory: {:?}",
                e
            )));
        }

        log::debug!(
            "Allocated buffer: slot={}, size={} bytes, allocation={} bytes, memory_type={}",
            binding,
            size,
            requirements.size,
            memory_type_index
        );

        Ok(Self {
            buffer,
            memory,
            size,
            binding,
            descriptor: vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(0)
                .range(size),
            owner: next_owner_id(),
            ctx: ctx.clone(),
        })
    }

    /// Allocate room for `count` elements of `T`.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Device to allocate on
    /// * `count` - Number of `T` values the buffer must hold
    /// * `binding` - Descriptor slot this buffer fills
    pub fn for_elements<T: Pod>(ctx: &DeviceContext, count: usize, binding: u32) -> Result<Self> {
        Self::allocate(ctx, byte_size_of::<T>(count)?, binding)
    }

    /// Copy `data` into the buffer starting at byte `offset`.
    ///
    /// Blocking; once it returns the bytes are visible to the device.
    pub fn upload(&self, data: &[u8], offset: vk::DeviceSize) -> Result<()> {
        let length = data.len() as vk::DeviceSize;
        check_range(offset, length, self.size)?;
        if length == 0 {
            return Ok(());
        }

        let mapped = self.map()?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
            self.ctx.device().unmap_memory(self.memory);
        }

        log::debug!("Uploaded {} bytes to slot {} at offset {}", length, self.binding, offset);
        Ok(())
    }

    /// Copy `out.len()` bytes starting at byte `offset` into `out`.
    ///
    /// Only meaningful once every device write to this buffer has completed.
    pub fn download(&self, out: &mut [u8], offset: vk::DeviceSize) -> Result<()> {
        let length = out.len() as vk::DeviceSize;
        check_range(offset, length, self.size)?;
        if length == 0 {
            return Ok(());
        }

        let mapped = self.map()?;
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.add(offset as usize), out.as_mut_ptr(), out.len());
            self.ctx.device().unmap_memory(self.memory);
        }

        log::debug!("Downloaded {} bytes from slot {} at offset {}", length, self.binding, offset);
        Ok(())
    }

    /// Upload a whole typed array; its byte size must equal the buffer size.
    pub fn upload_slice<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check_exact(bytes.len())?;
        self.upload(bytes, 0)
    }

    /// Download the whole buffer into a typed array of matching byte size.
    pub fn download_slice<T: Pod>(&self, out: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        self.check_exact(bytes.len())?;
        self.download(bytes, 0)
    }

    /// Download the whole buffer as a fresh vector of `T`.
    pub fn read_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let width = std::mem::size_of::<T>() as vk::DeviceSize;
        if width == 0 || self.size % width != 0 {
            return Err(ComputeError::ElementCountMismatch {
                expected: self.size,
                actual: width,
            });
        }
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); (self.size / width) as usize];
        self.download_slice(&mut out)?;
        Ok(out)
    }

    fn check_exact(&self, bytes: usize) -> Result<()> {
        if bytes as vk::DeviceSize != self.size {
            return Err(ComputeError::ElementCountMismatch {
                expected: self.size,
                actual: bytes as vk::DeviceSize,
            });
        }
        Ok(())
    }

    fn map(&self) -> Result<*mut u8> {
        let ptr = unsafe {
            self.ctx
                .device()
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .map_err(ComputeError::MemoryMapFailed)?;
        Ok(ptr.cast::<u8>())
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Process-unique identity; never reused, unlike handle values.
    pub fn id(&self) -> u64 {
        self.owner
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        self.descriptor
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        log::debug!("Releasing buffer (slot={}, size={})", self.binding, self.size);
        let ledger = self.ctx.ledger();
        unsafe {
            // buffer first, then the memory it is bound to
            self.ctx.device().destroy_buffer(self.buffer, None);
            ledger.record(self.owner, ReleaseStage::Buffer);
            self.ctx.device().free_memory(self.memory, None);
            ledger.record(self.owner, ReleaseStage::BufferMemory);
        }
    }
}

/// Slot-indexed argument set for one kernel invocation.
///
/// The slot values, not insertion order, decide the binding layout.
#[derive(Default)]
pub struct BufferSet {
    buffers: BTreeMap<u32, BufferResource>,
}

impl BufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource under its own binding slot.
    ///
    /// # Errors
    ///
    /// `DuplicateBindingSlot` if the slot is taken; the set is unchanged.
    pub fn insert(&mut self, resource: BufferResource) -> Result<()> {
        let slot = resource.binding();
        if self.buffers.contains_key(&slot) {
            return Err(ComputeError::DuplicateBindingSlot(slot));
        }
        self.buffers.insert(slot, resource);
        Ok(())
    }

    pub fn get(&self, slot: u32) -> Result<&BufferResource> {
        self.buffers.get(&slot).ok_or(ComputeError::UnknownBindingSlot(slot))
    }

    /// Ascending slot order.
    pub fn slots(&self) -> Vec<u32> {
        self.buffers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferResource> {
        self.buffers.values()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Release every buffer in ascending slot order.
    pub fn release(self) {
        for (_, resource) in self.buffers {
            drop(resource);
        }
    }
}

/// Byte size of `count` values of `T`.
///
/// # Errors
///
/// `InvalidBufferSize` if the product overflows (reported as `u64::MAX`).
pub fn byte_size_of<T: Pod>(count: usize) -> Result<vk::DeviceSize> {
    count
        .checked_mul(std::mem::size_of::<T>())
        .and_then(|bytes| vk::DeviceSize::try_from(bytes).ok())
        .ok_or(ComputeError::InvalidBufferSize(vk::DeviceSize::MAX))
}

/// Byte range check shared by upload and download.
pub fn check_range(offset: u64, length: u64, size: u64) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ComputeError::OutOfBounds { offset, length, size }),
    }
}

/// Find a memory type index allowed by `type_filter` that carries all of
/// `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}
