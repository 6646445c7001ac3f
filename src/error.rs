//! Error types for HLX kernel dispatch
//!
//! Every failure the dispatch core can surface is a variant of
//! [`ComputeError`]. None of them are retried internally; the caller
//! decides whether to abort or rebuild.

use std::path::PathBuf;
use std::time::Duration;

use ash::vk;
use thiserror::Error;

use crate::dispatch::DispatchState;
use crate::teardown::ReleaseStage;

/// Enumeration of all possible dispatch-core errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// The Vulkan loader could not be found or opened
    #[error("Failed to load Vulkan entry point: {0}")]
    EntryLoadFailed(String),

    /// vkCreateInstance rejected the request
    #[error("Vulkan instance creation failed: {0:?}")]
    InstanceCreationFailed(vk::Result),

    /// Enumeration returned zero physical devices
    #[error("No Vulkan-capable device found")]
    NoDeviceFound,

    /// The selected device has no queue family with compute support
    #[error("No queue family with compute support on the selected device")]
    NoComputeQueueFamily,

    /// vkCreateDevice rejected the request (unsupported feature, lost device, ...)
    #[error("Logical device creation failed: {0:?}")]
    DeviceCreationFailed(vk::Result),

    /// No memory type is both allowed by the buffer and HOST_VISIBLE | HOST_COHERENT
    #[error("No host-visible, host-coherent memory type matches type bits {type_bits:#b}")]
    NoSuitableMemoryType { type_bits: u32 },

    /// Buffer object or its memory could not be created or bound
    #[error("Buffer creation failed: {0}")]
    BufferCreationFailed(String),

    /// Vulkan forbids zero-sized buffers
    #[error("Invalid buffer size {0} for binding slot")]
    InvalidBufferSize(u64),

    /// A host copy would reach past the end of the buffer
    #[error("Copy of {length} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Host array length disagrees with the buffer's element count
    #[error("Host data holds {actual} bytes but buffer expects {expected}")]
    ElementCountMismatch { expected: u64, actual: u64 },

    /// vkMapMemory failed
    #[error("Failed to map buffer memory: {0:?}")]
    MemoryMapFailed(vk::Result),

    /// Two resources in one argument set claim the same binding slot
    #[error("Binding slot {0} is used by more than one buffer")]
    DuplicateBindingSlot(u32),

    /// Buffer set and binding layout disagree about which slots exist
    #[error("Buffer slots {buffers:?} do not match layout slots {layout:?}")]
    LayoutMismatch { layout: Vec<u32>, buffers: Vec<u32> },

    /// Lookup of a slot that is not part of the set
    #[error("No buffer bound at slot {0}")]
    UnknownBindingSlot(u32),

    /// Kernel binary path does not exist
    #[error("Kernel binary not found: {}", .0.display())]
    KernelBinaryNotFound(PathBuf),

    /// Kernel binary exists but could not be read
    #[error("Kernel binary unreadable: {}: {source}", path.display())]
    KernelBinaryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Kernel binary bytes are not a SPIR-V module
    #[error("Invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    /// Shader module or compute pipeline creation failed
    #[error("Pipeline creation failed for entry point '{entry_point}': {reason}")]
    PipelineCreationFailed { entry_point: String, reason: String },

    /// Descriptor set layout, pool or set creation failed
    #[error("Descriptor creation failed: {0}")]
    DescriptorCreationFailed(String),

    /// Command pool, buffer or event handling failed while recording
    #[error("Command recording failed: {0}")]
    CommandRecordingFailed(String),

    /// vkQueueSubmit rejected the command buffer
    #[error("Dispatch submission failed: {0:?}")]
    DispatchSubmitFailed(vk::Result),

    /// Completion signal did not fire within the host wait budget
    #[error("Dispatch did not complete within {0:?}")]
    DispatchTimeout(Duration),

    /// An operation was attempted in the wrong dispatch state
    #[error("Dispatch job is {actual:?}, operation requires {expected:?}")]
    InvalidDispatchState {
        expected: DispatchState,
        actual: DispatchState,
    },

    /// Teardown ledger observed a release ahead of something that depends on it
    #[error("{later:?} released before {earlier:?} (owner {owner})")]
    TeardownOrderViolation {
        owner: u64,
        earlier: ReleaseStage,
        later: ReleaseStage,
    },

    /// Configuration could not be parsed or failed validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Any other Vulkan API error
    #[error("Vulkan API error: {0:?}")]
    VulkanApi(vk::Result),
}

/// Convert ash::vk::Result to ComputeError
impl From<vk::Result> for ComputeError {
    fn from(result: vk::Result) -> Self {
        ComputeError::VulkanApi(result)
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;
