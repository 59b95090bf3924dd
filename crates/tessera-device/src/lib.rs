//! Host-executed graphics device for Tessera.
//!
//! This crate provides:
//! - Device creation with configurable memory heaps and queues
//! - Memory allocation, mapping and resource binding
//! - Buffers, images, views, samplers and descriptor sets
//! - Command pools and command buffer recording
//! - Queue submission on worker threads with fences and semaphores
//! - Layout and hazard validation during execution
//!
//! Draws are rasterized by `tessera-raster`.

pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod descriptors;
pub mod error;
mod execute;
pub mod hazard;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod sync;
pub mod transfer;

pub use capabilities::{
    Capabilities, FormatFeatureFlags, Limits, MemoryHeap, MemoryHeapFlags, MemoryPropertyFlags,
    MemoryType, PhysicalDeviceType, QueueFamily, QueueFlags,
};
pub use command::{
    AttachmentLoadOp, AttachmentStoreOp, BufferMemoryBarrier, CommandBufferHandle,
    CommandBufferState, CommandBufferUsageFlags, CommandPoolCreateFlags, CommandPoolHandle,
    ImageMemoryBarrier, MemoryBarrier, RenderingAttachment, RenderingInfo,
};
pub use config::{DeviceConfig, HeapConfig, HeapKind};
pub use context::{Device, DeviceBuilder, DeviceDiagnostics};
pub use descriptors::{
    write_sampled_image, write_storage_buffer, write_texel_buffer, write_uniform_buffer,
    DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutBuilder,
    DescriptorSetLayoutHandle, DescriptorType, DescriptorWrite, ShaderStageFlags,
    WriteDescriptorSet,
};
pub use error::{DeviceError, Result};
pub use hazard::{AccessFlags, PipelineStageFlags};
pub use memory::{
    MappedMemory, MappedMemoryRange, MemoryAllocateInfo, MemoryHandle, MemoryRequirements,
    WHOLE_SIZE,
};
pub use pipeline::{GraphicsPipelineConfig, PipelineHandle, PushConstantRange};
pub use queue::{Queue, SubmitInfo};
pub use resource::{
    BufferCreateInfo, BufferHandle, BufferUsageFlags, BufferViewHandle, ImageCreateInfo,
    ImageHandle, ImageLayout, ImageSubresourceLayers, ImageSubresourceRange, ImageTiling,
    ImageType, ImageUsageFlags, ImageViewHandle, ImageViewType, SamplerHandle,
    SubresourceLayout,
};
pub use sync::{FenceHandle, FenceStatus, SemaphoreHandle};
pub use transfer::{BufferCopy, BufferImageCopy, ImageCopy};

pub use tessera_core as core;
pub use tessera_raster as raster;
