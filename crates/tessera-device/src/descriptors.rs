//! Descriptor set management.

use crate::context::{Device, ObjectKey, ObjectKind};
use crate::error::{DeviceError, Result};
use crate::resource::{
    Buffer, BufferHandle, BufferUsageFlags, BufferView, BufferViewHandle, ImageUsageFlags,
    ImageView, ImageViewHandle, Sampler, SamplerHandle,
};
use bitflags::bitflags;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::Handle;

pub type DescriptorSetLayoutHandle = Handle<DescriptorSetLayout>;
pub type DescriptorPoolHandle = Handle<DescriptorPool>;
pub type DescriptorSetHandle = Handle<DescriptorSet>;

bitflags! {
    /// Stages a binding or push constant range is visible to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 0x1;
        const FRAGMENT = 0x10;
        const ALL_GRAPHICS = 0x1f;
    }
}

/// Kinds of descriptors the device supports. Storage buffers are read-only
/// to shader stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    UniformTexelBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stage_flags: ShaderStageFlags,
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    #[must_use]
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: DescriptorType,
        count: u32,
        stage_flags: ShaderStageFlags,
    ) -> Self {
        self.bindings.push(DescriptorSetLayoutBinding {
            binding,
            descriptor_type,
            count,
            stage_flags,
        });
        self
    }

    /// Add a uniform buffer binding.
    #[must_use]
    pub fn uniform_buffer(self, binding: u32, stage_flags: ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::UniformBuffer, 1, stage_flags)
    }

    /// Add a storage buffer binding.
    #[must_use]
    pub fn storage_buffer(self, binding: u32, stage_flags: ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::StorageBuffer, 1, stage_flags)
    }

    /// Add a sampled image binding.
    #[must_use]
    pub fn sampled_image(self, binding: u32, stage_flags: ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::CombinedImageSampler, 1, stage_flags)
    }

    #[must_use]
    pub fn uniform_texel_buffer(self, binding: u32, stage_flags: ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::UniformTexelBuffer, 1, stage_flags)
    }

    /// Build the descriptor set layout.
    pub fn build(self, device: &Device) -> Result<DescriptorSetLayoutHandle> {
        device.ctx.check_lost()?;
        let mut seen = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            if binding.count != 1 {
                return Err(DeviceError::Unsupported(format!(
                    "binding {} has {} descriptors; only single descriptors are supported",
                    binding.binding, binding.count
                )));
            }
            if seen.contains(&binding.binding) {
                return Err(DeviceError::validation(format!(
                    "binding {} declared twice",
                    binding.binding
                )));
            }
            seen.push(binding.binding);
        }
        let handle = device.ctx.set_layouts.insert(DescriptorSetLayout {
            bindings: self.bindings,
        });
        tracing::debug!(?handle, "Created descriptor set layout");
        Ok(handle)
    }
}

#[derive(Debug)]
pub struct DescriptorSetLayout {
    bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    pub fn bindings(&self) -> &[DescriptorSetLayoutBinding] {
        &self.bindings
    }

    fn binding(&self, binding: u32) -> Option<&DescriptorSetLayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

/// Descriptor pool for allocating descriptor sets.
#[derive(Debug)]
pub struct DescriptorPool {
    max_sets: u32,
    sets: Mutex<Vec<DescriptorSetHandle>>,
}

impl DescriptorPool {
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn allocated(&self) -> usize {
        self.sets.lock().len()
    }
}

/// A resource written into a descriptor set, captured by reference.
#[derive(Clone, Debug)]
pub(crate) enum DescriptorEntry {
    Buffer {
        descriptor_type: DescriptorType,
        buffer: Arc<Buffer>,
        handle: BufferHandle,
        offset: u64,
        range: u64,
    },
    Texture {
        view: Arc<ImageView>,
        view_handle: ImageViewHandle,
        sampler: Arc<Sampler>,
        sampler_handle: SamplerHandle,
    },
    TexelBuffer {
        view: Arc<BufferView>,
        handle: BufferViewHandle,
    },
}

impl DescriptorEntry {
    /// Objects whose destruction invalidates users of this entry.
    pub fn keys(&self) -> Vec<ObjectKey> {
        match self {
            Self::Buffer { buffer, handle, .. } => {
                let mut keys = vec![ObjectKey::of(ObjectKind::Buffer, *handle)];
                if let Ok(binding) = buffer.binding() {
                    keys.push(ObjectKey::of(ObjectKind::Memory, binding.handle));
                }
                keys
            }
            Self::Texture {
                view,
                view_handle,
                sampler_handle,
                ..
            } => {
                let mut keys = vec![
                    ObjectKey::of(ObjectKind::ImageView, *view_handle),
                    ObjectKey::of(ObjectKind::Image, view.image_handle),
                    ObjectKey::of(ObjectKind::Sampler, *sampler_handle),
                ];
                if let Ok(binding) = view.image.binding() {
                    keys.push(ObjectKey::of(ObjectKind::Memory, binding.handle));
                }
                keys
            }
            Self::TexelBuffer { view, handle } => vec![
                ObjectKey::of(ObjectKind::BufferView, *handle),
                ObjectKey::of(ObjectKind::Buffer, view.buffer_handle),
            ],
        }
    }
}

/// A set of descriptors matching one layout.
#[derive(Debug)]
pub struct DescriptorSet {
    layout: Arc<DescriptorSetLayout>,
    entries: Mutex<HashMap<u32, DescriptorEntry>>,
}

impl DescriptorSet {
    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    /// Current entries sorted by binding.
    pub(crate) fn entries(&self) -> Vec<(u32, DescriptorEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(&binding, entry)| (binding, entry.clone()))
            .collect();
        entries.sort_by_key(|(binding, _)| *binding);
        entries
    }
}

/// Resource written by a [`WriteDescriptorSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorWrite {
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    CombinedImageSampler {
        view: ImageViewHandle,
        sampler: SamplerHandle,
    },
    UniformTexelBuffer(BufferViewHandle),
}

impl DescriptorWrite {
    pub const fn descriptor_type(&self) -> DescriptorType {
        match self {
            Self::UniformBuffer { .. } => DescriptorType::UniformBuffer,
            Self::StorageBuffer { .. } => DescriptorType::StorageBuffer,
            Self::CombinedImageSampler { .. } => DescriptorType::CombinedImageSampler,
            Self::UniformTexelBuffer(_) => DescriptorType::UniformTexelBuffer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteDescriptorSet {
    pub dst_set: DescriptorSetHandle,
    pub dst_binding: u32,
    pub descriptor: DescriptorWrite,
}

impl Device {
    pub fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.set_layouts.remove(layout)?;
        Ok(())
    }

    /// Create a pool that holds at most `max_sets` sets.
    pub fn create_descriptor_pool(&self, max_sets: u32) -> Result<DescriptorPoolHandle> {
        self.ctx.check_lost()?;
        if max_sets == 0 {
            return Err(DeviceError::validation("descriptor pool needs max_sets > 0"));
        }
        let handle = self.ctx.descriptor_pools.insert(DescriptorPool {
            max_sets,
            sets: Mutex::new(Vec::new()),
        });
        tracing::debug!(?handle, max_sets, "Created descriptor pool");
        Ok(handle)
    }

    pub fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        self.ctx.check_lost()?;
        let pool = self.ctx.descriptor_pools.get(pool)?;
        let layout = self.ctx.set_layouts.get(layout)?;
        let mut sets = pool.sets.lock();
        if sets.len() >= pool.max_sets as usize {
            return Err(DeviceError::OutOfPoolMemory);
        }
        let handle = self.ctx.descriptor_sets.insert(DescriptorSet {
            layout,
            entries: Mutex::new(HashMap::new()),
        });
        sets.push(handle);
        Ok(handle)
    }

    /// Free every set allocated from the pool.
    pub fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let pool = self.ctx.descriptor_pools.get(pool)?;
        let sets = std::mem::take(&mut *pool.sets.lock());
        self.free_sets(&sets);
        Ok(())
    }

    pub fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let removed = self.ctx.descriptor_pools.remove(pool)?;
        let sets = std::mem::take(&mut *removed.sets.lock());
        self.free_sets(&sets);
        tracing::debug!(?pool, "Destroyed descriptor pool");
        Ok(())
    }

    fn free_sets(&self, sets: &[DescriptorSetHandle]) {
        for &set in sets {
            if self.ctx.descriptor_sets.remove(set).is_ok() {
                self.ctx
                    .invalidate_references(ObjectKey::of(ObjectKind::DescriptorSet, set));
            }
        }
    }

    /// Write descriptors. Every write is validated before any is applied.
    pub fn update_descriptor_sets(&self, writes: &[WriteDescriptorSet]) -> Result<()> {
        self.ctx.check_lost()?;
        let resolved = writes
            .iter()
            .map(|write| self.resolve_write(write))
            .collect::<Result<Vec<_>>>()?;
        for (set, binding, entry) in resolved {
            set.entries.lock().insert(binding, entry);
        }
        Ok(())
    }

    fn resolve_write(
        &self,
        write: &WriteDescriptorSet,
    ) -> Result<(Arc<DescriptorSet>, u32, DescriptorEntry)> {
        let set = self.ctx.descriptor_sets.get(write.dst_set)?;
        let expected = set
            .layout
            .binding(write.dst_binding)
            .ok_or_else(|| {
                DeviceError::validation(format!(
                    "binding {} not in set layout",
                    write.dst_binding
                ))
            })?
            .descriptor_type;
        if expected != write.descriptor.descriptor_type() {
            return Err(DeviceError::validation(format!(
                "binding {} is {expected:?}, write is {:?}",
                write.dst_binding,
                write.descriptor.descriptor_type()
            )));
        }

        let limits = &self.ctx.capabilities.limits;
        let entry = match write.descriptor {
            DescriptorWrite::UniformBuffer {
                buffer,
                offset,
                range,
            } => self.buffer_entry(
                DescriptorType::UniformBuffer,
                buffer,
                offset,
                range,
                BufferUsageFlags::UNIFORM_BUFFER,
                limits.min_uniform_buffer_offset_alignment,
            )?,
            DescriptorWrite::StorageBuffer {
                buffer,
                offset,
                range,
            } => self.buffer_entry(
                DescriptorType::StorageBuffer,
                buffer,
                offset,
                range,
                BufferUsageFlags::STORAGE_BUFFER,
                limits.min_storage_buffer_offset_alignment,
            )?,
            DescriptorWrite::CombinedImageSampler { view, sampler } => {
                let image_view = self.ctx.image_views.get(view)?;
                if !image_view.image.usage().contains(ImageUsageFlags::SAMPLED) {
                    return Err(DeviceError::validation("image was not created with SAMPLED usage"));
                }
                DescriptorEntry::Texture {
                    view: image_view,
                    view_handle: view,
                    sampler: self.ctx.samplers.get(sampler)?,
                    sampler_handle: sampler,
                }
            }
            DescriptorWrite::UniformTexelBuffer(handle) => {
                let view = self.ctx.buffer_views.get(handle)?;
                if !view
                    .buffer
                    .usage()
                    .contains(BufferUsageFlags::UNIFORM_TEXEL_BUFFER)
                {
                    return Err(DeviceError::validation(
                        "buffer was not created with UNIFORM_TEXEL_BUFFER usage",
                    ));
                }
                DescriptorEntry::TexelBuffer { view, handle }
            }
        };
        Ok((set, write.dst_binding, entry))
    }

    fn buffer_entry(
        &self,
        descriptor_type: DescriptorType,
        handle: BufferHandle,
        offset: u64,
        range: u64,
        usage: BufferUsageFlags,
        alignment: u64,
    ) -> Result<DescriptorEntry> {
        let buffer = self.ctx.buffers.get(handle)?;
        if !buffer.usage().contains(usage) {
            return Err(DeviceError::validation(format!(
                "buffer usage {:?} lacks {usage:?}",
                buffer.usage()
            )));
        }
        buffer.binding()?;
        if offset % alignment != 0 {
            return Err(DeviceError::validation(format!(
                "descriptor offset {offset} is not a multiple of {alignment}"
            )));
        }
        let range = buffer.resolve_range(offset, range)?;
        Ok(DescriptorEntry::Buffer {
            descriptor_type,
            buffer,
            handle,
            offset,
            range: range.end - range.start,
        })
    }
}

/// Write a uniform buffer descriptor.
pub fn write_uniform_buffer(
    device: &Device,
    dst_set: DescriptorSetHandle,
    binding: u32,
    buffer: BufferHandle,
    offset: u64,
    range: u64,
) -> Result<()> {
    device.update_descriptor_sets(&[WriteDescriptorSet {
        dst_set,
        dst_binding: binding,
        descriptor: DescriptorWrite::UniformBuffer {
            buffer,
            offset,
            range,
        },
    }])
}

/// Write a storage buffer descriptor.
pub fn write_storage_buffer(
    device: &Device,
    dst_set: DescriptorSetHandle,
    binding: u32,
    buffer: BufferHandle,
    offset: u64,
    range: u64,
) -> Result<()> {
    device.update_descriptor_sets(&[WriteDescriptorSet {
        dst_set,
        dst_binding: binding,
        descriptor: DescriptorWrite::StorageBuffer {
            buffer,
            offset,
            range,
        },
    }])
}

/// Write a combined image sampler descriptor.
pub fn write_sampled_image(
    device: &Device,
    dst_set: DescriptorSetHandle,
    binding: u32,
    view: ImageViewHandle,
    sampler: SamplerHandle,
) -> Result<()> {
    device.update_descriptor_sets(&[WriteDescriptorSet {
        dst_set,
        dst_binding: binding,
        descriptor: DescriptorWrite::CombinedImageSampler { view, sampler },
    }])
}

pub fn write_texel_buffer(
    device: &Device,
    dst_set: DescriptorSetHandle,
    binding: u32,
    view: BufferViewHandle,
) -> Result<()> {
    device.update_descriptor_sets(&[WriteDescriptorSet {
        dst_set,
        dst_binding: binding,
        descriptor: DescriptorWrite::UniformTexelBuffer(view),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceBuilder;
    use crate::memory::{MemoryAllocateInfo, WHOLE_SIZE};
    use crate::resource::BufferCreateInfo;

    fn bound_buffer(device: &Device, size: u64, usage: BufferUsageFlags) -> BufferHandle {
        let buffer = device.create_buffer(&BufferCreateInfo { size, usage }).unwrap();
        let requirements = device.get_buffer_memory_requirements(buffer).unwrap();
        let memory = device
            .allocate_memory(&MemoryAllocateInfo {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_index: 1,
            })
            .unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        buffer
    }

    #[test]
    fn pool_exhaustion_and_reset() {
        let device = DeviceBuilder::new().build().unwrap();
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, ShaderStageFlags::VERTEX)
            .build(&device)
            .unwrap();
        let pool = device.create_descriptor_pool(2).unwrap();

        let first = device.allocate_descriptor_set(pool, layout).unwrap();
        device.allocate_descriptor_set(pool, layout).unwrap();
        assert_eq!(
            device.allocate_descriptor_set(pool, layout),
            Err(DeviceError::OutOfPoolMemory)
        );

        device.reset_descriptor_pool(pool).unwrap();
        assert!(!device.ctx.descriptor_sets.contains(first));
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
    }

    #[test]
    fn arrays_are_unsupported() {
        let device = DeviceBuilder::new().build().unwrap();
        let result = DescriptorSetLayoutBuilder::new()
            .binding(0, DescriptorType::UniformBuffer, 4, ShaderStageFlags::VERTEX)
            .build(&device);
        assert!(matches!(result, Err(DeviceError::Unsupported(_))));
    }

    #[test]
    fn writes_are_validated() {
        let device = DeviceBuilder::new().build().unwrap();
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, ShaderStageFlags::VERTEX)
            .storage_buffer(1, ShaderStageFlags::FRAGMENT)
            .build(&device)
            .unwrap();
        let pool = device.create_descriptor_pool(1).unwrap();
        let set = device.allocate_descriptor_set(pool, layout).unwrap();
        let uniform = bound_buffer(&device, 512, BufferUsageFlags::UNIFORM_BUFFER);

        write_uniform_buffer(&device, set, 0, uniform, 256, WHOLE_SIZE).unwrap();
        // Misaligned offset, wrong usage, wrong binding type, missing binding.
        assert!(write_uniform_buffer(&device, set, 0, uniform, 16, 64).is_err());
        assert!(write_storage_buffer(&device, set, 1, uniform, 0, 64).is_err());
        assert!(write_storage_buffer(&device, set, 0, uniform, 0, 64).is_err());
        assert!(write_uniform_buffer(&device, set, 7, uniform, 0, 64).is_err());

        let entries = device.ctx.descriptor_sets.get(set).unwrap().entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0].1,
            DescriptorEntry::Buffer {
                offset: 256,
                range: 256,
                ..
            }
        ));
    }
}
