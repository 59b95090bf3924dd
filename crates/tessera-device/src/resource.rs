//! Buffers, images, views and samplers.
//!
//! Resources are created unbound and get their storage from a
//! [`DeviceMemory`] range through `bind_buffer_memory` or
//! `bind_image_memory`. Image subresources are laid out layer-major, then by
//! mip level, with tightly packed rows, so every 2D slice of an image is one
//! contiguous byte range that maps directly onto a [`Surface`].

use crate::context::{Device, ObjectKey, ObjectKind};
use crate::error::{DeviceError, Result};
use crate::memory::{buffer_alignment, checked_range, DeviceMemory, MemoryHandle, MemoryRequirements, WHOLE_SIZE};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use tessera_core::math::align_up;
use tessera_core::{Extent2D, Extent3D, Format, Handle, ImageAspectFlags};
use tessera_raster::{SamplerState, Surface};

pub type BufferHandle = Handle<Buffer>;
pub type ImageHandle = Handle<Image>;
pub type BufferViewHandle = Handle<BufferView>;
pub type ImageViewHandle = Handle<ImageView>;
pub type SamplerHandle = Handle<Sampler>;

/// Level or layer count meaning "every remaining one".
pub const REMAINING: u32 = u32::MAX;

const SUBRESOURCE_ALIGNMENT: u64 = 16;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsageFlags: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const UNIFORM_TEXEL_BUFFER = 0x4;
        const STORAGE_TEXEL_BUFFER = 0x8;
        const UNIFORM_BUFFER = 0x10;
        const STORAGE_BUFFER = 0x20;
        const INDEX_BUFFER = 0x40;
        const VERTEX_BUFFER = 0x80;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsageFlags: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const SAMPLED = 0x4;
        const STORAGE = 0x8;
        const COLOR_ATTACHMENT = 0x10;
        const DEPTH_STENCIL_ATTACHMENT = 0x20;
    }
}

/// Memory a resource is bound to.
#[derive(Debug)]
pub(crate) struct MemoryBinding {
    pub memory: Arc<DeviceMemory>,
    pub handle: MemoryHandle,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: BufferUsageFlags,
}

/// A linear range of bytes.
#[derive(Debug)]
pub struct Buffer {
    size: u64,
    usage: BufferUsageFlags,
    requirements: MemoryRequirements,
    binding: OnceLock<MemoryBinding>,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsageFlags {
        self.usage
    }

    pub fn requirements(&self) -> MemoryRequirements {
        self.requirements
    }

    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    pub(crate) fn binding(&self) -> Result<&MemoryBinding> {
        self.binding
            .get()
            .ok_or_else(|| DeviceError::AccessBeforeBind("buffer has no memory bound".into()))
    }

    /// Resolve `size` against the buffer, with [`WHOLE_SIZE`] running to the end.
    ///
    /// Ranges named by commands, views and descriptors fail with
    /// `InvalidFormatOrRange` when they leave the buffer.
    pub(crate) fn resolve_range(&self, offset: u64, size: u64) -> Result<Range<u64>> {
        let size = if size == WHOLE_SIZE {
            self.size.saturating_sub(offset)
        } else {
            size
        };
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(offset..end),
            _ => Err(DeviceError::InvalidFormatOrRange(format!(
                "buffer range {offset}..{} exceeds {} bytes",
                offset.saturating_add(size),
                self.size
            ))),
        }
    }

    pub(crate) fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        checked_range(offset, len, self.size, "buffer read")?;
        let binding = self.binding()?;
        binding.memory.read(binding.offset + offset, len)
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        checked_range(offset, data.len() as u64, self.size, "buffer write")?;
        let binding = self.binding()?;
        binding.memory.write(binding.offset + offset, data)
    }

    /// Run `f` over a byte range of the buffer with its memory locked.
    pub(crate) fn with_bytes_mut<R>(
        &self,
        offset: u64,
        len: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        checked_range(offset, len, self.size, "buffer access")?;
        let binding = self.binding()?;
        binding.memory.with_bytes_mut(binding.offset + offset, len, f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageType {
    Type1D,
    #[default]
    Type2D,
    Type3D,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageTiling {
    #[default]
    Optimal,
    Linear,
}

/// Layout an image subresource is in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachmentOptimal,
    DepthStencilAttachmentOptimal,
    DepthStencilReadOnlyOptimal,
    ShaderReadOnlyOptimal,
    TransferSrcOptimal,
    TransferDstOptimal,
    Preinitialized,
    PresentSrc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCreateInfo {
    pub image_type: ImageType,
    pub format: Format,
    pub extent: Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub tiling: ImageTiling,
    pub usage: ImageUsageFlags,
    /// `Undefined` or `Preinitialized`
    pub initial_layout: ImageLayout,
}

impl ImageCreateInfo {
    /// Single-level 2D image with optimal tiling.
    pub fn new_2d(format: Format, width: u32, height: u32, usage: ImageUsageFlags) -> Self {
        Self {
            image_type: ImageType::Type2D,
            format,
            extent: Extent3D::new(width, height, 1),
            mip_levels: 1,
            array_layers: 1,
            tiling: ImageTiling::Optimal,
            usage,
            initial_layout: ImageLayout::Undefined,
        }
    }
}

/// Placement of one subresource within the image's memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubresourceLayout {
    pub offset: u64,
    pub size: u64,
    pub row_pitch: u64,
    pub array_pitch: u64,
    pub depth_pitch: u64,
}

/// A range of mip levels and array layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSubresourceRange {
    pub aspect_mask: ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ImageSubresourceRange {
    /// Every level and layer of the given aspects.
    pub const fn all(aspect_mask: ImageAspectFlags) -> Self {
        Self {
            aspect_mask,
            base_mip_level: 0,
            level_count: REMAINING,
            base_array_layer: 0,
            layer_count: REMAINING,
        }
    }
}

/// One mip level of a range of array layers, as addressed by copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSubresourceLayers {
    pub aspect_mask: ImageAspectFlags,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ImageSubresourceLayers {
    pub const fn base(aspect_mask: ImageAspectFlags) -> Self {
        Self {
            aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

/// Concrete mip and layer ranges of a subresource range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedRange {
    pub aspects: ImageAspectFlags,
    pub mips: Range<u32>,
    pub layers: Range<u32>,
}

/// A 1D, 2D or 3D texel array with optional mips and layers.
#[derive(Debug)]
pub struct Image {
    info: ImageCreateInfo,
    subresources: Vec<SubresourceLayout>,
    requirements: MemoryRequirements,
    binding: OnceLock<MemoryBinding>,
    layouts: Mutex<Vec<ImageLayout>>,
}

/// Subresource placement and total size for an image.
fn plan_subresources(info: &ImageCreateInfo) -> (Vec<SubresourceLayout>, u64) {
    let texel_size = u64::from(info.format.texel_size());
    let mut offset = 0;
    let mut subresources = Vec::with_capacity((info.mip_levels * info.array_layers) as usize);
    for _layer in 0..info.array_layers {
        let layer_start = offset;
        for mip in 0..info.mip_levels {
            let extent = info.extent.mip(mip);
            let row_pitch = u64::from(extent.width) * texel_size;
            let depth_pitch = row_pitch * u64::from(extent.height);
            let size = depth_pitch * u64::from(extent.depth);
            offset = align_up(offset, SUBRESOURCE_ALIGNMENT);
            subresources.push(SubresourceLayout {
                offset,
                size,
                row_pitch,
                array_pitch: 0,
                depth_pitch,
            });
            offset += size;
        }
        offset = align_up(offset, SUBRESOURCE_ALIGNMENT);
        let array_pitch = offset - layer_start;
        let count = subresources.len();
        for sub in &mut subresources[count - info.mip_levels as usize..] {
            sub.array_pitch = array_pitch;
        }
    }
    (subresources, offset)
}

impl Image {
    pub fn info(&self) -> &ImageCreateInfo {
        &self.info
    }

    pub fn format(&self) -> Format {
        self.info.format
    }

    pub fn extent(&self) -> Extent3D {
        self.info.extent
    }

    pub fn usage(&self) -> ImageUsageFlags {
        self.info.usage
    }

    pub fn requirements(&self) -> MemoryRequirements {
        self.requirements
    }

    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    pub(crate) fn binding(&self) -> Result<&MemoryBinding> {
        self.binding
            .get()
            .ok_or_else(|| DeviceError::AccessBeforeBind("image has no memory bound".into()))
    }

    fn subresource_index(&self, mip: u32, layer: u32) -> Result<usize> {
        if mip >= self.info.mip_levels || layer >= self.info.array_layers {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "subresource (mip {mip}, layer {layer}) outside {} mips x {} layers",
                self.info.mip_levels, self.info.array_layers
            )));
        }
        Ok((layer * self.info.mip_levels + mip) as usize)
    }

    pub(crate) fn subresource(&self, mip: u32, layer: u32) -> Result<SubresourceLayout> {
        Ok(self.subresources[self.subresource_index(mip, layer)?])
    }

    pub(crate) fn resolve(&self, range: &ImageSubresourceRange) -> Result<ResolvedRange> {
        let mips = resolve_count(range.base_mip_level, range.level_count, self.info.mip_levels, "mip")?;
        let layers = resolve_count(
            range.base_array_layer,
            range.layer_count,
            self.info.array_layers,
            "layer",
        )?;
        if range.aspect_mask.is_empty() || !self.format().aspects().contains(range.aspect_mask) {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "aspects {:?} not present in {:?}",
                range.aspect_mask,
                self.format()
            )));
        }
        Ok(ResolvedRange {
            aspects: range.aspect_mask,
            mips,
            layers,
        })
    }

    pub(crate) fn resolve_layers(&self, layers: &ImageSubresourceLayers) -> Result<ResolvedRange> {
        self.resolve(&ImageSubresourceRange {
            aspect_mask: layers.aspect_mask,
            base_mip_level: layers.mip_level,
            level_count: 1,
            base_array_layer: layers.base_array_layer,
            layer_count: layers.layer_count,
        })
    }

    pub fn layout(&self, mip: u32, layer: u32) -> Result<ImageLayout> {
        let index = self.subresource_index(mip, layer)?;
        Ok(self.layouts.lock()[index])
    }

    fn indices(&self, range: &ResolvedRange) -> impl Iterator<Item = usize> + '_ {
        let mips = self.info.mip_levels;
        let mip_range = range.mips.clone();
        range
            .layers
            .clone()
            .flat_map(move |layer| mip_range.clone().map(move |mip| (layer * mips + mip) as usize))
    }

    /// Fail with `LayoutMismatch` unless every subresource is in one of `allowed`.
    pub(crate) fn expect_layout(
        &self,
        range: &ResolvedRange,
        allowed: &[ImageLayout],
        access: &str,
    ) -> Result<()> {
        let layouts = self.layouts.lock();
        match self.indices(range).map(|i| layouts[i]).find(|l| !allowed.contains(l)) {
            Some(found) => Err(DeviceError::LayoutMismatch(format!(
                "{access} needs {allowed:?}, image is in {found:?}"
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn set_layout(&self, range: &ResolvedRange, layout: ImageLayout) {
        let mut layouts = self.layouts.lock();
        for index in self.indices(range) {
            layouts[index] = layout;
        }
    }

    fn slice_bytes(&self, mip: u32, layer: u32, z: u32) -> Result<(u64, u64, Extent2D)> {
        let sub = self.subresource(mip, layer)?;
        let extent = self.info.extent.mip(mip);
        if z >= extent.depth {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "slice {z} outside depth {}",
                extent.depth
            )));
        }
        Ok((
            sub.offset + u64::from(z) * sub.depth_pitch,
            sub.depth_pitch,
            extent.to_2d(),
        ))
    }

    /// Load one 2D slice as a surface of `format`.
    pub(crate) fn read_slice(&self, mip: u32, layer: u32, z: u32, format: Format) -> Result<Surface> {
        let binding = self.binding()?;
        let (offset, len, extent) = self.slice_bytes(mip, layer, z)?;
        let bytes = binding.memory.read(binding.offset + offset, len)?;
        Ok(Surface::from_bytes(format, extent, bytes)?)
    }

    /// Raw bytes of one 2D slice, rows tightly packed.
    pub(crate) fn slice_to_vec(&self, mip: u32, layer: u32, z: u32) -> Result<Vec<u8>> {
        let binding = self.binding()?;
        let (offset, len, _) = self.slice_bytes(mip, layer, z)?;
        binding.memory.read(binding.offset + offset, len)
    }

    /// Run `f` over the bytes of one 2D slice with its memory locked.
    pub(crate) fn with_slice_mut<R>(
        &self,
        mip: u32,
        layer: u32,
        z: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let binding = self.binding()?;
        let (offset, len, _) = self.slice_bytes(mip, layer, z)?;
        binding.memory.with_bytes_mut(binding.offset + offset, len, f)
    }

    /// Store a surface previously loaded with [`Self::read_slice`].
    pub(crate) fn write_slice(&self, mip: u32, layer: u32, z: u32, surface: &Surface) -> Result<()> {
        let binding = self.binding()?;
        let (offset, len, _) = self.slice_bytes(mip, layer, z)?;
        let bytes = surface.as_bytes();
        if bytes.len() as u64 != len {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "slice holds {len} bytes, surface has {}",
                bytes.len()
            )));
        }
        binding.memory.write(binding.offset + offset, bytes)
    }
}

fn resolve_count(base: u32, count: u32, total: u32, what: &str) -> Result<Range<u32>> {
    let count = if count == REMAINING {
        total.saturating_sub(base)
    } else {
        count
    };
    match base.checked_add(count) {
        Some(end) if count > 0 && end <= total => Ok(base..end),
        _ => Err(DeviceError::InvalidFormatOrRange(format!(
            "{what} range {base}+{count} outside {total}"
        ))),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageViewType {
    Type1D,
    #[default]
    Type2D,
    Type2DArray,
    Type3D,
}

/// Read-only projection of a range of an image.
#[derive(Debug)]
pub struct ImageView {
    pub(crate) image: Arc<Image>,
    pub(crate) image_handle: ImageHandle,
    view_type: ImageViewType,
    format: Format,
    pub(crate) range: ResolvedRange,
}

impl ImageView {
    pub fn view_type(&self) -> ImageViewType {
        self.view_type
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn base_mip_level(&self) -> u32 {
        self.range.mips.start
    }

    pub fn base_array_layer(&self) -> u32 {
        self.range.layers.start
    }

    /// Extent of the view's base mip level.
    pub fn extent(&self) -> Extent2D {
        self.image.extent().mip(self.range.mips.start).to_2d()
    }

    /// Load the base mip and layer as a surface in the view format.
    pub(crate) fn read_surface(&self) -> Result<Surface> {
        self.image
            .read_slice(self.base_mip_level(), self.base_array_layer(), 0, self.format)
    }

    pub(crate) fn write_surface(&self, surface: &Surface) -> Result<()> {
        self.image
            .write_slice(self.base_mip_level(), self.base_array_layer(), 0, surface)
    }
}

/// Formatted view of a buffer range.
#[derive(Debug)]
pub struct BufferView {
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) buffer_handle: BufferHandle,
    format: Format,
    offset: u64,
    range: u64,
}

impl BufferView {
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn range(&self) -> u64 {
        self.range
    }

    /// Number of texels the view covers.
    pub fn texel_count(&self) -> u32 {
        (self.range / u64::from(self.format.texel_size())) as u32
    }

    /// Snapshot as a one-row surface.
    pub(crate) fn read_surface(&self) -> Result<Surface> {
        let bytes = self.buffer.read(self.offset, self.range)?;
        Ok(Surface::from_bytes(
            self.format,
            Extent2D::new(self.texel_count(), 1),
            bytes,
        )?)
    }
}

/// Immutable sampler object.
#[derive(Debug)]
pub struct Sampler {
    state: SamplerState,
}

impl Sampler {
    pub fn state(&self) -> SamplerState {
        self.state
    }
}

impl Device {
    /// Create an unbound buffer.
    pub fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        self.ctx.check_lost()?;
        if info.size == 0 {
            return Err(DeviceError::validation("buffer size must be non-zero"));
        }
        if info.usage.is_empty() {
            return Err(DeviceError::validation("buffer usage must not be empty"));
        }
        let alignment = buffer_alignment(info.usage);
        let requirements = MemoryRequirements {
            size: align_up(info.size, alignment),
            alignment,
            memory_type_bits: self.ctx.capabilities.memory_type_bits(),
        };
        let handle = self.ctx.buffers.insert(Buffer {
            size: info.size,
            usage: info.usage,
            requirements,
            binding: OnceLock::new(),
        });
        tracing::debug!(?handle, size = info.size, usage = ?info.usage, "Created buffer");
        Ok(handle)
    }

    pub fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.buffers.remove(buffer)?;
        self.ctx
            .invalidate_references(ObjectKey::of(ObjectKind::Buffer, buffer));
        tracing::debug!(?buffer, "Destroyed buffer");
        Ok(())
    }

    /// Create an unbound image.
    pub fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        self.ctx.check_lost()?;
        self.validate_image_info(info)?;

        let (subresources, size) = plan_subresources(info);
        let alignment = match info.tiling {
            ImageTiling::Optimal => 256,
            ImageTiling::Linear => align_up(u64::from(info.format.texel_size()), SUBRESOURCE_ALIGNMENT),
        };
        let requirements = MemoryRequirements {
            size: align_up(size, alignment),
            alignment,
            memory_type_bits: self.ctx.capabilities.memory_type_bits(),
        };
        let layouts = vec![info.initial_layout; subresources.len()];
        let handle = self.ctx.images.insert(Image {
            info: *info,
            subresources,
            requirements,
            binding: OnceLock::new(),
            layouts: Mutex::new(layouts),
        });
        tracing::debug!(
            ?handle,
            format = ?info.format,
            extent = ?info.extent,
            "Created image"
        );
        Ok(handle)
    }

    fn validate_image_info(&self, info: &ImageCreateInfo) -> Result<()> {
        let limits = &self.ctx.capabilities.limits;
        let extent = info.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(DeviceError::validation("image extent must be non-zero"));
        }
        let (max_dim, max_layers) = match info.image_type {
            ImageType::Type1D if extent.height == 1 && extent.depth == 1 => {
                (limits.max_image_dimension_1d, limits.max_image_array_layers)
            }
            ImageType::Type2D if extent.depth == 1 => {
                (limits.max_image_dimension_2d, limits.max_image_array_layers)
            }
            ImageType::Type3D => (limits.max_image_dimension_3d, 1),
            _ => {
                return Err(DeviceError::validation(format!(
                    "extent {extent:?} does not fit a {:?} image",
                    info.image_type
                )))
            }
        };
        if extent.width.max(extent.height).max(extent.depth) > max_dim {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "extent {extent:?} exceeds {max_dim}"
            )));
        }
        if info.array_layers == 0 || info.array_layers > max_layers {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "{} array layers, at most {max_layers} allowed",
                info.array_layers
            )));
        }
        let largest = extent.width.max(extent.height).max(extent.depth);
        let max_mips = u32::BITS - largest.leading_zeros();
        if info.mip_levels == 0 || info.mip_levels > max_mips {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "{} mip levels, at most {max_mips} allowed",
                info.mip_levels
            )));
        }
        if info.tiling == ImageTiling::Linear
            && (info.mip_levels != 1 || info.array_layers != 1 || info.image_type != ImageType::Type2D)
        {
            return Err(DeviceError::Unsupported(
                "linear images must be single-level, single-layer 2D".into(),
            ));
        }
        if !matches!(
            info.initial_layout,
            ImageLayout::Undefined | ImageLayout::Preinitialized
        ) {
            return Err(DeviceError::validation(
                "initial layout must be Undefined or Preinitialized",
            ));
        }
        if info.usage.is_empty() {
            return Err(DeviceError::validation("image usage must not be empty"));
        }
        if info.usage.contains(ImageUsageFlags::COLOR_ATTACHMENT) && !info.format.is_color() {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "{:?} cannot be a color attachment",
                info.format
            )));
        }
        if info.usage.contains(ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) && info.format.is_color() {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "{:?} cannot be a depth/stencil attachment",
                info.format
            )));
        }
        Ok(())
    }

    pub fn destroy_image(&self, image: ImageHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.images.remove(image)?;
        self.ctx
            .invalidate_references(ObjectKey::of(ObjectKind::Image, image));
        tracing::debug!(?image, "Destroyed image");
        Ok(())
    }

    fn memory_binding(
        &self,
        memory: MemoryHandle,
        offset: u64,
        requirements: MemoryRequirements,
    ) -> Result<MemoryBinding> {
        let allocation = self.ctx.memory.get(memory)?;
        let type_bit = 1u32
            .checked_shl(allocation.memory_type_index())
            .unwrap_or(0);
        if requirements.memory_type_bits & type_bit == 0 {
            return Err(DeviceError::validation("memory type not allowed for resource"));
        }
        if offset % requirements.alignment != 0 {
            return Err(DeviceError::validation(format!(
                "offset {offset} is not a multiple of {}",
                requirements.alignment
            )));
        }
        checked_range(offset, requirements.size, allocation.size(), "binding")?;
        Ok(MemoryBinding {
            memory: allocation,
            handle: memory,
            offset,
        })
    }

    /// Attach memory to a buffer. A buffer can be bound once.
    pub fn bind_buffer_memory(&self, buffer: BufferHandle, memory: MemoryHandle, offset: u64) -> Result<()> {
        self.ctx.check_lost()?;
        let resource = self.ctx.buffers.get(buffer)?;
        let binding = self.memory_binding(memory, offset, resource.requirements)?;
        resource
            .binding
            .set(binding)
            .map_err(|_| DeviceError::validation("buffer is already bound"))?;
        tracing::trace!(?buffer, ?memory, offset, "Bound buffer memory");
        Ok(())
    }

    /// Attach memory to an image. An image can be bound once.
    pub fn bind_image_memory(&self, image: ImageHandle, memory: MemoryHandle, offset: u64) -> Result<()> {
        self.ctx.check_lost()?;
        let resource = self.ctx.images.get(image)?;
        let binding = self.memory_binding(memory, offset, resource.requirements)?;
        resource
            .binding
            .set(binding)
            .map_err(|_| DeviceError::validation("image is already bound"))?;
        tracing::trace!(?image, ?memory, offset, "Bound image memory");
        Ok(())
    }

    /// Write bytes into a buffer bound to host-visible memory.
    pub fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.ctx.check_lost()?;
        let resource = self.ctx.buffers.get(buffer)?;
        host_visible(resource.binding()?)?;
        resource.write(offset, data)
    }

    /// Read bytes from a buffer bound to host-visible memory.
    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.ctx.check_lost()?;
        let resource = self.ctx.buffers.get(buffer)?;
        host_visible(resource.binding()?)?;
        resource.read(offset, len)
    }

    /// Placement of a subresource of a linear image.
    pub fn get_image_subresource_layout(
        &self,
        image: ImageHandle,
        aspect: ImageAspectFlags,
        mip_level: u32,
        array_layer: u32,
    ) -> Result<SubresourceLayout> {
        self.ctx.check_lost()?;
        let image = self.ctx.images.get(image)?;
        if image.info.tiling != ImageTiling::Linear {
            return Err(DeviceError::validation(
                "subresource layout is only defined for linear images",
            ));
        }
        if aspect.bits().count_ones() != 1 || !image.format().aspects().contains(aspect) {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "aspect {aspect:?} of {:?}",
                image.format()
            )));
        }
        image.subresource(mip_level, array_layer)
    }

    /// Current layout of one subresource.
    pub fn get_image_layout(&self, image: ImageHandle, mip_level: u32, array_layer: u32) -> Result<ImageLayout> {
        self.ctx.check_lost()?;
        self.ctx.images.get(image)?.layout(mip_level, array_layer)
    }

    pub fn create_buffer_view(
        &self,
        buffer: BufferHandle,
        format: Format,
        offset: u64,
        range: u64,
    ) -> Result<BufferViewHandle> {
        self.ctx.check_lost()?;
        let resource = self.ctx.buffers.get(buffer)?;
        resource.binding()?;
        if !resource
            .usage
            .intersects(BufferUsageFlags::UNIFORM_TEXEL_BUFFER | BufferUsageFlags::STORAGE_TEXEL_BUFFER)
        {
            return Err(DeviceError::InvalidFormatOrRange(
                "buffer was not created for texel buffer usage".into(),
            ));
        }
        if !format.is_color() {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "{format:?} is not a texel buffer format"
            )));
        }
        let texel_size = u64::from(format.texel_size());
        let range = resource.resolve_range(offset, range)?;
        let len = (range.end - range.start) / texel_size * texel_size;
        if offset % texel_size != 0 || len == 0 {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "range {range:?} does not hold whole {format:?} texels"
            )));
        }

        let handle = self.ctx.buffer_views.insert(BufferView {
            buffer: resource,
            buffer_handle: buffer,
            format,
            offset,
            range: len,
        });
        tracing::debug!(?handle, ?format, "Created buffer view");
        Ok(handle)
    }

    pub fn destroy_buffer_view(&self, view: BufferViewHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.buffer_views.remove(view)?;
        self.ctx
            .invalidate_references(ObjectKey::of(ObjectKind::BufferView, view));
        Ok(())
    }

    pub fn create_image_view(
        &self,
        image: ImageHandle,
        view_type: ImageViewType,
        format: Format,
        subresource_range: &ImageSubresourceRange,
    ) -> Result<ImageViewHandle> {
        self.ctx.check_lost()?;
        let resource = self.ctx.images.get(image)?;
        resource.binding()?;
        let image_format = resource.format();
        if format.texel_size() != image_format.texel_size()
            || format.aspects() != image_format.aspects()
        {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "{format:?} cannot reinterpret {image_format:?}"
            )));
        }
        let range = resource.resolve(subresource_range)?;

        let type_fits = match (view_type, resource.info.image_type) {
            (ImageViewType::Type1D, ImageType::Type1D)
            | (ImageViewType::Type2DArray, ImageType::Type1D | ImageType::Type2D) => true,
            (ImageViewType::Type2D, ImageType::Type2D) => range.layers.len() == 1,
            (ImageViewType::Type3D, ImageType::Type3D) => true,
            _ => false,
        };
        if !type_fits {
            return Err(DeviceError::InvalidFormatOrRange(format!(
                "{view_type:?} view of a {:?} image with {} layers",
                resource.info.image_type,
                range.layers.len()
            )));
        }

        let handle = self.ctx.image_views.insert(ImageView {
            image: resource,
            image_handle: image,
            view_type,
            format,
            range,
        });
        tracing::debug!(?handle, ?format, "Created image view");
        Ok(handle)
    }

    pub fn destroy_image_view(&self, view: ImageViewHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.image_views.remove(view)?;
        self.ctx
            .invalidate_references(ObjectKey::of(ObjectKind::ImageView, view));
        Ok(())
    }

    pub fn create_sampler(&self, state: SamplerState) -> Result<SamplerHandle> {
        self.ctx.check_lost()?;
        Ok(self.ctx.samplers.insert(Sampler { state }))
    }

    pub fn destroy_sampler(&self, sampler: SamplerHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.samplers.remove(sampler)?;
        self.ctx
            .invalidate_references(ObjectKey::of(ObjectKind::Sampler, sampler));
        Ok(())
    }
}

fn host_visible(binding: &MemoryBinding) -> Result<()> {
    if binding.memory.is_host_visible() {
        Ok(())
    } else {
        Err(DeviceError::MemoryMapFailed(
            "resource is bound to memory that is not host-visible".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryPropertyFlags;
    use crate::context::DeviceBuilder;
    use crate::memory::MemoryAllocateInfo;

    fn device() -> Device {
        DeviceBuilder::new().build().unwrap()
    }

    fn host_memory(device: &Device, size: u64) -> MemoryHandle {
        let caps = device.capabilities();
        let index = caps
            .find_memory_type(caps.memory_type_bits(), MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap();
        device
            .allocate_memory(&MemoryAllocateInfo {
                size,
                alignment: 256,
                memory_type_index: index,
            })
            .unwrap()
    }

    #[test]
    fn buffer_requirements_follow_usage() {
        let device = device();
        let uniform = device
            .create_buffer(&BufferCreateInfo {
                size: 100,
                usage: BufferUsageFlags::UNIFORM_BUFFER,
            })
            .unwrap();
        let vertex = device
            .create_buffer(&BufferCreateInfo {
                size: 100,
                usage: BufferUsageFlags::VERTEX_BUFFER,
            })
            .unwrap();

        let uniform = device.get_buffer_memory_requirements(uniform).unwrap();
        assert_eq!((uniform.size, uniform.alignment), (256, 256));
        let vertex = device.get_buffer_memory_requirements(vertex).unwrap();
        assert_eq!((vertex.size, vertex.alignment), (112, 16));
    }

    #[test]
    fn identical_images_have_identical_requirements() {
        let device = device();
        let info = ImageCreateInfo {
            mip_levels: 3,
            array_layers: 2,
            ..ImageCreateInfo::new_2d(Format::R8G8B8A8Unorm, 8, 4, ImageUsageFlags::SAMPLED)
        };
        let a = device.create_image(&info).unwrap();
        let b = device.create_image(&info).unwrap();
        assert_eq!(
            device.get_image_memory_requirements(a).unwrap(),
            device.get_image_memory_requirements(b).unwrap()
        );
    }

    #[test]
    fn subresources_are_layer_major() {
        let info = ImageCreateInfo {
            mip_levels: 2,
            array_layers: 2,
            ..ImageCreateInfo::new_2d(Format::R8Unorm, 6, 2, ImageUsageFlags::SAMPLED)
        };
        let (subresources, size) = plan_subresources(&info);
        // Layer 0: mip 0 at 0 (12 bytes), mip 1 at 16 (3 bytes); layer 1 starts at 32.
        let offsets: Vec<_> = subresources.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 16, 32, 48]);
        assert_eq!(subresources[0].array_pitch, 32);
        assert_eq!(subresources[1].row_pitch, 3);
        assert_eq!(size, 64);
    }

    #[test]
    fn binding_rules() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferCreateInfo {
                size: 64,
                usage: BufferUsageFlags::UNIFORM_BUFFER,
            })
            .unwrap();
        let memory = host_memory(&device, 1024);

        assert!(matches!(
            device.write_buffer(buffer, 0, &[1]),
            Err(DeviceError::AccessBeforeBind(_))
        ));
        assert!(matches!(
            device.bind_buffer_memory(buffer, memory, 64),
            Err(DeviceError::ValidationFailed(_))
        ));
        assert!(matches!(
            device.bind_buffer_memory(buffer, memory, 1024),
            Err(DeviceError::ValidationFailed(_))
        ));
        device.bind_buffer_memory(buffer, memory, 256).unwrap();
        assert!(matches!(
            device.bind_buffer_memory(buffer, memory, 512),
            Err(DeviceError::ValidationFailed(_))
        ));

        device.write_buffer(buffer, 4, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_buffer(buffer, 4, 3).unwrap(), vec![1, 2, 3]);
        assert!(device.read_buffer(buffer, 62, 3).is_err());
    }

    #[test]
    fn binding_checks_the_allocation_memory_type() {
        let device = device();
        let memory = host_memory(&device, 1024);
        let allocation = device.ctx.memory.get(memory).unwrap();
        assert_eq!(allocation.memory_type_index(), 1);

        let only = |bits| MemoryRequirements {
            size: 64,
            alignment: 64,
            memory_type_bits: bits,
        };
        assert!(device.memory_binding(memory, 0, only(0b10)).is_ok());
        assert!(matches!(
            device.memory_binding(memory, 0, only(0b01)),
            Err(DeviceError::ValidationFailed(_))
        ));
        assert!(device.memory_binding(memory, 0, only(0)).is_err());
    }

    #[test]
    fn bytes_written_through_a_mapping_are_read_through_the_buffer() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferCreateInfo {
                size: 16,
                usage: BufferUsageFlags::VERTEX_BUFFER,
            })
            .unwrap();
        let memory = host_memory(&device, 256);
        device.bind_buffer_memory(buffer, memory, 0).unwrap();

        let mapped = device.map_memory(memory, 0, WHOLE_SIZE).unwrap();
        mapped.write_bytes(0, &[255, 0, 128, 255]).unwrap();
        let resource = device.ctx.buffers.get(buffer).unwrap();
        assert_eq!(resource.read(0, 4).unwrap(), vec![255, 0, 128, 255]);

        let texel = Format::R8G8B8A8Unorm.decode(&resource.read(0, 4).unwrap()).unwrap();
        assert_eq!(texel.to_vec4().x, 1.0);
        assert_eq!(Format::R8G8B8A8Unorm.encode_to_vec(texel).unwrap()[0], 255);
    }

    #[test]
    fn linear_subresource_layout() {
        let device = device();
        let info = ImageCreateInfo {
            tiling: ImageTiling::Linear,
            ..ImageCreateInfo::new_2d(Format::R16Uint, 5, 3, ImageUsageFlags::TRANSFER_SRC)
        };
        let image = device.create_image(&info).unwrap();
        let layout = device
            .get_image_subresource_layout(image, ImageAspectFlags::COLOR, 0, 0)
            .unwrap();
        assert_eq!(layout.row_pitch, 10);
        assert_eq!(layout.size, 30);

        let optimal = device
            .create_image(&ImageCreateInfo::new_2d(
                Format::R16Uint,
                5,
                3,
                ImageUsageFlags::TRANSFER_SRC,
            ))
            .unwrap();
        assert!(device
            .get_image_subresource_layout(optimal, ImageAspectFlags::COLOR, 0, 0)
            .is_err());
    }

    #[test]
    fn image_view_rules() {
        let device = device();
        let image = device
            .create_image(&ImageCreateInfo {
                mip_levels: 2,
                ..ImageCreateInfo::new_2d(Format::R8G8B8A8Unorm, 4, 4, ImageUsageFlags::SAMPLED)
            })
            .unwrap();
        let color = ImageSubresourceRange::all(ImageAspectFlags::COLOR);

        assert!(matches!(
            device.create_image_view(image, ImageViewType::Type2D, Format::R8G8B8A8Unorm, &color),
            Err(DeviceError::AccessBeforeBind(_))
        ));

        let requirements = device.get_image_memory_requirements(image).unwrap();
        let memory = host_memory(&device, requirements.size);
        device.bind_image_memory(image, memory, 0).unwrap();

        // Same texel size reinterprets; different size does not.
        assert!(device
            .create_image_view(image, ImageViewType::Type2D, Format::R32Uint, &color)
            .is_ok());
        assert!(matches!(
            device.create_image_view(image, ImageViewType::Type2D, Format::R8Unorm, &color),
            Err(DeviceError::InvalidFormatOrRange(_))
        ));
        let past_end = ImageSubresourceRange {
            base_mip_level: 2,
            ..color
        };
        assert!(matches!(
            device.create_image_view(image, ImageViewType::Type2D, Format::R8G8B8A8Unorm, &past_end),
            Err(DeviceError::InvalidFormatOrRange(_))
        ));
        let depth = ImageSubresourceRange::all(ImageAspectFlags::DEPTH);
        assert!(device
            .create_image_view(image, ImageViewType::Type2D, Format::R8G8B8A8Unorm, &depth)
            .is_err());
    }

    #[test]
    fn image_creation_is_validated() {
        let device = device();
        let zero = ImageCreateInfo::new_2d(Format::R8Unorm, 0, 4, ImageUsageFlags::SAMPLED);
        assert!(device.create_image(&zero).is_err());

        let depth_as_color =
            ImageCreateInfo::new_2d(Format::D32Sfloat, 4, 4, ImageUsageFlags::COLOR_ATTACHMENT);
        assert!(matches!(
            device.create_image(&depth_as_color),
            Err(DeviceError::InvalidFormatOrRange(_))
        ));

        let too_many_mips = ImageCreateInfo {
            mip_levels: 4,
            ..ImageCreateInfo::new_2d(Format::R8Unorm, 4, 4, ImageUsageFlags::SAMPLED)
        };
        assert!(device.create_image(&too_many_mips).is_err());

        let image = device
            .create_image(&ImageCreateInfo {
                initial_layout: ImageLayout::Preinitialized,
                ..ImageCreateInfo::new_2d(Format::R8Unorm, 4, 4, ImageUsageFlags::SAMPLED)
            })
            .unwrap();
        assert_eq!(
            device.get_image_layout(image, 0, 0).unwrap(),
            ImageLayout::Preinitialized
        );
    }

    #[test]
    fn texel_buffer_view_covers_whole_texels() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferCreateInfo {
                size: 18,
                usage: BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
            })
            .unwrap();
        let memory = host_memory(&device, 256);
        device.bind_buffer_memory(buffer, memory, 0).unwrap();

        let view = device
            .create_buffer_view(buffer, Format::R32Sfloat, 4, WHOLE_SIZE)
            .unwrap();
        let view = device.ctx.buffer_views.get(view).unwrap();
        assert_eq!(view.texel_count(), 3);
        assert!(device
            .create_buffer_view(buffer, Format::R32Sfloat, 2, WHOLE_SIZE)
            .is_err());
        assert!(device
            .create_buffer_view(buffer, Format::D32Sfloat, 0, WHOLE_SIZE)
            .is_err());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let device = device();
        let info = BufferCreateInfo {
            size: 16,
            usage: BufferUsageFlags::VERTEX_BUFFER,
        };
        let first = device.create_buffer(&info).unwrap();
        device.destroy_buffer(first).unwrap();
        let second = device.create_buffer(&info).unwrap();

        assert_eq!(first.index(), second.index());
        assert!(matches!(
            device.get_buffer_memory_requirements(first),
            Err(DeviceError::InvalidHandle { .. })
        ));
        assert!(device.get_buffer_memory_requirements(second).is_ok());
    }
}
