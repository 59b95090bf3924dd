//! Transfer commands: copies, fills, updates and image clears.
//!
//! Recording validates usage, ranges and declared layouts. Replay moves the
//! bytes. Depth and stencil aspects are copied through their single-aspect
//! formats, so a buffer holding the depth of a `D24UnormS8Uint` image uses
//! `X8D24UnormPack32` texels and a stencil copy uses `S8Uint`.

use crate::command::{Command, CommandBufferHandle, ImageRef};
use crate::context::Device;
use crate::error::{DeviceError, Result};
use crate::memory::WHOLE_SIZE;
use crate::resource::{
    Buffer, BufferHandle, BufferUsageFlags, Image, ImageHandle, ImageLayout,
    ImageSubresourceLayers, ImageSubresourceRange, ImageUsageFlags, ResolvedRange,
};
use tessera_core::{
    ClearColorValue, ClearDepthStencilValue, Extent3D, Format, ImageAspectFlags, Offset3D,
};

/// Largest payload accepted by `cmd_update_buffer`.
pub const MAX_UPDATE_BUFFER_SIZE: usize = 65536;

pub(crate) const SRC_LAYOUTS: &[ImageLayout] = &[ImageLayout::TransferSrcOptimal, ImageLayout::General];
pub(crate) const DST_LAYOUTS: &[ImageLayout] = &[ImageLayout::TransferDstOptimal, ImageLayout::General];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCopy {
    pub src_subresource: ImageSubresourceLayers,
    pub src_offset: Offset3D,
    pub dst_subresource: ImageSubresourceLayers,
    pub dst_offset: Offset3D,
    pub extent: Extent3D,
}

/// Region of a buffer/image copy.
///
/// A `buffer_row_length` or `buffer_image_height` of zero means the buffer
/// is tightly packed to the image extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub buffer_row_length: u32,
    pub buffer_image_height: u32,
    pub image_subresource: ImageSubresourceLayers,
    pub image_offset: Offset3D,
    pub image_extent: Extent3D,
}

impl BufferImageCopy {
    /// Tightly packed copy of a whole 2D mip level.
    pub const fn whole(aspect: ImageAspectFlags, width: u32, height: u32) -> Self {
        Self {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: ImageSubresourceLayers::base(aspect),
            image_offset: Offset3D::new(0, 0, 0),
            image_extent: Extent3D::new(width, height, 1),
        }
    }

    fn row_length(&self) -> u32 {
        if self.buffer_row_length == 0 {
            self.image_extent.width
        } else {
            self.buffer_row_length
        }
    }

    fn image_height(&self) -> u32 {
        if self.buffer_image_height == 0 {
            self.image_extent.height
        } else {
            self.buffer_image_height
        }
    }

    /// Byte offset of row `y` of slice `slice` in the buffer.
    fn row_offset(&self, texel_size: u64, slice: u32, y: u32) -> u64 {
        let rows = u64::from(slice) * u64::from(self.image_height()) + u64::from(y);
        self.buffer_offset + rows * u64::from(self.row_length()) * texel_size
    }
}

/// Format of the texels of a single aspect of `format`.
pub(crate) fn aspect_format(format: Format, aspect: ImageAspectFlags) -> Result<Format> {
    match aspect {
        ImageAspectFlags::COLOR if format.is_color() => Ok(format),
        ImageAspectFlags::DEPTH if format.has_depth() => Ok(match format {
            Format::D24UnormS8Uint => Format::X8D24UnormPack32,
            Format::D32SfloatS8Uint => Format::D32Sfloat,
            other => other,
        }),
        ImageAspectFlags::STENCIL if format.has_stencil() => Ok(Format::S8Uint),
        _ => Err(DeviceError::InvalidFormatOrRange(format!(
            "{format:?} has no single aspect {aspect:?}"
        ))),
    }
}

/// Rows of texels in a byte array.
struct Plane {
    format: Format,
    row_pitch: usize,
}

impl Plane {
    fn at(&self, x: u32, y: u32) -> usize {
        y as usize * self.row_pitch + x as usize * self.format.texel_size() as usize
    }
}

/// Copy a `width` by `height` block of one aspect between two planes.
#[allow(clippy::too_many_arguments)]
fn copy_block(
    src: &[u8],
    src_plane: &Plane,
    src_origin: (u32, u32),
    dst: &mut [u8],
    dst_plane: &Plane,
    dst_origin: (u32, u32),
    (width, height): (u32, u32),
    aspect: ImageAspectFlags,
) -> Result<()> {
    let src_size = src_plane.format.texel_size() as usize;
    let dst_size = dst_plane.format.texel_size() as usize;
    for y in 0..height {
        if aspect == ImageAspectFlags::COLOR {
            let s = src_plane.at(src_origin.0, src_origin.1 + y);
            let d = dst_plane.at(dst_origin.0, dst_origin.1 + y);
            let len = width as usize * src_size;
            dst[d..d + len].copy_from_slice(&src[s..s + len]);
            continue;
        }
        for x in 0..width {
            let s = src_plane.at(src_origin.0 + x, src_origin.1 + y);
            let d = dst_plane.at(dst_origin.0 + x, dst_origin.1 + y);
            let (src_texel, dst_texel) = (&src[s..s + src_size], &mut dst[d..d + dst_size]);
            if aspect == ImageAspectFlags::DEPTH {
                let depth = src_plane.format.read_depth(src_texel)?;
                dst_plane.format.write_depth(dst_texel, depth)?;
            } else {
                let stencil = src_plane.format.read_stencil(src_texel)?;
                dst_plane.format.write_stencil(dst_texel, stencil)?;
            }
        }
    }
    Ok(())
}

fn single_aspect(layers: &ImageSubresourceLayers) -> Result<ImageAspectFlags> {
    if layers.aspect_mask.bits().count_ones() != 1 {
        return Err(DeviceError::validation(format!(
            "copies address exactly one aspect, got {:?}",
            layers.aspect_mask
        )));
    }
    Ok(layers.aspect_mask)
}

/// Check that a copy region lies inside one mip level of `image`.
fn check_image_region(
    image: &Image,
    layers: &ImageSubresourceLayers,
    offset: Offset3D,
    extent: Extent3D,
) -> Result<ResolvedRange> {
    single_aspect(layers)?;
    let range = image.resolve_layers(layers)?;
    let mip = image.extent().mip(layers.mip_level);
    let fits = |offset: i32, len: u32, size: u32| {
        u32::try_from(offset).is_ok_and(|o| len > 0 && u64::from(o) + u64::from(len) <= u64::from(size))
    };
    if !(fits(offset.x, extent.width, mip.width)
        && fits(offset.y, extent.height, mip.height)
        && fits(offset.z, extent.depth, mip.depth))
    {
        return Err(DeviceError::InvalidFormatOrRange(format!(
            "region {offset:?}+{extent:?} outside mip {} of {mip:?}",
            layers.mip_level
        )));
    }
    Ok(range)
}

fn check_layout(layout: ImageLayout, allowed: &[ImageLayout], what: &str) -> Result<()> {
    if allowed.contains(&layout) {
        Ok(())
    } else {
        Err(DeviceError::validation(format!(
            "{what} must be in {allowed:?}, not {layout:?}"
        )))
    }
}

fn check_buffer_image_region(buffer: &Buffer, image: &Image, region: &BufferImageCopy) -> Result<()> {
    let aspect = single_aspect(&region.image_subresource)?;
    check_image_region(
        image,
        &region.image_subresource,
        region.image_offset,
        region.image_extent,
    )?;
    let texel_size = u64::from(aspect_format(image.format(), aspect)?.texel_size());
    let alignment = if aspect == ImageAspectFlags::COLOR {
        texel_size
    } else {
        4
    };
    if region.buffer_offset % alignment != 0 {
        return Err(DeviceError::validation(format!(
            "buffer offset {} is not a multiple of {alignment}",
            region.buffer_offset
        )));
    }
    if region.row_length() < region.image_extent.width
        || region.image_height() < region.image_extent.height
    {
        return Err(DeviceError::validation(
            "buffer row length and image height must cover the copied extent",
        ));
    }
    let slices = region.image_subresource.layer_count * region.image_extent.depth;
    let end = region.row_offset(texel_size, slices - 1, region.image_extent.height - 1)
        + u64::from(region.image_extent.width) * texel_size;
    if end > buffer.size() {
        return Err(DeviceError::InvalidFormatOrRange(format!(
            "copy ends at byte {end}, buffer has {}",
            buffer.size()
        )));
    }
    Ok(())
}

fn ranges_overlap(a: u64, b: u64, size: u64) -> bool {
    a < b + size && b < a + size
}

impl Device {
    pub fn cmd_copy_buffer(
        &self,
        cb: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) -> Result<()> {
        let src = self.buffer_ref(src, BufferUsageFlags::TRANSFER_SRC)?;
        let dst = self.buffer_ref(dst, BufferUsageFlags::TRANSFER_DST)?;
        for region in regions {
            if region.size == 0 {
                return Err(DeviceError::validation("buffer copy of zero bytes"));
            }
            src.buffer.resolve_range(region.src_offset, region.size)?;
            dst.buffer.resolve_range(region.dst_offset, region.size)?;
            if src.handle == dst.handle
                && ranges_overlap(region.src_offset, region.dst_offset, region.size)
            {
                return Err(DeviceError::validation("source and destination regions overlap"));
            }
        }
        self.record(cb, |rec| {
            rec.outside_rendering("copy buffer")?;
            rec.reference_buffer(&src);
            rec.reference_buffer(&dst);
            rec.push(Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            });
            Ok(())
        })
    }

    pub fn cmd_copy_image(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        regions: &[ImageCopy],
    ) -> Result<()> {
        check_layout(src_layout, SRC_LAYOUTS, "copy source")?;
        check_layout(dst_layout, DST_LAYOUTS, "copy destination")?;
        let src = self.image_ref(src, ImageUsageFlags::TRANSFER_SRC)?;
        let dst = self.image_ref(dst, ImageUsageFlags::TRANSFER_DST)?;
        for region in regions {
            check_image_region(&src.image, &region.src_subresource, region.src_offset, region.extent)?;
            check_image_region(&dst.image, &region.dst_subresource, region.dst_offset, region.extent)?;
            let aspect = region.src_subresource.aspect_mask;
            if aspect != region.dst_subresource.aspect_mask
                || region.src_subresource.layer_count != region.dst_subresource.layer_count
            {
                return Err(DeviceError::validation(
                    "image copy must use the same aspect and layer count on both sides",
                ));
            }
            let compatible = if aspect == ImageAspectFlags::COLOR {
                src.image.format().texel_size() == dst.image.format().texel_size()
            } else {
                src.image.format() == dst.image.format()
            };
            if !compatible {
                return Err(DeviceError::InvalidFormatOrRange(format!(
                    "cannot copy {:?} into {:?}",
                    src.image.format(),
                    dst.image.format()
                )));
            }
        }
        self.record(cb, |rec| {
            rec.outside_rendering("copy image")?;
            rec.reference_image(&src);
            rec.reference_image(&dst);
            rec.push(Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            });
            Ok(())
        })
    }

    pub fn cmd_copy_buffer_to_image(
        &self,
        cb: CommandBufferHandle,
        src: BufferHandle,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        regions: &[BufferImageCopy],
    ) -> Result<()> {
        check_layout(dst_layout, DST_LAYOUTS, "copy destination")?;
        let src = self.buffer_ref(src, BufferUsageFlags::TRANSFER_SRC)?;
        let dst = self.image_ref(dst, ImageUsageFlags::TRANSFER_DST)?;
        for region in regions {
            check_buffer_image_region(&src.buffer, &dst.image, region)?;
        }
        self.record(cb, |rec| {
            rec.outside_rendering("copy buffer to image")?;
            rec.reference_buffer(&src);
            rec.reference_image(&dst);
            rec.push(Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            });
            Ok(())
        })
    }

    pub fn cmd_copy_image_to_buffer(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: BufferHandle,
        regions: &[BufferImageCopy],
    ) -> Result<()> {
        check_layout(src_layout, SRC_LAYOUTS, "copy source")?;
        let src = self.image_ref(src, ImageUsageFlags::TRANSFER_SRC)?;
        let dst = self.buffer_ref(dst, BufferUsageFlags::TRANSFER_DST)?;
        for region in regions {
            check_buffer_image_region(&dst.buffer, &src.image, region)?;
        }
        self.record(cb, |rec| {
            rec.outside_rendering("copy image to buffer")?;
            rec.reference_image(&src);
            rec.reference_buffer(&dst);
            rec.push(Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions: regions.to_vec(),
            });
            Ok(())
        })
    }

    /// Fill a range with a repeated 32-bit word. `WHOLE_SIZE` runs to the
    /// end of the buffer, rounded down to a multiple of four.
    pub fn cmd_fill_buffer(
        &self,
        cb: CommandBufferHandle,
        dst: BufferHandle,
        offset: u64,
        size: u64,
        data: u32,
    ) -> Result<()> {
        let dst = self.buffer_ref(dst, BufferUsageFlags::TRANSFER_DST)?;
        let size = if size == WHOLE_SIZE {
            dst.buffer.size().saturating_sub(offset) & !3
        } else {
            size
        };
        if offset % 4 != 0 || size % 4 != 0 || size == 0 {
            return Err(DeviceError::validation(format!(
                "fill {offset}+{size} must be a non-empty multiple of 4 bytes"
            )));
        }
        dst.buffer.resolve_range(offset, size)?;
        self.record(cb, |rec| {
            rec.outside_rendering("fill buffer")?;
            rec.reference_buffer(&dst);
            rec.push(Command::FillBuffer {
                dst,
                offset,
                size,
                data,
            });
            Ok(())
        })
    }

    /// Write inline data captured at record time.
    pub fn cmd_update_buffer(
        &self,
        cb: CommandBufferHandle,
        dst: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        if offset % 4 != 0 || data.len() % 4 != 0 || data.is_empty() || data.len() > MAX_UPDATE_BUFFER_SIZE {
            return Err(DeviceError::validation(format!(
                "update of {} bytes at {offset} must be 4-byte aligned and at most {MAX_UPDATE_BUFFER_SIZE} bytes",
                data.len()
            )));
        }
        let dst = self.buffer_ref(dst, BufferUsageFlags::TRANSFER_DST)?;
        dst.buffer.resolve_range(offset, data.len() as u64)?;
        self.record(cb, |rec| {
            rec.outside_rendering("update buffer")?;
            rec.reference_buffer(&dst);
            rec.push(Command::UpdateBuffer {
                dst,
                offset,
                data: data.to_vec(),
            });
            Ok(())
        })
    }

    pub fn cmd_clear_color_image(
        &self,
        cb: CommandBufferHandle,
        image: ImageHandle,
        layout: ImageLayout,
        color: ClearColorValue,
        ranges: &[ImageSubresourceRange],
    ) -> Result<()> {
        check_layout(layout, DST_LAYOUTS, "cleared image")?;
        let image = self.image_ref(image, ImageUsageFlags::TRANSFER_DST)?;
        if !image.image.format().is_color() {
            return Err(DeviceError::validation(format!(
                "color clear of {:?}",
                image.image.format()
            )));
        }
        let ranges = self.resolve_ranges(&image, ranges)?;
        self.record(cb, |rec| {
            rec.outside_rendering("clear color image")?;
            rec.reference_image(&image);
            rec.push(Command::ClearColorImage {
                image,
                layout,
                color,
                ranges,
            });
            Ok(())
        })
    }

    pub fn cmd_clear_depth_stencil_image(
        &self,
        cb: CommandBufferHandle,
        image: ImageHandle,
        layout: ImageLayout,
        value: ClearDepthStencilValue,
        ranges: &[ImageSubresourceRange],
    ) -> Result<()> {
        check_layout(layout, DST_LAYOUTS, "cleared image")?;
        if !(0.0..=1.0).contains(&value.depth) {
            return Err(DeviceError::validation(format!(
                "clear depth {} outside [0, 1]",
                value.depth
            )));
        }
        let image = self.image_ref(image, ImageUsageFlags::TRANSFER_DST)?;
        if image.image.format().is_color() {
            return Err(DeviceError::validation(format!(
                "depth/stencil clear of {:?}",
                image.image.format()
            )));
        }
        let ranges = self.resolve_ranges(&image, ranges)?;
        self.record(cb, |rec| {
            rec.outside_rendering("clear depth/stencil image")?;
            rec.reference_image(&image);
            rec.push(Command::ClearDepthStencilImage {
                image,
                layout,
                value,
                ranges,
            });
            Ok(())
        })
    }

    fn resolve_ranges(
        &self,
        image: &ImageRef,
        ranges: &[ImageSubresourceRange],
    ) -> Result<Vec<ResolvedRange>> {
        if ranges.is_empty() {
            return Err(DeviceError::validation("clear without subresource ranges"));
        }
        ranges.iter().map(|r| image.image.resolve(r)).collect()
    }
}

pub(crate) fn copy_buffer(src: &Buffer, dst: &Buffer, regions: &[BufferCopy]) -> Result<()> {
    for region in regions {
        let bytes = src.read(region.src_offset, region.size)?;
        dst.write(region.dst_offset, &bytes)?;
    }
    Ok(())
}

pub(crate) fn copy_image(src: &Image, dst: &Image, regions: &[ImageCopy]) -> Result<()> {
    for region in regions {
        let aspect = region.src_subresource.aspect_mask;
        let src_plane = slice_plane(src, region.src_subresource.mip_level, aspect)?;
        let dst_plane = slice_plane(dst, region.dst_subresource.mip_level, aspect)?;
        for layer in 0..region.src_subresource.layer_count {
            for z in 0..region.extent.depth {
                let bytes = src.slice_to_vec(
                    region.src_subresource.mip_level,
                    region.src_subresource.base_array_layer + layer,
                    region.src_offset.z as u32 + z,
                )?;
                dst.with_slice_mut(
                    region.dst_subresource.mip_level,
                    region.dst_subresource.base_array_layer + layer,
                    region.dst_offset.z as u32 + z,
                    |out| {
                        copy_block(
                            &bytes,
                            &src_plane,
                            (region.src_offset.x as u32, region.src_offset.y as u32),
                            out,
                            &dst_plane,
                            (region.dst_offset.x as u32, region.dst_offset.y as u32),
                            (region.extent.width, region.extent.height),
                            aspect,
                        )
                    },
                )??;
            }
        }
    }
    Ok(())
}

/// Plane over a slice of `image` at `mip`. Depth/stencil copies read the
/// slice in the image format and convert per texel.
fn slice_plane(image: &Image, mip: u32, aspect: ImageAspectFlags) -> Result<Plane> {
    aspect_format(image.format(), aspect)?;
    let width = image.extent().mip(mip).width as usize;
    Ok(Plane {
        format: image.format(),
        row_pitch: width * image.format().texel_size() as usize,
    })
}

/// Plane over the part of the buffer covering one slice of `region`.
fn buffer_plane(image: &Image, region: &BufferImageCopy) -> Result<Plane> {
    let format = aspect_format(image.format(), region.image_subresource.aspect_mask)?;
    Ok(Plane {
        format,
        row_pitch: region.row_length() as usize * format.texel_size() as usize,
    })
}

fn buffer_slice_span(plane: &Plane, region: &BufferImageCopy, slice: u32) -> (u64, u64) {
    let texel_size = u64::from(plane.format.texel_size());
    let start = region.row_offset(texel_size, slice, 0);
    let end = region.row_offset(texel_size, slice, region.image_extent.height - 1)
        + u64::from(region.image_extent.width) * texel_size;
    (start, end - start)
}

pub(crate) fn copy_buffer_to_image(src: &Buffer, dst: &Image, regions: &[BufferImageCopy]) -> Result<()> {
    for region in regions {
        let sub = region.image_subresource;
        let src_plane = buffer_plane(dst, region)?;
        let dst_plane = slice_plane(dst, sub.mip_level, sub.aspect_mask)?;
        for layer in 0..sub.layer_count {
            for z in 0..region.image_extent.depth {
                let slice = layer * region.image_extent.depth + z;
                let (start, len) = buffer_slice_span(&src_plane, region, slice);
                let bytes = src.read(start, len)?;
                dst.with_slice_mut(
                    sub.mip_level,
                    sub.base_array_layer + layer,
                    region.image_offset.z as u32 + z,
                    |out| {
                        copy_block(
                            &bytes,
                            &src_plane,
                            (0, 0),
                            out,
                            &dst_plane,
                            (region.image_offset.x as u32, region.image_offset.y as u32),
                            (region.image_extent.width, region.image_extent.height),
                            sub.aspect_mask,
                        )
                    },
                )??;
            }
        }
    }
    Ok(())
}

pub(crate) fn copy_image_to_buffer(src: &Image, dst: &Buffer, regions: &[BufferImageCopy]) -> Result<()> {
    for region in regions {
        let sub = region.image_subresource;
        let src_plane = slice_plane(src, sub.mip_level, sub.aspect_mask)?;
        let dst_plane = buffer_plane(src, region)?;
        for layer in 0..sub.layer_count {
            for z in 0..region.image_extent.depth {
                let slice = layer * region.image_extent.depth + z;
                let bytes = src.slice_to_vec(
                    sub.mip_level,
                    sub.base_array_layer + layer,
                    region.image_offset.z as u32 + z,
                )?;
                let (start, len) = buffer_slice_span(&dst_plane, region, slice);
                dst.with_bytes_mut(start, len, |out| {
                    copy_block(
                        &bytes,
                        &src_plane,
                        (region.image_offset.x as u32, region.image_offset.y as u32),
                        out,
                        &dst_plane,
                        (0, 0),
                        (region.image_extent.width, region.image_extent.height),
                        sub.aspect_mask,
                    )
                })??;
            }
        }
    }
    Ok(())
}

pub(crate) fn fill_buffer(dst: &Buffer, offset: u64, size: u64, data: u32) -> Result<()> {
    let word = data.to_le_bytes();
    dst.with_bytes_mut(offset, size, |out| {
        for chunk in out.chunks_exact_mut(4) {
            chunk.copy_from_slice(&word);
        }
    })
}

/// Call `f` for every 2D slice of every subresource in `ranges`.
fn for_each_slice(
    image: &Image,
    ranges: &[ResolvedRange],
    mut f: impl FnMut(&ResolvedRange, u32, u32, u32) -> Result<()>,
) -> Result<()> {
    for range in ranges {
        for layer in range.layers.clone() {
            for mip in range.mips.clone() {
                for z in 0..image.extent().mip(mip).depth {
                    f(range, mip, layer, z)?;
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn clear_color_image(image: &Image, color: ClearColorValue, ranges: &[ResolvedRange]) -> Result<()> {
    let encoded = image.format().encode_to_vec(color.into())?;
    for_each_slice(image, ranges, |_, mip, layer, z| {
        image.with_slice_mut(mip, layer, z, |out| {
            for texel in out.chunks_exact_mut(encoded.len()) {
                texel.copy_from_slice(&encoded);
            }
        })
    })
}

pub(crate) fn clear_depth_stencil_image(
    image: &Image,
    value: ClearDepthStencilValue,
    ranges: &[ResolvedRange],
) -> Result<()> {
    let format = image.format();
    let size = format.texel_size() as usize;
    for_each_slice(image, ranges, |range, mip, layer, z| {
        image.with_slice_mut(mip, layer, z, |out| -> Result<()> {
            for texel in out.chunks_exact_mut(size) {
                if range.aspects.contains(ImageAspectFlags::DEPTH) {
                    format.write_depth(texel, value.depth)?;
                }
                if range.aspects.contains(ImageAspectFlags::STENCIL) {
                    format.write_stencil(texel, value.stencil as u8)?;
                }
            }
            Ok(())
        })?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryPropertyFlags;
    use crate::command::{CommandPoolCreateFlags, CommandPoolHandle};
    use crate::context::DeviceBuilder;
    use crate::memory::{MemoryAllocateInfo, MemoryHandle};
    use crate::queue::Queue;
    use crate::resource::{BufferCreateInfo, ImageCreateInfo};

    struct Fixture {
        device: Device,
        pool: CommandPoolHandle,
        queue: Queue,
    }

    impl Fixture {
        fn new() -> Self {
            let device = DeviceBuilder::new().validation(true).build().unwrap();
            let pool = device
                .create_command_pool(0, CommandPoolCreateFlags::TRANSIENT)
                .unwrap();
            let queue = device.get_queue(0, 0).unwrap();
            Self { device, pool, queue }
        }

        fn memory(&self, size: u64) -> MemoryHandle {
            let caps = self.device.capabilities();
            let index = caps
                .find_memory_type(caps.memory_type_bits(), MemoryPropertyFlags::HOST_VISIBLE)
                .unwrap();
            self.device
                .allocate_memory(&MemoryAllocateInfo {
                    size,
                    alignment: 256,
                    memory_type_index: index,
                })
                .unwrap()
        }

        fn buffer(&self, size: u64) -> BufferHandle {
            let buffer = self
                .device
                .create_buffer(&BufferCreateInfo {
                    size,
                    usage: BufferUsageFlags::TRANSFER_SRC | BufferUsageFlags::TRANSFER_DST,
                })
                .unwrap();
            let size = self.device.get_buffer_memory_requirements(buffer).unwrap().size;
            let memory = self.memory(size);
            self.device.bind_buffer_memory(buffer, memory, 0).unwrap();
            buffer
        }

        fn image(&self, format: Format, width: u32, height: u32) -> ImageHandle {
            let usage = ImageUsageFlags::TRANSFER_SRC | ImageUsageFlags::TRANSFER_DST;
            let image = self
                .device
                .create_image(&ImageCreateInfo::new_2d(format, width, height, usage))
                .unwrap();
            let size = self.device.get_image_memory_requirements(image).unwrap().size;
            let memory = self.memory(size);
            self.device.bind_image_memory(image, memory, 0).unwrap();
            image
        }

        fn run(&self, f: impl FnOnce(&Device, CommandBufferHandle) -> Result<()>) {
            self.device
                .execute_single_time_commands(self.pool, self.queue, f)
                .unwrap();
        }

        fn to_transfer_dst(&self, cb: CommandBufferHandle, image: ImageHandle, aspect: ImageAspectFlags) -> Result<()> {
            use crate::command::ImageMemoryBarrier;
            use crate::hazard::{AccessFlags, PipelineStageFlags};
            self.device.cmd_pipeline_barrier(
                cb,
                PipelineStageFlags::TOP_OF_PIPE,
                PipelineStageFlags::TRANSFER,
                &[],
                &[],
                &[ImageMemoryBarrier {
                    src_access_mask: AccessFlags::empty(),
                    dst_access_mask: AccessFlags::TRANSFER_WRITE,
                    old_layout: ImageLayout::Undefined,
                    new_layout: ImageLayout::General,
                    image,
                    subresource_range: ImageSubresourceRange::all(aspect),
                }],
            )
        }
    }

    #[test]
    fn buffer_copy_fill_and_update() {
        let fx = Fixture::new();
        let a = fx.buffer(64);
        let b = fx.buffer(64);
        fx.device.write_buffer(a, 0, &[7; 16]).unwrap();

        fx.run(|device, cb| {
            device.cmd_fill_buffer(cb, b, 0, WHOLE_SIZE, 0xAABB_CCDD)?;
            device.cmd_copy_buffer(
                cb,
                a,
                b,
                &[BufferCopy {
                    src_offset: 0,
                    dst_offset: 8,
                    size: 8,
                }],
            )?;
            device.cmd_update_buffer(cb, b, 60, &[1, 2, 3, 4])
        });

        let bytes = fx.device.read_buffer(b, 0, 64).unwrap();
        assert_eq!(&bytes[0..4], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(&bytes[8..16], &[7; 8]);
        assert_eq!(&bytes[60..64], &[1, 2, 3, 4]);
    }

    #[test]
    fn record_time_rules() {
        let fx = Fixture::new();
        let buffer = fx.buffer(64);
        let cb = fx.device.allocate_command_buffers(fx.pool, 1).unwrap()[0];
        fx.device
            .begin_command_buffer(cb, crate::command::CommandBufferUsageFlags::empty())
            .unwrap();

        assert!(fx.device.cmd_fill_buffer(cb, buffer, 2, 4, 0).is_err());
        assert!(fx.device.cmd_update_buffer(cb, buffer, 0, &[0; 3]).is_err());
        assert!(fx
            .device
            .cmd_update_buffer(cb, buffer, 0, &vec![0; MAX_UPDATE_BUFFER_SIZE + 4])
            .is_err());
        assert!(matches!(
            fx.device.cmd_fill_buffer(cb, buffer, 32, 64, 0),
            Err(DeviceError::InvalidFormatOrRange(_))
        ));
        assert!(matches!(
            fx.device.cmd_update_buffer(cb, buffer, 60, &[0; 8]),
            Err(DeviceError::InvalidFormatOrRange(_))
        ));
        let past_end = BufferCopy {
            src_offset: 0,
            dst_offset: 48,
            size: 32,
        };
        assert!(matches!(
            fx.device.cmd_copy_buffer(cb, buffer, fx.buffer(64), &[past_end]),
            Err(DeviceError::InvalidFormatOrRange(_))
        ));
        let overlapping = BufferCopy {
            src_offset: 0,
            dst_offset: 4,
            size: 8,
        };
        assert!(fx
            .device
            .cmd_copy_buffer(cb, buffer, buffer, &[overlapping])
            .is_err());
    }

    #[test]
    fn clear_and_read_back_color() {
        let fx = Fixture::new();
        let image = fx.image(Format::R8G8B8A8Unorm, 4, 4);
        let readback = fx.buffer(64);

        fx.run(|device, cb| {
            fx.to_transfer_dst(cb, image, ImageAspectFlags::COLOR)?;
            device.cmd_clear_color_image(
                cb,
                image,
                ImageLayout::General,
                ClearColorValue::Float([0.0, 1.0, 0.0, 1.0]),
                &[ImageSubresourceRange::all(ImageAspectFlags::COLOR)],
            )?;
            device.cmd_copy_image_to_buffer(
                cb,
                image,
                ImageLayout::General,
                readback,
                &[BufferImageCopy::whole(ImageAspectFlags::COLOR, 4, 4)],
            )
        });

        let bytes = fx.device.read_buffer(readback, 0, 64).unwrap();
        assert!(bytes.chunks_exact(4).all(|px| px == [0, 255, 0, 255]));
    }

    #[test]
    fn buffer_to_image_region_round_trip() {
        let fx = Fixture::new();
        let image = fx.image(Format::R8Unorm, 4, 4);
        let upload = fx.buffer(16);
        let readback = fx.buffer(16);
        fx.device.write_buffer(upload, 0, &[1, 2, 3, 4]).unwrap();

        fx.run(|device, cb| {
            fx.to_transfer_dst(cb, image, ImageAspectFlags::COLOR)?;
            device.cmd_clear_color_image(
                cb,
                image,
                ImageLayout::General,
                ClearColorValue::Float([0.0; 4]),
                &[ImageSubresourceRange::all(ImageAspectFlags::COLOR)],
            )?;
            // A 2x2 block at (1, 1).
            device.cmd_copy_buffer_to_image(
                cb,
                upload,
                image,
                ImageLayout::General,
                &[BufferImageCopy {
                    image_offset: Offset3D::new(1, 1, 0),
                    ..BufferImageCopy::whole(ImageAspectFlags::COLOR, 2, 2)
                }],
            )?;
            device.cmd_copy_image_to_buffer(
                cb,
                image,
                ImageLayout::General,
                readback,
                &[BufferImageCopy::whole(ImageAspectFlags::COLOR, 4, 4)],
            )
        });

        let bytes = fx.device.read_buffer(readback, 0, 16).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn depth_and_stencil_aspects_copy_separately() {
        let fx = Fixture::new();
        let image = fx.image(Format::D24UnormS8Uint, 2, 1);
        let depth = fx.buffer(8);
        let stencil = fx.buffer(4);

        fx.run(|device, cb| {
            fx.to_transfer_dst(cb, image, ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL)?;
            device.cmd_clear_depth_stencil_image(
                cb,
                image,
                ImageLayout::General,
                ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0x5A,
                },
                &[ImageSubresourceRange::all(
                    ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL,
                )],
            )?;
            device.cmd_copy_image_to_buffer(
                cb,
                image,
                ImageLayout::General,
                depth,
                &[BufferImageCopy::whole(ImageAspectFlags::DEPTH, 2, 1)],
            )?;
            device.cmd_copy_image_to_buffer(
                cb,
                image,
                ImageLayout::General,
                stencil,
                &[BufferImageCopy::whole(ImageAspectFlags::STENCIL, 2, 1)],
            )
        });

        let depth = fx.device.read_buffer(depth, 0, 8).unwrap();
        assert_eq!(&depth[0..4], &0x00FF_FFFFu32.to_le_bytes());
        let stencil = fx.device.read_buffer(stencil, 0, 2).unwrap();
        assert_eq!(stencil, vec![0x5A, 0x5A]);
    }

    #[test]
    fn aspect_formats() {
        assert_eq!(
            aspect_format(Format::D24UnormS8Uint, ImageAspectFlags::DEPTH),
            Ok(Format::X8D24UnormPack32)
        );
        assert_eq!(
            aspect_format(Format::D32SfloatS8Uint, ImageAspectFlags::STENCIL),
            Ok(Format::S8Uint)
        );
        assert!(aspect_format(Format::R8G8B8A8Unorm, ImageAspectFlags::DEPTH).is_err());
    }
}
