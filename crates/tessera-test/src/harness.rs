//! Test harness for headless rendering and visual regression testing.
//!
//! This module renders into an off-screen attachment on a validation-enabled
//! device and reads the result back as an RGBA image.

use image::{ImageBuffer, RgbaImage};
use std::path::Path;

use tessera_core::{ClearColorValue, ClearDepthStencilValue, Format, ImageAspectFlags, Rect2D};
use tessera_device::{
    AccessFlags, AttachmentLoadOp, BufferCreateInfo, BufferHandle, BufferImageCopy,
    BufferUsageFlags, CommandBufferHandle, CommandBufferUsageFlags, CommandPoolCreateFlags,
    CommandPoolHandle, DescriptorSetLayoutHandle, Device, DeviceBuilder, DeviceError,
    FenceHandle, GraphicsPipelineConfig, ImageCreateInfo, ImageHandle, ImageLayout,
    ImageMemoryBarrier, ImageSubresourceRange, ImageUsageFlags, ImageViewHandle, ImageViewType,
    MemoryAllocateInfo, MemoryHandle, MemoryPropertyFlags, MemoryRequirements, PipelineHandle,
    PipelineStageFlags, Queue, RenderingAttachment, RenderingInfo, SubmitInfo,
};

use crate::mask::{self, ErrorMask};
use crate::{Result, TestError, VisualTestConfig};

/// Five seconds, long enough for any scenario at smoke-test sizes.
const WAIT_TIMEOUT_NS: u64 = 5_000_000_000;

/// Clear values for one render pass. No depth clear means no depth attachment.
#[derive(Debug, Clone, Copy)]
pub struct PassClear {
    pub color: ClearColorValue,
    pub depth: Option<f32>,
}

impl PassClear {
    pub const fn color(rgba: [f32; 4]) -> Self {
        Self {
            color: ClearColorValue::Float(rgba),
            depth: None,
        }
    }

    #[must_use]
    pub const fn with_depth(mut self, depth: f32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// An image, its full view, and the layout it was last left in.
#[derive(Debug, Clone, Copy)]
struct Attachment {
    image: ImageHandle,
    view: ImageViewHandle,
    range: ImageSubresourceRange,
    layout: ImageLayout,
}

impl Attachment {
    fn transition(&self, new_layout: ImageLayout) -> ImageMemoryBarrier {
        ImageMemoryBarrier {
            src_access_mask: AccessFlags::MEMORY_WRITE,
            dst_access_mask: AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
            old_layout: self.layout,
            new_layout,
            image: self.image,
            subresource_range: self.range,
        }
    }
}

fn barrier(
    device: &Device,
    cb: CommandBufferHandle,
    images: &[ImageMemoryBarrier],
) -> tessera_device::Result<()> {
    device.cmd_pipeline_barrier(
        cb,
        PipelineStageFlags::ALL_COMMANDS,
        PipelineStageFlags::ALL_COMMANDS,
        &[],
        &[],
        images,
    )
}

/// Headless renderer for testing.
///
/// Owns a device, one command buffer, one fence, and a color attachment
/// with an optional depth attachment.
pub struct HeadlessRenderer {
    device: Device,
    queue: Queue,
    command_pool: CommandPoolHandle,
    command_buffer: CommandBufferHandle,
    fence: FenceHandle,
    color: Attachment,
    depth: Attachment,
    readback: BufferHandle,
    format: Format,
    width: u32,
    height: u32,
}

impl HeadlessRenderer {
    pub const DEPTH_FORMAT: Format = Format::D32Sfloat;

    /// Create a renderer with an RGBA8 color attachment.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::with_format(width, height, Format::R8G8B8A8Unorm)
    }

    /// Create a renderer whose color attachment has `format`.
    pub fn with_format(width: u32, height: u32, format: Format) -> Result<Self> {
        let device = DeviceBuilder::new()
            .app_name("tessera-test")
            .validation(true)
            .build()?;
        let queue = device.get_queue(0, 0)?;
        let command_pool =
            device.create_command_pool(0, CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let command_buffer = device.allocate_command_buffers(command_pool, 1)?[0];
        let fence = device.create_fence(false)?;

        let color = create_attachment(
            &device,
            format,
            width,
            height,
            ImageUsageFlags::COLOR_ATTACHMENT | ImageUsageFlags::TRANSFER_SRC,
            ImageAspectFlags::COLOR,
        )?;
        let depth = create_attachment(
            &device,
            Self::DEPTH_FORMAT,
            width,
            height,
            ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ImageAspectFlags::DEPTH,
        )?;

        let readback_size = u64::from(width * height * format.texel_size());
        let readback = create_host_buffer(&device, readback_size, BufferUsageFlags::TRANSFER_DST)?;

        tracing::debug!(width, height, ?format, "Created headless renderer");
        Ok(Self {
            device,
            queue,
            command_pool,
            command_buffer,
            fence,
            color,
            depth,
            readback,
            format,
            width,
            height,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Get the output dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Record with `record`, submit, and wait for the fence.
    ///
    /// The command buffer and fence are reset afterwards unless the device
    /// was lost.
    pub fn submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&Device, CommandBufferHandle) -> tessera_device::Result<()>,
    {
        let device = &self.device;
        let cb = self.command_buffer;
        device.begin_command_buffer(cb, CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        if let Err(err) = record(device, cb) {
            device.reset_command_buffer(cb)?;
            return Err(err.into());
        }
        device.end_command_buffer(cb)?;

        device.queue_submit(
            self.queue,
            &[SubmitInfo::default().command_buffers(std::slice::from_ref(&cb))],
            Some(self.fence),
        )?;
        let waited = device.wait_for_fences(&[self.fence], true, WAIT_TIMEOUT_NS);

        if !device.is_lost() {
            device.reset_fences(&[self.fence])?;
            device.reset_command_buffer(cb)?;
        }
        Ok(waited?)
    }

    /// Render one pass: clear, run `draws`, and leave the color attachment
    /// ready for [`HeadlessRenderer::capture`].
    pub fn render_pass<F>(&mut self, clear: &PassClear, draws: F) -> Result<()>
    where
        F: FnOnce(&Device, CommandBufferHandle) -> tessera_device::Result<()>,
    {
        let color = self.color;
        let depth = clear.depth.map(|value| (self.depth, value));
        let render_area = Rect2D::new(0, 0, self.width, self.height);

        self.submit(|device, cb| {
            let mut to_attachment = vec![color.transition(ImageLayout::ColorAttachmentOptimal)];
            if let Some((depth, _)) = depth {
                to_attachment.push(depth.transition(ImageLayout::DepthStencilAttachmentOptimal));
            }
            barrier(device, cb, &to_attachment)?;

            device.cmd_begin_rendering(
                cb,
                &RenderingInfo {
                    render_area,
                    color_attachments: vec![RenderingAttachment::color(
                        color.view,
                        AttachmentLoadOp::Clear,
                        clear.color,
                    )],
                    depth_stencil_attachment: depth.map(|(depth, value)| {
                        RenderingAttachment::depth_stencil(
                            depth.view,
                            AttachmentLoadOp::Clear,
                            ClearDepthStencilValue {
                                depth: value,
                                stencil: 0,
                            },
                        )
                    }),
                },
            )?;
            draws(device, cb)?;
            device.cmd_end_rendering(cb)?;

            let attachment = Attachment {
                layout: ImageLayout::ColorAttachmentOptimal,
                ..color
            };
            barrier(device, cb, &[attachment.transition(ImageLayout::TransferSrcOptimal)])
        })?;

        self.color.layout = ImageLayout::TransferSrcOptimal;
        if clear.depth.is_some() {
            self.depth.layout = ImageLayout::DepthStencilAttachmentOptimal;
        }
        Ok(())
    }

    /// Copy the color attachment to host memory as RGBA8.
    pub fn capture(&mut self) -> Result<RgbaImage> {
        let color = self.color;
        let readback = self.readback;
        let (width, height) = (self.width, self.height);

        self.submit(|device, cb| {
            if color.layout != ImageLayout::TransferSrcOptimal {
                barrier(device, cb, &[color.transition(ImageLayout::TransferSrcOptimal)])?;
            }
            device.cmd_copy_image_to_buffer(
                cb,
                color.image,
                ImageLayout::TransferSrcOptimal,
                readback,
                &[BufferImageCopy::whole(ImageAspectFlags::COLOR, width, height)],
            )
        })?;
        self.color.layout = ImageLayout::TransferSrcOptimal;

        let size = u64::from(width * height * self.format.texel_size());
        let bytes = self.device.read_buffer(self.readback, 0, size)?;
        self.to_rgba(bytes)
    }

    /// Render one pass and capture the result.
    pub fn render<F>(&mut self, clear: &PassClear, draws: F) -> Result<RgbaImage>
    where
        F: FnOnce(&Device, CommandBufferHandle) -> tessera_device::Result<()>,
    {
        self.render_pass(clear, draws)?;
        self.capture()
    }

    fn to_rgba(&self, bytes: Vec<u8>) -> Result<RgbaImage> {
        let data = if self.format == Format::R8G8B8A8Unorm {
            bytes
        } else {
            let texel_size = self.format.texel_size() as usize;
            let mut data = Vec::with_capacity(bytes.len() / texel_size * 4);
            for texel in bytes.chunks_exact(texel_size) {
                let color = self.format.decode(texel).map_err(DeviceError::from)?.to_vec4();
                data.extend(color.to_array().map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8));
            }
            data
        };
        ImageBuffer::from_raw(self.width, self.height, data).ok_or_else(|| {
            TestError::ImageComparison("Readback does not fill the output image".to_string())
        })
    }

    /// Create a pipeline targeting this renderer's color attachment.
    pub fn create_pipeline(
        &self,
        config: GraphicsPipelineConfig,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> Result<PipelineHandle> {
        let config = GraphicsPipelineConfig {
            color_formats: vec![self.format],
            ..config
        };
        Ok(self.device.create_graphics_pipeline(&config, set_layouts, &[])?)
    }

    /// Create a host-visible buffer holding `data`.
    pub fn upload_buffer(&self, data: &[u8], usage: BufferUsageFlags) -> Result<BufferHandle> {
        let buffer = create_host_buffer(&self.device, data.len() as u64, usage)?;
        self.device.write_buffer(buffer, 0, data)?;
        Ok(buffer)
    }

    /// Create a sampled 2D texture holding tightly packed `data`.
    pub fn upload_texture(
        &self,
        format: Format,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<ImageViewHandle> {
        let texture = create_attachment(
            &self.device,
            format,
            width,
            height,
            ImageUsageFlags::SAMPLED | ImageUsageFlags::TRANSFER_DST,
            ImageAspectFlags::COLOR,
        )?;
        let staging = self.upload_buffer(data, BufferUsageFlags::TRANSFER_SRC)?;

        self.submit(|device, cb| {
            barrier(device, cb, &[texture.transition(ImageLayout::TransferDstOptimal)])?;
            device.cmd_copy_buffer_to_image(
                cb,
                staging,
                texture.image,
                ImageLayout::TransferDstOptimal,
                &[BufferImageCopy::whole(ImageAspectFlags::COLOR, width, height)],
            )?;
            let uploaded = Attachment {
                layout: ImageLayout::TransferDstOptimal,
                ..texture
            };
            barrier(device, cb, &[uploaded.transition(ImageLayout::ShaderReadOnlyOptimal)])
        })?;
        self.device.destroy_buffer(staging)?;
        Ok(texture.view)
    }
}

impl Drop for HeadlessRenderer {
    fn drop(&mut self) {
        let _ = self.device.device_wait_idle();
        let _ = self.device.destroy_fence(self.fence);
        let _ = self.device.destroy_command_pool(self.command_pool);
    }
}

fn allocate_host_memory(
    device: &Device,
    requirements: MemoryRequirements,
) -> tessera_device::Result<MemoryHandle> {
    let memory_type_index = device
        .capabilities()
        .find_memory_type(
            requirements.memory_type_bits,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or_else(|| DeviceError::Unsupported("no host-visible memory type".to_string()))?;
    device.allocate_memory(&MemoryAllocateInfo {
        size: requirements.size,
        alignment: requirements.alignment,
        memory_type_index,
    })
}

fn create_host_buffer(
    device: &Device,
    size: u64,
    usage: BufferUsageFlags,
) -> tessera_device::Result<BufferHandle> {
    let buffer = device.create_buffer(&BufferCreateInfo { size, usage })?;
    let memory = allocate_host_memory(device, device.get_buffer_memory_requirements(buffer)?)?;
    device.bind_buffer_memory(buffer, memory, 0)?;
    Ok(buffer)
}

fn create_attachment(
    device: &Device,
    format: Format,
    width: u32,
    height: u32,
    usage: ImageUsageFlags,
    aspect: ImageAspectFlags,
) -> tessera_device::Result<Attachment> {
    let image = device.create_image(&ImageCreateInfo::new_2d(format, width, height, usage))?;
    let memory = allocate_host_memory(device, device.get_image_memory_requirements(image)?)?;
    device.bind_image_memory(image, memory, 0)?;
    let range = ImageSubresourceRange::all(aspect);
    let view = device.create_image_view(image, ImageViewType::Type2D, format, &range)?;
    Ok(Attachment {
        image,
        view,
        range,
        layout: ImageLayout::Undefined,
    })
}

/// Visual regression test runner.
///
/// Compares rendered images against baseline PNGs under an error mask.
pub struct VisualRegressionTest {
    config: VisualTestConfig,
}

impl VisualRegressionTest {
    pub fn new(config: VisualTestConfig) -> Self {
        Self { config }
    }

    /// Compare `image` with the baseline called `name`.
    ///
    /// The output is always saved. A missing baseline is created when the
    /// configuration allows it; a failing comparison also saves a diff.
    pub fn check(&self, name: &str, image: &RgbaImage, mask: &ErrorMask) -> Result<()> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let output_path = Path::new(&self.config.output_dir).join(format!("{name}.png"));
        image.save(&output_path)?;

        let baseline_path = Path::new(&self.config.baseline_dir).join(format!("{name}.png"));
        if !baseline_path.exists() {
            if !self.config.create_missing {
                return Err(TestError::ImageComparison(format!(
                    "Missing baseline {}",
                    baseline_path.display()
                )));
            }
            std::fs::create_dir_all(&self.config.baseline_dir)?;
            image.save(&baseline_path)?;
            tracing::info!("Created new baseline: {}", baseline_path.display());
            return Ok(());
        }

        let baseline = image::open(&baseline_path)?.to_rgba8();
        let report = mask::compare_with_mask(&baseline, image, mask)?;
        if !report.passed() {
            let diff_path = Path::new(&self.config.output_dir).join(format!("{name}_diff.png"));
            mask::diff_image(&baseline, image, mask).save(&diff_path)?;
            return Err(TestError::ImageComparison(format!(
                "{} pixels exceed the mask, max error {}, first at {:?} (see {})",
                report.failed_pixels,
                report.max_error,
                report.first_failure,
                diff_path.display()
            )));
        }
        Ok(())
    }
}
