//! Command replay on a queue worker.
//!
//! Commands run strictly in recorded order and each one completes before
//! the next starts, so every barrier is a full drain point. Barriers still
//! matter: they move image layouts, and with validation enabled the hazard
//! tracker reports accesses that no barrier made visible.

use crate::command::{
    AttachmentLoadOp, AttachmentStoreOp, BarrierBatch, BufferRef, CapturedAttachment, Command,
    ImageRef, RenderingScope,
};
use crate::context::{DeviceContext, Diagnostics, ObjectKey, ObjectKind};
use crate::descriptors::{DescriptorEntry, DescriptorSet, DescriptorType};
use crate::error::{DeviceError, Result};
use crate::hazard::{AccessFlags, Hazard, HazardTracker, PipelineStageFlags, Scope};
use crate::pipeline::Pipeline;
use crate::queue::{Batch, Execution};
use crate::resource::{ImageLayout, ResolvedRange};
use crate::transfer::{self, DST_LAYOUTS, SRC_LAYOUTS};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tessera_core::{ClearValue, ImageAspectFlags, Rect2D, Viewport};
use tessera_raster::{
    BoundTexture, DescriptorBindings, DrawCall, DrawInputs, DynamicState, Framebuffer, IndexInput,
    IndexType, StencilFaceFlags, Surface,
};

const COLOR_LAYOUTS: &[ImageLayout] = &[ImageLayout::ColorAttachmentOptimal, ImageLayout::General];
const DEPTH_LAYOUTS: &[ImageLayout] = &[
    ImageLayout::DepthStencilAttachmentOptimal,
    ImageLayout::DepthStencilReadOnlyOptimal,
    ImageLayout::General,
];
const SAMPLED_LAYOUTS: &[ImageLayout] = &[
    ImageLayout::ShaderReadOnlyOptimal,
    ImageLayout::DepthStencilReadOnlyOptimal,
    ImageLayout::General,
];

const TRANSFER_READ: Scope = Scope::new(PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_READ);
const TRANSFER_WRITE: Scope = Scope::new(PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_WRITE);
const COLOR_WRITE: Scope = Scope::new(
    PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    AccessFlags::COLOR_ATTACHMENT_WRITE,
);
const DEPTH_WRITE: Scope = Scope::new(
    PipelineStageFlags::EARLY_FRAGMENT_TESTS.union(PipelineStageFlags::LATE_FRAGMENT_TESTS),
    AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
);
const VERTEX_READ: Scope = Scope::new(
    PipelineStageFlags::VERTEX_INPUT,
    AccessFlags::VERTEX_ATTRIBUTE_READ,
);
const INDEX_READ: Scope = Scope::new(PipelineStageFlags::VERTEX_INPUT, AccessFlags::INDEX_READ);
const SHADER_STAGES: PipelineStageFlags =
    PipelineStageFlags::VERTEX_SHADER.union(PipelineStageFlags::FRAGMENT_SHADER);

/// Run one batch to completion and publish its outcome.
pub(crate) fn execute_batch(ctx: &DeviceContext, queue: u32, batch: Batch) {
    let span = tracing::trace_span!("batch", queue, id = batch.id);
    let _enter = span.enter();
    let mut batch_failed = false;

    for submission in batch.submissions {
        // A wait on a failed signal skips the work and passes the failure on
        let mut skip = false;
        for semaphore in &submission.waits {
            match ctx.sync.wait_until(ctx.lost_flag(), None, || semaphore.try_consume()) {
                Ok(failed) => skip |= failed,
                Err(_) => skip = true,
            }
        }
        if skip {
            tracing::warn!(queue, id = batch.id, "Skipping submission after failed wait");
        }

        let mut failed = skip;
        let mut hazards = HazardTracker::new();
        for execution in submission.executions {
            if !skip && !ctx.is_lost() {
                failed |= !run_command_buffer(ctx, &execution, &mut hazards);
            }
            execution.buffer.finish_execution();
        }

        for semaphore in &submission.signals {
            semaphore.signal(failed);
        }
        batch_failed |= failed;
        ctx.sync.notify();
    }

    if let Some(fence) = batch.fence {
        fence.complete(batch_failed || ctx.is_lost());
    }
}

/// Replay one command buffer, returning whether it completed.
fn run_command_buffer(
    ctx: &DeviceContext,
    execution: &Execution,
    hazards: &mut HazardTracker,
) -> bool {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        Replay::new(ctx, hazards).run(&execution.commands)
    }));
    Diagnostics::add(&ctx.diagnostics.command_buffers_executed, 1);

    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!(command_buffer = ?execution.handle, %err, "Command buffer aborted");
            Diagnostics::add(&ctx.diagnostics.command_buffers_aborted, 1);
            false
        }
        Err(payload) => {
            ctx.mark_lost(&format!(
                "panic while executing {:?}: {}",
                execution.handle,
                panic_message(payload.as_ref())
            ));
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Attachments loaded for an open rendering scope.
struct ActiveRendering<'a> {
    scope: &'a RenderingScope,
    framebuffer: Framebuffer,
}

/// Replay state of one command buffer.
struct Replay<'a> {
    ctx: &'a DeviceContext,
    hazards: &'a mut HazardTracker,
    pipeline: Option<Arc<Pipeline>>,
    vertex_buffers: Vec<Option<(BufferRef, u64)>>,
    index_buffer: Option<(BufferRef, u64, IndexType)>,
    sets: Vec<Option<Arc<DescriptorSet>>>,
    push_constants: Vec<u8>,
    viewport: Option<Viewport>,
    scissor: Option<Rect2D>,
    blend_constants: [f32; 4],
    stencil_reference: [u32; 2],
    rendering: Option<ActiveRendering<'a>>,
}

impl<'a> Replay<'a> {
    fn new(ctx: &'a DeviceContext, hazards: &'a mut HazardTracker) -> Self {
        Self {
            ctx,
            hazards,
            pipeline: None,
            vertex_buffers: Vec::new(),
            index_buffer: None,
            sets: Vec::new(),
            push_constants: vec![0; ctx.capabilities.limits.max_push_constants_size as usize],
            viewport: None,
            scissor: None,
            blend_constants: [0.0; 4],
            stencil_reference: [0; 2],
            rendering: None,
        }
    }

    fn run(mut self, commands: &'a [Command]) -> Result<()> {
        for command in commands {
            self.execute(command)?;
        }
        Ok(())
    }

    fn report(&mut self, hazard: Option<Hazard>) {
        let Some(hazard) = hazard else { return };
        if self.ctx.validation() {
            tracing::warn!(
                kind = ?hazard.kind,
                resource = ?hazard.resource,
                previous = ?hazard.previous,
                access = ?hazard.access,
                "Unsynchronized access"
            );
            Diagnostics::add(&self.ctx.diagnostics.hazards, 1);
        }
    }

    fn read(&mut self, key: ObjectKey, scope: Scope) {
        let hazard = self.hazards.read(key, scope);
        self.report(hazard);
    }

    fn write(&mut self, key: ObjectKey, scope: Scope) {
        let hazard = self.hazards.write(key, scope);
        self.report(hazard);
    }

    fn execute(&mut self, command: &'a Command) -> Result<()> {
        match command {
            Command::BindPipeline(pipeline) => self.pipeline = Some(Arc::clone(pipeline)),
            Command::BindVertexBuffers {
                first_binding,
                buffers,
            } => {
                for (index, (buffer, offset)) in buffers.iter().enumerate() {
                    let slot = *first_binding as usize + index;
                    if self.vertex_buffers.len() <= slot {
                        self.vertex_buffers.resize(slot + 1, None);
                    }
                    self.vertex_buffers[slot] = Some((buffer.clone(), *offset));
                }
            }
            Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => self.index_buffer = Some((buffer.clone(), *offset, *index_type)),
            Command::BindDescriptorSets { first_set, sets } => {
                for (index, set) in sets.iter().enumerate() {
                    let slot = *first_set as usize + index;
                    if self.sets.len() <= slot {
                        self.sets.resize(slot + 1, None);
                    }
                    self.sets[slot] = Some(Arc::clone(set));
                }
            }
            Command::PushConstants { offset, data } => {
                let start = *offset as usize;
                self.push_constants[start..start + data.len()].copy_from_slice(data);
            }
            Command::SetViewport(viewport) => self.viewport = Some(*viewport),
            Command::SetScissor(scissor) => self.scissor = Some(*scissor),
            Command::SetBlendConstants(constants) => self.blend_constants = *constants,
            Command::SetStencilReference { faces, reference } => {
                if faces.contains(StencilFaceFlags::FRONT) {
                    self.stencil_reference[0] = *reference;
                }
                if faces.contains(StencilFaceFlags::BACK) {
                    self.stencil_reference[1] = *reference;
                }
            }
            Command::BeginRendering(scope) => self.begin_rendering(scope)?,
            Command::EndRendering => self.end_rendering()?,
            Command::Draw(call) => self.draw(*call)?,
            Command::PipelineBarrier(batch) => self.barrier(batch)?,
            Command::CopyBuffer { src, dst, regions } => {
                self.read(src.key(), TRANSFER_READ);
                self.write(dst.key(), TRANSFER_WRITE);
                transfer::copy_buffer(&src.buffer, &dst.buffer, regions)?;
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                for region in regions {
                    let src_range = src.image.resolve_layers(&region.src_subresource)?;
                    let dst_range = dst.image.resolve_layers(&region.dst_subresource)?;
                    self.expect_layout(src, &src_range, *src_layout, SRC_LAYOUTS, "copy source")?;
                    self.expect_layout(dst, &dst_range, *dst_layout, DST_LAYOUTS, "copy destination")?;
                }
                self.read(src.key(), TRANSFER_READ);
                self.write(dst.key(), TRANSFER_WRITE);
                transfer::copy_image(&src.image, &dst.image, regions)?;
            }
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                for region in regions {
                    let range = dst.image.resolve_layers(&region.image_subresource)?;
                    self.expect_layout(dst, &range, *dst_layout, DST_LAYOUTS, "copy destination")?;
                }
                self.read(src.key(), TRANSFER_READ);
                self.write(dst.key(), TRANSFER_WRITE);
                transfer::copy_buffer_to_image(&src.buffer, &dst.image, regions)?;
            }
            Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions,
            } => {
                for region in regions {
                    let range = src.image.resolve_layers(&region.image_subresource)?;
                    self.expect_layout(src, &range, *src_layout, SRC_LAYOUTS, "copy source")?;
                }
                self.read(src.key(), TRANSFER_READ);
                self.write(dst.key(), TRANSFER_WRITE);
                transfer::copy_image_to_buffer(&src.image, &dst.buffer, regions)?;
            }
            Command::FillBuffer {
                dst,
                offset,
                size,
                data,
            } => {
                self.write(dst.key(), TRANSFER_WRITE);
                transfer::fill_buffer(&dst.buffer, *offset, *size, *data)?;
            }
            Command::UpdateBuffer { dst, offset, data } => {
                self.write(dst.key(), TRANSFER_WRITE);
                dst.buffer.write(*offset, data)?;
            }
            Command::ClearColorImage {
                image,
                layout,
                color,
                ranges,
            } => {
                for range in ranges {
                    self.expect_layout(image, range, *layout, DST_LAYOUTS, "cleared image")?;
                }
                self.write(image.key(), TRANSFER_WRITE);
                transfer::clear_color_image(&image.image, *color, ranges)?;
            }
            Command::ClearDepthStencilImage {
                image,
                layout,
                value,
                ranges,
            } => {
                for range in ranges {
                    self.expect_layout(image, range, *layout, DST_LAYOUTS, "cleared image")?;
                }
                self.write(image.key(), TRANSFER_WRITE);
                transfer::clear_depth_stencil_image(&image.image, *value, ranges)?;
            }
        }
        Ok(())
    }

    /// With validation on, the declared layout must be one `access` allows
    /// and every subresource must actually be in it.
    fn expect_layout(
        &self,
        image: &ImageRef,
        range: &ResolvedRange,
        declared: ImageLayout,
        allowed: &[ImageLayout],
        access: &str,
    ) -> Result<()> {
        if !self.ctx.validation() {
            return Ok(());
        }
        if !allowed.contains(&declared) {
            return Err(DeviceError::LayoutMismatch(format!(
                "{access} declared as {declared:?}, needs one of {allowed:?}"
            )));
        }
        image.image.expect_layout(range, &[declared], access)
    }

    fn load_attachment(
        &self,
        attachment: &CapturedAttachment,
        area: Rect2D,
        allowed: &[ImageLayout],
        access: &str,
    ) -> Result<Surface> {
        let view = &attachment.view;
        if self.ctx.validation() {
            if !allowed.contains(&attachment.layout) {
                return Err(DeviceError::LayoutMismatch(format!(
                    "{access} declared as {:?}, needs one of {allowed:?}",
                    attachment.layout
                )));
            }
            view.image.expect_layout(&view.range, &[attachment.layout], access)?;
        }

        let mut surface = view.read_surface()?;
        if attachment.load_op == AttachmentLoadOp::Clear {
            match attachment.clear_value {
                ClearValue::Color(color) => surface.clear_color(area, color.into())?,
                ClearValue::DepthStencil(value) => {
                    let depth = view.range.aspects.contains(ImageAspectFlags::DEPTH);
                    let stencil = view.range.aspects.contains(ImageAspectFlags::STENCIL);
                    surface.clear_depth_stencil(
                        area,
                        depth.then_some(value.depth),
                        stencil.then_some(value.stencil as u8),
                    )?;
                }
            }
        }
        Ok(surface)
    }

    fn begin_rendering(&mut self, scope: &'a RenderingScope) -> Result<()> {
        if self.rendering.is_some() {
            return Err(DeviceError::validation("rendering scope already open"));
        }
        let area = scope.render_area;
        let colors = scope
            .colors
            .iter()
            .map(|a| self.load_attachment(a, area, COLOR_LAYOUTS, "color attachment"))
            .collect::<Result<Vec<_>>>()?;
        let depth_stencil = scope
            .depth_stencil
            .as_ref()
            .map(|a| self.load_attachment(a, area, DEPTH_LAYOUTS, "depth/stencil attachment"))
            .transpose()?;

        for attachment in &scope.colors {
            self.write(attachment.image_key(), COLOR_WRITE);
        }
        if let Some(attachment) = &scope.depth_stencil {
            self.write(attachment.image_key(), DEPTH_WRITE);
        }

        tracing::trace!(
            colors = colors.len(),
            depth = depth_stencil.is_some(),
            ?area,
            "Begin rendering"
        );
        self.rendering = Some(ActiveRendering {
            scope,
            framebuffer: Framebuffer {
                colors,
                depth_stencil,
                render_area: area,
            },
        });
        Ok(())
    }

    fn end_rendering(&mut self) -> Result<()> {
        let ActiveRendering { scope, framebuffer } = self
            .rendering
            .take()
            .ok_or_else(|| DeviceError::validation("end rendering without begin"))?;

        let store = |attachment: &CapturedAttachment, surface: &Surface| {
            if attachment.store_op == AttachmentStoreOp::Store {
                attachment.view.write_surface(surface)
            } else {
                Ok(())
            }
        };
        for (attachment, surface) in scope.colors.iter().zip(&framebuffer.colors) {
            store(attachment, surface)?;
        }
        if let (Some(attachment), Some(surface)) =
            (&scope.depth_stencil, &framebuffer.depth_stencil)
        {
            store(attachment, surface)?;
        }
        tracing::trace!("End rendering");
        Ok(())
    }

    /// Copy the descriptors bound for `pipeline` into a draw snapshot.
    fn snapshot_descriptors(&mut self, pipeline: &Pipeline) -> Result<DescriptorBindings> {
        let mut bindings = DescriptorBindings::new();
        let validation = self.ctx.validation();
        for set_index in 0..pipeline.set_layout_count() {
            let Some(set) = self.sets.get(set_index).cloned().flatten() else {
                return Err(DeviceError::validation(format!(
                    "descriptor set {set_index} is not bound"
                )));
            };
            let set_index = set_index as u32;
            for (binding, entry) in set.entries() {
                match entry {
                    DescriptorEntry::Buffer {
                        descriptor_type,
                        buffer,
                        handle,
                        offset,
                        range,
                    } => {
                        let access = if descriptor_type == DescriptorType::UniformBuffer {
                            AccessFlags::UNIFORM_READ
                        } else {
                            AccessFlags::SHADER_READ
                        };
                        self.read(
                            ObjectKey::of(ObjectKind::Buffer, handle),
                            Scope::new(SHADER_STAGES, access),
                        );
                        let range = buffer.resolve_range(offset, range)?;
                        let data = buffer.read(range.start, range.end - range.start)?;
                        bindings.insert_buffer(set_index, binding, data);
                    }
                    DescriptorEntry::Texture { view, sampler, .. } => {
                        if validation {
                            view.image
                                .expect_layout(&view.range, SAMPLED_LAYOUTS, "sampled image")?;
                        }
                        self.read(
                            ObjectKey::of(ObjectKind::Image, view.image_handle),
                            Scope::new(SHADER_STAGES, AccessFlags::SHADER_READ),
                        );
                        bindings.insert_texture(
                            set_index,
                            binding,
                            BoundTexture {
                                surface: view.read_surface()?,
                                sampler: sampler.state(),
                            },
                        );
                    }
                    DescriptorEntry::TexelBuffer { view, .. } => {
                        self.read(
                            ObjectKey::of(ObjectKind::Buffer, view.buffer_handle),
                            Scope::new(SHADER_STAGES, AccessFlags::SHADER_READ),
                        );
                        bindings.insert_texel_buffer(set_index, binding, view.read_surface()?);
                    }
                }
            }
        }
        Ok(bindings)
    }

    fn draw(&mut self, call: DrawCall) -> Result<()> {
        let pipeline = self
            .pipeline
            .clone()
            .ok_or_else(|| DeviceError::validation("draw without a bound pipeline"))?;
        let area = match &self.rendering {
            Some(rendering) => rendering.framebuffer.render_area,
            None => return Err(DeviceError::validation("draw outside a rendering scope")),
        };

        let mut vertex_data = Vec::with_capacity(self.vertex_buffers.len());
        for slot in self.vertex_buffers.clone() {
            vertex_data.push(match slot {
                Some((buffer, offset)) => {
                    self.read(buffer.key(), VERTEX_READ);
                    let len = buffer.buffer.size().saturating_sub(offset);
                    Some(buffer.buffer.read(offset, len)?)
                }
                None => None,
            });
        }
        let index_data = match (&call, self.index_buffer.clone()) {
            (DrawCall::Indexed { .. }, Some((buffer, offset, index_type))) => {
                self.read(buffer.key(), INDEX_READ);
                let len = buffer.buffer.size().saturating_sub(offset);
                Some((buffer.buffer.read(offset, len)?, index_type))
            }
            (DrawCall::Indexed { .. }, None) => {
                return Err(DeviceError::validation("indexed draw without an index buffer"))
            }
            (DrawCall::Direct { .. }, _) => None,
        };
        let descriptors = self.snapshot_descriptors(&pipeline)?;

        let mut dynamic = DynamicState::covering(area);
        if let Some(viewport) = self.viewport {
            dynamic.viewport = viewport;
        }
        if let Some(scissor) = self.scissor {
            dynamic.scissor = scissor;
        }
        dynamic.blend_constants = self.blend_constants;
        dynamic.stencil_reference = self.stencil_reference;

        let vertex_buffers: Vec<Option<&[u8]>> = vertex_data.iter().map(Option::as_deref).collect();
        let inputs = DrawInputs {
            vertex_buffers: &vertex_buffers,
            index_buffer: index_data.as_ref().map(|(data, index_type)| IndexInput {
                data,
                index_type: *index_type,
            }),
            descriptors: &descriptors,
            push_constants: &self.push_constants,
        };

        let Some(rendering) = self.rendering.as_mut() else {
            return Err(DeviceError::validation("draw outside a rendering scope"));
        };
        let stats = tessera_raster::draw(
            &pipeline.linked,
            &dynamic,
            &inputs,
            call,
            &mut rendering.framebuffer,
        )?;

        let diagnostics = &self.ctx.diagnostics;
        Diagnostics::add(&diagnostics.draws, 1);
        Diagnostics::add(&diagnostics.primitives, stats.primitives);
        Diagnostics::add(&diagnostics.fragments_written, stats.fragments_written);
        Ok(())
    }

    fn barrier(&mut self, batch: &BarrierBatch) -> Result<()> {
        if self.rendering.is_some() {
            return Err(DeviceError::validation("pipeline barrier inside a rendering scope"));
        }
        let src = |access| Scope::new(batch.src_stage, access);
        let dst = |access| Scope::new(batch.dst_stage, access);

        for barrier in &batch.memory {
            self.hazards
                .memory_barrier(src(barrier.src_access_mask), dst(barrier.dst_access_mask));
        }
        for (buffer, barrier) in &batch.buffers {
            self.hazards.resource_barrier(
                buffer.key(),
                src(barrier.src_access_mask),
                dst(barrier.dst_access_mask),
            );
        }
        for (image, range, barrier) in &batch.images {
            if self.ctx.validation() && barrier.old_layout != ImageLayout::Undefined {
                image
                    .image
                    .expect_layout(range, &[barrier.old_layout], "image barrier")?;
            }
            if barrier.old_layout == barrier.new_layout {
                self.hazards.resource_barrier(
                    image.key(),
                    src(barrier.src_access_mask),
                    dst(barrier.dst_access_mask),
                );
            } else {
                image.image.set_layout(range, barrier.new_layout);
                let hazard = self.hazards.layout_transition(
                    image.key(),
                    src(barrier.src_access_mask),
                    dst(barrier.dst_access_mask),
                );
                self.report(hazard);
            }
        }
        tracing::trace!(
            src = ?batch.src_stage,
            dst = ?batch.dst_stage,
            images = batch.images.len(),
            "Pipeline barrier"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryPropertyFlags;
    use crate::command::{
        AttachmentLoadOp, CommandBufferHandle, CommandBufferState, CommandBufferUsageFlags,
        CommandPoolCreateFlags, CommandPoolHandle, ImageMemoryBarrier, MemoryBarrier,
        RenderingAttachment, RenderingInfo,
    };
    use crate::context::{Device, DeviceBuilder};
    use crate::memory::{MemoryAllocateInfo, MemoryHandle, WHOLE_SIZE};
    use crate::pipeline::{GraphicsPipelineConfig, PipelineHandle};
    use crate::queue::{Queue, SubmitInfo};
    use crate::resource::{
        BufferCreateInfo, BufferHandle, BufferUsageFlags, ImageCreateInfo, ImageHandle,
        ImageSubresourceRange, ImageUsageFlags, ImageViewHandle, ImageViewType,
    };
    use crate::transfer::{BufferCopy, BufferImageCopy};
    use approx::assert_relative_eq;
    use glam::Vec4;
    use tessera_core::constants::WAIT_FOREVER;
    use tessera_core::{ClearColorValue, ClearDepthStencilValue, Format};
    use tessera_raster::{
        ConstantColor, FnStage, FullscreenTriangle, PassThroughVertex, Signature, Slot,
        ValueType, VertexAttribute, VertexBinding, VertexInputRate,
    };

    const SIZE: u32 = 8;

    struct Target {
        device: Device,
        pool: CommandPoolHandle,
        queue: Queue,
        image: ImageHandle,
        view: ImageViewHandle,
        readback: BufferHandle,
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

    fn host_buffer(device: &Device, size: u64, usage: BufferUsageFlags) -> BufferHandle {
        let buffer = device.create_buffer(&BufferCreateInfo { size, usage }).unwrap();
        let memory = host_memory(device, size);
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        buffer
    }

    impl Target {
        fn new() -> Self {
            let device = DeviceBuilder::new().validation(true).build().unwrap();
            let pool = device
                .create_command_pool(0, CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .unwrap();
            let queue = device.get_queue(0, 0).unwrap();
            let image = device
                .create_image(&ImageCreateInfo::new_2d(
                    Format::R8G8B8A8Unorm,
                    SIZE,
                    SIZE,
                    ImageUsageFlags::COLOR_ATTACHMENT | ImageUsageFlags::TRANSFER_SRC,
                ))
                .unwrap();
            let size = device.get_image_memory_requirements(image).unwrap().size;
            let memory = host_memory(&device, size);
            device.bind_image_memory(image, memory, 0).unwrap();
            let view = device
                .create_image_view(
                    image,
                    ImageViewType::Type2D,
                    Format::R8G8B8A8Unorm,
                    &ImageSubresourceRange::all(ImageAspectFlags::COLOR),
                )
                .unwrap();
            let readback = host_buffer(
                &device,
                u64::from(SIZE * SIZE * 4),
                BufferUsageFlags::TRANSFER_DST,
            );
            Self {
                device,
                pool,
                queue,
                image,
                view,
                readback,
            }
        }

        fn transition(&self, cb: CommandBufferHandle, old: ImageLayout, new: ImageLayout) {
            self.device
                .cmd_pipeline_barrier(
                    cb,
                    PipelineStageFlags::ALL_COMMANDS,
                    PipelineStageFlags::ALL_COMMANDS,
                    &[],
                    &[],
                    &[ImageMemoryBarrier {
                        src_access_mask: AccessFlags::MEMORY_WRITE,
                        dst_access_mask: AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
                        old_layout: old,
                        new_layout: new,
                        image: self.image,
                        subresource_range: ImageSubresourceRange::all(ImageAspectFlags::COLOR),
                    }],
                )
                .unwrap();
        }

        /// Record a pass that clears to black, runs `draws`, and copies the
        /// image into the readback buffer.
        fn record_pass(&self, draws: impl FnOnce(CommandBufferHandle)) -> CommandBufferHandle {
            let device = &self.device;
            let cb = device.allocate_command_buffers(self.pool, 1).unwrap()[0];
            device
                .begin_command_buffer(cb, CommandBufferUsageFlags::empty())
                .unwrap();
            self.transition(cb, ImageLayout::Undefined, ImageLayout::ColorAttachmentOptimal);
            device
                .cmd_begin_rendering(
                    cb,
                    &RenderingInfo {
                        render_area: Rect2D::new(0, 0, SIZE, SIZE),
                        color_attachments: vec![RenderingAttachment::color(
                            self.view,
                            AttachmentLoadOp::Clear,
                            ClearColorValue::Float([0.0, 0.0, 0.0, 1.0]),
                        )],
                        depth_stencil_attachment: None,
                    },
                )
                .unwrap();
            draws(cb);
            device.cmd_end_rendering(cb).unwrap();
            self.transition(
                cb,
                ImageLayout::ColorAttachmentOptimal,
                ImageLayout::TransferSrcOptimal,
            );
            device
                .cmd_copy_image_to_buffer(
                    cb,
                    self.image,
                    ImageLayout::TransferSrcOptimal,
                    self.readback,
                    &[BufferImageCopy::whole(ImageAspectFlags::COLOR, SIZE, SIZE)],
                )
                .unwrap();
            device.end_command_buffer(cb).unwrap();
            cb
        }

        fn submit_and_wait(&self, cb: CommandBufferHandle) -> Result<()> {
            let fence = self.device.create_fence(false)?;
            self.device.queue_submit(
                self.queue,
                &[SubmitInfo::default().command_buffers(&[cb])],
                Some(fence),
            )?;
            self.device.wait_for_fences(&[fence], true, WAIT_FOREVER)
        }

        fn pixels(&self) -> Vec<[u8; 4]> {
            self.device
                .read_buffer(self.readback, 0, u64::from(SIZE * SIZE * 4))
                .unwrap()
                .chunks_exact(4)
                .map(|px| [px[0], px[1], px[2], px[3]])
                .collect()
        }

        fn pipeline(&self, config: &GraphicsPipelineConfig) -> PipelineHandle {
            self.device.create_graphics_pipeline(config, &[], &[]).unwrap()
        }
    }

    fn red_fullscreen() -> GraphicsPipelineConfig {
        GraphicsPipelineConfig {
            vertex_stage: Some(Arc::new(FullscreenTriangle::new(0.5))),
            fragment_stage: Some(Arc::new(ConstantColor::new(Vec4::new(1.0, 0.0, 0.0, 1.0)))),
            ..Default::default()
        }
    }

    #[test]
    fn fullscreen_triangle_fills_target() {
        let target = Target::new();
        let pipeline = target.pipeline(&red_fullscreen());
        let cb = target.record_pass(|cb| {
            target.device.cmd_bind_pipeline(cb, pipeline).unwrap();
            target.device.cmd_draw(cb, 3, 1, 0, 0).unwrap();
        });

        target.submit_and_wait(cb).unwrap();
        assert!(target.pixels().iter().all(|px| *px == [255, 0, 0, 255]));
        let diagnostics = target.device.diagnostics();
        assert_eq!(diagnostics.draws, 1);
        assert_eq!(diagnostics.fragments_written, u64::from(SIZE * SIZE));
        assert_eq!(diagnostics.hazards, 0);
    }

    #[test]
    fn depth_attachment_is_stored() {
        let target = Target::new();
        let device = &target.device;
        let depth = device
            .create_image(&ImageCreateInfo::new_2d(
                Format::D32Sfloat,
                SIZE,
                SIZE,
                ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | ImageUsageFlags::TRANSFER_SRC,
            ))
            .unwrap();
        let size = device.get_image_memory_requirements(depth).unwrap().size;
        let memory = host_memory(device, size);
        device.bind_image_memory(depth, memory, 0).unwrap();
        let depth_range = ImageSubresourceRange::all(ImageAspectFlags::DEPTH);
        let depth_view = device
            .create_image_view(depth, ImageViewType::Type2D, Format::D32Sfloat, &depth_range)
            .unwrap();
        let readback = host_buffer(
            device,
            u64::from(SIZE * SIZE * 4),
            BufferUsageFlags::TRANSFER_DST,
        );
        let config = GraphicsPipelineConfig {
            depth_format: Some(Format::D32Sfloat),
            depth_test: true,
            depth_write: true,
            ..red_fullscreen()
        };
        let pipeline = target.pipeline(&config);
        let depth_barrier = |old, new| ImageMemoryBarrier {
            src_access_mask: AccessFlags::MEMORY_WRITE,
            dst_access_mask: AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
            old_layout: old,
            new_layout: new,
            image: depth,
            subresource_range: depth_range,
        };

        let cb = device.allocate_command_buffers(target.pool, 1).unwrap()[0];
        device
            .begin_command_buffer(cb, CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        target.transition(cb, ImageLayout::Undefined, ImageLayout::ColorAttachmentOptimal);
        device
            .cmd_pipeline_barrier(
                cb,
                PipelineStageFlags::ALL_COMMANDS,
                PipelineStageFlags::ALL_COMMANDS,
                &[],
                &[],
                &[depth_barrier(
                    ImageLayout::Undefined,
                    ImageLayout::DepthStencilAttachmentOptimal,
                )],
            )
            .unwrap();
        device
            .cmd_begin_rendering(
                cb,
                &RenderingInfo {
                    render_area: Rect2D::new(0, 0, SIZE, SIZE),
                    color_attachments: vec![RenderingAttachment::color(
                        target.view,
                        AttachmentLoadOp::Clear,
                        ClearColorValue::Float([0.0; 4]),
                    )],
                    depth_stencil_attachment: Some(RenderingAttachment::depth_stencil(
                        depth_view,
                        AttachmentLoadOp::Clear,
                        ClearDepthStencilValue::default(),
                    )),
                },
            )
            .unwrap();
        device.cmd_bind_pipeline(cb, pipeline).unwrap();
        device.cmd_draw(cb, 3, 1, 0, 0).unwrap();
        device.cmd_end_rendering(cb).unwrap();
        device
            .cmd_pipeline_barrier(
                cb,
                PipelineStageFlags::ALL_COMMANDS,
                PipelineStageFlags::ALL_COMMANDS,
                &[],
                &[],
                &[depth_barrier(
                    ImageLayout::DepthStencilAttachmentOptimal,
                    ImageLayout::TransferSrcOptimal,
                )],
            )
            .unwrap();
        device
            .cmd_copy_image_to_buffer(
                cb,
                depth,
                ImageLayout::TransferSrcOptimal,
                readback,
                &[BufferImageCopy::whole(ImageAspectFlags::DEPTH, SIZE, SIZE)],
            )
            .unwrap();
        device.end_command_buffer(cb).unwrap();

        target.submit_and_wait(cb).unwrap();
        let bytes = device.read_buffer(readback, 0, u64::from(SIZE * SIZE * 4)).unwrap();
        let depths: &[f32] = bytemuck::cast_slice(&bytes);
        for value in depths {
            assert_relative_eq!(*value, 0.5);
        }
    }

    #[test]
    fn barrier_only_buffer_leaves_attachment_untouched() {
        let target = Target::new();
        target.device.write_buffer(target.readback, 0, &[9; 16]).unwrap();

        let cb = target.device.allocate_command_buffers(target.pool, 1).unwrap()[0];
        target
            .device
            .begin_command_buffer(cb, CommandBufferUsageFlags::empty())
            .unwrap();
        target
            .device
            .cmd_pipeline_barrier(
                cb,
                PipelineStageFlags::TOP_OF_PIPE,
                PipelineStageFlags::BOTTOM_OF_PIPE,
                &[MemoryBarrier::default()],
                &[],
                &[],
            )
            .unwrap();
        target.device.end_command_buffer(cb).unwrap();

        let fence = target.device.create_fence(false).unwrap();
        target
            .device
            .queue_submit(
                target.queue,
                &[SubmitInfo::default().command_buffers(&[cb])],
                Some(fence),
            )
            .unwrap();
        target
            .device
            .wait_for_fences(&[fence], true, 1_000_000_000)
            .unwrap();
        assert_eq!(
            target.device.read_buffer(target.readback, 0, 16).unwrap(),
            vec![9; 16]
        );
        assert_eq!(target.device.get_image_layout(target.image, 0, 0), Ok(ImageLayout::Undefined));
    }

    #[test]
    fn layout_mismatch_fails_the_fence() {
        let target = Target::new();
        let cb = target.device.allocate_command_buffers(target.pool, 1).unwrap()[0];
        target
            .device
            .begin_command_buffer(cb, CommandBufferUsageFlags::empty())
            .unwrap();
        // The image is still Undefined, not TransferSrcOptimal.
        target.transition(cb, ImageLayout::TransferSrcOptimal, ImageLayout::General);
        target.device.end_command_buffer(cb).unwrap();

        assert_eq!(target.submit_and_wait(cb), Err(DeviceError::SubmissionFailed));
        assert_eq!(target.device.diagnostics().command_buffers_aborted, 1);
        assert_eq!(
            target.device.get_command_buffer_state(cb).unwrap(),
            CommandBufferState::Executable
        );
        assert!(!target.device.is_lost());
    }

    #[test]
    fn host_written_vertices_are_seen_by_every_run() {
        let target = Target::new();
        let device = &target.device;
        let vertices: [[f32; 4]; 3] = [
            [-1.0, -1.0, 0.0, 1.0],
            [3.0, -1.0, 0.0, 1.0],
            [-1.0, 3.0, 0.0, 1.0],
        ];
        let vertex_buffer = host_buffer(device, 48, BufferUsageFlags::VERTEX_BUFFER);
        let config = GraphicsPipelineConfig {
            vertex_stage: Some(Arc::new(PassThroughVertex::new(&[]))),
            fragment_stage: Some(Arc::new(ConstantColor::new(Vec4::new(0.0, 0.0, 1.0, 1.0)))),
            vertex_bindings: vec![VertexBinding {
                binding: 0,
                stride: 16,
                input_rate: VertexInputRate::Vertex,
            }],
            vertex_attributes: vec![VertexAttribute {
                location: 0,
                binding: 0,
                format: Format::R32G32B32A32Sfloat,
                offset: 0,
            }],
            ..Default::default()
        };
        let pipeline = target.pipeline(&config);

        let cb = device.allocate_command_buffers(target.pool, 1).unwrap()[0];
        device
            .begin_command_buffer(cb, CommandBufferUsageFlags::empty())
            .unwrap();
        device
            .cmd_pipeline_barrier(
                cb,
                PipelineStageFlags::HOST,
                PipelineStageFlags::VERTEX_INPUT,
                &[MemoryBarrier {
                    src_access_mask: AccessFlags::HOST_WRITE,
                    dst_access_mask: AccessFlags::VERTEX_ATTRIBUTE_READ,
                }],
                &[],
                &[],
            )
            .unwrap();
        device.end_command_buffer(cb).unwrap();
        let draw = target.record_pass(|cb| {
            device.cmd_bind_pipeline(cb, pipeline).unwrap();
            device
                .cmd_bind_vertex_buffers(cb, 0, &[vertex_buffer], &[0])
                .unwrap();
            device.cmd_draw(cb, 3, 1, 0, 0).unwrap();
        });

        for run in 0..10 {
            device
                .write_buffer(vertex_buffer, 0, bytemuck::cast_slice(&vertices))
                .unwrap();
            let fence = device.create_fence(false).unwrap();
            device
                .queue_submit(
                    target.queue,
                    &[SubmitInfo::default().command_buffers(&[cb, draw])],
                    Some(fence),
                )
                .unwrap();
            device.wait_for_fences(&[fence], true, WAIT_FOREVER).unwrap();
            assert!(
                target.pixels().iter().all(|px| *px == [0, 0, 255, 255]),
                "run {run}"
            );
        }
    }

    #[test]
    fn panicking_stage_loses_the_device() {
        let target = Target::new();
        let faulty = FnStage::fragment(
            Signature::new(
                Vec::new(),
                vec![Slot::location("color", 0, ValueType::Vec4)],
            ),
            |_, _, _| panic!("fragment stage fault"),
        );
        let config = GraphicsPipelineConfig {
            fragment_stage: Some(Arc::new(faulty)),
            ..red_fullscreen()
        };
        let pipeline = target.pipeline(&config);
        let cb = target.record_pass(|cb| {
            target.device.cmd_bind_pipeline(cb, pipeline).unwrap();
            target.device.cmd_draw(cb, 3, 1, 0, 0).unwrap();
        });

        assert_eq!(target.submit_and_wait(cb), Err(DeviceError::DeviceLost));
        assert!(target.device.is_lost());
        assert_eq!(target.device.create_fence(false), Err(DeviceError::DeviceLost));
        assert_eq!(
            target.device.queue_wait_idle(target.queue),
            Err(DeviceError::DeviceLost)
        );
    }

    #[test]
    fn destroyed_reference_is_not_executable() {
        let target = Target::new();
        let pipeline = target.pipeline(&red_fullscreen());
        let cb = target.record_pass(|cb| {
            target.device.cmd_bind_pipeline(cb, pipeline).unwrap();
            target.device.cmd_draw(cb, 3, 1, 0, 0).unwrap();
        });
        target.device.destroy_pipeline(pipeline).unwrap();

        assert!(matches!(
            target.device.queue_submit(
                target.queue,
                &[SubmitInfo::default().command_buffers(&[cb])],
                None
            ),
            Err(DeviceError::NotExecutable(_))
        ));
    }

    #[test]
    fn semaphores_order_work_across_queues() {
        let device = DeviceBuilder::new().validation(true).build().unwrap();
        let first = device.get_queue(0, 0).unwrap();
        let second = device.get_queue(0, 1).unwrap();
        let pool = device
            .create_command_pool(0, CommandPoolCreateFlags::empty())
            .unwrap();
        let usage = BufferUsageFlags::TRANSFER_SRC | BufferUsageFlags::TRANSFER_DST;
        let a = host_buffer(&device, 1024 * 1024, usage);
        let b = host_buffer(&device, 1024 * 1024, usage);
        let semaphore = [device.create_semaphore().unwrap()];

        let cbs = device.allocate_command_buffers(pool, 2).unwrap();
        device
            .begin_command_buffer(cbs[0], CommandBufferUsageFlags::empty())
            .unwrap();
        device.cmd_fill_buffer(cbs[0], a, 0, WHOLE_SIZE, 0x0101_0101).unwrap();
        device.end_command_buffer(cbs[0]).unwrap();
        device
            .begin_command_buffer(cbs[1], CommandBufferUsageFlags::empty())
            .unwrap();
        device
            .cmd_copy_buffer(
                cbs[1],
                a,
                b,
                &[BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 1024 * 1024,
                }],
            )
            .unwrap();
        device.end_command_buffer(cbs[1]).unwrap();

        let fence = device.create_fence(false).unwrap();
        let stages = [PipelineStageFlags::TRANSFER];
        // Submit the consumer first: it cannot run before the producer.
        device
            .queue_submit(
                first,
                &[SubmitInfo::default()
                    .command_buffers(&cbs[0..1])
                    .signal_semaphores(&semaphore)],
                None,
            )
            .unwrap();
        device
            .queue_submit(
                second,
                &[SubmitInfo::default()
                    .wait_semaphores(&semaphore)
                    .wait_dst_stage_mask(&stages)
                    .command_buffers(&cbs[1..2])],
                Some(fence),
            )
            .unwrap();
        device.wait_for_fences(&[fence], true, WAIT_FOREVER).unwrap();

        let copied = device.read_buffer(b, 0, 1024 * 1024).unwrap();
        assert!(copied.iter().all(|&byte| byte == 1));
    }

    #[test]
    fn failed_signal_propagates_through_waits() {
        let target = Target::new();
        let device = &target.device;
        let bad = device.allocate_command_buffers(target.pool, 1).unwrap()[0];
        device
            .begin_command_buffer(bad, CommandBufferUsageFlags::empty())
            .unwrap();
        target.transition(bad, ImageLayout::TransferSrcOptimal, ImageLayout::General);
        device.end_command_buffer(bad).unwrap();

        let semaphore = [device.create_semaphore().unwrap()];
        let stages = [PipelineStageFlags::ALL_COMMANDS];
        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(
                target.queue,
                &[SubmitInfo::default()
                    .command_buffers(&[bad])
                    .signal_semaphores(&semaphore)],
                None,
            )
            .unwrap();
        device
            .queue_submit(
                device.get_queue(0, 1).unwrap(),
                &[SubmitInfo::default()
                    .wait_semaphores(&semaphore)
                    .wait_dst_stage_mask(&stages)],
                Some(fence),
            )
            .unwrap();

        assert_eq!(
            device.wait_for_fences(&[fence], true, WAIT_FOREVER),
            Err(DeviceError::SubmissionFailed)
        );
        assert_eq!(device.get_fence_status(fence), Err(DeviceError::SubmissionFailed));
    }

    #[test]
    fn unsynchronized_write_is_reported() {
        let target = Target::new();
        let device = &target.device;
        let usage = BufferUsageFlags::TRANSFER_SRC | BufferUsageFlags::TRANSFER_DST;
        let buffer = host_buffer(device, 64, usage);
        let other = host_buffer(device, 64, usage);

        let cb = device.allocate_command_buffers(target.pool, 1).unwrap()[0];
        device
            .begin_command_buffer(cb, CommandBufferUsageFlags::empty())
            .unwrap();
        device.cmd_fill_buffer(cb, buffer, 0, 64, 1).unwrap();
        device
            .cmd_copy_buffer(
                cb,
                buffer,
                other,
                &[BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 64,
                }],
            )
            .unwrap();
        device.end_command_buffer(cb).unwrap();

        target.submit_and_wait(cb).unwrap();
        assert_eq!(device.diagnostics().hazards, 1);
        // Execution drains every command, so the copy still saw the fill.
        assert_eq!(device.read_buffer(other, 0, 64).unwrap(), 1u32.to_le_bytes().repeat(16));
    }
}
