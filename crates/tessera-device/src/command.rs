//! Command buffer management.
//!
//! Recording only captures commands. Every handle is resolved to its object
//! at record time, so a recorded buffer keeps its resources alive, and the
//! keys of everything it touched are remembered so that destroying one of
//! them can invalidate the buffer.

use crate::context::{Device, DeviceContext, ObjectKey, ObjectKind};
use crate::descriptors::{DescriptorSet, DescriptorSetHandle};
use crate::error::{DeviceError, Result};
use crate::hazard::{AccessFlags, PipelineStageFlags};
use crate::pipeline::{Pipeline, PipelineHandle};
use crate::queue::{Queue, SubmitInfo};
use crate::resource::{
    Buffer, BufferHandle, BufferUsageFlags, Image, ImageHandle, ImageLayout,
    ImageSubresourceRange, ImageUsageFlags, ImageView, ImageViewHandle, ResolvedRange,
};
use crate::transfer::{BufferCopy, BufferImageCopy, ImageCopy};
use bitflags::bitflags;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::{
    ClearColorValue, ClearDepthStencilValue, ClearValue, Format, Handle, Rect2D, Viewport,
};
use tessera_raster::{DrawCall, IndexType, StencilFaceFlags};

pub type CommandPoolHandle = Handle<CommandPool>;
pub type CommandBufferHandle = Handle<CommandBuffer>;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CommandPoolCreateFlags: u32 {
        const TRANSIENT = 0x1;
        /// Buffers may be reset individually
        const RESET_COMMAND_BUFFER = 0x2;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CommandBufferUsageFlags: u32 {
        const ONE_TIME_SUBMIT = 0x1;
        const SIMULTANEOUS_USE = 0x4;
    }
}

/// Lifecycle state of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AttachmentLoadOp {
    #[default]
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AttachmentStoreOp {
    #[default]
    Store,
    DontCare,
}

/// One attachment of a rendering scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderingAttachment {
    pub view: ImageViewHandle,
    pub layout: ImageLayout,
    pub load_op: AttachmentLoadOp,
    pub store_op: AttachmentStoreOp,
    pub clear_value: ClearValue,
}

impl RenderingAttachment {
    /// Color attachment in `ColorAttachmentOptimal` that is stored at the end.
    pub fn color(view: ImageViewHandle, load_op: AttachmentLoadOp, clear: ClearColorValue) -> Self {
        Self {
            view,
            layout: ImageLayout::ColorAttachmentOptimal,
            load_op,
            store_op: AttachmentStoreOp::Store,
            clear_value: ClearValue::Color(clear),
        }
    }

    /// Depth/stencil attachment in `DepthStencilAttachmentOptimal`.
    pub fn depth_stencil(
        view: ImageViewHandle,
        load_op: AttachmentLoadOp,
        clear: ClearDepthStencilValue,
    ) -> Self {
        Self {
            view,
            layout: ImageLayout::DepthStencilAttachmentOptimal,
            load_op,
            store_op: AttachmentStoreOp::Store,
            clear_value: ClearValue::DepthStencil(clear),
        }
    }
}

/// Parameters of a dynamic rendering scope.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderingInfo {
    pub render_area: Rect2D,
    pub color_attachments: Vec<RenderingAttachment>,
    pub depth_stencil_attachment: Option<RenderingAttachment>,
}

/// Global memory dependency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferMemoryBarrier {
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// Memory dependency and optional layout transition for an image range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageMemoryBarrier {
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub image: ImageHandle,
    pub subresource_range: ImageSubresourceRange,
}

/// A buffer captured by a command.
#[derive(Clone, Debug)]
pub(crate) struct BufferRef {
    pub buffer: Arc<Buffer>,
    pub handle: BufferHandle,
}

impl BufferRef {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(ObjectKind::Buffer, self.handle)
    }
}

/// An image captured by a command.
#[derive(Clone, Debug)]
pub(crate) struct ImageRef {
    pub image: Arc<Image>,
    pub handle: ImageHandle,
}

impl ImageRef {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(ObjectKind::Image, self.handle)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CapturedAttachment {
    pub view: Arc<ImageView>,
    pub layout: ImageLayout,
    pub load_op: AttachmentLoadOp,
    pub store_op: AttachmentStoreOp,
    pub clear_value: ClearValue,
}

impl CapturedAttachment {
    pub fn image_key(&self) -> ObjectKey {
        ObjectKey::of(ObjectKind::Image, self.view.image_handle)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RenderingScope {
    pub render_area: Rect2D,
    pub colors: Vec<CapturedAttachment>,
    pub depth_stencil: Option<CapturedAttachment>,
}

#[derive(Clone, Debug)]
pub(crate) struct BarrierBatch {
    pub src_stage: PipelineStageFlags,
    pub dst_stage: PipelineStageFlags,
    pub memory: Vec<MemoryBarrier>,
    pub buffers: Vec<(BufferRef, BufferMemoryBarrier)>,
    pub images: Vec<(ImageRef, ResolvedRange, ImageMemoryBarrier)>,
}

/// A recorded command.
#[derive(Clone, Debug)]
pub(crate) enum Command {
    BindPipeline(Arc<Pipeline>),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(BufferRef, u64)>,
    },
    BindIndexBuffer {
        buffer: BufferRef,
        offset: u64,
        index_type: IndexType,
    },
    BindDescriptorSets {
        first_set: u32,
        sets: Vec<Arc<DescriptorSet>>,
    },
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport(Viewport),
    SetScissor(Rect2D),
    SetBlendConstants([f32; 4]),
    SetStencilReference {
        faces: StencilFaceFlags,
        reference: u32,
    },
    BeginRendering(RenderingScope),
    EndRendering,
    Draw(DrawCall),
    PipelineBarrier(Box<BarrierBatch>),
    CopyBuffer {
        src: BufferRef,
        dst: BufferRef,
        regions: Vec<BufferCopy>,
    },
    CopyImage {
        src: ImageRef,
        src_layout: ImageLayout,
        dst: ImageRef,
        dst_layout: ImageLayout,
        regions: Vec<ImageCopy>,
    },
    CopyBufferToImage {
        src: BufferRef,
        dst: ImageRef,
        dst_layout: ImageLayout,
        regions: Vec<BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: ImageRef,
        src_layout: ImageLayout,
        dst: BufferRef,
        regions: Vec<BufferImageCopy>,
    },
    FillBuffer {
        dst: BufferRef,
        offset: u64,
        size: u64,
        data: u32,
    },
    UpdateBuffer {
        dst: BufferRef,
        offset: u64,
        data: Vec<u8>,
    },
    ClearColorImage {
        image: ImageRef,
        layout: ImageLayout,
        color: ClearColorValue,
        ranges: Vec<ResolvedRange>,
    },
    ClearDepthStencilImage {
        image: ImageRef,
        layout: ImageLayout,
        value: ClearDepthStencilValue,
        ranges: Vec<ResolvedRange>,
    },
}

/// Bindings made so far, for record-time draw checks.
#[derive(Debug, Default)]
struct BindState {
    pipeline: Option<Arc<Pipeline>>,
    vertex_bindings: u32,
    index_buffer: bool,
    sets: Vec<Option<Arc<DescriptorSet>>>,
}

#[derive(Debug)]
struct RenderTargets {
    colors: Vec<Format>,
    depth_stencil: Option<Format>,
}

/// Mutable recording and lifecycle state of one command buffer.
#[derive(Debug)]
pub(crate) struct Recorder {
    state: CommandBufferState,
    usage: CommandBufferUsageFlags,
    commands: Vec<Command>,
    compiled: Arc<[Command]>,
    referenced: HashSet<ObjectKey>,
    binds: BindState,
    rendering: Option<RenderTargets>,
    /// Submissions of this buffer that have not completed
    pending: u32,
    /// One-time buffer that has been submitted
    consumed: bool,
    /// A referenced object was destroyed while pending
    invalidated: bool,
}

impl Recorder {
    fn new() -> Self {
        Self {
            state: CommandBufferState::Initial,
            usage: CommandBufferUsageFlags::empty(),
            commands: Vec::new(),
            compiled: Arc::from(Vec::new()),
            referenced: HashSet::new(),
            binds: BindState::default(),
            rendering: None,
            pending: 0,
            consumed: false,
            invalidated: false,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn reference(&mut self, key: ObjectKey) {
        self.referenced.insert(key);
    }

    pub fn reference_buffer(&mut self, buffer: &BufferRef) {
        self.reference(buffer.key());
        if let Ok(binding) = buffer.buffer.binding() {
            self.reference(ObjectKey::of(ObjectKind::Memory, binding.handle));
        }
    }

    pub fn reference_image(&mut self, image: &ImageRef) {
        self.reference(image.key());
        if let Ok(binding) = image.image.binding() {
            self.reference(ObjectKey::of(ObjectKind::Memory, binding.handle));
        }
    }

    pub fn outside_rendering(&self, what: &str) -> Result<()> {
        if self.rendering.is_some() {
            return Err(DeviceError::validation(format!(
                "{what} is not allowed inside a rendering scope"
            )));
        }
        Ok(())
    }

    fn inside_rendering(&self, what: &str) -> Result<&RenderTargets> {
        self.rendering.as_ref().ok_or_else(|| {
            DeviceError::validation(format!("{what} is only allowed inside a rendering scope"))
        })
    }

    fn check_draw(&self, indexed: bool) -> Result<()> {
        let targets = self.inside_rendering("draw")?;
        let pipeline = self
            .binds
            .pipeline
            .as_ref()
            .ok_or_else(|| DeviceError::validation("draw without a bound pipeline"))?;
        let state = pipeline.state();

        if state.color_formats != targets.colors || state.depth_stencil_format != targets.depth_stencil {
            return Err(DeviceError::validation(format!(
                "pipeline renders to {:?}/{:?}, rendering scope has {:?}/{:?}",
                state.color_formats, state.depth_stencil_format, targets.colors, targets.depth_stencil
            )));
        }
        if let Some(binding) = state
            .vertex_bindings
            .iter()
            .find(|b| b.binding >= 32 || self.binds.vertex_bindings & (1 << b.binding) == 0)
        {
            return Err(DeviceError::validation(format!(
                "no vertex buffer bound at binding {}",
                binding.binding
            )));
        }
        if indexed && !self.binds.index_buffer {
            return Err(DeviceError::validation("indexed draw without an index buffer"));
        }
        for (index, layout) in pipeline.set_layouts.iter().enumerate() {
            let compatible = self
                .binds
                .sets
                .get(index)
                .and_then(Option::as_ref)
                .is_some_and(|set| std::ptr::eq(set.layout(), &**layout));
            if !compatible {
                return Err(DeviceError::validation(format!(
                    "descriptor set {index} is missing or has an incompatible layout"
                )));
            }
        }
        Ok(())
    }
}

/// Pool that owns command buffers.
#[derive(Debug)]
pub struct CommandPool {
    queue_family: u32,
    flags: CommandPoolCreateFlags,
    buffers: Mutex<Vec<CommandBufferHandle>>,
}

impl CommandPool {
    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn flags(&self) -> CommandPoolCreateFlags {
        self.flags
    }
}

/// A recorded list of commands.
#[derive(Debug)]
pub struct CommandBuffer {
    pool: CommandPoolHandle,
    resettable: bool,
    recorder: Mutex<Recorder>,
}

impl CommandBuffer {
    pub fn pool(&self) -> CommandPoolHandle {
        self.pool
    }

    pub fn state(&self) -> CommandBufferState {
        self.recorder.lock().state
    }

    pub(crate) fn usage(&self) -> CommandBufferUsageFlags {
        self.recorder.lock().usage
    }

    /// Whether the buffer may be submitted. `repeated` is set when the same
    /// buffer already appears earlier in the submission.
    pub(crate) fn check_submittable(&self, repeated: bool) -> Result<()> {
        let recorder = self.recorder.lock();
        if recorder.consumed {
            return Err(DeviceError::InvalidReuse(
                "one-time command buffer submitted again without a reset".into(),
            ));
        }
        let simultaneous = recorder.usage.contains(CommandBufferUsageFlags::SIMULTANEOUS_USE);
        match recorder.state {
            CommandBufferState::Executable if !repeated || simultaneous => Ok(()),
            CommandBufferState::Pending if simultaneous => Ok(()),
            CommandBufferState::Executable | CommandBufferState::Pending => Err(
                DeviceError::NotExecutable("pending without SIMULTANEOUS_USE".into()),
            ),
            state => Err(DeviceError::NotExecutable(format!("state is {state:?}"))),
        }
    }

    /// Move to pending for one more submission and hand out the commands.
    pub(crate) fn begin_execution(&self) -> Arc<[Command]> {
        let mut recorder = self.recorder.lock();
        recorder.pending += 1;
        recorder.state = CommandBufferState::Pending;
        if recorder.usage.contains(CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
            recorder.consumed = true;
        }
        Arc::clone(&recorder.compiled)
    }

    /// Undo [`begin_execution`](Self::begin_execution) for work that was
    /// never handed to a queue.
    pub(crate) fn cancel_execution(&self) {
        let mut recorder = self.recorder.lock();
        recorder.pending = recorder.pending.saturating_sub(1);
        if recorder.usage.contains(CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
            recorder.consumed = false;
        }
        if recorder.pending == 0 {
            recorder.state = if recorder.invalidated {
                CommandBufferState::Invalid
            } else {
                CommandBufferState::Executable
            };
        }
    }

    pub(crate) fn finish_execution(&self) {
        let mut recorder = self.recorder.lock();
        recorder.pending = recorder.pending.saturating_sub(1);
        if recorder.pending == 0 {
            recorder.state = if recorder.invalidated || recorder.consumed {
                CommandBufferState::Invalid
            } else {
                CommandBufferState::Executable
            };
        }
    }
}

impl DeviceContext {
    /// Invalidate every command buffer that references `key`.
    pub(crate) fn invalidate_references(&self, key: ObjectKey) {
        for (handle, buffer) in self.command_buffers.snapshot() {
            let mut recorder = buffer.recorder.lock();
            if !recorder.referenced.contains(&key) {
                continue;
            }
            match recorder.state {
                CommandBufferState::Recording | CommandBufferState::Executable => {
                    recorder.state = CommandBufferState::Invalid;
                    tracing::debug!(?handle, ?key, "Command buffer invalidated");
                }
                CommandBufferState::Pending => recorder.invalidated = true,
                CommandBufferState::Initial | CommandBufferState::Invalid => {}
            }
        }
    }
}

impl Device {
    /// Create a new command pool.
    pub fn create_command_pool(
        &self,
        queue_family: u32,
        flags: CommandPoolCreateFlags,
    ) -> Result<CommandPoolHandle> {
        self.ctx.check_lost()?;
        if queue_family as usize >= self.ctx.capabilities.queue_families.len() {
            return Err(DeviceError::validation(format!(
                "queue family {queue_family} does not exist"
            )));
        }
        let handle = self.ctx.command_pools.insert(CommandPool {
            queue_family,
            flags,
            buffers: Mutex::new(Vec::new()),
        });
        tracing::debug!(?handle, ?flags, "Created command pool");
        Ok(handle)
    }

    /// Allocate multiple command buffers.
    pub fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>> {
        self.ctx.check_lost()?;
        let owner = self.ctx.command_pools.get(pool)?;
        let resettable = owner
            .flags
            .contains(CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let handles: Vec<_> = (0..count)
            .map(|_| {
                self.ctx.command_buffers.insert(CommandBuffer {
                    pool,
                    resettable,
                    recorder: Mutex::new(Recorder::new()),
                })
            })
            .collect();
        owner.buffers.lock().extend_from_slice(&handles);
        Ok(handles)
    }

    pub fn free_command_buffers(
        &self,
        pool: CommandPoolHandle,
        buffers: &[CommandBufferHandle],
    ) -> Result<()> {
        self.ctx.check_lost()?;
        let owner = self.ctx.command_pools.get(pool)?;
        for &handle in buffers {
            let buffer = self.ctx.command_buffers.get(handle)?;
            if buffer.pool != pool {
                return Err(DeviceError::validation("command buffer belongs to another pool"));
            }
            if buffer.state() == CommandBufferState::Pending {
                return Err(DeviceError::validation("command buffer freed while pending"));
            }
        }
        let mut owned = owner.buffers.lock();
        for &handle in buffers {
            self.ctx.command_buffers.remove(handle)?;
            owned.retain(|&h| h != handle);
        }
        Ok(())
    }

    /// Reset every buffer of the pool to the initial state.
    pub fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let owner = self.ctx.command_pools.get(pool)?;
        let buffers = owner
            .buffers
            .lock()
            .iter()
            .map(|&h| self.ctx.command_buffers.get(h))
            .collect::<tessera_core::Result<Vec<_>>>()?;
        if buffers.iter().any(|b| b.state() == CommandBufferState::Pending) {
            return Err(DeviceError::InvalidTransition(
                "pool reset while a command buffer is pending".into(),
            ));
        }
        for buffer in buffers {
            buffer.recorder.lock().reset();
        }
        Ok(())
    }

    pub fn destroy_command_pool(&self, pool: CommandPoolHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let owner = self.ctx.command_pools.get(pool)?;
        let handles = owner.buffers.lock().clone();
        for &handle in &handles {
            if self.ctx.command_buffers.get(handle)?.state() == CommandBufferState::Pending {
                return Err(DeviceError::validation("command pool destroyed while in use"));
            }
        }
        for handle in handles {
            self.ctx.command_buffers.remove(handle)?;
        }
        self.ctx.command_pools.remove(pool)?;
        tracing::debug!(?pool, "Destroyed command pool");
        Ok(())
    }

    /// Current lifecycle state of a command buffer.
    pub fn get_command_buffer_state(&self, cb: CommandBufferHandle) -> Result<CommandBufferState> {
        self.ctx.check_lost()?;
        Ok(self.ctx.command_buffers.get(cb)?.state())
    }

    /// Begin recording a command buffer.
    pub fn begin_command_buffer(
        &self,
        cb: CommandBufferHandle,
        usage: CommandBufferUsageFlags,
    ) -> Result<()> {
        self.ctx.check_lost()?;
        let buffer = self.ctx.command_buffers.get(cb)?;
        let mut recorder = buffer.recorder.lock();
        if recorder.consumed {
            return Err(DeviceError::InvalidReuse(
                "one-time command buffer must be reset before it is recorded again".into(),
            ));
        }
        if recorder.state != CommandBufferState::Initial {
            return Err(DeviceError::InvalidTransition(format!(
                "begin in state {:?}",
                recorder.state
            )));
        }
        recorder.state = CommandBufferState::Recording;
        recorder.usage = usage;
        Ok(())
    }

    /// End recording a command buffer.
    pub fn end_command_buffer(&self, cb: CommandBufferHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let buffer = self.ctx.command_buffers.get(cb)?;
        let mut recorder = buffer.recorder.lock();
        if recorder.state != CommandBufferState::Recording {
            return Err(DeviceError::InvalidTransition(format!(
                "end in state {:?}",
                recorder.state
            )));
        }
        if recorder.rendering.is_some() {
            return Err(DeviceError::InvalidTransition(
                "end with a rendering scope still open".into(),
            ));
        }
        let commands = std::mem::take(&mut recorder.commands);
        tracing::trace!(?cb, commands = commands.len(), "Command buffer recorded");
        recorder.compiled = Arc::from(commands);
        recorder.binds = BindState::default();
        recorder.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Return a command buffer to the initial state.
    pub fn reset_command_buffer(&self, cb: CommandBufferHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let buffer = self.ctx.command_buffers.get(cb)?;
        if !buffer.resettable {
            return Err(DeviceError::validation(
                "pool was not created with RESET_COMMAND_BUFFER",
            ));
        }
        let mut recorder = buffer.recorder.lock();
        if recorder.state == CommandBufferState::Pending {
            return Err(DeviceError::InvalidTransition(
                "reset while pending".into(),
            ));
        }
        recorder.reset();
        Ok(())
    }

    /// Run `f` against the recorder of a buffer in the recording state.
    pub(crate) fn record<R>(
        &self,
        cb: CommandBufferHandle,
        f: impl FnOnce(&mut Recorder) -> Result<R>,
    ) -> Result<R> {
        self.ctx.check_lost()?;
        let buffer = self.ctx.command_buffers.get(cb)?;
        let mut recorder = buffer.recorder.lock();
        if recorder.state != CommandBufferState::Recording {
            return Err(DeviceError::validation(format!(
                "command recorded in state {:?}",
                recorder.state
            )));
        }
        f(&mut recorder)
    }

    /// Resolve a buffer a command uses, checking its usage and binding.
    pub(crate) fn buffer_ref(
        &self,
        handle: BufferHandle,
        usage: BufferUsageFlags,
    ) -> Result<BufferRef> {
        let buffer = self.ctx.buffers.get(handle)?;
        if !buffer.usage().contains(usage) {
            return Err(DeviceError::validation(format!(
                "buffer usage {:?} lacks {usage:?}",
                buffer.usage()
            )));
        }
        buffer.binding()?;
        Ok(BufferRef { buffer, handle })
    }

    /// Resolve an image a command uses, checking its usage and binding.
    pub(crate) fn image_ref(&self, handle: ImageHandle, usage: ImageUsageFlags) -> Result<ImageRef> {
        let image = self.ctx.images.get(handle)?;
        if !image.usage().contains(usage) {
            return Err(DeviceError::validation(format!(
                "image usage {:?} lacks {usage:?}",
                image.usage()
            )));
        }
        image.binding()?;
        Ok(ImageRef { image, handle })
    }

    pub fn cmd_bind_pipeline(&self, cb: CommandBufferHandle, pipeline: PipelineHandle) -> Result<()> {
        let bound = self.ctx.pipelines.get(pipeline)?;
        self.record(cb, |rec| {
            rec.reference(ObjectKey::of(ObjectKind::Pipeline, pipeline));
            rec.binds.pipeline = Some(Arc::clone(&bound));
            rec.push(Command::BindPipeline(bound));
            Ok(())
        })
    }

    pub fn cmd_bind_vertex_buffers(
        &self,
        cb: CommandBufferHandle,
        first_binding: u32,
        buffers: &[BufferHandle],
        offsets: &[u64],
    ) -> Result<()> {
        if buffers.len() != offsets.len() {
            return Err(DeviceError::validation("one offset is required per vertex buffer"));
        }
        let max = self.ctx.capabilities.limits.max_vertex_input_bindings;
        if first_binding as usize + buffers.len() > max as usize {
            return Err(DeviceError::validation(format!(
                "vertex bindings beyond the limit of {max}"
            )));
        }
        let refs = buffers
            .iter()
            .zip(offsets)
            .map(|(&handle, &offset)| {
                let buffer = self.buffer_ref(handle, BufferUsageFlags::VERTEX_BUFFER)?;
                if offset >= buffer.buffer.size() {
                    return Err(DeviceError::validation(format!(
                        "vertex buffer offset {offset} past the end"
                    )));
                }
                Ok((buffer, offset))
            })
            .collect::<Result<Vec<_>>>()?;

        self.record(cb, |rec| {
            for (index, (buffer, _)) in refs.iter().enumerate() {
                rec.reference_buffer(buffer);
                rec.binds.vertex_bindings |= 1 << (first_binding as usize + index);
            }
            rec.push(Command::BindVertexBuffers {
                first_binding,
                buffers: refs,
            });
            Ok(())
        })
    }

    pub fn cmd_bind_index_buffer(
        &self,
        cb: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    ) -> Result<()> {
        let buffer = self.buffer_ref(buffer, BufferUsageFlags::INDEX_BUFFER)?;
        if offset % u64::from(index_type.size()) != 0 || offset >= buffer.buffer.size() {
            return Err(DeviceError::validation(format!(
                "index buffer offset {offset} is misaligned or past the end"
            )));
        }
        self.record(cb, |rec| {
            rec.reference_buffer(&buffer);
            rec.binds.index_buffer = true;
            rec.push(Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            });
            Ok(())
        })
    }

    pub fn cmd_bind_descriptor_sets(
        &self,
        cb: CommandBufferHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) -> Result<()> {
        let max = self.ctx.capabilities.limits.max_bound_descriptor_sets;
        if first_set as usize + sets.len() > max as usize {
            return Err(DeviceError::validation(format!(
                "descriptor sets beyond the limit of {max}"
            )));
        }
        let resolved = sets
            .iter()
            .map(|&handle| self.ctx.descriptor_sets.get(handle).map(|set| (handle, set)))
            .collect::<tessera_core::Result<Vec<_>>>()?;

        self.record(cb, |rec| {
            for (index, (handle, set)) in resolved.iter().enumerate() {
                rec.reference(ObjectKey::of(ObjectKind::DescriptorSet, *handle));
                for (_, entry) in set.entries() {
                    for key in entry.keys() {
                        rec.reference(key);
                    }
                }
                let slot = first_set as usize + index;
                if rec.binds.sets.len() <= slot {
                    rec.binds.sets.resize(slot + 1, None);
                }
                rec.binds.sets[slot] = Some(Arc::clone(set));
            }
            rec.push(Command::BindDescriptorSets {
                first_set,
                sets: resolved.into_iter().map(|(_, set)| set).collect(),
            });
            Ok(())
        })
    }

    pub fn cmd_push_constants(
        &self,
        cb: CommandBufferHandle,
        stages: crate::descriptors::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        let max = self.ctx.capabilities.limits.max_push_constants_size;
        let end = offset as usize + data.len();
        if offset % 4 != 0 || data.len() % 4 != 0 || data.is_empty() || end > max as usize {
            return Err(DeviceError::validation(format!(
                "push constants {offset}+{} must be 4-byte aligned within {max} bytes",
                data.len()
            )));
        }
        self.record(cb, |rec| {
            if let Some(pipeline) = &rec.binds.pipeline {
                let covered = pipeline.push_constant_ranges.iter().any(|range| {
                    range.stages.contains(stages)
                        && range.offset <= offset
                        && (range.offset + range.size) as usize >= end
                });
                if !covered {
                    return Err(DeviceError::validation(
                        "push constants outside the pipeline's ranges",
                    ));
                }
            }
            rec.push(Command::PushConstants {
                offset,
                data: data.to_vec(),
            });
            Ok(())
        })
    }

    pub fn cmd_set_viewport(&self, cb: CommandBufferHandle, viewport: Viewport) -> Result<()> {
        if viewport.width <= 0.0 || viewport.height == 0.0 {
            return Err(DeviceError::validation(
                "viewport must have a positive width and non-zero height",
            ));
        }
        let limits = &self.ctx.capabilities.limits;
        let max = limits.max_viewport_dimensions[0].min(limits.max_viewport_dimensions[1]);
        if !viewport.fits(max, limits.viewport_bounds_range) {
            return Err(DeviceError::validation(format!(
                "viewport {viewport:?} exceeds {max} pixels or the bounds {:?}",
                limits.viewport_bounds_range
            )));
        }
        self.record(cb, |rec| {
            rec.push(Command::SetViewport(viewport));
            Ok(())
        })
    }

    pub fn cmd_set_scissor(&self, cb: CommandBufferHandle, scissor: Rect2D) -> Result<()> {
        if scissor.offset.x < 0 || scissor.offset.y < 0 {
            return Err(DeviceError::validation("scissor offset must be non-negative"));
        }
        self.record(cb, |rec| {
            rec.push(Command::SetScissor(scissor));
            Ok(())
        })
    }

    pub fn cmd_set_blend_constants(&self, cb: CommandBufferHandle, constants: [f32; 4]) -> Result<()> {
        self.record(cb, |rec| {
            rec.push(Command::SetBlendConstants(constants));
            Ok(())
        })
    }

    pub fn cmd_set_stencil_reference(
        &self,
        cb: CommandBufferHandle,
        faces: StencilFaceFlags,
        reference: u32,
    ) -> Result<()> {
        self.record(cb, |rec| {
            rec.push(Command::SetStencilReference { faces, reference });
            Ok(())
        })
    }

    fn capture_attachment(
        &self,
        attachment: &RenderingAttachment,
        render_area: Rect2D,
        depth: bool,
    ) -> Result<(CapturedAttachment, ImageViewHandle)> {
        let view = self.ctx.image_views.get(attachment.view)?;
        let (usage, kind) = if depth {
            (ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT, "depth/stencil")
        } else {
            (ImageUsageFlags::COLOR_ATTACHMENT, "color")
        };
        if !view.image.usage().contains(usage) || view.format().is_color() == depth {
            return Err(DeviceError::validation(format!(
                "{:?} view cannot be a {kind} attachment",
                view.format()
            )));
        }
        if !Rect2D::from_extent(view.extent()).encloses(render_area) {
            return Err(DeviceError::validation(format!(
                "render area {render_area:?} exceeds attachment extent {:?}",
                view.extent()
            )));
        }
        let clear_fits = matches!(
            (attachment.clear_value, depth),
            (ClearValue::Color(_), false) | (ClearValue::DepthStencil(_), true)
        );
        if attachment.load_op == AttachmentLoadOp::Clear && !clear_fits {
            return Err(DeviceError::validation(format!(
                "{kind} attachment cleared with the wrong kind of clear value"
            )));
        }
        Ok((
            CapturedAttachment {
                view,
                layout: attachment.layout,
                load_op: attachment.load_op,
                store_op: attachment.store_op,
                clear_value: attachment.clear_value,
            },
            attachment.view,
        ))
    }

    /// Open a dynamic rendering scope.
    pub fn cmd_begin_rendering(&self, cb: CommandBufferHandle, info: &RenderingInfo) -> Result<()> {
        if info.render_area.is_empty() || info.render_area.offset.x < 0 || info.render_area.offset.y < 0 {
            return Err(DeviceError::validation("render area must be non-empty and non-negative"));
        }
        let max = self.ctx.capabilities.limits.max_color_attachments;
        if info.color_attachments.len() > max as usize {
            return Err(DeviceError::validation(format!(
                "{} color attachments, at most {max} allowed",
                info.color_attachments.len()
            )));
        }
        let colors = info
            .color_attachments
            .iter()
            .map(|a| self.capture_attachment(a, info.render_area, false))
            .collect::<Result<Vec<_>>>()?;
        let depth_stencil = info
            .depth_stencil_attachment
            .as_ref()
            .map(|a| self.capture_attachment(a, info.render_area, true))
            .transpose()?;

        self.record(cb, |rec| {
            if rec.rendering.is_some() {
                return Err(DeviceError::validation("rendering scopes cannot nest"));
            }
            for (attachment, handle) in colors.iter().chain(&depth_stencil) {
                rec.reference(ObjectKey::of(ObjectKind::ImageView, *handle));
                rec.reference_image(&ImageRef {
                    image: Arc::clone(&attachment.view.image),
                    handle: attachment.view.image_handle,
                });
            }
            rec.rendering = Some(RenderTargets {
                colors: colors.iter().map(|(a, _)| a.view.format()).collect(),
                depth_stencil: depth_stencil.as_ref().map(|(a, _)| a.view.format()),
            });
            rec.push(Command::BeginRendering(RenderingScope {
                render_area: info.render_area,
                colors: colors.into_iter().map(|(a, _)| a).collect(),
                depth_stencil: depth_stencil.map(|(a, _)| a),
            }));
            Ok(())
        })
    }

    pub fn cmd_end_rendering(&self, cb: CommandBufferHandle) -> Result<()> {
        self.record(cb, |rec| {
            rec.inside_rendering("end rendering")?;
            rec.rendering = None;
            rec.push(Command::EndRendering);
            Ok(())
        })
    }

    pub fn cmd_draw(
        &self,
        cb: CommandBufferHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.record(cb, |rec| {
            rec.check_draw(false)?;
            rec.push(Command::Draw(DrawCall::Direct {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            }));
            Ok(())
        })
    }

    pub fn cmd_draw_indexed(
        &self,
        cb: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.record(cb, |rec| {
            rec.check_draw(true)?;
            rec.push(Command::Draw(DrawCall::Indexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            }));
            Ok(())
        })
    }

    /// Record an execution and memory dependency.
    pub fn cmd_pipeline_barrier(
        &self,
        cb: CommandBufferHandle,
        src_stage: PipelineStageFlags,
        dst_stage: PipelineStageFlags,
        memory_barriers: &[MemoryBarrier],
        buffer_barriers: &[BufferMemoryBarrier],
        image_barriers: &[ImageMemoryBarrier],
    ) -> Result<()> {
        if src_stage.is_empty() || dst_stage.is_empty() {
            return Err(DeviceError::validation("barrier stage masks must not be empty"));
        }
        let buffers = buffer_barriers
            .iter()
            .map(|barrier| {
                let buffer = self.buffer_ref(barrier.buffer, BufferUsageFlags::empty())?;
                buffer.buffer.resolve_range(barrier.offset, barrier.size)?;
                Ok((buffer, *barrier))
            })
            .collect::<Result<Vec<_>>>()?;
        let images = image_barriers
            .iter()
            .map(|barrier| {
                if matches!(
                    barrier.new_layout,
                    ImageLayout::Undefined | ImageLayout::Preinitialized
                ) {
                    return Err(DeviceError::validation(format!(
                        "cannot transition to {:?}",
                        barrier.new_layout
                    )));
                }
                let image = self.image_ref(barrier.image, ImageUsageFlags::empty())?;
                let range = image.image.resolve(&barrier.subresource_range)?;
                Ok((image, range, *barrier))
            })
            .collect::<Result<Vec<_>>>()?;

        self.record(cb, |rec| {
            rec.outside_rendering("pipeline barrier")?;
            for (buffer, _) in &buffers {
                rec.reference_buffer(buffer);
            }
            for (image, _, _) in &images {
                rec.reference_image(image);
            }
            rec.push(Command::PipelineBarrier(Box::new(BarrierBatch {
                src_stage,
                dst_stage,
                memory: memory_barriers.to_vec(),
                buffers,
                images,
            })));
            Ok(())
        })
    }

    /// Record, submit and wait for a one-time command buffer.
    pub fn execute_single_time_commands<F>(
        &self,
        pool: CommandPoolHandle,
        queue: Queue,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&Self, CommandBufferHandle) -> Result<()>,
    {
        let cmd = self
            .allocate_command_buffers(pool, 1)?
            .pop()
            .ok_or_else(|| DeviceError::validation("no command buffer allocated"))?;

        let result = self
            .begin_command_buffer(cmd, CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .and_then(|()| f(self, cmd))
            .and_then(|()| self.end_command_buffer(cmd))
            .and_then(|()| {
                self.queue_submit(queue, &[SubmitInfo::default().command_buffers(&[cmd])], None)
            })
            .and_then(|()| self.queue_wait_idle(queue));

        self.free_command_buffers(pool, &[cmd])?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceBuilder;
    use crate::memory::MemoryAllocateInfo;
    use crate::resource::BufferCreateInfo;

    fn setup(flags: CommandPoolCreateFlags) -> (Device, CommandPoolHandle, CommandBufferHandle) {
        let device = DeviceBuilder::new().build().unwrap();
        let pool = device.create_command_pool(0, flags).unwrap();
        let cb = device.allocate_command_buffers(pool, 1).unwrap()[0];
        (device, pool, cb)
    }

    fn transfer_buffer(device: &Device) -> BufferHandle {
        let buffer = device
            .create_buffer(&BufferCreateInfo {
                size: 64,
                usage: BufferUsageFlags::TRANSFER_DST | BufferUsageFlags::TRANSFER_SRC,
            })
            .unwrap();
        let memory = device
            .allocate_memory(&MemoryAllocateInfo {
                size: 64,
                alignment: 16,
                memory_type_index: 1,
            })
            .unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        buffer
    }

    #[test]
    fn recording_transitions() {
        let (device, _pool, cb) = setup(CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let state = |cb| device.get_command_buffer_state(cb).unwrap();
        assert_eq!(state(cb), CommandBufferState::Initial);

        device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()).unwrap();
        assert_eq!(state(cb), CommandBufferState::Recording);
        assert!(matches!(
            device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()),
            Err(DeviceError::InvalidTransition(_))
        ));

        device.end_command_buffer(cb).unwrap();
        assert_eq!(state(cb), CommandBufferState::Executable);
        assert!(matches!(
            device.end_command_buffer(cb),
            Err(DeviceError::InvalidTransition(_))
        ));
        assert!(matches!(
            device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()),
            Err(DeviceError::InvalidTransition(_))
        ));

        device.reset_command_buffer(cb).unwrap();
        assert_eq!(state(cb), CommandBufferState::Initial);
    }

    #[test]
    fn reset_requires_pool_flag() {
        let (device, pool, cb) = setup(CommandPoolCreateFlags::empty());
        device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()).unwrap();
        device.end_command_buffer(cb).unwrap();
        assert!(matches!(
            device.reset_command_buffer(cb),
            Err(DeviceError::ValidationFailed(_))
        ));
        device.reset_command_pool(pool).unwrap();
        assert_eq!(
            device.get_command_buffer_state(cb).unwrap(),
            CommandBufferState::Initial
        );
    }

    #[test]
    fn commands_require_recording() {
        let (device, _pool, cb) = setup(CommandPoolCreateFlags::empty());
        assert!(matches!(
            device.cmd_set_blend_constants(cb, [0.0; 4]),
            Err(DeviceError::ValidationFailed(_))
        ));
    }

    #[test]
    fn viewport_must_fit_the_limits() {
        let (device, _pool, cb) = setup(CommandPoolCreateFlags::empty());
        device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()).unwrap();
        let limits = device.capabilities().limits;
        let max = limits.max_viewport_dimensions[0] as f32;
        let viewport = Viewport { width: max, height: max, ..Viewport::default() };

        device.cmd_set_viewport(cb, viewport).unwrap();
        device
            .cmd_set_viewport(cb, Viewport { y: max, height: -max, ..viewport })
            .unwrap();
        for bad in [
            Viewport { width: max + 1.0, ..viewport },
            Viewport { x: -5e7, y: -5e7, width: 1e8, height: 1e8, ..viewport },
            Viewport { x: limits.viewport_bounds_range[1], width: 16.0, ..viewport },
        ] {
            assert!(matches!(
                device.cmd_set_viewport(cb, bad),
                Err(DeviceError::ValidationFailed(_))
            ));
        }
        device.end_command_buffer(cb).unwrap();
    }

    #[test]
    fn structural_rules() {
        let (device, _pool, cb) = setup(CommandPoolCreateFlags::empty());
        device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()).unwrap();

        // Draw outside rendering.
        assert!(matches!(
            device.cmd_draw(cb, 3, 1, 0, 0),
            Err(DeviceError::ValidationFailed(_))
        ));
        // End rendering without begin.
        assert!(device.cmd_end_rendering(cb).is_err());
        // Misaligned push constants.
        assert!(device
            .cmd_push_constants(cb, crate::descriptors::ShaderStageFlags::VERTEX, 2, &[0; 4])
            .is_err());
        // Failed commands leave the buffer recording.
        device.end_command_buffer(cb).unwrap();
    }

    #[test]
    fn stale_handles_are_rejected_at_record_time() {
        let (device, _pool, cb) = setup(CommandPoolCreateFlags::empty());
        let buffer = transfer_buffer(&device);
        device.destroy_buffer(buffer).unwrap();
        device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()).unwrap();
        assert!(matches!(
            device.cmd_fill_buffer(cb, buffer, 0, 16, 0),
            Err(DeviceError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn destroying_a_reference_invalidates() {
        let (device, _pool, cb) = setup(CommandPoolCreateFlags::empty());
        let buffer = transfer_buffer(&device);
        device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()).unwrap();
        device.cmd_fill_buffer(cb, buffer, 0, 16, 7).unwrap();
        device.end_command_buffer(cb).unwrap();

        device.destroy_buffer(buffer).unwrap();
        assert_eq!(
            device.get_command_buffer_state(cb).unwrap(),
            CommandBufferState::Invalid
        );
    }

    #[test]
    fn unrelated_destroy_keeps_buffer_executable() {
        let (device, _pool, cb) = setup(CommandPoolCreateFlags::empty());
        let used = transfer_buffer(&device);
        let other = transfer_buffer(&device);
        device.begin_command_buffer(cb, CommandBufferUsageFlags::empty()).unwrap();
        device.cmd_fill_buffer(cb, used, 0, 16, 7).unwrap();
        device.end_command_buffer(cb).unwrap();

        device.destroy_buffer(other).unwrap();
        assert_eq!(
            device.get_command_buffer_state(cb).unwrap(),
            CommandBufferState::Executable
        );
    }

    #[test]
    fn free_removes_buffers() {
        let (device, pool, cb) = setup(CommandPoolCreateFlags::empty());
        device.free_command_buffers(pool, &[cb]).unwrap();
        assert!(matches!(
            device.get_command_buffer_state(cb),
            Err(DeviceError::InvalidHandle { .. })
        ));
        device.destroy_command_pool(pool).unwrap();
    }
}
