//! Device context management.

use crate::capabilities::Capabilities;
use crate::command::{CommandBuffer, CommandPool};
use crate::config::{DeviceConfig, HeapConfig};
use crate::descriptors::{DescriptorPool, DescriptorSet, DescriptorSetLayout};
use crate::error::{DeviceError, Result};
use crate::memory::{DeviceMemory, Heap};
use crate::pipeline::Pipeline;
use crate::queue::{Queue, QueueWorker};
use crate::resource::{Buffer, BufferView, Image, ImageView, Sampler};
use crate::sync::{Fence, Semaphore, SyncHub};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{Handle, Registry};

/// Type of a device object, used to key references and hazards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Memory,
    Buffer,
    Image,
    BufferView,
    ImageView,
    Sampler,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    Pipeline,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
}

/// An object identified by kind and raw handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub raw: u64,
}

impl ObjectKey {
    pub const fn new(kind: ObjectKind, raw: u64) -> Self {
        Self { kind, raw }
    }

    pub const fn of<T>(kind: ObjectKind, handle: Handle<T>) -> Self {
        Self::new(kind, handle.to_raw())
    }
}

/// Counters kept by the device.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub submissions: AtomicU64,
    pub command_buffers_executed: AtomicU64,
    pub command_buffers_aborted: AtomicU64,
    pub draws: AtomicU64,
    pub primitives: AtomicU64,
    pub fragments_written: AtomicU64,
    pub hazards: AtomicU64,
}

impl Diagnostics {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

/// Snapshot of the device counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceDiagnostics {
    pub submissions: u64,
    pub command_buffers_executed: u64,
    pub command_buffers_aborted: u64,
    pub draws: u64,
    pub primitives: u64,
    pub fragments_written: u64,
    pub hazards: u64,
}

/// State shared by the device front end and its queue workers.
pub struct DeviceContext {
    pub(crate) config: DeviceConfig,
    pub(crate) capabilities: Capabilities,
    lost: AtomicBool,
    pub(crate) sync: SyncHub,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) heaps: Vec<Heap>,
    /// Held by `queue_submit` from validation through hand-off to a worker
    pub(crate) submit_lock: Mutex<()>,

    pub(crate) memory: Registry<DeviceMemory>,
    pub(crate) buffers: Registry<Buffer>,
    pub(crate) images: Registry<Image>,
    pub(crate) buffer_views: Registry<BufferView>,
    pub(crate) image_views: Registry<ImageView>,
    pub(crate) samplers: Registry<Sampler>,
    pub(crate) set_layouts: Registry<DescriptorSetLayout>,
    pub(crate) descriptor_pools: Registry<DescriptorPool>,
    pub(crate) descriptor_sets: Registry<DescriptorSet>,
    pub(crate) pipelines: Registry<Pipeline>,
    pub(crate) command_pools: Registry<CommandPool>,
    pub(crate) command_buffers: Registry<CommandBuffer>,
    pub(crate) fences: Registry<Fence>,
    pub(crate) semaphores: Registry<Semaphore>,
}

impl DeviceContext {
    fn new(config: DeviceConfig, capabilities: Capabilities) -> Self {
        let heaps = config.heaps.iter().map(Heap::new).collect();
        Self {
            config,
            capabilities,
            lost: AtomicBool::new(false),
            sync: SyncHub::default(),
            diagnostics: Diagnostics::default(),
            heaps,
            submit_lock: Mutex::new(()),
            memory: Registry::new(),
            buffers: Registry::new(),
            images: Registry::new(),
            buffer_views: Registry::new(),
            image_views: Registry::new(),
            samplers: Registry::new(),
            set_layouts: Registry::new(),
            descriptor_pools: Registry::new(),
            descriptor_sets: Registry::new(),
            pipelines: Registry::new(),
            command_pools: Registry::new(),
            command_buffers: Registry::new(),
            fences: Registry::new(),
            semaphores: Registry::new(),
        }
    }

    /// Whether validation runs during recording and replay.
    pub fn validation(&self) -> bool {
        self.config.validation
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Fail with [`DeviceError::DeviceLost`] once the device is lost.
    pub(crate) fn check_lost(&self) -> Result<()> {
        if self.is_lost() {
            Err(DeviceError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Lose the device and wake every waiter.
    pub(crate) fn mark_lost(&self, reason: &str) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            tracing::error!("Device lost: {reason}");
        }
        self.sync.notify();
    }

    pub(crate) fn lost_flag(&self) -> &AtomicBool {
        &self.lost
    }

    pub fn diagnostics(&self) -> DeviceDiagnostics {
        let d = &self.diagnostics;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeviceDiagnostics {
            submissions: load(&d.submissions),
            command_buffers_executed: load(&d.command_buffers_executed),
            command_buffers_aborted: load(&d.command_buffers_aborted),
            draws: load(&d.draws),
            primitives: load(&d.primitives),
            fragments_written: load(&d.fragments_written),
            hazards: load(&d.hazards),
        }
    }
}

/// A software graphics device.
///
/// Dropping the device closes every queue and joins its worker thread after
/// the work already submitted has finished.
pub struct Device {
    pub(crate) ctx: Arc<DeviceContext>,
    pub(crate) queues: Vec<QueueWorker>,
}

impl Device {
    /// Get device capabilities.
    pub fn capabilities(&self) -> &Capabilities {
        &self.ctx.capabilities
    }

    /// Get the configuration the device was built with.
    pub fn config(&self) -> &DeviceConfig {
        &self.ctx.config
    }

    /// Get the shared device context.
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Snapshot of the device counters.
    pub fn diagnostics(&self) -> DeviceDiagnostics {
        self.ctx.diagnostics()
    }

    pub fn is_lost(&self) -> bool {
        self.ctx.is_lost()
    }

    /// Get a queue of the given family.
    pub fn get_queue(&self, family: u32, index: u32) -> Result<Queue> {
        self.ctx.check_lost()?;
        if family != 0 || index as usize >= self.queues.len() {
            return Err(DeviceError::validation(format!(
                "no queue {index} in family {family}"
            )));
        }
        Ok(Queue::new(family, index))
    }

    /// Number of queues.
    pub fn queue_count(&self) -> u32 {
        self.queues.len() as u32
    }

    /// Wait until every queue is idle.
    pub fn device_wait_idle(&self) -> Result<()> {
        self.ctx.check_lost()?;
        for worker in &self.queues {
            worker.wait_idle(&self.ctx)?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for worker in &mut self.queues {
            worker.close();
        }
        for worker in &mut self.queues {
            worker.join();
        }
        tracing::info!("Device '{}' destroyed", self.ctx.config.app_name);
    }
}

/// Builder for creating a device.
pub struct DeviceBuilder {
    config: DeviceConfig,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            config: DeviceConfig::default().with_env_overrides(),
        }
    }
}

impl DeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an explicit configuration.
    pub fn from_config(config: DeviceConfig) -> Self {
        Self { config }
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    /// Enable or disable validation.
    #[must_use]
    pub fn validation(mut self, enable: bool) -> Self {
        self.config.validation = enable;
        self
    }

    /// Replace the heap list.
    #[must_use]
    pub fn heaps(mut self, heaps: Vec<HeapConfig>) -> Self {
        self.config.heaps = heaps;
        self
    }

    #[must_use]
    pub fn queue_count(mut self, count: u32) -> Self {
        self.config.queue_count = count;
        self
    }

    #[must_use]
    pub fn submission_queue_depth(mut self, depth: usize) -> Self {
        self.config.submission_queue_depth = depth;
        self
    }

    #[must_use]
    pub fn max_image_dimension(mut self, dimension: u32) -> Self {
        self.config.max_image_dimension = dimension;
        self
    }

    /// Build the device and start its queue workers.
    pub fn build(self) -> Result<Device> {
        let config = self.config;
        if config.heaps.is_empty() || config.heaps.len() > 32 {
            return Err(DeviceError::validation("between 1 and 32 heaps are required"));
        }
        if config.heaps.iter().any(|h| h.size == 0) {
            return Err(DeviceError::validation("heap size must be non-zero"));
        }
        if config.queue_count == 0 || config.submission_queue_depth == 0 {
            return Err(DeviceError::validation(
                "queue count and submission queue depth must be non-zero",
            ));
        }
        if config.max_image_dimension == 0
            || config.max_image_dimension > tessera_core::constants::MAX_VIEWPORT_DIMENSION
        {
            return Err(DeviceError::validation(format!(
                "max image dimension must be between 1 and {}",
                tessera_core::constants::MAX_VIEWPORT_DIMENSION
            )));
        }

        let capabilities = Capabilities::from_config(&config);
        tracing::info!("Created device: {}", capabilities.summary());
        tracing::info!(
            app = %config.app_name,
            validation = config.validation,
            "Device configuration"
        );

        let ctx = Arc::new(DeviceContext::new(config, capabilities));
        let queues = (0..ctx.config.queue_count)
            .map(|index| QueueWorker::spawn(Arc::clone(&ctx), index))
            .collect::<Result<Vec<_>>>()?;

        Ok(Device { ctx, queues })
    }
}
