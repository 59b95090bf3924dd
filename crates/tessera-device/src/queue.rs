//! Queues and their worker threads.
//!
//! Every queue owns one worker fed by a bounded channel. `queue_submit`
//! validates and commits a submission on the calling thread, then hands the
//! batch to the worker, blocking while the channel is full.

use crate::command::{Command, CommandBuffer, CommandBufferHandle};
use crate::context::{Device, DeviceContext};
use crate::error::{DeviceError, Result};
use crate::hazard::PipelineStageFlags;
use crate::sync::{Fence, FenceHandle, FenceState, Semaphore, SemaphoreHandle};
use crossbeam::channel::{self, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A queue of the device, identified by family and index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Queue {
    family: u32,
    index: u32,
}

impl Queue {
    pub(crate) const fn new(family: u32, index: u32) -> Self {
        Self { family, index }
    }

    pub const fn family(self) -> u32 {
        self.family
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

/// One batch of work for `queue_submit`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [SemaphoreHandle],
    /// Stage at which each wait semaphore is waited on
    pub wait_dst_stage_mask: &'a [PipelineStageFlags],
    pub command_buffers: &'a [CommandBufferHandle],
    pub signal_semaphores: &'a [SemaphoreHandle],
}

impl<'a> SubmitInfo<'a> {
    #[must_use]
    pub const fn wait_semaphores(mut self, semaphores: &'a [SemaphoreHandle]) -> Self {
        self.wait_semaphores = semaphores;
        self
    }

    #[must_use]
    pub const fn wait_dst_stage_mask(mut self, stages: &'a [PipelineStageFlags]) -> Self {
        self.wait_dst_stage_mask = stages;
        self
    }

    #[must_use]
    pub const fn command_buffers(mut self, command_buffers: &'a [CommandBufferHandle]) -> Self {
        self.command_buffers = command_buffers;
        self
    }

    #[must_use]
    pub const fn signal_semaphores(mut self, semaphores: &'a [SemaphoreHandle]) -> Self {
        self.signal_semaphores = semaphores;
        self
    }
}

/// A command buffer handed to a worker with its commands.
pub(crate) struct Execution {
    pub handle: CommandBufferHandle,
    pub buffer: Arc<CommandBuffer>,
    pub commands: Arc<[Command]>,
}

/// One submit info, resolved.
pub(crate) struct Submission {
    pub waits: Vec<Arc<Semaphore>>,
    pub executions: Vec<Execution>,
    pub signals: Vec<Arc<Semaphore>>,
}

/// Everything one `queue_submit` call sends to a worker.
pub(crate) struct Batch {
    pub id: u64,
    pub submissions: Vec<Submission>,
    pub fence: Option<Arc<Fence>>,
}

impl Batch {
    /// Release everything the commit claimed for a batch no worker will run.
    fn roll_back(self) {
        if let Some(fence) = &self.fence {
            fence.cancel_pending();
        }
        for submission in self.submissions {
            submission.waits.iter().for_each(|s| s.release_wait());
            submission.signals.iter().for_each(|s| s.release_signal());
            for execution in submission.executions {
                execution.buffer.cancel_execution();
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueProgress {
    submitted: AtomicU64,
    completed: AtomicU64,
}

/// Worker thread and channel of one queue.
pub(crate) struct QueueWorker {
    index: u32,
    sender: Option<Sender<Batch>>,
    thread: Option<JoinHandle<()>>,
    progress: Arc<QueueProgress>,
}

impl QueueWorker {
    pub fn spawn(ctx: Arc<DeviceContext>, index: u32) -> Result<Self> {
        let (sender, receiver) = channel::bounded(ctx.config.submission_queue_depth);
        let progress = Arc::new(QueueProgress::default());
        let thread = std::thread::Builder::new()
            .name(format!("tessera-queue-{index}"))
            .spawn({
                let progress = Arc::clone(&progress);
                move || run(&ctx, index, &receiver, &progress)
            })
            .map_err(|e| DeviceError::OutOfHostMemory(format!("queue thread: {e}")))?;

        Ok(Self {
            index,
            sender: Some(sender),
            thread: Some(thread),
            progress,
        })
    }

    /// Hand `batch` to the worker, giving it back if the worker is gone.
    fn send(&self, batch: Batch) -> std::result::Result<(), Batch> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(batch);
        };
        self.progress.submitted.fetch_add(1, Ordering::AcqRel);
        sender.send(batch).map_err(|err| {
            self.progress.submitted.fetch_sub(1, Ordering::AcqRel);
            err.into_inner()
        })
    }

    /// Stop accepting work. The worker drains what was already sent.
    pub fn close(&mut self) {
        self.sender = None;
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(queue = self.index, "Queue worker panicked");
            }
        }
    }

    /// Block until every batch sent so far has completed.
    pub fn wait_idle(&self, ctx: &DeviceContext) -> Result<()> {
        let target = self.progress.submitted.load(Ordering::Acquire);
        ctx.sync.wait_until(ctx.lost_flag(), None, || {
            (self.progress.completed.load(Ordering::Acquire) >= target).then_some(())
        })
    }
}

fn run(ctx: &DeviceContext, index: u32, receiver: &Receiver<Batch>, progress: &QueueProgress) {
    tracing::info!(queue = index, "Queue worker started");
    while let Ok(batch) = receiver.recv() {
        crate::execute::execute_batch(ctx, index, batch);
        progress.completed.fetch_add(1, Ordering::AcqRel);
        ctx.sync.notify();
    }
    tracing::info!(queue = index, "Queue worker stopped");
}

impl Device {
    fn worker(&self, queue: Queue) -> Result<&QueueWorker> {
        self.queues
            .get(queue.index as usize)
            .filter(|_| queue.family == 0)
            .ok_or_else(|| DeviceError::validation(format!("unknown queue {queue:?}")))
    }

    /// Submit batches of command buffers to a queue.
    ///
    /// Everything is validated before anything is committed, so a failed
    /// submit leaves every command buffer, semaphore and fence untouched.
    /// Concurrent submits are serialized.
    pub fn queue_submit(
        &self,
        queue: Queue,
        submits: &[SubmitInfo<'_>],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        self.ctx.check_lost()?;
        let worker = self.worker(queue)?;
        // Claims on semaphore signals and command buffer states must not
        // interleave between validation and commit.
        let _submit = self.ctx.submit_lock.lock();

        let fence = fence.map(|f| self.ctx.fences.get(f)).transpose()?;
        if let Some(fence) = &fence {
            if fence.state() != FenceState::Unsignaled {
                return Err(DeviceError::validation(format!(
                    "fence submitted in state {:?}",
                    fence.state()
                )));
            }
        }

        // Signals available per semaphore as the submission proceeds
        let mut available: HashMap<u64, i64> = HashMap::new();
        let mut seen = HashSet::new();
        let mut submissions = Vec::with_capacity(submits.len());

        for submit in submits {
            if submit.wait_semaphores.len() != submit.wait_dst_stage_mask.len() {
                return Err(DeviceError::validation(
                    "one wait stage mask is required per wait semaphore",
                ));
            }

            let mut waits = Vec::with_capacity(submit.wait_semaphores.len());
            for &handle in submit.wait_semaphores {
                let semaphore = self.ctx.semaphores.get(handle)?;
                let count = available
                    .entry(handle.to_raw())
                    .or_insert_with(|| semaphore.unclaimed());
                if *count <= 0 {
                    return Err(DeviceError::validation(format!(
                        "wait on {handle:?} that has no signal operation pending"
                    )));
                }
                *count -= 1;
                waits.push(semaphore);
            }

            let mut executions = Vec::with_capacity(submit.command_buffers.len());
            for &handle in submit.command_buffers {
                let buffer = self.ctx.command_buffers.get(handle)?;
                let pool = self.ctx.command_pools.get(buffer.pool())?;
                if pool.queue_family() != queue.family {
                    return Err(DeviceError::validation(
                        "command buffer allocated for another queue family",
                    ));
                }
                buffer.check_submittable(!seen.insert(handle))?;
                executions.push((handle, buffer));
            }

            let mut signals = Vec::with_capacity(submit.signal_semaphores.len());
            for &handle in submit.signal_semaphores {
                let semaphore = self.ctx.semaphores.get(handle)?;
                let count = available
                    .entry(handle.to_raw())
                    .or_insert_with(|| semaphore.unclaimed());
                if *count != 0 {
                    return Err(DeviceError::validation(format!(
                        "signal of {handle:?}, which is already signaled or pending"
                    )));
                }
                *count += 1;
                signals.push(semaphore);
            }
            submissions.push((waits, executions, signals));
        }

        // Commit
        if let Some(fence) = &fence {
            fence.begin_pending()?;
        }
        let submissions = submissions
            .into_iter()
            .map(|(waits, executions, signals)| {
                waits.iter().for_each(|s| s.reserve_wait());
                signals.iter().for_each(|s| s.reserve_signal());
                Submission {
                    waits,
                    executions: executions
                        .into_iter()
                        .map(|(handle, buffer)| Execution {
                            handle,
                            commands: buffer.begin_execution(),
                            buffer,
                        })
                        .collect(),
                    signals,
                }
            })
            .collect::<Vec<_>>();

        let id = self.ctx.diagnostics.submissions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            queue = queue.index,
            id,
            batches = submissions.len(),
            command_buffers = submissions.iter().map(|s| s.executions.len()).sum::<usize>(),
            "Queue submit"
        );
        worker
            .send(Batch {
                id,
                submissions,
                fence,
            })
            .map_err(|batch| {
                tracing::error!(queue = queue.index, id, "Queue worker gone, submission rolled back");
                batch.roll_back();
                DeviceError::DeviceLost
            })
    }

    /// Block until all work submitted to `queue` has completed.
    pub fn queue_wait_idle(&self, queue: Queue) -> Result<()> {
        self.ctx.check_lost()?;
        self.worker(queue)?.wait_idle(&self.ctx)
    }
}
