//! Synchronization primitives.
//!
//! Fences and semaphores are binary. Every wait in the device, whether a
//! host fence wait, a queue worker waiting on a semaphore, or an idle wait,
//! parks on the device's [`SyncHub`] and re-checks its condition whenever
//! some completion is published.

use crate::context::Device;
use crate::error::{DeviceError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tessera_core::constants::WAIT_FOREVER;
use tessera_core::Handle;

pub type FenceHandle = Handle<Fence>;
pub type SemaphoreHandle = Handle<Semaphore>;

/// Condition variable shared by every waiter of one device.
#[derive(Default)]
pub(crate) struct SyncHub {
    lock: Mutex<()>,
    cond: Condvar,
}

impl SyncHub {
    /// Wake every waiter so it re-checks its condition.
    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `poll` yields a value, the deadline passes, or the device
    /// is lost.
    pub fn wait_until<T>(
        &self,
        lost: &AtomicBool,
        deadline: Option<Instant>,
        mut poll: impl FnMut() -> Option<T>,
    ) -> Result<T> {
        let mut guard = self.lock.lock();
        loop {
            if lost.load(Ordering::Acquire) {
                return Err(DeviceError::DeviceLost);
            }
            if let Some(value) = poll() {
                return Ok(value);
            }
            match deadline {
                None => self.cond.wait(&mut guard),
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return poll().ok_or(DeviceError::Timeout);
                    }
                }
            }
        }
    }
}

/// Deadline for a timeout in nanoseconds. `None` waits forever.
pub(crate) fn deadline(timeout_ns: u64) -> Option<Instant> {
    if timeout_ns == WAIT_FOREVER {
        return None;
    }
    Instant::now().checked_add(Duration::from_nanos(timeout_ns))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
    Failed,
}

/// Host-observable completion signal.
#[derive(Debug)]
pub struct Fence {
    state: Mutex<FenceState>,
}

/// Result of polling a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    NotReady,
}

impl Fence {
    fn new(signaled: bool) -> Self {
        Self {
            state: Mutex::new(if signaled {
                FenceState::Signaled
            } else {
                FenceState::Unsignaled
            }),
        }
    }

    pub(crate) fn state(&self) -> FenceState {
        *self.state.lock()
    }

    /// Attach to a submission. Only an unsignaled fence may be attached.
    pub(crate) fn begin_pending(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != FenceState::Unsignaled {
            return Err(DeviceError::validation(format!(
                "fence submitted in state {:?}",
                *state
            )));
        }
        *state = FenceState::Pending;
        Ok(())
    }

    /// Detach from a submission that never reached its queue.
    pub(crate) fn cancel_pending(&self) {
        let mut state = self.state.lock();
        if *state == FenceState::Pending {
            *state = FenceState::Unsignaled;
        }
    }

    pub(crate) fn complete(&self, failed: bool) {
        *self.state.lock() = if failed {
            FenceState::Failed
        } else {
            FenceState::Signaled
        };
    }

    /// `Some` once the fence has completed, carrying the outcome.
    fn outcome(&self) -> Option<Result<()>> {
        match self.state() {
            FenceState::Signaled => Some(Ok(())),
            FenceState::Failed => Some(Err(DeviceError::SubmissionFailed)),
            FenceState::Unsignaled | FenceState::Pending => None,
        }
    }
}

#[derive(Debug, Default)]
struct SemaphoreState {
    /// Completed signals not yet consumed, with their failure flag
    signals: VecDeque<bool>,
    /// Signal operations submitted but not yet executed
    pending_signals: u32,
    /// Wait operations submitted but not yet executed
    reserved_waits: u32,
}

impl SemaphoreState {
    /// Signals that no submitted wait has claimed yet.
    fn unclaimed(&self) -> i64 {
        self.signals.len() as i64 + i64::from(self.pending_signals)
            - i64::from(self.reserved_waits)
    }
}

/// Binary semaphore ordering submissions.
#[derive(Debug, Default)]
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
}

impl Semaphore {
    /// Signals available to new waits, used for submit-time validation.
    pub(crate) fn unclaimed(&self) -> i64 {
        self.state.lock().unclaimed()
    }

    pub(crate) fn reserve_wait(&self) {
        self.state.lock().reserved_waits += 1;
    }

    pub(crate) fn reserve_signal(&self) {
        self.state.lock().pending_signals += 1;
    }

    pub(crate) fn release_wait(&self) {
        let mut state = self.state.lock();
        state.reserved_waits = state.reserved_waits.saturating_sub(1);
    }

    pub(crate) fn release_signal(&self) {
        let mut state = self.state.lock();
        state.pending_signals = state.pending_signals.saturating_sub(1);
    }

    pub(crate) fn signal(&self, failed: bool) {
        let mut state = self.state.lock();
        state.pending_signals = state.pending_signals.saturating_sub(1);
        state.signals.push_back(failed);
    }

    /// Consume one completed signal, returning whether it was failed.
    pub(crate) fn try_consume(&self) -> Option<bool> {
        let mut state = self.state.lock();
        let failed = state.signals.pop_front()?;
        state.reserved_waits = state.reserved_waits.saturating_sub(1);
        Some(failed)
    }

    /// Whether a completed signal is waiting to be consumed.
    pub fn is_signaled(&self) -> bool {
        !self.state.lock().signals.is_empty()
    }
}

impl Device {
    /// Create a fence, optionally already signaled.
    pub fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        self.ctx.check_lost()?;
        let handle = self.ctx.fences.insert(Fence::new(signaled));
        tracing::debug!(?handle, signaled, "Created fence");
        Ok(handle)
    }

    pub fn destroy_fence(&self, fence: FenceHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let removed = self.ctx.fences.get(fence)?;
        if removed.state() == FenceState::Pending {
            return Err(DeviceError::validation("fence destroyed while pending"));
        }
        self.ctx.fences.remove(fence)?;
        tracing::debug!(?fence, "Destroyed fence");
        Ok(())
    }

    /// Poll a fence. A fence completed by failed work reports `SubmissionFailed`.
    pub fn get_fence_status(&self, fence: FenceHandle) -> Result<FenceStatus> {
        self.ctx.check_lost()?;
        match self.ctx.fences.get(fence)?.outcome() {
            Some(outcome) => outcome.map(|()| FenceStatus::Signaled),
            None => Ok(FenceStatus::NotReady),
        }
    }

    /// Reset fences to unsignaled. Fails for a fence attached to pending work.
    pub fn reset_fences(&self, fences: &[FenceHandle]) -> Result<()> {
        self.ctx.check_lost()?;
        let fences = fences
            .iter()
            .map(|&f| self.ctx.fences.get(f))
            .collect::<tessera_core::Result<Vec<_>>>()?;
        if fences.iter().any(|f| f.state() == FenceState::Pending) {
            return Err(DeviceError::validation("reset of a fence with pending work"));
        }
        for fence in fences {
            *fence.state.lock() = FenceState::Unsignaled;
        }
        Ok(())
    }

    /// Wait for one or all fences.
    ///
    /// `timeout_ns == 0` polls and `u64::MAX` waits without bound; otherwise
    /// the wait fails with `Timeout` once the time is up.
    pub fn wait_for_fences(
        &self,
        fences: &[FenceHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<()> {
        self.ctx.check_lost()?;
        let fences = fences
            .iter()
            .map(|&f| self.ctx.fences.get(f))
            .collect::<tessera_core::Result<Vec<_>>>()?;
        if fences.is_empty() {
            return Ok(());
        }

        self.ctx
            .sync
            .wait_until(self.ctx.lost_flag(), deadline(timeout_ns), || {
                let mut outcomes = fences.iter().map(|f| f.outcome());
                if wait_all {
                    outcomes
                        .collect::<Option<Vec<_>>>()
                        .map(|all| all.into_iter().collect::<Result<Vec<_>>>().map(drop))
                } else {
                    outcomes.find_map(|o| o)
                }
            })?
    }

    pub fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        self.ctx.check_lost()?;
        let handle = self.ctx.semaphores.insert(Semaphore::default());
        tracing::debug!(?handle, "Created semaphore");
        Ok(handle)
    }

    pub fn destroy_semaphore(&self, semaphore: SemaphoreHandle) -> Result<()> {
        self.ctx.check_lost()?;
        self.ctx.semaphores.remove(semaphore)?;
        tracing::debug!(?semaphore, "Destroyed semaphore");
        Ok(())
    }
}
