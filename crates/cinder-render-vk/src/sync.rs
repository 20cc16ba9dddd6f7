// SPDX-License-Identifier: CEPL-1.0
//! CPU/GPU synchronization primitives and the per-frame sync set.

use std::sync::Arc;

use ash::vk;
use cinder_core::Logger;

use crate::command::CommandRecorder;
use crate::device::{LogicalDevice, QueueRole};
use crate::driver::{DeviceDriver, SubmitDesc};
use crate::error::{Error, Result};

/// CPU-side view of a fence, kept so that polls, waits and resets only
/// reach the driver when the answer is not already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    /// Reset, with nothing submitted against it.
    Unsignaled,
    /// A signal is owed: submitted, or created signaled and not yet observed.
    Pending,
    /// Observed signaled and not reset since.
    Signaled,
}

/// A GPU-signaled fence.
///
/// Waiting on a fence that was never submitted returns immediately instead
/// of blocking forever, and resetting one that is already unsignaled skips
/// the driver.
pub struct Fence {
    driver: Arc<dyn DeviceDriver>,
    raw: vk::Fence,
    state: FenceState,
}

impl Fence {
    pub fn new(driver: Arc<dyn DeviceDriver>, signaled: bool) -> Result<Self> {
        let raw = driver
            .create_raw_fence(signaled)
            .map_err(Error::vulkan("vkCreateFence"))?;
        let state = if signaled {
            FenceState::Pending
        } else {
            FenceState::Unsignaled
        };
        Ok(Self { driver, raw, state })
    }

    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    pub fn is_pending(&self) -> bool {
        self.state == FenceState::Pending
    }

    /// Non-blocking poll.
    pub fn is_ready(&self) -> Result<bool> {
        match self.state {
            FenceState::Pending => self.status(),
            FenceState::Unsignaled | FenceState::Signaled => Ok(true),
        }
    }

    /// Blocks without timeout until the pending signal arrives.
    pub fn wait(&mut self) -> Result<()> {
        if self.state != FenceState::Pending {
            return Ok(());
        }
        self.driver
            .wait_for_raw_fences(&[self.raw], u64::MAX)
            .map_err(Error::vulkan("vkWaitForFences"))?;
        self.state = FenceState::Signaled;
        Ok(())
    }

    /// Returns the fence to unsignaled. Does nothing if it already is, or if
    /// the GPU has not signaled it yet.
    pub fn reset(&mut self) -> Result<()> {
        match self.state {
            FenceState::Unsignaled => return Ok(()),
            FenceState::Pending if !self.status()? => return Ok(()),
            FenceState::Pending | FenceState::Signaled => {}
        }
        self.driver
            .reset_raw_fences(&[self.raw])
            .map_err(Error::vulkan("vkResetFences"))?;
        self.state = FenceState::Unsignaled;
        Ok(())
    }

    pub fn wait_and_reset(&mut self) -> Result<()> {
        self.wait()?;
        self.reset()
    }

    /// Resets the fence, then submits `submit` to `queue` with this fence as
    /// the completion signal.
    pub fn submit(&mut self, queue: vk::Queue, submit: &SubmitDesc<'_>) -> Result<()> {
        if self.state == FenceState::Pending {
            if !self.status()? {
                return Err(Error::FenceInFlight);
            }
            self.state = FenceState::Signaled;
        }
        self.reset()?;
        self.driver
            .queue_submit(queue, submit, self.raw)
            .map_err(Error::vulkan("vkQueueSubmit"))?;
        self.state = FenceState::Pending;
        Ok(())
    }

    fn status(&self) -> Result<bool> {
        self.driver
            .get_raw_fence_status(self.raw)
            .map_err(Error::vulkan("vkGetFenceStatus"))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.driver.destroy_raw_fence(self.raw);
    }
}

pub struct Semaphore {
    driver: Arc<dyn DeviceDriver>,
    raw: vk::Semaphore,
}

impl Semaphore {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Result<Self> {
        let raw = driver
            .create_raw_semaphore()
            .map_err(Error::vulkan("vkCreateSemaphore"))?;
        Ok(Self { driver, raw })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.driver.destroy_raw_semaphore(self.raw);
    }
}

/// Objects owned by one frame in flight. The recorder's fence doubles as the
/// slot fence.
pub struct FrameSlot {
    pub recorder: CommandRecorder,
    pub image_acquired: Semaphore,
    pub render_finished: Semaphore,
}

/// N frame slots used round-robin.
pub struct FrameSyncSet {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameSyncSet {
    pub fn new(device: &LogicalDevice, frames_in_flight: usize, log: &Logger) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".into()));
        }
        let driver = device.driver();
        let queue = device.queue(QueueRole::Graphics);
        let slots = (0..frames_in_flight)
            .map(|_| {
                Ok(FrameSlot {
                    recorder: CommandRecorder::new(device.frame_pool(), queue, log.clone())?,
                    image_acquired: Semaphore::new(Arc::clone(driver))?,
                    render_finished: Semaphore::new(Arc::clone(driver))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots, current: 0 })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    pub fn fences(&self) -> Vec<vk::Fence> {
        self.slots.iter().map(|s| s.recorder.fence().raw()).collect()
    }

    pub fn image_acquired(&self) -> Vec<vk::Semaphore> {
        self.slots.iter().map(|s| s.image_acquired.raw()).collect()
    }

    pub fn render_finished(&self) -> Vec<vk::Semaphore> {
        self.slots.iter().map(|s| s.render_finished.raw()).collect()
    }
}
