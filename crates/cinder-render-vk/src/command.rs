// SPDX-License-Identifier: CEPL-1.0
//! Command pools and the command recorder state machine.

use std::sync::Arc;

use ash::vk;
use cinder_core::Logger;

use crate::driver::{Command, DeviceDriver, ImageBarrier, SubmitDesc};
use crate::error::{Error, Result};
use crate::sync::Fence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// Raw pool co-owned by the [`CommandPool`] and every recorder allocated
/// from it. The Vulkan pool outlives all of its command buffers.
struct PoolShared {
    driver: Arc<dyn DeviceDriver>,
    raw: vk::CommandPool,
    family: u32,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.driver.destroy_raw_command_pool(self.raw);
    }
}

pub struct CommandPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.raw)
            .field("family", &self.shared.family)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    /// Pools are created with `RESET_COMMAND_BUFFER` so a recorder can
    /// re-begin its buffer every frame.
    pub fn new(driver: Arc<dyn DeviceDriver>, family: u32) -> Result<Self> {
        let raw = driver
            .create_raw_command_pool(family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .map_err(Error::vulkan("vkCreateCommandPool"))?;
        Ok(Self {
            shared: Arc::new(PoolShared { driver, raw, family }),
        })
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.shared.raw
    }

    pub fn family(&self) -> u32 {
        self.shared.family
    }
}

/// A primary command buffer paired with the fence that guards its reuse.
///
/// `Idle -> Recording` through [`record`](Self::record),
/// `Recording -> Idle` through [`stop`](Self::stop) or
/// [`submit`](Self::submit). Append operations return `&mut Self` so a
/// sequence reads as one chain:
///
/// ```ignore
/// rec.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?
///     .copy_buffer(src, dst, region)?
///     .stop()?;
/// ```
pub struct CommandRecorder {
    raw: vk::CommandBuffer,
    queue: vk::Queue,
    state: RecorderState,
    fence: Fence,
    log: Logger,
    pool: Arc<PoolShared>,
}

impl CommandRecorder {
    pub fn new(pool: &CommandPool, queue: vk::Queue, log: Logger) -> Result<Self> {
        let shared = Arc::clone(&pool.shared);
        let raw = shared
            .driver
            .allocate_raw_command_buffer(shared.raw)
            .map_err(Error::vulkan("vkAllocateCommandBuffers"))?;
        let fence = match Fence::new(Arc::clone(&shared.driver), true) {
            Ok(f) => f,
            Err(e) => {
                shared.driver.free_raw_command_buffer(shared.raw, raw);
                return Err(e);
            }
        };
        Ok(Self {
            raw,
            queue,
            state: RecorderState::Idle,
            fence,
            log: log.scoped("command"),
            pool: shared,
        })
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Waits for the previous submission, then begins recording.
    pub fn record(&mut self, usage: vk::CommandBufferUsageFlags) -> Result<&mut Self> {
        if self.state == RecorderState::Recording {
            return Err(Error::RecordingState {
                operation: "begin recording",
                actual: self.state,
            });
        }
        self.fence.wait()?;
        self.pool
            .driver
            .begin_raw_command_buffer(self.raw, usage)
            .map_err(Error::vulkan("vkBeginCommandBuffer"))?;
        self.state = RecorderState::Recording;
        Ok(self)
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.state != RecorderState::Recording {
            return Err(Error::RecordingState {
                operation: "stop recording",
                actual: self.state,
            });
        }
        self.state = RecorderState::Idle;
        self.pool
            .driver
            .end_raw_command_buffer(self.raw)
            .map_err(Error::vulkan("vkEndCommandBuffer"))
    }

    /// Stops recording if needed and submits to the recorder's queue with
    /// the recorder's fence as the completion signal.
    pub fn submit(
        &mut self,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
    ) -> Result<()> {
        if wait_semaphores.len() != wait_stages.len() {
            return Err(Error::SubmitArity {
                semaphores: wait_semaphores.len(),
                stages: wait_stages.len(),
            });
        }
        if self.state == RecorderState::Recording {
            self.stop()?;
        }
        self.fence.wait()?;
        let buffers = [self.raw];
        let submit = SubmitDesc {
            wait_semaphores,
            wait_stages,
            command_buffers: &buffers,
            signal_semaphores,
        };
        self.fence.submit(self.queue, &submit)
    }

    /// Blocks until the last submission has completed.
    pub fn wait(&mut self) -> Result<()> {
        self.fence.wait()
    }

    /// Throws away a partially recorded buffer and returns to `Idle`.
    ///
    /// Signals already owed to `wait_semaphores` are consumed by an empty
    /// submission fenced like a normal one, so the semaphores can be signaled
    /// again and the next `record` still waits for the GPU.
    pub fn abandon(
        &mut self,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
    ) -> Result<()> {
        if wait_semaphores.len() != wait_stages.len() {
            return Err(Error::SubmitArity {
                semaphores: wait_semaphores.len(),
                stages: wait_stages.len(),
            });
        }
        if self.state == RecorderState::Recording {
            self.log.warn(format_args!(
                "discarding partially recorded command buffer {:?}",
                self.raw
            ));
            self.state = RecorderState::Idle;
            self.pool
                .driver
                .reset_raw_command_buffer(self.raw)
                .map_err(Error::vulkan("vkResetCommandBuffer"))?;
        }
        if wait_semaphores.is_empty() {
            return Ok(());
        }
        self.fence.wait()?;
        let submit = SubmitDesc {
            wait_semaphores,
            wait_stages,
            ..Default::default()
        };
        self.fence.submit(self.queue, &submit)
    }

    pub fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) -> Result<&mut Self> {
        self.append(Command::CopyBuffer { src, dst, region })
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) -> Result<&mut Self> {
        self.append(Command::CopyBufferToImage {
            src,
            dst,
            layout,
            region,
        })
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: vk::BufferImageCopy,
    ) -> Result<&mut Self> {
        self.append(Command::CopyImageToBuffer {
            src,
            layout,
            dst,
            region,
        })
    }

    pub fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: ImageBarrier,
    ) -> Result<&mut Self> {
        self.append(Command::PipelineBarrier {
            src_stage,
            dst_stage,
            barrier,
        })
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) -> Result<&mut Self> {
        self.append(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_color,
        })
    }

    pub fn end_render_pass(&mut self) -> Result<&mut Self> {
        self.append(Command::EndRenderPass)
    }

    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) -> Result<&mut Self> {
        self.append(Command::BindPipeline(pipeline))
    }

    pub fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) -> Result<&mut Self> {
        self.append(Command::BindDescriptorSets {
            layout,
            first_set,
            sets,
        })
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) -> Result<&mut Self> {
        self.append(Command::BindVertexBuffers {
            first_binding,
            buffers,
            offsets,
        })
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> Result<&mut Self> {
        self.append(Command::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<&mut Self> {
        self.append(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<&mut Self> {
        self.append(Command::PushConstants {
            layout,
            stages,
            offset,
            data,
        })
    }

    fn append(&mut self, command: Command<'_>) -> Result<&mut Self> {
        if self.state != RecorderState::Recording {
            return Err(Error::RecordingState {
                operation: command.name(),
                actual: self.state,
            });
        }
        self.pool.driver.record(self.raw, &command);
        Ok(self)
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if self.state == RecorderState::Recording {
            self.log.warn(format_args!(
                "command recorder {:?} dropped while recording; ending it",
                self.raw
            ));
            if let Err(e) = self.pool.driver.end_raw_command_buffer(self.raw) {
                self.log
                    .error(format_args!("vkEndCommandBuffer during drop: {e}"));
            }
        }
        if let Err(e) = self.fence.wait() {
            self.log
                .error(format_args!("waiting for recorder fence during drop: {e}"));
        }
        self.pool.driver.free_raw_command_buffer(self.pool.raw, self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::headless::{Event, HeadlessDriver};
    use cinder_core::log::{CaptureSink, Level};

    fn setup() -> (Arc<HeadlessDriver>, CommandPool, vk::Queue) {
        let h = Arc::new(HeadlessDriver::default());
        let d: Arc<dyn DeviceDriver> = h.clone();
        let pool = CommandPool::new(d, 0).unwrap();
        let queue = h.raw_queue(0);
        (h, pool, queue)
    }

    #[test]
    fn appends_require_recording() {
        let (_h, pool, queue) = setup();
        let mut rec = CommandRecorder::new(&pool, queue, Logger::default()).unwrap();
        let err = rec.end_render_pass().err().unwrap();
        assert!(matches!(
            err,
            Error::RecordingState {
                operation: "end_render_pass",
                actual: RecorderState::Idle
            }
        ));
        assert!(rec.stop().is_err());
    }

    #[test]
    fn double_record_is_rejected() {
        let (_h, pool, queue) = setup();
        let mut rec = CommandRecorder::new(&pool, queue, Logger::default()).unwrap();
        rec.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        let err = rec
            .record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::RecordingState {
                actual: RecorderState::Recording,
                ..
            }
        ));
        rec.stop().unwrap();
        assert_eq!(rec.state(), RecorderState::Idle);
    }

    #[test]
    fn fluent_chain_records_in_order() {
        let (h, pool, queue) = setup();
        let mut rec = CommandRecorder::new(&pool, queue, Logger::default()).unwrap();
        rec.record(vk::CommandBufferUsageFlags::empty())
            .unwrap()
            .bind_pipeline(vk::Pipeline::null())
            .unwrap()
            .draw_indexed(3, 1, 0, 0, 0)
            .unwrap();
        rec.submit(&[], &[], &[]).unwrap();
        let recorded: Vec<&'static str> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Record { command, .. } => Some(command),
                _ => None,
            })
            .collect();
        assert_eq!(recorded, ["bind_pipeline", "draw_indexed"]);
        assert_eq!(rec.state(), RecorderState::Idle);
    }

    #[test]
    fn submit_arity_is_checked() {
        let (h, pool, queue) = setup();
        let mut rec = CommandRecorder::new(&pool, queue, Logger::default()).unwrap();
        let sem = vk::Semaphore::null();
        let err = rec.submit(&[sem], &[], &[]).err().unwrap();
        assert!(matches!(
            err,
            Error::SubmitArity {
                semaphores: 1,
                stages: 0
            }
        ));
        assert_eq!(h.count(|e| matches!(e, Event::QueueSubmit { .. })), 0);
    }

    #[test]
    fn drop_while_recording_warns_and_frees() {
        let (h, pool, queue) = setup();
        let sink = CaptureSink::new();
        let log = Logger::new(sink.clone());
        {
            let mut rec = CommandRecorder::new(&pool, queue, log).unwrap();
            rec.record(vk::CommandBufferUsageFlags::empty()).unwrap();
        }
        assert!(sink.contains(Level::Warn, "dropped while recording"));
        assert_eq!(h.count(|e| matches!(e, Event::EndCommandBuffer(_))), 1);
        assert_eq!(h.count(|e| matches!(e, Event::FreeCommandBuffer(_))), 1);
    }

    #[test]
    fn abandon_discards_recording_and_drains_waits() {
        let (h, pool, queue) = setup();
        let sem = h.create_raw_semaphore().unwrap();
        let mut rec = CommandRecorder::new(&pool, queue, Logger::default()).unwrap();
        rec.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap()
            .bind_pipeline(vk::Pipeline::null())
            .unwrap();
        h.clear_events();

        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        rec.abandon(&[sem], &stages).unwrap();
        assert_eq!(rec.state(), RecorderState::Idle);
        assert_eq!(h.count(|e| matches!(e, Event::ResetCommandBuffer(_))), 1);
        assert_eq!(h.count(|e| matches!(e, Event::EndCommandBuffer(_))), 0);
        assert_eq!(
            h.count(|e| matches!(
                e,
                Event::QueueSubmit { command_buffers, wait_semaphores, .. }
                    if command_buffers.is_empty() && wait_semaphores == &[sem]
            )),
            1
        );
        assert!(rec.fence().is_pending());

        rec.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        rec.stop().unwrap();
    }

    #[test]
    fn pool_outlives_its_recorders() {
        let (h, pool, queue) = setup();
        let rec = CommandRecorder::new(&pool, queue, Logger::default()).unwrap();
        drop(pool);
        assert_eq!(h.count(|e| matches!(e, Event::DestroyCommandPool(_))), 0);
        drop(rec);
        assert_eq!(h.count(|e| matches!(e, Event::DestroyCommandPool(_))), 1);
    }
}
