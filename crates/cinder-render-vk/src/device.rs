// SPDX-License-Identifier: CEPL-1.0
//! The logical device: queues, swapchain lifecycle, resource registry and
//! command pools.

use std::sync::Arc;

use ash::vk;
use cinder_core::Logger;
use cinder_render::RenderSize;

use crate::command::{CommandPool, CommandRecorder};
use crate::config::DeviceConfig;
use crate::driver::{DeviceDriver, SurfaceSupport, SwapchainDesc};
use crate::error::{Error, Result};
use crate::physical::PhysicalDeviceInfo;
use crate::registry::Registry;
use crate::swapchain::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    present_mode_name, AcquireOutcome, PresentOutcome, SwapchainState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Present,
    /// Dedicated transfer family when the device has one, else graphics.
    Transfer,
}

pub struct LogicalDevice {
    info: PhysicalDeviceInfo,
    config: DeviceConfig,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,
    swapchain: Option<SwapchainState>,
    registry: Registry,
    // Pools drop after the swapchain and registry are torn down in `drop`.
    frame_pool: CommandPool,
    transfer_pool: CommandPool,
    log: Logger,
    driver: Arc<dyn DeviceDriver>,
}

impl LogicalDevice {
    /// Resolves queues, creates the command pools and the initial swapchain.
    ///
    /// A zero-sized framebuffer leaves the device without a swapchain until
    /// [`recreate_swapchain`](Self::recreate_swapchain) succeeds.
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        info: PhysicalDeviceInfo,
        config: DeviceConfig,
        framebuffer: RenderSize,
        log: &Logger,
    ) -> Result<Self> {
        let log = log.scoped("device");
        let q = info.queues;
        let graphics_queue = driver.raw_queue(q.graphics);
        let present_queue = driver.raw_queue(q.present);
        let transfer_queue = driver.raw_queue(q.transfer);

        let pool = |family| {
            CommandPool::new(Arc::clone(&driver), family).map_err(|e| match e {
                Error::Vulkan { result, .. } => Error::DeviceCreation {
                    stage: "command pool",
                    result,
                },
                other => other,
            })
        };
        let frame_pool = pool(q.graphics)?;
        let transfer_pool = pool(q.transfer)?;

        let mut device = Self {
            info,
            config,
            graphics_queue,
            present_queue,
            transfer_queue,
            swapchain: None,
            registry: Registry::default(),
            frame_pool,
            transfer_pool,
            log,
            driver,
        };
        if !framebuffer.is_zero() {
            let support = device.query_surface()?;
            device.create_swapchain(&support, framebuffer)?;
        }
        device.log.info(format_args!(
            "logical device ready on '{}' (queue families {:?})",
            device.info.name,
            device.info.queues.unique()
        ));
        Ok(device)
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub fn info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    pub fn queue(&self, role: QueueRole) -> vk::Queue {
        match role {
            QueueRole::Graphics => self.graphics_queue,
            QueueRole::Present => self.present_queue,
            QueueRole::Transfer => self.transfer_queue,
        }
    }

    pub fn queue_family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.info.queues.graphics,
            QueueRole::Present => self.info.queues.present,
            QueueRole::Transfer => self.info.queues.transfer,
        }
    }

    /// Families that share buffers: graphics and transfer, deduplicated.
    pub(crate) fn buffer_families(&self) -> Vec<u32> {
        let q = self.info.queues;
        if q.graphics == q.transfer {
            vec![q.graphics]
        } else {
            vec![q.graphics, q.transfer]
        }
    }

    pub(crate) fn frame_pool(&self) -> &CommandPool {
        &self.frame_pool
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Live buffers, images and views.
    pub fn live_resources(&self) -> usize {
        self.registry.len()
    }

    pub fn swapchain(&self) -> Option<&SwapchainState> {
        self.swapchain.as_ref()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.driver
            .wait_idle()
            .map_err(Error::vulkan("vkDeviceWaitIdle"))
    }

    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let Some(sc) = &self.swapchain else {
            return Ok(AcquireOutcome::OutOfDate);
        };
        match self.driver.acquire_next_image(sc.raw, u64::MAX, signal) {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(Error::Acquire(e)),
        }
    }

    pub fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        let Some(sc) = &self.swapchain else {
            return Ok(PresentOutcome::OutOfDate);
        };
        match self
            .driver
            .queue_present(self.present_queue, sc.raw, image_index, wait)
        {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(Error::Present(e)),
        }
    }

    /// Destroys and rebuilds the swapchain and its views for `framebuffer`.
    ///
    /// Returns `Ok(false)` without touching anything when the target size is
    /// zero (minimized window); the caller retries once a size is reported.
    pub fn recreate_swapchain(&mut self, framebuffer: RenderSize) -> Result<bool> {
        if framebuffer.is_zero() {
            self.log
                .debug(format_args!("framebuffer is zero-sized; deferring swapchain"));
            return Ok(false);
        }
        let support = self.query_surface()?;
        let extent = choose_extent(&support.capabilities, framebuffer);
        if extent.width == 0 || extent.height == 0 {
            self.log
                .debug(format_args!("surface extent is zero; deferring swapchain"));
            return Ok(false);
        }
        self.wait_idle()?;
        self.destroy_swapchain();
        self.create_swapchain(&support, framebuffer)?;
        Ok(true)
    }

    fn query_surface(&self) -> Result<SurfaceSupport> {
        self.driver
            .surface_support()
            .map_err(|result| Error::SwapchainCreation {
                stage: "query surface",
                result,
            })
    }

    fn create_swapchain(&mut self, support: &SurfaceSupport, framebuffer: RenderSize) -> Result<()> {
        let stage = |stage| move |result| Error::SwapchainCreation { stage, result };
        let caps = support.capabilities;
        let format = choose_surface_format(&support.formats)
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
            .map_err(stage("choose surface format"))?;
        let present_mode = choose_present_mode(&support.present_modes, self.config.present_mode);
        let extent = choose_extent(&caps, framebuffer);
        let q = self.info.queues;
        let families: &[u32] = if q.graphics == q.present {
            &[q.graphics]
        } else {
            &[q.graphics, q.present]
        };

        let (raw, images) = self
            .driver
            .create_raw_swapchain(&SwapchainDesc {
                min_image_count: choose_image_count(&caps),
                format,
                extent,
                present_mode,
                pre_transform: caps.current_transform,
                queue_families: families,
            })
            .map_err(stage("create swapchain"))?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match self.driver.create_raw_image_view(
                image,
                format.format,
                vk::ImageAspectFlags::COLOR,
            ) {
                Ok(v) => views.push(v),
                Err(result) => {
                    for v in views {
                        self.driver.destroy_raw_image_view(v);
                    }
                    self.driver.destroy_raw_swapchain(raw);
                    return Err(Error::SwapchainCreation {
                        stage: "create image views",
                        result,
                    });
                }
            }
        }

        self.log.info(format_args!(
            "swapchain {}x{} {:?} {} with {} image(s)",
            extent.width,
            extent.height,
            format.format,
            present_mode_name(present_mode),
            images.len()
        ));
        self.swapchain = Some(SwapchainState {
            raw,
            images,
            views,
            format,
            present_mode,
            extent,
        });
        Ok(())
    }

    fn destroy_swapchain(&mut self) {
        if let Some(sc) = self.swapchain.take() {
            for v in sc.views {
                self.driver.destroy_raw_image_view(v);
            }
            self.driver.destroy_raw_swapchain(sc.raw);
        }
    }

    /// Records work with `record` on a fresh recorder for `role`, submits it
    /// and blocks until it completes. Any failure is wrapped in
    /// [`Error::Transfer`].
    pub fn submit_one_shot<F>(&self, role: QueueRole, record: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder) -> Result<()>,
    {
        let pool = match role {
            QueueRole::Transfer => &self.transfer_pool,
            QueueRole::Graphics | QueueRole::Present => &self.frame_pool,
        };
        let queue = match role {
            QueueRole::Transfer => self.transfer_queue,
            QueueRole::Graphics | QueueRole::Present => self.graphics_queue,
        };
        let run = || -> Result<()> {
            let mut rec = CommandRecorder::new(pool, queue, self.log.clone())?;
            rec.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            record(&mut rec)?;
            rec.submit(&[], &[], &[])?;
            rec.wait()
        };
        run().map_err(|e| Error::Transfer(Box::new(e)))
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            self.log
                .error(format_args!("wait idle during device teardown: {e}"));
        }
        self.registry.sweep(self.driver.as_ref(), &self.log);
        self.destroy_swapchain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::headless::{Event, HeadlessDriver};
    use cinder_core::log::{CaptureSink, Level};

    fn device(h: &Arc<HeadlessDriver>, size: RenderSize) -> LogicalDevice {
        let d: Arc<dyn DeviceDriver> = h.clone();
        LogicalDevice::new(
            d,
            h.physical_device_info(),
            DeviceConfig::default(),
            size,
            &Logger::default(),
        )
        .unwrap()
    }

    #[test]
    fn views_match_images() {
        let h = Arc::new(HeadlessDriver::default());
        let dev = device(&h, RenderSize::new(800, 600));
        let sc = dev.swapchain().unwrap();
        assert_eq!(sc.images.len(), sc.views.len());
        assert_eq!(sc.format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(sc.present_mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn zero_size_defers_swapchain() {
        let h = Arc::new(HeadlessDriver::default());
        let mut dev = device(&h, RenderSize::new(0, 0));
        assert!(dev.swapchain().is_none());
        assert!(!dev.recreate_swapchain(RenderSize::new(0, 10)).unwrap());
        assert_eq!(h.count(|e| matches!(e, Event::WaitIdle)), 0);
        assert!(dev.recreate_swapchain(RenderSize::new(640, 480)).unwrap());
        assert!(dev.swapchain().is_some());
    }

    #[test]
    fn recreation_waits_idle_then_destroys_before_creating() {
        let h = Arc::new(HeadlessDriver::default());
        let mut dev = device(&h, RenderSize::new(800, 600));
        let old = dev.swapchain().unwrap().raw;
        h.clear_events();
        dev.recreate_swapchain(RenderSize::new(800, 600)).unwrap();
        let events = h.events();
        let pos = |pred: &dyn Fn(&Event) -> bool| events.iter().position(pred).unwrap();
        let idle = pos(&|e| matches!(e, Event::WaitIdle));
        let destroy = pos(&|e| matches!(e, Event::DestroySwapchain(s) if *s == old));
        let create = pos(&|e| matches!(e, Event::CreateSwapchain { .. }));
        let view = pos(&|e| matches!(e, Event::CreateImageView { .. }));
        assert!(idle < destroy && destroy < create && create < view);
        assert_ne!(dev.swapchain().unwrap().raw, old);
        assert_eq!(h.count(|e| matches!(e, Event::WaitIdle)), 1);
    }

    #[test]
    fn recreation_queries_the_surface_once() {
        let h = Arc::new(HeadlessDriver::default());
        let mut dev = device(&h, RenderSize::new(800, 600));
        h.clear_events();
        assert!(dev.recreate_swapchain(RenderSize::new(1024, 768)).unwrap());
        assert_eq!(h.count(|e| matches!(e, Event::QuerySurface)), 1);
    }

    #[test]
    fn out_of_date_acquire_is_an_outcome() {
        let h = Arc::new(HeadlessDriver::default());
        let dev = device(&h, RenderSize::new(800, 600));
        h.script_acquire(0, vk::Result::ERROR_OUT_OF_DATE_KHR);
        h.script_acquire(1, vk::Result::ERROR_DEVICE_LOST);
        let sem = vk::Semaphore::null();
        assert_eq!(dev.acquire_next_image(sem).unwrap(), AcquireOutcome::OutOfDate);
        assert!(matches!(
            dev.acquire_next_image(sem),
            Err(Error::Acquire(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn teardown_sweeps_leaked_resources() {
        let h = Arc::new(HeadlessDriver::default());
        let sink = CaptureSink::new();
        let log = Logger::new(sink.clone());
        let d: Arc<dyn DeviceDriver> = h.clone();
        let mut dev = LogicalDevice::new(
            d,
            h.physical_device_info(),
            DeviceConfig::default(),
            RenderSize::new(64, 64),
            &log,
        )
        .unwrap();
        let _leak = dev
            .create_buffer(
                16,
                vk::BufferUsageFlags::TRANSFER_SRC,
                crate::driver::MemoryResidency::CpuToGpu,
            )
            .unwrap();
        drop(dev);
        assert!(sink.contains(Level::Warn, "still alive"));
        assert_eq!(h.count(|e| matches!(e, Event::DestroyBuffer(_))), 1);
        assert_eq!(h.count(|e| matches!(e, Event::DestroySwapchain(_))), 1);
    }
}
