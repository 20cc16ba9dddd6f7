// SPDX-License-Identifier: CEPL-1.0
//! A software [`DeviceDriver`].
//!
//! Handles are minted from a counter. Buffer and image memory lives in host
//! vectors, and transfer commands and layout barriers execute when their
//! command buffer is submitted. Submissions signal their fence immediately
//! unless [`set_auto_signal(false)`](HeadlessDriver::set_auto_signal) is in
//! effect. Every call is appended to an event log that tests inspect.
//!
//! Misuse a real driver would leave undefined is collected in
//! [`validation_errors`](HeadlessDriver::validation_errors) instead: barriers
//! from the wrong layout, copies into an image that is not in a transfer
//! layout, appends to a command buffer that is not recording, and binary
//! semaphores signaled twice or waited on with no signal pending.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use ash::vk::{self, Handle};

use super::{
    BufferDesc, Command, DeviceDriver, ImageBarrier, ImageDesc, MemoryResidency, PipelineDesc,
    SubmitDesc, SurfaceSupport, SwapchainDesc, VkResult,
};
use crate::image::format_texel_size;
use crate::physical::{self, DeviceCandidate, PhysicalDeviceInfo, QueueFamilyCaps};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WaitIdle,
    CreateFence {
        fence: vk::Fence,
        signaled: bool,
    },
    DestroyFence(vk::Fence),
    GetFenceStatus(vk::Fence),
    WaitForFences(Vec<vk::Fence>),
    ResetFences(Vec<vk::Fence>),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool {
        pool: vk::CommandPool,
        family: u32,
    },
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer {
        pool: vk::CommandPool,
        buffer: vk::CommandBuffer,
    },
    FreeCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    Record {
        buffer: vk::CommandBuffer,
        command: &'static str,
    },
    QueueSubmit {
        queue: vk::Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    CreateBuffer {
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        concurrent: bool,
    },
    DestroyBuffer(vk::Buffer),
    CreateImage {
        image: vk::Image,
        width: u32,
        height: u32,
    },
    DestroyImage(vk::Image),
    CreateImageView {
        view: vk::ImageView,
        image: vk::Image,
    },
    DestroyImageView(vk::ImageView),
    QuerySurface,
    CreateSwapchain {
        swapchain: vk::SwapchainKHR,
        image_count: u32,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    },
    DestroySwapchain(vk::SwapchainKHR),
    AcquireNextImage {
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        result: Result<u32, vk::Result>,
    },
    QueuePresent {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
        result: Result<bool, vk::Result>,
    },
    CreateRenderPass(vk::RenderPass),
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer(vk::Framebuffer),
    DestroyFramebuffer(vk::Framebuffer),
    CreatePipeline {
        pipeline: vk::Pipeline,
        extent: vk::Extent2D,
    },
    DestroyPipeline(vk::Pipeline),
    CreateSampler(vk::Sampler),
    DestroySampler(vk::Sampler),
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    AllocateTextureSet {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
        view: vk::ImageView,
    },
    DestroyDescriptorPool(vk::DescriptorPool),
}

#[derive(Debug, Clone, Copy)]
enum Op {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    },
    CopyImageToBuffer {
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: vk::BufferImageCopy,
    },
    Barrier(ImageBarrier),
    Other,
}

struct SimBuffer {
    data: Vec<u8>,
    residency: MemoryResidency,
}

struct SimImage {
    width: u32,
    height: u32,
    texel: u64,
    layout: vk::ImageLayout,
    data: Vec<u8>,
}

#[derive(Default)]
struct SimCommandBuffer {
    recording: bool,
    ops: Vec<Op>,
}

struct SimSwapchain {
    images: Vec<vk::Image>,
    next: u32,
}

struct State {
    next_handle: u64,
    events: Vec<Event>,
    errors: Vec<String>,
    auto_signal: bool,
    surface: SurfaceSupport,
    fences: HashMap<vk::Fence, bool>,
    // Binary semaphores and whether a signal is pending on each.
    semaphores: HashMap<vk::Semaphore, bool>,
    pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, SimCommandBuffer>,
    buffers: HashMap<vk::Buffer, SimBuffer>,
    images: HashMap<vk::Image, SimImage>,
    views: HashMap<vk::ImageView, vk::Image>,
    swapchains: HashMap<vk::SwapchainKHR, SimSwapchain>,
    // Render passes, framebuffers, pipelines and descriptor objects.
    others: HashSet<u64>,
    acquire_calls: usize,
    present_calls: usize,
    acquire_script: HashMap<usize, vk::Result>,
    present_script: HashMap<usize, vk::Result>,
}

impl State {
    fn mint<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    fn signal_semaphore(&mut self, sem: vk::Semaphore, by: &str) {
        if let Some(signaled) = self.semaphores.get_mut(&sem) {
            let twice = std::mem::replace(signaled, true);
            if twice {
                self.error(format!("{by} signals {sem:?} which is already signaled"));
            }
        }
    }

    fn wait_semaphore(&mut self, sem: vk::Semaphore, by: &str) {
        if let Some(signaled) = self.semaphores.get_mut(&sem) {
            let pending = std::mem::replace(signaled, false);
            if !pending {
                self.error(format!("{by} waits on {sem:?} with no signal pending"));
            }
        }
    }

    fn execute(&mut self, cb: vk::CommandBuffer) {
        let ops = match self.command_buffers.get(&cb) {
            Some(c) if !c.recording => Ok(c.ops.clone()),
            Some(_) => Err(format!("{cb:?} submitted while still recording")),
            None => Err(format!("submit of unknown command buffer {cb:?}")),
        };
        let ops = match ops {
            Ok(ops) => ops,
            Err(msg) => return self.error(msg),
        };
        for op in ops {
            match op {
                Op::CopyBuffer { src, dst, region } => self.copy_buffer(src, dst, region),
                Op::CopyBufferToImage {
                    src,
                    dst,
                    layout,
                    region,
                } => self.copy_buffer_to_image(src, dst, layout, region),
                Op::CopyImageToBuffer {
                    src,
                    layout,
                    dst,
                    region,
                } => self.copy_image_to_buffer(src, layout, dst, region),
                Op::Barrier(b) => self.barrier(b),
                Op::Other => {}
            }
        }
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        let bytes = match self.buffers.get(&src) {
            Some(b) => {
                let start = region.src_offset as usize;
                let end = start + region.size as usize;
                match b.data.get(start..end) {
                    Some(s) => s.to_vec(),
                    None => return self.error(format!("copy reads past end of {src:?}")),
                }
            }
            None => return self.error(format!("copy from unknown buffer {src:?}")),
        };
        match self.buffers.get_mut(&dst) {
            Some(b) => {
                let start = region.dst_offset as usize;
                match b.data.get_mut(start..start + bytes.len()) {
                    Some(d) => d.copy_from_slice(&bytes),
                    None => self.error(format!("copy writes past end of {dst:?}")),
                }
            }
            None => self.error(format!("copy into unknown buffer {dst:?}")),
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        let Some(image) = self.images.get(&dst) else {
            return self.error(format!("copy into unknown image {dst:?}"));
        };
        if image.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL || layout != image.layout {
            let actual = image.layout;
            return self.error(format!(
                "buffer-to-image copy into {dst:?} in {actual:?} (declared {layout:?})"
            ));
        }
        let len = image_copy_len(image, &region);
        let start = region.buffer_offset as usize;
        let bytes = match self.buffers.get(&src).and_then(|b| b.data.get(start..start + len)) {
            Some(s) => s.to_vec(),
            None => return self.error(format!("buffer-to-image copy reads past {src:?}")),
        };
        if let Some(image) = self.images.get_mut(&dst) {
            image.data[..len].copy_from_slice(&bytes);
        }
    }

    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: vk::BufferImageCopy,
    ) {
        let Some(image) = self.images.get(&src) else {
            return self.error(format!("copy from unknown image {src:?}"));
        };
        if image.layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL || layout != image.layout {
            let actual = image.layout;
            return self.error(format!(
                "image-to-buffer copy from {src:?} in {actual:?} (declared {layout:?})"
            ));
        }
        let len = image_copy_len(image, &region);
        let bytes = image.data[..len].to_vec();
        let start = region.buffer_offset as usize;
        match self
            .buffers
            .get_mut(&dst)
            .and_then(|b| b.data.get_mut(start..start + len))
        {
            Some(d) => d.copy_from_slice(&bytes),
            None => self.error(format!("image-to-buffer copy writes past {dst:?}")),
        }
    }

    fn barrier(&mut self, b: ImageBarrier) {
        let Some(image) = self.images.get_mut(&b.image) else {
            return self.error(format!("barrier on unknown image {:?}", b.image));
        };
        if b.old_layout != vk::ImageLayout::UNDEFINED && b.old_layout != image.layout {
            let actual = image.layout;
            image.layout = b.new_layout;
            return self.error(format!(
                "barrier on {:?} claims {:?} but image is in {actual:?}",
                b.image, b.old_layout
            ));
        }
        image.layout = b.new_layout;
    }
}

fn image_copy_len(image: &SimImage, region: &vk::BufferImageCopy) -> usize {
    let w = region.image_extent.width.min(image.width);
    let h = region.image_extent.height.min(image.height);
    (u64::from(w) * u64::from(h) * image.texel) as usize
}

fn default_surface() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

pub struct HeadlessDriver {
    state: Mutex<State>,
}

impl Default for HeadlessDriver {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 0x1000,
                events: Vec::new(),
                errors: Vec::new(),
                auto_signal: true,
                surface: default_surface(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                pools: HashSet::new(),
                command_buffers: HashMap::new(),
                buffers: HashMap::new(),
                images: HashMap::new(),
                views: HashMap::new(),
                swapchains: HashMap::new(),
                others: HashSet::new(),
                acquire_calls: 0,
                present_calls: 0,
                acquire_script: HashMap::new(),
                present_script: HashMap::new(),
            }),
        }
    }
}

impl HeadlessDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Graphics+compute+transfer family that can present, plus a dedicated
    /// transfer family.
    pub fn candidate(&self) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(1),
            name: "cinder headless device".to_owned(),
            device_type: vk::PhysicalDeviceType::CPU,
            max_image_dimension_2d: 4096,
            extensions: vec!["VK_KHR_swapchain".to_owned()],
            queue_families: vec![
                QueueFamilyCaps {
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    present: true,
                },
                QueueFamilyCaps {
                    flags: vk::QueueFlags::TRANSFER,
                    present: false,
                },
            ],
        }
    }

    /// [`candidate`](Self::candidate), already scored.
    pub fn physical_device_info(&self) -> PhysicalDeviceInfo {
        let c = self.candidate();
        let (score, queues) = physical::score(&c, &[])
            .unwrap_or((0, physical::QueueFamilies {
                graphics: 0,
                present: 0,
                transfer: 0,
            }));
        PhysicalDeviceInfo {
            handle: c.handle,
            name: c.name,
            device_type: c.device_type,
            max_image_dimension_2d: c.max_image_dimension_2d,
            extensions: c.extensions,
            queues,
            score,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.lock().events.iter().filter(|&e| pred(e)).count()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.lock().errors.clone()
    }

    /// When off, submissions leave their fence unsignaled until
    /// [`signal_all_fences`](Self::signal_all_fences), and waits on
    /// unsignaled fences fail with `TIMEOUT` instead of blocking.
    pub fn set_auto_signal(&self, on: bool) {
        self.lock().auto_signal = on;
    }

    pub fn signal_all_fences(&self) {
        for v in self.lock().fences.values_mut() {
            *v = true;
        }
    }

    /// Makes the `nth` (0-based) acquire return `result`.
    /// `SUBOPTIMAL_KHR` succeeds with the suboptimal flag set.
    pub fn script_acquire(&self, nth: usize, result: vk::Result) {
        self.lock().acquire_script.insert(nth, result);
    }

    /// Makes the `nth` (0-based) present return `result`.
    pub fn script_present(&self, nth: usize, result: vk::Result) {
        self.lock().present_script.insert(nth, result);
    }

    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.lock().surface.capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.lock().surface.formats = formats;
    }

    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        let s = self.lock();
        s.fences.len()
            + s.semaphores.len()
            + s.pools.len()
            + s.command_buffers.len()
            + s.buffers.len()
            + s.images.len()
            + s.views.len()
            + s.swapchains.len()
            + s.others.len()
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.lock().images.get(&image).map(|i| i.layout)
    }

    fn create_other<H: Handle + Copy>(&self, event: impl FnOnce(H) -> Event) -> H {
        let mut s = self.lock();
        let h: H = s.mint();
        s.others.insert(h.as_raw());
        s.events.push(event(h));
        h
    }

    fn destroy_other<H: Handle>(&self, h: H, event: Event) {
        let mut s = self.lock();
        s.others.remove(&h.as_raw());
        s.events.push(event);
    }
}

impl DeviceDriver for HeadlessDriver {
    fn raw_queue(&self, family: u32) -> vk::Queue {
        vk::Queue::from_raw(0x51_0000 + u64::from(family))
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.lock().events.push(Event::WaitIdle);
        Ok(())
    }

    fn create_raw_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut s = self.lock();
        let fence = s.mint();
        s.fences.insert(fence, signaled);
        s.events.push(Event::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_raw_fence(&self, fence: vk::Fence) {
        let mut s = self.lock();
        s.fences.remove(&fence);
        s.events.push(Event::DestroyFence(fence));
    }

    fn get_raw_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let mut s = self.lock();
        s.events.push(Event::GetFenceStatus(fence));
        s.fences.get(&fence).copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn wait_for_raw_fences(&self, fences: &[vk::Fence], _timeout: u64) -> VkResult<()> {
        let mut s = self.lock();
        s.events.push(Event::WaitForFences(fences.to_vec()));
        if fences.iter().all(|f| s.fences.get(f).copied().unwrap_or(false)) {
            Ok(())
        } else {
            Err(vk::Result::TIMEOUT)
        }
    }

    fn reset_raw_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut s = self.lock();
        for f in fences {
            if let Some(v) = s.fences.get_mut(f) {
                *v = false;
            }
        }
        s.events.push(Event::ResetFences(fences.to_vec()));
        Ok(())
    }

    fn create_raw_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut s = self.lock();
        let sem = s.mint();
        s.semaphores.insert(sem, false);
        s.events.push(Event::CreateSemaphore(sem));
        Ok(sem)
    }

    fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        let mut s = self.lock();
        s.semaphores.remove(&semaphore);
        s.events.push(Event::DestroySemaphore(semaphore));
    }

    fn create_raw_command_pool(
        &self,
        family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut s = self.lock();
        let pool = s.mint();
        s.pools.insert(pool);
        s.events.push(Event::CreateCommandPool { pool, family });
        Ok(pool)
    }

    fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        let mut s = self.lock();
        s.pools.remove(&pool);
        s.events.push(Event::DestroyCommandPool(pool));
    }

    fn allocate_raw_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut s = self.lock();
        if !s.pools.contains(&pool) {
            s.error(format!("allocation from unknown pool {pool:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let buffer = s.mint();
        s.command_buffers.insert(buffer, SimCommandBuffer::default());
        s.events.push(Event::AllocateCommandBuffer { pool, buffer });
        Ok(buffer)
    }

    fn free_raw_command_buffer(&self, _pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        let mut s = self.lock();
        s.command_buffers.remove(&buffer);
        s.events.push(Event::FreeCommandBuffer(buffer));
    }

    fn begin_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        _usage: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut s = self.lock();
        s.events.push(Event::BeginCommandBuffer(buffer));
        let Some(cb) = s.command_buffers.get_mut(&buffer) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let was_recording = cb.recording;
        cb.recording = true;
        cb.ops.clear();
        if was_recording {
            s.error(format!("{buffer:?} begun while already recording"));
        }
        Ok(())
    }

    fn end_raw_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.lock();
        s.events.push(Event::EndCommandBuffer(buffer));
        match s.command_buffers.get_mut(&buffer) {
            Some(cb) => {
                cb.recording = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn reset_raw_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.lock();
        s.events.push(Event::ResetCommandBuffer(buffer));
        match s.command_buffers.get_mut(&buffer) {
            Some(cb) => {
                cb.recording = false;
                cb.ops.clear();
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn record(&self, buffer: vk::CommandBuffer, command: &Command<'_>) {
        let op = match *command {
            Command::CopyBuffer { src, dst, region } => Op::CopyBuffer { src, dst, region },
            Command::CopyBufferToImage {
                src,
                dst,
                layout,
                region,
            } => Op::CopyBufferToImage {
                src,
                dst,
                layout,
                region,
            },
            Command::CopyImageToBuffer {
                src,
                layout,
                dst,
                region,
            } => Op::CopyImageToBuffer {
                src,
                layout,
                dst,
                region,
            },
            Command::PipelineBarrier { barrier, .. } => Op::Barrier(barrier),
            _ => Op::Other,
        };
        let mut s = self.lock();
        s.events.push(Event::Record {
            buffer,
            command: command.name(),
        });
        let accepted = match s.command_buffers.get_mut(&buffer) {
            Some(cb) if cb.recording => {
                cb.ops.push(op);
                true
            }
            _ => false,
        };
        if !accepted {
            s.error(format!("{} recorded into idle {buffer:?}", command.name()));
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut s = self.lock();
        s.events.push(Event::QueueSubmit {
            queue,
            command_buffers: submit.command_buffers.to_vec(),
            wait_semaphores: submit.wait_semaphores.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence,
        });
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            s.error("submit with mismatched wait semaphores and stages".to_owned());
        }
        if fence != vk::Fence::null() && s.fences.get(&fence).copied().unwrap_or(false) {
            s.error(format!("submit with already-signaled {fence:?}"));
        }
        for &sem in submit.wait_semaphores {
            s.wait_semaphore(sem, "queue submit");
        }
        for &cb in submit.command_buffers {
            s.execute(cb);
        }
        for &sem in submit.signal_semaphores {
            s.signal_semaphore(sem, "queue submit");
        }
        let signal = s.auto_signal;
        if let Some(f) = s.fences.get_mut(&fence) {
            *f = signal;
        }
        Ok(())
    }

    fn create_raw_buffer(&self, desc: &BufferDesc<'_>) -> VkResult<vk::Buffer> {
        let mut s = self.lock();
        let buffer = s.mint();
        s.buffers.insert(
            buffer,
            SimBuffer {
                data: vec![0; desc.size as usize],
                residency: desc.residency,
            },
        );
        s.events.push(Event::CreateBuffer {
            buffer,
            size: desc.size,
            concurrent: desc.queue_families.len() > 1,
        });
        Ok(buffer)
    }

    fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        let mut s = self.lock();
        s.buffers.remove(&buffer);
        s.events.push(Event::DestroyBuffer(buffer));
    }

    fn write_raw_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        let mut s = self.lock();
        let b = s
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !b.residency.is_host_visible() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let start = offset as usize;
        b.data
            .get_mut(start..start + data.len())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_raw_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VkResult<Vec<u8>> {
        let s = self.lock();
        let b = s.buffers.get(&buffer).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !b.residency.is_host_visible() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let start = offset as usize;
        b.data
            .get(start..start + len as usize)
            .map(<[u8]>::to_vec)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn create_raw_image(&self, desc: &ImageDesc<'_>) -> VkResult<vk::Image> {
        let mut s = self.lock();
        let image = s.mint();
        let texel = format_texel_size(desc.format).unwrap_or(4);
        let len = u64::from(desc.width) * u64::from(desc.height) * texel;
        s.images.insert(
            image,
            SimImage {
                width: desc.width,
                height: desc.height,
                texel,
                layout: vk::ImageLayout::UNDEFINED,
                data: vec![0; len as usize],
            },
        );
        s.events.push(Event::CreateImage {
            image,
            width: desc.width,
            height: desc.height,
        });
        Ok(image)
    }

    fn destroy_raw_image(&self, image: vk::Image) {
        let mut s = self.lock();
        s.images.remove(&image);
        s.events.push(Event::DestroyImage(image));
    }

    fn create_raw_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let mut s = self.lock();
        let view = s.mint();
        s.views.insert(view, image);
        s.events.push(Event::CreateImageView { view, image });
        Ok(view)
    }

    fn destroy_raw_image_view(&self, view: vk::ImageView) {
        let mut s = self.lock();
        s.views.remove(&view);
        s.events.push(Event::DestroyImageView(view));
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        let mut s = self.lock();
        s.events.push(Event::QuerySurface);
        Ok(s.surface.clone())
    }

    fn create_raw_swapchain(
        &self,
        desc: &SwapchainDesc<'_>,
    ) -> VkResult<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let mut s = self.lock();
        let swapchain = s.mint();
        let images: Vec<vk::Image> = (0..desc.min_image_count).map(|_| s.mint()).collect();
        s.swapchains.insert(
            swapchain,
            SimSwapchain {
                images: images.clone(),
                next: 0,
            },
        );
        s.events.push(Event::CreateSwapchain {
            swapchain,
            image_count: desc.min_image_count,
            extent: desc.extent,
            present_mode: desc.present_mode,
        });
        Ok((swapchain, images))
    }

    fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut s = self.lock();
        s.swapchains.remove(&swapchain);
        s.events.push(Event::DestroySwapchain(swapchain));
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut s = self.lock();
        let call = s.acquire_calls;
        s.acquire_calls += 1;
        let scripted = s.acquire_script.remove(&call);
        let result = match (scripted, s.swapchains.get_mut(&swapchain)) {
            (Some(r), _) if r != vk::Result::SUBOPTIMAL_KHR => Err(r),
            (_, None) => Err(vk::Result::ERROR_SURFACE_LOST_KHR),
            (scripted, Some(sc)) => {
                let index = sc.next;
                sc.next = (sc.next + 1) % sc.images.len().max(1) as u32;
                Ok((index, scripted.is_some()))
            }
        };
        if result.is_ok() {
            s.signal_semaphore(semaphore, "acquire");
        }
        s.events.push(Event::AcquireNextImage {
            swapchain,
            semaphore,
            result: result.map(|(i, _)| i),
        });
        result
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut s = self.lock();
        let call = s.present_calls;
        s.present_calls += 1;
        let scripted = s.present_script.remove(&call);
        let known = s
            .swapchains
            .get(&swapchain)
            .is_some_and(|sc| (image_index as usize) < sc.images.len());
        let result = match scripted {
            Some(vk::Result::SUBOPTIMAL_KHR) => Ok(true),
            Some(r) => Err(r),
            None if known => Ok(false),
            None => Err(vk::Result::ERROR_SURFACE_LOST_KHR),
        };
        if !known {
            s.error(format!("present of image {image_index} on unknown {swapchain:?}"));
        }
        // The wait is consumed even when presentation reports the swapchain
        // out of date.
        s.wait_semaphore(wait_semaphore, "present");
        s.events.push(Event::QueuePresent {
            swapchain,
            image_index,
            wait_semaphore,
            result,
        });
        result
    }

    fn create_raw_render_pass(&self, _format: vk::Format) -> VkResult<vk::RenderPass> {
        Ok(self.create_other(Event::CreateRenderPass))
    }

    fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        self.destroy_other(render_pass, Event::DestroyRenderPass(render_pass));
    }

    fn create_raw_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        view: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        if !self.lock().views.contains_key(&view) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok(self.create_other(Event::CreateFramebuffer))
    }

    fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.destroy_other(framebuffer, Event::DestroyFramebuffer(framebuffer));
    }

    fn create_raw_texture_set_layout(&self) -> VkResult<vk::DescriptorSetLayout> {
        Ok(self.create_other(Event::CreateDescriptorSetLayout))
    }

    fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroy_other(layout, Event::DestroyDescriptorSetLayout(layout));
    }

    fn create_raw_pipeline(
        &self,
        desc: &PipelineDesc<'_>,
    ) -> VkResult<(vk::PipelineLayout, vk::Pipeline)> {
        let mut s = self.lock();
        let layout: vk::PipelineLayout = s.mint();
        let pipeline: vk::Pipeline = s.mint();
        s.others.insert(layout.as_raw());
        s.others.insert(pipeline.as_raw());
        s.events.push(Event::CreatePipeline {
            pipeline,
            extent: desc.extent,
        });
        Ok((layout, pipeline))
    }

    fn destroy_raw_pipeline(&self, layout: vk::PipelineLayout, pipeline: vk::Pipeline) {
        let mut s = self.lock();
        s.others.remove(&layout.as_raw());
        s.others.remove(&pipeline.as_raw());
        s.events.push(Event::DestroyPipeline(pipeline));
    }

    fn create_raw_sampler(&self) -> VkResult<vk::Sampler> {
        Ok(self.create_other(Event::CreateSampler))
    }

    fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        self.destroy_other(sampler, Event::DestroySampler(sampler));
    }

    fn allocate_raw_texture_set(
        &self,
        _layout: vk::DescriptorSetLayout,
        view: vk::ImageView,
        _sampler: vk::Sampler,
    ) -> VkResult<(vk::DescriptorPool, vk::DescriptorSet)> {
        let mut s = self.lock();
        if !s.views.contains_key(&view) {
            s.error(format!("descriptor written with unknown {view:?}"));
        }
        let pool: vk::DescriptorPool = s.mint();
        let set: vk::DescriptorSet = s.mint();
        s.others.insert(pool.as_raw());
        s.events.push(Event::AllocateTextureSet { pool, set, view });
        Ok((pool, set))
    }

    fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.destroy_other(pool, Event::DestroyDescriptorPool(pool));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique() {
        let d = HeadlessDriver::new();
        let a = d.create_raw_fence(false).unwrap();
        let b = d.create_raw_fence(false).unwrap();
        assert_ne!(a, b);
        assert_eq!(d.live_objects(), 2);
    }

    #[test]
    fn submit_executes_recorded_copies() {
        let d = HeadlessDriver::new();
        let desc = |residency| BufferDesc {
            size: 8,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            residency,
            queue_families: &[0],
        };
        let src = d.create_raw_buffer(&desc(MemoryResidency::CpuToGpu)).unwrap();
        let dst = d.create_raw_buffer(&desc(MemoryResidency::GpuToCpu)).unwrap();
        d.write_raw_buffer(src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let pool = d
            .create_raw_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cb = d.allocate_raw_command_buffer(pool).unwrap();
        d.begin_raw_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
            .unwrap();
        d.record(
            cb,
            &Command::CopyBuffer {
                src,
                dst,
                region: vk::BufferCopy {
                    src_offset: 4,
                    dst_offset: 0,
                    size: 4,
                },
            },
        );
        d.end_raw_command_buffer(cb).unwrap();
        // nothing moves until submission
        assert_eq!(d.read_raw_buffer(dst, 0, 4).unwrap(), [0, 0, 0, 0]);

        let fence = d.create_raw_fence(false).unwrap();
        let cbs = [cb];
        let submit = SubmitDesc {
            command_buffers: &cbs,
            ..Default::default()
        };
        d.queue_submit(d.raw_queue(0), &submit, fence).unwrap();
        assert_eq!(d.read_raw_buffer(dst, 0, 4).unwrap(), [5, 6, 7, 8]);
        assert!(d.get_raw_fence_status(fence).unwrap());
        assert!(d.validation_errors().is_empty());
    }

    #[test]
    fn wrong_layout_copy_is_a_validation_error() {
        let d = HeadlessDriver::new();
        let image = d
            .create_raw_image(&ImageDesc {
                width: 2,
                height: 2,
                format: vk::Format::R8G8B8A8_UNORM,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_DST,
                queue_families: &[0],
            })
            .unwrap();
        let buf = d
            .create_raw_buffer(&BufferDesc {
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                residency: MemoryResidency::CpuToGpu,
                queue_families: &[0],
            })
            .unwrap();
        let pool = d
            .create_raw_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cb = d.allocate_raw_command_buffer(pool).unwrap();
        d.begin_raw_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
            .unwrap();
        d.record(
            cb,
            &Command::CopyBufferToImage {
                src: buf,
                dst: image,
                layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                region: vk::BufferImageCopy {
                    image_extent: vk::Extent3D {
                        width: 2,
                        height: 2,
                        depth: 1,
                    },
                    ..Default::default()
                },
            },
        );
        d.end_raw_command_buffer(cb).unwrap();
        let cbs = [cb];
        let submit = SubmitDesc {
            command_buffers: &cbs,
            ..Default::default()
        };
        d.queue_submit(d.raw_queue(0), &submit, vk::Fence::null())
            .unwrap();
        assert_eq!(d.validation_errors().len(), 1);
        assert_eq!(d.image_layout(image), Some(vk::ImageLayout::UNDEFINED));
    }

    #[test]
    fn semaphores_must_be_waited_before_they_are_signaled_again() {
        let d = HeadlessDriver::new();
        let (sc, _) = d
            .create_raw_swapchain(&SwapchainDesc {
                min_image_count: 2,
                format: default_surface().formats[0],
                extent: vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                present_mode: vk::PresentModeKHR::FIFO,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                queue_families: &[0],
            })
            .unwrap();
        let sem = d.create_raw_semaphore().unwrap();
        d.acquire_next_image(sc, u64::MAX, sem).unwrap();

        let waits = [sem];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = SubmitDesc {
            wait_semaphores: &waits,
            wait_stages: &stages,
            ..Default::default()
        };
        d.queue_submit(d.raw_queue(0), &submit, vk::Fence::null())
            .unwrap();
        d.acquire_next_image(sc, u64::MAX, sem).unwrap();
        assert!(d.validation_errors().is_empty());

        d.acquire_next_image(sc, u64::MAX, sem).unwrap();
        d.queue_present(d.raw_queue(0), sc, 0, sem).unwrap();
        d.queue_present(d.raw_queue(0), sc, 1, sem).unwrap();
        let errors = d.validation_errors();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].contains("already signaled"));
        assert!(errors[1].contains("no signal pending"));
    }

    #[test]
    fn reset_returns_a_recording_buffer_to_initial() {
        let d = HeadlessDriver::new();
        let pool = d
            .create_raw_command_pool(0, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .unwrap();
        let cb = d.allocate_raw_command_buffer(pool).unwrap();
        d.begin_raw_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
            .unwrap();
        d.reset_raw_command_buffer(cb).unwrap();
        d.begin_raw_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
            .unwrap();
        assert!(d.validation_errors().is_empty());
    }

    #[test]
    fn scripted_acquire_results() {
        let d = HeadlessDriver::new();
        let (sc, images) = d
            .create_raw_swapchain(&SwapchainDesc {
                min_image_count: 2,
                format: default_surface().formats[0],
                extent: vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                present_mode: vk::PresentModeKHR::FIFO,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                queue_families: &[0],
            })
            .unwrap();
        assert_eq!(images.len(), 2);
        d.script_acquire(1, vk::Result::SUBOPTIMAL_KHR);
        d.script_acquire(2, vk::Result::ERROR_OUT_OF_DATE_KHR);
        let sem = vk::Semaphore::null();
        assert_eq!(d.acquire_next_image(sc, u64::MAX, sem), Ok((0, false)));
        assert_eq!(d.acquire_next_image(sc, u64::MAX, sem), Ok((1, true)));
        assert_eq!(
            d.acquire_next_image(sc, u64::MAX, sem),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
        assert_eq!(d.acquire_next_image(sc, u64::MAX, sem), Ok((0, false)));
    }
}
