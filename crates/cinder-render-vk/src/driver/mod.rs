// SPDX-License-Identifier: CEPL-1.0
//! The seam between the core and the GPU API.
//!
//! Everything above this module speaks in terms of [`DeviceDriver`]: fences,
//! recorders, resources and the renderer hold an `Arc<dyn DeviceDriver>` and
//! never touch an `ash::Device` directly. [`VulkanDriver`](crate::vulkan::VulkanDriver)
//! forwards to the real device; [`headless::HeadlessDriver`] simulates one in
//! host memory.
//!
//! Methods are safe to call. Implementations uphold the handle-provenance
//! rules internally: every handle passed in must have been returned by the
//! same driver and not yet destroyed.

pub mod headless;

use ash::vk;

pub type VkResult<T> = std::result::Result<T, vk::Result>;

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryResidency {
    /// Device-local, not mappable.
    GpuOnly,
    /// Host-visible, used for staging uploads.
    CpuToGpu,
    /// Host-visible and cached, used for readback.
    GpuToCpu,
}

impl MemoryResidency {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryResidency::GpuOnly)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub residency: MemoryResidency,
    /// More than one family selects concurrent sharing.
    pub queue_families: &'a [u32],
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub queue_families: &'a [u32],
}

#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc<'a> {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub queue_families: &'a [u32],
}

/// Fixed-function shape of the one graphics pipeline the renderer uses.
/// Viewport and scissor are baked in from `extent`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    pub vertex_spirv: &'a [u32],
    pub fragment_spirv: &'a [u32],
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub set_layout: vk::DescriptorSetLayout,
    pub push_constant_size: u32,
    pub vertex_binding: vk::VertexInputBindingDescription,
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDesc<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Single-image layout barrier over the full subresource range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// The closed set of commands a recorder may append.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
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
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: ImageBarrier,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &'a [vk::DescriptorSet],
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: &'a [vk::Buffer],
        offsets: &'a [vk::DeviceSize],
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &'a [u8],
    },
}

impl Command<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CopyBuffer { .. } => "copy_buffer",
            Command::CopyBufferToImage { .. } => "copy_buffer_to_image",
            Command::CopyImageToBuffer { .. } => "copy_image_to_buffer",
            Command::PipelineBarrier { .. } => "pipeline_barrier",
            Command::BeginRenderPass { .. } => "begin_render_pass",
            Command::EndRenderPass => "end_render_pass",
            Command::BindPipeline(_) => "bind_pipeline",
            Command::BindDescriptorSets { .. } => "bind_descriptor_sets",
            Command::BindVertexBuffers { .. } => "bind_vertex_buffers",
            Command::BindIndexBuffer { .. } => "bind_index_buffer",
            Command::DrawIndexed { .. } => "draw_indexed",
            Command::PushConstants { .. } => "push_constants",
        }
    }
}

pub trait DeviceDriver: Send + Sync {
    fn raw_queue(&self, family: u32) -> vk::Queue;
    fn wait_idle(&self) -> VkResult<()>;

    // Fences and semaphores.
    fn create_raw_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_raw_fence(&self, fence: vk::Fence);
    /// `Ok(true)` when signaled.
    fn get_raw_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    fn wait_for_raw_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()>;
    fn reset_raw_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;
    fn create_raw_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore);

    // Command pools and buffers.
    fn create_raw_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    fn destroy_raw_command_pool(&self, pool: vk::CommandPool);
    fn allocate_raw_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_raw_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    fn begin_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    fn end_raw_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    /// Returns the buffer to the initial state, dropping anything recorded.
    fn reset_raw_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn record(&self, buffer: vk::CommandBuffer, command: &Command<'_>);
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> VkResult<()>;

    // Memory-backed resources.
    fn create_raw_buffer(&self, desc: &BufferDesc<'_>) -> VkResult<vk::Buffer>;
    fn destroy_raw_buffer(&self, buffer: vk::Buffer);
    /// Copies `data` into a host-visible buffer's mapping.
    fn write_raw_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()>;
    fn read_raw_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VkResult<Vec<u8>>;
    fn create_raw_image(&self, desc: &ImageDesc<'_>) -> VkResult<vk::Image>;
    fn destroy_raw_image(&self, image: vk::Image);
    fn create_raw_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;
    fn destroy_raw_image_view(&self, view: vk::ImageView);

    // Presentation.
    fn surface_support(&self) -> VkResult<SurfaceSupport>;
    fn create_raw_swapchain(
        &self,
        desc: &SwapchainDesc<'_>,
    ) -> VkResult<(vk::SwapchainKHR, Vec<vk::Image>)>;
    fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// `(image_index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// `Ok(true)` when the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;

    // Pipeline objects.
    fn create_raw_render_pass(&self, format: vk::Format) -> VkResult<vk::RenderPass>;
    fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass);
    fn create_raw_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer);
    /// One combined image sampler visible to the fragment stage.
    fn create_raw_texture_set_layout(&self) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_raw_pipeline(
        &self,
        desc: &PipelineDesc<'_>,
    ) -> VkResult<(vk::PipelineLayout, vk::Pipeline)>;
    fn destroy_raw_pipeline(&self, layout: vk::PipelineLayout, pipeline: vk::Pipeline);
    fn create_raw_sampler(&self) -> VkResult<vk::Sampler>;
    fn destroy_raw_sampler(&self, sampler: vk::Sampler);
    /// A pool holding exactly one set, written with `view` and `sampler`.
    fn allocate_raw_texture_set(
        &self,
        layout: vk::DescriptorSetLayout,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> VkResult<(vk::DescriptorPool, vk::DescriptorSet)>;
    fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool);
}
