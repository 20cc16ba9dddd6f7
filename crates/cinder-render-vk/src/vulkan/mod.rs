// SPDX-License-Identifier: CEPL-1.0
//! [`DeviceDriver`] over a real `ash` device.
//!
//! Device-local buffer and image memory comes from `gpu-allocator`.
//! Host-visible buffers get their own coherent `vkAllocateMemory` block,
//! mapped only for the span of a single read or write. Memory is kept here
//! keyed by the handle it backs.

mod instance;
mod pipeline;

pub use instance::VulkanInstance;

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Mutex, MutexGuard};

use ash::khr::swapchain;
use ash::vk;
use cinder_core::Logger;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use crate::driver::{
    BufferDesc, Command, DeviceDriver, ImageDesc, MemoryResidency, PipelineDesc, SubmitDesc,
    SurfaceSupport, SwapchainDesc, VkResult,
};
use crate::error::{Error, Result};
use crate::physical::PhysicalDeviceInfo;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn sharing(families: &[u32]) -> vk::SharingMode {
    if families.len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    }
}

/// Picks a host-visible, coherent memory type allowed by `type_bits`.
/// Readback buffers prefer a cached type when one exists.
fn host_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    residency: MemoryResidency,
) -> Option<u32> {
    let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    let candidates = || {
        (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32)).filter(move |&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
    };
    let cached = match residency {
        MemoryResidency::GpuToCpu => candidates().find(|&i| {
            props.memory_types[i as usize]
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_CACHED)
        }),
        _ => None,
    };
    cached.or_else(|| candidates().next())
}

/// Memory backing one buffer.
enum BufferMemory {
    Pooled(Allocation),
    /// Dedicated host-visible block bound at offset 0.
    Host {
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
    },
}

/// Resolves `offset..offset + len` of `buffer` to its host memory.
fn host_range(
    buffers: &HashMap<vk::Buffer, BufferMemory>,
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
) -> VkResult<vk::DeviceMemory> {
    match buffers.get(&buffer) {
        Some(&BufferMemory::Host { memory, size })
            if offset.checked_add(len).is_some_and(|end| end <= size) =>
        {
            Ok(memory)
        }
        _ => Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
    }
}

fn full_color_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub struct VulkanDriver {
    physical: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocator: Option<Mutex<Allocator>>,
    buffers: Mutex<HashMap<vk::Buffer, BufferMemory>>,
    images: Mutex<HashMap<vk::Image, Allocation>>,
    log: Logger,
    // Dropped after the device.
    instance: VulkanInstance,
}

impl VulkanDriver {
    /// Creates the logical device on `info.handle` with one queue per
    /// distinct family in `info.queues` and the given device extensions.
    pub fn new(
        instance: VulkanInstance,
        info: &PhysicalDeviceInfo,
        extensions: &[String],
        log: &Logger,
    ) -> Result<Self> {
        let log = log.scoped("vulkan");
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = info
            .queues
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();
        let names: Vec<CString> = extensions
            .iter()
            .filter_map(|e| CString::new(e.as_str()).ok())
            .collect();
        let name_ptrs: Vec<*const std::ffi::c_char> = names.iter().map(|n| n.as_ptr()).collect();
        let device_info = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: name_ptrs.len() as u32,
            pp_enabled_extension_names: name_ptrs.as_ptr(),
            ..Default::default()
        };
        // SAFETY: `info.handle` was enumerated from this instance and every
        // pointer in `device_info` refers to locals alive for the call.
        let device = unsafe {
            instance
                .instance
                .create_device(info.handle, &device_info, None)
        }
        .map_err(|result| Error::DeviceCreation {
            stage: "create device",
            result,
        })?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device: info.handle,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(a) => a,
            Err(e) => {
                log.error(format_args!("gpu allocator: {e}"));
                // SAFETY: no objects have been created from `device`.
                unsafe { device.destroy_device(None) };
                return Err(Error::DeviceCreation {
                    stage: "create allocator",
                    result: vk::Result::ERROR_INITIALIZATION_FAILED,
                });
            }
        };

        let swapchain_loader = swapchain::Device::new(&instance.instance, &device);
        // SAFETY: `info.handle` was enumerated from this instance.
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(info.handle)
        };
        log.info(format_args!(
            "device created on '{}' with {} queue(s)",
            info.name,
            queue_infos.len()
        ));
        Ok(Self {
            physical: info.handle,
            device,
            swapchain_loader,
            memory_properties,
            allocator: Some(Mutex::new(allocator)),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            log,
            instance,
        })
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> VkResult<Allocation> {
        let Some(allocator) = &self.allocator else {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        };
        lock(allocator)
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                self.log.error(format_args!("{name} allocation failed: {e}"));
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            })
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = &self.allocator {
            if let Err(e) = lock(allocator).free(allocation) {
                self.log.warn(format_args!("freeing allocation: {e}"));
            }
        }
    }

    fn allocate_host(
        &self,
        requirements: vk::MemoryRequirements,
        residency: MemoryResidency,
    ) -> VkResult<vk::DeviceMemory> {
        let Some(memory_type_index) = host_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            residency,
        ) else {
            self.log
                .error(format_args!("no host-visible coherent memory type for buffer"));
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        };
        let info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: requirements.size,
            memory_type_index,
            ..Default::default()
        };
        // SAFETY: `memory_type_index` comes from this device's properties.
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn release(&self, memory: BufferMemory) {
        match memory {
            BufferMemory::Pooled(allocation) => self.free(allocation),
            // SAFETY: the buffer bound to `memory` is already destroyed and
            // the block is never left mapped.
            BufferMemory::Host { memory, .. } => unsafe { self.device.free_memory(memory, None) },
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        // SAFETY: every fence, pool, resource and swapchain created through
        // this driver holds an `Arc` to it, so all of them are gone by now.
        unsafe {
            let _ = self.device.device_wait_idle();
            let leaked: Vec<_> = lock(&self.buffers).drain().collect();
            for (buffer, memory) in leaked {
                self.device.destroy_buffer(buffer, None);
                self.release(memory);
            }
            let leaked: Vec<_> = lock(&self.images).drain().collect();
            for (image, allocation) in leaked {
                self.device.destroy_image(image, None);
                self.free(allocation);
            }
            // The allocator frees its memory blocks and must go before the
            // device.
            drop(self.allocator.take());
            self.device.destroy_device(None);
        }
    }
}

// SAFETY (for every `unsafe` block below): handles passed to these methods
// were created by this driver and are not yet destroyed, per the
// `DeviceDriver` contract, and `self.device` is live for `&self`.
impl DeviceDriver for VulkanDriver {
    fn raw_queue(&self, family: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, 0) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_raw_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_raw_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn get_raw_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_for_raw_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout) }
    }

    fn reset_raw_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn create_raw_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_raw_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags,
            queue_family_index: family,
            ..Default::default()
        };
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_raw_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }?;
        buffers
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_raw_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) }
    }

    fn begin_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: usage,
            ..Default::default()
        };
        unsafe { self.device.begin_command_buffer(buffer, &info) }
    }

    fn end_raw_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn reset_raw_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn record(&self, cb: vk::CommandBuffer, command: &Command<'_>) {
        let d = &self.device;
        unsafe {
            match *command {
                Command::CopyBuffer { src, dst, region } => {
                    d.cmd_copy_buffer(cb, src, dst, &[region]);
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    layout,
                    region,
                } => d.cmd_copy_buffer_to_image(cb, src, dst, layout, &[region]),
                Command::CopyImageToBuffer {
                    src,
                    layout,
                    dst,
                    region,
                } => d.cmd_copy_image_to_buffer(cb, src, layout, dst, &[region]),
                Command::PipelineBarrier {
                    src_stage,
                    dst_stage,
                    barrier,
                } => {
                    let b = vk::ImageMemoryBarrier {
                        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
                        src_access_mask: barrier.src_access,
                        dst_access_mask: barrier.dst_access,
                        old_layout: barrier.old_layout,
                        new_layout: barrier.new_layout,
                        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        image: barrier.image,
                        subresource_range: full_color_range(barrier.aspect),
                        ..Default::default()
                    };
                    d.cmd_pipeline_barrier(
                        cb,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        std::slice::from_ref(&b),
                    );
                }
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_color,
                } => {
                    let clear = vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color,
                        },
                    };
                    let info = vk::RenderPassBeginInfo {
                        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                        render_pass,
                        framebuffer,
                        render_area: vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent,
                        },
                        clear_value_count: 1,
                        p_clear_values: &clear,
                        ..Default::default()
                    };
                    d.cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => d.cmd_end_render_pass(cb),
                Command::BindPipeline(pipeline) => {
                    d.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
                }
                Command::BindDescriptorSets {
                    layout,
                    first_set,
                    sets,
                } => d.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    first_set,
                    sets,
                    &[],
                ),
                Command::BindVertexBuffers {
                    first_binding,
                    buffers,
                    offsets,
                } => d.cmd_bind_vertex_buffers(cb, first_binding, buffers, offsets),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => d.cmd_bind_index_buffer(cb, buffer, offset, index_type),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => d.cmd_draw_indexed(
                    cb,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                ),
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => d.cmd_push_constants(cb, layout, stages, offset, data),
            }
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let info = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: submit.wait_semaphores.len() as u32,
            p_wait_semaphores: submit.wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: submit.wait_stages.as_ptr(),
            command_buffer_count: submit.command_buffers.len() as u32,
            p_command_buffers: submit.command_buffers.as_ptr(),
            signal_semaphore_count: submit.signal_semaphores.len() as u32,
            p_signal_semaphores: submit.signal_semaphores.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .queue_submit(queue, std::slice::from_ref(&info), fence)
        }
    }

    fn create_raw_buffer(&self, desc: &BufferDesc<'_>) -> VkResult<vk::Buffer> {
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size: desc.size,
            usage: desc.usage,
            sharing_mode: sharing(desc.queue_families),
            queue_family_index_count: desc.queue_families.len() as u32,
            p_queue_family_indices: desc.queue_families.as_ptr(),
            ..Default::default()
        };
        unsafe {
            let buffer = self.device.create_buffer(&info, None)?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let allocated = match desc.residency {
                MemoryResidency::GpuOnly => self
                    .allocate("buffer", requirements, MemoryLocation::GpuOnly, true)
                    .map(BufferMemory::Pooled),
                residency => self
                    .allocate_host(requirements, residency)
                    .map(|memory| BufferMemory::Host {
                        memory,
                        size: desc.size,
                    }),
            };
            let memory = match allocated {
                Ok(m) => m,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            let (raw, offset) = match &memory {
                BufferMemory::Pooled(a) => (a.memory(), a.offset()),
                BufferMemory::Host { memory, .. } => (*memory, 0),
            };
            if let Err(e) = self.device.bind_buffer_memory(buffer, raw, offset) {
                self.device.destroy_buffer(buffer, None);
                self.release(memory);
                return Err(e);
            }
            lock(&self.buffers).insert(buffer, memory);
            Ok(buffer)
        }
    }

    fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(memory) = lock(&self.buffers).remove(&buffer) {
            self.release(memory);
        }
    }

    fn write_raw_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        // The lock is held while mapped so no two calls map one block.
        let buffers = lock(&self.buffers);
        let len = data.len() as vk::DeviceSize;
        let memory = host_range(&buffers, buffer, offset, len)?;
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, offset, len, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn read_raw_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> VkResult<Vec<u8>> {
        let buffers = lock(&self.buffers);
        let memory = host_range(&buffers, buffer, offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, offset, len, vk::MemoryMapFlags::empty())?;
            let bytes = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize).to_vec();
            self.device.unmap_memory(memory);
            Ok(bytes)
        }
    }

    fn create_raw_image(&self, desc: &ImageDesc<'_>) -> VkResult<vk::Image> {
        let info = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: desc.tiling,
            usage: desc.usage,
            sharing_mode: sharing(desc.queue_families),
            queue_family_index_count: desc.queue_families.len() as u32,
            p_queue_family_indices: desc.queue_families.as_ptr(),
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let linear = desc.tiling == vk::ImageTiling::LINEAR;
        unsafe {
            let image = self.device.create_image(&info, None)?;
            let requirements = self.device.get_image_memory_requirements(image);
            let allocation =
                match self.allocate("image", requirements, MemoryLocation::GpuOnly, linear) {
                    Ok(a) => a,
                    Err(e) => {
                        self.device.destroy_image(image, None);
                        return Err(e);
                    }
                };
            if let Err(e) =
                self.device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                self.device.destroy_image(image, None);
                self.free(allocation);
                return Err(e);
            }
            lock(&self.images).insert(image, allocation);
            Ok(image)
        }
    }

    fn destroy_raw_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = lock(&self.images).remove(&image) {
            self.free(allocation);
        }
    }

    fn create_raw_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: full_color_range(aspect),
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&info, None) }
    }

    fn destroy_raw_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        let loader = &self.instance.surface_loader;
        let surface = self.instance.surface;
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader
                    .get_physical_device_surface_capabilities(self.physical, surface)?,
                formats: loader.get_physical_device_surface_formats(self.physical, surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(self.physical, surface)?,
            })
        }
    }

    fn create_raw_swapchain(
        &self,
        desc: &SwapchainDesc<'_>,
    ) -> VkResult<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.instance.surface,
            min_image_count: desc.min_image_count,
            image_format: desc.format.format,
            image_color_space: desc.format.color_space,
            image_extent: desc.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing(desc.queue_families),
            queue_family_index_count: desc.queue_families.len() as u32,
            p_queue_family_indices: desc.queue_families.as_ptr(),
            pre_transform: desc.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: desc.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        unsafe {
            let swapchain = self.swapchain_loader.create_swapchain(&info, None)?;
            match self.swapchain_loader.get_swapchain_images(swapchain) {
                Ok(images) => Ok((swapchain, images)),
                Err(e) => {
                    self.swapchain_loader.destroy_swapchain(swapchain, None);
                    Err(e)
                }
            }
        }
    }

    fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait_semaphore,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe { self.swapchain_loader.queue_present(queue, &info) }
    }

    fn create_raw_render_pass(&self, format: vk::Format) -> VkResult<vk::RenderPass> {
        unsafe { pipeline::create_render_pass(&self.device, format) }
    }

    fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_raw_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        unsafe { pipeline::create_framebuffer(&self.device, render_pass, view, extent) }
    }

    fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_raw_texture_set_layout(&self) -> VkResult<vk::DescriptorSetLayout> {
        unsafe { pipeline::create_texture_set_layout(&self.device) }
    }

    fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_raw_pipeline(
        &self,
        desc: &PipelineDesc<'_>,
    ) -> VkResult<(vk::PipelineLayout, vk::Pipeline)> {
        unsafe { pipeline::create_pipeline(&self.device, desc) }
    }

    fn destroy_raw_pipeline(&self, layout: vk::PipelineLayout, pipeline: vk::Pipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
            self.device.destroy_pipeline_layout(layout, None);
        }
    }

    fn create_raw_sampler(&self) -> VkResult<vk::Sampler> {
        unsafe { pipeline::create_sampler(&self.device) }
    }

    fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn allocate_raw_texture_set(
        &self,
        layout: vk::DescriptorSetLayout,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> VkResult<(vk::DescriptorPool, vk::DescriptorSet)> {
        unsafe { pipeline::allocate_texture_set(&self.device, layout, view, sampler) }
    }

    fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn host_memory_must_be_visible_and_coherent() {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let visible = vk::MemoryPropertyFlags::HOST_VISIBLE;
        let coherent = visible | vk::MemoryPropertyFlags::HOST_COHERENT;
        let p = props(&[local, visible, coherent]);

        assert_eq!(host_memory_type(&p, 0b111, MemoryResidency::CpuToGpu), Some(2));
        assert_eq!(host_memory_type(&p, 0b011, MemoryResidency::CpuToGpu), None);
    }

    #[test]
    fn readback_prefers_cached_memory() {
        let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let cached = coherent | vk::MemoryPropertyFlags::HOST_CACHED;
        let p = props(&[coherent, cached]);

        assert_eq!(host_memory_type(&p, 0b11, MemoryResidency::GpuToCpu), Some(1));
        assert_eq!(host_memory_type(&p, 0b11, MemoryResidency::CpuToGpu), Some(0));
        assert_eq!(host_memory_type(&p, 0b01, MemoryResidency::GpuToCpu), Some(0));
    }

    #[test]
    fn host_ranges_are_bounds_checked() {
        let host = vk::Buffer::from_raw(1);
        let pooled = vk::Buffer::from_raw(2);
        let memory = vk::DeviceMemory::from_raw(7);
        let mut buffers = HashMap::new();
        buffers.insert(host, BufferMemory::Host { memory, size: 64 });
        buffers.insert(pooled, BufferMemory::Pooled(Allocation::default()));

        assert_eq!(host_range(&buffers, host, 0, 64), Ok(memory));
        assert_eq!(host_range(&buffers, host, 60, 4), Ok(memory));
        assert_eq!(
            host_range(&buffers, host, 60, 8),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
        assert_eq!(
            host_range(&buffers, host, u64::MAX, 2),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
        // Device-local buffers are never mapped.
        assert_eq!(
            host_range(&buffers, pooled, 0, 1),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
        assert_eq!(
            host_range(&buffers, vk::Buffer::from_raw(3), 0, 1),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
    }
}
