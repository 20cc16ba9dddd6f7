// SPDX-License-Identifier: CEPL-1.0
//! The steady-state frame loop.
//!
//! Each call to [`Renderer::render`] runs one frame against the current
//! frame slot:
//!
//! 1. wait for the slot's fence (the slot's previous submission),
//! 2. acquire a swapchain image, signaling the slot's `image_acquired`,
//! 3. record the render pass and the draw list,
//! 4. submit, waiting on `image_acquired` and signaling `render_finished`,
//! 5. present, waiting on `render_finished`,
//! 6. advance to the next slot.
//!
//! An out-of-date acquire recreates the swapchain and returns without
//! submitting, presenting or advancing. An out-of-date or suboptimal
//! present recreates after the frame is handed off.

use std::sync::Arc;

use ash::vk;
use cinder_core::Logger;
use cinder_math::Camera;
use cinder_render::RenderSize;
use slotmap::{new_key_type, SlotMap};

use crate::config::RendererConfig;
use crate::device::LogicalDevice;
use crate::driver::{DeviceDriver, PipelineDesc};
use crate::error::{Error, Result};
use crate::image::{Image, ImageView};
use crate::mesh::{Mesh, Vertex};
use crate::shader::ShaderBlob;
use crate::swapchain::{AcquireOutcome, PresentOutcome};
use crate::sync::FrameSyncSet;

/// Bytes pushed to the vertex stage: one column-major 4x4 matrix.
pub const CAMERA_PUSH_CONSTANT_SIZE: u32 = 64;

new_key_type! {
    pub struct TextureId;
    pub struct MeshId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and handed to the presentation engine.
    /// `recreated` is set when the present reported the swapchain stale and
    /// it was rebuilt afterwards.
    Presented { image_index: u32, recreated: bool },
    /// Acquire found the swapchain out of date. Nothing was submitted; the
    /// swapchain has been rebuilt and the next call renders normally.
    SwapchainRecreated,
    /// The framebuffer is zero-sized. Nothing was done.
    Paused,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub swapchain_recreations: u64,
    pub paused_frames: u64,
    pub draws_last_frame: u32,
}

struct Texture {
    view: ImageView,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

struct DrawItem {
    mesh: Mesh,
    texture: TextureId,
}

/// Swapchain-sized objects, rebuilt on every recreation.
struct Targets {
    framebuffers: Vec<vk::Framebuffer>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    extent: vk::Extent2D,
}

pub struct Renderer {
    frames: FrameSyncSet,
    render_pass: vk::RenderPass,
    render_pass_format: vk::Format,
    set_layout: vk::DescriptorSetLayout,
    sampler: vk::Sampler,
    targets: Option<Targets>,
    vertex_shader: ShaderBlob,
    fragment_shader: ShaderBlob,
    textures: SlotMap<TextureId, Texture>,
    default_texture: TextureId,
    draws: SlotMap<MeshId, DrawItem>,
    clear_color: [f32; 4],
    framebuffer_size: RenderSize,
    needs_recreate: bool,
    frame_index: u64,
    stats: FrameStats,
    log: Logger,
    // Dropped last; everything above refers to objects it owns.
    device: LogicalDevice,
}

impl Renderer {
    pub fn new(
        mut device: LogicalDevice,
        config: &RendererConfig,
        vertex_shader: ShaderBlob,
        fragment_shader: ShaderBlob,
        framebuffer: RenderSize,
        log: &Logger,
    ) -> Result<Self> {
        config.validate()?;
        let log = log.scoped("renderer");
        let driver = Arc::clone(device.driver());

        let frames = FrameSyncSet::new(&device, config.frames_in_flight as usize, &log)?;
        let render_pass_format = device
            .swapchain()
            .map_or(vk::Format::B8G8R8A8_SRGB, |sc| sc.format.format);
        let render_pass = driver
            .create_raw_render_pass(render_pass_format)
            .map_err(Error::vulkan("vkCreateRenderPass"))?;
        let set_layout = match driver.create_raw_texture_set_layout() {
            Ok(l) => l,
            Err(e) => {
                driver.destroy_raw_render_pass(render_pass);
                return Err(Error::vulkan("vkCreateDescriptorSetLayout")(e));
            }
        };
        let sampler = match driver.create_raw_sampler() {
            Ok(s) => s,
            Err(e) => {
                driver.destroy_raw_descriptor_set_layout(set_layout);
                driver.destroy_raw_render_pass(render_pass);
                return Err(Error::vulkan("vkCreateSampler")(e));
            }
        };

        let mut textures = SlotMap::with_key();
        let white = match upload_texture(&mut device, set_layout, sampler, &[255; 4], 1, 1) {
            Ok(t) => t,
            Err(e) => {
                driver.destroy_raw_sampler(sampler);
                driver.destroy_raw_descriptor_set_layout(set_layout);
                driver.destroy_raw_render_pass(render_pass);
                return Err(e);
            }
        };
        let default_texture = textures.insert(white);

        let mut renderer = Self {
            frames,
            render_pass,
            render_pass_format,
            set_layout,
            sampler,
            targets: None,
            vertex_shader,
            fragment_shader,
            textures,
            default_texture,
            draws: SlotMap::with_key(),
            clear_color: config.clear_color,
            framebuffer_size: framebuffer,
            needs_recreate: false,
            frame_index: 0,
            stats: FrameStats::default(),
            log,
            device,
        };
        if renderer.device.swapchain().is_some() {
            renderer.targets = Some(renderer.build_targets()?);
        } else {
            renderer.needs_recreate = true;
        }
        renderer.log.info(format_args!(
            "renderer ready with {} frame(s) in flight",
            renderer.frames.len()
        ));
        Ok(renderer)
    }

    pub fn device(&self) -> &LogicalDevice {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut LogicalDevice {
        &mut self.device
    }

    pub fn sync_set(&self) -> &FrameSyncSet {
        &self.frames
    }

    /// Frames rendered so far, counting only those that reached present.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    /// Records the new framebuffer size; the swapchain is rebuilt at the
    /// start of the next frame.
    pub fn resize(&mut self, size: RenderSize) {
        if size != self.framebuffer_size {
            self.log.debug(format_args!(
                "framebuffer resized to {}x{}",
                size.width, size.height
            ));
        }
        self.framebuffer_size = size;
        self.needs_recreate = true;
    }

    pub fn render(&mut self, camera: &Camera) -> Result<FrameOutcome> {
        if self.framebuffer_size.is_zero() {
            self.stats.paused_frames += 1;
            return Ok(FrameOutcome::Paused);
        }
        if self.needs_recreate || self.targets.is_none() {
            if !self.recreate()? {
                self.stats.paused_frames += 1;
                return Ok(FrameOutcome::Paused);
            }
        }

        let slot = self.frames.current_mut();
        slot.recorder.wait()?;
        let image_acquired = slot.image_acquired.raw();
        let render_finished = slot.render_finished.raw();

        let (image_index, acquire_suboptimal) =
            match self.device.acquire_next_image(image_acquired)? {
                AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
                AcquireOutcome::OutOfDate => {
                    self.log
                        .debug(format_args!("swapchain out of date at acquire"));
                    self.needs_recreate = true;
                    return if self.recreate()? {
                        Ok(FrameOutcome::SwapchainRecreated)
                    } else {
                        self.stats.paused_frames += 1;
                        Ok(FrameOutcome::Paused)
                    };
                }
            };

        let draws = match self.record_frame(image_index, camera) {
            Ok(draws) => draws,
            Err(e) => {
                self.discard_frame(image_acquired, &e);
                return Err(e);
            }
        };
        let slot = self.frames.current_mut();
        slot.recorder.submit(
            &[image_acquired],
            &[render_finished],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        )?;

        let present = self.device.present(image_index, render_finished)?;
        self.stats.frames_presented += 1;
        self.stats.draws_last_frame = draws;
        self.frame_index += 1;
        self.frames.advance();

        let mut recreated = false;
        if acquire_suboptimal || present.needs_recreate() {
            if present == PresentOutcome::OutOfDate {
                self.log
                    .debug(format_args!("swapchain out of date at present"));
            }
            self.needs_recreate = true;
            recreated = self.recreate()?;
        }
        Ok(FrameOutcome::Presented {
            image_index,
            recreated,
        })
    }

    /// Uploads tightly packed RGBA8 sRGB pixels as a sampled texture.
    pub fn create_texture(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<TextureId> {
        let texture = upload_texture(
            &mut self.device,
            self.set_layout,
            self.sampler,
            pixels,
            width,
            height,
        )?;
        Ok(self.textures.insert(texture))
    }

    /// Adds `mesh` to the draw list, textured with `texture` or the default
    /// white texture.
    pub fn add_mesh(&mut self, mesh: Mesh, texture: Option<TextureId>) -> Result<MeshId> {
        let texture = match texture {
            Some(t) if self.textures.contains_key(t) => t,
            Some(_) => {
                mesh.destroy(&mut self.device);
                return Err(Error::StaleHandle);
            }
            None => self.default_texture,
        };
        Ok(self.draws.insert(DrawItem { mesh, texture }))
    }

    /// Removes a mesh from the draw list and frees its buffers once the GPU
    /// is done with them.
    pub fn remove_mesh(&mut self, id: MeshId) -> Result<()> {
        let item = self.draws.remove(id).ok_or(Error::StaleHandle)?;
        self.device.wait_idle()?;
        item.mesh.destroy(&mut self.device);
        Ok(())
    }

    pub fn mesh_count(&self) -> usize {
        self.draws.len()
    }

    /// Convenience for `Mesh::upload` on this renderer's device.
    pub fn upload_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> Result<Mesh> {
        Mesh::upload(&mut self.device, vertices, indices)
    }

    fn record_frame(&mut self, image_index: u32, camera: &Camera) -> Result<u32> {
        let targets = self
            .targets
            .as_ref()
            .ok_or(Error::InvalidSize("no swapchain targets"))?;
        let framebuffer = *targets
            .framebuffers
            .get(image_index as usize)
            .ok_or(Error::InvalidSize("image index outside the swapchain"))?;
        let layout = targets.pipeline_layout;
        let matrix = camera.to_push_constant();
        let device = &self.device;
        let rec = &mut self.frames.current_mut().recorder;

        rec.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?
            .begin_render_pass(
                self.render_pass,
                framebuffer,
                targets.extent,
                self.clear_color,
            )?
            .bind_pipeline(targets.pipeline)?
            .push_constants(
                layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::cast_slice(&matrix),
            )?;

        let mut draws = 0;
        for item in self.draws.values() {
            let set = self
                .textures
                .get(item.texture)
                .or_else(|| self.textures.get(self.default_texture))
                .map(|t| t.set)
                .ok_or(Error::StaleHandle)?;
            let vertices = item.mesh.vertex_buffer().raw(device)?;
            let indices = item.mesh.index_buffer().raw(device)?;
            rec.bind_descriptor_sets(layout, 0, &[set])?
                .bind_vertex_buffers(0, &[vertices], &[0])?
                .bind_index_buffer(indices, 0, vk::IndexType::UINT32)?
                .draw_indexed(item.mesh.index_count(), 1, 0, 0, 0)?;
            draws += 1;
        }
        rec.end_render_pass()?;
        Ok(draws)
    }

    /// Recovers the slot after `record_frame` failed part way. The acquired
    /// image is never presented, so the swapchain is rebuilt before the next
    /// frame to hand it back.
    fn discard_frame(&mut self, image_acquired: vk::Semaphore, cause: &Error) {
        self.log
            .warn(format_args!("frame {} discarded: {cause}", self.frame_index));
        let slot = self.frames.current_mut();
        if let Err(e) = slot.recorder.abandon(
            &[image_acquired],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        ) {
            self.log
                .error(format_args!("discarding frame {}: {e}", self.frame_index));
        }
        self.needs_recreate = true;
    }

    /// Rebuilds the swapchain and everything sized by it. Returns `false`
    /// when the framebuffer is zero-sized and nothing could be built.
    fn recreate(&mut self) -> Result<bool> {
        if self.framebuffer_size.is_zero() {
            return Ok(false);
        }
        // Waits for the device to go idle before anything is replaced; old
        // targets are only destroyed after that.
        if !self.device.recreate_swapchain(self.framebuffer_size)? {
            return Ok(false);
        }
        self.destroy_targets();

        let format = self
            .device
            .swapchain()
            .map(|sc| sc.format.format)
            .unwrap_or(self.render_pass_format);
        if format != self.render_pass_format {
            self.log.info(format_args!(
                "surface format changed {:?} -> {:?}; rebuilding render pass",
                self.render_pass_format, format
            ));
            let driver = self.device.driver();
            let render_pass = driver
                .create_raw_render_pass(format)
                .map_err(Error::vulkan("vkCreateRenderPass"))?;
            driver.destroy_raw_render_pass(self.render_pass);
            self.render_pass = render_pass;
            self.render_pass_format = format;
        }

        self.targets = Some(self.build_targets()?);
        self.needs_recreate = false;
        self.stats.swapchain_recreations += 1;
        Ok(true)
    }

    fn build_targets(&self) -> Result<Targets> {
        let sc = self
            .device
            .swapchain()
            .ok_or(Error::InvalidSize("no swapchain to build targets for"))?;
        let driver = self.device.driver();
        let attributes = Vertex::attributes();
        let (pipeline_layout, pipeline) = driver
            .create_raw_pipeline(&PipelineDesc {
                vertex_spirv: self.vertex_shader.words(),
                fragment_spirv: self.fragment_shader.words(),
                render_pass: self.render_pass,
                extent: sc.extent,
                set_layout: self.set_layout,
                push_constant_size: CAMERA_PUSH_CONSTANT_SIZE,
                vertex_binding: Vertex::binding(),
                vertex_attributes: &attributes,
            })
            .map_err(Error::vulkan("vkCreateGraphicsPipelines"))?;

        let mut framebuffers = Vec::with_capacity(sc.views.len());
        for &view in &sc.views {
            match driver.create_raw_framebuffer(self.render_pass, view, sc.extent) {
                Ok(fb) => framebuffers.push(fb),
                Err(e) => {
                    for fb in framebuffers {
                        driver.destroy_raw_framebuffer(fb);
                    }
                    driver.destroy_raw_pipeline(pipeline_layout, pipeline);
                    return Err(Error::vulkan("vkCreateFramebuffer")(e));
                }
            }
        }
        Ok(Targets {
            framebuffers,
            pipeline_layout,
            pipeline,
            extent: sc.extent,
        })
    }

    fn destroy_targets(&mut self) {
        if let Some(t) = self.targets.take() {
            let driver = self.device.driver();
            for fb in t.framebuffers {
                driver.destroy_raw_framebuffer(fb);
            }
            driver.destroy_raw_pipeline(t.pipeline_layout, t.pipeline);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            self.log
                .error(format_args!("wait idle during renderer teardown: {e}"));
        }
        self.destroy_targets();
        for (_, item) in self.draws.drain() {
            item.mesh.destroy(&mut self.device);
        }
        let driver: Arc<dyn DeviceDriver> = Arc::clone(self.device.driver());
        for (_, t) in self.textures.drain() {
            driver.destroy_raw_descriptor_pool(t.pool);
            t.view.destroy(&mut self.device);
        }
        driver.destroy_raw_sampler(self.sampler);
        driver.destroy_raw_descriptor_set_layout(self.set_layout);
        driver.destroy_raw_render_pass(self.render_pass);
    }
}

fn upload_texture(
    device: &mut LogicalDevice,
    set_layout: vk::DescriptorSetLayout,
    sampler: vk::Sampler,
    pixels: &[u8],
    width: u32,
    height: u32,
) -> Result<Texture> {
    let image = Image::from_pixels(device, pixels, width, height, vk::Format::R8G8B8A8_SRGB)?;
    let view = ImageView::create(device, image, vk::ImageAspectFlags::COLOR)?;
    let raw_view = match view.raw(device) {
        Ok(v) => v,
        Err(e) => {
            view.destroy(device);
            return Err(e);
        }
    };
    match device
        .driver()
        .allocate_raw_texture_set(set_layout, raw_view, sampler)
    {
        Ok((pool, set)) => Ok(Texture { view, pool, set }),
        Err(e) => {
            view.destroy(device);
            Err(Error::vulkan("vkAllocateDescriptorSets")(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecorderState;
    use crate::config::DeviceConfig;
    use crate::driver::headless::{Event, HeadlessDriver};
    use cinder_core::log::{CaptureSink, Level};
    use crate::mesh::{QUAD_INDICES, QUAD_VERTICES};

    fn renderer(h: &Arc<HeadlessDriver>, frames: u32) -> Renderer {
        renderer_with_log(h, frames, &Logger::default())
    }

    fn renderer_with_log(h: &Arc<HeadlessDriver>, frames: u32, log: &Logger) -> Renderer {
        let d: Arc<dyn DeviceDriver> = h.clone();
        let size = RenderSize::new(800, 600);
        let device =
            LogicalDevice::new(d, h.physical_device_info(), DeviceConfig::default(), size, log)
                .unwrap();
        let config = RendererConfig {
            frames_in_flight: frames,
            ..RendererConfig::default()
        };
        Renderer::new(
            device,
            &config,
            ShaderBlob::placeholder(),
            ShaderBlob::placeholder(),
            size,
            log,
        )
        .unwrap()
    }

    #[test]
    fn rejects_out_of_range_frames_in_flight() {
        let h = Arc::new(HeadlessDriver::default());
        let d: Arc<dyn DeviceDriver> = h.clone();
        let log = Logger::default();
        let device = LogicalDevice::new(
            d,
            h.physical_device_info(),
            DeviceConfig::default(),
            RenderSize::new(8, 8),
            &log,
        )
        .unwrap();
        let config = RendererConfig {
            frames_in_flight: 4,
            ..RendererConfig::default()
        };
        let err = Renderer::new(
            device,
            &config,
            ShaderBlob::placeholder(),
            ShaderBlob::placeholder(),
            RenderSize::new(8, 8),
            &log,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_size_pauses_without_touching_the_gpu() {
        let h = Arc::new(HeadlessDriver::default());
        let mut r = renderer(&h, 2);
        r.resize(RenderSize::new(0, 0));
        h.clear_events();
        assert_eq!(r.render(&Camera::default()).unwrap(), FrameOutcome::Paused);
        assert!(h.events().is_empty());
        assert_eq!(r.stats().paused_frames, 1);
    }

    #[test]
    fn draws_every_mesh_with_a_camera_push() {
        let h = Arc::new(HeadlessDriver::default());
        let mut r = renderer(&h, 2);
        let mesh = r.upload_mesh(&QUAD_VERTICES, &QUAD_INDICES).unwrap();
        r.add_mesh(mesh, None).unwrap();
        let mesh = r.upload_mesh(&QUAD_VERTICES, &QUAD_INDICES).unwrap();
        let tex = r.create_texture(&[0x80; 16], 2, 2).unwrap();
        r.add_mesh(mesh, Some(tex)).unwrap();
        h.clear_events();

        r.render(&Camera::default()).unwrap();
        let recorded = |name: &str| {
            h.count(|e| matches!(e, Event::Record { command, .. } if *command == name))
        };
        assert_eq!(recorded("push_constants"), 1);
        assert_eq!(recorded("draw_indexed"), 2);
        assert_eq!(recorded("bind_descriptor_sets"), 2);
        assert_eq!(r.stats().draws_last_frame, 2);
        assert!(h.validation_errors().is_empty());
    }

    #[test]
    fn removing_a_mesh_frees_its_buffers() {
        let h = Arc::new(HeadlessDriver::default());
        let mut r = renderer(&h, 1);
        let before = r.device().live_resources();
        let mesh = r.upload_mesh(&QUAD_VERTICES, &QUAD_INDICES).unwrap();
        let id = r.add_mesh(mesh, None).unwrap();
        assert_eq!(r.device().live_resources(), before + 2);
        r.remove_mesh(id).unwrap();
        assert_eq!(r.device().live_resources(), before);
        assert!(matches!(r.remove_mesh(id), Err(Error::StaleHandle)));
    }

    #[test]
    fn failed_recording_is_discarded_and_the_next_frame_presents() {
        let h = Arc::new(HeadlessDriver::default());
        let sink = CaptureSink::new();
        let log = Logger::new(sink.clone());
        let mut r = renderer_with_log(&h, 2, &log);
        let mesh = r.upload_mesh(&QUAD_VERTICES, &QUAD_INDICES).unwrap();
        r.add_mesh(mesh, None).unwrap();
        r.render(&Camera::default()).unwrap();

        // Without the default texture the draw list cannot be bound.
        let white = r.textures.remove(r.default_texture).unwrap();
        let slot = r.sync_set().current_index();
        let acquired = r.sync_set().image_acquired()[slot];
        h.clear_events();
        assert!(matches!(
            r.render(&Camera::default()),
            Err(Error::StaleHandle)
        ));
        assert_eq!(
            r.sync_set().slot(slot).unwrap().recorder.state(),
            RecorderState::Idle
        );
        assert_eq!(
            h.count(|e| matches!(
                e,
                Event::QueueSubmit { command_buffers, wait_semaphores, .. }
                    if command_buffers.is_empty() && wait_semaphores == &[acquired]
            )),
            1
        );
        assert_eq!(h.count(|e| matches!(e, Event::QueuePresent { .. })), 0);
        assert_eq!(r.frame_index(), 1);
        assert!(sink.contains(Level::Warn, "discarded"));

        r.default_texture = r.textures.insert(white);
        h.clear_events();
        assert!(matches!(
            r.render(&Camera::default()).unwrap(),
            FrameOutcome::Presented { .. }
        ));
        assert_eq!(h.count(|e| matches!(e, Event::CreateSwapchain { .. })), 1);
        assert_eq!(r.frame_index(), 2);
        assert!(h.validation_errors().is_empty(), "{:?}", h.validation_errors());
    }

    #[test]
    fn recreation_waits_idle_once() {
        let h = Arc::new(HeadlessDriver::default());
        let mut r = renderer(&h, 2);
        h.clear_events();
        r.resize(RenderSize::new(1024, 768));
        r.render(&Camera::default()).unwrap();
        assert_eq!(h.count(|e| matches!(e, Event::WaitIdle)), 1);
        assert_eq!(h.count(|e| matches!(e, Event::QuerySurface)), 1);
        let events = h.events();
        let idle = events.iter().position(|e| matches!(e, Event::WaitIdle));
        let teardown = events
            .iter()
            .position(|e| matches!(e, Event::DestroyPipeline(_)));
        assert!(idle < teardown);
    }

    #[test]
    fn render_pass_survives_recreation_with_same_format() {
        let h = Arc::new(HeadlessDriver::default());
        let mut r = renderer(&h, 2);
        h.clear_events();
        r.resize(RenderSize::new(1024, 768));
        r.render(&Camera::default()).unwrap();
        assert_eq!(h.count(|e| matches!(e, Event::CreateRenderPass(_))), 0);
        assert_eq!(h.count(|e| matches!(e, Event::CreatePipeline { .. })), 1);
    }

    #[test]
    fn format_change_rebuilds_render_pass() {
        let h = Arc::new(HeadlessDriver::default());
        let mut r = renderer(&h, 2);
        h.set_surface_formats(vec![vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }]);
        h.clear_events();
        r.resize(RenderSize::new(800, 600));
        r.render(&Camera::default()).unwrap();
        assert_eq!(h.count(|e| matches!(e, Event::CreateRenderPass(_))), 1);
        assert_eq!(h.count(|e| matches!(e, Event::DestroyRenderPass(_))), 1);
    }

    #[test]
    fn teardown_releases_every_driver_object() {
        let h = Arc::new(HeadlessDriver::default());
        {
            let mut r = renderer(&h, 3);
            let mesh = r.upload_mesh(&QUAD_VERTICES, &QUAD_INDICES).unwrap();
            r.add_mesh(mesh, None).unwrap();
            for _ in 0..4 {
                r.render(&Camera::default()).unwrap();
            }
        }
        assert_eq!(h.live_objects(), 0);
    }
}
