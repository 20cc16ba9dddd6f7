// SPDX-License-Identifier: CEPL-1.0
//! Vulkan rendering core.
//!
//! The layers, bottom up:
//!
//! - [`driver`]: the [`DeviceDriver`] seam, with the real
//!   [`vulkan::VulkanDriver`] and the in-memory [`driver::headless`] one.
//! - [`physical`] and [`device`]: device selection, queues, command pools and
//!   the swapchain lifecycle.
//! - [`sync`] and [`command`]: fences, semaphores and command recorders
//!   grouped into per-frame slots.
//! - [`buffer`], [`image`] and [`mesh`]: memory-backed resources and staged
//!   uploads.
//! - [`renderer`]: the frame loop tying it together.
//!
//! [`VkRenderer`] wires all of it to a window for
//! [`RenderBackend`](cinder_render::RenderBackend) users.

pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod image;
pub mod mesh;
pub mod physical;
pub mod registry;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

use std::sync::Arc;

use anyhow::Context;
use cinder_core::Logger;
use cinder_math::Camera;
use cinder_render::{RenderBackend, RenderSize};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub use buffer::Buffer;
pub use command::{CommandRecorder, RecorderState};
pub use config::{PresentModePreference, RendererConfig};
pub use device::{LogicalDevice, QueueRole};
pub use driver::DeviceDriver;
pub use error::{Error, Result};
pub use image::{Image, ImageLayout, ImageView};
pub use mesh::{Mesh, Vertex};
pub use renderer::{FrameOutcome, FrameStats, MeshId, Renderer, TextureId};
pub use shader::ShaderBlob;
pub use sync::{Fence, FrameSyncSet, Semaphore};

use vulkan::{VulkanDriver, VulkanInstance};

/// Everything [`VkRenderer::new`] needs besides the window.
#[derive(Debug, Clone)]
pub struct VkRendererConfig {
    pub renderer: RendererConfig,
    pub vertex_shader: ShaderBlob,
    pub fragment_shader: ShaderBlob,
    pub log: Logger,
}

/// A [`Renderer`] on a real Vulkan device presenting to a window.
pub struct VkRenderer {
    renderer: Renderer,
    log: Logger,
}

impl VkRenderer {
    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }
}

impl RenderBackend for VkRenderer {
    type Config = VkRendererConfig;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: VkRendererConfig,
    ) -> anyhow::Result<Self> {
        let VkRendererConfig {
            renderer: cfg,
            vertex_shader,
            fragment_shader,
            log,
        } = config;
        cfg.validate()?;

        let instance = VulkanInstance::new(window, display, &cfg, &log)
            .context("initializing vulkan instance")?;
        let candidates = instance.candidates()?;
        let info = physical::select(candidates, &cfg.required_extensions, &log)?;
        let driver = VulkanDriver::new(instance, &info, &cfg.required_extensions, &log)
            .context("creating logical device")?;
        let device = LogicalDevice::new(Arc::new(driver), info, cfg.device(), size, &log)?;
        let renderer = Renderer::new(device, &cfg, vertex_shader, fragment_shader, size, &log)?;
        Ok(Self { renderer, log })
    }

    fn resize(&mut self, size: RenderSize) -> anyhow::Result<()> {
        self.renderer.resize(size);
        Ok(())
    }

    fn render(&mut self, camera: &Camera) -> anyhow::Result<()> {
        match self.renderer.render(camera)? {
            FrameOutcome::SwapchainRecreated => {
                self.log.debug(format_args!("frame skipped for swapchain rebuild"));
            }
            FrameOutcome::Presented { .. } | FrameOutcome::Paused => {}
        }
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.renderer.set_clear_color(rgba);
    }
}
