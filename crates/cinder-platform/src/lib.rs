// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use anyhow::{Context, Result};
use cinder_render::RenderSize;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

pub fn create_window(event_loop: &ActiveEventLoop, title: &str, size: RenderSize) -> Result<Window> {
    let attrs = Window::default_attributes()
        .with_title(title)
        .with_inner_size(PhysicalSize::new(size.width.max(1), size.height.max(1)));
    event_loop.create_window(attrs).context("create_window")
}

/// Live framebuffer size in physical pixels.
pub fn framebuffer_size(window: &Window) -> RenderSize {
    let size = window.inner_size();
    RenderSize::new(size.width, size.height)
}
