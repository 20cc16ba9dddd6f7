// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use cinder_core::{config, init_tracing, Logger};
use cinder_math::{Camera, Vec3};
use cinder_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};
use cinder_platform::{create_window, framebuffer_size};
use cinder_render::{RenderBackend, RenderSize};
use cinder_render_vk::driver::headless::HeadlessDriver;
use cinder_render_vk::mesh::{QUAD_INDICES, QUAD_VERTICES};
use cinder_render_vk::{
    FrameOutcome, LogicalDevice, Renderer, RendererConfig, ShaderBlob, VkRenderer,
    VkRendererConfig,
};

const DEFAULT_VERTEX_SHADER: &str = "shaders/textured.vert.spv";
const DEFAULT_FRAGMENT_SHADER: &str = "shaders/textured.frag.spv";
const FOV_Y: f32 = std::f32::consts::FRAC_PI_3;

/// 2x2 RGBA checkerboard.
const CHECKER: [u8; 16] = [
    0xff, 0x80, 0x20, 0xff, 0x20, 0x20, 0x28, 0xff, //
    0x20, 0x20, 0x28, 0xff, 0xff, 0x80, 0x20, 0xff,
];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file. Missing means defaults.
    #[arg(long, default_value = "cinder.toml")]
    config: PathBuf,
    /// SPIR-V vertex shader
    #[arg(long)]
    vertex_shader: Option<PathBuf>,
    /// SPIR-V fragment shader
    #[arg(long)]
    fragment_shader: Option<PathBuf>,
    /// Overrides render.frames_in_flight (1..=3)
    #[arg(long)]
    frames_in_flight: Option<u32>,
    /// Render this many frames on the software driver, without a window, and exit
    #[arg(long)]
    headless_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct AppConfig {
    window: WindowConfig,
    render: RendererConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WindowConfig {
    title: String,
    width: u32,
    height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "cinder".to_owned(),
            width: 1280,
            height: 720,
        }
    }
}

fn load_shaders(args: &Args) -> Result<(ShaderBlob, ShaderBlob)> {
    let headless = args.headless_frames.is_some();
    let load = |given: &Option<PathBuf>, fallback: &str| -> Result<ShaderBlob> {
        match given {
            Some(path) => Ok(ShaderBlob::from_file(path)?),
            // The software driver never compiles shaders.
            None if headless => Ok(ShaderBlob::placeholder()),
            None => ShaderBlob::from_file(fallback).with_context(|| {
                format!("{fallback} not found; build shaders/ with glslc or pass --vertex-shader")
            }),
        }
    };
    Ok((
        load(&args.vertex_shader, DEFAULT_VERTEX_SHADER)?,
        load(&args.fragment_shader, DEFAULT_FRAGMENT_SHADER)?,
    ))
}

/// One textured quad.
fn populate(renderer: &mut Renderer) -> cinder_render_vk::Result<()> {
    let texture = renderer.create_texture(&CHECKER, 2, 2)?;
    let quad = renderer.upload_mesh(&QUAD_VERTICES, &QUAD_INDICES)?;
    renderer.add_mesh(quad, Some(texture))?;
    Ok(())
}

fn orbit_camera(seconds: f32, aspect: f32) -> Camera {
    let eye = Vec3::new(seconds.sin() * 2.0, 0.5, seconds.cos() * 2.0);
    Camera::perspective(FOV_Y, aspect, 0.1, 100.0).look_at(eye, Vec3::ZERO, Vec3::Y)
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<cinder_render_vk::Error>()
        .map_or(true, |e| e.is_fatal())
}

fn run_headless(
    frames: u64,
    cfg: &AppConfig,
    (vertex_shader, fragment_shader): (ShaderBlob, ShaderBlob),
    log: &Logger,
) -> Result<()> {
    let size = RenderSize::new(cfg.window.width, cfg.window.height);
    let driver = Arc::new(HeadlessDriver::new());
    let device = LogicalDevice::new(
        driver.clone(),
        driver.physical_device_info(),
        cfg.render.device(),
        size,
        log,
    )?;
    let mut renderer = Renderer::new(
        device,
        &cfg.render,
        vertex_shader,
        fragment_shader,
        size,
        log,
    )?;
    populate(&mut renderer)?;

    for i in 0..frames {
        let camera = orbit_camera(i as f32 / 60.0, size.aspect());
        match renderer.render(&camera)? {
            FrameOutcome::Presented { image_index, .. } => {
                log.trace(format_args!("frame {i} presented image {image_index}"));
            }
            other => log.debug(format_args!("frame {i}: {other:?}")),
        }
    }
    let stats = renderer.stats();
    drop(renderer);

    let errors = driver.validation_errors();
    for e in &errors {
        log.error(format_args!("{e}"));
    }
    anyhow::ensure!(errors.is_empty(), "{} validation error(s)", errors.len());
    log.info(format_args!(
        "headless run done: {} presented, {} recreation(s), {} object(s) leaked",
        stats.frames_presented,
        stats.swapchain_recreations,
        driver.live_objects()
    ));
    Ok(())
}

struct App {
    cfg: AppConfig,
    shaders: Option<(ShaderBlob, ShaderBlob)>,
    log: Logger,
    // Declared before `window` so it is dropped first.
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    render_size: RenderSize,
    paused: bool,
    started: Instant,
    frames: u32,
    last_fps_instant: Instant,
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppConfig, shaders: (ShaderBlob, ShaderBlob), log: Logger) -> Self {
        Self {
            cfg,
            shaders: Some(shaders),
            log,
            renderer: None,
            window: None,
            render_size: RenderSize::new(1, 1),
            paused: false,
            started: Instant::now(),
            frames: 0,
            last_fps_instant: Instant::now(),
            failure: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let requested = RenderSize::new(self.cfg.window.width, self.cfg.window.height);
        let window = create_window(event_loop, &self.cfg.window.title, requested)?;
        self.render_size = framebuffer_size(&window);

        let (vertex_shader, fragment_shader) = self
            .shaders
            .take()
            .context("renderer was already initialized")?;
        let config = VkRendererConfig {
            renderer: self.cfg.render.clone(),
            vertex_shader,
            fragment_shader,
            log: self.log.clone(),
        };
        let mut renderer = VkRenderer::new(&window, &window, self.render_size, config)?;
        populate(renderer.renderer_mut()).context("uploading demo scene")?;

        self.paused = self.render_size.is_zero();
        self.log.info(format_args!(
            "window {}x{} (paused={})",
            self.render_size.width, self.render_size.height, self.paused
        ));
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        self.failure = Some(err);
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match self.init(event_loop) {
            Ok(()) => {
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }
            Err(e) => self.fail(event_loop, e.context("renderer initialization")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        match &self.window {
            Some(window) if window.id() == window_id => {}
            _ => return,
        }

        match event {
            WindowEvent::CloseRequested => {
                self.log.info(format_args!("close requested"));
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize::new(new_size.width, new_size.height);
                let now_paused = self.render_size.is_zero();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    self.log.info(format_args!(
                        "resized to {}x{} (paused={})",
                        self.render_size.width, self.render_size.height, self.paused
                    ));
                }
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.resize(self.render_size) {
                        self.log.error(format_args!("resize: {e:#}"));
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.paused {
                    return;
                }
                let camera = orbit_camera(
                    self.started.elapsed().as_secs_f32(),
                    self.render_size.aspect(),
                );
                let Some(renderer) = &mut self.renderer else {
                    return;
                };
                match renderer.render(&camera) {
                    Ok(()) => self.frames = self.frames.saturating_add(1),
                    Err(e) if is_fatal(&e) => self.fail(event_loop, e.context("rendering frame")),
                    Err(e) => self.log.error(format_args!("render: {e:#}")),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);
        if self.paused {
            self.frames = 0;
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            self.log.info(format_args!("fps ~ {}", self.frames));
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn run(log: &Logger) -> Result<()> {
    let args = Args::parse();
    let mut cfg: AppConfig = config::load_or_default(&args.config, log);
    if let Some(n) = args.frames_in_flight {
        cfg.render.frames_in_flight = n;
    }
    cfg.render.validate()?;
    let shaders = load_shaders(&args)?;

    if let Some(frames) = args.headless_frames {
        return run_headless(frames, &cfg, shaders, log);
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, shaders, log.clone());
    event_loop.run_app(&mut app)?;
    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() {
    init_tracing();
    let log = Logger::default().scoped("app");
    if let Err(e) = run(&log) {
        log.fatal(format_args!("{e:#}"));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: AppConfig = config::parse(
            Path::new("cinder.toml"),
            "[window]\ntitle = \"demo\"\n[render]\nframes_in_flight = 3\n",
        )
        .unwrap();
        assert_eq!(cfg.window.title, "demo");
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.render.frames_in_flight, 3);
        assert!(cfg.render.validate().is_ok());
    }

    #[test]
    fn headless_defaults_to_placeholder_shaders() {
        let args = Args::parse_from(["cinder-app", "--headless-frames", "3"]);
        let (vs, fs) = load_shaders(&args).unwrap();
        assert_eq!(vs, ShaderBlob::placeholder());
        assert_eq!(fs, ShaderBlob::placeholder());
    }

    #[test]
    fn headless_run_renders_every_frame() {
        let cfg = AppConfig::default();
        let log = Logger::default();
        let shaders = (ShaderBlob::placeholder(), ShaderBlob::placeholder());
        run_headless(5, &cfg, shaders, &log).unwrap();
    }

    #[test]
    fn orbit_camera_is_finite() {
        let cam = orbit_camera(1.5, 16.0 / 9.0);
        assert!(cam.to_push_constant().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn library_contract_errors_are_recoverable() {
        let err = anyhow::Error::new(cinder_render_vk::Error::InvalidSize("x"));
        assert!(!is_fatal(&err));
        assert!(is_fatal(&anyhow::anyhow!("window lost")));
    }
}
