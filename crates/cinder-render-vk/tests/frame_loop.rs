// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;
use cinder_core::log::{CaptureSink, Level};
use cinder_core::Logger;
use cinder_math::Camera;
use cinder_render::RenderSize;
use cinder_render_vk::config::DeviceConfig;
use cinder_render_vk::driver::headless::{Event, HeadlessDriver};
use cinder_render_vk::mesh::{QUAD_INDICES, QUAD_VERTICES};
use cinder_render_vk::{
    DeviceDriver, FrameOutcome, FrameSyncSet, LogicalDevice, Renderer, RendererConfig, ShaderBlob,
};

const SIZE: RenderSize = RenderSize::new(800, 600);

fn device(h: &Arc<HeadlessDriver>, log: &Logger) -> LogicalDevice {
    let d: Arc<dyn DeviceDriver> = h.clone();
    LogicalDevice::new(d, h.physical_device_info(), DeviceConfig::default(), SIZE, log).unwrap()
}

fn renderer(h: &Arc<HeadlessDriver>, frames: u32, log: &Logger) -> Renderer {
    let config = RendererConfig {
        frames_in_flight: frames,
        ..RendererConfig::default()
    };
    let mut r = Renderer::new(
        device(h, log),
        &config,
        ShaderBlob::placeholder(),
        ShaderBlob::placeholder(),
        SIZE,
        log,
    )
    .unwrap();
    let mesh = r.upload_mesh(&QUAD_VERTICES, &QUAD_INDICES).unwrap();
    r.add_mesh(mesh, None).unwrap();
    r
}

fn waits_on(h: &HeadlessDriver, fence: vk::Fence) -> usize {
    h.count(|e| matches!(e, Event::WaitForFences(f) if f == &[fence]))
}

fn resets_of(h: &HeadlessDriver, fence: vk::Fence) -> usize {
    h.count(|e| matches!(e, Event::ResetFences(f) if f == &[fence]))
}

#[test]
fn each_slot_fence_is_waited_and_reset_once_per_use() {
    let h = Arc::new(HeadlessDriver::new());
    let log = Logger::default();
    let mut r = renderer(&h, 2, &log);
    let fences = r.sync_set().fences();
    h.clear_events();

    for _ in 0..5 {
        let outcome = r.render(&Camera::default()).unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { .. }));
    }

    assert_eq!(waits_on(&h, fences[0]), 3);
    assert_eq!(resets_of(&h, fences[0]), 3);
    assert_eq!(waits_on(&h, fences[1]), 2);
    assert_eq!(resets_of(&h, fences[1]), 2);

    // Every reuse of slot 0 waits, then resets, then submits.
    let f0 = fences[0];
    let slot0: Vec<&str> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::WaitForFences(f) if f == [f0] => Some("wait"),
            Event::ResetFences(f) if f == [f0] => Some("reset"),
            Event::QueueSubmit { fence, .. } if fence == f0 => Some("submit"),
            _ => None,
        })
        .collect();
    assert_eq!(slot0, ["wait", "reset", "submit"].repeat(3));
    assert_eq!(r.frame_index(), 5);
    assert_eq!(r.stats().frames_presented, 5);
    assert!(h.validation_errors().is_empty());
}

#[test]
fn frames_alternate_semaphores_between_slots() {
    let h = Arc::new(HeadlessDriver::new());
    let log = Logger::default();
    let mut r = renderer(&h, 2, &log);
    let acquired = r.sync_set().image_acquired();
    let finished = r.sync_set().render_finished();
    h.clear_events();

    for _ in 0..4 {
        r.render(&Camera::default()).unwrap();
    }

    let acquire_sems: Vec<_> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::AcquireNextImage { semaphore, .. } => Some(semaphore),
            _ => None,
        })
        .collect();
    assert_eq!(
        acquire_sems,
        [acquired[0], acquired[1], acquired[0], acquired[1]]
    );

    let present_sems: Vec<_> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::QueuePresent { wait_semaphore, .. } => Some(wait_semaphore),
            _ => None,
        })
        .collect();
    assert_eq!(
        present_sems,
        [finished[0], finished[1], finished[0], finished[1]]
    );
}

#[test]
fn out_of_date_acquire_rebuilds_without_submitting() {
    let h = Arc::new(HeadlessDriver::new());
    let log = Logger::default();
    let mut r = renderer(&h, 2, &log);
    h.script_acquire(2, vk::Result::ERROR_OUT_OF_DATE_KHR);
    let old = r.device().swapchain().unwrap().raw;

    for _ in 0..2 {
        r.render(&Camera::default()).unwrap();
    }
    let slot_before = r.sync_set().current_index();
    h.clear_events();

    assert_eq!(
        r.render(&Camera::default()).unwrap(),
        FrameOutcome::SwapchainRecreated
    );
    let images = r.device().swapchain().unwrap().image_count();
    assert_eq!(
        h.count(|e| matches!(e, Event::DestroySwapchain(s) if *s == old)),
        1
    );
    assert_eq!(h.count(|e| matches!(e, Event::CreateSwapchain { .. })), 1);
    assert_eq!(
        h.count(|e| matches!(e, Event::CreateImageView { .. })),
        images
    );
    assert_eq!(h.count(|e| matches!(e, Event::QueueSubmit { .. })), 0);
    assert_eq!(h.count(|e| matches!(e, Event::QueuePresent { .. })), 0);
    assert_eq!(r.frame_index(), 2);
    assert_eq!(r.sync_set().current_index(), slot_before);
    assert_eq!(r.stats().swapchain_recreations, 1);

    let new = r.device().swapchain().unwrap().raw;
    assert_ne!(new, old);
    h.clear_events();
    assert!(matches!(
        r.render(&Camera::default()).unwrap(),
        FrameOutcome::Presented { .. }
    ));
    assert_eq!(
        h.count(|e| matches!(e, Event::QueuePresent { swapchain, result: Ok(_), .. } if *swapchain == new)),
        1
    );
    assert!(h.validation_errors().is_empty());
}

#[test]
fn suboptimal_present_recreates_after_handing_off() {
    let h = Arc::new(HeadlessDriver::new());
    let log = Logger::default();
    let mut r = renderer(&h, 2, &log);
    h.script_present(0, vk::Result::SUBOPTIMAL_KHR);

    let outcome = r.render(&Camera::default()).unwrap();
    assert!(matches!(
        outcome,
        FrameOutcome::Presented {
            recreated: true,
            ..
        }
    ));
    assert_eq!(r.frame_index(), 1);
    assert_eq!(r.stats().swapchain_recreations, 1);
}

#[test]
fn minimized_window_resumes_after_resize() {
    let h = Arc::new(HeadlessDriver::new());
    let log = Logger::default();
    let mut r = renderer(&h, 2, &log);

    r.resize(RenderSize::new(0, 0));
    assert_eq!(r.render(&Camera::default()).unwrap(), FrameOutcome::Paused);

    h.set_surface_extent(1024, 768);
    r.resize(RenderSize::new(1024, 768));
    assert!(matches!(
        r.render(&Camera::default()).unwrap(),
        FrameOutcome::Presented { .. }
    ));
    let extent = r.device().swapchain().unwrap().extent;
    assert_eq!((extent.width, extent.height), (1024, 768));
    assert!(h.count(|e| matches!(
        e,
        Event::CreatePipeline { extent, .. } if extent.width == 1024
    )) >= 1);
}

#[test]
fn sync_set_has_one_slot_per_frame_in_flight() {
    let h = Arc::new(HeadlessDriver::new());
    let log = Logger::default();
    let dev = device(&h, &log);
    for n in 1..=3 {
        let mut set = FrameSyncSet::new(&dev, n, &log).unwrap();
        assert_eq!(set.len(), n);
        assert_eq!(set.fences().len(), n);
        assert_eq!(set.image_acquired().len(), n);
        assert_eq!(set.render_finished().len(), n);

        let unique: HashSet<vk::Fence> = set.fences().into_iter().collect();
        assert_eq!(unique.len(), n);

        for expected in (0..n).chain(0..n) {
            assert_eq!(set.current_index(), expected);
            set.advance();
        }
    }
}

#[test]
fn zero_frames_in_flight_is_a_config_error() {
    let h = Arc::new(HeadlessDriver::new());
    let log = Logger::default();
    let dev = device(&h, &log);
    assert!(matches!(
        FrameSyncSet::new(&dev, 0, &log),
        Err(cinder_render_vk::Error::Config(_))
    ));
}

#[test]
fn teardown_leaves_nothing_alive_and_logs_no_leaks() {
    let h = Arc::new(HeadlessDriver::new());
    let sink = CaptureSink::new();
    let log = Logger::new(sink.clone());
    {
        let mut r = renderer(&h, 3, &log);
        for _ in 0..4 {
            r.render(&Camera::default()).unwrap();
        }
    }
    assert_eq!(h.live_objects(), 0);
    assert_eq!(sink.count(Level::Error), 0);
    assert!(h.validation_errors().is_empty());
}
