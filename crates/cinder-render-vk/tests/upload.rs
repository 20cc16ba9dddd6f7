// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk::{self, Handle};
use cinder_core::Logger;
use cinder_render::RenderSize;
use cinder_render_vk::config::DeviceConfig;
use cinder_render_vk::driver::headless::{Event, HeadlessDriver};
use cinder_render_vk::driver::MemoryResidency;
use cinder_render_vk::mesh::{Mesh, QUAD_INDICES, QUAD_VERTICES};
use cinder_render_vk::physical::{self, DeviceCandidate, QueueFamilyCaps};
use cinder_render_vk::{
    DeviceDriver, Error, Image, ImageLayout, ImageView, LogicalDevice, QueueRole, RecorderState,
};

fn device(h: &Arc<HeadlessDriver>) -> LogicalDevice {
    let d: Arc<dyn DeviceDriver> = h.clone();
    LogicalDevice::new(
        d,
        h.physical_device_info(),
        DeviceConfig::default(),
        RenderSize::new(640, 480),
        &Logger::default(),
    )
    .unwrap()
}

fn gradient(width: u32, height: u32) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| [(i * 16) as u8, (255 - i * 16) as u8, 0x40, 0xff])
        .collect()
}

#[test]
fn texture_upload_is_sampleable_and_reads_back_intact() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let pixels = gradient(4, 4);
    assert_eq!(pixels.len(), 64);

    let image = Image::from_pixels(&mut dev, &pixels, 4, 4, vk::Format::R8G8B8A8_SRGB).unwrap();
    assert_eq!(image.layout(), ImageLayout::ShaderReadOnly);
    let raw = image.raw(&dev).unwrap();
    assert_eq!(
        h.image_layout(raw),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );

    let readback = dev
        .create_buffer(
            64,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryResidency::GpuToCpu,
        )
        .unwrap();
    image.read_back(&dev, &readback).unwrap();
    assert_eq!(readback.read(&dev, 0, 64).unwrap(), pixels);
    assert_eq!(image.layout(), ImageLayout::ShaderReadOnly);
    assert_eq!(
        h.image_layout(raw),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
    assert!(h.validation_errors().is_empty(), "{:?}", h.validation_errors());

    readback.destroy(&mut dev);
    image.destroy(&mut dev);
    assert_eq!(dev.live_resources(), 0);
}

#[test]
fn pixel_length_must_match_extent() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let err = Image::from_pixels(&mut dev, &[0; 60], 4, 4, vk::Format::R8G8B8A8_SRGB)
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidSize(_)));
    assert_eq!(dev.live_resources(), 0);
}

#[test]
fn unsupported_transition_leaves_layout_untouched() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let mut image = Image::create(
        &mut dev,
        8,
        8,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageTiling::OPTIMAL,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
    )
    .unwrap();
    let raw = image.raw(&dev).unwrap();
    h.clear_events();

    let err = image
        .transition(&dev, ImageLayout::ShaderReadOnly)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::UnsupportedTransition {
            from: ImageLayout::Undefined,
            to: ImageLayout::ShaderReadOnly
        }
    ));
    assert_eq!(image.layout(), ImageLayout::Undefined);
    assert_eq!(h.image_layout(raw), Some(vk::ImageLayout::UNDEFINED));
    assert_eq!(h.count(|e| matches!(e, Event::QueueSubmit { .. })), 0);

    image.transition(&dev, ImageLayout::TransferDst).unwrap();
    let again = image.transition(&dev, ImageLayout::TransferDst);
    assert!(matches!(again, Err(Error::UnsupportedTransition { .. })));
    assert_eq!(image.layout(), ImageLayout::TransferDst);
    image.destroy(&mut dev);
}

#[test]
fn copy_into_image_requires_transfer_layout() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let image = Image::create(
        &mut dev,
        2,
        2,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageTiling::OPTIMAL,
        vk::ImageUsageFlags::TRANSFER_DST,
    )
    .unwrap();
    let staging = dev
        .create_buffer(
            16,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryResidency::CpuToGpu,
        )
        .unwrap();
    assert!(matches!(
        image.copy_from(&dev, &staging),
        Err(Error::UnexpectedLayout {
            expected: ImageLayout::TransferDst,
            actual: ImageLayout::Undefined
        })
    ));
    staging.destroy(&mut dev);
    image.destroy(&mut dev);
}

#[test]
fn destroying_a_view_releases_its_image() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let image = Image::from_pixels(&mut dev, &[0xff; 4], 1, 1, vk::Format::R8G8B8A8_SRGB).unwrap();
    let view = ImageView::create(&mut dev, image, vk::ImageAspectFlags::COLOR).unwrap();
    assert_eq!(view.image().width(), 1);
    assert!(view.raw(&dev).is_ok());
    let before = h.live_objects();
    view.destroy(&mut dev);
    assert_eq!(h.live_objects(), before - 2);
    assert_eq!(dev.live_resources(), 0);
}

#[test]
fn host_writes_are_bounds_checked() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let buf = dev
        .create_buffer(
            64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryResidency::CpuToGpu,
        )
        .unwrap();

    let err = buf.write(&dev, &[1; 8], 60).err().unwrap();
    assert!(matches!(
        err,
        Error::BufferOverflow {
            offset: 60,
            len: 8,
            capacity: 64
        }
    ));
    buf.write(&dev, &[7; 8], 56).unwrap();
    assert_eq!(buf.read(&dev, 56, 8).unwrap(), vec![7; 8]);
    assert_eq!(buf.read(&dev, 0, 4).unwrap(), vec![0; 4]);
    buf.destroy(&mut dev);
}

#[test]
fn device_local_buffers_are_not_mappable() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let buf = dev
        .create_buffer(
            16,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryResidency::GpuOnly,
        )
        .unwrap();
    assert!(matches!(
        buf.write(&dev, &[0; 4], 0),
        Err(Error::NotHostVisible)
    ));
    assert!(matches!(buf.read(&dev, 0, 4), Err(Error::NotHostVisible)));
    assert!(matches!(
        dev.create_buffer(0, vk::BufferUsageFlags::VERTEX_BUFFER, MemoryResidency::GpuOnly),
        Err(Error::InvalidSize(_))
    ));
    buf.destroy(&mut dev);
}

#[test]
fn buffer_copies_run_on_the_transfer_queue() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let src = dev
        .create_buffer(
            32,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryResidency::CpuToGpu,
        )
        .unwrap();
    let dst = dev
        .create_buffer(
            32,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryResidency::GpuToCpu,
        )
        .unwrap();
    let data: Vec<u8> = (0..32).collect();
    src.write(&dev, &data, 0).unwrap();
    h.clear_events();

    dst.copy_from(&dev, &src).unwrap();
    let transfer = dev.queue(QueueRole::Transfer);
    assert_ne!(transfer, dev.queue(QueueRole::Graphics));
    assert_eq!(
        h.count(|e| matches!(e, Event::QueueSubmit { queue, .. } if *queue == transfer)),
        1
    );
    assert_eq!(dst.read(&dev, 0, 32).unwrap(), data);

    let small = dev
        .create_buffer(
            16,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryResidency::GpuOnly,
        )
        .unwrap();
    assert!(matches!(
        small.copy_from(&dev, &src),
        Err(Error::BufferOverflow { .. })
    ));

    for b in [src, dst, small] {
        b.destroy(&mut dev);
    }
}

#[test]
fn buffers_share_across_graphics_and_transfer_families() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    h.clear_events();
    let buf = dev
        .create_buffer(
            8,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryResidency::GpuOnly,
        )
        .unwrap();
    assert_eq!(
        h.count(|e| matches!(e, Event::CreateBuffer { concurrent: true, .. })),
        1
    );
    buf.destroy(&mut dev);
}

#[test]
fn mesh_upload_lands_in_device_local_buffers() {
    let h = Arc::new(HeadlessDriver::new());
    let mut dev = device(&h);
    let mesh = Mesh::upload(&mut dev, &QUAD_VERTICES, &QUAD_INDICES).unwrap();
    assert_eq!(mesh.index_count(), 6);
    assert_eq!(mesh.vertex_buffer().size(), 4 * 32);
    assert_eq!(mesh.index_buffer().residency(), MemoryResidency::GpuOnly);
    // Staging buffers are gone.
    assert_eq!(dev.live_resources(), 2);
    assert!(matches!(
        Mesh::upload(&mut dev, &[], &QUAD_INDICES),
        Err(Error::InvalidSize(_))
    ));
    mesh.destroy(&mut dev);
    assert_eq!(dev.live_resources(), 0);
}

#[test]
fn failing_one_shot_work_is_reported_as_transfer_error() {
    let h = Arc::new(HeadlessDriver::new());
    let dev = device(&h);
    h.clear_events();
    let err = dev
        .submit_one_shot(QueueRole::Graphics, |rec| {
            rec.stop()?;
            rec.stop()
        })
        .err()
        .unwrap();
    match err {
        Error::Transfer(inner) => assert!(matches!(
            *inner,
            Error::RecordingState {
                operation: "stop recording",
                actual: RecorderState::Idle
            }
        )),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(h.count(|e| matches!(e, Event::QueueSubmit { .. })), 0);
}

#[test]
fn selection_prefers_discrete_and_resolves_dedicated_transfer() {
    let h = HeadlessDriver::new();
    let cpu = h.candidate();
    let mut discrete = h.candidate();
    discrete.handle = vk::PhysicalDevice::from_raw(2);
    discrete.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;
    let compute_only = DeviceCandidate {
        handle: vk::PhysicalDevice::from_raw(3),
        device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
        max_image_dimension_2d: 16384,
        queue_families: vec![QueueFamilyCaps {
            flags: vk::QueueFlags::COMPUTE,
            present: true,
        }],
        ..h.candidate()
    };
    let required = vec!["VK_KHR_swapchain".to_owned()];
    let info = physical::select(
        vec![compute_only, cpu, discrete],
        &required,
        &Logger::default(),
    )
    .unwrap();
    assert_eq!(info.handle, vk::PhysicalDevice::from_raw(2));
    assert_eq!(info.queues.graphics, 0);
    assert_eq!(info.queues.present, 0);
    assert_eq!(info.queues.transfer, 1);
}
