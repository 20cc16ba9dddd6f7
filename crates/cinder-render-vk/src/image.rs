// SPDX-License-Identifier: CEPL-1.0
//! GPU images, their layout state machine, and sampled image views.

use std::path::Path;

use ash::vk;

use crate::buffer::Buffer;
use crate::device::{LogicalDevice, QueueRole};
use crate::driver::{ImageBarrier, ImageDesc, MemoryResidency};
use crate::error::{Error, Result};
use crate::registry::{ImageEntry, ImageId, ImageViewId, ViewEntry};

/// Layouts an [`Image`] can be in between operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    ShaderReadOnly,
}

impl ImageLayout {
    pub fn raw(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// Stage and access masks for one supported layout edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// The only two edges images may take. Everything else is `None`.
pub fn transition_masks(from: ImageLayout, to: ImageLayout) -> Option<TransitionMasks> {
    match (from, to) {
        (ImageLayout::Undefined, ImageLayout::TransferDst) => Some(TransitionMasks {
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
        }),
        (ImageLayout::TransferDst, ImageLayout::ShaderReadOnly) => Some(TransitionMasks {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
        }),
        _ => None,
    }
}

/// Bytes per texel for the uncompressed color formats textures use.
pub fn format_texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

fn full_copy_region(width: u32, height: u32, aspect: vk::ImageAspectFlags) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: vk::Extent3D {
            width,
            height,
            depth: 1,
        },
    }
}

#[derive(Debug)]
pub struct Image {
    id: ImageId,
    width: u32,
    height: u32,
    format: vk::Format,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    layout: ImageLayout,
}

impl Image {
    /// A single-mip, single-layer 2D image in `Undefined` layout.
    pub fn create(
        device: &mut LogicalDevice,
        width: u32,
        height: u32,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidSize("image extent must be non-zero"));
        }
        let families = [device.queue_family(QueueRole::Graphics)];
        let raw = device
            .driver()
            .create_raw_image(&ImageDesc {
                width,
                height,
                format,
                tiling,
                usage,
                queue_families: &families,
            })
            .map_err(Error::vulkan("vkCreateImage"))?;
        let id = device.registry_mut().insert_image(ImageEntry { raw });
        Ok(Self {
            id,
            width,
            height,
            format,
            tiling,
            usage,
            layout: ImageLayout::Undefined,
        })
    }

    /// Uploads tightly packed `pixels` through a staging buffer and returns
    /// an image ready for sampling.
    pub fn from_pixels(
        device: &mut LogicalDevice,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<Self> {
        let texel = format_texel_size(format)
            .ok_or(Error::InvalidSize("pixel upload needs an uncompressed color format"))?;
        let expected = u64::from(width) * u64::from(height) * texel;
        if pixels.len() as u64 != expected {
            return Err(Error::InvalidSize("pixel data does not match image extent"));
        }

        let staging = device.create_buffer(
            expected.max(1),
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryResidency::CpuToGpu,
        )?;
        let image = Image::create(
            device,
            width,
            height,
            format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::SAMPLED,
        );
        let mut image = match image {
            Ok(i) => i,
            Err(e) => {
                staging.destroy(device);
                return Err(e);
            }
        };

        let uploaded = (|| -> Result<()> {
            staging.write(device, pixels, 0)?;
            image.transition(device, ImageLayout::TransferDst)?;
            image.copy_from(device, &staging)?;
            image.transition(device, ImageLayout::ShaderReadOnly)
        })();
        staging.destroy(device);
        match uploaded {
            Ok(()) => Ok(image),
            Err(e) => {
                image.destroy(device);
                Err(e)
            }
        }
    }

    /// Reads raw, already-decoded pixels from `path`.
    pub fn from_file(
        device: &mut LogicalDevice,
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<Self> {
        let path = path.as_ref();
        let pixels = std::fs::read(path).map_err(|source| Error::Asset {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_pixels(device, &pixels, width, height, format)
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.tiling
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Tightly packed size in bytes, if the format has a known texel size.
    pub fn byte_size(&self) -> Option<u64> {
        format_texel_size(self.format).map(|t| t * u64::from(self.width) * u64::from(self.height))
    }

    pub fn raw(&self, device: &LogicalDevice) -> Result<vk::Image> {
        Ok(device.registry().image(self.id)?.raw)
    }

    /// Moves the image to `new_layout` with a one-shot barrier on the
    /// graphics queue. The recorded layout changes only on success.
    pub fn transition(&mut self, device: &LogicalDevice, new_layout: ImageLayout) -> Result<()> {
        let masks = transition_masks(self.layout, new_layout).ok_or(
            Error::UnsupportedTransition {
                from: self.layout,
                to: new_layout,
            },
        )?;
        let barrier = ImageBarrier {
            image: self.raw(device)?,
            old_layout: self.layout.raw(),
            new_layout: new_layout.raw(),
            src_access: masks.src_access,
            dst_access: masks.dst_access,
            aspect: vk::ImageAspectFlags::COLOR,
        };
        device.submit_one_shot(QueueRole::Graphics, |rec| {
            rec.pipeline_barrier(masks.src_stage, masks.dst_stage, barrier)?;
            Ok(())
        })?;
        self.layout = new_layout;
        Ok(())
    }

    /// Copies `buffer` into the whole image. Requires `TransferDst`.
    pub fn copy_from(&self, device: &LogicalDevice, buffer: &Buffer) -> Result<()> {
        if self.layout != ImageLayout::TransferDst {
            return Err(Error::UnexpectedLayout {
                expected: ImageLayout::TransferDst,
                actual: self.layout,
            });
        }
        if let Some(needed) = self.byte_size() {
            if buffer.size() < needed {
                return Err(Error::BufferOverflow {
                    offset: 0,
                    len: needed,
                    capacity: buffer.size(),
                });
            }
        }
        let src = buffer.raw(device)?;
        let dst = self.raw(device)?;
        let region = full_copy_region(self.width, self.height, vk::ImageAspectFlags::COLOR);
        device.submit_one_shot(QueueRole::Graphics, |rec| {
            rec.copy_buffer_to_image(src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, region)?;
            Ok(())
        })
    }

    /// Copies the image contents into `buffer`. The copy is bracketed by
    /// barriers into `TRANSFER_SRC_OPTIMAL` and back, so the recorded layout
    /// is unchanged afterwards.
    pub fn read_back(&self, device: &LogicalDevice, buffer: &Buffer) -> Result<()> {
        if self.layout == ImageLayout::Undefined {
            return Err(Error::UnexpectedLayout {
                expected: ImageLayout::ShaderReadOnly,
                actual: self.layout,
            });
        }
        if let Some(needed) = self.byte_size() {
            if buffer.size() < needed {
                return Err(Error::BufferOverflow {
                    offset: 0,
                    len: needed,
                    capacity: buffer.size(),
                });
            }
        }
        let image = self.raw(device)?;
        let dst = buffer.raw(device)?;
        let current = self.layout.raw();
        let aspect = vk::ImageAspectFlags::COLOR;
        let to_src = ImageBarrier {
            image,
            old_layout: current,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::TRANSFER_READ,
            aspect,
        };
        let back = ImageBarrier {
            image,
            old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            new_layout: current,
            src_access: vk::AccessFlags::TRANSFER_READ,
            dst_access: vk::AccessFlags::SHADER_READ,
            aspect,
        };
        let region = full_copy_region(self.width, self.height, aspect);
        device.submit_one_shot(QueueRole::Graphics, |rec| {
            rec.pipeline_barrier(
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                to_src,
            )?
            .copy_image_to_buffer(image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, dst, region)?
            .pipeline_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                back,
            )?;
            Ok(())
        })
    }

    pub fn destroy(self, device: &mut LogicalDevice) {
        if let Some(entry) = device.registry_mut().remove_image(self.id) {
            device.driver().destroy_raw_image(entry.raw);
        }
    }
}

/// A 2D view over the full extent of an image it owns.
#[derive(Debug)]
pub struct ImageView {
    id: ImageViewId,
    aspect: vk::ImageAspectFlags,
    image: Image,
}

impl ImageView {
    pub fn create(
        device: &mut LogicalDevice,
        image: Image,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let raw_image = match image.raw(device) {
            Ok(r) => r,
            Err(e) => {
                image.destroy(device);
                return Err(e);
            }
        };
        let raw = match device
            .driver()
            .create_raw_image_view(raw_image, image.format, aspect)
        {
            Ok(v) => v,
            Err(e) => {
                image.destroy(device);
                return Err(Error::vulkan("vkCreateImageView")(e));
            }
        };
        let id = device.registry_mut().insert_view(ViewEntry { raw });
        Ok(Self { id, aspect, image })
    }

    pub fn id(&self) -> ImageViewId {
        self.id
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn raw(&self, device: &LogicalDevice) -> Result<vk::ImageView> {
        Ok(device.registry().view(self.id)?.raw)
    }

    /// Destroys the view, then the image it wraps.
    pub fn destroy(self, device: &mut LogicalDevice) {
        if let Some(entry) = device.registry_mut().remove_view(self.id) {
            device.driver().destroy_raw_image_view(entry.raw);
        }
        self.image.destroy(device);
    }
}

impl LogicalDevice {
    pub fn create_image(
        &mut self,
        width: u32,
        height: u32,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
    ) -> Result<Image> {
        Image::create(self, width, height, format, tiling, usage)
    }

    pub fn create_image_view(
        &mut self,
        image: Image,
        aspect: vk::ImageAspectFlags,
    ) -> Result<ImageView> {
        ImageView::create(self, image, aspect)
    }
}
