// SPDX-License-Identifier: CEPL-1.0
//! GPU buffers.
//!
//! A [`Buffer`] is a typed key into the device registry plus the metadata
//! fixed at creation. It is not `Clone`; [`Buffer::destroy`] consumes it.

use ash::vk;
use bytemuck::Pod;

use crate::device::{LogicalDevice, QueueRole};
use crate::driver::{BufferDesc, MemoryResidency};
use crate::error::{Error, Result};
use crate::registry::{BufferEntry, BufferId};

#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    residency: MemoryResidency,
}

impl Buffer {
    pub fn create(
        device: &mut LogicalDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: MemoryResidency,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSize("buffer size must be non-zero"));
        }
        let families = device.buffer_families();
        let raw = device
            .driver()
            .create_raw_buffer(&BufferDesc {
                size,
                usage,
                residency,
                queue_families: &families,
            })
            .map_err(Error::vulkan("vkCreateBuffer"))?;
        let id = device.registry_mut().insert_buffer(BufferEntry {
            raw,
            size,
            residency,
        });
        Ok(Self {
            id,
            size,
            usage,
            residency,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn residency(&self) -> MemoryResidency {
        self.residency
    }

    pub fn raw(&self, device: &LogicalDevice) -> Result<vk::Buffer> {
        Ok(device.registry().buffer(self.id)?.raw)
    }

    /// Copies `data` into the buffer at `offset` through its host mapping.
    pub fn write(&self, device: &LogicalDevice, data: &[u8], offset: vk::DeviceSize) -> Result<()> {
        let entry = device.registry().buffer(self.id)?;
        check_range(offset, data.len() as vk::DeviceSize, entry.size)?;
        if !entry.residency.is_host_visible() {
            return Err(Error::NotHostVisible);
        }
        device
            .driver()
            .write_raw_buffer(entry.raw, offset, data)
            .map_err(Error::vulkan("write mapped buffer"))
    }

    pub fn write_pod<T: Pod>(
        &self,
        device: &LogicalDevice,
        data: &[T],
        offset: vk::DeviceSize,
    ) -> Result<()> {
        self.write(device, bytemuck::cast_slice(data), offset)
    }

    pub fn read(
        &self,
        device: &LogicalDevice,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> Result<Vec<u8>> {
        let entry = device.registry().buffer(self.id)?;
        check_range(offset, len, entry.size)?;
        if !entry.residency.is_host_visible() {
            return Err(Error::NotHostVisible);
        }
        device
            .driver()
            .read_raw_buffer(entry.raw, offset, len)
            .map_err(Error::vulkan("read mapped buffer"))
    }

    /// Copies all of `src` into the start of this buffer on the transfer
    /// queue and waits for completion.
    pub fn copy_from(&self, device: &LogicalDevice, src: &Buffer) -> Result<()> {
        check_range(0, src.size, self.size)?;
        let dst = self.raw(device)?;
        let from = src.raw(device)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size,
        };
        device.submit_one_shot(QueueRole::Transfer, |rec| {
            rec.copy_buffer(from, dst, region)?;
            Ok(())
        })
    }

    pub fn destroy(self, device: &mut LogicalDevice) {
        if let Some(entry) = device.registry_mut().remove_buffer(self.id) {
            device.driver().destroy_raw_buffer(entry.raw);
        }
    }
}

/// `offset + len` must fit in `capacity`.
pub(crate) fn check_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    capacity: vk::DeviceSize,
) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::BufferOverflow {
            offset,
            len,
            capacity,
        }),
    }
}

impl LogicalDevice {
    pub fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: MemoryResidency,
    ) -> Result<Buffer> {
        Buffer::create(self, size, usage, residency)
    }
}
