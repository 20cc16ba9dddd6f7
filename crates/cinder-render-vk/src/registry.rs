// SPDX-License-Identifier: CEPL-1.0
//! Arena of live GPU resources owned by the logical device.
//!
//! Resource handles ([`Buffer`](crate::buffer::Buffer),
//! [`Image`](crate::image::Image), [`ImageView`](crate::image::ImageView))
//! carry only a typed key into this arena. Looking up a key that has been
//! removed yields [`Error::StaleHandle`].

use ash::vk;
use cinder_core::Logger;
use slotmap::{new_key_type, SlotMap};

use crate::driver::{DeviceDriver, MemoryResidency};
use crate::error::{Error, Result};

new_key_type! {
    pub struct BufferId;
    pub struct ImageId;
    pub struct ImageViewId;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferEntry {
    pub raw: vk::Buffer,
    pub size: vk::DeviceSize,
    pub residency: MemoryResidency,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageEntry {
    pub raw: vk::Image,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ViewEntry {
    pub raw: vk::ImageView,
}

#[derive(Default)]
pub struct Registry {
    buffers: SlotMap<BufferId, BufferEntry>,
    images: SlotMap<ImageId, ImageEntry>,
    views: SlotMap<ImageViewId, ViewEntry>,
}

impl Registry {
    pub(crate) fn insert_buffer(&mut self, entry: BufferEntry) -> BufferId {
        self.buffers.insert(entry)
    }

    pub(crate) fn buffer(&self, id: BufferId) -> Result<BufferEntry> {
        self.buffers.get(id).copied().ok_or(Error::StaleHandle)
    }

    pub(crate) fn remove_buffer(&mut self, id: BufferId) -> Option<BufferEntry> {
        self.buffers.remove(id)
    }

    pub(crate) fn insert_image(&mut self, entry: ImageEntry) -> ImageId {
        self.images.insert(entry)
    }

    pub(crate) fn image(&self, id: ImageId) -> Result<ImageEntry> {
        self.images.get(id).copied().ok_or(Error::StaleHandle)
    }

    pub(crate) fn remove_image(&mut self, id: ImageId) -> Option<ImageEntry> {
        self.images.remove(id)
    }

    pub(crate) fn insert_view(&mut self, entry: ViewEntry) -> ImageViewId {
        self.views.insert(entry)
    }

    pub(crate) fn view(&self, id: ImageViewId) -> Result<ViewEntry> {
        self.views.get(id).copied().ok_or(Error::StaleHandle)
    }

    pub(crate) fn remove_view(&mut self, id: ImageViewId) -> Option<ViewEntry> {
        self.views.remove(id)
    }

    /// Number of live entries across all kinds.
    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len() + self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys everything still registered. Views go first so no view
    /// outlives its image. Returns the number of leaked entries.
    pub(crate) fn sweep(&mut self, driver: &dyn DeviceDriver, log: &Logger) -> usize {
        let leaked = self.len();
        if leaked > 0 {
            log.warn(format_args!(
                "{leaked} GPU resource(s) still alive at device teardown \
                 ({} buffer(s), {} image(s), {} view(s))",
                self.buffers.len(),
                self.images.len(),
                self.views.len()
            ));
        }
        for (_, v) in self.views.drain() {
            driver.destroy_raw_image_view(v.raw);
        }
        for (_, i) in self.images.drain() {
            driver.destroy_raw_image(i.raw);
        }
        for (_, b) in self.buffers.drain() {
            driver.destroy_raw_buffer(b.raw);
        }
        leaked
    }
}
