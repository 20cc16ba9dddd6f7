// SPDX-License-Identifier: CEPL-1.0
//! Indexed triangle meshes in device-local memory.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::buffer::Buffer;
use crate::device::LogicalDevice;
use crate::driver::MemoryResidency;
use crate::error::{Error, Result};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 3], uv: [f32; 2], color: [f32; 3]) -> Self {
        Self {
            position,
            uv,
            color,
        }
    }

    pub fn binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// position @0, uv @1, color @2.
    pub fn attributes() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, uv) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
        ]
    }
}

/// Unit quad in the XY plane, counter-clockwise, white.
pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5, 0.0], [0.0, 1.0], [1.0, 1.0, 1.0]),
    Vertex::new([0.5, -0.5, 0.0], [1.0, 1.0], [1.0, 1.0, 1.0]),
    Vertex::new([0.5, 0.5, 0.0], [1.0, 0.0], [1.0, 1.0, 1.0]),
    Vertex::new([-0.5, 0.5, 0.0], [0.0, 0.0], [1.0, 1.0, 1.0]),
];
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

#[derive(Debug)]
pub struct Mesh {
    vertices: Buffer,
    indices: Buffer,
    index_count: u32,
}

impl Mesh {
    /// Stages both arrays through host-visible buffers and copies them to
    /// device-local vertex and index buffers on the transfer queue.
    pub fn upload(device: &mut LogicalDevice, vertices: &[Vertex], indices: &[u32]) -> Result<Self> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(Error::InvalidSize("mesh needs vertices and indices"));
        }
        let vertices = upload_pod(device, vertices, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index_buffer = match upload_pod(device, indices, vk::BufferUsageFlags::INDEX_BUFFER) {
            Ok(b) => b,
            Err(e) => {
                vertices.destroy(device);
                return Err(e);
            }
        };
        Ok(Self {
            vertices,
            indices: index_buffer,
            index_count: indices.len() as u32,
        })
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertices
    }

    pub fn index_buffer(&self) -> &Buffer {
        &self.indices
    }

    pub fn destroy(self, device: &mut LogicalDevice) {
        self.vertices.destroy(device);
        self.indices.destroy(device);
    }
}

fn upload_pod<T: Pod>(
    device: &mut LogicalDevice,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;
    let staging = device.create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryResidency::CpuToGpu,
    )?;
    let gpu = match device.create_buffer(
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryResidency::GpuOnly,
    ) {
        Ok(b) => b,
        Err(e) => {
            staging.destroy(device);
            return Err(e);
        }
    };
    let copied = staging
        .write_pod(device, data, 0)
        .and_then(|()| gpu.copy_from(device, &staging));
    staging.destroy(device);
    match copied {
        Ok(()) => Ok(gpu),
        Err(e) => {
            gpu.destroy(device);
            Err(e)
        }
    }
}
