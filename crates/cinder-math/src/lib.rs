// SPDX-License-Identifier: CEPL-1.0
pub use glam::{Mat4, Vec3};

/// View and projection pair handed to the renderer each frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

impl Camera {
    /// Right-handed perspective camera with a [0, 1] depth range and the
    /// Y axis flipped for Vulkan clip space.
    pub fn perspective(fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        let mut projection = Mat4::perspective_rh(fov_y_radians, aspect.max(1e-4), near, far);
        projection.y_axis.y *= -1.0;
        Self {
            view: Mat4::IDENTITY,
            projection,
        }
    }

    pub fn look_at(mut self, eye: Vec3, target: Vec3, up: Vec3) -> Self {
        self.view = Mat4::look_at_rh(eye, target, up);
        self
    }

    pub fn set_aspect(&mut self, fov_y_radians: f32, aspect: f32, near: f32, far: f32) {
        self.projection = Self::perspective(fov_y_radians, aspect, near, far).projection;
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    /// Column-major matrix, ready to be pushed as 64 bytes.
    pub fn to_push_constant(&self) -> [f32; 16] {
        self.view_projection().to_cols_array()
    }
}
