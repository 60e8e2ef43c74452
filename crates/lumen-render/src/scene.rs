// SPDX-License-Identifier: CEPL-1.0
//! Per-frame inputs: camera, light, model transform and the mesh to draw.

use glam::{Mat4, Vec3};

use crate::error::Result;
use crate::gpu::{BufferHandle, BufferUsage, Gpu};
use crate::layout::{UniformBlock, Vertex};
use crate::RenderSize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::splat(2.0),
            target: Vec3::ZERO,
            up: Vec3::Z,
            fov_y: 45f32.to_radians(),
            near: 0.1,
            far: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub radius: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 2.0),
            color: Vec3::ONE,
            radius: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameParams {
    pub model: Mat4,
    pub camera: Camera,
    pub light: PointLight,
    pub exposure: f32,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            camera: Camera::default(),
            light: PointLight::default(),
            exposure: 1.0,
        }
    }
}

impl FrameParams {
    /// Model spinning about +Z at 90 degrees per second.
    pub fn spinning(seconds: f32) -> Self {
        Self {
            model: Mat4::from_rotation_z(seconds * 90f32.to_radians()),
            ..Default::default()
        }
    }

    /// Packs the parameters for an image of `extent`.
    ///
    /// Clip space has Y pointing down and depth in `[0, 1]`.
    pub fn uniform_block(&self, extent: RenderSize) -> UniformBlock {
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(self.camera.fov_y, aspect, self.camera.near, self.camera.far);
        proj.y_axis.y *= -1.0;
        UniformBlock {
            model: self.model,
            view: Mat4::look_at_rh(self.camera.eye, self.camera.target, self.camera.up),
            proj,
            camera_position: self.camera.eye,
            light_position: self.light.position,
            light_color: self.light.color,
            light_radius: self.light.radius,
            exposure: self.exposure,
            ..Default::default()
        }
    }
}

/// Indexed triangle list in host memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Two stacked colored quads, half a unit apart along Z.
    pub fn demo() -> Self {
        let quad = |z: f32| {
            [
                Vertex::new([-0.5, -0.5, z], [1.0, 0.0, 0.0], [1.0, 0.0]),
                Vertex::new([0.5, -0.5, z], [0.0, 1.0, 0.0], [0.0, 0.0]),
                Vertex::new([0.5, 0.5, z], [0.0, 0.0, 1.0], [0.0, 1.0]),
                Vertex::new([-0.5, 0.5, z], [1.0, 1.0, 1.0], [1.0, 1.0]),
            ]
        };
        let mut vertices = Vec::with_capacity(8);
        vertices.extend(quad(0.0));
        vertices.extend(quad(-0.5));
        Self {
            vertices,
            indices: vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4],
        }
    }
}

/// A mesh resident in device-local buffers.
#[derive(Debug)]
pub struct GpuMesh {
    pub vertices: BufferHandle,
    pub indices: BufferHandle,
    pub index_count: u32,
}

impl GpuMesh {
    pub fn upload<G: Gpu>(gpu: &mut G, mesh: &Mesh) -> Result<Self> {
        let vbytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let ibytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
        // Zero-sized buffers are invalid; an empty mesh still gets one word.
        let vertices = gpu.create_buffer(vbytes.len().max(4) as u64, BufferUsage::VERTEX, false)?;
        let indices = match gpu.create_buffer(ibytes.len().max(4) as u64, BufferUsage::INDEX, false) {
            Ok(b) => b,
            Err(e) => {
                gpu.destroy_buffer(vertices);
                return Err(e);
            }
        };
        let mesh_gpu = Self {
            vertices,
            indices,
            index_count: mesh.indices.len() as u32,
        };
        if !vbytes.is_empty() {
            gpu.upload_buffer(vertices, vbytes)?;
        }
        if !ibytes.is_empty() {
            gpu.upload_buffer(indices, ibytes)?;
        }
        Ok(mesh_gpu)
    }

    pub fn destroy<G: Gpu>(&mut self, gpu: &mut G) {
        gpu.destroy_buffer(self.vertices);
        gpu.destroy_buffer(self.indices);
        self.index_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn projection_flips_y() {
        let block = FrameParams::default().uniform_block(RenderSize::new(800, 600));
        let unflipped = Mat4::perspective_rh(45f32.to_radians(), 800.0 / 600.0, 0.1, 10.0);
        assert_eq!(block.proj.y_axis.y, -unflipped.y_axis.y);
        assert_eq!(block.camera_position, Vec3::splat(2.0));
        assert_eq!(block.light_radius, 10.0);
    }

    #[test]
    fn origin_lands_in_front_of_the_camera() {
        let block = FrameParams::default().uniform_block(RenderSize::new(800, 600));
        let clip = block.proj * block.view * block.model * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn spinning_quarter_turn_after_one_second() {
        let m = FrameParams::spinning(1.0).model;
        let x = m.transform_vector3(Vec3::X);
        assert!((x - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn demo_indices_stay_in_range() {
        let mesh = Mesh::demo();
        assert!(mesh.indices.iter().all(|i| (*i as usize) < mesh.vertices.len()));
        assert_eq!(mesh.indices.len() % 3, 0);
    }
}
