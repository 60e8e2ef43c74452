// SPDX-License-Identifier: CEPL-1.0
//! Host-side binary layouts shared with shaders.

use std::mem::{offset_of, size_of};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Component type of one vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeFormat {
    Float2,
    Float3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: AttributeFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: &'static [VertexAttribute],
}

/// Interleaved mesh vertex: position, color, texture coordinate.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

const _: () = {
    assert!(size_of::<Vertex>() == 32);
    assert!(offset_of!(Vertex, position) == 0);
    assert!(offset_of!(Vertex, color) == 12);
    assert!(offset_of!(Vertex, tex_coord) == 24);
};

impl Vertex {
    pub const LAYOUT: VertexLayout = VertexLayout {
        stride: size_of::<Vertex>() as u32,
        attributes: &[
            VertexAttribute {
                location: 0,
                format: AttributeFormat::Float3,
                offset: offset_of!(Vertex, position) as u32,
            },
            VertexAttribute {
                location: 1,
                format: AttributeFormat::Float3,
                offset: offset_of!(Vertex, color) as u32,
            },
            VertexAttribute {
                location: 2,
                format: AttributeFormat::Float2,
                offset: offset_of!(Vertex, tex_coord) as u32,
            },
        ],
    };

    pub const fn new(position: [f32; 3], color: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            color,
            tex_coord,
        }
    }
}

/// Per-frame shader constants, std140 compatible.
///
/// Every `Vec3` is followed by one scalar so the next field starts on a
/// 16-byte boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformBlock {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
    pub camera_position: Vec3,
    pub _pad0: f32,
    pub light_position: Vec3,
    pub _pad1: f32,
    pub light_color: Vec3,
    pub light_radius: f32,
    pub exposure: f32,
    pub _pad2: [f32; 3],
}

const _: () = {
    assert!(size_of::<UniformBlock>() == 256);
    assert!(offset_of!(UniformBlock, model) == 0);
    assert!(offset_of!(UniformBlock, view) == 64);
    assert!(offset_of!(UniformBlock, proj) == 128);
    assert!(offset_of!(UniformBlock, camera_position) == 192);
    assert!(offset_of!(UniformBlock, light_position) == 208);
    assert!(offset_of!(UniformBlock, light_color) == 224);
    assert!(offset_of!(UniformBlock, light_radius) == 236);
    assert!(offset_of!(UniformBlock, exposure) == 240);
};

impl UniformBlock {
    pub const SIZE: u64 = size_of::<UniformBlock>() as u64;
}

impl Default for UniformBlock {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            camera_position: Vec3::ZERO,
            _pad0: 0.0,
            light_position: Vec3::ZERO,
            _pad1: 0.0,
            light_color: Vec3::ONE,
            light_radius: 0.0,
            exposure: 1.0,
            _pad2: [0.0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_struct() {
        let l = Vertex::LAYOUT;
        assert_eq!(l.stride, 32);
        let offsets: Vec<_> = l.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, [0, 12, 24]);
        let locations: Vec<_> = l.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, [0, 1, 2]);
    }

    #[test]
    fn uniform_bytes_land_at_shader_offsets() {
        let block = UniformBlock {
            light_radius: 10.0,
            exposure: 2.5,
            light_position: Vec3::new(0.0, 0.0, 2.0),
            ..Default::default()
        };
        let bytes = bytemuck::bytes_of(&block);
        assert_eq!(bytes.len(), 256);

        let f = |off: usize| f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        assert_eq!(f(208 + 8), 2.0);
        assert_eq!(f(236), 10.0);
        assert_eq!(f(240), 2.5);
        // Identity model: first column starts with 1.0.
        assert_eq!(f(0), 1.0);
    }

    #[test]
    fn vertices_cast_to_contiguous_bytes() {
        let v = [
            Vertex::new([1.0, 2.0, 3.0], [0.0; 3], [0.5, 0.25]),
            Vertex::new([4.0, 5.0, 6.0], [1.0; 3], [0.0, 1.0]),
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&v);
        assert_eq!(bytes.len(), 64);
        assert_eq!(f32::from_le_bytes(bytes[32..36].try_into().unwrap()), 4.0);
    }
}
