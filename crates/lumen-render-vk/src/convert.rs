// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic enums to their `vk` counterparts.

use ash::vk;
use lumen_render::gpu::{
    Aspect, BindingKind, BufferUsage, ClearValue, Format, ImageUsage, LoadOp, ShaderVisibility,
};
use lumen_render::layout::AttributeFormat;
use lumen_render::transition::{Access, ImageState, Stages};
use lumen_render::RenderSize;

pub fn format(f: Format) -> vk::Format {
    match f {
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
    }
}

/// Only the presentable formats the lighting pass can target.
pub fn surface_format(f: vk::Format) -> Option<Format> {
    match f {
        vk::Format::B8G8R8A8_SRGB => Some(Format::Bgra8Srgb),
        vk::Format::R8G8B8A8_SRGB => Some(Format::Rgba8Srgb),
        vk::Format::B8G8R8A8_UNORM => Some(Format::Bgra8Unorm),
        _ => None,
    }
}

pub fn aspect(a: Aspect) -> vk::ImageAspectFlags {
    match a {
        Aspect::Color => vk::ImageAspectFlags::COLOR,
        Aspect::Depth => vk::ImageAspectFlags::DEPTH,
    }
}

pub fn layout(state: ImageState) -> vk::ImageLayout {
    match state {
        ImageState::Undefined => vk::ImageLayout::UNDEFINED,
        ImageState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageState::DepthAttachment => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ImageState::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

const STAGES: [(Stages, vk::PipelineStageFlags2); 7] = [
    (Stages::TOP_OF_PIPE, vk::PipelineStageFlags2::TOP_OF_PIPE),
    (Stages::VERTEX_SHADER, vk::PipelineStageFlags2::VERTEX_SHADER),
    (
        Stages::EARLY_FRAGMENT_TESTS,
        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
    ),
    (
        Stages::LATE_FRAGMENT_TESTS,
        vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
    ),
    (Stages::FRAGMENT_SHADER, vk::PipelineStageFlags2::FRAGMENT_SHADER),
    (
        Stages::COLOR_ATTACHMENT_OUTPUT,
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    ),
    (Stages::BOTTOM_OF_PIPE, vk::PipelineStageFlags2::BOTTOM_OF_PIPE),
];

pub fn stages2(s: Stages) -> vk::PipelineStageFlags2 {
    STAGES
        .iter()
        .filter(|(ours, _)| s.contains(*ours))
        .fold(vk::PipelineStageFlags2::NONE, |acc, (_, theirs)| acc | *theirs)
}

/// Stage mask for `vkQueueSubmit`. The legacy bits share values with the
/// low half of the 64-bit mask for every stage listed above.
pub fn stages(s: Stages) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(stages2(s).as_raw() as u32)
}

const ACCESS: [(Access, vk::AccessFlags2); 6] = [
    (
        Access::COLOR_ATTACHMENT_READ,
        vk::AccessFlags2::COLOR_ATTACHMENT_READ,
    ),
    (
        Access::COLOR_ATTACHMENT_WRITE,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    ),
    (
        Access::DEPTH_STENCIL_READ,
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
    ),
    (
        Access::DEPTH_STENCIL_WRITE,
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    ),
    (
        Access::SHADER_SAMPLED_READ,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
    ),
    (Access::UNIFORM_READ, vk::AccessFlags2::UNIFORM_READ),
];

pub fn access2(a: Access) -> vk::AccessFlags2 {
    ACCESS
        .iter()
        .filter(|(ours, _)| a.contains(*ours))
        .fold(vk::AccessFlags2::NONE, |acc, (_, theirs)| acc | *theirs)
}

pub fn image_usage(u: ImageUsage) -> vk::ImageUsageFlags {
    let mut out = vk::ImageUsageFlags::empty();
    if u.contains(ImageUsage::COLOR_ATTACHMENT) {
        out |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if u.contains(ImageUsage::DEPTH_ATTACHMENT) {
        out |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if u.contains(ImageUsage::SAMPLED) {
        out |= vk::ImageUsageFlags::SAMPLED;
    }
    out
}

pub fn buffer_usage(u: BufferUsage) -> vk::BufferUsageFlags {
    let mut out = vk::BufferUsageFlags::empty();
    if u.contains(BufferUsage::VERTEX) {
        out |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if u.contains(BufferUsage::INDEX) {
        out |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if u.contains(BufferUsage::UNIFORM) {
        out |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    out
}

pub fn attribute_format(f: AttributeFormat) -> vk::Format {
    match f {
        AttributeFormat::Float2 => vk::Format::R32G32_SFLOAT,
        AttributeFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
    }
}

pub fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

pub fn shader_stages(v: ShaderVisibility) -> vk::ShaderStageFlags {
    match v {
        ShaderVisibility::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderVisibility::Fragment => vk::ShaderStageFlags::FRAGMENT,
    }
}

pub fn clear_value(c: ClearValue) -> vk::ClearValue {
    match c {
        ClearValue::Color(rgba) => vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        },
        ClearValue::Depth(depth) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
        },
    }
}

pub fn load_op(op: LoadOp) -> (vk::AttachmentLoadOp, vk::ClearValue) {
    match op {
        LoadOp::Clear(c) => (vk::AttachmentLoadOp::CLEAR, clear_value(c)),
        LoadOp::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
    }
}

pub fn extent(size: RenderSize) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_stage_masks_keep_every_bit() {
        let s = stages2(Stages::FRAGMENT_TESTS | Stages::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(
            s,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(stages2(Stages::empty()), vk::PipelineStageFlags2::NONE);
    }

    #[test]
    fn submit_stage_mask_matches_legacy_bits() {
        assert_eq!(
            stages(Stages::COLOR_ATTACHMENT_OUTPUT),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            stages(Stages::TOP_OF_PIPE | Stages::FRAGMENT_SHADER),
            vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }

    #[test]
    fn depth_stencil_access_maps_both_halves() {
        assert_eq!(
            access2(Access::DEPTH_STENCIL),
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn every_state_has_a_distinct_layout() {
        let mut seen: Vec<_> = ImageState::ALL.iter().map(|s| layout(*s)).collect();
        seen.sort_by_key(|l| l.as_raw());
        seen.dedup();
        assert_eq!(seen.len(), ImageState::ALL.len());
    }

    #[test]
    fn presentable_formats_round_trip() {
        for f in [Format::Bgra8Srgb, Format::Rgba8Srgb, Format::Bgra8Unorm] {
            assert_eq!(surface_format(format(f)), Some(f));
        }
        assert_eq!(surface_format(vk::Format::R16G16B16A16_SFLOAT), None);
    }

    #[test]
    fn depth_clear_uses_depth_stencil_member() {
        let (op, v) = load_op(LoadOp::Clear(ClearValue::Depth(1.0)));
        assert_eq!(op, vk::AttachmentLoadOp::CLEAR);
        // SAFETY: written through the depth_stencil member just above.
        let depth = unsafe { v.depth_stencil.depth };
        assert_eq!(depth, 1.0);
    }
}
