// SPDX-License-Identifier: CEPL-1.0
//! Graphics pipelines for dynamic rendering, plus their descriptor plumbing.

use std::ffi::CString;
use std::io::Cursor;

use ash::util::read_spv;
use ash::vk;
use lumen_render::gpu::{BindingSlot, PassKind, PipelineDesc};
use lumen_render::shader::ENTRY_POINT;
use lumen_render::{RenderError, Result};

use crate::context::VkCall;
use crate::convert;

/// A pipeline and the layouts its bind groups are allocated against.
pub struct PipelineEntry {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub bindings: Vec<BindingSlot>,
}

impl PipelineEntry {
    /// # Safety
    /// No command buffer referencing the pipeline may still be pending.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: forwarded from the caller.
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Decoder for [`ShaderLibrary::load_with`](lumen_render::shader::ShaderLibrary::load_with):
/// aligns the bytes and fixes byte order the way the loader expects.
pub fn read_spirv(bytes: &[u8]) -> std::result::Result<Vec<u32>, String> {
    read_spv(&mut Cursor::new(bytes)).map_err(|e| e.to_string())
}

// STRICT: color attachment formats MUST match the images the pass renders
// into. When the swapchain format changes, the lighting pipeline is rebuilt
// before anything records with it.
/// # Safety
/// `device` must be live.
pub unsafe fn create_pipeline(device: &ash::Device, desc: &PipelineDesc<'_>) -> Result<PipelineEntry> {
    let set_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = desc
        .bindings
        .iter()
        .map(|b| vk::DescriptorSetLayoutBinding {
            binding: b.binding,
            descriptor_type: convert::descriptor_type(b.kind),
            descriptor_count: 1,
            stage_flags: convert::shader_stages(b.visibility),
            ..Default::default()
        })
        .collect();
    let set_ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: set_bindings.len() as u32,
        p_bindings: set_bindings.as_ptr(),
        ..Default::default()
    };
    // SAFETY: device is live per the caller.
    let set_layout = unsafe { device.create_descriptor_set_layout(&set_ci, None) }
        .call("vkCreateDescriptorSetLayout")?;

    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: 1,
        p_set_layouts: &set_layout,
        ..Default::default()
    };
    // SAFETY: set_layout was just created on this device.
    let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
        Ok(l) => l,
        Err(e) => {
            // SAFETY: nothing references set_layout yet.
            unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
            return Err(RenderError::device("vkCreatePipelineLayout", format!("{e:?}")));
        }
    };

    // SAFETY: layouts were created on this device above.
    match unsafe { build_graphics_pipeline(device, desc, layout) } {
        Ok(pipeline) => {
            tracing::debug!("vk: pipeline {} ({} bindings)", desc.label, desc.bindings.len());
            Ok(PipelineEntry {
                pipeline,
                layout,
                set_layout,
                bindings: desc.bindings.clone(),
            })
        }
        Err(e) => {
            // SAFETY: no pipeline was created from these layouts.
            unsafe {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
            }
            Err(e)
        }
    }
}

unsafe fn shader_module(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: words.as_ptr(),
        code_size: words.len() * 4,
        ..Default::default()
    };
    // SAFETY: words outlive the call; the device is live.
    unsafe { device.create_shader_module(&ci, None) }.call("vkCreateShaderModule")
}

unsafe fn build_graphics_pipeline(
    device: &ash::Device,
    desc: &PipelineDesc<'_>,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    // SAFETY: device is live per the caller.
    let vs = unsafe { shader_module(device, &desc.shaders.vertex)? };
    // SAFETY: as above.
    let fs = match unsafe { shader_module(device, &desc.shaders.fragment) } {
        Ok(m) => m,
        Err(e) => {
            // SAFETY: vs was created above and is unused.
            unsafe { device.destroy_shader_module(vs, None) };
            return Err(e);
        }
    };
    let entry = CString::new(ENTRY_POINT).unwrap_or_default();

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
    ];

    // Vertex input: one interleaved binding, or none for generated geometry.
    let vb = desc.vertex_layout.map(|l| vk::VertexInputBindingDescription {
        binding: 0,
        stride: l.stride,
        input_rate: vk::VertexInputRate::VERTEX,
    });
    let va: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_layout
        .map(|l| {
            l.attributes
                .iter()
                .map(|a| vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: 0,
                    format: convert::attribute_format(a.format),
                    offset: a.offset,
                })
                .collect()
        })
        .unwrap_or_default();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: vb.is_some() as u32,
        p_vertex_binding_descriptions: vb.as_ref().map_or(std::ptr::null(), |b| b as *const _),
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    // Viewport and scissor are set at bind time from the pass extent.
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    // Both demo quads are seen from either side as the model spins.
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_on = desc.depth_format.is_some() as vk::Bool32;
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: depth_on,
        depth_write_enable: depth_on,
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        ..Default::default()
    };
    let blend: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_formats
        .iter()
        .map(|_| vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::RGBA,
            blend_enable: match desc.kind {
                PassKind::Overlay => vk::TRUE,
                PassKind::Geometry | PassKind::Lighting => vk::FALSE,
            },
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
        })
        .collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: blend.len() as u32,
        p_attachments: blend.as_ptr(),
        ..Default::default()
    };

    let color_formats: Vec<vk::Format> = desc.color_formats.iter().map(|f| convert::format(*f)).collect();
    let rendering = vk::PipelineRenderingCreateInfo {
        s_type: vk::StructureType::PIPELINE_RENDERING_CREATE_INFO,
        color_attachment_count: color_formats.len() as u32,
        p_color_attachment_formats: color_formats.as_ptr(),
        depth_attachment_format: desc.depth_format.map_or(vk::Format::UNDEFINED, convert::format),
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        p_next: (&rendering as *const _) as *const _,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        ..Default::default()
    };

    // SAFETY: every pointer in pipeline_info refers to a local that outlives the call.
    let created = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    };
    // SAFETY: modules are only needed during pipeline creation.
    unsafe {
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);
    }
    match created {
        Ok(p) => Ok(p[0]),
        Err((_, err)) => Err(RenderError::device("vkCreateGraphicsPipelines", format!("{err:?}"))),
    }
}

/// Descriptor pool sized for a handful of pipelines times frames in flight.
/// Sets are freed individually when bind groups are rebuilt.
///
/// # Safety
/// `device` must be live.
pub unsafe fn create_descriptor_pool(device: &ash::Device, max_sets: u32) -> Result<vk::DescriptorPool> {
    let sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: max_sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: max_sets * 4,
        },
    ];
    let ci = vk::DescriptorPoolCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
        flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        max_sets,
        pool_size_count: sizes.len() as u32,
        p_pool_sizes: sizes.as_ptr(),
        ..Default::default()
    };
    // SAFETY: device is live per the caller.
    unsafe { device.create_descriptor_pool(&ci, None) }.call("vkCreateDescriptorPool")
}

/// Nearest-filtered, edge-clamped sampler. G-buffer texels map one to one
/// onto output pixels, so no filtering is wanted.
///
/// # Safety
/// `device` must be live.
pub unsafe fn create_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let ci = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::NEAREST,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        max_lod: 0.0,
        ..Default::default()
    };
    // SAFETY: device is live per the caller.
    unsafe { device.create_sampler(&ci, None) }.call("vkCreateSampler")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_render::shader::header_only_module;

    #[test]
    fn read_spirv_accepts_either_byte_order() {
        let le: Vec<u8> = header_only_module().iter().flat_map(|w| w.to_le_bytes()).collect();
        let be: Vec<u8> = header_only_module().iter().flat_map(|w| w.to_be_bytes()).collect();
        assert_eq!(read_spirv(&le).unwrap(), header_only_module());
        assert_eq!(read_spirv(&be).unwrap(), header_only_module());
    }

    #[test]
    fn read_spirv_rejects_ragged_input() {
        assert!(read_spirv(&[0x03, 0x02, 0x23, 0x07, 0x00]).is_err());
    }
}
