// SPDX-License-Identifier: CEPL-1.0
//! Memory type selection and the buffer/image allocations built on it.

use ash::vk;
use lumen_render::{RenderError, Result};

use crate::context::{DeviceContext, VkCall};

pub fn find_memory_type(
    mem: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..mem.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0 && mem.memory_types[i as usize].property_flags.contains(req)
        })
        .ok_or_else(|| RenderError::NoMemoryType {
            type_bits,
            properties: format!("{req:?}"),
        })
}

pub const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// # Safety
/// The context's device must be live.
pub unsafe fn create_buffer_and_memory(
    ctx: &DeviceContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    props: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let d = &ctx.device;
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    // SAFETY: device is live per the caller.
    unsafe {
        let buf = d.create_buffer(&bci, None).call("vkCreateBuffer")?;
        let req = d.get_buffer_memory_requirements(buf);
        let mem_type = match find_memory_type(&ctx.memory, req.memory_type_bits, props) {
            Ok(t) => t,
            Err(e) => {
                d.destroy_buffer(buf, None);
                return Err(e);
            }
        };
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: mem_type,
            ..Default::default()
        };
        let mem = match d.allocate_memory(&mai, None) {
            Ok(m) => m,
            Err(e) => {
                d.destroy_buffer(buf, None);
                return Err(RenderError::device("vkAllocateMemory", format!("{e:?}")));
            }
        };
        d.bind_buffer_memory(buf, mem, 0).call("vkBindBufferMemory")?;
        Ok((buf, mem))
    }
}

/// Single-mip 2D image in device-local memory.
///
/// # Safety
/// The context's device must be live.
pub unsafe fn create_image_and_memory(
    ctx: &DeviceContext,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<(vk::Image, vk::DeviceMemory)> {
    let d = &ctx.device;
    let img_ci = vk::ImageCreateInfo {
        s_type: vk::StructureType::IMAGE_CREATE_INFO,
        image_type: vk::ImageType::TYPE_2D,
        format,
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    };
    // SAFETY: device is live per the caller.
    unsafe {
        let image = d.create_image(&img_ci, None).call("vkCreateImage")?;
        let req = d.get_image_memory_requirements(image);
        let mem_type = match find_memory_type(
            &ctx.memory,
            req.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(t) => t,
            Err(e) => {
                d.destroy_image(image, None);
                return Err(e);
            }
        };
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: mem_type,
            ..Default::default()
        };
        let memory = match d.allocate_memory(&alloc, None) {
            Ok(m) => m,
            Err(e) => {
                d.destroy_image(image, None);
                return Err(RenderError::device("vkAllocateMemory", format!("{e:?}")));
            }
        };
        d.bind_image_memory(image, memory, 0).call("vkBindImageMemory")?;
        Ok((image, memory))
    }
}

/// One-shot staging upload: host to staging, then staging to `dst`.
/// Uses the graphics queue and a one-time command buffer; waits until done.
///
/// # Safety
/// `dst` must be a live buffer of at least `src.len()` bytes with
/// `TRANSFER_DST` usage.
pub unsafe fn upload_via_staging(ctx: &DeviceContext, dst: vk::Buffer, src: &[u8]) -> Result<()> {
    let d = &ctx.device;
    let size = src.len() as vk::DeviceSize;
    // SAFETY: device is live; the staging objects are freed before return.
    unsafe {
        let (staging, staging_mem) =
            create_buffer_and_memory(ctx, size, vk::BufferUsageFlags::TRANSFER_SRC, HOST_VISIBLE)?;
        let result = (|| -> Result<()> {
            let ptr = d
                .map_memory(staging_mem, 0, size, vk::MemoryMapFlags::empty())
                .call("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.cast::<u8>(), src.len());
            d.unmap_memory(staging_mem);

            let ai = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                command_pool: ctx.command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };
            let cmd = d.allocate_command_buffers(&ai).call("vkAllocateCommandBuffers")?[0];
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            let copied = (|| -> Result<()> {
                d.begin_command_buffer(cmd, &bi).call("vkBeginCommandBuffer")?;
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                d.cmd_copy_buffer(cmd, staging, dst, std::slice::from_ref(&region));
                d.end_command_buffer(cmd).call("vkEndCommandBuffer")?;
                let si = vk::SubmitInfo {
                    s_type: vk::StructureType::SUBMIT_INFO,
                    command_buffer_count: 1,
                    p_command_buffers: &cmd,
                    ..Default::default()
                };
                d.queue_submit(ctx.queue, std::slice::from_ref(&si), vk::Fence::null())
                    .call("vkQueueSubmit")?;
                d.queue_wait_idle(ctx.queue).call("vkQueueWaitIdle")
            })();
            d.free_command_buffers(ctx.command_pool, std::slice::from_ref(&cmd));
            copied
        })();
        d.destroy_buffer(staging, None);
        d.free_memory(staging_mem, None);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in p.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        p
    }

    #[test]
    fn first_type_allowed_by_bits_and_flags_wins() {
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            HOST_VISIBLE,
            HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(find_memory_type(&p, 0b111, HOST_VISIBLE).unwrap(), 1);
        assert_eq!(find_memory_type(&p, 0b100, HOST_VISIBLE).unwrap(), 2);
        assert_eq!(
            find_memory_type(&p, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn missing_type_is_an_error_naming_the_request() {
        let p = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&p, 0b1, HOST_VISIBLE).unwrap_err();
        match err {
            RenderError::NoMemoryType { type_bits, properties } => {
                assert_eq!(type_bits, 1);
                assert!(properties.contains("HOST_VISIBLE"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn types_past_the_reported_count_are_ignored() {
        let mut p = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        p.memory_types[1].property_flags = HOST_VISIBLE;
        assert!(find_memory_type(&p, 0b11, HOST_VISIBLE).is_err());
    }
}
