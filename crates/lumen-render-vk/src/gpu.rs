// SPDX-License-Identifier: CEPL-1.0
//! [`Gpu`] on a real Vulkan device.
//!
//! Handles are the raw `u64` of the underlying `vk` object. Side tables keep
//! whatever else a handle needs at destroy or bind time (memory, mappings,
//! layouts) and everything still alive when the device goes away.

use std::collections::{HashMap, HashSet};

use ash::vk::{self, Handle};
use lumen_render::gpu::{
    AcquireResult, BindGroupHandle, BindingKind, BindingResource, BufferHandle, BufferUsage,
    CommandBufferHandle, FenceHandle, FenceStatus, Format, Gpu, ImageBarrier, ImageDesc,
    ImageHandle, PipelineDesc, PipelineHandle, PresentResult, RenderingDesc, SemaphoreHandle,
    Submission, SurfaceCaps, SwapchainImages, ViewHandle,
};
use lumen_render::{RenderError, RenderSize, Result, VsyncMode};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};

use crate::context::{DeviceContext, VkCall};
use crate::convert;
use crate::memory::{self, HOST_VISIBLE};
use crate::pipeline::{self, PipelineEntry};

/// Bind groups the pool can hold at once.
const MAX_BIND_GROUPS: u32 = 64;

struct BufferAlloc {
    memory: vk::DeviceMemory,
    size: u64,
    mapped: Option<*mut u8>,
}

struct SwapchainState {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
}

pub struct VkGpu {
    vsync: bool,
    vsync_mode: VsyncMode,
    sampler: vk::Sampler,
    descriptor_pool: vk::DescriptorPool,
    swapchain: Option<SwapchainState>,
    images: HashMap<u64, vk::DeviceMemory>,
    views: HashSet<u64>,
    buffers: HashMap<u64, BufferAlloc>,
    pipelines: HashMap<u64, PipelineEntry>,
    groups: HashSet<u64>,
    fences: HashSet<u64>,
    semaphores: HashSet<u64>,
    command_buffers: HashSet<u64>,
    ctx: DeviceContext,
}

fn image(h: ImageHandle) -> vk::Image {
    vk::Image::from_raw(h.0)
}

fn view(h: ViewHandle) -> vk::ImageView {
    vk::ImageView::from_raw(h.0)
}

fn buffer(h: BufferHandle) -> vk::Buffer {
    vk::Buffer::from_raw(h.0)
}

fn fence(h: FenceHandle) -> vk::Fence {
    vk::Fence::from_raw(h.0)
}

fn semaphore(h: SemaphoreHandle) -> vk::Semaphore {
    vk::Semaphore::from_raw(h.0)
}

fn cmd(h: CommandBufferHandle) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(h.0)
}

/// `offset..offset + len` lies inside a buffer of `size` bytes, without
/// wrapping.
fn range_fits(offset: u64, len: usize, size: u64) -> bool {
    offset
        .checked_add(len as u64)
        .is_some_and(|end| end <= size)
}

/// Present mode for the vsync setting, falling back to FIFO which every
/// surface supports.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool, mode: VsyncMode) -> vk::PresentModeKHR {
    let has = |m| modes.contains(&m);
    let order: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX],
        (true, VsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX],
        (true, VsyncMode::Fifo) => &[],
    };
    order.iter().copied().find(|m| has(*m)).unwrap_or(vk::PresentModeKHR::FIFO)
}

/// SDR surface format, in order of preference, among those the lighting
/// pass can render to.
pub fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<(vk::SurfaceFormatKHR, Format)> {
    let srgb = |f: &vk::SurfaceFormatKHR| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;
    [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB, vk::Format::B8G8R8A8_UNORM]
        .into_iter()
        .find_map(|want| formats.iter().copied().find(|f| f.format == want && srgb(f)))
        .and_then(|f| convert::surface_format(f.format).map(|ours| (f, ours)))
}

impl VkGpu {
    /// # Safety
    /// The window must outlive the returned device.
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        app_name: &str,
        vsync: bool,
        vsync_mode: VsyncMode,
    ) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let ctx = unsafe { DeviceContext::new(window, display, app_name)? };

        let needed = vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE;
        for f in [Format::Rgba32Float, Format::Rgba16Float, Format::Rgba8Unorm] {
            if !ctx.supports_attachment(convert::format(f), needed) {
                return Err(RenderError::NoSuitableDevice(format!(
                    "{f:?} cannot be rendered to and sampled"
                )));
            }
        }
        if !ctx.supports_attachment(
            convert::format(Format::D32Float),
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        ) {
            return Err(RenderError::NoSuitableDevice("D32 depth unsupported".into()));
        }

        // SAFETY: ctx.device is live.
        let sampler = unsafe { pipeline::create_sampler(&ctx.device)? };
        // SAFETY: as above.
        let descriptor_pool = unsafe { pipeline::create_descriptor_pool(&ctx.device, MAX_BIND_GROUPS)? };

        Ok(Self {
            vsync,
            vsync_mode,
            sampler,
            descriptor_pool,
            swapchain: None,
            images: HashMap::new(),
            views: HashSet::new(),
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            groups: HashSet::new(),
            fences: HashSet::new(),
            semaphores: HashSet::new(),
            command_buffers: HashSet::new(),
            ctx,
        })
    }

    /// Takes effect at the next swapchain rebuild.
    pub fn set_present_mode(&mut self, vsync: bool, mode: VsyncMode) {
        self.vsync = vsync;
        self.vsync_mode = mode;
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    fn device(&self) -> &ash::Device {
        &self.ctx.device
    }

    fn pipeline_entry(&self, h: PipelineHandle, call: &str) -> Result<&PipelineEntry> {
        self.pipelines
            .get(&h.0)
            .ok_or_else(|| RenderError::InvalidState(format!("{call}: unknown pipeline {h:?}")))
    }
}

impl Gpu for VkGpu {
    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        // SAFETY: device is live for the lifetime of self.
        let f = unsafe { self.device().create_fence(&ci, None) }.call("vkCreateFence")?;
        self.fences.insert(f.as_raw());
        Ok(FenceHandle(f.as_raw()))
    }

    fn destroy_fence(&mut self, f: FenceHandle) {
        if self.fences.remove(&f.0) {
            // SAFETY: the fence was created here and its work has retired.
            unsafe { self.device().destroy_fence(fence(f), None) };
        }
    }

    fn wait_for_fence(&mut self, f: FenceHandle, timeout_ns: u64) -> Result<FenceStatus> {
        // SAFETY: the fence is live.
        match unsafe { self.device().wait_for_fences(&[fence(f)], true, timeout_ns) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::TimedOut),
            Err(e) => Err(RenderError::device("vkWaitForFences", format!("{e:?}"))),
        }
    }

    fn reset_fence(&mut self, f: FenceHandle) -> Result<()> {
        // SAFETY: the caller only resets fences it has waited on.
        unsafe { self.device().reset_fences(&[fence(f)]) }.call("vkResetFences")
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle> {
        let ci = vk::SemaphoreCreateInfo::default();
        // SAFETY: device is live.
        let s = unsafe { self.device().create_semaphore(&ci, None) }.call("vkCreateSemaphore")?;
        self.semaphores.insert(s.as_raw());
        Ok(SemaphoreHandle(s.as_raw()))
    }

    fn destroy_semaphore(&mut self, s: SemaphoreHandle) {
        if self.semaphores.remove(&s.0) {
            // SAFETY: no pending operation waits on or signals it.
            unsafe { self.device().destroy_semaphore(semaphore(s), None) };
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        // SAFETY: device is live.
        unsafe { self.device().device_wait_idle() }.call("vkDeviceWaitIdle")
    }

    fn allocate_command_buffer(&mut self) -> Result<CommandBufferHandle> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.ctx.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        // SAFETY: the pool belongs to this device.
        let bufs = unsafe { self.device().allocate_command_buffers(&ai) }.call("vkAllocateCommandBuffers")?;
        let c = bufs[0];
        self.command_buffers.insert(c.as_raw());
        Ok(CommandBufferHandle(c.as_raw()))
    }

    fn free_command_buffer(&mut self, c: CommandBufferHandle) {
        if self.command_buffers.remove(&c.0) {
            // SAFETY: the buffer is not pending.
            unsafe {
                self.device()
                    .free_command_buffers(self.ctx.command_pool, &[cmd(c)])
            };
        }
    }

    fn begin_commands(&mut self, c: CommandBufferHandle) -> Result<()> {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        // SAFETY: the frame ring waited on this buffer's fence first.
        unsafe {
            self.device()
                .reset_command_buffer(cmd(c), vk::CommandBufferResetFlags::empty())
                .call("vkResetCommandBuffer")?;
            self.device()
                .begin_command_buffer(cmd(c), &begin)
                .call("vkBeginCommandBuffer")
        }
    }

    fn end_commands(&mut self, c: CommandBufferHandle) -> Result<()> {
        // SAFETY: the buffer is recording.
        unsafe { self.device().end_command_buffer(cmd(c)) }.call("vkEndCommandBuffer")
    }

    fn submit(&mut self, s: &Submission) -> Result<()> {
        let wait_stages = [convert::stages(s.wait_stages)];
        let wait = semaphore(s.wait);
        let signal = semaphore(s.signal);
        let c = cmd(s.command_buffer);
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &c,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        // SAFETY: every handle in si is live and the locals outlive the call.
        unsafe {
            self.device()
                .queue_submit(self.ctx.queue, std::slice::from_ref(&si), fence(s.fence))
        }
        .map_err(|e| RenderError::Submit(format!("{e:?}")))
    }

    fn surface_caps(&mut self) -> Result<SurfaceCaps> {
        // SAFETY: surface and physical device are live.
        let caps = unsafe {
            self.ctx
                .surface_loader
                .get_physical_device_surface_capabilities(self.ctx.phys, self.ctx.surface)
        }
        .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let size = |e: vk::Extent2D| RenderSize::new(e.width, e.height);
        Ok(SurfaceCaps {
            current_extent: (caps.current_extent.width != u32::MAX).then(|| size(caps.current_extent)),
            min_extent: size(caps.min_image_extent),
            max_extent: size(caps.max_image_extent),
            min_image_count: caps.min_image_count,
            max_image_count: (caps.max_image_count != 0).then_some(caps.max_image_count),
        })
    }

    fn create_swapchain(&mut self, extent: RenderSize, image_count: u32) -> Result<SwapchainImages> {
        if self.swapchain.is_some() {
            return Err(RenderError::InvalidState("swapchain already exists".into()));
        }
        let (surf, phys) = (self.ctx.surface, self.ctx.phys);
        let loader = &self.ctx.surface_loader;
        // SAFETY: surface and physical device are live.
        let (caps, formats, modes) = unsafe {
            (
                loader
                    .get_physical_device_surface_capabilities(phys, surf)
                    .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                loader
                    .get_physical_device_surface_formats(phys, surf)
                    .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                loader
                    .get_physical_device_surface_present_modes(phys, surf)
                    .call("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            )
        };
        let (surf_format, format) = pick_surface_format(&formats).ok_or_else(|| {
            RenderError::NoSuitableDevice("surface offers no 8-bit sRGB format".into())
        })?;
        let present_mode = choose_present_mode(&modes, self.vsync, self.vsync_mode);
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: surf,
            min_image_count: image_count,
            image_format: surf_format.format,
            image_color_space: surf_format.color_space,
            image_extent: convert::extent(extent),
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            ..Default::default()
        };
        // SAFETY: no other swapchain exists for this surface.
        let swapchain = unsafe { self.ctx.swapchain_loader.create_swapchain(&swap_info, None) }
            .call("vkCreateSwapchainKHR")?;
        // SAFETY: swapchain was just created.
        let images = match unsafe { self.ctx.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(i) => i,
            Err(e) => {
                // SAFETY: nothing uses the new swapchain yet.
                unsafe { self.ctx.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(RenderError::device("vkGetSwapchainImagesKHR", format!("{e:?}")));
            }
        };
        info!(
            "vk: swapchain {}x{}, {:?} / {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surf_format.format,
            surf_format.color_space,
            present_mode,
            images.len()
        );
        let handles = images.iter().map(|i| ImageHandle(i.as_raw())).collect();
        self.swapchain = Some(SwapchainState { swapchain, images });
        Ok(SwapchainImages {
            images: handles,
            format,
            extent,
        })
    }

    fn destroy_swapchain(&mut self) {
        if let Some(sc) = self.swapchain.take() {
            debug!("vk: destroying swapchain ({} images)", sc.images.len());
            // SAFETY: the caller waited for the device to idle.
            unsafe { self.ctx.swapchain_loader.destroy_swapchain(sc.swapchain, None) };
        }
    }

    fn acquire_next_image(&mut self, timeout_ns: u64, signal: SemaphoreHandle) -> Result<AcquireResult> {
        let Some(sc) = &self.swapchain else {
            return Err(RenderError::InvalidState("acquire without a swapchain".into()));
        };
        // SAFETY: swapchain and semaphore are live; the semaphore is unsignaled.
        let r = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                sc.swapchain,
                timeout_ns,
                semaphore(signal),
                vk::Fence::null(),
            )
        };
        match r {
            Ok((index, suboptimal)) => Ok(AcquireResult::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(RenderError::device("vkAcquireNextImageKHR", format!("{e:?}"))),
        }
    }

    fn present(&mut self, index: u32, wait: SemaphoreHandle) -> Result<PresentResult> {
        let Some(sc) = &self.swapchain else {
            return Err(RenderError::InvalidState("present without a swapchain".into()));
        };
        let wait = semaphore(wait);
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &sc.swapchain,
            p_image_indices: &index,
            ..Default::default()
        };
        // SAFETY: the image was acquired and its rendering submitted.
        match unsafe { self.ctx.swapchain_loader.queue_present(self.ctx.queue, &present) } {
            Ok(false) => Ok(PresentResult::Presented),
            Ok(true) => Ok(PresentResult::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentResult::OutOfDate),
            Err(e) => Err(RenderError::device("vkQueuePresentKHR", format!("{e:?}"))),
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle> {
        // SAFETY: device is live.
        let (img, mem) = unsafe {
            memory::create_image_and_memory(
                &self.ctx,
                convert::extent(desc.extent),
                convert::format(desc.format),
                convert::image_usage(desc.usage),
            )?
        };
        debug!("vk: image {} {}x{}", desc.label, desc.extent.width, desc.extent.height);
        self.images.insert(img.as_raw(), mem);
        Ok(ImageHandle(img.as_raw()))
    }

    fn destroy_image(&mut self, h: ImageHandle) {
        if let Some(mem) = self.images.remove(&h.0) {
            // SAFETY: views of the image were destroyed first.
            unsafe {
                self.device().destroy_image(image(h), None);
                self.device().free_memory(mem, None);
            }
        }
    }

    fn create_view(&mut self, h: ImageHandle, format: Format) -> Result<ViewHandle> {
        let sub = vk::ImageSubresourceRange {
            aspect_mask: convert::aspect(format.aspect()),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: image(h),
            view_type: vk::ImageViewType::TYPE_2D,
            format: convert::format(format),
            subresource_range: sub,
            ..Default::default()
        };
        // SAFETY: the image is live.
        let v = unsafe { self.device().create_image_view(&iv_info, None) }.call("vkCreateImageView")?;
        self.views.insert(v.as_raw());
        Ok(ViewHandle(v.as_raw()))
    }

    fn destroy_view(&mut self, h: ViewHandle) {
        if self.views.remove(&h.0) {
            // SAFETY: no pending command references the view.
            unsafe { self.device().destroy_image_view(view(h), None) };
        }
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage, host_visible: bool) -> Result<BufferHandle> {
        let mut vk_usage = convert::buffer_usage(usage);
        let props = if host_visible {
            HOST_VISIBLE
        } else {
            vk_usage |= vk::BufferUsageFlags::TRANSFER_DST;
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        // SAFETY: device is live.
        let (buf, mem) = unsafe { memory::create_buffer_and_memory(&self.ctx, size, vk_usage, props)? };
        let mapped = if host_visible {
            // SAFETY: the memory is host visible and not yet mapped.
            let ptr = unsafe {
                self.device()
                    .map_memory(mem, 0, size, vk::MemoryMapFlags::empty())
            };
            match ptr {
                Ok(p) => Some(p.cast::<u8>()),
                Err(e) => {
                    // SAFETY: nothing references the new buffer.
                    unsafe {
                        self.device().destroy_buffer(buf, None);
                        self.device().free_memory(mem, None);
                    }
                    return Err(RenderError::device("vkMapMemory", format!("{e:?}")));
                }
            }
        } else {
            None
        };
        self.buffers.insert(
            buf.as_raw(),
            BufferAlloc {
                memory: mem,
                size,
                mapped,
            },
        );
        Ok(BufferHandle(buf.as_raw()))
    }

    fn upload_buffer(&mut self, h: BufferHandle, bytes: &[u8]) -> Result<()> {
        let Some(alloc) = self.buffers.get(&h.0) else {
            return Err(RenderError::InvalidState(format!("upload to unknown buffer {h:?}")));
        };
        if bytes.len() as u64 > alloc.size {
            return Err(RenderError::InvalidState(format!(
                "{} bytes do not fit buffer of {}",
                bytes.len(),
                alloc.size
            )));
        }
        if alloc.mapped.is_some() {
            return self.write_mapped(h, 0, bytes);
        }
        // SAFETY: the buffer is live, large enough and has TRANSFER_DST usage.
        unsafe { memory::upload_via_staging(&self.ctx, buffer(h), bytes) }
    }

    fn write_mapped(&mut self, h: BufferHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        let Some(alloc) = self.buffers.get(&h.0) else {
            return Err(RenderError::InvalidState(format!("write to unknown buffer {h:?}")));
        };
        let Some(ptr) = alloc.mapped else {
            return Err(RenderError::InvalidState(format!("buffer {h:?} is not host visible")));
        };
        if !range_fits(offset, bytes.len(), alloc.size) {
            return Err(RenderError::InvalidState(format!(
                "write of {} bytes at {offset} overruns buffer of {}",
                bytes.len(),
                alloc.size
            )));
        }
        // SAFETY: the range was bounds-checked against the persistent mapping;
        // memory is coherent so no flush is needed.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len()) };
        Ok(())
    }

    fn destroy_buffer(&mut self, h: BufferHandle) {
        if let Some(alloc) = self.buffers.remove(&h.0) {
            // SAFETY: no pending work references the buffer.
            unsafe {
                if alloc.mapped.is_some() {
                    self.device().unmap_memory(alloc.memory);
                }
                self.device().destroy_buffer(buffer(h), None);
                self.device().free_memory(alloc.memory, None);
            }
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle> {
        // SAFETY: device is live.
        let entry = unsafe { pipeline::create_pipeline(self.device(), desc)? };
        let h = PipelineHandle(entry.pipeline.as_raw());
        self.pipelines.insert(h.0, entry);
        Ok(h)
    }

    fn destroy_pipeline(&mut self, h: PipelineHandle) {
        if let Some(entry) = self.pipelines.remove(&h.0) {
            // SAFETY: bind groups of the pipeline were destroyed first.
            unsafe { entry.destroy(&self.ctx.device) };
        }
    }

    fn create_bind_group(&mut self, h: PipelineHandle, resources: &[BindingResource]) -> Result<BindGroupHandle> {
        let Some(entry) = self.pipelines.get(&h.0) else {
            return Err(RenderError::InvalidState(format!("bind group for unknown pipeline {h:?}")));
        };
        if resources.len() != entry.bindings.len() {
            return Err(RenderError::InvalidState(format!(
                "pipeline expects {} bindings, got {}",
                entry.bindings.len(),
                resources.len()
            )));
        }
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: 1,
            p_set_layouts: &entry.set_layout,
            ..Default::default()
        };
        // SAFETY: pool and layout belong to this device.
        let set = unsafe { self.ctx.device.allocate_descriptor_sets(&ai) }.call("vkAllocateDescriptorSets")?[0];

        // Infos are collected first so the writes can point into stable storage.
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for (slot, res) in entry.bindings.iter().zip(resources) {
            match (slot.kind, res) {
                (BindingKind::UniformBuffer, BindingResource::Uniform { buffer: b, size }) => {
                    buffer_infos.push((
                        slot.binding,
                        vk::DescriptorBufferInfo {
                            buffer: buffer(*b),
                            offset: 0,
                            range: *size,
                        },
                    ));
                }
                (BindingKind::SampledImage, BindingResource::Sampled { view: v, .. }) => {
                    image_infos.push((
                        slot.binding,
                        vk::DescriptorImageInfo {
                            sampler: self.sampler,
                            image_view: view(*v),
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        },
                    ));
                }
                (kind, res) => {
                    // SAFETY: the set was just allocated and is unused.
                    unsafe { self.ctx.device.free_descriptor_sets(self.descriptor_pool, &[set]) }.ok();
                    return Err(RenderError::InvalidState(format!(
                        "binding {} is {kind:?}, got {res:?}",
                        slot.binding
                    )));
                }
            }
        }
        let writes: Vec<vk::WriteDescriptorSet<'_>> = buffer_infos
            .iter()
            .map(|(binding, info)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: *binding,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .chain(image_infos.iter().map(|(binding, info)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: *binding,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: info,
                ..Default::default()
            }))
            .collect();
        // SAFETY: infos outlive the call; the set is not in use.
        unsafe { self.ctx.device.update_descriptor_sets(&writes, &[]) };

        self.groups.insert(set.as_raw());
        Ok(BindGroupHandle(set.as_raw()))
    }

    fn destroy_bind_group(&mut self, h: BindGroupHandle) {
        if self.groups.remove(&h.0) {
            let set = vk::DescriptorSet::from_raw(h.0);
            // SAFETY: the pool allows freeing and the set is not pending.
            if let Err(e) = unsafe { self.device().free_descriptor_sets(self.descriptor_pool, &[set]) } {
                warn!("vk: vkFreeDescriptorSets: {e:?}");
            }
        }
    }

    fn cmd_barriers(&mut self, c: CommandBufferHandle, barriers: &[ImageBarrier]) {
        let vk_barriers: Vec<vk::ImageMemoryBarrier2<'_>> = barriers
            .iter()
            .map(|b| vk::ImageMemoryBarrier2 {
                s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
                src_stage_mask: convert::stages2(b.scope.src_stages),
                src_access_mask: convert::access2(b.scope.src_access),
                dst_stage_mask: convert::stages2(b.scope.dst_stages),
                dst_access_mask: convert::access2(b.scope.dst_access),
                old_layout: convert::layout(b.old),
                new_layout: convert::layout(b.new),
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: image(b.image),
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: convert::aspect(b.aspect),
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            })
            .collect();
        let dep = vk::DependencyInfo {
            s_type: vk::StructureType::DEPENDENCY_INFO,
            image_memory_barrier_count: vk_barriers.len() as u32,
            p_image_memory_barriers: vk_barriers.as_ptr(),
            ..Default::default()
        };
        // SAFETY: the command buffer is recording; barriers outlive the call.
        unsafe { self.ctx.cmd_pipeline_barrier2(cmd(c), &dep) };
    }

    fn cmd_begin_rendering(&mut self, c: CommandBufferHandle, desc: &RenderingDesc) {
        let attachment = |a: &lumen_render::gpu::Attachment| {
            let (load_op, clear_value) = convert::load_op(a.load);
            vk::RenderingAttachmentInfo {
                s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
                image_view: view(a.view),
                image_layout: convert::layout(a.state),
                load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                clear_value,
                ..Default::default()
            }
        };
        let colors: Vec<vk::RenderingAttachmentInfo<'_>> = desc.colors.iter().map(attachment).collect();
        let depth = desc.depth.as_ref().map(attachment);
        let info = vk::RenderingInfo {
            s_type: vk::StructureType::RENDERING_INFO,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: convert::extent(desc.extent),
            },
            layer_count: 1,
            color_attachment_count: colors.len() as u32,
            p_color_attachments: colors.as_ptr(),
            p_depth_attachment: depth.as_ref().map_or(std::ptr::null(), |d| d as *const _),
            ..Default::default()
        };
        // SAFETY: the command buffer is recording; attachments outlive the call.
        unsafe { self.ctx.cmd_begin_rendering(cmd(c), &info) };
    }

    fn cmd_end_rendering(&mut self, c: CommandBufferHandle) {
        // SAFETY: paired with cmd_begin_rendering on the same buffer.
        unsafe { self.ctx.cmd_end_rendering(cmd(c)) };
    }

    fn cmd_bind_pipeline(&mut self, c: CommandBufferHandle, h: PipelineHandle, extent: RenderSize) -> Result<()> {
        let p = self.pipeline_entry(h, "cmd_bind_pipeline")?.pipeline;
        let vp = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let sc = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: convert::extent(extent),
        };
        let d = self.device();
        // SAFETY: the command buffer is recording inside a rendering scope.
        unsafe {
            d.cmd_bind_pipeline(cmd(c), vk::PipelineBindPoint::GRAPHICS, p);
            d.cmd_set_viewport(cmd(c), 0, std::slice::from_ref(&vp));
            d.cmd_set_scissor(cmd(c), 0, std::slice::from_ref(&sc));
        }
        Ok(())
    }

    fn cmd_bind_group(&mut self, c: CommandBufferHandle, h: PipelineHandle, group: BindGroupHandle) -> Result<()> {
        let layout = self.pipeline_entry(h, "cmd_bind_group")?.layout;
        let set = vk::DescriptorSet::from_raw(group.0);
        // SAFETY: the set was allocated against this pipeline's layout.
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                cmd(c),
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                std::slice::from_ref(&set),
                &[],
            )
        };
        Ok(())
    }

    fn cmd_bind_mesh(&mut self, c: CommandBufferHandle, vertices: BufferHandle, indices: BufferHandle) {
        let d = self.device();
        // SAFETY: both buffers are live device-local mesh buffers.
        unsafe {
            d.cmd_bind_vertex_buffers(cmd(c), 0, &[buffer(vertices)], &[0]);
            d.cmd_bind_index_buffer(cmd(c), buffer(indices), 0, vk::IndexType::UINT32);
        }
    }

    fn cmd_draw(&mut self, c: CommandBufferHandle, vertex_count: u32) {
        // SAFETY: a pipeline is bound.
        unsafe { self.device().cmd_draw(cmd(c), vertex_count, 1, 0, 0) };
    }

    fn cmd_draw_indexed(&mut self, c: CommandBufferHandle, index_count: u32) {
        // SAFETY: a pipeline and mesh are bound.
        unsafe { self.device().cmd_draw_indexed(cmd(c), index_count, 1, 0, 0, 0) };
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - bind groups, then pipelines and their layouts
// - views before images and swapchain
// - buffers and images with their memory
// - sync objects and command buffers
// - swapchain before the context drops the device and surface
impl Drop for VkGpu {
    fn drop(&mut self) {
        let leaked = self.images.len() + self.buffers.len() + self.pipelines.len() + self.views.len();
        if leaked > 0 {
            debug!("vk: releasing {leaked} objects still alive at teardown");
        }
        // SAFETY: after wait idle nothing is pending; each object is destroyed once.
        unsafe {
            let d = &self.ctx.device;
            d.device_wait_idle().ok();
            d.destroy_descriptor_pool(self.descriptor_pool, None);
            for (_, p) in self.pipelines.drain() {
                p.destroy(d);
            }
            for v in self.views.drain() {
                d.destroy_image_view(vk::ImageView::from_raw(v), None);
            }
            for (i, mem) in self.images.drain() {
                d.destroy_image(vk::Image::from_raw(i), None);
                d.free_memory(mem, None);
            }
            for (b, alloc) in self.buffers.drain() {
                if alloc.mapped.is_some() {
                    d.unmap_memory(alloc.memory);
                }
                d.destroy_buffer(vk::Buffer::from_raw(b), None);
                d.free_memory(alloc.memory, None);
            }
            for f in self.fences.drain() {
                d.destroy_fence(vk::Fence::from_raw(f), None);
            }
            for s in self.semaphores.drain() {
                d.destroy_semaphore(vk::Semaphore::from_raw(s), None);
            }
            let cmds: Vec<vk::CommandBuffer> =
                self.command_buffers.drain().map(vk::CommandBuffer::from_raw).collect();
            if !cmds.is_empty() {
                d.free_command_buffers(self.ctx.command_pool, &cmds);
            }
            d.destroy_sampler(self.sampler, None);
            if let Some(sc) = self.swapchain.take() {
                self.ctx.swapchain_loader.destroy_swapchain(sc.swapchain, None);
            }
        }
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn vsync_off_prefers_immediate_then_mailbox() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(choose_present_mode(&all, false, VsyncMode::Fifo), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(
            choose_present_mode(&all[..2], false, VsyncMode::Fifo),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(choose_present_mode(&all[..1], false, VsyncMode::Fifo), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn vsync_on_honours_mailbox_only_when_asked() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&all, true, VsyncMode::Mailbox), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&all, true, VsyncMode::Fifo), vk::PresentModeKHR::FIFO);
        assert_eq!(
            choose_present_mode(&all[..1], true, VsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn mapped_writes_are_bounds_checked_without_wrapping() {
        assert!(range_fits(0, 256, 256));
        assert!(range_fits(255, 1, 256));
        assert!(!range_fits(255, 2, 256));
        assert!(!range_fits(u64::MAX, 2, 256));
        assert!(!range_fits(u64::MAX - 1, 16, u64::MAX));
    }

    #[test]
    fn surface_format_prefers_bgra_srgb() {
        let nl = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let offered = [
            fmt(vk::Format::B8G8R8A8_UNORM, nl),
            fmt(vk::Format::R8G8B8A8_SRGB, nl),
            fmt(vk::Format::B8G8R8A8_SRGB, nl),
        ];
        let (f, ours) = pick_surface_format(&offered).unwrap();
        assert_eq!(f.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(ours, Format::Bgra8Srgb);
    }

    #[test]
    fn unusable_surface_formats_are_rejected() {
        let offered = [
            fmt(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
        ];
        assert!(pick_surface_format(&offered).is_none());
    }
}
