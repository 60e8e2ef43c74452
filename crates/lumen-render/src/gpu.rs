// SPDX-License-Identifier: CEPL-1.0
//! Device seam.
//!
//! The frame pipeline talks to the device only through [`Gpu`]. Handles are
//! opaque `u64` values; a backend decides what they point at.

use bitflags::bitflags;

use crate::error::Result;
use crate::layout::VertexLayout;
use crate::shader::ShaderSet;
use crate::transition::{ImageState, Stages, TransitionScope};
use crate::RenderSize;

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

handles!(
    ImageHandle,
    ViewHandle,
    BufferHandle,
    FenceHandle,
    SemaphoreHandle,
    CommandBufferHandle,
    PipelineHandle,
    /// A descriptor set bound to one pipeline's layout.
    BindGroupHandle,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba32Float,
    Rgba16Float,
    Rgba8Unorm,
    D32Float,
    Bgra8Srgb,
    Rgba8Srgb,
    Bgra8Unorm,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float)
    }

    pub fn aspect(self) -> Aspect {
        if self.is_depth() {
            Aspect::Depth
        } else {
            Aspect::Color
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aspect {
    Color,
    Depth,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_ATTACHMENT = 1 << 1;
        const SAMPLED = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: &'static str,
    pub extent: RenderSize,
    pub format: Format,
    pub usage: ImageUsage,
}

/// Surface capabilities as reported for the current window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCaps {
    /// `None` when the window system lets the swapchain pick its own size.
    pub current_extent: Option<RenderSize>,
    pub min_extent: RenderSize,
    pub max_extent: RenderSize,
    pub min_image_count: u32,
    /// `None` means no upper bound.
    pub max_image_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainImages {
    pub images: Vec<ImageHandle>,
    pub format: Format,
    pub extent: RenderSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Ready { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Clear(ClearValue),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub image: ImageHandle,
    pub view: ViewHandle,
    pub state: ImageState,
    pub load: LoadOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingDesc {
    pub extent: RenderSize,
    pub colors: Vec<Attachment>,
    pub depth: Option<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub aspect: Aspect,
    pub old: ImageState,
    pub new: ImageState,
    pub scope: TransitionScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    UniformBuffer,
    SampledImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderVisibility {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlot {
    pub binding: u32,
    pub kind: BindingKind,
    pub visibility: ShaderVisibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    Uniform { buffer: BufferHandle, size: u64 },
    Sampled { image: ImageHandle, view: ViewHandle },
}

/// Which stage of the frame a pipeline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Geometry,
    Lighting,
    Overlay,
}

pub struct PipelineDesc<'a> {
    pub label: &'static str,
    pub kind: PassKind,
    pub shaders: &'a ShaderSet,
    pub vertex_layout: Option<VertexLayout>,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub bindings: Vec<BindingSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub command_buffer: CommandBufferHandle,
    pub wait: SemaphoreHandle,
    pub wait_stages: Stages,
    pub signal: SemaphoreHandle,
    pub fence: FenceHandle,
}

/// Result of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Everything the frame pipeline needs from a device.
///
/// Calls that record into a command buffer take the handle returned by the
/// matching `begin_commands`. Swapchain calls act on the single surface the
/// device was created for.
pub trait Gpu {
    // sync
    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle>;
    fn destroy_fence(&mut self, fence: FenceHandle);
    fn wait_for_fence(&mut self, fence: FenceHandle, timeout_ns: u64) -> Result<FenceStatus>;
    fn reset_fence(&mut self, fence: FenceHandle) -> Result<()>;
    fn create_semaphore(&mut self) -> Result<SemaphoreHandle>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);
    fn wait_idle(&mut self) -> Result<()>;

    // commands
    fn allocate_command_buffer(&mut self) -> Result<CommandBufferHandle>;
    fn free_command_buffer(&mut self, cmd: CommandBufferHandle);
    fn begin_commands(&mut self, cmd: CommandBufferHandle) -> Result<()>;
    fn end_commands(&mut self, cmd: CommandBufferHandle) -> Result<()>;
    fn submit(&mut self, submission: &Submission) -> Result<()>;

    // surface
    fn surface_caps(&mut self) -> Result<SurfaceCaps>;
    fn create_swapchain(&mut self, extent: RenderSize, image_count: u32) -> Result<SwapchainImages>;
    fn destroy_swapchain(&mut self);
    fn acquire_next_image(
        &mut self,
        timeout_ns: u64,
        signal: SemaphoreHandle,
    ) -> Result<AcquireResult>;
    fn present(&mut self, index: u32, wait: SemaphoreHandle) -> Result<PresentResult>;

    // resources
    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle>;
    fn destroy_image(&mut self, image: ImageHandle);
    fn create_view(&mut self, image: ImageHandle, format: Format) -> Result<ViewHandle>;
    fn destroy_view(&mut self, view: ViewHandle);
    fn create_buffer(&mut self, size: u64, usage: BufferUsage, host_visible: bool)
        -> Result<BufferHandle>;
    fn upload_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()>;
    fn write_mapped(&mut self, buffer: BufferHandle, offset: u64, bytes: &[u8]) -> Result<()>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // pipelines
    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);
    fn create_bind_group(
        &mut self,
        pipeline: PipelineHandle,
        resources: &[BindingResource],
    ) -> Result<BindGroupHandle>;
    fn destroy_bind_group(&mut self, group: BindGroupHandle);

    // recording
    fn cmd_barriers(&mut self, cmd: CommandBufferHandle, barriers: &[ImageBarrier]);
    fn cmd_begin_rendering(&mut self, cmd: CommandBufferHandle, desc: &RenderingDesc);
    fn cmd_end_rendering(&mut self, cmd: CommandBufferHandle);
    /// Binds `pipeline` and sets its viewport and scissor to `extent`.
    /// An unknown handle is an error, never a silent skip.
    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        extent: RenderSize,
    ) -> Result<()>;
    fn cmd_bind_group(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        group: BindGroupHandle,
    ) -> Result<()>;
    fn cmd_bind_mesh(&mut self, cmd: CommandBufferHandle, vertices: BufferHandle, indices: BufferHandle);
    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32);
    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32);
}
