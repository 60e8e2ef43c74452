// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan backend: dynamic rendering plus synchronization2, on 1.3 core or
//! 1.2 with the matching KHR extensions.

pub mod context;
pub mod convert;
pub mod gpu;
pub mod memory;
pub mod pipeline;

use std::path::{Path, PathBuf};

use lumen_render::shader::{ShaderLibrary, ShaderSet, ShaderStage, GEOMETRY_PASS};
use lumen_render::{
    BackendOptions, DeferredRenderer, FrameOutcome, FrameParams, Mesh, RenderSize, Renderer, Result,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

pub use context::{DeviceContext, RenderPath};
pub use gpu::VkGpu;

/// Shaders compiled by the build script, when the `compile-shaders` feature is on.
const BUILT_SHADER_DIR: Option<&str> = option_env!("LUMEN_SHADER_DIR");

/// `options.shader_dir` when it holds the binaries, else the build output.
fn resolve_shader_dir(configured: &Path) -> PathBuf {
    let vertex_spv = ShaderSet::path(configured, GEOMETRY_PASS, ShaderStage::Vertex);
    if vertex_spv.is_file() {
        return configured.to_path_buf();
    }
    match BUILT_SHADER_DIR {
        Some(built) => {
            debug!(
                "vk: {} missing, using built shaders in {built}",
                vertex_spv.display()
            );
            PathBuf::from(built)
        }
        None => configured.to_path_buf(),
    }
}

pub struct VkRenderer {
    inner: DeferredRenderer<VkGpu>,
    options: BackendOptions,
}

impl VkRenderer {
    pub fn frame_pipeline(&self) -> &DeferredRenderer<VkGpu> {
        &self.inner
    }

    pub fn frame_pipeline_mut(&mut self) -> &mut DeferredRenderer<VkGpu> {
        &mut self.inner
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: &BackendOptions,
    ) -> Result<Self> {
        let shader_dir = resolve_shader_dir(&options.shader_dir);
        let shaders = ShaderLibrary::load_with(&shader_dir, pipeline::read_spirv)?;
        // SAFETY: the window outlives the renderer; the app drops the
        // renderer before the window.
        let gpu = unsafe { VkGpu::new(window, display, "Lumen", options.vsync, options.vsync_mode)? };
        let inner = DeferredRenderer::new(gpu, size, shaders, &Mesh::demo(), options.renderer)?;
        info!(
            "vk: renderer up with shaders from {}, vsync={} mode={:?}",
            shader_dir.display(),
            options.vsync,
            options.vsync_mode
        );
        Ok(Self {
            inner,
            options: options.clone(),
        })
    }

    fn resize(&mut self, size: RenderSize) {
        // A minimized window keeps the old chain until it has area again.
        if size.is_degenerate() {
            return;
        }
        self.inner.notify_resized(size);
    }

    fn render(&mut self, params: &FrameParams) -> Result<FrameOutcome> {
        self.inner.draw_frame(params)
    }

    fn set_vsync(&mut self, on: bool) {
        if self.options.vsync == on {
            return;
        }
        self.options.vsync = on;
        let mode = self.options.vsync_mode;
        self.inner.gpu_mut().set_present_mode(on, mode);
        let extent = self.inner.extent();
        self.inner.notify_resized(extent);
        info!("vk: vsync={on}, surface rebuild queued");
    }
}
