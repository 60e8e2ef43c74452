// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic deferred shading frame pipeline.
//!
//! Everything here talks to the device through [`gpu::Gpu`]. The Vulkan
//! backend lives in `lumen-render-vk`; [`sim::SimGpu`] is a software device
//! for tests and headless runs.

pub mod error;
pub mod frame;
pub mod gbuffer;
pub mod gpu;
pub mod layout;
pub mod pass;
pub mod renderer;
pub mod scene;
pub mod shader;
pub mod sim;
pub mod swapchain;
pub mod transition;
pub mod uniform;

use std::path::PathBuf;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub use error::{ErrorClass, RenderError, Result};
pub use renderer::{DeferredRenderer, FrameOutcome, RendererConfig};
pub use scene::{Camera, FrameParams, Mesh, PointLight};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either side is zero, e.g. for a minimized window.
    pub fn is_degenerate(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Presentation pacing when vsync is on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    #[default]
    Fifo,
    Mailbox,
}

/// Settings a windowed backend needs at creation.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendOptions {
    pub shader_dir: PathBuf,
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
    pub renderer: RendererConfig,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            vsync: true,
            vsync_mode: VsyncMode::Fifo,
            renderer: RendererConfig::default(),
        }
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: &BackendOptions,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Records a new window size; the surface is rebuilt after the next present.
    fn resize(&mut self, size: RenderSize);

    fn render(&mut self, params: &FrameParams) -> Result<FrameOutcome>;

    /// Backends that can switch present modes rebuild the surface; others ignore it.
    fn set_vsync(&mut self, _on: bool) {}
}
