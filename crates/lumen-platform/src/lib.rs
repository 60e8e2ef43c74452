// SPDX-License-Identifier: CEPL-1.0
//! Windowing layer: winit, plus the glue between its sizes and the renderer's.

pub use winit;

use anyhow::{Context, Result};
use lumen_render::RenderSize;
use tracing::info;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

pub const DEFAULT_WINDOW_SIZE: LogicalSize<u32> = LogicalSize::new(1280, 720);

/// Window size in physical pixels as the renderer sees it. A minimized
/// window reports zero on at least one side.
pub fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

pub fn create_window(event_loop: &ActiveEventLoop, title: &str) -> Result<Window> {
    let attrs = Window::default_attributes()
        .with_title(title)
        .with_inner_size(DEFAULT_WINDOW_SIZE);
    let window = event_loop.create_window(attrs).context("create_window")?;
    let size = window.inner_size();
    info!(
        "window {title:?} {}x{} @ scale {:.2}",
        size.width,
        size.height,
        window.scale_factor()
    );
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimized_sizes_are_degenerate() {
        assert!(render_size(PhysicalSize::new(0, 480)).is_degenerate());
        assert!(render_size(PhysicalSize::new(640, 0)).is_degenerate());
        assert_eq!(render_size(PhysicalSize::new(640, 480)), RenderSize::new(640, 480));
    }
}
