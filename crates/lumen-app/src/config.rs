// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lumen_core::PluginRecord;
use lumen_render::swapchain::SwapchainConfig;
use lumen_render::{BackendOptions, RendererConfig, VsyncMode};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RenderCfg {
    pub vsync: bool,
    pub vsync_mode: VsyncModeCfg,
    pub shader_dir: Option<PathBuf>,
    pub exposure: f32,
    /// Sleep between surface polls while the window is minimized.
    pub extent_poll_ms: u64,
    pub swapchain_images: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncModeCfg {
    #[default]
    Fifo,
    Mailbox,
}

#[derive(Debug, Deserialize, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub plugins: Vec<PluginRecord>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            vsync: true,
            vsync_mode: VsyncModeCfg::Fifo,
            shader_dir: None,
            exposure: 1.0,
            extent_poll_ms: 16,
            swapchain_images: 3,
        }
    }
}

impl From<VsyncModeCfg> for VsyncMode {
    fn from(m: VsyncModeCfg) -> Self {
        match m {
            VsyncModeCfg::Fifo => VsyncMode::Fifo,
            VsyncModeCfg::Mailbox => VsyncMode::Mailbox,
        }
    }
}

impl RenderCfg {
    /// `shader_override` (from the command line) wins over the file.
    pub fn backend_options(&self, shader_override: Option<&Path>) -> BackendOptions {
        let defaults = BackendOptions::default();
        let shader_dir = shader_override
            .map(Path::to_path_buf)
            .or_else(|| self.shader_dir.clone())
            .unwrap_or(defaults.shader_dir);
        BackendOptions {
            shader_dir,
            vsync: self.vsync,
            vsync_mode: self.vsync_mode.into(),
            renderer: RendererConfig {
                swapchain: SwapchainConfig {
                    preferred_images: self.swapchain_images,
                    extent_poll: Duration::from_millis(self.extent_poll_ms),
                    ..defaults.renderer.swapchain
                },
                ..defaults.renderer
            },
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

/// Missing or malformed files fall back to defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match parse_cfg(&s) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("{} is invalid, using defaults: {e}", path.display());
                AppCfg::default()
            }
        },
        Err(e) => {
            warn!("{} not read ({e}), using defaults", path.display());
            AppCfg::default()
        }
    }
}
