// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lumen_core::{init_tracing, DeclaredPlugin, PluginRecord, PluginRegistry};
use lumen_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};
use lumen_render::shader::ShaderLibrary;
use lumen_render::sim::{HazardChecker, SimGpu};
use lumen_render::{
    BackendOptions, DeferredRenderer, FrameOutcome, FrameParams, Mesh, RenderSize, Renderer,
};
use lumen_render_vk::VkRenderer;
use tracing::{debug, error, info, warn};

use crate::config::{load_cfg, AppCfg};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    /// Vulkan in a window.
    Vk,
    /// Simulated device, no window; reports synchronization hazards.
    Sim,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "vk")]
    backend: BackendChoice,

    #[arg(long, default_value = "lumen.toml")]
    config: PathBuf,

    /// Directory holding <pass>.<stage>.spv binaries.
    #[arg(long)]
    shader_dir: Option<PathBuf>,

    /// Exit after this many presented frames; 0 runs until closed.
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

fn frame_params(cfg: &AppCfg, seconds: f32) -> FrameParams {
    FrameParams {
        exposure: cfg.render.exposure,
        ..FrameParams::spinning(seconds)
    }
}

fn plugin_registry(cfg: &AppCfg, backend: BackendChoice) -> Result<PluginRegistry> {
    let renderer_cap = match backend {
        BackendChoice::Vk => "renderer.vk",
        BackendChoice::Sim => "renderer.sim",
    };
    let builtin = [
        PluginRecord::new("core").provides("tracing"),
        PluginRecord::new("render")
            .depends_on("core")
            .provides("renderer")
            .provides(renderer_cap),
    ];
    let mut registry = PluginRegistry::new();
    for record in builtin.into_iter().chain(cfg.plugins.iter().cloned()) {
        registry
            .register(Box::new(DeclaredPlugin::new(record)))
            .context("registering plugin")?;
    }
    Ok(registry)
}

struct App {
    cfg: AppCfg,
    options: BackendOptions,
    frame_limit: u64,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    paused: bool,
    exiting: bool,
    started: Instant,
    frames: u64,
    fps_frames: u32,
    last_fps_instant: Instant,
    failure: Option<anyhow::Error>,
}

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.failure = Some(err);
        self.shutdown(event_loop);
    }

    // STRICT ORDER: renderer before window, so the surface dies first.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn init_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = lumen_platform::create_window(event_loop, "lumen")?;
        self.render_size = lumen_platform::render_size(window.inner_size());

        let wh = window.window_handle().context("window_handle")?;
        let dh = window.display_handle().context("display_handle")?;
        let renderer =
            VkRenderer::new(&wh, &dh, self.render_size, &self.options).context("vk init")?;
        info!(
            "backend = vk, vsync = {} ({:?}), shaders = {}",
            self.options.vsync,
            self.options.vsync_mode,
            self.options.shader_dir.display()
        );

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let params = frame_params(&self.cfg, self.started.elapsed().as_secs_f32());
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match renderer.render(&params) {
            Ok(FrameOutcome::Rebuilt { extent }) => {
                debug!("surface rebuilt at {}x{} before drawing", extent.width, extent.height);
            }
            Ok(outcome) => {
                debug!("{outcome:?}");
                self.frames += 1;
                self.fps_frames = self.fps_frames.saturating_add(1);
                if self.frame_limit > 0 && self.frames >= self.frame_limit {
                    info!("{} frames presented, exiting", self.frames);
                    self.shutdown(event_loop);
                }
            }
            Err(e) if e.is_recoverable() => warn!("frame skipped: {e}"),
            Err(e) => self.fail(event_loop, anyhow::Error::new(e).context("frame loop stopped")),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init_window(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }

        event_loop.set_control_flow(if self.options.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });

        self.paused = self.render_size.is_degenerate();
        info!("resumed → paused={}", self.paused);
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = lumen_platform::render_size(new_size);
                let now_paused = self.render_size.is_degenerate();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        self.render_size.width, self.render_size.height, self.paused
                    );
                }
                if let Some(r) = self.renderer.as_mut() {
                    r.resize(self.render_size);
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused = occluded || self.render_size.is_degenerate();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} → paused={}", occluded, self.paused);
                }
            }

            WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed => {
                match event.logical_key.as_ref() {
                    Key::Named(NamedKey::Escape) => self.shutdown(event_loop),
                    Key::Character("v") if !event.repeat => {
                        self.options.vsync = !self.options.vsync;
                        if let Some(r) = self.renderer.as_mut() {
                            r.set_vsync(self.options.vsync);
                        }
                    }
                    _ => {}
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                self.draw(event_loop);
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.fps_frames = 0;
            return;
        }

        // Vsync paces presentation itself; otherwise spin.
        event_loop.set_control_flow(if self.options.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.fps_frames);
            self.fps_frames = 0;
            self.last_fps_instant = now;
        }
    }
}

/// Drives the frame pipeline on the simulated device and replays its
/// command stream through the hazard checker.
fn run_headless(cfg: &AppCfg, options: &BackendOptions, frames: u64) -> Result<()> {
    let frames = if frames == 0 { 120 } else { frames };
    let gpu = SimGpu::new();
    let observer = gpu.clone();
    let mut renderer = DeferredRenderer::new(
        gpu,
        RenderSize::new(800, 600),
        ShaderLibrary::header_only(),
        &Mesh::demo(),
        options.renderer,
    )
    .context("sim renderer init")?;

    let mut presented = 0;
    let mut rebuilt = 0;
    for i in 0..frames {
        let params = frame_params(cfg, i as f32 / 60.0);
        match renderer.draw_frame(&params)? {
            FrameOutcome::Presented { .. } => presented += 1,
            FrameOutcome::PresentedThenRebuilt { .. } => {
                presented += 1;
                rebuilt += 1;
            }
            FrameOutcome::Rebuilt { .. } => rebuilt += 1,
        }
    }
    drop(renderer);

    let violations = observer.violations();
    let hazards = HazardChecker::check(&observer.events());
    info!(
        "sim: {presented} frames presented, {rebuilt} rebuilds, {} live objects after teardown",
        observer.live_objects()
    );
    for v in &violations {
        error!("sim violation: {v}");
    }
    for h in &hazards {
        error!("sim hazard on {:?}: {}", h.image, h.message);
    }
    anyhow::ensure!(
        violations.is_empty() && hazards.is_empty(),
        "{} violations, {} hazards",
        violations.len(),
        hazards.len()
    );
    Ok(())
}

fn run_windowed(cfg: AppCfg, options: BackendOptions, frame_limit: u64) -> Result<()> {
    let event_loop: EventLoop<()> = EventLoop::new()?;
    let now = Instant::now();
    let mut app = App {
        cfg,
        options,
        frame_limit,
        window: None,
        renderer: None,
        render_size: RenderSize::new(1, 1),
        paused: false,
        exiting: false,
        started: now,
        frames: 0,
        fps_frames: 0,
        last_fps_instant: now,
        failure: None,
    };
    event_loop.run_app(&mut app)?;
    app.failure.map_or(Ok(()), Err)
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    let options = cfg.render.backend_options(args.shader_dir.as_deref());

    let mut plugins = plugin_registry(&cfg, args.backend)?;
    plugins.start_all().context("starting plugins")?;
    debug!("renderers available: {:?}", plugins.find_capability("renderer"));

    let result = match args.backend {
        BackendChoice::Sim => run_headless(&cfg, &options, args.frames),
        BackendChoice::Vk => run_windowed(cfg, options, args.frames),
    };

    plugins.shutdown_all();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_plugins_start_before_configured_ones() {
        let cfg = config::parse_cfg(
            r#"
            [[plugins]]
            name = "hud"
            depends_on = ["render"]
            capabilities = ["overlay"]
            "#,
        )
        .unwrap();
        let registry = plugin_registry(&cfg, BackendChoice::Sim).unwrap();
        assert_eq!(registry.resolve_order().unwrap(), ["core", "render", "hud"]);
        assert_eq!(registry.find_capability("renderer.sim"), ["render"]);
    }

    #[test]
    fn configured_plugin_cannot_shadow_a_builtin() {
        let cfg = config::parse_cfg("[[plugins]]\nname = \"core\"").unwrap();
        assert!(plugin_registry(&cfg, BackendChoice::Vk).is_err());
    }

    #[test]
    fn headless_run_is_hazard_free() {
        let cfg = AppCfg::default();
        let mut options = cfg.render.backend_options(None);
        options.renderer.swapchain.extent_poll = std::time::Duration::ZERO;
        run_headless(&cfg, &options, 8).unwrap();
    }

    #[test]
    fn exposure_reaches_frame_params() {
        let mut cfg = AppCfg::default();
        cfg.render.exposure = 2.5;
        assert_eq!(frame_params(&cfg, 0.0).exposure, 2.5);
    }
}
