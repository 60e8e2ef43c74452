// SPDX-License-Identifier: CEPL-1.0
//! The deferred frame loop.
//!
//! Owns every per-surface and per-frame object and drives one frame at a
//! time: wait on the slot, acquire, write uniforms, record geometry and
//! lighting, submit, present, and rebuild the surface when it went stale.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::frame::{FrameRing, FRAMES_IN_FLIGHT};
use crate::gbuffer::{RenderTargetSet, TargetRole};
use crate::gpu::{
    BindingKind, BindingResource, BindingSlot, Format, Gpu, PassKind, PipelineDesc,
    ShaderVisibility,
};
use crate::layout::{UniformBlock, Vertex};
use crate::pass::{FrameRecording, OverlayPass, PassPipeline, PassScheduler};
use crate::scene::{FrameParams, GpuMesh, Mesh};
use crate::shader::ShaderLibrary;
use crate::swapchain::{Acquired, SurfaceStatus, SwapchainConfig, SwapchainManager};
use crate::uniform::UniformChannel;
use crate::RenderSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererConfig {
    pub frames_in_flight: usize,
    pub swapchain: SwapchainConfig,
    pub fence_timeout_ns: u64,
    pub acquire_timeout_ns: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: FRAMES_IN_FLIGHT,
            swapchain: SwapchainConfig::default(),
            fence_timeout_ns: u64::MAX,
            acquire_timeout_ns: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image: u32 },
    /// Presented, then the surface was rebuilt because it went stale or
    /// the window was resized.
    PresentedThenRebuilt {
        slot: usize,
        image: u32,
        extent: RenderSize,
    },
    /// Acquire found the surface stale. Nothing was recorded; the surface
    /// was rebuilt and the frame should simply be retried.
    Rebuilt { extent: RenderSize },
}

pub struct DeferredRenderer<G: Gpu> {
    gpu: G,
    cfg: RendererConfig,
    shaders: ShaderLibrary,
    swapchain: SwapchainManager,
    ring: FrameRing,
    targets: RenderTargetSet,
    uniforms: UniformChannel,
    scheduler: PassScheduler,
    geometry: PassPipeline,
    lighting: PassPipeline,
    mesh: GpuMesh,
    overlay: Option<Box<dyn OverlayPass<G>>>,
    pending_resize: Option<RenderSize>,
    frames: u64,
}

impl<G: Gpu> DeferredRenderer<G> {
    /// Builds everything in dependency order. On error, objects created so
    /// far are left to the device's own teardown.
    pub fn new(
        mut gpu: G,
        hint: RenderSize,
        shaders: ShaderLibrary,
        mesh: &Mesh,
        cfg: RendererConfig,
    ) -> Result<Self> {
        let mut sc_cfg = cfg.swapchain;
        sc_cfg.frames_in_flight = cfg.frames_in_flight as u32;

        let swapchain = SwapchainManager::initialize(&mut gpu, hint, sc_cfg)?;
        let mut targets = RenderTargetSet::new();
        targets.build(&mut gpu, swapchain.extent())?;
        let ring = FrameRing::new(&mut gpu, cfg.frames_in_flight, cfg.fence_timeout_ns)?;
        let uniforms = UniformChannel::new(&mut gpu, cfg.frames_in_flight)?;
        let mesh = GpuMesh::upload(&mut gpu, mesh)?;

        let geometry_pipeline = create_geometry_pipeline(&mut gpu, &shaders)?;
        let lighting_pipeline = create_lighting_pipeline(&mut gpu, &shaders, swapchain.format())?;
        let mut geometry = PassPipeline {
            pipeline: geometry_pipeline,
            groups: Vec::new(),
        };
        for slot in 0..cfg.frames_in_flight {
            let group = gpu.create_bind_group(
                geometry_pipeline,
                &[BindingResource::Uniform {
                    buffer: uniforms.buffer(slot),
                    size: UniformBlock::SIZE,
                }],
            )?;
            geometry.groups.push(group);
        }
        let lighting = PassPipeline {
            pipeline: lighting_pipeline,
            groups: create_lighting_groups(&mut gpu, lighting_pipeline, &targets, &uniforms, cfg.frames_in_flight)?,
        };

        let extent = swapchain.extent();
        info!(
            "deferred renderer ready: {}x{}, {} images, {} frames in flight",
            extent.width,
            extent.height,
            swapchain.image_count(),
            cfg.frames_in_flight
        );

        Ok(Self {
            gpu,
            cfg,
            shaders,
            swapchain,
            ring,
            targets,
            uniforms,
            scheduler: PassScheduler::new(),
            geometry,
            lighting,
            mesh,
            overlay: None,
            pending_resize: None,
            frames: 0,
        })
    }

    /// Flags the surface for a rebuild at `size` after the next present.
    pub fn notify_resized(&mut self, size: RenderSize) {
        debug!("resize requested: {}x{}", size.width, size.height);
        self.pending_resize = Some(size);
    }

    pub fn set_overlay(&mut self, overlay: Option<Box<dyn OverlayPass<G>>>) {
        self.overlay = overlay;
    }

    pub fn extent(&self) -> RenderSize {
        self.swapchain.extent()
    }

    pub fn frame_index(&self) -> usize {
        self.ring.current()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn targets(&self) -> &RenderTargetSet {
        &self.targets
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    /// Renders and presents one frame.
    pub fn draw_frame(&mut self, params: &FrameParams) -> Result<FrameOutcome> {
        let token = self.ring.begin_frame(&mut self.gpu)?;
        let slot = token.slot();
        let image_available = self.ring.slot(slot).image_available;

        let (image, suboptimal) = match self.swapchain.acquire_next(
            &mut self.gpu,
            self.cfg.acquire_timeout_ns,
            image_available,
        )? {
            Acquired::Ready { index, suboptimal } => (index, suboptimal),
            Acquired::Stale => {
                // The slot fence was not reset, so the next wait on it returns.
                let extent = self.rebuild_surface()?;
                return Ok(FrameOutcome::Rebuilt { extent });
            }
        };

        let block = params.uniform_block(self.swapchain.extent());
        self.uniforms.update(&mut self.gpu, slot, &block)?;

        let cmd = self.ring.commit(&mut self.gpu, &token)?;
        let present_format = self.swapchain.format();
        let extent = self.swapchain.extent();
        self.scheduler.record_frame(
            &mut self.gpu,
            FrameRecording {
                cmd,
                slot,
                extent,
                targets: &mut self.targets,
                present: self.swapchain.image_mut(image),
                present_format,
                geometry: &self.geometry,
                lighting: &self.lighting,
                mesh: &self.mesh,
                overlay: self.overlay.as_deref_mut(),
            },
        )?;

        let render_finished = self.swapchain.image(image).render_finished;
        self.ring.submit(&mut self.gpu, token, render_finished)?;
        let status = self.swapchain.present(&mut self.gpu, image)?;
        self.scheduler.complete()?;
        self.frames += 1;

        let resized = self.pending_resize.is_some();
        if suboptimal || resized || status == SurfaceStatus::Stale {
            debug!(
                "surface stale after present (suboptimal={suboptimal}, resized={resized}, status={status:?})"
            );
            let extent = self.rebuild_surface()?;
            return Ok(FrameOutcome::PresentedThenRebuilt {
                slot,
                image,
                extent,
            });
        }
        Ok(FrameOutcome::Presented { slot, image })
    }

    /// Rebuilds the swapchain and everything sized to it.
    fn rebuild_surface(&mut self) -> Result<RenderSize> {
        let hint = self
            .pending_resize
            .take()
            .unwrap_or_else(|| self.swapchain.extent());
        let rebuilt = self.swapchain.recreate(&mut self.gpu, hint)?;

        for g in self.lighting.groups.drain(..) {
            self.gpu.destroy_bind_group(g);
        }
        self.targets.build(&mut self.gpu, rebuilt.extent)?;

        if rebuilt.format_changed {
            warn!("surface format changed to {:?}", self.swapchain.format());
            self.gpu.destroy_pipeline(self.lighting.pipeline);
            self.lighting.pipeline =
                create_lighting_pipeline(&mut self.gpu, &self.shaders, self.swapchain.format())?;
        }
        self.lighting.groups = create_lighting_groups(
            &mut self.gpu,
            self.lighting.pipeline,
            &self.targets,
            &self.uniforms,
            self.cfg.frames_in_flight,
        )?;
        Ok(rebuilt.extent)
    }
}

impl<G: Gpu> Drop for DeferredRenderer<G> {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            warn!("wait_idle during teardown: {e}");
        }
        // STRICT ORDER: bind groups before pipelines and the images they
        // reference; the ring last since nothing references it.
        for pass in [&mut self.geometry, &mut self.lighting] {
            for g in pass.groups.drain(..) {
                self.gpu.destroy_bind_group(g);
            }
            self.gpu.destroy_pipeline(pass.pipeline);
        }
        self.mesh.destroy(&mut self.gpu);
        self.uniforms.destroy(&mut self.gpu);
        self.targets.teardown(&mut self.gpu);
        self.swapchain.destroy(&mut self.gpu);
        self.ring.destroy(&mut self.gpu);
        debug!("deferred renderer torn down after {} frames", self.frames);
    }
}

fn create_geometry_pipeline<G: Gpu>(gpu: &mut G, shaders: &ShaderLibrary) -> Result<crate::gpu::PipelineHandle> {
    gpu.create_pipeline(&PipelineDesc {
        label: "gbuffer",
        kind: PassKind::Geometry,
        shaders: &shaders.geometry,
        vertex_layout: Some(Vertex::LAYOUT),
        color_formats: TargetRole::COLOR.iter().map(|r| r.format()).collect(),
        depth_format: Some(TargetRole::Depth.format()),
        bindings: vec![BindingSlot {
            binding: 0,
            kind: BindingKind::UniformBuffer,
            visibility: ShaderVisibility::Vertex,
        }],
    })
}

/// Bindings 0..=3 sample the color targets in role order, 4 is the uniform block.
fn create_lighting_pipeline<G: Gpu>(
    gpu: &mut G,
    shaders: &ShaderLibrary,
    color_format: Format,
) -> Result<crate::gpu::PipelineHandle> {
    let mut bindings: Vec<_> = (0..TargetRole::COLOR.len() as u32)
        .map(|binding| BindingSlot {
            binding,
            kind: BindingKind::SampledImage,
            visibility: ShaderVisibility::Fragment,
        })
        .collect();
    bindings.push(BindingSlot {
        binding: TargetRole::COLOR.len() as u32,
        kind: BindingKind::UniformBuffer,
        visibility: ShaderVisibility::Fragment,
    });
    gpu.create_pipeline(&PipelineDesc {
        label: "lighting",
        kind: PassKind::Lighting,
        shaders: &shaders.lighting,
        vertex_layout: None,
        color_formats: vec![color_format],
        depth_format: None,
        bindings,
    })
}

fn create_lighting_groups<G: Gpu>(
    gpu: &mut G,
    pipeline: crate::gpu::PipelineHandle,
    targets: &RenderTargetSet,
    uniforms: &UniformChannel,
    slots: usize,
) -> Result<Vec<crate::gpu::BindGroupHandle>> {
    let mut resources: Vec<_> = TargetRole::COLOR
        .iter()
        .filter_map(|r| targets.get(*r))
        .map(|t| BindingResource::Sampled {
            image: t.image,
            view: t.view,
        })
        .collect();
    let mut groups = Vec::with_capacity(slots);
    for slot in 0..slots {
        resources.truncate(TargetRole::COLOR.len());
        resources.push(BindingResource::Uniform {
            buffer: uniforms.buffer(slot),
            size: UniformBlock::SIZE,
        });
        groups.push(gpu.create_bind_group(pipeline, &resources)?);
    }
    Ok(groups)
}
