// SPDX-License-Identifier: CEPL-1.0
//! Per-frame pass ordering.
//!
//! A frame moves through
//! `Idle -> GeometryRecording -> GeometryComplete -> LightingRecording ->
//! LightingComplete -> Presented -> Idle`. Each step is checked, so a pass
//! can never be recorded out of order or twice in one frame.

use tracing::trace;

use crate::error::{RenderError, Result};
use crate::gbuffer::{RenderTargetSet, TargetRole};
use crate::gpu::{
    Attachment, BindGroupHandle, ClearValue, CommandBufferHandle, Format, Gpu, ImageHandle,
    LoadOp, PipelineHandle, RenderingDesc, ViewHandle,
};
use crate::scene::GpuMesh;
use crate::swapchain::PresentableImage;
use crate::transition::{transition, ImageState, Stages, TrackedImage};
use crate::RenderSize;

/// Color the lighting pass clears the swapchain image to before shading.
pub const BACKGROUND: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Vertices in the full-screen triangle the lighting pass draws.
pub const FULLSCREEN_VERTICES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Idle,
    GeometryRecording,
    GeometryComplete,
    LightingRecording,
    LightingComplete,
    Presented,
}

/// A pipeline plus one bind group per frame slot.
#[derive(Debug)]
pub struct PassPipeline {
    pub pipeline: PipelineHandle,
    pub groups: Vec<BindGroupHandle>,
}

/// The swapchain image as seen by an overlay.
#[derive(Debug, Clone, Copy)]
pub struct OverlayTarget {
    pub image: ImageHandle,
    pub view: ViewHandle,
    pub format: Format,
    pub extent: RenderSize,
}

/// Extra drawing composited on top of the lit image before presentation.
///
/// The target is in the color attachment state when `record` runs and must
/// be left there. Contents written by lighting must be loaded, not cleared.
pub trait OverlayPass<G: Gpu> {
    fn name(&self) -> &str;
    fn record(&mut self, gpu: &mut G, cmd: CommandBufferHandle, target: &OverlayTarget) -> Result<()>;
}

/// Everything one frame's recording touches.
pub struct FrameRecording<'a, G: Gpu> {
    pub cmd: CommandBufferHandle,
    pub slot: usize,
    pub extent: RenderSize,
    pub targets: &'a mut RenderTargetSet,
    pub present: &'a mut PresentableImage,
    pub present_format: Format,
    pub geometry: &'a PassPipeline,
    pub lighting: &'a PassPipeline,
    pub mesh: &'a GpuMesh,
    pub overlay: Option<&'a mut (dyn OverlayPass<G> + 'static)>,
}

#[derive(Debug)]
pub struct PassScheduler {
    state: PassState,
}

impl Default for PassScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PassScheduler {
    pub fn new() -> Self {
        Self {
            state: PassState::Idle,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    fn enter(&mut self, from: PassState, to: PassState) -> Result<()> {
        if self.state != from {
            return Err(RenderError::InvalidState(format!(
                "pass scheduler cannot go {:?} -> {to:?}, currently {:?}",
                from, self.state
            )));
        }
        trace!("pass {:?} -> {:?}", from, to);
        self.state = to;
        Ok(())
    }

    /// Records geometry, lighting, the optional overlay and the final
    /// transition to present into `rec.cmd`.
    ///
    /// Leaves the scheduler in [`PassState::Presented`]; call
    /// [`complete`](Self::complete) once the image was handed to the surface.
    pub fn record_frame<G: Gpu>(&mut self, gpu: &mut G, rec: FrameRecording<'_, G>) -> Result<()> {
        let result = self.record_passes(gpu, rec);
        if result.is_err() {
            self.state = PassState::Idle;
        }
        result
    }

    pub fn complete(&mut self) -> Result<()> {
        self.enter(PassState::Presented, PassState::Idle)
    }

    fn record_passes<G: Gpu>(&mut self, gpu: &mut G, rec: FrameRecording<'_, G>) -> Result<()> {
        let FrameRecording {
            cmd,
            slot,
            extent,
            targets,
            present,
            present_format,
            geometry,
            lighting,
            mesh,
            overlay,
        } = rec;

        if !targets.is_built() {
            return Err(RenderError::InvalidState(
                "geometry buffer was not built".into(),
            ));
        }

        self.enter(PassState::Idle, PassState::GeometryRecording)?;
        record_geometry(gpu, cmd, slot, extent, targets, geometry, mesh)?;
        self.enter(PassState::GeometryRecording, PassState::GeometryComplete)?;

        self.enter(PassState::GeometryComplete, PassState::LightingRecording)?;
        record_lighting(gpu, cmd, slot, extent, targets, present, lighting)?;
        self.enter(PassState::LightingRecording, PassState::LightingComplete)?;

        if let Some(overlay) = overlay {
            let barriers: Vec<_> =
                transition(present, ImageState::ColorAttachment, Stages::COLOR_ATTACHMENT_OUTPUT)?
                .into_iter()
                .collect();
            gpu.cmd_barriers(cmd, &barriers);
            trace!("overlay {}", overlay.name());
            overlay.record(
                gpu,
                cmd,
                &OverlayTarget {
                    image: present.image,
                    view: present.view,
                    format: present_format,
                    extent,
                },
            )?;
        }

        let barriers: Vec<_> = transition(present, ImageState::Present, Stages::BOTTOM_OF_PIPE)?
            .into_iter()
            .collect();
        gpu.cmd_barriers(cmd, &barriers);
        self.enter(PassState::LightingComplete, PassState::Presented)
    }
}

fn group_for(pass: &PassPipeline, slot: usize) -> Result<BindGroupHandle> {
    pass.groups.get(slot).copied().ok_or_else(|| {
        RenderError::InvalidState(format!("no bind group for frame slot {slot}"))
    })
}

fn record_geometry<G: Gpu>(
    gpu: &mut G,
    cmd: CommandBufferHandle,
    slot: usize,
    extent: RenderSize,
    targets: &mut RenderTargetSet,
    pass: &PassPipeline,
    mesh: &GpuMesh,
) -> Result<()> {
    let mut barriers = Vec::with_capacity(TargetRole::ALL.len());
    for t in targets.targets_mut() {
        let (to, stage) = if t.role == TargetRole::Depth {
            (ImageState::DepthAttachment, Stages::EARLY_FRAGMENT_TESTS)
        } else {
            (ImageState::ColorAttachment, Stages::COLOR_ATTACHMENT_OUTPUT)
        };
        barriers.extend(transition(t, to, stage)?);
    }
    gpu.cmd_barriers(cmd, &barriers);

    let mut colors = Vec::with_capacity(TargetRole::COLOR.len());
    let mut depth = None;
    for t in targets.targets() {
        let att = Attachment {
            image: t.image,
            view: t.view,
            state: t.state(),
            load: LoadOp::Clear(t.role.clear_value()),
        };
        if t.role == TargetRole::Depth {
            depth = Some(att);
        } else {
            colors.push(att);
        }
    }

    gpu.cmd_begin_rendering(
        cmd,
        &RenderingDesc {
            extent,
            colors,
            depth,
        },
    );
    gpu.cmd_bind_pipeline(cmd, pass.pipeline, extent)?;
    gpu.cmd_bind_group(cmd, pass.pipeline, group_for(pass, slot)?)?;
    if mesh.index_count > 0 {
        gpu.cmd_bind_mesh(cmd, mesh.vertices, mesh.indices);
        gpu.cmd_draw_indexed(cmd, mesh.index_count);
    }
    gpu.cmd_end_rendering(cmd);
    Ok(())
}

fn record_lighting<G: Gpu>(
    gpu: &mut G,
    cmd: CommandBufferHandle,
    slot: usize,
    extent: RenderSize,
    targets: &mut RenderTargetSet,
    present: &mut PresentableImage,
    pass: &PassPipeline,
) -> Result<()> {
    let mut barriers = Vec::with_capacity(TargetRole::COLOR.len() + 1);
    for t in targets.color_targets_mut() {
        barriers.extend(transition(t, ImageState::ShaderRead, Stages::FRAGMENT_SHADER)?);
    }
    barriers.extend(transition(
        present,
        ImageState::ColorAttachment,
        Stages::COLOR_ATTACHMENT_OUTPUT,
    )?);
    gpu.cmd_barriers(cmd, &barriers);

    gpu.cmd_begin_rendering(
        cmd,
        &RenderingDesc {
            extent,
            colors: vec![Attachment {
                image: present.image,
                view: present.view,
                state: ImageState::ColorAttachment,
                load: LoadOp::Clear(ClearValue::Color(BACKGROUND)),
            }],
            depth: None,
        },
    );
    gpu.cmd_bind_pipeline(cmd, pass.pipeline, extent)?;
    gpu.cmd_bind_group(cmd, pass.pipeline, group_for(pass, slot)?)?;
    gpu.cmd_draw(cmd, FULLSCREEN_VERTICES);
    gpu.cmd_end_rendering(cmd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scene::Mesh;
    use crate::sim::SimGpu;
    use crate::swapchain::{SwapchainConfig, SwapchainManager};

    /// Legal steps in order; `complete` is the last one.
    const STEPS: [(PassState, PassState); 6] = [
        (PassState::Idle, PassState::GeometryRecording),
        (PassState::GeometryRecording, PassState::GeometryComplete),
        (PassState::GeometryComplete, PassState::LightingRecording),
        (PassState::LightingRecording, PassState::LightingComplete),
        (PassState::LightingComplete, PassState::Presented),
        (PassState::Presented, PassState::Idle),
    ];

    const STATES: [PassState; 6] = [
        PassState::Idle,
        PassState::GeometryRecording,
        PassState::GeometryComplete,
        PassState::LightingRecording,
        PassState::LightingComplete,
        PassState::Presented,
    ];

    #[test]
    fn complete_requires_a_recorded_frame() {
        let mut s = PassScheduler::new();
        assert!(matches!(s.complete(), Err(RenderError::InvalidState(_))));
        assert_eq!(s.state(), PassState::Idle);
    }

    #[test]
    fn steps_must_follow_the_fixed_order() {
        let mut s = PassScheduler::new();
        assert!(s
            .enter(PassState::GeometryComplete, PassState::LightingRecording)
            .is_err());
        s.enter(PassState::Idle, PassState::GeometryRecording).unwrap();
        assert!(s.enter(PassState::Idle, PassState::GeometryRecording).is_err());
        assert_eq!(s.state(), PassState::GeometryRecording);
    }

    #[test]
    fn every_out_of_order_step_is_rejected_and_leaves_state_alone() {
        for (from, to) in STEPS {
            for current in STATES.into_iter().filter(|s| *s != from) {
                let mut s = PassScheduler { state: current };
                let err = s.enter(from, to).unwrap_err();
                assert!(
                    matches!(err, RenderError::InvalidState(_)),
                    "{current:?}: {from:?} -> {to:?}"
                );
                assert_eq!(s.state(), current);
            }
        }
    }

    #[test]
    fn full_cycle_walks_every_step_once() {
        let mut s = PassScheduler::new();
        for (from, to) in STEPS {
            s.enter(from, to).unwrap();
        }
        assert_eq!(s.state(), PassState::Idle);
    }

    #[test]
    fn unknown_pipeline_fails_recording_and_resets_the_scheduler() {
        let mut gpu = SimGpu::new();
        let extent = RenderSize::new(64, 64);
        let mut targets = RenderTargetSet::new();
        targets.build(&mut gpu, extent).unwrap();
        let mut chain = SwapchainManager::initialize(
            &mut gpu,
            extent,
            SwapchainConfig {
                extent_poll: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
        let mesh = GpuMesh::upload(&mut gpu, &Mesh::demo()).unwrap();
        let ghost = PassPipeline {
            pipeline: PipelineHandle(4242),
            groups: vec![BindGroupHandle(4243)],
        };
        let cmd = gpu.allocate_command_buffer().unwrap();
        gpu.begin_commands(cmd).unwrap();

        let present_format = chain.format();
        let mut s = PassScheduler::new();
        let err = s
            .record_frame(
                &mut gpu,
                FrameRecording {
                    cmd,
                    slot: 0,
                    extent,
                    targets: &mut targets,
                    present: chain.image_mut(0),
                    present_format,
                    geometry: &ghost,
                    lighting: &ghost,
                    mesh: &mesh,
                    overlay: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidState(_)));
        assert_eq!(s.state(), PassState::Idle);
        assert!(gpu
            .violations()
            .iter()
            .any(|v| v.contains("unknown pipeline 4242")));
    }

    #[test]
    fn missing_slot_group_is_an_error() {
        let pass = PassPipeline {
            pipeline: PipelineHandle(1),
            groups: vec![BindGroupHandle(2)],
        };
        assert_eq!(group_for(&pass, 0).unwrap(), BindGroupHandle(2));
        assert!(matches!(group_for(&pass, 1), Err(RenderError::InvalidState(_))));
    }
}
