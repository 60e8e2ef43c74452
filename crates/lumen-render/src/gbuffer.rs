// SPDX-License-Identifier: CEPL-1.0
//! Geometry buffer: the offscreen targets the geometry pass fills and the
//! lighting pass samples.

use tracing::debug;

use crate::error::{RenderError, Result};
use crate::gpu::{Aspect, ClearValue, Format, Gpu, ImageDesc, ImageHandle, ImageUsage, ViewHandle};
use crate::transition::{ImageState, TrackedImage};
use crate::RenderSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetRole {
    Position,
    Normal,
    Albedo,
    Material,
    Depth,
}

impl TargetRole {
    /// Color roles in attachment order. Lighting samples them in the same order.
    pub const COLOR: [TargetRole; 4] = [
        TargetRole::Position,
        TargetRole::Normal,
        TargetRole::Albedo,
        TargetRole::Material,
    ];

    pub const ALL: [TargetRole; 5] = [
        TargetRole::Position,
        TargetRole::Normal,
        TargetRole::Albedo,
        TargetRole::Material,
        TargetRole::Depth,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TargetRole::Position => "gbuffer.position",
            TargetRole::Normal => "gbuffer.normal",
            TargetRole::Albedo => "gbuffer.albedo",
            TargetRole::Material => "gbuffer.material",
            TargetRole::Depth => "gbuffer.depth",
        }
    }

    pub fn format(self) -> Format {
        match self {
            TargetRole::Position => Format::Rgba32Float,
            TargetRole::Normal => Format::Rgba16Float,
            TargetRole::Albedo | TargetRole::Material => Format::Rgba8Unorm,
            TargetRole::Depth => Format::D32Float,
        }
    }

    /// What a pixel holds when no geometry covered it.
    ///
    /// Normals default to up; material is rough, non-metallic, unoccluded.
    pub fn clear_value(self) -> ClearValue {
        match self {
            TargetRole::Position | TargetRole::Albedo => ClearValue::Color([0.0; 4]),
            TargetRole::Normal => ClearValue::Color([0.0, 1.0, 0.0, 0.0]),
            TargetRole::Material => ClearValue::Color([1.0, 0.0, 1.0, 0.0]),
            TargetRole::Depth => ClearValue::Depth(1.0),
        }
    }

    fn usage(self) -> ImageUsage {
        match self {
            TargetRole::Depth => ImageUsage::DEPTH_ATTACHMENT,
            _ => ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
        }
    }
}

#[derive(Debug)]
pub struct RenderTarget {
    pub role: TargetRole,
    pub image: ImageHandle,
    pub view: ViewHandle,
    pub format: Format,
    state: ImageState,
}

impl TrackedImage for RenderTarget {
    fn label(&self) -> &str {
        self.role.label()
    }
    fn image(&self) -> ImageHandle {
        self.image
    }
    fn aspect(&self) -> Aspect {
        self.format.aspect()
    }
    fn state(&self) -> ImageState {
        self.state
    }
    fn set_state(&mut self, state: ImageState) {
        self.state = state;
    }
}

/// Targets sized to the swapchain extent, rebuilt whenever it changes.
#[derive(Debug, Default)]
pub struct RenderTargetSet {
    targets: Vec<RenderTarget>,
    extent: Option<RenderSize>,
}

impl RenderTargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates all five targets at `extent`, tearing down any previous set.
    pub fn build<G: Gpu>(&mut self, gpu: &mut G, extent: RenderSize) -> Result<()> {
        if extent.is_degenerate() {
            return Err(RenderError::DegenerateExtent {
                width: extent.width,
                height: extent.height,
            });
        }
        self.teardown(gpu);

        for role in TargetRole::ALL {
            let format = role.format();
            let image = gpu.create_image(&ImageDesc {
                label: role.label(),
                extent,
                format,
                usage: role.usage(),
            })?;
            let view = match gpu.create_view(image, format) {
                Ok(v) => v,
                Err(e) => {
                    gpu.destroy_image(image);
                    self.teardown(gpu);
                    return Err(e);
                }
            };
            self.targets.push(RenderTarget {
                role,
                image,
                view,
                format,
                state: ImageState::Undefined,
            });
        }
        self.extent = Some(extent);
        debug!("gbuffer built at {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Caller must have waited for the device to go idle.
    pub fn teardown<G: Gpu>(&mut self, gpu: &mut G) {
        for t in self.targets.drain(..) {
            gpu.destroy_view(t.view);
            gpu.destroy_image(t.image);
        }
        self.extent = None;
    }

    pub fn is_built(&self) -> bool {
        self.extent.is_some()
    }

    pub fn extent(&self) -> Option<RenderSize> {
        self.extent
    }

    pub fn get(&self, role: TargetRole) -> Option<&RenderTarget> {
        self.targets.iter().find(|t| t.role == role)
    }

    pub fn targets(&self) -> &[RenderTarget] {
        &self.targets
    }

    pub fn targets_mut(&mut self) -> &mut [RenderTarget] {
        &mut self.targets
    }

    pub fn color_targets_mut(&mut self) -> impl Iterator<Item = &mut RenderTarget> {
        self.targets.iter_mut().filter(|t| t.role != TargetRole::Depth)
    }

    pub fn depth_mut(&mut self) -> Option<&mut RenderTarget> {
        self.targets.iter_mut().find(|t| t.role == TargetRole::Depth)
    }
}
