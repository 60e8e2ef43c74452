// SPDX-License-Identifier: CEPL-1.0
//! Presentable images and their lifecycle.

use std::{thread, time::Duration};

use tracing::{debug, info, warn};

use crate::error::{RenderError, Result};
use crate::gpu::{
    AcquireResult, Aspect, Format, Gpu, ImageHandle, PresentResult, SemaphoreHandle,
    SurfaceCaps, ViewHandle,
};
use crate::transition::{ImageState, TrackedImage};
use crate::RenderSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    /// Requested image count before clamping to what the surface allows.
    pub preferred_images: u32,
    /// Frames the ring keeps in flight. The chain never has fewer images.
    pub frames_in_flight: u32,
    /// Sleep between surface polls while the window has no area.
    pub extent_poll: Duration,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            preferred_images: 3,
            frames_in_flight: crate::frame::FRAMES_IN_FLIGHT as u32,
            extent_poll: Duration::from_millis(16),
        }
    }
}

/// One swapchain image plus the semaphore its rendering signals.
///
/// The semaphore belongs to the image, not to a frame slot: presentation
/// may hold it until this image comes around again.
#[derive(Debug)]
pub struct PresentableImage {
    pub index: u32,
    pub image: ImageHandle,
    pub view: ViewHandle,
    pub render_finished: SemaphoreHandle,
    state: ImageState,
}

impl TrackedImage for PresentableImage {
    fn label(&self) -> &str {
        "swapchain image"
    }
    fn image(&self) -> ImageHandle {
        self.image
    }
    fn aspect(&self) -> Aspect {
        Aspect::Color
    }
    fn state(&self) -> ImageState {
        self.state
    }
    fn set_state(&mut self, state: ImageState) {
        self.state = state;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Ready { index: u32, suboptimal: bool },
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Ready,
    Stale,
}

/// What a rebuild changed, so dependents know what to follow up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebuilt {
    pub extent: RenderSize,
    pub format_changed: bool,
}

#[derive(Debug)]
pub struct SwapchainManager {
    images: Vec<PresentableImage>,
    format: Format,
    extent: RenderSize,
    cfg: SwapchainConfig,
    live: bool,
}

impl SwapchainManager {
    pub fn initialize<G: Gpu>(gpu: &mut G, hint: RenderSize, cfg: SwapchainConfig) -> Result<Self> {
        let mut manager = Self {
            images: Vec::new(),
            format: Format::Bgra8Srgb,
            extent: RenderSize::default(),
            cfg,
            live: false,
        };
        let extent = manager.wait_for_extent(gpu, hint)?;
        manager.build(gpu, extent)?;
        Ok(manager)
    }

    pub fn extent(&self) -> RenderSize {
        self.extent
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[PresentableImage] {
        &self.images
    }

    pub fn image(&self, index: u32) -> &PresentableImage {
        &self.images[index as usize]
    }

    pub fn image_mut(&mut self, index: u32) -> &mut PresentableImage {
        &mut self.images[index as usize]
    }

    /// Asks for the next image, signaling `signal` when it is ready for writing.
    ///
    /// A stale surface yields [`Acquired::Stale`]; nothing was signaled and
    /// the caller must rebuild before trying again.
    pub fn acquire_next<G: Gpu>(
        &mut self,
        gpu: &mut G,
        timeout_ns: u64,
        signal: SemaphoreHandle,
    ) -> Result<Acquired> {
        match gpu.acquire_next_image(timeout_ns, signal)? {
            AcquireResult::Ready { index, suboptimal } => {
                if index as usize >= self.images.len() {
                    return Err(RenderError::device(
                        "acquire_next_image",
                        format!("index {index} outside chain of {}", self.images.len()),
                    ));
                }
                Ok(Acquired::Ready { index, suboptimal })
            }
            AcquireResult::OutOfDate => {
                warn!("acquire: surface out of date");
                Ok(Acquired::Stale)
            }
        }
    }

    /// Queues `index` for display once its render-finished semaphore fires.
    pub fn present<G: Gpu>(&mut self, gpu: &mut G, index: u32) -> Result<SurfaceStatus> {
        let wait = self.image(index).render_finished;
        Ok(match gpu.present(index, wait)? {
            PresentResult::Presented => SurfaceStatus::Ready,
            PresentResult::Suboptimal | PresentResult::OutOfDate => SurfaceStatus::Stale,
        })
    }

    /// Rebuilds the chain for the current surface.
    ///
    /// STRICT ORDER: wait for a usable extent, then for the device to go
    /// idle, then tear down, then build.
    pub fn recreate<G: Gpu>(&mut self, gpu: &mut G, hint: RenderSize) -> Result<Rebuilt> {
        let extent = self.wait_for_extent(gpu, hint)?;
        gpu.wait_idle()?;
        let old_format = self.format;
        self.destroy(gpu);
        self.build(gpu, extent)?;
        info!(
            "swapchain rebuilt: {}x{}, {} images",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
        Ok(Rebuilt {
            extent: self.extent,
            format_changed: old_format != self.format,
        })
    }

    /// Caller must have waited for the device to go idle.
    pub fn destroy<G: Gpu>(&mut self, gpu: &mut G) {
        for img in self.images.drain(..) {
            gpu.destroy_view(img.view);
            gpu.destroy_semaphore(img.render_finished);
        }
        if self.live {
            gpu.destroy_swapchain();
            self.live = false;
        }
    }

    fn build<G: Gpu>(&mut self, gpu: &mut G, extent: RenderSize) -> Result<()> {
        let caps = gpu.surface_caps()?;
        let count = choose_image_count(&caps, self.cfg.preferred_images, self.cfg.frames_in_flight)?;
        let chain = gpu.create_swapchain(extent, count)?;
        self.live = true;

        if chain.images.len() < self.cfg.frames_in_flight as usize {
            self.destroy(gpu);
            return Err(RenderError::device(
                "create_swapchain",
                format!(
                    "{} images cannot back {} frames in flight",
                    chain.images.len(),
                    self.cfg.frames_in_flight
                ),
            ));
        }

        for (i, image) in chain.images.iter().copied().enumerate() {
            let view = match gpu.create_view(image, chain.format) {
                Ok(v) => v,
                Err(e) => {
                    self.destroy(gpu);
                    return Err(e);
                }
            };
            let render_finished = match gpu.create_semaphore() {
                Ok(s) => s,
                Err(e) => {
                    gpu.destroy_view(view);
                    self.destroy(gpu);
                    return Err(e);
                }
            };
            self.images.push(PresentableImage {
                index: i as u32,
                image,
                view,
                render_finished,
                state: ImageState::Undefined,
            });
        }
        self.format = chain.format;
        self.extent = chain.extent;
        debug!(
            "swapchain: {:?} {}x{} x{}",
            self.format,
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
        Ok(())
    }

    /// Polls the surface until it reports an extent with area.
    ///
    /// This is the only place the pipeline blocks on the window system; a
    /// minimized window parks the render thread here.
    fn wait_for_extent<G: Gpu>(&self, gpu: &mut G, hint: RenderSize) -> Result<RenderSize> {
        let mut reported = false;
        loop {
            let caps = gpu.surface_caps()?;
            let extent = clamp_extent(&caps, hint);
            if !extent.is_degenerate() {
                return Ok(extent);
            }
            if !reported {
                info!(
                    "surface extent {}x{}: waiting for the window to regain area",
                    extent.width, extent.height
                );
                reported = true;
            }
            thread::sleep(self.cfg.extent_poll);
        }
    }
}

/// Picks the chain extent: the surface's own when it dictates one, else the
/// hint clamped into the allowed range.
pub fn clamp_extent(caps: &SurfaceCaps, hint: RenderSize) -> RenderSize {
    match caps.current_extent {
        Some(e) => e,
        None => RenderSize {
            width: hint.width.clamp(caps.min_extent.width, caps.max_extent.width),
            height: hint.height.clamp(caps.min_extent.height, caps.max_extent.height),
        },
    }
}

/// At least three images when allowed, never fewer than the surface minimum
/// or the frames in flight.
pub fn choose_image_count(caps: &SurfaceCaps, preferred: u32, frames_in_flight: u32) -> Result<u32> {
    let wanted = preferred.max(caps.min_image_count).max(frames_in_flight);
    let count = match caps.max_image_count {
        Some(max) => wanted.min(max),
        None => wanted,
    };
    if count < frames_in_flight {
        return Err(RenderError::NoSuitableDevice(format!(
            "surface allows at most {count} images, {frames_in_flight} frames in flight need more"
        )));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Event, ObjectKind, SimGpu};

    fn caps(current: Option<RenderSize>, min: u32, max: Option<u32>) -> SurfaceCaps {
        SurfaceCaps {
            current_extent: current,
            min_extent: RenderSize::new(1, 1),
            max_extent: RenderSize::new(4096, 4096),
            min_image_count: min,
            max_image_count: max,
        }
    }

    fn quick() -> SwapchainConfig {
        SwapchainConfig {
            extent_poll: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn failed_build_releases_partial_chain() {
        for (kind, max) in [(ObjectKind::Semaphore, 2), (ObjectKind::View, 1)] {
            let mut gpu = SimGpu::with_surface(RenderSize::new(640, 480), 3);
            gpu.limit_live(kind, max);
            let err = SwapchainManager::initialize(&mut gpu, RenderSize::new(640, 480), quick())
                .unwrap_err();
            assert!(matches!(err, RenderError::Device { .. }), "{kind:?}");
            assert_eq!(gpu.live_objects(), 0, "{kind:?}");
            assert!(gpu.violations().is_empty(), "{kind:?}");
            assert!(gpu.events().contains(&Event::SwapchainDestroyed));
        }
    }

    #[test]
    fn image_count_prefers_three() {
        assert_eq!(choose_image_count(&caps(None, 2, Some(8)), 3, 2).unwrap(), 3);
        assert_eq!(choose_image_count(&caps(None, 4, None), 3, 2).unwrap(), 4);
        assert_eq!(choose_image_count(&caps(None, 2, Some(2)), 3, 2).unwrap(), 2);
    }

    #[test]
    fn image_count_below_ring_depth_is_fatal() {
        let err = choose_image_count(&caps(None, 1, Some(1)), 3, 2).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn extent_follows_surface_or_clamped_hint() {
        let fixed = RenderSize::new(800, 600);
        assert_eq!(clamp_extent(&caps(Some(fixed), 2, None), RenderSize::new(5, 5)), fixed);
        assert_eq!(
            clamp_extent(&caps(None, 2, None), RenderSize::new(9000, 300)),
            RenderSize::new(4096, 300)
        );
    }

    #[test]
    fn one_render_finished_semaphore_per_image() {
        let mut gpu = SimGpu::with_surface(RenderSize::new(800, 600), 3);
        let sc = SwapchainManager::initialize(&mut gpu, RenderSize::new(800, 600), quick()).unwrap();
        assert_eq!(sc.image_count(), 3);
        let mut sems: Vec<_> = sc.images().iter().map(|i| i.render_finished).collect();
        sems.sort();
        sems.dedup();
        assert_eq!(sems.len(), 3);
        assert!(sc.images().iter().all(|i| i.state() == ImageState::Undefined));
    }

    #[test]
    fn degenerate_extent_is_polled_until_area_returns() {
        let mut gpu = SimGpu::with_surface(RenderSize::new(800, 600), 3);
        let mut sc =
            SwapchainManager::initialize(&mut gpu, RenderSize::new(800, 600), quick()).unwrap();
        gpu.script_extents([
            RenderSize::new(0, 0),
            RenderSize::new(0, 0),
            RenderSize::new(1024, 768),
        ]);
        let rebuilt = sc.recreate(&mut gpu, RenderSize::new(800, 600)).unwrap();
        assert_eq!(rebuilt.extent, RenderSize::new(1024, 768));
        assert!(!rebuilt.format_changed);

        let created: Vec<_> = gpu
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::SwapchainCreated { extent, .. } => Some(*extent),
                _ => None,
            })
            .collect();
        assert_eq!(created, [RenderSize::new(800, 600), RenderSize::new(1024, 768)]);
    }

    #[test]
    fn recreate_waits_idle_before_teardown() {
        let mut gpu = SimGpu::with_surface(RenderSize::new(640, 480), 3);
        let mut sc =
            SwapchainManager::initialize(&mut gpu, RenderSize::new(640, 480), quick()).unwrap();
        sc.recreate(&mut gpu, RenderSize::new(640, 480)).unwrap();
        let ev = gpu.events();
        let idle = ev.iter().position(|e| matches!(e, Event::WaitIdle)).unwrap();
        let gone = ev
            .iter()
            .position(|e| matches!(e, Event::SwapchainDestroyed))
            .unwrap();
        assert!(idle < gone);
    }

    #[test]
    fn repeated_recreation_leaks_nothing() {
        let mut gpu = SimGpu::with_surface(RenderSize::new(640, 480), 3);
        let mut sc =
            SwapchainManager::initialize(&mut gpu, RenderSize::new(640, 480), quick()).unwrap();
        let baseline = gpu.live_objects();
        for _ in 0..4 {
            sc.recreate(&mut gpu, RenderSize::new(640, 480)).unwrap();
            assert_eq!(gpu.live_objects(), baseline);
        }
        sc.destroy(&mut gpu);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn stale_acquire_signals_nothing() {
        let mut gpu = SimGpu::with_surface(RenderSize::new(640, 480), 3);
        let mut sc =
            SwapchainManager::initialize(&mut gpu, RenderSize::new(640, 480), quick()).unwrap();
        let sem = gpu.create_semaphore().unwrap();
        gpu.script_acquire_out_of_date(1);
        assert_eq!(sc.acquire_next(&mut gpu, u64::MAX, sem).unwrap(), Acquired::Stale);
        assert!(!gpu.semaphore_signaled(sem));
        assert!(matches!(
            sc.acquire_next(&mut gpu, u64::MAX, sem).unwrap(),
            Acquired::Ready { index: 0, suboptimal: false }
        ));
        assert!(gpu.semaphore_signaled(sem));
    }
}
