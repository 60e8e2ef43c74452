// SPDX-License-Identifier: CEPL-1.0
//! Replays a [`SimGpu`](super::SimGpu) event log and reports every image
//! access that no barrier ordered after the previous one.

use std::collections::HashMap;

use super::Event;
use crate::gpu::{ImageHandle, LoadOp, PassKind};
use crate::transition::{Access, ImageState, Stages};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hazard {
    pub image: ImageHandle,
    pub message: String,
}

#[derive(Debug, Clone)]
struct Track {
    layout: ImageState,
    /// Last write not yet covered by a barrier.
    unsynced_write: Option<(Stages, Access)>,
    /// Reads since the last barrier.
    unsynced_reads: Stages,
    /// What the last barrier made visible.
    visible_stages: Stages,
    visible_access: Access,
    /// Accessed since creation or acquire.
    touched: bool,
}

impl Track {
    fn fresh(layout: ImageState) -> Self {
        Self {
            layout,
            unsynced_write: None,
            unsynced_reads: Stages::empty(),
            visible_stages: Stages::empty(),
            visible_access: Access::empty(),
            touched: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct HazardChecker {
    images: HashMap<ImageHandle, Track>,
    swapchain: Vec<ImageHandle>,
    hazards: Vec<Hazard>,
}

impl HazardChecker {
    pub fn check(events: &[Event]) -> Vec<Hazard> {
        let mut c = Self::default();
        for e in events {
            c.replay(e);
        }
        c.hazards
    }

    fn flag(&mut self, image: ImageHandle, message: String) {
        self.hazards.push(Hazard { image, message });
    }

    fn replay(&mut self, e: &Event) {
        match e {
            Event::ImageCreated { image, .. } => {
                self.images.insert(*image, Track::fresh(ImageState::Undefined));
            }
            Event::SwapchainCreated { images, .. } => {
                self.swapchain = images.clone();
                for i in images {
                    self.images.insert(*i, Track::fresh(ImageState::Undefined));
                }
            }
            Event::Acquire { index, .. } => {
                if let Some(&image) = self.swapchain.get(*index as usize) {
                    let t = self
                        .images
                        .entry(image)
                        .or_insert_with(|| Track::fresh(ImageState::Undefined));
                    // The acquire semaphore is waited on at color output, so
                    // the first barrier must chain with that stage.
                    t.unsynced_write = None;
                    t.unsynced_reads = Stages::COLOR_ATTACHMENT_OUTPUT;
                    t.touched = true;
                }
            }
            Event::Barrier { barrier, .. } => {
                let image = barrier.image;
                let Some(t) = self.images.get(&image).cloned() else {
                    return self.flag(image, "barrier on unknown image".into());
                };
                let s = barrier.scope;
                if barrier.old != ImageState::Undefined && barrier.old != t.layout {
                    self.flag(
                        image,
                        format!("barrier expects {:?}, image is {:?}", barrier.old, t.layout),
                    );
                }
                if let Some((ws, wa)) = t.unsynced_write {
                    if !s.src_stages.contains(ws) || !s.src_access.contains(wa) {
                        self.flag(
                            image,
                            format!("{:?}->{:?} does not cover write at {ws:?}", barrier.old, barrier.new),
                        );
                    }
                }
                if !s.src_stages.contains(t.unsynced_reads) {
                    self.flag(
                        image,
                        format!(
                            "{:?}->{:?} does not wait for reads at {:?}",
                            barrier.old, barrier.new, t.unsynced_reads
                        ),
                    );
                }
                self.images.insert(
                    image,
                    Track {
                        layout: barrier.new,
                        unsynced_write: None,
                        unsynced_reads: Stages::empty(),
                        visible_stages: s.dst_stages,
                        visible_access: s.dst_access,
                        touched: true,
                    },
                );
            }
            Event::BeginRendering { desc, .. } => {
                for att in &desc.colors {
                    let mut access = Access::COLOR_ATTACHMENT_WRITE;
                    if att.load == LoadOp::Load {
                        access |= Access::COLOR_ATTACHMENT_READ;
                    }
                    self.access(
                        att.image,
                        ImageState::ColorAttachment,
                        Stages::COLOR_ATTACHMENT_OUTPUT,
                        access,
                    );
                }
                if let Some(att) = &desc.depth {
                    self.access(
                        att.image,
                        ImageState::DepthAttachment,
                        Stages::FRAGMENT_TESTS,
                        Access::DEPTH_STENCIL,
                    );
                }
            }
            Event::Draw { sampled, pass, .. } => {
                for image in sampled {
                    self.access(
                        *image,
                        ImageState::ShaderRead,
                        Stages::FRAGMENT_SHADER,
                        Access::SHADER_SAMPLED_READ,
                    );
                    if *pass == PassKind::Geometry {
                        self.flag(*image, "geometry pass samples an image".into());
                    }
                }
            }
            Event::Present { index, .. } => {
                let Some(&image) = self.swapchain.get(*index as usize) else {
                    return;
                };
                let Some(t) = self.images.get(&image).cloned() else {
                    return;
                };
                if t.layout != ImageState::Present {
                    self.flag(image, format!("presented in {:?}", t.layout));
                }
                if t.unsynced_write.is_some() {
                    self.flag(image, "presented with unsynchronized writes".into());
                }
            }
            Event::ImageDestroyed(image) => {
                self.images.remove(image);
            }
            _ => {}
        }
    }

    fn access(&mut self, image: ImageHandle, layout: ImageState, stages: Stages, access: Access) {
        let Some(t) = self.images.get(&image).cloned() else {
            return self.flag(image, "access to unknown image".into());
        };
        if t.layout != layout {
            self.flag(image, format!("used as {layout:?} while in {:?}", t.layout));
        }
        if t.unsynced_write.is_some() && access.writes().is_empty() {
            self.flag(image, format!("read at {stages:?} races an earlier write"));
        } else if t.unsynced_write.is_some() {
            self.flag(image, format!("write at {stages:?} races an earlier write"));
        }
        if t.touched && !access.writes().is_empty() && !t.unsynced_reads.is_empty() {
            self.flag(image, format!("write at {stages:?} races earlier reads"));
        }
        if t.touched
            && (!t.visible_stages.contains(stages) || !t.visible_access.contains(access))
        {
            self.flag(
                image,
                format!("{access:?} at {stages:?} not made visible by the last barrier"),
            );
        }

        if let Some(t) = self.images.get_mut(&image) {
            let writes = access.writes();
            if writes.is_empty() {
                t.unsynced_reads |= stages;
            } else {
                t.unsynced_write = Some((stages, writes));
            }
            t.touched = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Aspect, Attachment, CommandBufferHandle, ImageBarrier, RenderingDesc, ViewHandle};
    use crate::transition::scope_for;
    use crate::RenderSize;

    const CMD: CommandBufferHandle = CommandBufferHandle(1);
    const IMG: ImageHandle = ImageHandle(9);

    fn barrier(old: ImageState, new: ImageState) -> Event {
        Event::Barrier {
            cmd: CMD,
            barrier: ImageBarrier {
                image: IMG,
                aspect: Aspect::Color,
                old,
                new,
                scope: scope_for(old, new).unwrap(),
            },
        }
    }

    fn render_to(image: ImageHandle) -> Event {
        Event::BeginRendering {
            cmd: CMD,
            desc: RenderingDesc {
                extent: RenderSize::new(4, 4),
                colors: vec![Attachment {
                    image,
                    view: ViewHandle(1),
                    state: ImageState::ColorAttachment,
                    load: LoadOp::Load,
                }],
                depth: None,
            },
        }
    }

    fn sample(image: ImageHandle) -> Event {
        Event::Draw {
            cmd: CMD,
            pass: PassKind::Lighting,
            vertices: 3,
            indexed: false,
            sampled: vec![image],
        }
    }

    fn created() -> Event {
        Event::ImageCreated {
            image: IMG,
            extent: RenderSize::new(4, 4),
            format: crate::gpu::Format::Rgba8Unorm,
        }
    }

    #[test]
    fn write_then_sample_through_table_barrier_is_clean() {
        let log = [
            created(),
            barrier(ImageState::Undefined, ImageState::ColorAttachment),
            render_to(IMG),
            barrier(ImageState::ColorAttachment, ImageState::ShaderRead),
            sample(IMG),
            barrier(ImageState::ShaderRead, ImageState::ColorAttachment),
            render_to(IMG),
        ];
        let hazards = HazardChecker::check(&log);
        assert!(hazards.is_empty(), "{hazards:?}");
    }

    #[test]
    fn sampling_without_barrier_is_flagged() {
        let log = [
            created(),
            barrier(ImageState::Undefined, ImageState::ColorAttachment),
            render_to(IMG),
            sample(IMG),
        ];
        let hazards = HazardChecker::check(&log);
        assert!(hazards.iter().any(|h| h.message.contains("races an earlier write")));
        assert!(hazards.iter().any(|h| h.message.contains("used as ShaderRead")));
    }

    #[test]
    fn barrier_with_too_narrow_source_is_flagged() {
        let mut weak = scope_for(ImageState::ColorAttachment, ImageState::ShaderRead).unwrap();
        weak.src_stages = Stages::FRAGMENT_SHADER;
        let log = [
            created(),
            barrier(ImageState::Undefined, ImageState::ColorAttachment),
            render_to(IMG),
            Event::Barrier {
                cmd: CMD,
                barrier: ImageBarrier {
                    image: IMG,
                    aspect: Aspect::Color,
                    old: ImageState::ColorAttachment,
                    new: ImageState::ShaderRead,
                    scope: weak,
                },
            },
            sample(IMG),
        ];
        let hazards = HazardChecker::check(&log);
        assert_eq!(hazards.len(), 1, "{hazards:?}");
        assert!(hazards[0].message.contains("does not cover write"));
    }

    #[test]
    fn overwriting_sampled_image_needs_a_barrier() {
        let log = [
            created(),
            barrier(ImageState::Undefined, ImageState::ColorAttachment),
            render_to(IMG),
            barrier(ImageState::ColorAttachment, ImageState::ShaderRead),
            sample(IMG),
            render_to(IMG),
        ];
        let hazards = HazardChecker::check(&log);
        assert!(hazards.iter().any(|h| h.message.contains("races earlier reads")));
    }
}
