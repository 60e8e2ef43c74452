// SPDX-License-Identifier: CEPL-1.0
//! Deterministic software device.
//!
//! `SimGpu` executes nothing, but it tracks every object, fence, semaphore
//! and attachment the way a driver's validation layer would, logs each call
//! as an [`Event`], and records a violation whenever the pipeline breaks a
//! synchronization rule. Clones share state, so a test can keep a handle
//! after moving the device into a renderer.

mod hazard;

pub use hazard::{Hazard, HazardChecker};

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, VecDeque},
    rc::Rc,
};

use tracing::trace;

use crate::error::{RenderError, Result};
use crate::gpu::*;
use crate::RenderSize;

/// What a pixel range of an image holds, as far as the simulation knows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Contents {
    /// Never written, or discarded by a layout change.
    Undefined,
    Cleared(ClearValue),
    /// Written by at least one draw.
    Drawn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    WaitFence {
        fence: FenceHandle,
        timeout_ns: u64,
        signaled: bool,
    },
    ResetFence(FenceHandle),
    BeginCommands(CommandBufferHandle),
    EndCommands(CommandBufferHandle),
    Submit(Submission),
    Acquire { index: u32, signal: SemaphoreHandle },
    AcquireOutOfDate,
    Present { index: u32, wait: SemaphoreHandle },
    WaitIdle,
    SwapchainCreated { extent: RenderSize, images: Vec<ImageHandle> },
    SwapchainDestroyed,
    ImageCreated { image: ImageHandle, extent: RenderSize, format: Format },
    ImageDestroyed(ImageHandle),
    Barrier { cmd: CommandBufferHandle, barrier: ImageBarrier },
    BeginRendering { cmd: CommandBufferHandle, desc: RenderingDesc },
    EndRendering { cmd: CommandBufferHandle },
    Draw {
        cmd: CommandBufferHandle,
        pass: PassKind,
        vertices: u32,
        indexed: bool,
        sampled: Vec<ImageHandle>,
    },
    BufferWrite { buffer: BufferHandle, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    Fence,
    Semaphore,
    CommandBuffer,
    Swapchain,
    Image,
    View,
    Buffer,
    Pipeline,
    BindGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Initial,
    Recording,
    Executable,
    Pending,
}

struct SimImage {
    extent: RenderSize,
    contents: Contents,
}

struct SimBuffer {
    bytes: Vec<u8>,
    host_visible: bool,
}

struct SimPipeline {
    kind: PassKind,
    bindings: usize,
}

struct Chain {
    images: Vec<ImageHandle>,
    acquired: Vec<bool>,
    next: u32,
}

struct Surface {
    extent: RenderSize,
    scripted: VecDeque<RenderSize>,
    min_images: u32,
    max_images: Option<u32>,
    format: Format,
    chain: Option<Chain>,
    acquire_script: VecDeque<AcquireResult>,
    present_script: VecDeque<PresentResult>,
}

#[derive(Default)]
struct Recording {
    colors: Vec<ImageHandle>,
    depth: Option<ImageHandle>,
    pipeline: Option<PipelineHandle>,
    group: Option<BindGroupHandle>,
    inside: bool,
}

struct SimState {
    next_id: u64,
    live: BTreeMap<u64, ObjectKind>,
    fences: HashMap<FenceHandle, bool>,
    semaphores: HashMap<SemaphoreHandle, bool>,
    commands: HashMap<CommandBufferHandle, CmdState>,
    pending: VecDeque<Submission>,
    images: HashMap<ImageHandle, SimImage>,
    views: HashMap<ViewHandle, ImageHandle>,
    buffers: HashMap<BufferHandle, SimBuffer>,
    pipelines: HashMap<PipelineHandle, SimPipeline>,
    groups: HashMap<BindGroupHandle, Vec<BindingResource>>,
    surface: Surface,
    recording: HashMap<CommandBufferHandle, Recording>,
    presented: Vec<(u32, Contents)>,
    events: Vec<Event>,
    violations: Vec<String>,
    auto_retire: bool,
    limits: BTreeMap<ObjectKind, usize>,
}

#[derive(Clone)]
pub struct SimGpu {
    state: Rc<RefCell<SimState>>,
}

impl Default for SimGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGpu {
    /// An 800x600 surface allowing up to three images.
    pub fn new() -> Self {
        Self::with_surface(RenderSize::new(800, 600), 3)
    }

    pub fn with_surface(extent: RenderSize, max_images: u32) -> Self {
        let state = SimState {
            next_id: 1,
            live: BTreeMap::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            commands: HashMap::new(),
            pending: VecDeque::new(),
            images: HashMap::new(),
            views: HashMap::new(),
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            groups: HashMap::new(),
            surface: Surface {
                extent,
                scripted: VecDeque::new(),
                min_images: 2.min(max_images),
                max_images: Some(max_images),
                format: Format::Bgra8Srgb,
                chain: None,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
            },
            recording: HashMap::new(),
            presented: Vec::new(),
            events: Vec::new(),
            violations: Vec::new(),
            auto_retire: true,
            limits: BTreeMap::new(),
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// When on (the default), waiting on a fence retires the work behind it.
    /// When off the device is stuck: bounded waits time out and unbounded
    /// ones fail as a hang until [`retire_all`](Self::retire_all).
    pub fn set_auto_retire(&self, on: bool) {
        self.state.borrow_mut().auto_retire = on;
    }

    /// Creating a `kind` object fails once `max_live` of them are alive.
    pub fn limit_live(&self, kind: ObjectKind, max_live: usize) {
        self.state.borrow_mut().limits.insert(kind, max_live);
    }

    pub fn retire_all(&self) {
        self.state.borrow_mut().retire_until(None);
    }

    /// Surface extents reported by successive capability queries. The last
    /// one sticks.
    pub fn script_extents(&self, extents: impl IntoIterator<Item = RenderSize>) {
        let mut s = self.state.borrow_mut();
        s.surface.scripted.extend(extents);
    }

    pub fn set_surface_extent(&self, extent: RenderSize) {
        let mut s = self.state.borrow_mut();
        s.surface.scripted.clear();
        s.surface.extent = extent;
    }

    pub fn set_surface_format(&self, format: Format) {
        self.state.borrow_mut().surface.format = format;
    }

    pub fn script_acquire_out_of_date(&self, times: usize) {
        let mut s = self.state.borrow_mut();
        s.surface
            .acquire_script
            .extend(std::iter::repeat(AcquireResult::OutOfDate).take(times));
    }

    /// The next acquire succeeds but reports the chain as suboptimal.
    pub fn script_acquire_suboptimal(&self) {
        self.state
            .borrow_mut()
            .surface
            .acquire_script
            .push_back(AcquireResult::Ready {
                index: u32::MAX,
                suboptimal: true,
            });
    }

    pub fn script_present(&self, result: PresentResult) {
        self.state.borrow_mut().surface.present_script.push_back(result);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    pub fn live_objects(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn live_of(&self, kind: ObjectKind) -> usize {
        self.state.borrow().live.values().filter(|k| **k == kind).count()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn fence_signaled(&self, fence: FenceHandle) -> bool {
        self.state.borrow().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn semaphore_signaled(&self, sem: SemaphoreHandle) -> bool {
        self.state.borrow().semaphores.get(&sem).copied().unwrap_or(false)
    }

    /// Signals `sem` from outside any queue operation.
    pub fn signal_semaphore(&self, sem: SemaphoreHandle) {
        self.state.borrow_mut().signal(sem, "host signal");
    }

    /// Consumes a pending signal on `sem` from outside any queue operation.
    pub fn consume_semaphore(&self, sem: SemaphoreHandle) {
        self.state.borrow_mut().consume(sem, "host wait");
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.borrow().buffers.get(&buffer).map(|b| b.bytes.clone())
    }

    pub fn image_extent(&self, image: ImageHandle) -> Option<RenderSize> {
        self.state.borrow().images.get(&image).map(|i| i.extent)
    }

    pub fn contents(&self, image: ImageHandle) -> Option<Contents> {
        self.state.borrow().images.get(&image).map(|i| i.contents)
    }

    /// Image indices in presentation order, with what each held.
    pub fn presented(&self) -> Vec<(u32, Contents)> {
        self.state.borrow().presented.clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.borrow_mut())
    }
}

impl SimState {
    fn alloc(&mut self, kind: ObjectKind) -> Result<u64> {
        if let Some(&max) = self.limits.get(&kind) {
            if self.live.values().filter(|k| **k == kind).count() >= max {
                return Err(RenderError::device(
                    "alloc",
                    format!("out of {kind:?} objects ({max} alive)"),
                ));
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, kind);
        Ok(id)
    }

    fn release(&mut self, id: u64, kind: ObjectKind) {
        match self.live.remove(&id) {
            Some(k) if k == kind => {}
            Some(k) => self.violate(format!("object {id} destroyed as {kind:?}, created as {k:?}")),
            None => self.violate(format!("{kind:?} {id} destroyed twice or never created")),
        }
    }

    fn violate(&mut self, msg: String) {
        trace!("sim violation: {msg}");
        self.violations.push(msg);
    }

    fn signal(&mut self, sem: SemaphoreHandle, by: &str) {
        match self.semaphores.get(&sem).copied() {
            Some(true) => self.violate(format!("{by}: semaphore {} signaled twice", sem.0)),
            Some(false) => {
                self.semaphores.insert(sem, true);
            }
            None => self.violate(format!("{by}: unknown semaphore {}", sem.0)),
        }
    }

    fn consume(&mut self, sem: SemaphoreHandle, by: &str) {
        match self.semaphores.get(&sem).copied() {
            Some(true) => {
                self.semaphores.insert(sem, false);
            }
            Some(false) => self.violate(format!("{by}: waits on unsignaled semaphore {}", sem.0)),
            None => self.violate(format!("{by}: unknown semaphore {}", sem.0)),
        }
    }

    /// Retires pending work in order, up to and including the submission
    /// that signals `fence`, or everything when `fence` is `None`.
    fn retire_until(&mut self, fence: Option<FenceHandle>) {
        while let Some(sub) = self.pending.pop_front() {
            self.fences.insert(sub.fence, true);
            if let Some(c) = self.commands.get_mut(&sub.command_buffer) {
                *c = CmdState::Executable;
            }
            if Some(sub.fence) == fence {
                break;
            }
        }
    }

    fn in_flight(&self, pred: impl Fn(&Submission) -> bool) -> bool {
        self.pending.iter().any(pred)
    }

    fn recording_cmd(&mut self, cmd: CommandBufferHandle, call: &str) -> bool {
        if self.commands.get(&cmd) != Some(&CmdState::Recording) {
            self.violate(format!("{call} on command buffer {} outside recording", cmd.0));
            return false;
        }
        true
    }

    fn set_contents(&mut self, image: ImageHandle, contents: Contents) {
        if let Some(img) = self.images.get_mut(&image) {
            img.contents = contents;
        }
    }

    fn surface_extent(&mut self) -> RenderSize {
        if let Some(next) = self.surface.scripted.pop_front() {
            self.surface.extent = next;
        }
        self.surface.extent
    }
}

impl Gpu for SimGpu {
    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle> {
        self.with(|s| -> Result<_> {
            let f = FenceHandle(s.alloc(ObjectKind::Fence)?);
            s.fences.insert(f, signaled);
            Ok(f)
        })
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.with(|s| {
            if s.in_flight(|p| p.fence == fence) {
                s.violate(format!("fence {} destroyed while in flight", fence.0));
            }
            s.fences.remove(&fence);
            s.release(fence.0, ObjectKind::Fence);
        })
    }

    fn wait_for_fence(&mut self, fence: FenceHandle, timeout_ns: u64) -> Result<FenceStatus> {
        self.with(|s| {
            let mut signaled = s.fences.get(&fence).copied().unwrap_or(false);
            if !signaled && s.auto_retire && s.in_flight(|p| p.fence == fence) {
                s.retire_until(Some(fence));
                signaled = true;
            }
            s.events.push(Event::WaitFence {
                fence,
                timeout_ns,
                signaled,
            });
            if signaled {
                return Ok(FenceStatus::Signaled);
            }
            if timeout_ns == u64::MAX {
                // Nothing will ever signal the fence, so a driver would hang here.
                s.violate(format!("unbounded wait on fence {} never returns", fence.0));
                return Err(RenderError::device(
                    "wait_for_fence",
                    "fence can never be signaled",
                ));
            }
            Ok(FenceStatus::TimedOut)
        })
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> Result<()> {
        self.with(|s| {
            if s.in_flight(|p| p.fence == fence) {
                s.violate(format!("fence {} reset while its work is in flight", fence.0));
            }
            s.fences.insert(fence, false);
            s.events.push(Event::ResetFence(fence));
            Ok(())
        })
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle> {
        self.with(|s| -> Result<_> {
            let sem = SemaphoreHandle(s.alloc(ObjectKind::Semaphore)?);
            s.semaphores.insert(sem, false);
            Ok(sem)
        })
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.with(|s| {
            if s.in_flight(|p| p.wait == semaphore || p.signal == semaphore) {
                s.violate(format!("semaphore {} destroyed while in flight", semaphore.0));
            }
            s.semaphores.remove(&semaphore);
            s.release(semaphore.0, ObjectKind::Semaphore);
        })
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.with(|s| {
            s.retire_until(None);
            s.events.push(Event::WaitIdle);
            Ok(())
        })
    }

    fn allocate_command_buffer(&mut self) -> Result<CommandBufferHandle> {
        self.with(|s| -> Result<_> {
            let c = CommandBufferHandle(s.alloc(ObjectKind::CommandBuffer)?);
            s.commands.insert(c, CmdState::Initial);
            Ok(c)
        })
    }

    fn free_command_buffer(&mut self, cmd: CommandBufferHandle) {
        self.with(|s| {
            if s.commands.get(&cmd) == Some(&CmdState::Pending) {
                s.violate(format!("command buffer {} freed while in flight", cmd.0));
            }
            s.commands.remove(&cmd);
            s.recording.remove(&cmd);
            s.release(cmd.0, ObjectKind::CommandBuffer);
        })
    }

    fn begin_commands(&mut self, cmd: CommandBufferHandle) -> Result<()> {
        self.with(|s| {
            match s.commands.get(&cmd).copied() {
                Some(CmdState::Pending) => {
                    s.violate(format!("command buffer {} re-recorded while in flight", cmd.0))
                }
                Some(CmdState::Recording) => {
                    s.violate(format!("command buffer {} begun twice", cmd.0))
                }
                Some(_) => {}
                None => return Err(RenderError::device("begin_commands", "unknown command buffer")),
            }
            s.commands.insert(cmd, CmdState::Recording);
            s.recording.insert(cmd, Recording::default());
            s.events.push(Event::BeginCommands(cmd));
            Ok(())
        })
    }

    fn end_commands(&mut self, cmd: CommandBufferHandle) -> Result<()> {
        self.with(|s| {
            if s.recording_cmd(cmd, "end_commands") {
                if s.recording.get(&cmd).is_some_and(|r| r.inside) {
                    s.violate(format!("command buffer {} ended inside rendering", cmd.0));
                }
                s.commands.insert(cmd, CmdState::Executable);
            }
            s.events.push(Event::EndCommands(cmd));
            Ok(())
        })
    }

    fn submit(&mut self, sub: &Submission) -> Result<()> {
        self.with(|s| {
            if s.commands.get(&sub.command_buffer) != Some(&CmdState::Executable) {
                s.violate(format!(
                    "submitted command buffer {} is not executable",
                    sub.command_buffer.0
                ));
            }
            if s.fences.get(&sub.fence).copied().unwrap_or(true) {
                s.violate(format!("submit with signaled fence {}", sub.fence.0));
            }
            s.consume(sub.wait, "submit");
            s.signal(sub.signal, "submit");
            s.commands.insert(sub.command_buffer, CmdState::Pending);
            s.pending.push_back(*sub);
            s.events.push(Event::Submit(*sub));
            Ok(())
        })
    }

    fn surface_caps(&mut self) -> Result<SurfaceCaps> {
        self.with(|s| {
            let extent = s.surface_extent();
            Ok(SurfaceCaps {
                current_extent: Some(extent),
                min_extent: RenderSize::new(1, 1),
                max_extent: RenderSize::new(16384, 16384),
                min_image_count: s.surface.min_images,
                max_image_count: s.surface.max_images,
            })
        })
    }

    fn create_swapchain(&mut self, extent: RenderSize, image_count: u32) -> Result<SwapchainImages> {
        self.with(|s| -> Result<_> {
            if s.surface.chain.is_some() {
                s.violate("swapchain created while another is alive".into());
            }
            if extent.is_degenerate() {
                s.violate(format!("swapchain created at {}x{}", extent.width, extent.height));
            }
            s.alloc(ObjectKind::Swapchain)?;
            let images: Vec<_> = (0..image_count)
                .map(|_| {
                    // Owned by the chain, so not tracked as live objects.
                    let id = s.next_id;
                    s.next_id += 1;
                    let img = ImageHandle(id);
                    s.images.insert(
                        img,
                        SimImage {
                            extent,
                            contents: Contents::Undefined,
                        },
                    );
                    img
                })
                .collect();
            s.surface.chain = Some(Chain {
                images: images.clone(),
                acquired: vec![false; images.len()],
                next: 0,
            });
            s.events.push(Event::SwapchainCreated {
                extent,
                images: images.clone(),
            });
            Ok(SwapchainImages {
                images,
                format: s.surface.format,
                extent,
            })
        })
    }

    fn destroy_swapchain(&mut self) {
        self.with(|s| {
            if !s.pending.is_empty() {
                s.violate("swapchain destroyed with work in flight".into());
            }
            let Some(chain) = s.surface.chain.take() else {
                s.violate("no swapchain to destroy".into());
                return;
            };
            for img in chain.images {
                s.images.remove(&img);
            }
            let id = s
                .live
                .iter()
                .find(|(_, k)| **k == ObjectKind::Swapchain)
                .map(|(id, _)| *id);
            if let Some(id) = id {
                s.release(id, ObjectKind::Swapchain);
            }
            s.events.push(Event::SwapchainDestroyed);
        })
    }

    fn acquire_next_image(&mut self, _timeout_ns: u64, signal: SemaphoreHandle) -> Result<AcquireResult> {
        self.with(|s| {
            let scripted = s.surface.acquire_script.pop_front();
            if scripted == Some(AcquireResult::OutOfDate) {
                s.events.push(Event::AcquireOutOfDate);
                return Ok(AcquireResult::OutOfDate);
            }
            let suboptimal = matches!(scripted, Some(AcquireResult::Ready { suboptimal: true, .. }));

            let Some(chain) = s.surface.chain.as_mut() else {
                return Err(RenderError::device("acquire_next_image", "no swapchain"));
            };
            let n = chain.images.len() as u32;
            let Some(index) = (0..n)
                .map(|k| (chain.next + k) % n)
                .find(|i| !chain.acquired[*i as usize])
            else {
                return Err(RenderError::device("acquire_next_image", "every image is acquired"));
            };
            chain.acquired[index as usize] = true;
            chain.next = (index + 1) % n;

            s.signal(signal, "acquire");
            s.events.push(Event::Acquire { index, signal });
            Ok(AcquireResult::Ready { index, suboptimal })
        })
    }

    fn present(&mut self, index: u32, wait: SemaphoreHandle) -> Result<PresentResult> {
        self.with(|s| {
            s.consume(wait, "present");
            let image = match s.surface.chain.as_mut() {
                Some(chain) if (index as usize) < chain.images.len() => {
                    if !chain.acquired[index as usize] {
                        s.violations
                            .push(format!("present of image {index} that was not acquired"));
                    }
                    chain.acquired[index as usize] = false;
                    Some(chain.images[index as usize])
                }
                _ => None,
            };
            let Some(image) = image else {
                return Err(RenderError::device("present", format!("bad image index {index}")));
            };
            let contents = s.images.get(&image).map_or(Contents::Undefined, |i| i.contents);
            s.presented.push((index, contents));
            s.events.push(Event::Present { index, wait });
            Ok(s.surface
                .present_script
                .pop_front()
                .unwrap_or(PresentResult::Presented))
        })
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle> {
        self.with(|s| -> Result<_> {
            if desc.extent.is_degenerate() {
                return Err(RenderError::DegenerateExtent {
                    width: desc.extent.width,
                    height: desc.extent.height,
                });
            }
            let image = ImageHandle(s.alloc(ObjectKind::Image)?);
            s.images.insert(
                image,
                SimImage {
                    extent: desc.extent,
                    contents: Contents::Undefined,
                },
            );
            s.events.push(Event::ImageCreated {
                image,
                extent: desc.extent,
                format: desc.format,
            });
            Ok(image)
        })
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.with(|s| {
            s.images.remove(&image);
            s.release(image.0, ObjectKind::Image);
            s.events.push(Event::ImageDestroyed(image));
        })
    }

    fn create_view(&mut self, image: ImageHandle, _format: Format) -> Result<ViewHandle> {
        self.with(|s| -> Result<_> {
            if !s.images.contains_key(&image) {
                return Err(RenderError::device("create_view", "unknown image"));
            }
            let view = ViewHandle(s.alloc(ObjectKind::View)?);
            s.views.insert(view, image);
            Ok(view)
        })
    }

    fn destroy_view(&mut self, view: ViewHandle) {
        self.with(|s| {
            s.views.remove(&view);
            s.release(view.0, ObjectKind::View);
        })
    }

    fn create_buffer(&mut self, size: u64, _usage: BufferUsage, host_visible: bool) -> Result<BufferHandle> {
        self.with(|s| -> Result<_> {
            let b = BufferHandle(s.alloc(ObjectKind::Buffer)?);
            s.buffers.insert(
                b,
                SimBuffer {
                    bytes: vec![0; size as usize],
                    host_visible,
                },
            );
            Ok(b)
        })
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()> {
        self.with(|s| {
            let Some(b) = s.buffers.get_mut(&buffer) else {
                return Err(RenderError::device("upload_buffer", "unknown buffer"));
            };
            if bytes.len() > b.bytes.len() {
                return Err(RenderError::device("upload_buffer", "upload exceeds buffer"));
            }
            b.bytes[..bytes.len()].copy_from_slice(bytes);
            s.events.push(Event::BufferWrite {
                buffer,
                len: bytes.len(),
            });
            Ok(())
        })
    }

    fn write_mapped(&mut self, buffer: BufferHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        self.with(|s| {
            let Some(b) = s.buffers.get_mut(&buffer) else {
                return Err(RenderError::device("write_mapped", "unknown buffer"));
            };
            let start = offset as usize;
            let end = start + bytes.len();
            if end > b.bytes.len() {
                return Err(RenderError::device("write_mapped", "write exceeds buffer"));
            }
            let host_visible = b.host_visible;
            b.bytes[start..end].copy_from_slice(bytes);
            if !host_visible {
                s.violate(format!("mapped write to device-local buffer {}", buffer.0));
            }
            s.events.push(Event::BufferWrite {
                buffer,
                len: bytes.len(),
            });
            Ok(())
        })
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.with(|s| {
            s.buffers.remove(&buffer);
            s.release(buffer.0, ObjectKind::Buffer);
        })
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle> {
        self.with(|s| -> Result<_> {
            let p = PipelineHandle(s.alloc(ObjectKind::Pipeline)?);
            s.pipelines.insert(
                p,
                SimPipeline {
                    kind: desc.kind,
                    bindings: desc.bindings.len(),
                },
            );
            Ok(p)
        })
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.with(|s| {
            s.pipelines.remove(&pipeline);
            s.release(pipeline.0, ObjectKind::Pipeline);
        })
    }

    fn create_bind_group(&mut self, pipeline: PipelineHandle, resources: &[BindingResource]) -> Result<BindGroupHandle> {
        self.with(|s| -> Result<_> {
            let Some(p) = s.pipelines.get(&pipeline) else {
                return Err(RenderError::device("create_bind_group", "unknown pipeline"));
            };
            if p.bindings != resources.len() {
                let msg = format!(
                    "bind group has {} resources, layout has {}",
                    resources.len(),
                    p.bindings
                );
                s.violate(msg);
            }
            let g = BindGroupHandle(s.alloc(ObjectKind::BindGroup)?);
            s.groups.insert(g, resources.to_vec());
            Ok(g)
        })
    }

    fn destroy_bind_group(&mut self, group: BindGroupHandle) {
        self.with(|s| {
            s.groups.remove(&group);
            s.release(group.0, ObjectKind::BindGroup);
        })
    }

    fn cmd_barriers(&mut self, cmd: CommandBufferHandle, barriers: &[ImageBarrier]) {
        self.with(|s| {
            s.recording_cmd(cmd, "cmd_barriers");
            for b in barriers {
                if b.old == crate::transition::ImageState::Undefined {
                    s.set_contents(b.image, Contents::Undefined);
                }
                s.events.push(Event::Barrier { cmd, barrier: *b });
            }
        })
    }

    fn cmd_begin_rendering(&mut self, cmd: CommandBufferHandle, desc: &RenderingDesc) {
        self.with(|s| {
            s.recording_cmd(cmd, "cmd_begin_rendering");
            for att in desc.colors.iter().chain(desc.depth.iter()) {
                if let LoadOp::Clear(v) = att.load {
                    s.set_contents(att.image, Contents::Cleared(v));
                }
                if s.images.get(&att.image).is_some_and(|i| i.extent != desc.extent) {
                    s.violate(format!("attachment {} does not match render extent", att.image.0));
                }
            }
            let rec = s.recording.entry(cmd).or_default();
            if rec.inside {
                s.violations.push("rendering begun twice".into());
            }
            rec.inside = true;
            rec.colors = desc.colors.iter().map(|a| a.image).collect();
            rec.depth = desc.depth.map(|a| a.image);
            s.events.push(Event::BeginRendering {
                cmd,
                desc: desc.clone(),
            });
        })
    }

    fn cmd_end_rendering(&mut self, cmd: CommandBufferHandle) {
        self.with(|s| {
            s.recording_cmd(cmd, "cmd_end_rendering");
            if let Some(rec) = s.recording.get_mut(&cmd) {
                rec.inside = false;
                rec.colors.clear();
                rec.depth = None;
            }
            s.events.push(Event::EndRendering { cmd });
        })
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        _extent: RenderSize,
    ) -> Result<()> {
        self.with(|s| {
            s.recording_cmd(cmd, "cmd_bind_pipeline");
            if !s.pipelines.contains_key(&pipeline) {
                s.violate(format!("bind of unknown pipeline {}", pipeline.0));
                return Err(RenderError::InvalidState(format!(
                    "cmd_bind_pipeline: unknown pipeline {pipeline:?}"
                )));
            }
            let rec = s.recording.entry(cmd).or_default();
            rec.pipeline = Some(pipeline);
            rec.group = None;
            Ok(())
        })
    }

    fn cmd_bind_group(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        group: BindGroupHandle,
    ) -> Result<()> {
        self.with(|s| {
            s.recording_cmd(cmd, "cmd_bind_group");
            if !s.pipelines.contains_key(&pipeline) {
                s.violate(format!("bind group against unknown pipeline {}", pipeline.0));
                return Err(RenderError::InvalidState(format!(
                    "cmd_bind_group: unknown pipeline {pipeline:?}"
                )));
            }
            if !s.groups.contains_key(&group) {
                s.violate(format!("bind group {} is not alive", group.0));
            }
            let rec = s.recording.entry(cmd).or_default();
            if rec.pipeline != Some(pipeline) {
                s.violations
                    .push("bind group bound against a pipeline that is not bound".into());
            }
            rec.group = Some(group);
            Ok(())
        })
    }

    fn cmd_bind_mesh(&mut self, cmd: CommandBufferHandle, vertices: BufferHandle, indices: BufferHandle) {
        self.with(|s| {
            s.recording_cmd(cmd, "cmd_bind_mesh");
            if !s.buffers.contains_key(&vertices) || !s.buffers.contains_key(&indices) {
                s.violate("mesh buffers are not alive".into());
            }
        })
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32) {
        self.with(|s| s.draw(cmd, vertex_count, false))
    }

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32) {
        self.with(|s| s.draw(cmd, index_count, true))
    }
}

impl SimState {
    fn draw(&mut self, cmd: CommandBufferHandle, vertices: u32, indexed: bool) {
        if !self.recording_cmd(cmd, "draw") {
            return;
        }
        let Some(rec) = self.recording.get(&cmd) else {
            return;
        };
        if !rec.inside {
            self.violate("draw outside rendering".into());
            return;
        }
        let (Some(pipeline), group) = (rec.pipeline, rec.group) else {
            self.violate("draw without a pipeline".into());
            return;
        };
        let targets: Vec<_> = rec.colors.iter().copied().chain(rec.depth).collect();
        let Some(pass) = self.pipelines.get(&pipeline).map(|p| p.kind) else {
            self.violate(format!("draw with destroyed pipeline {}", pipeline.0));
            return;
        };

        let sampled: Vec<_> = group
            .and_then(|g| self.groups.get(&g))
            .map(|res| {
                res.iter()
                    .filter_map(|r| match r {
                        BindingResource::Sampled { image, .. } => Some(*image),
                        BindingResource::Uniform { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for image in &sampled {
            if !self.images.contains_key(image) {
                self.violate(format!("draw samples destroyed image {}", image.0));
            }
        }
        if vertices > 0 {
            for t in targets {
                self.set_contents(t, Contents::Drawn);
            }
        }
        self.events.push(Event::Draw {
            cmd,
            pass,
            vertices,
            indexed,
            sampled,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_semaphore_rules_are_enforced() {
        let mut gpu = SimGpu::new();
        let sem = gpu.create_semaphore().unwrap();
        gpu.signal_semaphore(sem);
        gpu.signal_semaphore(sem);
        gpu.consume_semaphore(sem);
        gpu.consume_semaphore(sem);
        assert_eq!(gpu.violations().len(), 2);
    }

    #[test]
    fn rerecording_in_flight_buffer_is_flagged() {
        let mut gpu = SimGpu::new();
        gpu.set_auto_retire(false);
        let cmd = gpu.allocate_command_buffer().unwrap();
        let fence = gpu.create_fence(false).unwrap();
        let (wait, signal) = (gpu.create_semaphore().unwrap(), gpu.create_semaphore().unwrap());
        gpu.signal_semaphore(wait);
        gpu.begin_commands(cmd).unwrap();
        gpu.end_commands(cmd).unwrap();
        gpu.submit(&Submission {
            command_buffer: cmd,
            wait,
            wait_stages: crate::transition::Stages::COLOR_ATTACHMENT_OUTPUT,
            signal,
            fence,
        })
        .unwrap();
        gpu.begin_commands(cmd).unwrap();
        assert!(gpu.violations()[0].contains("re-recorded while in flight"));
    }

    #[test]
    fn binding_an_unknown_pipeline_is_refused() {
        let mut gpu = SimGpu::new();
        let cmd = gpu.allocate_command_buffer().unwrap();
        gpu.begin_commands(cmd).unwrap();
        let ghost = PipelineHandle(999);
        assert!(matches!(
            gpu.cmd_bind_pipeline(cmd, ghost, RenderSize::new(4, 4)),
            Err(RenderError::InvalidState(_))
        ));
        assert!(matches!(
            gpu.cmd_bind_group(cmd, ghost, BindGroupHandle(998)),
            Err(RenderError::InvalidState(_))
        ));
        let v = gpu.violations();
        assert_eq!(v.len(), 2);
        assert!(v[0].contains("unknown pipeline 999"));
    }

    #[test]
    fn unbounded_wait_on_stuck_work_is_a_hang() {
        let mut gpu = SimGpu::new();
        gpu.set_auto_retire(false);
        let cmd = gpu.allocate_command_buffer().unwrap();
        let fence = gpu.create_fence(false).unwrap();
        let (wait, signal) = (gpu.create_semaphore().unwrap(), gpu.create_semaphore().unwrap());
        gpu.signal_semaphore(wait);
        gpu.begin_commands(cmd).unwrap();
        gpu.end_commands(cmd).unwrap();
        gpu.submit(&Submission {
            command_buffer: cmd,
            wait,
            wait_stages: crate::transition::Stages::COLOR_ATTACHMENT_OUTPUT,
            signal,
            fence,
        })
        .unwrap();

        assert_eq!(gpu.wait_for_fence(fence, 1_000).unwrap(), FenceStatus::TimedOut);
        assert!(gpu.violations().is_empty());
        assert!(matches!(
            gpu.wait_for_fence(fence, u64::MAX),
            Err(RenderError::Device { call: "wait_for_fence", .. })
        ));
        assert!(gpu.violations()[0].contains("never returns"));

        gpu.set_auto_retire(true);
        assert_eq!(gpu.wait_for_fence(fence, u64::MAX).unwrap(), FenceStatus::Signaled);
        assert_eq!(gpu.pending_submissions(), 0);
        assert!(matches!(
            gpu.events().last(),
            Some(Event::WaitFence { timeout_ns: u64::MAX, signaled: true, .. })
        ));
    }

    #[test]
    fn live_limit_fails_creation() {
        let mut gpu = SimGpu::new();
        gpu.limit_live(ObjectKind::Semaphore, 1);
        let first = gpu.create_semaphore().unwrap();
        assert!(matches!(
            gpu.create_semaphore(),
            Err(RenderError::Device { call: "alloc", .. })
        ));
        gpu.destroy_semaphore(first);
        assert!(gpu.create_semaphore().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let mut gpu = SimGpu::new();
        let observer = gpu.clone();
        gpu.create_fence(true).unwrap();
        assert_eq!(observer.live_objects(), 1);
        assert_eq!(observer.live_of(ObjectKind::Fence), 1);
    }
}
