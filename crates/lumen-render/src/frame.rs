// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight.
//!
//! Each slot owns a command buffer, the fence signaled when that buffer's
//! work retires, and the semaphore the swapchain signals on acquire. A slot
//! is only re-recorded after [`FrameRing::begin_frame`] has observed its
//! fence; the returned [`FrameToken`] is the proof.

use tracing::{debug, trace};

use crate::error::{RenderError, Result};
use crate::gpu::{
    CommandBufferHandle, FenceHandle, FenceStatus, Gpu, SemaphoreHandle, Submission,
};
use crate::transition::Stages;

pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence observed signaled, nothing recorded yet.
    Ready,
    /// Fence reset and the command buffer is being recorded.
    Recording,
    /// Submitted; the fence has not been observed since.
    InFlight,
}

#[derive(Debug)]
pub struct FrameSlot {
    pub index: usize,
    pub command_buffer: CommandBufferHandle,
    pub completion_fence: FenceHandle,
    pub image_available: SemaphoreHandle,
    state: SlotState,
}

impl FrameSlot {
    /// Undoes its own partial work when a later create fails.
    fn create<G: Gpu>(gpu: &mut G, index: usize) -> Result<Self> {
        let command_buffer = gpu.allocate_command_buffer()?;
        // Fences start signaled so the first wait on each slot returns at once.
        let completion_fence = match gpu.create_fence(true) {
            Ok(f) => f,
            Err(e) => {
                gpu.free_command_buffer(command_buffer);
                return Err(e);
            }
        };
        let image_available = match gpu.create_semaphore() {
            Ok(s) => s,
            Err(e) => {
                gpu.destroy_fence(completion_fence);
                gpu.free_command_buffer(command_buffer);
                return Err(e);
            }
        };
        Ok(Self {
            index,
            command_buffer,
            completion_fence,
            image_available,
            state: SlotState::InFlight,
        })
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// Permission to record into one slot. Consumed by [`FrameRing::submit`].
#[derive(Debug)]
#[must_use]
pub struct FrameToken {
    slot: usize,
}

impl FrameToken {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    current: usize,
    timeout_ns: u64,
}

impl FrameRing {
    pub fn new<G: Gpu>(gpu: &mut G, count: usize, timeout_ns: u64) -> Result<Self> {
        if count == 0 {
            return Err(RenderError::InvalidState(
                "a frame ring needs at least one slot".into(),
            ));
        }
        let mut ring = Self {
            slots: Vec::with_capacity(count),
            current: 0,
            timeout_ns,
        };
        for index in 0..count {
            match FrameSlot::create(gpu, index) {
                Ok(slot) => ring.slots.push(slot),
                Err(e) => {
                    ring.destroy(gpu);
                    return Err(e);
                }
            }
        }
        debug!("frame ring: {count} slots");
        Ok(ring)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// Blocks until the current slot's previous submission has retired.
    ///
    /// The fence is left signaled; it is reset by [`commit`](Self::commit)
    /// only once new work is certain to be submitted.
    pub fn begin_frame<G: Gpu>(&mut self, gpu: &mut G) -> Result<FrameToken> {
        let slot = &mut self.slots[self.current];
        match gpu.wait_for_fence(slot.completion_fence, self.timeout_ns)? {
            FenceStatus::Signaled => {}
            FenceStatus::TimedOut => {
                return Err(RenderError::FenceWait {
                    slot: slot.index,
                    reason: format!("not signaled within {} ns", self.timeout_ns),
                })
            }
        }
        slot.state = SlotState::Ready;
        trace!("frame slot {} ready", slot.index);
        Ok(FrameToken { slot: slot.index })
    }

    /// Resets the slot's fence and opens its command buffer for recording.
    pub fn commit<G: Gpu>(&mut self, gpu: &mut G, token: &FrameToken) -> Result<CommandBufferHandle> {
        let slot = &mut self.slots[token.slot];
        if slot.state != SlotState::Ready {
            return Err(RenderError::InvalidState(format!(
                "frame slot {} committed twice",
                slot.index
            )));
        }
        gpu.reset_fence(slot.completion_fence)?;
        gpu.begin_commands(slot.command_buffer)?;
        slot.state = SlotState::Recording;
        Ok(slot.command_buffer)
    }

    /// Closes the command buffer, submits it and moves to the next slot.
    ///
    /// Waits on the slot's acquire semaphore at color output and signals
    /// `render_finished` and the slot fence on completion.
    pub fn submit<G: Gpu>(
        &mut self,
        gpu: &mut G,
        token: FrameToken,
        render_finished: SemaphoreHandle,
    ) -> Result<()> {
        let slot = &mut self.slots[token.slot];
        if slot.state != SlotState::Recording {
            return Err(RenderError::InvalidState(format!(
                "frame slot {} submitted without commit",
                slot.index
            )));
        }
        gpu.end_commands(slot.command_buffer)?;
        gpu.submit(&Submission {
            command_buffer: slot.command_buffer,
            wait: slot.image_available,
            wait_stages: Stages::COLOR_ATTACHMENT_OUTPUT,
            signal: render_finished,
            fence: slot.completion_fence,
        })?;
        slot.state = SlotState::InFlight;
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Caller must have waited for the device to go idle.
    pub fn destroy<G: Gpu>(&mut self, gpu: &mut G) {
        for slot in self.slots.drain(..) {
            gpu.destroy_semaphore(slot.image_available);
            gpu.destroy_fence(slot.completion_fence);
            gpu.free_command_buffer(slot.command_buffer);
        }
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Event, ObjectKind, SimGpu};

    const T: u64 = 1_000_000;

    fn ring(gpu: &mut SimGpu) -> FrameRing {
        FrameRing::new(gpu, FRAMES_IN_FLIGHT, T).unwrap()
    }

    #[test]
    fn first_waits_return_immediately() {
        let mut gpu = SimGpu::new();
        let mut ring = ring(&mut gpu);
        let t = ring.begin_frame(&mut gpu).unwrap();
        assert_eq!(t.slot(), 0);
        assert_eq!(ring.slot(0).state(), SlotState::Ready);
    }

    #[test]
    fn fence_is_reset_only_by_commit() {
        let mut gpu = SimGpu::new();
        let mut ring = ring(&mut gpu);
        let fence = ring.slot(0).completion_fence;
        let token = ring.begin_frame(&mut gpu).unwrap();
        assert!(gpu.fence_signaled(fence));
        let _ = ring.commit(&mut gpu, &token).unwrap();
        assert!(!gpu.fence_signaled(fence));
    }

    #[test]
    fn double_commit_is_refused() {
        let mut gpu = SimGpu::new();
        let mut ring = ring(&mut gpu);
        let token = ring.begin_frame(&mut gpu).unwrap();
        ring.commit(&mut gpu, &token).unwrap();
        assert!(matches!(
            ring.commit(&mut gpu, &token),
            Err(RenderError::InvalidState(_))
        ));
    }

    #[test]
    fn submit_advances_modulo_slot_count() {
        let mut gpu = SimGpu::new();
        let mut ring = ring(&mut gpu);
        let done = gpu.create_semaphore().unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            let token = ring.begin_frame(&mut gpu).unwrap();
            seen.push(token.slot());
            ring.commit(&mut gpu, &token).unwrap();
            // Stand in for the swapchain's acquire signal.
            gpu.signal_semaphore(ring.slot(token.slot()).image_available);
            ring.submit(&mut gpu, token, done).unwrap();
            gpu.consume_semaphore(done);
        }
        assert_eq!(seen, [0, 1, 0, 1, 0]);
        assert_eq!(ring.current(), 1);
    }

    #[test]
    fn stuck_fence_is_fatal() {
        let mut gpu = SimGpu::new();
        gpu.set_auto_retire(false);
        let mut ring = ring(&mut gpu);
        let done = gpu.create_semaphore().unwrap();
        for _ in 0..2 {
            let token = ring.begin_frame(&mut gpu).unwrap();
            ring.commit(&mut gpu, &token).unwrap();
            gpu.signal_semaphore(ring.slot(token.slot()).image_available);
            ring.submit(&mut gpu, token, done).unwrap();
            gpu.consume_semaphore(done);
        }
        let err = ring.begin_frame(&mut gpu).unwrap_err();
        assert!(matches!(err, RenderError::FenceWait { slot: 0, .. }));
        assert!(!err.is_recoverable());

        gpu.retire_all();
        assert!(ring.begin_frame(&mut gpu).is_ok());
        let waits = gpu
            .events()
            .iter()
            .filter(|e| matches!(e, Event::WaitFence { .. }))
            .count();
        assert_eq!(waits, 4);
    }

    #[test]
    fn failed_construction_releases_built_slots() {
        let mut gpu = SimGpu::new();
        gpu.limit_live(ObjectKind::Semaphore, 1);
        let err = FrameRing::new(&mut gpu, FRAMES_IN_FLIGHT, T).unwrap_err();
        assert!(matches!(err, RenderError::Device { .. }));
        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn destroy_releases_every_object() {
        let mut gpu = SimGpu::new();
        let mut ring = ring(&mut gpu);
        ring.destroy(&mut gpu);
        assert_eq!(gpu.live_objects(), 0);
    }
}
