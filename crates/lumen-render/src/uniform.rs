// SPDX-License-Identifier: CEPL-1.0
use tracing::debug;

use crate::error::Result;
use crate::gpu::{BufferHandle, BufferUsage, Gpu};
use crate::layout::UniformBlock;

/// One host-visible uniform buffer per frame slot.
///
/// A slot's buffer is only written after that slot's fence was waited on,
/// so the device never reads a block while the host rewrites it.
pub struct UniformChannel {
    buffers: Vec<BufferHandle>,
}

impl UniformChannel {
    pub fn new<G: Gpu>(gpu: &mut G, slots: usize) -> Result<Self> {
        let mut buffers = Vec::with_capacity(slots);
        for _ in 0..slots {
            match gpu.create_buffer(UniformBlock::SIZE, BufferUsage::UNIFORM, true) {
                Ok(b) => buffers.push(b),
                Err(e) => {
                    for b in buffers {
                        gpu.destroy_buffer(b);
                    }
                    return Err(e);
                }
            }
        }
        debug!("uniform channel: {slots} x {} bytes", UniformBlock::SIZE);
        Ok(Self { buffers })
    }

    pub fn update<G: Gpu>(&self, gpu: &mut G, slot: usize, block: &UniformBlock) -> Result<()> {
        gpu.write_mapped(self.buffers[slot], 0, bytemuck::bytes_of(block))
    }

    pub fn buffer(&self, slot: usize) -> BufferHandle {
        self.buffers[slot]
    }

    pub fn destroy<G: Gpu>(&mut self, gpu: &mut G) {
        for b in self.buffers.drain(..) {
            gpu.destroy_buffer(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpu;

    #[test]
    fn writes_land_in_the_slot_buffer_only() {
        let mut gpu = SimGpu::new();
        let mut ch = UniformChannel::new(&mut gpu, 2).unwrap();
        let block = UniformBlock {
            exposure: 3.0,
            ..Default::default()
        };
        ch.update(&mut gpu, 1, &block).unwrap();

        let written = gpu.buffer_contents(ch.buffer(1)).unwrap();
        assert_eq!(written, bytemuck::bytes_of(&block));
        assert!(gpu.buffer_contents(ch.buffer(0)).unwrap().iter().all(|b| *b == 0));

        ch.destroy(&mut gpu);
        assert_eq!(gpu.live_objects(), 0);
    }
}
