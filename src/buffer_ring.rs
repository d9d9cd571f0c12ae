//! Ring-buffered GPU buffers.
//!
//! Each logical buffer is backed by [`BUFFER_RING_SIZE`] allocations. The
//! CPU only ever writes the slot for the current frame, which
//! [`crate::RenderContext::prepare_to_map_buffers`] guarantees the GPU has
//! retired. Growth is applied lazily to the current slot only; the other
//! slots catch up when the ring rotates to them.

use std::rc::Rc;

use bytemuck::Pod;

use crate::device::{BufferUsage, Device};
use crate::pls::BUFFER_RING_SIZE;
use crate::resource::GpuBuffer;
use crate::Result;

// Allocation granularity. Keeps growth from thrashing on small deltas.
const SIZE_ALIGN: u64 = 256;

pub struct BufferRing<D: Device> {
    buffers: [GpuBuffer<D>; BUFFER_RING_SIZE],
    device: Rc<D>,
    usage: BufferUsage,
    target_size: u64,
    ring_idx: usize,
}

impl<D: Device> BufferRing<D> {
    pub fn new(device: &Rc<D>, usage: BufferUsage, initial_size: u64) -> Result<Self> {
        let usage = usage | BufferUsage::MAP_WRITE;
        let size = align_size(initial_size);
        let buffers = [
            GpuBuffer::new(device, size, usage)?,
            GpuBuffer::new(device, size, usage)?,
            GpuBuffer::new(device, size, usage)?,
        ];
        Ok(BufferRing {
            buffers,
            device: device.clone(),
            usage,
            target_size: size,
            ring_idx: 0,
        })
    }

    /// Requests capacity for subsequent frames. Only grows; the ring never
    /// shrinks mid-run.
    pub fn set_target_size(&mut self, size: u64) {
        self.target_size = self.target_size.max(align_size(size));
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    /// Rotates to the next slot and reallocates it if it lags the target
    /// size. Must only be called once the GPU is done with the slot.
    pub fn advance(&mut self) -> Result<()> {
        self.ring_idx = (self.ring_idx + 1) % BUFFER_RING_SIZE;
        if self.buffers[self.ring_idx].size() < self.target_size {
            self.buffers[self.ring_idx] =
                GpuBuffer::new(&self.device, self.target_size, self.usage)?;
        }
        Ok(())
    }

    pub fn current(&self) -> &GpuBuffer<D> {
        &self.buffers[self.ring_idx]
    }

    pub fn current_raw(&self) -> &D::Buffer {
        self.buffers[self.ring_idx].raw()
    }

    /// Writes into the current slot.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.buffers[self.ring_idx].write(offset, bytes)
    }

    pub fn write_pod<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.buffers[self.ring_idx].write_pod(offset, data)
    }
}

fn align_size(size: u64) -> u64 {
    size.max(SIZE_ALIGN).next_multiple_of(SIZE_ALIGN)
}
