//! Deferred destruction of resources the GPU may still be reading.
//!
//! A resource retired at frame `F` may still be referenced by command
//! buffers from frames `F - (R-1) ..= F`, so it must outlive them. Rather
//! than track fences per resource, the purgatory stamps each entry with
//! `F + R` and destroys expired prefixes once per frame, after the frame's
//! ring-slot fence wait has already proven that old work retired.

use std::collections::VecDeque;

use crate::descriptors::DescriptorSetPool;
use crate::device::Device;
use crate::pls::BUFFER_RING_SIZE;
use crate::resource::{Framebuffer, GpuBuffer, Texture};

/// A resource awaiting destruction. Dropping the entry destroys it.
pub enum Retired<D: Device> {
    Buffer(GpuBuffer<D>),
    Texture(Texture<D>),
    Framebuffer(Framebuffer<D>),
    DescriptorPool(DescriptorSetPool<D>),
}

impl<D: Device> From<GpuBuffer<D>> for Retired<D> {
    fn from(r: GpuBuffer<D>) -> Self {
        Retired::Buffer(r)
    }
}

impl<D: Device> From<Texture<D>> for Retired<D> {
    fn from(r: Texture<D>) -> Self {
        Retired::Texture(r)
    }
}

impl<D: Device> From<Framebuffer<D>> for Retired<D> {
    fn from(r: Framebuffer<D>) -> Self {
        Retired::Framebuffer(r)
    }
}

impl<D: Device> From<DescriptorSetPool<D>> for Retired<D> {
    fn from(r: DescriptorSetPool<D>) -> Self {
        Retired::DescriptorPool(r)
    }
}

struct Zombie<D: Device> {
    resource: Retired<D>,
    expiration_frame: u64,
}

pub struct ResourcePurgatory<D: Device> {
    queue: VecDeque<Zombie<D>>,
}

impl<D: Device> ResourcePurgatory<D> {
    pub fn new() -> Self {
        ResourcePurgatory {
            queue: VecDeque::new(),
        }
    }

    /// Hands a resource over for destruction at `current_frame +
    /// BUFFER_RING_SIZE` or later.
    pub fn retire(&mut self, resource: impl Into<Retired<D>>, current_frame: u64) {
        let expiration_frame = current_frame + BUFFER_RING_SIZE as u64;
        // Monotonic frames keep the queue sorted, so reclaim can stop at
        // the first live entry.
        debug_assert!(self
            .queue
            .back()
            .map_or(true, |z| z.expiration_frame <= expiration_frame));
        self.queue.push_back(Zombie {
            resource: resource.into(),
            expiration_frame,
        });
    }

    /// Destroys every expired resource. Called once per frame, after the
    /// ring-slot fence wait.
    pub fn reclaim(&mut self, current_frame: u64) {
        while let Some(zombie) = self.queue.front() {
            if zombie.expiration_frame > current_frame {
                break;
            }
            drop(self.queue.pop_front());
        }
    }

    /// Destroys everything immediately. Only valid once the device is
    /// idle.
    pub fn drain(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<D: Device> Default for ResourcePurgatory<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::device::BufferUsage;
    use crate::stub::StubDevice;

    #[test]
    fn holds_resources_for_ring_depth_frames() {
        let device = Rc::new(StubDevice::new());
        let mut purgatory = ResourcePurgatory::new();
        let buf = GpuBuffer::new(&device, 64, BufferUsage::STORAGE).unwrap();
        let id = device.buffer_id(buf.raw());
        purgatory.retire(buf, 5);
        for frame in 5..8 {
            purgatory.reclaim(frame);
            assert!(!device.buffer_destroyed(id), "destroyed at frame {frame}");
        }
        purgatory.reclaim(8);
        assert!(device.buffer_destroyed(id));
        assert!(purgatory.is_empty());
    }

    #[test]
    fn reclaims_expired_prefix_only() {
        let device = Rc::new(StubDevice::new());
        let mut purgatory = ResourcePurgatory::new();
        let old = GpuBuffer::new(&device, 64, BufferUsage::STORAGE).unwrap();
        let new = GpuBuffer::new(&device, 64, BufferUsage::STORAGE).unwrap();
        let old_id = device.buffer_id(old.raw());
        let new_id = device.buffer_id(new.raw());
        purgatory.retire(old, 1);
        purgatory.retire(new, 2);
        purgatory.reclaim(4);
        assert!(device.buffer_destroyed(old_id));
        assert!(!device.buffer_destroyed(new_id));
        assert_eq!(purgatory.len(), 1);
    }
}
