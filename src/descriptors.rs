//! Descriptor set pools and their recycler.
//!
//! Every flush checks out a pool with fixed limits, allocates sets
//! arena-style, and checks the pool back in stamped with the frame that
//! used it. Reuse resets the whole pool in one call instead of freeing
//! sets individually. If a flush outgrows a pool (too many distinct image
//! textures), it simply checks out another one mid-flush.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::device::{DescriptorPoolLimits, Device};
use crate::pls::BUFFER_RING_SIZE;
use crate::purgatory::ResourcePurgatory;
use crate::Result;

/// Per-flush descriptor update limits.
pub const MAX_UNIFORM_UPDATES: u32 = 3;
pub const MAX_DYNAMIC_UNIFORM_UPDATES: u32 = 1;
pub const MAX_IMAGE_TEXTURE_UPDATES: u32 = 256;
pub const MAX_SAMPLED_IMAGE_UPDATES: u32 = 2 + MAX_IMAGE_TEXTURE_UPDATES;
pub const MAX_STORAGE_BUFFER_UPDATES: u32 = 6;
pub const MAX_INPUT_ATTACHMENT_UPDATES: u32 = 4;
pub const MAX_STORAGE_IMAGE_UPDATES: u32 = 1;
pub const MAX_DESCRIPTOR_SETS: u32 = 3 + MAX_IMAGE_TEXTURE_UPDATES;

/// Idle pools kept around for reuse before we start destroying them.
pub const MAX_POOLS_IN_SERVICE: usize = 64;

pub(crate) fn flush_pool_limits() -> DescriptorPoolLimits {
    DescriptorPoolLimits {
        uniform_buffers: MAX_UNIFORM_UPDATES,
        dynamic_uniform_buffers: MAX_DYNAMIC_UNIFORM_UPDATES,
        storage_buffers: MAX_STORAGE_BUFFER_UPDATES,
        sampled_textures: MAX_SAMPLED_IMAGE_UPDATES,
        samplers: 0,
        input_attachments: MAX_INPUT_ATTACHMENT_UPDATES,
        storage_textures: MAX_STORAGE_IMAGE_UPDATES,
        max_sets: MAX_DESCRIPTOR_SETS,
    }
}

/// One fixed-limit pool. Sets are allocated arena-style and freed only by
/// resetting the whole pool.
pub struct DescriptorSetPool<D: Device> {
    device: Rc<D>,
    raw: D::DescriptorPool,
    max_sets: u32,
    sets_allocated: Cell<u32>,
}

impl<D: Device> DescriptorSetPool<D> {
    pub fn new(device: &Rc<D>) -> Result<Self> {
        Self::with_limits(device, &flush_pool_limits())
    }

    /// A pool with custom limits, for long-lived sets that never recycle
    /// (the null image and sampler sets).
    pub fn with_limits(device: &Rc<D>, limits: &DescriptorPoolLimits) -> Result<Self> {
        let raw = device.create_descriptor_pool(limits)?;
        Ok(DescriptorSetPool {
            device: device.clone(),
            raw,
            max_sets: limits.max_sets,
            sets_allocated: Cell::new(0),
        })
    }

    pub fn allocate(&self, layout: &D::DescriptorSetLayout) -> Result<D::DescriptorSet> {
        debug_assert!(self.sets_allocated.get() < self.max_sets);
        let set = self.device.allocate_descriptor_set(&self.raw, layout)?;
        self.sets_allocated.set(self.sets_allocated.get() + 1);
        Ok(set)
    }

    pub fn sets_allocated(&self) -> u32 {
        self.sets_allocated.get()
    }

    pub fn raw(&self) -> &D::DescriptorPool {
        &self.raw
    }

    /// Bulk-frees every set. The caller (the recycler) guarantees the GPU
    /// is done with them.
    fn reset(&self) {
        unsafe {
            self.device.reset_descriptor_pool(&self.raw);
        }
        self.sets_allocated.set(0);
    }
}

impl<D: Device> Drop for DescriptorSetPool<D> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(&self.raw);
        }
    }
}

struct IdlePool<D: Device> {
    pool: DescriptorSetPool<D>,
    expiration_frame: u64,
}

/// Checkout/checkin recycler for flush descriptor pools.
pub struct DescriptorPoolManager<D: Device> {
    device: Rc<D>,
    idle: VecDeque<IdlePool<D>>,
}

impl<D: Device> DescriptorPoolManager<D> {
    pub fn new(device: &Rc<D>) -> Self {
        DescriptorPoolManager {
            device: device.clone(),
            idle: VecDeque::new(),
        }
    }

    /// Hands out a pool with zero live sets. Reuses the oldest idle pool
    /// if the GPU has retired the frame that last used it.
    pub fn checkout(&mut self, current_frame: u64) -> Result<DescriptorSetPool<D>> {
        if self
            .idle
            .front()
            .map_or(false, |front| front.expiration_frame <= current_frame)
        {
            if let Some(idle) = self.idle.pop_front() {
                idle.pool.reset();
                return Ok(idle.pool);
            }
        }
        log::debug!(
            "allocating descriptor pool ({} in service)",
            self.idle.len() + 1
        );
        DescriptorSetPool::new(&self.device)
    }

    /// Returns a pool whose sets were referenced by `current_frame`'s
    /// command buffer. Overflow beyond the in-service cap goes to the
    /// purgatory instead.
    pub fn checkin(
        &mut self,
        pool: DescriptorSetPool<D>,
        current_frame: u64,
        purgatory: &mut ResourcePurgatory<D>,
    ) {
        if self.idle.len() < MAX_POOLS_IN_SERVICE {
            self.idle.push_back(IdlePool {
                pool,
                expiration_frame: current_frame + BUFFER_RING_SIZE as u64,
            });
        } else {
            purgatory.retire(pool, current_frame);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubDevice;

    #[test]
    fn checkout_reuses_and_resets_expired_pools() {
        let device = Rc::new(StubDevice::new());
        let mut purgatory = ResourcePurgatory::new();
        let mut manager = DescriptorPoolManager::new(&device);

        let pool = manager.checkout(1).unwrap();
        let id = device.pool_id(pool.raw());
        manager.checkin(pool, 1, &mut purgatory);

        // Not expired yet: a fresh pool is created.
        let other = manager.checkout(2).unwrap();
        assert_ne!(device.pool_id(other.raw()), id);
        manager.checkin(other, 2, &mut purgatory);

        // Frame 4 >= 1 + ring depth: the first pool comes back, reset.
        let reused = manager.checkout(4).unwrap();
        assert_eq!(device.pool_id(reused.raw()), id);
        assert_eq!(device.pool_reset_count(reused.raw()), 1);
        assert_eq!(reused.sets_allocated(), 0);
    }

    #[test]
    fn checkin_overflow_goes_to_purgatory() {
        let device = Rc::new(StubDevice::new());
        let mut purgatory = ResourcePurgatory::new();
        let mut manager = DescriptorPoolManager::new(&device);

        let mut pools = Vec::new();
        for _ in 0..MAX_POOLS_IN_SERVICE + 1 {
            pools.push(manager.checkout(1).unwrap());
        }
        for pool in pools {
            manager.checkin(pool, 1, &mut purgatory);
        }
        assert_eq!(manager.idle_count(), MAX_POOLS_IN_SERVICE);
        assert_eq!(purgatory.len(), 1);
    }
}
