//! Sampled image textures and user-supplied render buffers.
//!
//! Image textures carry their initial texels in a staging buffer until the
//! first flush that uses them records the upload and mip-chain generation.
//! The staging buffer is then retired through the purgatory, since the
//! copy it feeds has only been recorded, not executed.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use crate::buffer_ring::BufferRing;
use crate::device::{
    BufferUsage, CmdBuf, Device, ImageLayout, TextureDesc, TextureFormat, TextureUsage,
};
use crate::purgatory::ResourcePurgatory;
use crate::resource::{GpuBuffer, Texture};
use crate::Result;

pub struct ImageTexture<D: Device> {
    texture: Texture<D>,
    pending_upload: RefCell<Option<GpuBuffer<D>>>,
    // Descriptor set written for this texture during the current frame.
    bound_set: Cell<Option<D::DescriptorSet>>,
    bound_frame: Cell<u64>,
}

impl<D: Device> ImageTexture<D> {
    /// Creates a mipmapped RGBA8 texture whose texels are uploaded at the
    /// next flush that draws with it.
    pub fn new(
        device: &Rc<D>,
        width: u32,
        height: u32,
        mip_levels: u32,
        texels: &[u8],
    ) -> Result<Rc<Self>> {
        debug_assert_eq!(texels.len() as u64, width as u64 * height as u64 * 4);
        debug_assert!(mip_levels >= 1);
        let texture = Texture::new(
            device,
            TextureDesc {
                width,
                height,
                mip_levels,
                format: TextureFormat::Rgba8,
                usage: TextureUsage::SAMPLED
                    | TextureUsage::COPY_DST
                    | TextureUsage::COPY_SRC,
            },
        )?;
        let staging = GpuBuffer::new(
            device,
            texels.len() as u64,
            BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
        )?;
        staging.write(0, texels)?;
        Ok(Rc::new(ImageTexture {
            texture,
            pending_upload: RefCell::new(Some(staging)),
            bound_set: Cell::new(None),
            bound_frame: Cell::new(0),
        }))
    }

    pub fn texture(&self) -> &Texture<D> {
        &self.texture
    }

    /// Records the pending upload and mip-chain generation, if any.
    ///
    /// Level 0 is copied from staging, then each level is blitted from the
    /// one above it, with the source level transitioned to transfer-src
    /// first. Afterwards every level is shader-readable. Exactly
    /// `mip_levels - 1` blits are recorded.
    pub(crate) fn synchronize(
        &self,
        cmd: &mut D::CmdBuf,
        purgatory: &mut ResourcePurgatory<D>,
        current_frame: u64,
    ) {
        let Some(staging) = self.pending_upload.borrow_mut().take() else {
            return;
        };
        let desc = *self.texture.desc();
        let raw = self.texture.raw();
        cmd.texture_barrier(
            raw,
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
            0..desc.mip_levels,
        );
        cmd.copy_buffer_to_texture(staging.raw(), 0, desc.width, raw, desc.width, desc.height);
        let mut level_width = desc.width;
        let mut level_height = desc.height;
        for level in 1..desc.mip_levels {
            cmd.texture_barrier(
                raw,
                ImageLayout::TransferDst,
                ImageLayout::TransferSrc,
                level - 1..level,
            );
            cmd.blit_mip(raw, level - 1, level_width, level_height);
            level_width = (level_width / 2).max(1);
            level_height = (level_height / 2).max(1);
        }
        if desc.mip_levels > 1 {
            cmd.texture_barrier(
                raw,
                ImageLayout::TransferSrc,
                ImageLayout::ShaderRead,
                0..desc.mip_levels - 1,
            );
        }
        cmd.texture_barrier(
            raw,
            ImageLayout::TransferDst,
            ImageLayout::ShaderRead,
            desc.mip_levels - 1..desc.mip_levels,
        );
        self.texture.set_layout(ImageLayout::ShaderRead);
        purgatory.retire(staging, current_frame);
    }

    /// The descriptor set written for this texture during `frame`, if any.
    pub(crate) fn frame_descriptor_set(&self, frame: u64) -> Option<D::DescriptorSet> {
        if self.bound_frame.get() == frame {
            self.bound_set.get()
        } else {
            None
        }
    }

    pub(crate) fn store_frame_descriptor_set(&self, set: D::DescriptorSet, frame: u64) {
        self.bound_set.set(Some(set));
        self.bound_frame.set(frame);
    }
}

/// A caller-owned vertex or index stream, ring-buffered like the internal
/// upload buffers so the CPU can rewrite it every frame.
pub struct RenderBuffer<D: Device> {
    ring: RefCell<BufferRing<D>>,
    size: u64,
    mapped_once: Cell<bool>,
}

impl<D: Device> RenderBuffer<D> {
    pub fn new(device: &Rc<D>, usage: BufferUsage, size: u64) -> Result<Rc<Self>> {
        Ok(Rc::new(RenderBuffer {
            ring: RefCell::new(BufferRing::new(device, usage, size)?),
            size,
            mapped_once: Cell::new(false),
        }))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Rotates to a slot the GPU has retired and writes `bytes` into it.
    ///
    /// The caller must respect the same frame discipline as the internal
    /// rings: at most one write per logical frame.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        debug_assert!(bytes.len() as u64 <= self.size);
        let mut ring = self.ring.borrow_mut();
        ring.advance()?;
        ring.write(0, bytes)?;
        self.mapped_once.set(true);
        Ok(())
    }

    /// The slot to draw from. Requires at least one prior [`write`].
    ///
    /// [`write`]: RenderBuffer::write
    pub(crate) fn current(&self) -> Ref<'_, GpuBuffer<D>> {
        debug_assert!(self.mapped_once.get(), "render buffer drawn before write");
        Ref::map(self.ring.borrow(), |ring| ring.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{Event, StubDevice};

    #[test]
    fn mip_synchronize_records_one_blit_per_level() {
        let device = Rc::new(StubDevice::new());
        let texels = vec![0u8; 16 * 16 * 4];
        let image = ImageTexture::new(&device, 16, 16, 5, &texels).unwrap();
        let mut purgatory = ResourcePurgatory::new();
        let mut cmd = device.new_cmd_buf();
        image.synchronize(&mut cmd, &mut purgatory, 1);

        let blits = device.count_events(|e| matches!(e, Event::BlitMip { .. }));
        assert_eq!(blits, 4);
        // Staging buffer is deferred, not destroyed.
        assert_eq!(purgatory.len(), 1);
        // Final layout of the whole chain is shader-read.
        assert_eq!(image.texture().layout(), ImageLayout::ShaderRead);
    }

    #[test]
    fn synchronize_is_recorded_once() {
        let device = Rc::new(StubDevice::new());
        let texels = vec![0u8; 4 * 4 * 4];
        let image = ImageTexture::new(&device, 4, 4, 3, &texels).unwrap();
        let mut purgatory = ResourcePurgatory::new();
        let mut cmd = device.new_cmd_buf();
        image.synchronize(&mut cmd, &mut purgatory, 1);
        let uploads = device.count_events(|e| matches!(e, Event::CopyBufferToTexture { .. }));
        image.synchronize(&mut cmd, &mut purgatory, 2);
        assert_eq!(
            device.count_events(|e| matches!(e, Event::CopyBufferToTexture { .. })),
            uploads
        );
    }

    #[test]
    fn render_buffer_asserts_frame_discipline() {
        let device = Rc::new(StubDevice::new());
        let buffer = RenderBuffer::new(&device, BufferUsage::VERTEX, 64).unwrap();
        buffer.write(&[1, 2, 3, 4]).unwrap();
        // Draw-time access works after a write.
        let _ = buffer.current();
    }
}
