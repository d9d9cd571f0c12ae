//! RAII wrappers over raw backend handles.
//!
//! Each wrapper keeps an `Rc` to the device so the handle can be released
//! in `Drop`. Nothing here defers destruction; that is the purgatory's
//! job. Wrappers that may still be referenced by in-flight command buffers
//! must be retired through [`crate::ResourcePurgatory`] instead of being
//! dropped directly.

use std::cell::Cell;
use std::rc::Rc;

use bytemuck::Pod;

use crate::device::{
    BufferUsage, Device, ImageLayout, SamplerParams, TextureDesc,
};
use crate::Result;

/// A device buffer with its backing allocation.
pub struct GpuBuffer<D: Device> {
    device: Rc<D>,
    raw: D::Buffer,
    size: u64,
    usage: BufferUsage,
}

impl<D: Device> GpuBuffer<D> {
    pub fn new(device: &Rc<D>, size: u64, usage: BufferUsage) -> Result<Self> {
        let raw = device.create_buffer(size, usage)?;
        Ok(GpuBuffer {
            device: device.clone(),
            raw,
            size,
            usage,
        })
    }

    pub fn raw(&self) -> &D::Buffer {
        &self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Writes `bytes` at `offset` through a transient mapping.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.usage.contains(BufferUsage::MAP_WRITE));
        debug_assert!(offset + bytes.len() as u64 <= self.size);
        unsafe {
            let ptr = self.device.map_buffer(&self.raw, offset, bytes.len() as u64)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            self.device.unmap_buffer(&self.raw, offset, bytes.len() as u64);
        }
        Ok(())
    }

    pub fn write_pod<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(data))
    }
}

impl<D: Device> Drop for GpuBuffer<D> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(&self.raw);
        }
    }
}

/// A texture plus its default full-range view, with layout bookkeeping.
pub struct Texture<D: Device> {
    device: Rc<D>,
    raw: D::Texture,
    view: D::TextureView,
    desc: TextureDesc,
    layout: Cell<ImageLayout>,
}

impl<D: Device> Texture<D> {
    pub fn new(device: &Rc<D>, desc: TextureDesc) -> Result<Self> {
        let raw = device.create_texture(&desc)?;
        let view = device.create_texture_view(&raw)?;
        Ok(Texture {
            device: device.clone(),
            raw,
            view,
            desc,
            layout: Cell::new(ImageLayout::Undefined),
        })
    }

    pub fn raw(&self) -> &D::Texture {
        &self.raw
    }

    pub fn view(&self) -> &D::TextureView {
        &self.view
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout.get()
    }

    /// Transitions the whole texture to `to`, from the last tracked layout.
    pub fn barrier_to(&self, cmd: &mut D::CmdBuf, to: ImageLayout) {
        use crate::device::CmdBuf as _;
        cmd.texture_barrier(&self.raw, self.layout.get(), to, 0..self.desc.mip_levels);
        self.layout.set(to);
    }

    /// Transitions from `Undefined`, discarding the current contents.
    pub fn discarding_barrier_to(&self, cmd: &mut D::CmdBuf, to: ImageLayout) {
        use crate::device::CmdBuf as _;
        cmd.texture_barrier(&self.raw, ImageLayout::Undefined, to, 0..self.desc.mip_levels);
        self.layout.set(to);
    }

    pub(crate) fn set_layout(&self, layout: ImageLayout) {
        self.layout.set(layout);
    }
}

impl<D: Device> Drop for Texture<D> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_texture_view(&self.view);
            self.device.destroy_texture(&self.raw);
        }
    }
}

pub struct Framebuffer<D: Device> {
    device: Rc<D>,
    raw: D::Framebuffer,
    width: u32,
    height: u32,
}

impl<D: Device> Framebuffer<D> {
    pub fn new(
        device: &Rc<D>,
        render_pass: &D::RenderPass,
        attachments: &[&D::TextureView],
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let raw = device.create_framebuffer(render_pass, attachments, width, height)?;
        Ok(Framebuffer {
            device: device.clone(),
            raw,
            width,
            height,
        })
    }

    pub fn raw(&self) -> &D::Framebuffer {
        &self.raw
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl<D: Device> Drop for Framebuffer<D> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(&self.raw);
        }
    }
}

pub struct Sampler<D: Device> {
    device: Rc<D>,
    raw: D::Sampler,
}

impl<D: Device> Sampler<D> {
    pub fn new(device: &Rc<D>, params: SamplerParams) -> Result<Self> {
        let raw = device.create_sampler(params)?;
        Ok(Sampler {
            device: device.clone(),
            raw,
        })
    }

    pub fn raw(&self) -> &D::Sampler {
        &self.raw
    }
}

impl<D: Device> Drop for Sampler<D> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(&self.raw);
        }
    }
}
