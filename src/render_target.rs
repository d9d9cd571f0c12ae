//! Render targets and their auxiliary PLS planes.
//!
//! The color target itself is caller-owned; the engine lazily attaches the
//! working planes the active interlock mode needs (coverage, clip, scratch
//! color, or an atomic coverage storage image) and keeps them across
//! flushes. Planes are only allocated the first time a mode needs them;
//! repeated flushes against the same target reuse them untouched.

use std::rc::Rc;

use crate::device::{Device, TextureDesc, TextureFormat, TextureUsage};
use crate::pls::InterlockMode;
use crate::resource::Texture;
use crate::{Error, Result};

pub struct RenderTarget<D: Device> {
    device: Rc<D>,
    target: Rc<Texture<D>>,
    offscreen: bool,
    coverage: Option<Texture<D>>,
    clip: Option<Texture<D>>,
    scratch_color: Option<Texture<D>>,
    coverage_atomic: Option<Texture<D>>,
}

impl<D: Device> RenderTarget<D> {
    /// Wraps a caller-owned color texture. `offscreen` marks targets that
    /// are read back rather than presented; it gates the coalesced atomic
    /// resolve.
    pub fn new(device: &Rc<D>, target: Rc<Texture<D>>, offscreen: bool) -> Result<Self> {
        match target.desc().format {
            TextureFormat::Rgba8 | TextureFormat::Bgra8 => {}
            _ => return Err(Error::Unsupported("render target must be 8-bit color")),
        }
        Ok(RenderTarget {
            device: device.clone(),
            target,
            offscreen,
            coverage: None,
            clip: None,
            scratch_color: None,
            coverage_atomic: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.target.width()
    }

    pub fn height(&self) -> u32 {
        self.target.height()
    }

    pub fn format(&self) -> TextureFormat {
        self.target.desc().format
    }

    pub fn offscreen(&self) -> bool {
        self.offscreen
    }

    pub fn target(&self) -> &Texture<D> {
        &self.target
    }

    /// Ensures the planes `interlock` needs exist. Planes already present
    /// are left alone, whatever mode allocated them.
    pub(crate) fn synchronize(&mut self, interlock: InterlockMode) -> Result<()> {
        match interlock {
            InterlockMode::RasterOrdering => {
                if self.coverage.is_none() {
                    self.coverage = Some(self.plane(TextureFormat::R32Uint, ATTACHMENT_USAGE)?);
                }
                if self.clip.is_none() {
                    self.clip = Some(self.plane(TextureFormat::R32Uint, ATTACHMENT_USAGE)?);
                }
                if self.scratch_color.is_none() {
                    self.scratch_color =
                        Some(self.plane(TextureFormat::Rgba8, ATTACHMENT_USAGE)?);
                }
            }
            InterlockMode::Atomics => {
                if self.clip.is_none() {
                    self.clip = Some(self.plane(TextureFormat::R32Uint, ATTACHMENT_USAGE)?);
                }
                if self.coverage_atomic.is_none() {
                    self.coverage_atomic = Some(self.plane(
                        TextureFormat::R32Uint,
                        TextureUsage::STORAGE | TextureUsage::COPY_DST,
                    )?);
                }
            }
            InterlockMode::DepthStencil => {}
        }
        Ok(())
    }

    fn plane(&self, format: TextureFormat, usage: TextureUsage) -> Result<Texture<D>> {
        Texture::new(
            &self.device,
            TextureDesc {
                width: self.target.width(),
                height: self.target.height(),
                mip_levels: 1,
                format,
                usage,
            },
        )
    }

    pub(crate) fn coverage(&self) -> &Texture<D> {
        plane_ref(&self.coverage)
    }

    pub(crate) fn clip(&self) -> &Texture<D> {
        plane_ref(&self.clip)
    }

    pub(crate) fn scratch_color(&self) -> &Texture<D> {
        plane_ref(&self.scratch_color)
    }

    pub(crate) fn coverage_atomic(&self) -> &Texture<D> {
        plane_ref(&self.coverage_atomic)
    }
}

const ATTACHMENT_USAGE: TextureUsage = TextureUsage::COLOR_ATTACHMENT
    .union(TextureUsage::INPUT_ATTACHMENT);

// Planes are allocated by synchronize() before any accessor runs; a miss
// is an engine bug, not a recoverable condition.
fn plane_ref<D: Device>(plane: &Option<Texture<D>>) -> &Texture<D> {
    match plane {
        Some(t) => t,
        None => unreachable!("plane accessed before synchronize"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubDevice;

    fn target(device: &Rc<StubDevice>) -> RenderTarget<StubDevice> {
        let texture = Rc::new(
            Texture::new(
                device,
                TextureDesc {
                    width: 64,
                    height: 64,
                    mip_levels: 1,
                    format: TextureFormat::Bgra8,
                    usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::INPUT_ATTACHMENT,
                },
            )
            .unwrap(),
        );
        RenderTarget::new(device, texture, false).unwrap()
    }

    #[test]
    fn planes_allocated_once() {
        let device = Rc::new(StubDevice::new());
        let mut rt = target(&device);
        let before = device.texture_create_count();
        rt.synchronize(InterlockMode::RasterOrdering).unwrap();
        let after_first = device.texture_create_count();
        assert_eq!(after_first - before, 3);
        rt.synchronize(InterlockMode::RasterOrdering).unwrap();
        assert_eq!(device.texture_create_count(), after_first);
    }

    #[test]
    fn atomics_reuses_shared_planes() {
        let device = Rc::new(StubDevice::new());
        let mut rt = target(&device);
        rt.synchronize(InterlockMode::RasterOrdering).unwrap();
        let after_raster = device.texture_create_count();
        // Clip is shared; only the atomic coverage image is new.
        rt.synchronize(InterlockMode::Atomics).unwrap();
        assert_eq!(device.texture_create_count() - after_raster, 1);
    }

    #[test]
    fn rejects_non_color_targets() {
        let device = Rc::new(StubDevice::new());
        let texture = Rc::new(
            Texture::new(
                &device,
                TextureDesc {
                    width: 8,
                    height: 8,
                    mip_levels: 1,
                    format: TextureFormat::R32Uint,
                    usage: TextureUsage::COLOR_ATTACHMENT,
                },
            )
            .unwrap(),
        );
        assert!(RenderTarget::new(&device, texture, false).is_err());
    }
}
