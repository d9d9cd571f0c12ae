//! Interlock strategies.
//!
//! Everywhere the flush sequence depends on how per-pixel ordering is
//! achieved, it goes through one of these strategy objects instead of
//! branching on the mode inline. The variants are sealed; callers pick one
//! with [`strategy`].

use smallvec::SmallVec;

use crate::device::{AttachmentDesc, ClearValue, CmdBuf, Device, ImageLayout, LoadOp, TextureFormat};
use crate::pls::{InterlockMode, LoadAction, ShaderFeatures, ShaderMiscFlags};
use crate::render_target::RenderTarget;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::RasterOrderingInterlock {}
    impl Sealed for super::AtomicsInterlock {}
}

pub(crate) trait Interlock<D: Device>: sealed::Sealed {
    fn mode(&self) -> InterlockMode;

    /// Number of color attachments in the draw pass, including unused
    /// slots.
    fn attachment_count(&self) -> u32;

    /// Bit `i` set marks color slot `i` as unused.
    fn unused_color_mask(&self) -> u32;

    fn rasterization_ordered(&self) -> bool;

    fn by_region_self_dependency(&self) -> bool;

    /// Attachment descriptions for the draw render pass, color first.
    fn attachment_descs(
        &self,
        format: TextureFormat,
        load: LoadAction,
    ) -> SmallVec<[AttachmentDesc; 4]>;

    /// Clear values matching `attachment_descs`, in order.
    fn clear_values(
        &self,
        clear_color: [f32; 4],
        coverage_clear: u32,
    ) -> SmallVec<[ClearValue; 4]>;

    /// Framebuffer attachments after the color target, in attachment
    /// order.
    fn plane_views<'a>(&self, target: &'a RenderTarget<D>) -> SmallVec<[&'a D::TextureView; 3]>;

    /// Writes the PLS plane bindings into a freshly allocated set.
    fn write_pls_descriptors(&self, device: &D, set: D::DescriptorSet, target: &RenderTarget<D>);

    /// Records setup before the draw pass begins. Returns whether the
    /// first batch must be preceded by a visibility barrier.
    fn prepare(
        &self,
        cmd: &mut D::CmdBuf,
        target: &RenderTarget<D>,
        load: LoadAction,
        coverage_clear: u32,
    ) -> bool;

    /// Visibility barrier between dependent batches inside the pass.
    fn draw_barrier(&self, cmd: &mut D::CmdBuf);

    /// Extra shader variant flags for the resolve batch.
    fn resolve_misc_flags(
        &self,
        combined_features: ShaderFeatures,
        offscreen: bool,
    ) -> ShaderMiscFlags;
}

/// Attachment slot order of the PLS planes. Also the input-attachment
/// binding order in the PLS descriptor set.
pub(crate) const COLOR_PLANE_IDX: u32 = 0;
pub(crate) const COVERAGE_PLANE_IDX: u32 = 1;
pub(crate) const CLIP_PLANE_IDX: u32 = 2;
pub(crate) const SCRATCH_COLOR_PLANE_IDX: u32 = 3;

pub(crate) struct RasterOrderingInterlock;
pub(crate) struct AtomicsInterlock;

pub(crate) fn strategy<D: Device>(mode: InterlockMode) -> Option<&'static dyn Interlock<D>> {
    match mode {
        InterlockMode::RasterOrdering => Some(&RasterOrderingInterlock),
        InterlockMode::Atomics => Some(&AtomicsInterlock),
        InterlockMode::DepthStencil => None,
    }
}

fn color_load_op(load: LoadAction) -> LoadOp {
    match load {
        LoadAction::Clear => LoadOp::Clear,
        LoadAction::PreserveRenderTarget => LoadOp::Load,
        LoadAction::DontCare => LoadOp::DontCare,
    }
}

impl<D: Device> Interlock<D> for RasterOrderingInterlock {
    fn mode(&self) -> InterlockMode {
        InterlockMode::RasterOrdering
    }

    fn attachment_count(&self) -> u32 {
        4
    }

    fn unused_color_mask(&self) -> u32 {
        0
    }

    fn rasterization_ordered(&self) -> bool {
        true
    }

    fn by_region_self_dependency(&self) -> bool {
        false
    }

    fn attachment_descs(
        &self,
        format: TextureFormat,
        load: LoadAction,
    ) -> SmallVec<[AttachmentDesc; 4]> {
        // Self-read attachments live in the general layout for the whole
        // pass.
        let mut descs = SmallVec::new();
        descs.push(AttachmentDesc {
            format,
            load_op: color_load_op(load),
            store: true,
            general_layout: true,
        });
        descs.push(AttachmentDesc {
            format: TextureFormat::R32Uint,
            load_op: LoadOp::Clear,
            store: false,
            general_layout: true,
        });
        descs.push(AttachmentDesc {
            format: TextureFormat::R32Uint,
            load_op: LoadOp::Clear,
            store: false,
            general_layout: true,
        });
        descs.push(AttachmentDesc {
            format: TextureFormat::Rgba8,
            load_op: LoadOp::DontCare,
            store: false,
            general_layout: true,
        });
        descs
    }

    fn clear_values(
        &self,
        clear_color: [f32; 4],
        coverage_clear: u32,
    ) -> SmallVec<[ClearValue; 4]> {
        let mut values = SmallVec::new();
        values.push(ClearValue::Color(clear_color));
        values.push(ClearValue::Uint([coverage_clear, 0, 0, 0]));
        values.push(ClearValue::Uint([0; 4]));
        values.push(ClearValue::Color([0.0; 4]));
        values
    }

    fn plane_views<'a>(&self, target: &'a RenderTarget<D>) -> SmallVec<[&'a D::TextureView; 3]> {
        let mut views = SmallVec::new();
        views.push(target.coverage().view());
        views.push(target.clip().view());
        views.push(target.scratch_color().view());
        views
    }

    fn write_pls_descriptors(&self, device: &D, set: D::DescriptorSet, target: &RenderTarget<D>) {
        use crate::device::TextureBinding;
        device.update_texture_bindings(
            set,
            COLOR_PLANE_IDX,
            crate::device::BindingKind::InputAttachment,
            &[
                TextureBinding {
                    view: target.target().view(),
                    layout: ImageLayout::General,
                },
                TextureBinding {
                    view: target.coverage().view(),
                    layout: ImageLayout::General,
                },
                TextureBinding {
                    view: target.clip().view(),
                    layout: ImageLayout::General,
                },
                TextureBinding {
                    view: target.scratch_color().view(),
                    layout: ImageLayout::General,
                },
            ],
        );
    }

    fn prepare(
        &self,
        _cmd: &mut D::CmdBuf,
        _target: &RenderTarget<D>,
        _load: LoadAction,
        _coverage_clear: u32,
    ) -> bool {
        // Planes are cleared by their load ops; the hardware orders
        // everything else.
        false
    }

    fn draw_barrier(&self, _cmd: &mut D::CmdBuf) {
        debug_assert!(false, "raster ordering never needs draw barriers");
    }

    fn resolve_misc_flags(
        &self,
        _combined_features: ShaderFeatures,
        _offscreen: bool,
    ) -> ShaderMiscFlags {
        ShaderMiscFlags::empty()
    }
}

impl<D: Device> Interlock<D> for AtomicsInterlock {
    fn mode(&self) -> InterlockMode {
        InterlockMode::Atomics
    }

    fn attachment_count(&self) -> u32 {
        3
    }

    fn unused_color_mask(&self) -> u32 {
        1 << COVERAGE_PLANE_IDX
    }

    fn rasterization_ordered(&self) -> bool {
        false
    }

    fn by_region_self_dependency(&self) -> bool {
        true
    }

    fn attachment_descs(
        &self,
        format: TextureFormat,
        load: LoadAction,
    ) -> SmallVec<[AttachmentDesc; 4]> {
        let mut descs = SmallVec::new();
        descs.push(AttachmentDesc {
            format,
            load_op: color_load_op(load),
            store: true,
            general_layout: true,
        });
        // Placeholder for the unused coverage slot; coverage lives in a
        // storage image in this mode.
        descs.push(AttachmentDesc {
            format: TextureFormat::R32Uint,
            load_op: LoadOp::DontCare,
            store: false,
            general_layout: true,
        });
        descs.push(AttachmentDesc {
            format: TextureFormat::R32Uint,
            load_op: LoadOp::Clear,
            store: false,
            general_layout: true,
        });
        descs
    }

    fn clear_values(
        &self,
        clear_color: [f32; 4],
        _coverage_clear: u32,
    ) -> SmallVec<[ClearValue; 4]> {
        let mut values = SmallVec::new();
        values.push(ClearValue::Color(clear_color));
        values.push(ClearValue::Uint([0; 4]));
        values.push(ClearValue::Uint([0; 4]));
        values
    }

    fn plane_views<'a>(&self, target: &'a RenderTarget<D>) -> SmallVec<[&'a D::TextureView; 3]> {
        let mut views = SmallVec::new();
        // The unused coverage slot still needs a compatible view bound;
        // the clip view stands in. The storage coverage image stays out
        // of the framebuffer so its transfer clear survives pass begin.
        views.push(target.clip().view());
        views.push(target.clip().view());
        views
    }

    fn write_pls_descriptors(&self, device: &D, set: D::DescriptorSet, target: &RenderTarget<D>) {
        use crate::device::{BindingKind, TextureBinding};
        device.update_texture_bindings(
            set,
            COLOR_PLANE_IDX,
            BindingKind::InputAttachment,
            &[TextureBinding {
                view: target.target().view(),
                layout: ImageLayout::General,
            }],
        );
        device.update_texture_bindings(
            set,
            COVERAGE_PLANE_IDX,
            BindingKind::StorageTexture,
            &[TextureBinding {
                view: target.coverage_atomic().view(),
                layout: ImageLayout::General,
            }],
        );
        device.update_texture_bindings(
            set,
            CLIP_PLANE_IDX,
            BindingKind::InputAttachment,
            &[TextureBinding {
                view: target.clip().view(),
                layout: ImageLayout::General,
            }],
        );
    }

    fn prepare(
        &self,
        cmd: &mut D::CmdBuf,
        target: &RenderTarget<D>,
        load: LoadAction,
        coverage_clear: u32,
    ) -> bool {
        // The storage-image coverage plane can't be cleared by a load op;
        // clear it with a transfer op between explicit transitions.
        let coverage = target.coverage_atomic();
        coverage.barrier_to(cmd, ImageLayout::TransferDst);
        cmd.clear_texture(coverage.raw(), ClearValue::Uint([coverage_clear, 0, 0, 0]));
        coverage.barrier_to(cmd, ImageLayout::General);
        load == LoadAction::Clear
    }

    fn draw_barrier(&self, cmd: &mut D::CmdBuf) {
        cmd.attachment_read_barrier();
    }

    fn resolve_misc_flags(
        &self,
        combined_features: ShaderFeatures,
        offscreen: bool,
    ) -> ShaderMiscFlags {
        if offscreen && combined_features.contains(ShaderFeatures::ENABLE_ADVANCED_BLEND) {
            ShaderMiscFlags::COALESCED_RESOLVE_AND_TRANSFER
        } else {
            ShaderMiscFlags::empty()
        }
    }
}
