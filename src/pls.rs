//! The core data model: draw classification, interlock modes, shader
//! feature sets, and the key arithmetic for the variant caches.

use std::rc::Rc;

use bitflags::bitflags;

use crate::device::{Device, TextureFormat};
use crate::image::{ImageTexture, RenderBuffer};
use crate::render_target::RenderTarget;

/// Depth of every ring-buffered resource. A CPU frame may only write slot
/// `frame % BUFFER_RING_SIZE`, and only after the fence for the frame that
/// last used that slot has signaled.
pub const BUFFER_RING_SIZE: usize = 3;

/// Width in texels of the gradient color ramp texture. Rows grow.
pub const GRAD_TEXTURE_WIDTH: u32 = 256;

/// Width in texels of the tessellation vertex texture. Rows grow.
pub const TESS_TEXTURE_WIDTH: u32 = 2048;

/// Byte strides of the structured storage buffer elements. These must
/// match the shader-side struct layouts; the engine only uses them to turn
/// element indices into binding offsets.
pub const PATH_DATA_STRIDE: u64 = 64;
pub const PAINT_DATA_STRIDE: u64 = 8;
pub const PAINT_AUX_DATA_STRIDE: u64 = 64;
pub const CONTOUR_DATA_STRIDE: u64 = 32;

/// Stride between per-batch image draw uniform blocks. Matches the
/// minimum dynamic uniform buffer offset alignment we require.
pub const IMAGE_DRAW_UNIFORM_STRIDE: u64 = 256;

/// How a draw batch sources its vertices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrawType {
    /// Instanced midpoint-fan patches from the shared patch buffers.
    MidpointFanPatches,
    /// Instanced outer-cubic patches from the shared patch buffers.
    OuterCurvePatches,
    /// Raw triangles from the per-flush triangle ring.
    InteriorTriangulation,
    /// A rectangle from the shared image-rect buffers.
    ImageRect,
    /// A user mesh from render buffers.
    ImageMesh,
    /// The full-screen resolve strip that ends an atomic-mode flush.
    AtomicResolve,
}

impl DrawType {
    pub(crate) fn index(self) -> u64 {
        match self {
            DrawType::MidpointFanPatches => 0,
            DrawType::OuterCurvePatches => 1,
            DrawType::InteriorTriangulation => 2,
            DrawType::ImageRect => 3,
            DrawType::ImageMesh => 4,
            DrawType::AtomicResolve => 5,
        }
    }
}

/// How the pipeline keeps per-pixel PLS access ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterlockMode {
    /// Hardware raster-order access to self-read color attachments.
    RasterOrdering,
    /// Atomic coverage in a storage image, with explicit in-pass barriers
    /// between dependent batches.
    Atomics,
    /// Recognized but not implemented by this engine; flushes are no-ops.
    DepthStencil,
}

impl InterlockMode {
    pub(crate) fn index(self) -> u64 {
        match self {
            InterlockMode::RasterOrdering => 0,
            InterlockMode::Atomics => 1,
            InterlockMode::DepthStencil => 2,
        }
    }
}

/// What happens to the render target's contents at the start of the draw
/// pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadAction {
    Clear,
    PreserveRenderTarget,
    DontCare,
}

bitflags! {
    /// Feature toggles that select a draw shader variant. Each maps to one
    /// boolean specialization constant, in constant-id order.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderFeatures: u32 {
        const ENABLE_CLIPPING = 1 << 0;
        const ENABLE_CLIP_RECT = 1 << 1;
        const ENABLE_ADVANCED_BLEND = 1 << 2;
        const ENABLE_EVEN_ODD = 1 << 3;
        const ENABLE_NESTED_CLIPPING = 1 << 4;
        const ENABLE_HSL_BLEND_MODES = 1 << 5;
    }
}

pub(crate) const SHADER_FEATURE_COUNT: u32 = 6;

impl ShaderFeatures {
    /// Specialization constant values, by constant id.
    pub(crate) fn toggles(self) -> [bool; SHADER_FEATURE_COUNT as usize] {
        [
            self.contains(ShaderFeatures::ENABLE_CLIPPING),
            self.contains(ShaderFeatures::ENABLE_CLIP_RECT),
            self.contains(ShaderFeatures::ENABLE_ADVANCED_BLEND),
            self.contains(ShaderFeatures::ENABLE_EVEN_ODD),
            self.contains(ShaderFeatures::ENABLE_NESTED_CLIPPING),
            self.contains(ShaderFeatures::ENABLE_HSL_BLEND_MODES),
        ]
    }
}

bitflags! {
    /// Rarely-used variant selectors that are orthogonal to
    /// [`ShaderFeatures`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderMiscFlags: u32 {
        /// The atomic resolve also transfers the finished color out of the
        /// PLS planes into the framebuffer, with ordinary draws keeping
        /// their color writes masked.
        const COALESCED_RESOLVE_AND_TRANSFER = 1 << 0;
    }
}

const MISC_FLAG_COUNT: u64 = 1;

/// Identifies a compiled draw shader (module pair). Shared across
/// wireframe and render-pass variants of the same shader.
pub(crate) fn shader_key(
    draw_type: DrawType,
    features: ShaderFeatures,
    interlock: InterlockMode,
    misc: ShaderMiscFlags,
) -> u64 {
    let mut key = features.bits() as u64;
    key = (key << 2) | interlock.index();
    key = (key << MISC_FLAG_COUNT) | misc.bits() as u64;
    (key << 3) | draw_type.index()
}

/// Load action × framebuffer format variants of the draw render pass.
pub(crate) const RENDER_PASS_VARIANT_COUNT: u64 = 6;

pub(crate) fn render_pass_variant_idx(format: TextureFormat, load: LoadAction) -> u64 {
    let format_idx = match format {
        TextureFormat::Rgba8 => 0,
        TextureFormat::Bgra8 => 1,
        _ => unreachable!("render targets are 8-bit color"),
    };
    let load_idx = match load {
        LoadAction::Clear => 0,
        LoadAction::PreserveRenderTarget => 1,
        LoadAction::DontCare => 2,
    };
    load_idx * 2 + format_idx
}

/// Pipeline-level options that do not change the shader modules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PipelineOptions {
    pub wireframe: bool,
    pub color_writes_disabled: bool,
}

impl PipelineOptions {
    fn bits(self) -> u64 {
        (self.wireframe as u64) | ((self.color_writes_disabled as u64) << 1)
    }
}

const PIPELINE_OPTION_BITS: u64 = 2;

/// Identifies one fully-specified draw pipeline.
pub(crate) fn pipeline_key(shader_key: u64, options: PipelineOptions, variant_idx: u64) -> u64 {
    debug_assert!(variant_idx < RENDER_PASS_VARIANT_COUNT);
    ((shader_key << PIPELINE_OPTION_BITS) | options.bits()) * RENDER_PASS_VARIANT_COUNT
        + variant_idx
}

/// One batch of homogeneous draws, produced upstream.
pub struct DrawBatch<D: Device> {
    pub draw_type: DrawType,
    /// Instances for patch draws, vertices for triangle draws, indices for
    /// mesh draws. A zero count batch records nothing.
    pub element_count: u32,
    pub base_element: u32,
    pub shader_features: ShaderFeatures,
    /// Texture sampled by image draws; `None` binds the reserved null
    /// image.
    pub image_texture: Option<Rc<ImageTexture<D>>>,
    /// Vertex/UV/index streams for [`DrawType::ImageMesh`].
    pub vertex_buffer: Option<Rc<RenderBuffer<D>>>,
    pub uv_buffer: Option<Rc<RenderBuffer<D>>>,
    pub index_buffer: Option<Rc<RenderBuffer<D>>>,
    /// Dynamic offset into the image-draw uniform ring for this batch.
    pub image_draw_uniform_offset: u32,
    /// In atomic mode, the previous batch's PLS writes must be made
    /// visible before this batch reads them.
    pub needs_barrier: bool,
}

/// Everything one flush needs, filled in upstream.
pub struct FlushDescriptor<'a, D: Device> {
    pub cmd_buf: &'a mut D::CmdBuf,
    pub render_target: &'a mut RenderTarget<D>,
    pub interlock_mode: InterlockMode,
    pub load_action: LoadAction,
    pub clear_color: [f32; 4],
    pub coverage_clear_value: u32,
    /// Union of the features of every batch in `draw_list`.
    pub combined_shader_features: ShaderFeatures,
    pub wireframe: bool,

    /// Byte offset of this flush's uniform block in the flush-uniform ring.
    pub flush_uniform_offset: u64,
    pub first_path: u32,
    pub first_paint: u32,
    pub first_paint_aux: u32,
    pub first_contour: u32,

    pub first_complex_grad_span: u32,
    pub complex_grad_span_count: u32,
    pub complex_grad_rows_top: u32,
    pub complex_grad_rows_height: u32,
    pub simple_grad_data_offset: u64,
    pub simple_grad_texels_width: u32,
    pub simple_grad_texels_height: u32,

    pub first_tess_vertex_span: u32,
    pub tess_vertex_span_count: u32,
    pub tess_data_height: u32,

    pub draw_list: &'a [DrawBatch<D>],

    /// True on the last flush of a logical frame; stores
    /// `frame_completion_fence` for the ring/purgatory machinery.
    pub is_final_flush_of_frame: bool,
    /// Signaled by the caller when this frame's submission retires.
    pub frame_completion_fence: Option<Rc<<D as Device>::Fence>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_keys_are_distinct_across_axes() {
        let base = shader_key(
            DrawType::MidpointFanPatches,
            ShaderFeatures::empty(),
            InterlockMode::RasterOrdering,
            ShaderMiscFlags::empty(),
        );
        let by_type = shader_key(
            DrawType::OuterCurvePatches,
            ShaderFeatures::empty(),
            InterlockMode::RasterOrdering,
            ShaderMiscFlags::empty(),
        );
        let by_features = shader_key(
            DrawType::MidpointFanPatches,
            ShaderFeatures::ENABLE_CLIPPING,
            InterlockMode::RasterOrdering,
            ShaderMiscFlags::empty(),
        );
        let by_mode = shader_key(
            DrawType::MidpointFanPatches,
            ShaderFeatures::empty(),
            InterlockMode::Atomics,
            ShaderMiscFlags::empty(),
        );
        let by_misc = shader_key(
            DrawType::MidpointFanPatches,
            ShaderFeatures::empty(),
            InterlockMode::RasterOrdering,
            ShaderMiscFlags::COALESCED_RESOLVE_AND_TRANSFER,
        );
        let keys = [base, by_type, by_features, by_mode, by_misc];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn pipeline_keys_separate_options_and_variants() {
        let sk = shader_key(
            DrawType::InteriorTriangulation,
            ShaderFeatures::ENABLE_EVEN_ODD,
            InterlockMode::Atomics,
            ShaderMiscFlags::empty(),
        );
        let mut seen = std::collections::HashSet::new();
        for wireframe in [false, true] {
            for masked in [false, true] {
                for variant in 0..RENDER_PASS_VARIANT_COUNT {
                    let options = PipelineOptions {
                        wireframe,
                        color_writes_disabled: masked,
                    };
                    assert!(seen.insert(pipeline_key(sk, options, variant)));
                }
            }
        }
    }

    #[test]
    fn render_pass_variants_cover_load_and_format() {
        let mut seen = std::collections::HashSet::new();
        for load in [
            LoadAction::Clear,
            LoadAction::PreserveRenderTarget,
            LoadAction::DontCare,
        ] {
            for format in [TextureFormat::Rgba8, TextureFormat::Bgra8] {
                let idx = render_pass_variant_idx(format, load);
                assert!(idx < RENDER_PASS_VARIANT_COUNT);
                assert!(seen.insert(idx));
            }
        }
        assert_eq!(seen.len(), RENDER_PASS_VARIANT_COUNT as usize);
    }
}
