//! Shader, layout, render pass, and pipeline caches.
//!
//! Draw shaders vary along four axes (draw type, feature set, interlock
//! mode, misc flags); pipelines additionally vary by pipeline-level
//! options and by render pass variant. Modules are cached at the coarser
//! shader key so every pipeline variant of a shader reuses its modules.
//! Everything is created lazily on first use and lives for the life of the
//! context.

use std::borrow::Cow;
use std::collections::HashMap;
use std::rc::Rc;

use crate::device::{
    BindingKind, Device, GpuCapabilities, LayoutBinding, RenderPassDesc, RenderPipelineDesc,
    StageFlags, TextureFormat, Topology, VertexLayout,
};
use crate::interlock::{
    Interlock, CLIP_PLANE_IDX, COLOR_PLANE_IDX, COVERAGE_PLANE_IDX, SCRATCH_COLOR_PLANE_IDX,
};
use crate::pls::{
    pipeline_key, render_pass_variant_idx, shader_key, DrawType, InterlockMode, LoadAction,
    PipelineOptions, ShaderFeatures, ShaderMiscFlags, RENDER_PASS_VARIANT_COUNT,
};
use crate::{Error, Result};

/// SPIR-V for one vertex/fragment stage pair.
pub struct ShaderStagePair {
    pub vertex: Cow<'static, [u32]>,
    pub fragment: Cow<'static, [u32]>,
}

/// Supplies precompiled SPIR-V blobs. Shader compilation is out of scope
/// for the engine; feature toggles are applied via specialization
/// constants at pipeline creation, so one blob serves every feature set.
pub trait ShaderSource {
    fn color_ramp(&self) -> ShaderStagePair;
    fn tessellate(&self) -> ShaderStagePair;
    fn draw(
        &self,
        draw_type: DrawType,
        interlock: InterlockMode,
        misc: ShaderMiscFlags,
    ) -> ShaderStagePair;
}

/// Descriptor set indices.
pub(crate) const PER_FLUSH_SET: u32 = 0;
pub(crate) const PER_DRAW_SET: u32 = 1;

/// Binding indices within the per-flush set.
pub(crate) mod per_flush {
    pub const TESS_VERTEX_TEXTURE: u32 = 0;
    pub const GRAD_TEXTURE: u32 = 1;
    pub const PATH_BUFFER: u32 = 2;
    pub const PAINT_BUFFER: u32 = 3;
    pub const PAINT_AUX_BUFFER: u32 = 4;
    pub const CONTOUR_BUFFER: u32 = 5;
    pub const FLUSH_UNIFORM_BUFFER: u32 = 6;
    pub const IMAGE_DRAW_UNIFORM_BUFFER: u32 = 7;
}

/// Binding indices within the per-draw set.
pub(crate) mod per_draw {
    pub const IMAGE_TEXTURE: u32 = 0;
}

/// Binding indices within the sampler set.
pub(crate) mod samplers {
    pub const LINEAR: u32 = 0;
    pub const MIPMAP: u32 = 1;
}

struct DrawShader<D: Device> {
    vertex: D::ShaderModule,
    fragment: D::ShaderModule,
}

/// Layouts and render pass variants for one interlock mode.
struct DrawPipelineLayout<D: Device> {
    device: Rc<D>,
    pls_layout: D::DescriptorSetLayout,
    pipeline_layout: D::PipelineLayout,
    render_passes: [Option<D::RenderPass>; RENDER_PASS_VARIANT_COUNT as usize],
}

impl<D: Device> Drop for DrawPipelineLayout<D> {
    fn drop(&mut self) {
        unsafe {
            for render_pass in self.render_passes.iter().flatten() {
                self.device.destroy_render_pass(render_pass);
            }
            self.device.destroy_pipeline_layout(&self.pipeline_layout);
            self.device.destroy_descriptor_set_layout(&self.pls_layout);
        }
    }
}

/// A fixed-function pipeline (color ramp or tessellation) with its
/// single-attachment render pass.
struct FixedPipeline<D: Device> {
    device: Rc<D>,
    pipeline_layout: D::PipelineLayout,
    render_pass: D::RenderPass,
    pipeline: D::Pipeline,
}

impl<D: Device> Drop for FixedPipeline<D> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(&self.pipeline);
            self.device.destroy_render_pass(&self.render_pass);
            self.device.destroy_pipeline_layout(&self.pipeline_layout);
        }
    }
}

pub struct PipelineManager<D: Device> {
    device: Rc<D>,
    caps: GpuCapabilities,
    source: Box<dyn ShaderSource>,
    per_flush_layout: D::DescriptorSetLayout,
    per_draw_layout: D::DescriptorSetLayout,
    sampler_layout: D::DescriptorSetLayout,
    color_ramp: FixedPipeline<D>,
    tessellate: FixedPipeline<D>,
    draw_layouts: [Option<DrawPipelineLayout<D>>; 2],
    draw_shaders: HashMap<u64, DrawShader<D>>,
    draw_pipelines: HashMap<u64, D::Pipeline>,
}

/// Everything that identifies one draw pipeline variant.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DrawPipelineSpec {
    pub draw_type: DrawType,
    pub features: ShaderFeatures,
    pub interlock: InterlockMode,
    pub misc: ShaderMiscFlags,
    pub options: PipelineOptions,
    pub format: TextureFormat,
    pub load: LoadAction,
}

impl<D: Device> PipelineManager<D> {
    pub fn new(device: &Rc<D>, source: Box<dyn ShaderSource>) -> Result<Self> {
        let caps = device.capabilities();
        let per_flush_layout = device.create_descriptor_set_layout(&per_flush_bindings())?;
        let per_draw_layout = device.create_descriptor_set_layout(&[LayoutBinding {
            binding: per_draw::IMAGE_TEXTURE,
            kind: BindingKind::SampledTexture,
            stages: StageFlags::FRAGMENT,
        }])?;
        let sampler_layout = device.create_descriptor_set_layout(&[
            LayoutBinding {
                binding: samplers::LINEAR,
                kind: BindingKind::Sampler,
                stages: StageFlags::FRAGMENT,
            },
            LayoutBinding {
                binding: samplers::MIPMAP,
                kind: BindingKind::Sampler,
                stages: StageFlags::FRAGMENT,
            },
        ])?;

        let ramp_shaders = source.color_ramp();
        let color_ramp = FixedPipeline::new(
            device,
            &per_flush_layout,
            &ramp_shaders,
            TextureFormat::Rgba8,
            VertexLayout::GradientSpan,
            Topology::TriangleStrip,
        )?;
        let tess_shaders = source.tessellate();
        let tessellate = FixedPipeline::new(
            device,
            &per_flush_layout,
            &tess_shaders,
            TextureFormat::Rgba32Uint,
            VertexLayout::TessSpan,
            Topology::TriangleList,
        )?;

        Ok(PipelineManager {
            device: device.clone(),
            caps,
            source,
            per_flush_layout,
            per_draw_layout,
            sampler_layout,
            color_ramp,
            tessellate,
            draw_layouts: [None, None],
            draw_shaders: HashMap::new(),
            draw_pipelines: HashMap::new(),
        })
    }

    pub(crate) fn per_flush_layout(&self) -> &D::DescriptorSetLayout {
        &self.per_flush_layout
    }

    pub(crate) fn per_draw_layout(&self) -> &D::DescriptorSetLayout {
        &self.per_draw_layout
    }

    pub(crate) fn sampler_layout(&self) -> &D::DescriptorSetLayout {
        &self.sampler_layout
    }

    pub(crate) fn color_ramp_render_pass(&self) -> &D::RenderPass {
        &self.color_ramp.render_pass
    }

    pub(crate) fn color_ramp_pipeline(&self) -> &D::Pipeline {
        &self.color_ramp.pipeline
    }

    pub(crate) fn color_ramp_pipeline_layout(&self) -> &D::PipelineLayout {
        &self.color_ramp.pipeline_layout
    }

    pub(crate) fn tessellate_render_pass(&self) -> &D::RenderPass {
        &self.tessellate.render_pass
    }

    pub(crate) fn tessellate_pipeline(&self) -> &D::Pipeline {
        &self.tessellate.pipeline
    }

    pub(crate) fn tessellate_pipeline_layout(&self) -> &D::PipelineLayout {
        &self.tessellate.pipeline_layout
    }

    /// Lazily creates the layouts for one interlock mode.
    pub(crate) fn ensure_draw_layout(
        &mut self,
        strategy: &dyn Interlock<D>,
    ) -> Result<()> {
        let idx = layout_idx(strategy.mode())?;
        if self.draw_layouts[idx].is_some() {
            return Ok(());
        }
        if strategy.rasterization_ordered() && !self.caps.rasterization_order_attachment_access {
            return Err(Error::Unsupported(
                "device lacks raster-order attachment access",
            ));
        }
        let pls_layout = self
            .device
            .create_descriptor_set_layout(&pls_bindings(strategy.mode()))?;
        let pipeline_layout = self.device.create_pipeline_layout(&[
            &self.per_flush_layout,
            &self.per_draw_layout,
            &self.sampler_layout,
            &pls_layout,
        ])?;
        log::debug!("created draw layouts for {:?}", strategy.mode());
        self.draw_layouts[idx] = Some(DrawPipelineLayout {
            device: self.device.clone(),
            pls_layout,
            pipeline_layout,
            render_passes: Default::default(),
        });
        Ok(())
    }

    pub(crate) fn pls_layout(&self, interlock: InterlockMode) -> Result<&D::DescriptorSetLayout> {
        Ok(&self.draw_layout(interlock)?.pls_layout)
    }

    pub(crate) fn draw_pipeline_layout(
        &self,
        interlock: InterlockMode,
    ) -> Result<&D::PipelineLayout> {
        Ok(&self.draw_layout(interlock)?.pipeline_layout)
    }

    fn draw_layout(&self, interlock: InterlockMode) -> Result<&DrawPipelineLayout<D>> {
        match &self.draw_layouts[layout_idx(interlock)?] {
            Some(layout) => Ok(layout),
            None => unreachable!("draw layout requested before ensure_draw_layout"),
        }
    }

    /// Lazily creates (and returns) the draw render pass for one
    /// (interlock, format, load action) combination.
    pub(crate) fn draw_render_pass(
        &mut self,
        strategy: &dyn Interlock<D>,
        format: TextureFormat,
        load: LoadAction,
    ) -> Result<&D::RenderPass> {
        self.ensure_draw_layout(strategy)?;
        let layout_idx = layout_idx(strategy.mode())?;
        let variant = render_pass_variant_idx(format, load) as usize;
        let layout = match &mut self.draw_layouts[layout_idx] {
            Some(layout) => layout,
            None => unreachable!(),
        };
        if layout.render_passes[variant].is_none() {
            let attachments = strategy.attachment_descs(format, load);
            let render_pass = self.device.create_render_pass(&RenderPassDesc {
                attachments: &attachments,
                reads_color_attachments: true,
                unused_color_mask: strategy.unused_color_mask(),
                rasterization_ordered: strategy.rasterization_ordered(),
                by_region_self_dependency: strategy.by_region_self_dependency(),
            })?;
            log::debug!(
                "created draw render pass variant {variant} for {:?}",
                strategy.mode()
            );
            layout.render_passes[variant] = Some(render_pass);
        }
        match &layout.render_passes[variant] {
            Some(render_pass) => Ok(render_pass),
            None => unreachable!(),
        }
    }

    /// Looks up or creates the pipeline for `spec`. Creation happens at
    /// most once per pipeline key.
    pub(crate) fn draw_pipeline(
        &mut self,
        strategy: &dyn Interlock<D>,
        spec: DrawPipelineSpec,
    ) -> Result<&D::Pipeline> {
        let sk = shader_key(spec.draw_type, spec.features, spec.interlock, spec.misc);
        let key = pipeline_key(sk, spec.options, render_pass_variant_idx(spec.format, spec.load));
        if !self.draw_pipelines.contains_key(&key) {
            self.ensure_draw_shader(sk, spec)?;
            self.draw_render_pass(strategy, spec.format, spec.load)?;
            let pipeline = self.create_draw_pipeline(strategy, spec, sk)?;
            log::debug!("created draw pipeline {key:#x}");
            self.draw_pipelines.insert(key, pipeline);
        }
        match self.draw_pipelines.get(&key) {
            Some(pipeline) => Ok(pipeline),
            None => unreachable!(),
        }
    }

    pub(crate) fn draw_pipeline_count(&self) -> usize {
        self.draw_pipelines.len()
    }

    fn ensure_draw_shader(&mut self, sk: u64, spec: DrawPipelineSpec) -> Result<()> {
        if self.draw_shaders.contains_key(&sk) {
            return Ok(());
        }
        let pair = self.source.draw(spec.draw_type, spec.interlock, spec.misc);
        let vertex = self.device.create_shader_module(&pair.vertex)?;
        let fragment = match self.device.create_shader_module(&pair.fragment) {
            Ok(fragment) => fragment,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(&vertex) };
                return Err(e);
            }
        };
        log::debug!("compiled draw shader {sk:#x}");
        self.draw_shaders.insert(sk, DrawShader { vertex, fragment });
        Ok(())
    }

    fn create_draw_pipeline(
        &self,
        strategy: &dyn Interlock<D>,
        spec: DrawPipelineSpec,
        sk: u64,
    ) -> Result<D::Pipeline> {
        let shader = match self.draw_shaders.get(&sk) {
            Some(shader) => shader,
            None => unreachable!(),
        };
        let layout = self.draw_layout(spec.interlock)?;
        let variant = render_pass_variant_idx(spec.format, spec.load) as usize;
        let render_pass = match &layout.render_passes[variant] {
            Some(render_pass) => render_pass,
            None => unreachable!(),
        };
        let (vertex_layout, topology, cull_back_faces) = draw_vertex_config(spec.draw_type);
        self.device.create_render_pipeline(&RenderPipelineDesc {
            vertex: &shader.vertex,
            fragment: &shader.fragment,
            pipeline_layout: &layout.pipeline_layout,
            render_pass,
            vertex_layout,
            topology,
            cull_back_faces,
            clockwise_front_face: true,
            wireframe: spec.options.wireframe,
            color_attachment_count: strategy.attachment_count(),
            rasterization_ordered_attachments: strategy.rasterization_ordered(),
            color_writes_disabled: spec.options.color_writes_disabled,
            feature_toggles: Some(spec.features.toggles()),
        })
    }
}

impl<D: Device> Drop for PipelineManager<D> {
    fn drop(&mut self) {
        unsafe {
            for pipeline in self.draw_pipelines.values() {
                self.device.destroy_pipeline(pipeline);
            }
            for shader in self.draw_shaders.values() {
                self.device.destroy_shader_module(&shader.vertex);
                self.device.destroy_shader_module(&shader.fragment);
            }
            self.device.destroy_descriptor_set_layout(&self.per_flush_layout);
            self.device.destroy_descriptor_set_layout(&self.per_draw_layout);
            self.device.destroy_descriptor_set_layout(&self.sampler_layout);
        }
    }
}

impl<D: Device> FixedPipeline<D> {
    fn new(
        device: &Rc<D>,
        per_flush_layout: &D::DescriptorSetLayout,
        shaders: &ShaderStagePair,
        format: TextureFormat,
        vertex_layout: VertexLayout,
        topology: Topology,
    ) -> Result<Self> {
        use crate::device::{AttachmentDesc, LoadOp};
        let pipeline_layout = device.create_pipeline_layout(&[per_flush_layout])?;
        let render_pass = device.create_render_pass(&RenderPassDesc {
            attachments: &[AttachmentDesc {
                format,
                load_op: LoadOp::DontCare,
                store: true,
                general_layout: false,
            }],
            reads_color_attachments: false,
            unused_color_mask: 0,
            rasterization_ordered: false,
            by_region_self_dependency: false,
        })?;
        let vertex = device.create_shader_module(&shaders.vertex)?;
        let fragment = device.create_shader_module(&shaders.fragment)?;
        let pipeline = device.create_render_pipeline(&RenderPipelineDesc {
            vertex: &vertex,
            fragment: &fragment,
            pipeline_layout: &pipeline_layout,
            render_pass: &render_pass,
            vertex_layout,
            topology,
            cull_back_faces: false,
            clockwise_front_face: false,
            wireframe: false,
            color_attachment_count: 1,
            rasterization_ordered_attachments: false,
            color_writes_disabled: false,
            feature_toggles: None,
        });
        // Modules are only needed during pipeline creation.
        unsafe {
            device.destroy_shader_module(&vertex);
            device.destroy_shader_module(&fragment);
        }
        Ok(FixedPipeline {
            device: device.clone(),
            pipeline_layout,
            render_pass,
            pipeline: pipeline?,
        })
    }
}

fn layout_idx(interlock: InterlockMode) -> Result<usize> {
    match interlock {
        InterlockMode::RasterOrdering => Ok(0),
        InterlockMode::Atomics => Ok(1),
        InterlockMode::DepthStencil => Err(Error::Unsupported(
            "depth-stencil interlock has no draw pipelines",
        )),
    }
}

fn per_flush_bindings() -> Vec<LayoutBinding> {
    vec![
        LayoutBinding {
            binding: per_flush::TESS_VERTEX_TEXTURE,
            kind: BindingKind::SampledTexture,
            stages: StageFlags::VERTEX,
        },
        LayoutBinding {
            binding: per_flush::GRAD_TEXTURE,
            kind: BindingKind::SampledTexture,
            stages: StageFlags::FRAGMENT,
        },
        LayoutBinding {
            binding: per_flush::PATH_BUFFER,
            kind: BindingKind::StorageBuffer,
            stages: StageFlags::VERTEX,
        },
        LayoutBinding {
            binding: per_flush::PAINT_BUFFER,
            kind: BindingKind::StorageBuffer,
            stages: StageFlags::VERTEX | StageFlags::FRAGMENT,
        },
        LayoutBinding {
            binding: per_flush::PAINT_AUX_BUFFER,
            kind: BindingKind::StorageBuffer,
            stages: StageFlags::VERTEX | StageFlags::FRAGMENT,
        },
        LayoutBinding {
            binding: per_flush::CONTOUR_BUFFER,
            kind: BindingKind::StorageBuffer,
            stages: StageFlags::VERTEX,
        },
        LayoutBinding {
            binding: per_flush::FLUSH_UNIFORM_BUFFER,
            kind: BindingKind::UniformBuffer,
            stages: StageFlags::VERTEX | StageFlags::FRAGMENT,
        },
        LayoutBinding {
            binding: per_flush::IMAGE_DRAW_UNIFORM_BUFFER,
            kind: BindingKind::DynamicUniformBuffer,
            stages: StageFlags::VERTEX | StageFlags::FRAGMENT,
        },
    ]
}

fn pls_bindings(interlock: InterlockMode) -> Vec<LayoutBinding> {
    match interlock {
        InterlockMode::RasterOrdering => vec![
            LayoutBinding {
                binding: COLOR_PLANE_IDX,
                kind: BindingKind::InputAttachment,
                stages: StageFlags::FRAGMENT,
            },
            LayoutBinding {
                binding: COVERAGE_PLANE_IDX,
                kind: BindingKind::InputAttachment,
                stages: StageFlags::FRAGMENT,
            },
            LayoutBinding {
                binding: CLIP_PLANE_IDX,
                kind: BindingKind::InputAttachment,
                stages: StageFlags::FRAGMENT,
            },
            LayoutBinding {
                binding: SCRATCH_COLOR_PLANE_IDX,
                kind: BindingKind::InputAttachment,
                stages: StageFlags::FRAGMENT,
            },
        ],
        InterlockMode::Atomics => vec![
            LayoutBinding {
                binding: COLOR_PLANE_IDX,
                kind: BindingKind::InputAttachment,
                stages: StageFlags::FRAGMENT,
            },
            // Coverage is atomically updated through a storage image.
            LayoutBinding {
                binding: COVERAGE_PLANE_IDX,
                kind: BindingKind::StorageTexture,
                stages: StageFlags::FRAGMENT,
            },
            LayoutBinding {
                binding: CLIP_PLANE_IDX,
                kind: BindingKind::InputAttachment,
                stages: StageFlags::FRAGMENT,
            },
        ],
        InterlockMode::DepthStencil => Vec::new(),
    }
}

fn draw_vertex_config(draw_type: DrawType) -> (VertexLayout, Topology, bool) {
    match draw_type {
        DrawType::MidpointFanPatches | DrawType::OuterCurvePatches => {
            (VertexLayout::Patch, Topology::TriangleList, true)
        }
        DrawType::InteriorTriangulation => (VertexLayout::Triangle, Topology::TriangleList, true),
        DrawType::ImageRect => (VertexLayout::ImageRect, Topology::TriangleList, false),
        DrawType::ImageMesh => (VertexLayout::ImageMesh, Topology::TriangleList, false),
        DrawType::AtomicResolve => (VertexLayout::None, Topology::TriangleStrip, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interlock::strategy;
    use crate::stub::{NullShaders, StubDevice};

    fn manager(device: &Rc<StubDevice>) -> PipelineManager<StubDevice> {
        PipelineManager::new(device, Box::new(NullShaders)).unwrap()
    }

    fn spec(load: LoadAction) -> DrawPipelineSpec {
        DrawPipelineSpec {
            draw_type: DrawType::MidpointFanPatches,
            features: ShaderFeatures::ENABLE_CLIPPING,
            interlock: InterlockMode::Atomics,
            misc: ShaderMiscFlags::empty(),
            options: PipelineOptions::default(),
            format: TextureFormat::Rgba8,
            load,
        }
    }

    #[test]
    fn pipeline_creation_is_idempotent_per_key() {
        let device = Rc::new(StubDevice::new());
        let mut manager = manager(&device);
        let strategy = strategy::<StubDevice>(InterlockMode::Atomics).unwrap();
        let before = device.pipeline_create_count();
        manager.draw_pipeline(strategy, spec(LoadAction::Clear)).unwrap();
        manager.draw_pipeline(strategy, spec(LoadAction::Clear)).unwrap();
        assert_eq!(device.pipeline_create_count(), before + 1);
        // A different render pass variant is a different pipeline...
        manager
            .draw_pipeline(strategy, spec(LoadAction::DontCare))
            .unwrap();
        assert_eq!(device.pipeline_create_count(), before + 2);
        // ...but shares the shader modules.
        assert_eq!(device.shader_module_create_count(), FIXED_MODULES + 2);
    }

    // Two fixed pipelines create (and immediately release) two modules
    // each.
    const FIXED_MODULES: usize = 4;

    #[test]
    fn wireframe_and_mask_options_fork_pipelines() {
        let device = Rc::new(StubDevice::new());
        let mut manager = manager(&device);
        let strategy = strategy::<StubDevice>(InterlockMode::Atomics).unwrap();
        let mut s = spec(LoadAction::Clear);
        manager.draw_pipeline(strategy, s).unwrap();
        s.options.wireframe = true;
        manager.draw_pipeline(strategy, s).unwrap();
        s.options.color_writes_disabled = true;
        manager.draw_pipeline(strategy, s).unwrap();
        assert_eq!(manager.draw_pipeline_count(), 3);
    }

    #[test]
    fn raster_ordering_requires_capability() {
        let device = Rc::new(StubDevice::without_raster_ordering());
        let mut manager = manager(&device);
        let strategy = strategy::<StubDevice>(InterlockMode::RasterOrdering).unwrap();
        let mut s = spec(LoadAction::Clear);
        s.interlock = InterlockMode::RasterOrdering;
        assert!(manager.draw_pipeline(strategy, s).is_err());
    }
}
