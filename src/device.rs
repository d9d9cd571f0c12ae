//! The backend abstraction the engine is generic over.
//!
//! This is deliberately narrower than a general GPU HAL: it covers exactly
//! the resource kinds and command-recording operations the flush
//! orchestrator needs. The Vulkan implementation is a thin translation; the
//! test stub records everything it is asked to do.

use std::ops::Range;

use bitflags::bitflags;

use crate::Result;

bitflags! {
    /// The intended usage for a buffer, specified on creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        /// The buffer can be mapped for writing CPU-side.
        const MAP_WRITE = 0x1;
        /// The buffer can be copied from.
        const COPY_SRC = 0x2;
        /// The buffer can be copied to.
        const COPY_DST = 0x4;
        /// The buffer can be bound as a vertex buffer.
        const VERTEX = 0x8;
        /// The buffer can be bound as an index buffer.
        const INDEX = 0x10;
        /// The buffer can be bound as a uniform buffer.
        const UNIFORM = 0x20;
        /// The buffer can be bound as a shader storage buffer.
        const STORAGE = 0x40;
    }
}

bitflags! {
    /// The intended usage for a texture, specified on creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 0x1;
        const COLOR_ATTACHMENT = 0x2;
        const INPUT_ATTACHMENT = 0x4;
        const STORAGE = 0x8;
        const COPY_SRC = 0x10;
        const COPY_DST = 0x20;
    }
}

bitflags! {
    /// Shader stages a descriptor binding is visible to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StageFlags: u32 {
        const VERTEX = 0x1;
        const FRAGMENT = 0x2;
    }
}

/// Texel formats the engine allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    R32Uint,
    Rgba32Uint,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Bgra8 | TextureFormat::R32Uint => 4,
            TextureFormat::Rgba32Uint => 16,
        }
    }
}

/// An image layout state.
///
/// An image must be in a particular layout state to be used for a purpose
/// such as being bound to a shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageLayout {
    /// The initial state for a newly created image.
    Undefined,
    /// The source for a copy or blit operation.
    TransferSrc,
    /// The destination for a copy, blit or clear operation.
    TransferDst,
    /// Able to be sampled from by shaders.
    ShaderRead,
    /// Bound as a color attachment.
    ColorAttachment,
    /// Read/write binding to a shader.
    General,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

/// What happens to an attachment's contents at render pass begin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug)]
pub struct AttachmentDesc {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store: bool,
    /// Use the general layout within the pass instead of the color
    /// attachment layout. Needed when the same pixels are read through a
    /// storage image while attached.
    pub general_layout: bool,
}

/// A single-subpass render pass description.
///
/// The engine only records single-subpass passes; the interesting degrees
/// of freedom are whether the color attachments are also readable in-pass
/// and how that read is ordered.
pub struct RenderPassDesc<'a> {
    pub attachments: &'a [AttachmentDesc],
    /// Bind every color attachment as an input attachment of the same
    /// subpass so fragment shaders can read back the pixel they cover.
    pub reads_color_attachments: bool,
    /// Bit `i` marks color output slot `i` as unused (the plane is accessed
    /// some other way, e.g. through a storage image).
    pub unused_color_mask: u32,
    /// Hardware-ordered access to the self-read attachments.
    pub rasterization_ordered: bool,
    /// Add a by-region self-dependency so the pass can be split with
    /// explicit barriers between draws.
    pub by_region_self_dependency: bool,
}

/// Vertex buffer layouts the draw pipelines consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexLayout {
    /// No vertex input (full-screen strips).
    None,
    /// Tessellation patch vertices: two vec4 attributes, per vertex.
    Patch,
    /// Interior triangulation vertices: one vec3 attribute, per vertex.
    Triangle,
    /// Image rect vertices: one vec4 attribute, per vertex.
    ImageRect,
    /// User mesh: position and UV streams in two separate bindings.
    ImageMesh,
    /// Gradient span instances: one uvec4 attribute, per instance.
    GradientSpan,
    /// Tessellation span instances: three vec4s plus one uvec4, per
    /// instance.
    TessSpan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
}

/// Everything needed to build one draw pipeline variant.
pub struct RenderPipelineDesc<'a, D: Device> {
    pub vertex: &'a D::ShaderModule,
    pub fragment: &'a D::ShaderModule,
    pub pipeline_layout: &'a D::PipelineLayout,
    pub render_pass: &'a D::RenderPass,
    pub vertex_layout: VertexLayout,
    pub topology: Topology,
    pub cull_back_faces: bool,
    pub clockwise_front_face: bool,
    pub wireframe: bool,
    pub color_attachment_count: u32,
    /// Request hardware-ordered blending on the self-read attachments.
    pub rasterization_ordered_attachments: bool,
    /// Mask out all color writes (used while a coalesced resolve is
    /// accumulating into the PLS planes).
    pub color_writes_disabled: bool,
    /// Boolean specialization constants, by constant id. `None` skips
    /// specialization entirely (fixed-function pipelines).
    pub feature_toggles: Option<[bool; 6]>,
}

/// Kinds of descriptor bindings the engine uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    UniformBuffer,
    DynamicUniformBuffer,
    StorageBuffer,
    SampledTexture,
    Sampler,
    InputAttachment,
    StorageTexture,
}

#[derive(Clone, Copy, Debug)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: StageFlags,
}

/// Capacity limits for one descriptor pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorPoolLimits {
    pub uniform_buffers: u32,
    pub dynamic_uniform_buffers: u32,
    pub storage_buffers: u32,
    pub sampled_textures: u32,
    pub samplers: u32,
    pub input_attachments: u32,
    pub storage_textures: u32,
    pub max_sets: u32,
}

/// A buffer range bound into a descriptor set.
pub struct BufferBinding<'a, D: Device> {
    pub buffer: &'a D::Buffer,
    pub offset: u64,
    /// `u64::MAX` binds the whole remaining range.
    pub size: u64,
}

pub struct TextureBinding<'a, D: Device> {
    pub view: &'a D::TextureView,
    pub layout: ImageLayout,
}

#[derive(Clone, Copy, Debug)]
pub enum SamplerParams {
    /// Bilinear, single mip level.
    Linear,
    /// Trilinear across the full mip chain.
    LinearMipmap,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_size(width: u32, height: u32) -> Rect {
        Rect {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ClearValue {
    Color([f32; 4]),
    Uint([u32; 4]),
}

/// Information about the GPU, queried once at context creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpuCapabilities {
    /// The device guarantees raster-order access to self-read color
    /// attachments.
    pub rasterization_order_attachment_access: bool,
    /// The device can rasterize lines for wireframe pipelines.
    pub fill_mode_non_solid: bool,
}

/// The device abstraction.
///
/// All resource types are plain handles owned by the caller; destruction is
/// explicit and unsafe because the engine, not the type system, guarantees
/// the GPU is done with a resource (that is the whole point of the
/// purgatory).
pub trait Device: Sized + 'static {
    type Buffer: 'static;
    type Texture: 'static;
    type TextureView: 'static;
    type Sampler: 'static;
    type ShaderModule: 'static;
    type DescriptorSetLayout: 'static;
    type PipelineLayout: 'static;
    type DescriptorPool: 'static;
    type DescriptorSet: Copy + 'static;
    type RenderPass: 'static;
    type Framebuffer: 'static;
    type Pipeline: 'static;
    type Fence: 'static;
    type CmdBuf: CmdBuf<Self>;

    fn capabilities(&self) -> GpuCapabilities;

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<Self::Buffer>;
    /// # Safety
    /// The GPU must be done with the buffer.
    unsafe fn destroy_buffer(&self, buffer: &Self::Buffer);
    /// # Safety
    /// The buffer must have been created with `MAP_WRITE` and the range
    /// must be in bounds.
    unsafe fn map_buffer(&self, buffer: &Self::Buffer, offset: u64, size: u64)
        -> Result<*mut u8>;
    /// # Safety
    /// The range must currently be mapped.
    unsafe fn unmap_buffer(&self, buffer: &Self::Buffer, offset: u64, size: u64);

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture>;
    /// # Safety
    /// The GPU must be done with the texture.
    unsafe fn destroy_texture(&self, texture: &Self::Texture);
    fn create_texture_view(&self, texture: &Self::Texture) -> Result<Self::TextureView>;
    /// # Safety
    /// The GPU must be done with the view.
    unsafe fn destroy_texture_view(&self, view: &Self::TextureView);

    fn create_sampler(&self, params: SamplerParams) -> Result<Self::Sampler>;
    /// # Safety
    /// The GPU must be done with the sampler.
    unsafe fn destroy_sampler(&self, sampler: &Self::Sampler);

    fn create_shader_module(&self, spirv: &[u32]) -> Result<Self::ShaderModule>;
    /// # Safety
    /// No pipeline creation may be in flight against the module.
    unsafe fn destroy_shader_module(&self, module: &Self::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<Self::DescriptorSetLayout>;
    /// # Safety
    /// The layout must no longer be referenced.
    unsafe fn destroy_descriptor_set_layout(&self, layout: &Self::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[&Self::DescriptorSetLayout],
    ) -> Result<Self::PipelineLayout>;
    /// # Safety
    /// The layout must no longer be referenced.
    unsafe fn destroy_pipeline_layout(&self, layout: &Self::PipelineLayout);

    fn create_descriptor_pool(&self, limits: &DescriptorPoolLimits) -> Result<Self::DescriptorPool>;
    /// # Safety
    /// The GPU must be done with every set allocated from the pool.
    unsafe fn destroy_descriptor_pool(&self, pool: &Self::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: &Self::DescriptorPool,
        layout: &Self::DescriptorSetLayout,
    ) -> Result<Self::DescriptorSet>;
    /// Bulk-frees every set in the pool.
    ///
    /// # Safety
    /// The GPU must be done with every set allocated from the pool.
    unsafe fn reset_descriptor_pool(&self, pool: &Self::DescriptorPool);

    fn update_buffer_bindings(
        &self,
        set: Self::DescriptorSet,
        first_binding: u32,
        kind: BindingKind,
        bindings: &[BufferBinding<'_, Self>],
    );
    fn update_texture_bindings(
        &self,
        set: Self::DescriptorSet,
        first_binding: u32,
        kind: BindingKind,
        bindings: &[TextureBinding<'_, Self>],
    );
    fn update_sampler_bindings(
        &self,
        set: Self::DescriptorSet,
        first_binding: u32,
        samplers: &[&Self::Sampler],
    );

    fn create_render_pass(&self, desc: &RenderPassDesc<'_>) -> Result<Self::RenderPass>;
    /// # Safety
    /// The render pass must no longer be referenced.
    unsafe fn destroy_render_pass(&self, render_pass: &Self::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: &Self::RenderPass,
        attachments: &[&Self::TextureView],
        width: u32,
        height: u32,
    ) -> Result<Self::Framebuffer>;
    /// # Safety
    /// The GPU must be done with the framebuffer.
    unsafe fn destroy_framebuffer(&self, framebuffer: &Self::Framebuffer);

    fn create_render_pipeline(&self, desc: &RenderPipelineDesc<'_, Self>)
        -> Result<Self::Pipeline>;
    /// # Safety
    /// The GPU must be done with the pipeline.
    unsafe fn destroy_pipeline(&self, pipeline: &Self::Pipeline);

    /// Blocks until the fence signals.
    fn wait_fence(&self, fence: &Self::Fence) -> Result<()>;
}

/// Command recording.
///
/// The engine records into an externally owned command buffer; submission
/// and fence signaling are the caller's business.
pub trait CmdBuf<D: Device> {
    fn begin_render_pass(
        &mut self,
        render_pass: &D::RenderPass,
        framebuffer: &D::Framebuffer,
        render_area: Rect,
        clear_values: &[ClearValue],
    );
    fn end_render_pass(&mut self);
    fn bind_pipeline(&mut self, pipeline: &D::Pipeline);
    /// Sets both viewport and scissor to the rect.
    fn set_viewport_and_scissor(&mut self, rect: Rect);
    fn bind_descriptor_sets(
        &mut self,
        layout: &D::PipelineLayout,
        first_set: u32,
        sets: &[D::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn bind_vertex_buffer(&mut self, slot: u32, buffer: &D::Buffer);
    fn bind_index_buffer(&mut self, buffer: &D::Buffer);
    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        first_instance: u32,
    );
    /// Transitions `levels` of the texture between layouts.
    fn texture_barrier(
        &mut self,
        texture: &D::Texture,
        from: ImageLayout,
        to: ImageLayout,
        levels: Range<u32>,
    );
    /// By-region barrier making prior color attachment writes visible to
    /// subsequent in-pass input attachment reads.
    fn attachment_read_barrier(&mut self);
    fn copy_buffer_to_texture(
        &mut self,
        src: &D::Buffer,
        src_offset: u64,
        src_row_length: u32,
        dst: &D::Texture,
        width: u32,
        height: u32,
    );
    /// Blits mip level `src_level` to `src_level + 1` with linear
    /// filtering. The source level must be in `TransferSrc`, the
    /// destination level in `TransferDst`.
    fn blit_mip(
        &mut self,
        texture: &D::Texture,
        src_level: u32,
        src_width: u32,
        src_height: u32,
    );
    /// Clears the whole texture; it must be in `TransferDst`.
    fn clear_texture(&mut self, texture: &D::Texture, value: ClearValue);
}
