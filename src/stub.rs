//! An in-memory [`Device`] that records everything it is asked to do.
//!
//! Handles are plain ids; command recording appends to a shared event log
//! the tests inspect. Mapping writes into host memory so buffer contents
//! can be asserted too.

use std::cell::{RefCell, UnsafeCell};
use std::collections::{HashMap, HashSet};
use std::borrow::Cow;
use std::rc::Rc;

use crate::device::{
    BindingKind, BufferBinding, BufferUsage, ClearValue, CmdBuf, DescriptorPoolLimits, Device,
    GpuCapabilities, ImageLayout, LayoutBinding, Rect, RenderPassDesc, RenderPipelineDesc,
    SamplerParams, TextureBinding, TextureDesc,
};
use crate::pipeline::{ShaderSource, ShaderStagePair};
use crate::pls::{DrawType, InterlockMode, ShaderMiscFlags};
use crate::Result;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    CreateBuffer { id: u64, size: u64 },
    DestroyBuffer { id: u64 },
    CreateTexture { id: u64, desc: TextureDesc },
    DestroyTexture { id: u64 },
    CreateDescriptorPool { id: u64 },
    ResetDescriptorPool { id: u64 },
    UpdateBufferBindings { set: u64, first_binding: u32, count: usize },
    UpdateTextureBindings { set: u64, first_binding: u32, kind: BindingKind, count: usize },
    UpdateSamplerBindings { set: u64, count: usize },
    CreateRenderPass { id: u64, rasterization_ordered: bool },
    CreateFramebuffer { id: u64, attachments: Vec<u64> },
    CreatePipeline { id: u64, wireframe: bool, color_writes_disabled: bool },
    WaitFence,
    BeginRenderPass { render_pass: u64, framebuffer: u64, clear_values: usize },
    EndRenderPass,
    BindPipeline { id: u64 },
    SetViewportAndScissor { rect: Rect },
    BindDescriptorSets { first_set: u32, sets: Vec<u64>, dynamic_offsets: Vec<u32> },
    BindVertexBuffer { slot: u32, buffer: u64 },
    BindIndexBuffer { buffer: u64 },
    Draw { vertices: u32, instances: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed { indices: u32, instances: u32, first_index: u32, first_instance: u32 },
    TextureBarrier { texture: u64, from: ImageLayout, to: ImageLayout, levels: std::ops::Range<u32> },
    AttachmentReadBarrier,
    CopyBufferToTexture { src: u64, dst: u64, width: u32, height: u32 },
    BlitMip { texture: u64, src_level: u32 },
    ClearTexture { texture: u64 },
}

#[derive(Default)]
struct Log {
    events: Vec<Event>,
    next_id: u64,
    destroyed_buffers: HashSet<u64>,
    destroyed_textures: HashSet<u64>,
    pool_resets: HashMap<u64, u32>,
    textures_created: usize,
    pipelines_created: usize,
    shader_modules_created: usize,
}

impl Log {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct StubBuffer {
    id: u64,
    data: UnsafeCell<Box<[u8]>>,
}

pub struct StubTexture {
    id: u64,
}

pub struct StubView {
    pub texture: u64,
}

pub struct StubSampler;

pub struct StubModule;

pub struct StubSetLayout {
    pub bindings: usize,
}

pub struct StubPipelineLayout {
    pub set_layouts: usize,
}

pub struct StubPool {
    id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StubSet(pub u64);

pub struct StubRenderPass {
    id: u64,
}

pub struct StubFramebuffer {
    id: u64,
}

pub struct StubPipeline {
    id: u64,
}

#[derive(Default)]
pub struct StubFence;

pub struct StubDevice {
    log: Rc<RefCell<Log>>,
    caps: GpuCapabilities,
}

pub struct StubCmdBuf {
    log: Rc<RefCell<Log>>,
}

impl StubDevice {
    pub fn new() -> Self {
        StubDevice {
            log: Rc::default(),
            caps: GpuCapabilities {
                rasterization_order_attachment_access: true,
                fill_mode_non_solid: true,
            },
        }
    }

    pub fn without_raster_ordering() -> Self {
        let mut device = Self::new();
        device.caps.rasterization_order_attachment_access = false;
        device
    }

    pub fn new_cmd_buf(&self) -> StubCmdBuf {
        StubCmdBuf {
            log: self.log.clone(),
        }
    }

    pub fn buffer_id(&self, buffer: &StubBuffer) -> u64 {
        buffer.id
    }

    pub fn buffer_destroyed(&self, id: u64) -> bool {
        self.log.borrow().destroyed_buffers.contains(&id)
    }

    pub fn texture_destroyed(&self, id: u64) -> bool {
        self.log.borrow().destroyed_textures.contains(&id)
    }

    pub fn pool_id(&self, pool: &StubPool) -> u64 {
        pool.id
    }

    pub fn pool_reset_count(&self, pool: &StubPool) -> u32 {
        self.log
            .borrow()
            .pool_resets
            .get(&pool.id)
            .copied()
            .unwrap_or(0)
    }

    pub fn texture_create_count(&self) -> usize {
        self.log.borrow().textures_created
    }

    pub fn pipeline_create_count(&self) -> usize {
        self.log.borrow().pipelines_created
    }

    pub fn shader_module_create_count(&self) -> usize {
        self.log.borrow().shader_modules_created
    }

    pub fn count_events(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.log.borrow().events.iter().filter(|e| pred(e)).count()
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.log.borrow_mut().events.clear();
    }

    fn push(&self, event: Event) {
        self.log.borrow_mut().events.push(event);
    }
}

impl Device for StubDevice {
    type Buffer = StubBuffer;
    type Texture = StubTexture;
    type TextureView = StubView;
    type Sampler = StubSampler;
    type ShaderModule = StubModule;
    type DescriptorSetLayout = StubSetLayout;
    type PipelineLayout = StubPipelineLayout;
    type DescriptorPool = StubPool;
    type DescriptorSet = StubSet;
    type RenderPass = StubRenderPass;
    type Framebuffer = StubFramebuffer;
    type Pipeline = StubPipeline;
    type Fence = StubFence;
    type CmdBuf = StubCmdBuf;

    fn capabilities(&self) -> GpuCapabilities {
        self.caps
    }

    fn create_buffer(&self, size: u64, _usage: BufferUsage) -> Result<StubBuffer> {
        let id = self.log.borrow_mut().next_id();
        self.push(Event::CreateBuffer { id, size });
        Ok(StubBuffer {
            id,
            data: UnsafeCell::new(vec![0; size as usize].into_boxed_slice()),
        })
    }

    unsafe fn destroy_buffer(&self, buffer: &StubBuffer) {
        let mut log = self.log.borrow_mut();
        let fresh = log.destroyed_buffers.insert(buffer.id);
        assert!(fresh, "buffer {} destroyed twice", buffer.id);
        log.events.push(Event::DestroyBuffer { id: buffer.id });
    }

    unsafe fn map_buffer(&self, buffer: &StubBuffer, offset: u64, size: u64) -> Result<*mut u8> {
        let data = &mut *buffer.data.get();
        assert!(offset + size <= data.len() as u64, "mapping out of bounds");
        Ok(data.as_mut_ptr().add(offset as usize))
    }

    unsafe fn unmap_buffer(&self, _buffer: &StubBuffer, _offset: u64, _size: u64) {}

    fn create_texture(&self, desc: &TextureDesc) -> Result<StubTexture> {
        let mut log = self.log.borrow_mut();
        let id = log.next_id();
        log.textures_created += 1;
        log.events.push(Event::CreateTexture { id, desc: *desc });
        Ok(StubTexture { id })
    }

    unsafe fn destroy_texture(&self, texture: &StubTexture) {
        let mut log = self.log.borrow_mut();
        let fresh = log.destroyed_textures.insert(texture.id);
        assert!(fresh, "texture {} destroyed twice", texture.id);
        log.events.push(Event::DestroyTexture { id: texture.id });
    }

    fn create_texture_view(&self, texture: &StubTexture) -> Result<StubView> {
        Ok(StubView {
            texture: texture.id,
        })
    }

    unsafe fn destroy_texture_view(&self, _view: &StubView) {}

    fn create_sampler(&self, _params: SamplerParams) -> Result<StubSampler> {
        Ok(StubSampler)
    }

    unsafe fn destroy_sampler(&self, _sampler: &StubSampler) {}

    fn create_shader_module(&self, _spirv: &[u32]) -> Result<StubModule> {
        self.log.borrow_mut().shader_modules_created += 1;
        Ok(StubModule)
    }

    unsafe fn destroy_shader_module(&self, _module: &StubModule) {}

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> Result<StubSetLayout> {
        Ok(StubSetLayout {
            bindings: bindings.len(),
        })
    }

    unsafe fn destroy_descriptor_set_layout(&self, _layout: &StubSetLayout) {}

    fn create_pipeline_layout(
        &self,
        set_layouts: &[&StubSetLayout],
    ) -> Result<StubPipelineLayout> {
        Ok(StubPipelineLayout {
            set_layouts: set_layouts.len(),
        })
    }

    unsafe fn destroy_pipeline_layout(&self, _layout: &StubPipelineLayout) {}

    fn create_descriptor_pool(&self, _limits: &DescriptorPoolLimits) -> Result<StubPool> {
        let mut log = self.log.borrow_mut();
        let id = log.next_id();
        log.pool_resets.insert(id, 0);
        log.events.push(Event::CreateDescriptorPool { id });
        Ok(StubPool { id })
    }

    unsafe fn destroy_descriptor_pool(&self, pool: &StubPool) {
        self.log.borrow_mut().pool_resets.remove(&pool.id);
    }

    fn allocate_descriptor_set(
        &self,
        _pool: &StubPool,
        _layout: &StubSetLayout,
    ) -> Result<StubSet> {
        Ok(StubSet(self.log.borrow_mut().next_id()))
    }

    unsafe fn reset_descriptor_pool(&self, pool: &StubPool) {
        let mut log = self.log.borrow_mut();
        *log.pool_resets.entry(pool.id).or_insert(0) += 1;
        log.events.push(Event::ResetDescriptorPool { id: pool.id });
    }

    fn update_buffer_bindings(
        &self,
        set: StubSet,
        first_binding: u32,
        _kind: BindingKind,
        bindings: &[BufferBinding<'_, Self>],
    ) {
        self.push(Event::UpdateBufferBindings {
            set: set.0,
            first_binding,
            count: bindings.len(),
        });
    }

    fn update_texture_bindings(
        &self,
        set: StubSet,
        first_binding: u32,
        kind: BindingKind,
        bindings: &[TextureBinding<'_, Self>],
    ) {
        self.push(Event::UpdateTextureBindings {
            set: set.0,
            first_binding,
            kind,
            count: bindings.len(),
        });
    }

    fn update_sampler_bindings(
        &self,
        set: StubSet,
        _first_binding: u32,
        samplers: &[&StubSampler],
    ) {
        self.push(Event::UpdateSamplerBindings {
            set: set.0,
            count: samplers.len(),
        });
    }

    fn create_render_pass(&self, desc: &RenderPassDesc<'_>) -> Result<StubRenderPass> {
        let id = self.log.borrow_mut().next_id();
        self.push(Event::CreateRenderPass {
            id,
            rasterization_ordered: desc.rasterization_ordered,
        });
        Ok(StubRenderPass { id })
    }

    unsafe fn destroy_render_pass(&self, _render_pass: &StubRenderPass) {}

    fn create_framebuffer(
        &self,
        _render_pass: &StubRenderPass,
        attachments: &[&StubView],
        _width: u32,
        _height: u32,
    ) -> Result<StubFramebuffer> {
        let id = self.log.borrow_mut().next_id();
        self.push(Event::CreateFramebuffer {
            id,
            attachments: attachments.iter().map(|v| v.texture).collect(),
        });
        Ok(StubFramebuffer { id })
    }

    unsafe fn destroy_framebuffer(&self, _framebuffer: &StubFramebuffer) {}

    fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDesc<'_, Self>,
    ) -> Result<StubPipeline> {
        let mut log = self.log.borrow_mut();
        let id = log.next_id();
        log.pipelines_created += 1;
        log.events.push(Event::CreatePipeline {
            id,
            wireframe: desc.wireframe,
            color_writes_disabled: desc.color_writes_disabled,
        });
        Ok(StubPipeline { id })
    }

    unsafe fn destroy_pipeline(&self, _pipeline: &StubPipeline) {}

    fn wait_fence(&self, _fence: &StubFence) -> Result<()> {
        self.push(Event::WaitFence);
        Ok(())
    }
}

impl CmdBuf<StubDevice> for StubCmdBuf {
    fn begin_render_pass(
        &mut self,
        render_pass: &StubRenderPass,
        framebuffer: &StubFramebuffer,
        _render_area: Rect,
        clear_values: &[ClearValue],
    ) {
        self.log.borrow_mut().events.push(Event::BeginRenderPass {
            render_pass: render_pass.id,
            framebuffer: framebuffer.id,
            clear_values: clear_values.len(),
        });
    }

    fn end_render_pass(&mut self) {
        self.log.borrow_mut().events.push(Event::EndRenderPass);
    }

    fn bind_pipeline(&mut self, pipeline: &StubPipeline) {
        self.log
            .borrow_mut()
            .events
            .push(Event::BindPipeline { id: pipeline.id });
    }

    fn set_viewport_and_scissor(&mut self, rect: Rect) {
        self.log
            .borrow_mut()
            .events
            .push(Event::SetViewportAndScissor { rect });
    }

    fn bind_descriptor_sets(
        &mut self,
        _layout: &StubPipelineLayout,
        first_set: u32,
        sets: &[StubSet],
        dynamic_offsets: &[u32],
    ) {
        self.log.borrow_mut().events.push(Event::BindDescriptorSets {
            first_set,
            sets: sets.iter().map(|s| s.0).collect(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: &StubBuffer) {
        self.log.borrow_mut().events.push(Event::BindVertexBuffer {
            slot,
            buffer: buffer.id,
        });
    }

    fn bind_index_buffer(&mut self, buffer: &StubBuffer) {
        self.log
            .borrow_mut()
            .events
            .push(Event::BindIndexBuffer { buffer: buffer.id });
    }

    fn draw(&mut self, vertices: u32, instances: u32, first_vertex: u32, first_instance: u32) {
        self.log.borrow_mut().events.push(Event::Draw {
            vertices,
            instances,
            first_vertex,
            first_instance,
        });
    }

    fn draw_indexed(
        &mut self,
        indices: u32,
        instances: u32,
        first_index: u32,
        first_instance: u32,
    ) {
        self.log.borrow_mut().events.push(Event::DrawIndexed {
            indices,
            instances,
            first_index,
            first_instance,
        });
    }

    fn texture_barrier(
        &mut self,
        texture: &StubTexture,
        from: ImageLayout,
        to: ImageLayout,
        levels: std::ops::Range<u32>,
    ) {
        self.log.borrow_mut().events.push(Event::TextureBarrier {
            texture: texture.id,
            from,
            to,
            levels,
        });
    }

    fn attachment_read_barrier(&mut self) {
        self.log
            .borrow_mut()
            .events
            .push(Event::AttachmentReadBarrier);
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &StubBuffer,
        _src_offset: u64,
        _src_row_length: u32,
        dst: &StubTexture,
        width: u32,
        height: u32,
    ) {
        self.log.borrow_mut().events.push(Event::CopyBufferToTexture {
            src: src.id,
            dst: dst.id,
            width,
            height,
        });
    }

    fn blit_mip(&mut self, texture: &StubTexture, src_level: u32, _src_width: u32, _src_height: u32) {
        self.log.borrow_mut().events.push(Event::BlitMip {
            texture: texture.id,
            src_level,
        });
    }

    fn clear_texture(&mut self, texture: &StubTexture, _value: ClearValue) {
        self.log
            .borrow_mut()
            .events
            .push(Event::ClearTexture { texture: texture.id });
    }
}

/// Empty SPIR-V blobs for tests that never execute shaders.
pub struct NullShaders;

impl ShaderSource for NullShaders {
    fn color_ramp(&self) -> ShaderStagePair {
        empty_pair()
    }

    fn tessellate(&self) -> ShaderStagePair {
        empty_pair()
    }

    fn draw(
        &self,
        _draw_type: DrawType,
        _interlock: InterlockMode,
        _misc: ShaderMiscFlags,
    ) -> ShaderStagePair {
        empty_pair()
    }
}

fn empty_pair() -> ShaderStagePair {
    ShaderStagePair {
        vertex: Cow::Borrowed(&[]),
        fragment: Cow::Borrowed(&[]),
    }
}
