//! The render context: frame lifecycle and the flush orchestrator.
//!
//! A logical frame is: `prepare_to_map_buffers`, upstream writes into the
//! ring buffers, then one or more `flush` calls recording into an external
//! command buffer, the last of which carries the frame completion fence.
//! The context never submits work itself; it only records, and uses the
//! caller's fences to know when recorded work has retired.

use std::rc::Rc;

use bytemuck::Pod;

use crate::buffer_ring::BufferRing;
use crate::descriptors::{DescriptorPoolManager, DescriptorSetPool, MAX_IMAGE_TEXTURE_UPDATES};
use crate::device::{
    BindingKind, BufferBinding, BufferUsage, CmdBuf, DescriptorPoolLimits, Device,
    GpuCapabilities, ImageLayout, Rect, SamplerParams, TextureBinding, TextureDesc, TextureFormat,
    TextureUsage,
};
use crate::image::ImageTexture;
use crate::interlock;
use crate::pipeline::{
    per_draw, per_flush, samplers, PipelineManager, ShaderSource, PER_DRAW_SET, PER_FLUSH_SET,
};
use crate::pls::{
    DrawType, FlushDescriptor, InterlockMode, LoadAction, PipelineOptions, ShaderMiscFlags,
    BUFFER_RING_SIZE, CONTOUR_DATA_STRIDE, GRAD_TEXTURE_WIDTH, IMAGE_DRAW_UNIFORM_STRIDE,
    PAINT_AUX_DATA_STRIDE, PAINT_DATA_STRIDE, PATH_DATA_STRIDE, TESS_TEXTURE_WIDTH,
};
use crate::purgatory::ResourcePurgatory;
use crate::resource::{Framebuffer, GpuBuffer, Sampler, Texture};
use crate::Result;

/// Index counts and base offsets into the shared patch index buffer, one
/// pair per patch draw type.
#[derive(Clone, Copy, Debug)]
pub struct PatchGeometryInfo {
    pub midpoint_fan_index_count: u32,
    pub midpoint_fan_base_index: u32,
    pub outer_curve_index_count: u32,
    pub outer_curve_base_index: u32,
}

/// Immutable geometry uploaded once at context creation. The contents come
/// from the tessellation layer; the engine only owns the GPU copies.
pub struct StaticGeometry<'a> {
    pub patch_vertices: &'a [u8],
    pub patch_indices: &'a [u8],
    pub patch_info: PatchGeometryInfo,
    pub tess_span_indices: &'a [u8],
    pub tess_span_index_count: u32,
    pub image_rect_vertices: &'a [u8],
    pub image_rect_indices: &'a [u8],
    pub image_rect_index_count: u32,
}

/// The ring-buffered upload streams, addressed by callers when mapping
/// and writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingKind {
    FlushUniform,
    ImageDrawUniform,
    Path,
    Paint,
    PaintAux,
    Contour,
    SimpleColorRamps,
    GradSpan,
    TessSpan,
    Triangle,
}

struct Rings<D: Device> {
    flush_uniform: BufferRing<D>,
    image_draw_uniform: BufferRing<D>,
    path: BufferRing<D>,
    paint: BufferRing<D>,
    paint_aux: BufferRing<D>,
    contour: BufferRing<D>,
    simple_color_ramps: BufferRing<D>,
    grad_span: BufferRing<D>,
    tess_span: BufferRing<D>,
    triangle: BufferRing<D>,
}

impl<D: Device> Rings<D> {
    fn new(device: &Rc<D>) -> Result<Self> {
        Ok(Rings {
            flush_uniform: BufferRing::new(device, BufferUsage::UNIFORM, 0)?,
            image_draw_uniform: BufferRing::new(device, BufferUsage::UNIFORM, 0)?,
            path: BufferRing::new(device, BufferUsage::STORAGE, 0)?,
            paint: BufferRing::new(device, BufferUsage::STORAGE, 0)?,
            paint_aux: BufferRing::new(device, BufferUsage::STORAGE, 0)?,
            contour: BufferRing::new(device, BufferUsage::STORAGE, 0)?,
            simple_color_ramps: BufferRing::new(device, BufferUsage::COPY_SRC, 0)?,
            grad_span: BufferRing::new(device, BufferUsage::VERTEX, 0)?,
            tess_span: BufferRing::new(device, BufferUsage::VERTEX, 0)?,
            triangle: BufferRing::new(device, BufferUsage::VERTEX, 0)?,
        })
    }

    fn get(&self, kind: RingKind) -> &BufferRing<D> {
        match kind {
            RingKind::FlushUniform => &self.flush_uniform,
            RingKind::ImageDrawUniform => &self.image_draw_uniform,
            RingKind::Path => &self.path,
            RingKind::Paint => &self.paint,
            RingKind::PaintAux => &self.paint_aux,
            RingKind::Contour => &self.contour,
            RingKind::SimpleColorRamps => &self.simple_color_ramps,
            RingKind::GradSpan => &self.grad_span,
            RingKind::TessSpan => &self.tess_span,
            RingKind::Triangle => &self.triangle,
        }
    }

    fn get_mut(&mut self, kind: RingKind) -> &mut BufferRing<D> {
        match kind {
            RingKind::FlushUniform => &mut self.flush_uniform,
            RingKind::ImageDrawUniform => &mut self.image_draw_uniform,
            RingKind::Path => &mut self.path,
            RingKind::Paint => &mut self.paint,
            RingKind::PaintAux => &mut self.paint_aux,
            RingKind::Contour => &mut self.contour,
            RingKind::SimpleColorRamps => &mut self.simple_color_ramps,
            RingKind::GradSpan => &mut self.grad_span,
            RingKind::TessSpan => &mut self.tess_span,
            RingKind::Triangle => &mut self.triangle,
        }
    }

    fn advance_all(&mut self) -> Result<()> {
        self.flush_uniform.advance()?;
        self.image_draw_uniform.advance()?;
        self.path.advance()?;
        self.paint.advance()?;
        self.paint_aux.advance()?;
        self.contour.advance()?;
        self.simple_color_ramps.advance()?;
        self.grad_span.advance()?;
        self.tess_span.advance()?;
        self.triangle.advance()?;
        Ok(())
    }
}

pub struct RenderContext<D: Device> {
    device: Rc<D>,
    caps: GpuCapabilities,
    pipelines: PipelineManager<D>,
    rings: Rings<D>,

    patch_vertices: GpuBuffer<D>,
    patch_indices: GpuBuffer<D>,
    patch_info: PatchGeometryInfo,
    tess_span_indices: GpuBuffer<D>,
    tess_span_index_count: u32,
    image_rect_vertices: GpuBuffer<D>,
    image_rect_indices: GpuBuffer<D>,
    image_rect_index_count: u32,

    grad_texture: Texture<D>,
    grad_framebuffer: Framebuffer<D>,
    tess_texture: Texture<D>,
    tess_framebuffer: Framebuffer<D>,

    null_image: Rc<ImageTexture<D>>,
    linear_sampler: Sampler<D>,
    mipmap_sampler: Sampler<D>,
    // Always-resident pool backing the null image and sampler sets; never
    // recycled, so those sets survive every flush.
    static_pool: DescriptorSetPool<D>,
    null_image_set: D::DescriptorSet,
    sampler_set: D::DescriptorSet,

    pool_manager: DescriptorPoolManager<D>,
    purgatory: ResourcePurgatory<D>,

    frame_idx: u64,
    frame_fences: [Option<Rc<D::Fence>>; BUFFER_RING_SIZE],
}

impl<D: Device> RenderContext<D> {
    pub fn new(
        device: Rc<D>,
        source: Box<dyn ShaderSource>,
        geometry: &StaticGeometry<'_>,
    ) -> Result<Self> {
        let caps = device.capabilities();
        log::info!(
            "creating render context (raster ordering: {}, wireframe: {})",
            caps.rasterization_order_attachment_access,
            caps.fill_mode_non_solid,
        );
        let pipelines = PipelineManager::new(&device, source)?;
        let rings = Rings::new(&device)?;

        let patch_vertices =
            static_buffer(&device, BufferUsage::VERTEX, geometry.patch_vertices)?;
        let patch_indices = static_buffer(&device, BufferUsage::INDEX, geometry.patch_indices)?;
        let tess_span_indices =
            static_buffer(&device, BufferUsage::INDEX, geometry.tess_span_indices)?;
        let image_rect_vertices =
            static_buffer(&device, BufferUsage::VERTEX, geometry.image_rect_vertices)?;
        let image_rect_indices =
            static_buffer(&device, BufferUsage::INDEX, geometry.image_rect_indices)?;

        let grad_texture = make_grad_texture(&device, 1)?;
        let grad_framebuffer = Framebuffer::new(
            &device,
            pipelines.color_ramp_render_pass(),
            &[grad_texture.view()],
            GRAD_TEXTURE_WIDTH,
            1,
        )?;
        let tess_texture = make_tess_texture(&device, 1)?;
        let tess_framebuffer = Framebuffer::new(
            &device,
            pipelines.tessellate_render_pass(),
            &[tess_texture.view()],
            TESS_TEXTURE_WIDTH,
            1,
        )?;

        // Reserved 1x1 black image bound when a batch has no image paint.
        let null_image = ImageTexture::new(&device, 1, 1, 1, &[0, 0, 0, 0])?;
        let linear_sampler = Sampler::new(&device, SamplerParams::Linear)?;
        let mipmap_sampler = Sampler::new(&device, SamplerParams::LinearMipmap)?;
        let static_pool = DescriptorSetPool::with_limits(
            &device,
            &DescriptorPoolLimits {
                uniform_buffers: 0,
                dynamic_uniform_buffers: 0,
                storage_buffers: 0,
                sampled_textures: 1,
                samplers: 2,
                input_attachments: 0,
                storage_textures: 0,
                max_sets: 2,
            },
        )?;
        let null_image_set = static_pool.allocate(pipelines.per_draw_layout())?;
        device.update_texture_bindings(
            null_image_set,
            per_draw::IMAGE_TEXTURE,
            BindingKind::SampledTexture,
            &[TextureBinding {
                view: null_image.texture().view(),
                layout: ImageLayout::ShaderRead,
            }],
        );
        let sampler_set = static_pool.allocate(pipelines.sampler_layout())?;
        device.update_sampler_bindings(
            sampler_set,
            samplers::LINEAR,
            &[linear_sampler.raw(), mipmap_sampler.raw()],
        );

        let pool_manager = DescriptorPoolManager::new(&device);

        Ok(RenderContext {
            device,
            caps,
            pipelines,
            rings,
            patch_vertices,
            patch_indices,
            patch_info: geometry.patch_info,
            tess_span_indices,
            tess_span_index_count: geometry.tess_span_index_count,
            image_rect_vertices,
            image_rect_indices,
            image_rect_index_count: geometry.image_rect_index_count,
            grad_texture,
            grad_framebuffer,
            tess_texture,
            tess_framebuffer,
            null_image,
            linear_sampler,
            mipmap_sampler,
            static_pool,
            null_image_set,
            sampler_set,
            pool_manager,
            purgatory: ResourcePurgatory::new(),
            frame_idx: 0,
            frame_fences: [None, None, None],
        })
    }

    pub fn device(&self) -> &Rc<D> {
        &self.device
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_idx
    }

    /// Begins a logical frame: rotates every ring to a slot the GPU has
    /// retired, reclaims expired resources, and applies pending growth.
    ///
    /// Blocks if the GPU is more than `BUFFER_RING_SIZE - 1` frames
    /// behind.
    pub fn prepare_to_map_buffers(&mut self) -> Result<()> {
        self.frame_idx += 1;
        let slot = (self.frame_idx % BUFFER_RING_SIZE as u64) as usize;
        if let Some(fence) = self.frame_fences[slot].take() {
            self.device.wait_fence(&fence)?;
        }
        // Reclaim before any reallocation so the frame's new allocations
        // can reuse the memory.
        self.purgatory.reclaim(self.frame_idx);
        self.rings.advance_all()
    }

    /// Requests ring capacity for subsequent frames.
    pub fn resize_buffer(&mut self, kind: RingKind, size: u64) {
        self.rings.get_mut(kind).set_target_size(size);
    }

    /// Writes into the current slot of a ring.
    pub fn write_buffer(&self, kind: RingKind, offset: u64, bytes: &[u8]) -> Result<()> {
        self.rings.get(kind).write(offset, bytes)
    }

    pub fn write_buffer_pod<T: Pod>(&self, kind: RingKind, offset: u64, data: &[T]) -> Result<()> {
        self.rings.get(kind).write_pod(offset, data)
    }

    pub fn gradient_texture_height(&self) -> u32 {
        self.grad_texture.height()
    }

    /// Reports whether the gradient texture must grow before a flush that
    /// needs `required_height` rows. The engine never grows it implicitly;
    /// the caller decides when to pay for the reallocation.
    pub fn gradient_texture_needs_grow(&self, required_height: u32) -> bool {
        required_height > self.grad_texture.height()
    }

    /// Reallocates the gradient texture if `height` differs from the
    /// current height. The old texture may be referenced by in-flight
    /// frames, so it is retired, not destroyed.
    pub fn resize_gradient_texture(&mut self, height: u32) -> Result<()> {
        let height = height.max(1);
        if height == self.grad_texture.height() {
            return Ok(());
        }
        let texture = make_grad_texture(&self.device, height)?;
        let framebuffer = Framebuffer::new(
            &self.device,
            self.pipelines.color_ramp_render_pass(),
            &[texture.view()],
            GRAD_TEXTURE_WIDTH,
            height,
        )?;
        self.purgatory
            .retire(std::mem::replace(&mut self.grad_texture, texture), self.frame_idx);
        self.purgatory.retire(
            std::mem::replace(&mut self.grad_framebuffer, framebuffer),
            self.frame_idx,
        );
        Ok(())
    }

    /// Same as [`resize_gradient_texture`], for the tessellation texture.
    ///
    /// [`resize_gradient_texture`]: RenderContext::resize_gradient_texture
    pub fn resize_tessellation_texture(&mut self, height: u32) -> Result<()> {
        let height = height.max(1);
        if height == self.tess_texture.height() {
            return Ok(());
        }
        let texture = make_tess_texture(&self.device, height)?;
        let framebuffer = Framebuffer::new(
            &self.device,
            self.pipelines.tessellate_render_pass(),
            &[texture.view()],
            TESS_TEXTURE_WIDTH,
            height,
        )?;
        self.purgatory
            .retire(std::mem::replace(&mut self.tess_texture, texture), self.frame_idx);
        self.purgatory.retire(
            std::mem::replace(&mut self.tess_framebuffer, framebuffer),
            self.frame_idx,
        );
        Ok(())
    }

    /// Records one flush into the descriptor's command buffer.
    pub fn flush(&mut self, desc: &mut FlushDescriptor<'_, D>) -> Result<()> {
        let Some(strategy) = interlock::strategy::<D>(desc.interlock_mode) else {
            // Depth-stencil mode is recognized but records nothing.
            return Ok(());
        };
        self.pipelines.ensure_draw_layout(strategy)?;
        debug_assert!(
            desc.complex_grad_rows_top + desc.complex_grad_rows_height
                <= self.grad_texture.height()
        );
        debug_assert!(desc.tess_data_height <= self.tess_texture.height());

        let frame = self.frame_idx;
        let mut pool = self.pool_manager.checkout(frame)?;
        let mut exhausted_pools: Vec<DescriptorSetPool<D>> = Vec::new();
        let mut image_updates: u32 = 0;

        let per_flush_set = pool.allocate(self.pipelines.per_flush_layout())?;
        self.write_per_flush_descriptors(per_flush_set, desc);

        self.record_gradient_passes(desc, per_flush_set)?;
        self.record_tessellation_pass(desc, per_flush_set)?;

        // Pending image uploads, including the null image on first use.
        self.null_image
            .synchronize(desc.cmd_buf, &mut self.purgatory, frame);
        for batch in desc.draw_list {
            if let Some(image) = &batch.image_texture {
                image.synchronize(desc.cmd_buf, &mut self.purgatory, frame);
            }
        }

        desc.render_target.synchronize(strategy.mode())?;
        let target_rect = Rect::from_size(desc.render_target.width(), desc.render_target.height());
        {
            let target = desc.render_target.target();
            if desc.load_action == LoadAction::PreserveRenderTarget {
                target.barrier_to(desc.cmd_buf, ImageLayout::General);
            } else {
                target.discarding_barrier_to(desc.cmd_buf, ImageLayout::General);
            }
        }

        let framebuffer = {
            let render_pass = self.pipelines.draw_render_pass(
                strategy,
                desc.render_target.format(),
                desc.load_action,
            )?;
            let mut views = vec![desc.render_target.target().view()];
            views.extend(strategy.plane_views(desc.render_target));
            Framebuffer::new(
                &self.device,
                render_pass,
                &views,
                target_rect.width,
                target_rect.height,
            )?
        };

        let pls_set = pool.allocate(self.pipelines.pls_layout(strategy.mode())?)?;
        strategy.write_pls_descriptors(&self.device, pls_set, desc.render_target);

        let mut barrier_pending = strategy.prepare(
            desc.cmd_buf,
            desc.render_target,
            desc.load_action,
            desc.coverage_clear_value,
        );

        let clear_values = strategy.clear_values(desc.clear_color, desc.coverage_clear_value);
        {
            let render_pass = self.pipelines.draw_render_pass(
                strategy,
                desc.render_target.format(),
                desc.load_action,
            )?;
            desc.cmd_buf
                .begin_render_pass(render_pass, framebuffer.raw(), target_rect, &clear_values);
        }
        desc.cmd_buf.set_viewport_and_scissor(target_rect);
        {
            let layout = self.pipelines.draw_pipeline_layout(strategy.mode())?;
            desc.cmd_buf.bind_descriptor_sets(
                layout,
                PER_FLUSH_SET,
                &[per_flush_set, self.null_image_set, self.sampler_set, pls_set],
                &[0],
            );
        }

        let resolve_misc =
            strategy.resolve_misc_flags(desc.combined_shader_features, desc.render_target.offscreen());
        let coalesced = resolve_misc.contains(ShaderMiscFlags::COALESCED_RESOLVE_AND_TRANSFER);

        for batch in desc.draw_list {
            if batch.element_count == 0 {
                continue;
            }
            let is_resolve = batch.draw_type == DrawType::AtomicResolve;
            let spec = crate::pipeline::DrawPipelineSpec {
                draw_type: batch.draw_type,
                features: batch.shader_features,
                interlock: strategy.mode(),
                misc: if is_resolve {
                    resolve_misc
                } else {
                    ShaderMiscFlags::empty()
                },
                options: PipelineOptions {
                    wireframe: desc.wireframe && self.caps.fill_mode_non_solid,
                    color_writes_disabled: coalesced && !is_resolve,
                },
                format: desc.render_target.format(),
                load: desc.load_action,
            };

            // Per-draw image binding, cached per texture per frame.
            let draw_set = match &batch.image_texture {
                Some(image) => match image.frame_descriptor_set(frame) {
                    Some(set) => set,
                    None => {
                        if image_updates >= MAX_IMAGE_TEXTURE_UPDATES {
                            // Mid-flush exhaustion: park the full pool and
                            // keep allocating from a fresh one.
                            let fresh = self.pool_manager.checkout(frame)?;
                            exhausted_pools.push(std::mem::replace(&mut pool, fresh));
                            image_updates = 0;
                        }
                        let set = pool.allocate(self.pipelines.per_draw_layout())?;
                        self.device.update_texture_bindings(
                            set,
                            per_draw::IMAGE_TEXTURE,
                            BindingKind::SampledTexture,
                            &[TextureBinding {
                                view: image.texture().view(),
                                layout: ImageLayout::ShaderRead,
                            }],
                        );
                        image.store_frame_descriptor_set(set, frame);
                        image_updates += 1;
                        set
                    }
                },
                None => self.null_image_set,
            };

            {
                let pipeline = self.pipelines.draw_pipeline(strategy, spec)?;
                desc.cmd_buf.bind_pipeline(pipeline);
            }
            {
                let layout = self.pipelines.draw_pipeline_layout(strategy.mode())?;
                desc.cmd_buf
                    .bind_descriptor_sets(layout, PER_DRAW_SET, &[draw_set], &[]);
                if matches!(batch.draw_type, DrawType::ImageRect | DrawType::ImageMesh) {
                    // Image draws address their uniforms through the
                    // dynamic offset.
                    desc.cmd_buf.bind_descriptor_sets(
                        layout,
                        PER_FLUSH_SET,
                        &[per_flush_set],
                        &[batch.image_draw_uniform_offset],
                    );
                }
            }

            if strategy.mode() == InterlockMode::Atomics
                && (barrier_pending || batch.needs_barrier)
            {
                strategy.draw_barrier(desc.cmd_buf);
                barrier_pending = false;
            }

            self.record_batch_draw(desc.cmd_buf, batch)?;
        }

        desc.cmd_buf.end_render_pass();

        self.purgatory.retire(framebuffer, frame);
        for full in exhausted_pools {
            self.pool_manager.checkin(full, frame, &mut self.purgatory);
        }
        self.pool_manager.checkin(pool, frame, &mut self.purgatory);

        if desc.is_final_flush_of_frame {
            let slot = (frame % BUFFER_RING_SIZE as u64) as usize;
            self.frame_fences[slot] = desc.frame_completion_fence.clone();
        }
        Ok(())
    }

    fn write_per_flush_descriptors(
        &self,
        set: D::DescriptorSet,
        desc: &FlushDescriptor<'_, D>,
    ) {
        self.device.update_texture_bindings(
            set,
            per_flush::TESS_VERTEX_TEXTURE,
            BindingKind::SampledTexture,
            &[TextureBinding {
                view: self.tess_texture.view(),
                layout: ImageLayout::ShaderRead,
            }],
        );
        self.device.update_texture_bindings(
            set,
            per_flush::GRAD_TEXTURE,
            BindingKind::SampledTexture,
            &[TextureBinding {
                view: self.grad_texture.view(),
                layout: ImageLayout::ShaderRead,
            }],
        );
        self.device.update_buffer_bindings(
            set,
            per_flush::PATH_BUFFER,
            BindingKind::StorageBuffer,
            &[
                BufferBinding {
                    buffer: self.rings.path.current_raw(),
                    offset: desc.first_path as u64 * PATH_DATA_STRIDE,
                    size: u64::MAX,
                },
                BufferBinding {
                    buffer: self.rings.paint.current_raw(),
                    offset: desc.first_paint as u64 * PAINT_DATA_STRIDE,
                    size: u64::MAX,
                },
                BufferBinding {
                    buffer: self.rings.paint_aux.current_raw(),
                    offset: desc.first_paint_aux as u64 * PAINT_AUX_DATA_STRIDE,
                    size: u64::MAX,
                },
                BufferBinding {
                    buffer: self.rings.contour.current_raw(),
                    offset: desc.first_contour as u64 * CONTOUR_DATA_STRIDE,
                    size: u64::MAX,
                },
            ],
        );
        self.device.update_buffer_bindings(
            set,
            per_flush::FLUSH_UNIFORM_BUFFER,
            BindingKind::UniformBuffer,
            &[BufferBinding {
                buffer: self.rings.flush_uniform.current_raw(),
                offset: desc.flush_uniform_offset,
                size: u64::MAX,
            }],
        );
        self.device.update_buffer_bindings(
            set,
            per_flush::IMAGE_DRAW_UNIFORM_BUFFER,
            BindingKind::DynamicUniformBuffer,
            &[BufferBinding {
                buffer: self.rings.image_draw_uniform.current_raw(),
                offset: 0,
                size: IMAGE_DRAW_UNIFORM_STRIDE,
            }],
        );
    }

    /// Complex gradient render pass, then the simple ramp copy. The
    /// gradient texture's prior contents are always discarded; upstream
    /// re-renders every row the flush references.
    fn record_gradient_passes(
        &mut self,
        desc: &mut FlushDescriptor<'_, D>,
        per_flush_set: D::DescriptorSet,
    ) -> Result<()> {
        let cmd = &mut *desc.cmd_buf;
        self.grad_texture
            .discarding_barrier_to(cmd, ImageLayout::ColorAttachment);
        if desc.complex_grad_span_count > 0 {
            let rows = Rect {
                x: 0,
                y: desc.complex_grad_rows_top as i32,
                width: GRAD_TEXTURE_WIDTH,
                height: desc.complex_grad_rows_height,
            };
            cmd.begin_render_pass(
                self.pipelines.color_ramp_render_pass(),
                self.grad_framebuffer.raw(),
                rows,
                &[],
            );
            cmd.set_viewport_and_scissor(rows);
            cmd.bind_pipeline(self.pipelines.color_ramp_pipeline());
            cmd.bind_descriptor_sets(
                self.pipelines.color_ramp_pipeline_layout(),
                PER_FLUSH_SET,
                &[per_flush_set],
                &[0],
            );
            cmd.bind_vertex_buffer(0, self.rings.grad_span.current_raw());
            cmd.draw(4, desc.complex_grad_span_count, 0, desc.first_complex_grad_span);
            cmd.end_render_pass();
        }
        self.grad_texture.barrier_to(cmd, ImageLayout::TransferDst);
        if desc.simple_grad_texels_height > 0 {
            cmd.copy_buffer_to_texture(
                self.rings.simple_color_ramps.current_raw(),
                desc.simple_grad_data_offset,
                GRAD_TEXTURE_WIDTH,
                self.grad_texture.raw(),
                desc.simple_grad_texels_width,
                desc.simple_grad_texels_height,
            );
        }
        self.grad_texture.barrier_to(cmd, ImageLayout::ShaderRead);
        Ok(())
    }

    fn record_tessellation_pass(
        &mut self,
        desc: &mut FlushDescriptor<'_, D>,
        per_flush_set: D::DescriptorSet,
    ) -> Result<()> {
        let cmd = &mut *desc.cmd_buf;
        if desc.tess_vertex_span_count > 0 {
            self.tess_texture
                .discarding_barrier_to(cmd, ImageLayout::ColorAttachment);
            let rows = Rect::from_size(TESS_TEXTURE_WIDTH, desc.tess_data_height);
            cmd.begin_render_pass(
                self.pipelines.tessellate_render_pass(),
                self.tess_framebuffer.raw(),
                rows,
                &[],
            );
            cmd.set_viewport_and_scissor(rows);
            cmd.bind_pipeline(self.pipelines.tessellate_pipeline());
            cmd.bind_descriptor_sets(
                self.pipelines.tessellate_pipeline_layout(),
                PER_FLUSH_SET,
                &[per_flush_set],
                &[0],
            );
            cmd.bind_vertex_buffer(0, self.rings.tess_span.current_raw());
            cmd.bind_index_buffer(self.tess_span_indices.raw());
            cmd.draw_indexed(
                self.tess_span_index_count,
                desc.tess_vertex_span_count,
                0,
                desc.first_tess_vertex_span,
            );
            cmd.end_render_pass();
            self.tess_texture.barrier_to(cmd, ImageLayout::ShaderRead);
        } else if self.tess_texture.layout() != ImageLayout::ShaderRead {
            // Never rendered to; it still has to be in a sampleable layout
            // for the draw pass.
            self.tess_texture
                .discarding_barrier_to(cmd, ImageLayout::ShaderRead);
        }
        Ok(())
    }

    fn record_batch_draw(
        &self,
        cmd: &mut D::CmdBuf,
        batch: &crate::pls::DrawBatch<D>,
    ) -> Result<()> {
        match batch.draw_type {
            DrawType::MidpointFanPatches | DrawType::OuterCurvePatches => {
                let (index_count, base_index) =
                    if batch.draw_type == DrawType::MidpointFanPatches {
                        (
                            self.patch_info.midpoint_fan_index_count,
                            self.patch_info.midpoint_fan_base_index,
                        )
                    } else {
                        (
                            self.patch_info.outer_curve_index_count,
                            self.patch_info.outer_curve_base_index,
                        )
                    };
                cmd.bind_vertex_buffer(0, self.patch_vertices.raw());
                cmd.bind_index_buffer(self.patch_indices.raw());
                cmd.draw_indexed(index_count, batch.element_count, base_index, batch.base_element);
            }
            DrawType::InteriorTriangulation => {
                cmd.bind_vertex_buffer(0, self.rings.triangle.current_raw());
                cmd.draw(batch.element_count, 1, batch.base_element, 0);
            }
            DrawType::ImageRect => {
                cmd.bind_vertex_buffer(0, self.image_rect_vertices.raw());
                cmd.bind_index_buffer(self.image_rect_indices.raw());
                cmd.draw_indexed(self.image_rect_index_count, 1, batch.base_element, 0);
            }
            DrawType::ImageMesh => {
                let (Some(vertices), Some(uvs), Some(indices)) = (
                    &batch.vertex_buffer,
                    &batch.uv_buffer,
                    &batch.index_buffer,
                ) else {
                    return Err(crate::Error::Backend(
                        "image mesh batch missing render buffers".into(),
                    ));
                };
                cmd.bind_vertex_buffer(0, vertices.current().raw());
                cmd.bind_vertex_buffer(1, uvs.current().raw());
                cmd.bind_index_buffer(indices.current().raw());
                cmd.draw_indexed(batch.element_count, 1, batch.base_element, 0);
            }
            DrawType::AtomicResolve => {
                cmd.draw(4, 1, 0, 0);
            }
        }
        Ok(())
    }
}

impl<D: Device> Drop for RenderContext<D> {
    fn drop(&mut self) {
        // Outstanding frames may still reference everything we are about
        // to release; wait for all of them before any destruction runs.
        for fence in self.frame_fences.iter_mut() {
            if let Some(fence) = fence.take() {
                if self.device.wait_fence(&fence).is_err() {
                    log::warn!("fence wait failed during context teardown");
                }
            }
        }
        self.purgatory.drain();
    }
}

fn static_buffer<D: Device>(
    device: &Rc<D>,
    usage: BufferUsage,
    bytes: &[u8],
) -> Result<GpuBuffer<D>> {
    let buffer = GpuBuffer::new(
        device,
        (bytes.len() as u64).max(4),
        usage | BufferUsage::MAP_WRITE,
    )?;
    buffer.write(0, bytes)?;
    Ok(buffer)
}

fn make_grad_texture<D: Device>(device: &Rc<D>, height: u32) -> Result<Texture<D>> {
    Texture::new(
        device,
        TextureDesc {
            width: GRAD_TEXTURE_WIDTH,
            height,
            mip_levels: 1,
            format: TextureFormat::Rgba8,
            usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        },
    )
}

fn make_tess_texture<D: Device>(device: &Rc<D>, height: u32) -> Result<Texture<D>> {
    Texture::new(
        device,
        TextureDesc {
            width: TESS_TEXTURE_WIDTH,
            height,
            mip_levels: 1,
            format: TextureFormat::Rgba32Uint,
            usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED,
        },
    )
}
