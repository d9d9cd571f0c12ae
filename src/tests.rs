//! End-to-end flush scenarios against the recording stub device.

use std::rc::Rc;

use crate::context::{PatchGeometryInfo, RenderContext, StaticGeometry};
use crate::descriptors::MAX_IMAGE_TEXTURE_UPDATES;
use crate::device::{ImageLayout, Rect, TextureDesc, TextureFormat, TextureUsage};
use crate::image::ImageTexture;
use crate::pls::{
    DrawBatch, DrawType, FlushDescriptor, InterlockMode, LoadAction, ShaderFeatures,
    GRAD_TEXTURE_WIDTH, TESS_TEXTURE_WIDTH,
};
use crate::render_target::RenderTarget;
use crate::resource::Texture;
use crate::stub::{Event, NullShaders, StubCmdBuf, StubDevice, StubFence};

fn context(device: &Rc<StubDevice>) -> RenderContext<StubDevice> {
    let geometry = StaticGeometry {
        patch_vertices: &[0; 64],
        patch_indices: &[0; 48],
        patch_info: PatchGeometryInfo {
            midpoint_fan_index_count: 9,
            midpoint_fan_base_index: 0,
            outer_curve_index_count: 12,
            outer_curve_base_index: 9,
        },
        tess_span_indices: &[0; 24],
        tess_span_index_count: 12,
        image_rect_vertices: &[0; 64],
        image_rect_indices: &[0; 12],
        image_rect_index_count: 6,
    };
    RenderContext::new(device.clone(), Box::new(NullShaders), &geometry).unwrap()
}

fn render_target(device: &Rc<StubDevice>, offscreen: bool) -> RenderTarget<StubDevice> {
    let texture = Rc::new(
        Texture::new(
            device,
            TextureDesc {
                width: 64,
                height: 64,
                mip_levels: 1,
                format: TextureFormat::Rgba8,
                usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::INPUT_ATTACHMENT,
            },
        )
        .unwrap(),
    );
    RenderTarget::new(device, texture, offscreen).unwrap()
}

fn flush_desc<'a>(
    cmd: &'a mut StubCmdBuf,
    target: &'a mut RenderTarget<StubDevice>,
    draws: &'a [DrawBatch<StubDevice>],
) -> FlushDescriptor<'a, StubDevice> {
    FlushDescriptor {
        cmd_buf: cmd,
        render_target: target,
        interlock_mode: InterlockMode::RasterOrdering,
        load_action: LoadAction::Clear,
        clear_color: [0.0; 4],
        coverage_clear_value: 0,
        combined_shader_features: ShaderFeatures::empty(),
        wireframe: false,
        flush_uniform_offset: 0,
        first_path: 0,
        first_paint: 0,
        first_paint_aux: 0,
        first_contour: 0,
        first_complex_grad_span: 0,
        complex_grad_span_count: 0,
        complex_grad_rows_top: 0,
        complex_grad_rows_height: 0,
        simple_grad_data_offset: 0,
        simple_grad_texels_width: 0,
        simple_grad_texels_height: 0,
        first_tess_vertex_span: 0,
        tess_vertex_span_count: 0,
        tess_data_height: 0,
        draw_list: draws,
        is_final_flush_of_frame: false,
        frame_completion_fence: None,
    }
}

fn batch(draw_type: DrawType) -> DrawBatch<StubDevice> {
    DrawBatch {
        draw_type,
        element_count: 1,
        base_element: 0,
        shader_features: ShaderFeatures::empty(),
        image_texture: None,
        vertex_buffer: None,
        uv_buffer: None,
        index_buffer: None,
        image_draw_uniform_offset: 0,
        needs_barrier: false,
    }
}

fn grad_texture_id(device: &StubDevice, height: u32) -> u64 {
    device
        .events()
        .iter()
        .find_map(|e| match e {
            Event::CreateTexture { id, desc }
                if desc.width == GRAD_TEXTURE_WIDTH
                    && desc.height == height
                    && desc.format == TextureFormat::Rgba8 =>
            {
                Some(*id)
            }
            _ => None,
        })
        .unwrap()
}

#[test]
fn fourth_frame_waits_on_first_frames_fence() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    for _ in 0..3 {
        ctx.prepare_to_map_buffers().unwrap();
        let mut desc = flush_desc(&mut cmd, &mut target, &[]);
        desc.is_final_flush_of_frame = true;
        desc.frame_completion_fence = Some(Rc::new(StubFence));
        ctx.flush(&mut desc).unwrap();
    }
    assert_eq!(device.count_events(|e| matches!(e, Event::WaitFence)), 0);

    // The 4th frame reuses the 1st frame's ring slot and must wait for it.
    ctx.prepare_to_map_buffers().unwrap();
    assert_eq!(device.count_events(|e| matches!(e, Event::WaitFence)), 1);
}

#[test]
fn teardown_waits_outstanding_frame_fences() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &[]);
    desc.is_final_flush_of_frame = true;
    desc.frame_completion_fence = Some(Rc::new(StubFence));
    ctx.flush(&mut desc).unwrap();

    drop(ctx);
    assert_eq!(device.count_events(|e| matches!(e, Event::WaitFence)), 1);
}

#[test]
fn resized_gradient_texture_outlives_in_flight_frames() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let old_grad = grad_texture_id(&device, 1);

    ctx.prepare_to_map_buffers().unwrap();
    ctx.resize_gradient_texture(8).unwrap();
    assert!(!device.texture_destroyed(old_grad));

    // Frames 2 and 3 may still have the old texture recorded.
    ctx.prepare_to_map_buffers().unwrap();
    ctx.prepare_to_map_buffers().unwrap();
    assert!(!device.texture_destroyed(old_grad));

    ctx.prepare_to_map_buffers().unwrap();
    assert!(device.texture_destroyed(old_grad));
}

#[test]
fn draw_pipelines_are_reused_across_flushes() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    let draws = [batch(DrawType::MidpointFanPatches)];

    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &draws)).unwrap();
    let after_first = device.pipeline_create_count();

    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &draws)).unwrap();
    assert_eq!(device.pipeline_create_count(), after_first);
}

#[test]
fn descriptor_pools_recycle_after_ring_depth() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    let pools = |device: &StubDevice| {
        device.count_events(|e| matches!(e, Event::CreateDescriptorPool { .. }))
    };
    let before = pools(&device);
    for _ in 0..3 {
        ctx.prepare_to_map_buffers().unwrap();
        ctx.flush(&mut flush_desc(&mut cmd, &mut target, &[])).unwrap();
    }
    // Each of the first ring-depth frames needs a fresh pool.
    assert_eq!(pools(&device) - before, 3);

    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &[])).unwrap();
    assert_eq!(pools(&device) - before, 3);
    assert_eq!(
        device.count_events(|e| matches!(e, Event::ResetDescriptorPool { .. })),
        1
    );
}

#[test]
fn simple_gradients_copy_without_a_ramp_pass() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    ctx.resize_gradient_texture(4).unwrap();
    let grad = grad_texture_id(&device, 4);

    // Warm-up flush so one-time uploads (null image) are out of the log.
    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &[])).unwrap();
    device.clear_events();

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &[]);
    desc.simple_grad_texels_width = GRAD_TEXTURE_WIDTH;
    desc.simple_grad_texels_height = 2;
    ctx.flush(&mut desc).unwrap();

    // Only the draw pass begins; the ramp pass is skipped entirely.
    assert_eq!(
        device.count_events(|e| matches!(e, Event::BeginRenderPass { .. })),
        1
    );
    assert_eq!(
        device.count_events(
            |e| matches!(e, Event::CopyBufferToTexture { dst, height: 2, .. } if *dst == grad)
        ),
        1
    );
    // The gradient texture ends the transfer phase sampleable.
    assert_eq!(
        device.count_events(|e| matches!(
            e,
            Event::TextureBarrier { texture, to: ImageLayout::ShaderRead, .. } if *texture == grad
        )),
        1
    );
}

#[test]
fn complex_gradients_render_an_instanced_strip() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    ctx.resize_gradient_texture(4).unwrap();

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &[]);
    desc.first_complex_grad_span = 2;
    desc.complex_grad_span_count = 5;
    desc.complex_grad_rows_height = 2;
    ctx.flush(&mut desc).unwrap();

    assert_eq!(
        device.count_events(|e| matches!(e, Event::BeginRenderPass { .. })),
        2
    );
    assert_eq!(
        device.count_events(|e| matches!(
            e,
            Event::Draw { vertices: 4, instances: 5, first_instance: 2, .. }
        )),
        1
    );
}

#[test]
fn gradient_pass_viewport_covers_only_the_rendered_rows() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    ctx.resize_gradient_texture(8).unwrap();

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &[]);
    desc.complex_grad_span_count = 1;
    desc.complex_grad_rows_top = 2;
    desc.complex_grad_rows_height = 2;
    ctx.flush(&mut desc).unwrap();

    // Rows above the complex region belong to the simple ramp copy; the
    // ramp pass must not touch them.
    let rows = Rect { x: 0, y: 2, width: GRAD_TEXTURE_WIDTH, height: 2 };
    assert_eq!(
        device.count_events(
            |e| matches!(e, Event::SetViewportAndScissor { rect } if *rect == rows)
        ),
        1
    );
}

#[test]
fn tessellation_pass_draws_indexed_instances() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &[]);
    desc.first_tess_vertex_span = 7;
    desc.tess_vertex_span_count = 3;
    desc.tess_data_height = 1;
    ctx.flush(&mut desc).unwrap();

    assert_eq!(
        device.count_events(|e| matches!(
            e,
            Event::DrawIndexed { indices: 12, instances: 3, first_instance: 7, .. }
        )),
        1
    );
    // The viewport matches the rows actually written this flush, not the
    // full texture.
    let rows = Rect::from_size(TESS_TEXTURE_WIDTH, 1);
    assert_eq!(
        device.count_events(
            |e| matches!(e, Event::SetViewportAndScissor { rect } if *rect == rows)
        ),
        1
    );
}

#[test]
fn atomic_clear_flush_barriers_before_first_batch() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    let mut second = batch(DrawType::OuterCurvePatches);
    second.needs_barrier = true;
    let draws = [batch(DrawType::MidpointFanPatches), second];

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &draws);
    desc.interlock_mode = InterlockMode::Atomics;
    desc.coverage_clear_value = 0xdead;
    ctx.flush(&mut desc).unwrap();

    // Coverage lives in a storage image and is cleared by transfer.
    assert_eq!(
        device.count_events(|e| matches!(e, Event::ClearTexture { .. })),
        1
    );
    // One barrier from the cleared load action, one requested by the
    // second batch.
    assert_eq!(
        device.count_events(|e| matches!(e, Event::AttachmentReadBarrier)),
        2
    );
}

#[test]
fn atomic_coverage_image_stays_out_of_the_framebuffer() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    let draws = [batch(DrawType::MidpointFanPatches)];

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &draws);
    desc.interlock_mode = InterlockMode::Atomics;
    ctx.flush(&mut desc).unwrap();

    // The transfer-cleared coverage plane is the only storage image.
    let coverage = device
        .events()
        .iter()
        .find_map(|e| match e {
            Event::CreateTexture { id, desc }
                if desc.usage.contains(TextureUsage::STORAGE) =>
            {
                Some(*id)
            }
            _ => None,
        })
        .unwrap();
    for event in device.events() {
        if let Event::CreateFramebuffer { attachments, .. } = event {
            assert!(!attachments.contains(&coverage));
        }
    }
    // The clip view fills the unused coverage slot, so the draw
    // framebuffer binds it twice.
    assert_eq!(
        device.count_events(|e| matches!(
            e,
            Event::CreateFramebuffer { attachments, .. }
                if attachments.len() == 3 && attachments[1] == attachments[2]
        )),
        1
    );
}

#[test]
fn raster_ordering_flush_needs_no_draw_barriers() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    let draws = [batch(DrawType::MidpointFanPatches), batch(DrawType::OuterCurvePatches)];

    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &draws)).unwrap();
    assert_eq!(
        device.count_events(|e| matches!(e, Event::AttachmentReadBarrier)),
        0
    );
}

#[test]
fn pls_planes_persist_across_flushes() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &[])).unwrap();
    let created = device.texture_create_count();

    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &[])).unwrap();
    assert_eq!(device.texture_create_count(), created);
}

#[test]
fn image_texture_overflow_checks_out_a_second_pool() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    let count = MAX_IMAGE_TEXTURE_UPDATES as usize + 1;
    let draws: Vec<_> = (0..count)
        .map(|_| {
            let mut b = batch(DrawType::ImageRect);
            b.image_texture = Some(ImageTexture::new(&device, 1, 1, 1, &[0, 0, 0, 0]).unwrap());
            b
        })
        .collect();

    ctx.prepare_to_map_buffers().unwrap();
    let pools_before =
        device.count_events(|e| matches!(e, Event::CreateDescriptorPool { .. }));
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &draws)).unwrap();
    let pools_after =
        device.count_events(|e| matches!(e, Event::CreateDescriptorPool { .. }));

    assert_eq!(pools_after - pools_before, 2);
    // Every batch still draws.
    assert_eq!(
        device.count_events(|e| matches!(e, Event::DrawIndexed { indices: 6, .. })),
        count
    );
}

#[test]
fn image_rect_draw_starts_at_its_base_element() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();
    let mut rect = batch(DrawType::ImageRect);
    rect.base_element = 5;
    let draws = [rect];

    ctx.prepare_to_map_buffers().unwrap();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &draws)).unwrap();
    assert_eq!(
        device.count_events(|e| matches!(
            e,
            Event::DrawIndexed { indices: 6, instances: 1, first_index: 5, first_instance: 0 }
        )),
        1
    );
}

#[test]
fn repeated_image_draws_share_one_descriptor_set() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    let image = ImageTexture::new(&device, 1, 1, 1, &[0, 0, 0, 0]).unwrap();
    let draws: Vec<_> = (0..4)
        .map(|_| {
            let mut b = batch(DrawType::ImageRect);
            b.image_texture = Some(image.clone());
            b
        })
        .collect();

    ctx.prepare_to_map_buffers().unwrap();
    device.clear_events();
    ctx.flush(&mut flush_desc(&mut cmd, &mut target, &draws)).unwrap();

    use crate::device::BindingKind;
    // Two per-flush texture writes (tess, grad) plus exactly one image
    // write; the other three draws reuse its set.
    assert_eq!(
        device.count_events(|e| matches!(
            e,
            Event::UpdateTextureBindings { kind: BindingKind::SampledTexture, count: 1, .. }
        )),
        3
    );
}

#[test]
fn depth_stencil_flush_records_nothing() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, false);
    let mut cmd = device.new_cmd_buf();

    let draws = [batch(DrawType::MidpointFanPatches)];
    ctx.prepare_to_map_buffers().unwrap();
    device.clear_events();
    let mut desc = flush_desc(&mut cmd, &mut target, &draws);
    desc.interlock_mode = InterlockMode::DepthStencil;
    ctx.flush(&mut desc).unwrap();
    assert!(device.events().is_empty());
}

#[test]
fn coalesced_resolve_masks_ordinary_draws() {
    let device = Rc::new(StubDevice::new());
    let mut ctx = context(&device);
    let mut target = render_target(&device, true);
    let mut cmd = device.new_cmd_buf();
    let draws = [
        batch(DrawType::MidpointFanPatches),
        batch(DrawType::AtomicResolve),
    ];

    ctx.prepare_to_map_buffers().unwrap();
    let mut desc = flush_desc(&mut cmd, &mut target, &draws);
    desc.interlock_mode = InterlockMode::Atomics;
    desc.combined_shader_features = ShaderFeatures::ENABLE_ADVANCED_BLEND;
    ctx.flush(&mut desc).unwrap();

    // The ordinary draw gets a color-masked pipeline, the resolve does not.
    assert_eq!(
        device.count_events(
            |e| matches!(e, Event::CreatePipeline { color_writes_disabled: true, .. })
        ),
        1
    );
    assert_eq!(
        device.count_events(|e| matches!(
            e,
            Event::CreatePipeline { color_writes_disabled: false, .. }
        )),
        // Two fixed pipelines plus the resolve pipeline.
        3
    );
}
