//! Vulkan implementation of the device abstraction, via `ash`.
//!
//! The caller owns the instance, physical device, queue, command buffers,
//! and fences; this layer only creates resources and records commands. All
//! handles returned through the [`Device`] trait are raw Vulkan objects
//! plus their backing memory, destroyed explicitly by the engine's
//! lifecycle machinery.

use std::rc::Rc;

use ash::vk;

use crate::device::{
    BindingKind, BufferBinding, BufferUsage, ClearValue, CmdBuf, DescriptorPoolLimits, Device,
    GpuCapabilities, ImageLayout, LayoutBinding, LoadOp, Rect, RenderPassDesc, RenderPipelineDesc,
    SamplerParams, StageFlags, TextureBinding, TextureDesc, TextureFormat, TextureUsage, Topology,
    VertexLayout,
};
use crate::{Error, Result};

// VK_SUBPASS_DESCRIPTION_RASTERIZATION_ORDER_ATTACHMENT_COLOR_ACCESS_BIT_EXT
const SUBPASS_RASTER_ORDER_COLOR_ACCESS: vk::SubpassDescriptionFlags =
    vk::SubpassDescriptionFlags::from_raw(0x10);
// VK_PIPELINE_COLOR_BLEND_STATE_CREATE_RASTERIZATION_ORDER_ATTACHMENT_ACCESS_BIT_EXT
const BLEND_RASTER_ORDER_ACCESS: vk::PipelineColorBlendStateCreateFlags =
    vk::PipelineColorBlendStateCreateFlags::from_raw(0x1);

struct RawDevice {
    device: ash::Device,
}

pub struct VkDevice {
    device: Rc<RawDevice>,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    caps: GpuCapabilities,
}

/// A handle to a buffer and its backing memory.
///
/// There is no lifetime tracking at this level; the engine is responsible
/// for destroying the buffer at the appropriate time.
pub struct VkBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

impl VkBuffer {
    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }
}

pub struct VkImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    mip_levels: u32,
}

impl VkImage {
    pub fn raw(&self) -> vk::Image {
        self.image
    }
}

pub struct VkCmdBuf {
    device: Rc<RawDevice>,
    cmd_buf: vk::CommandBuffer,
}

impl VkDevice {
    /// Wraps an already-created logical device.
    ///
    /// # Safety
    /// `device` must belong to `physical_device` on `instance`, and `caps`
    /// must not claim capabilities the device and its enabled extensions
    /// lack.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        caps: GpuCapabilities,
    ) -> Self {
        let mem_props = instance.get_physical_device_memory_properties(physical_device);
        VkDevice {
            device: Rc::new(RawDevice { device }),
            mem_props,
            caps,
        }
    }

    /// Wraps a caller-allocated command buffer in the recording state.
    pub fn wrap_cmd_buf(&self, cmd_buf: vk::CommandBuffer) -> VkCmdBuf {
        VkCmdBuf {
            device: self.device.clone(),
            cmd_buf,
        }
    }

    unsafe fn alloc_bound_memory(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let memory_type =
            find_memory_type(requirements.memory_type_bits, flags, &self.mem_props)
                .ok_or_else(|| Error::Backend("no suitable memory type".into()))?;
        let memory = self.device.device.allocate_memory(
            &vk::MemoryAllocateInfo::builder()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type),
            None,
        )?;
        Ok(memory)
    }
}

fn find_memory_type(
    memory_type_bits: u32,
    property_flags: vk::MemoryPropertyFlags,
    props: &vk::PhysicalDeviceMemoryProperties,
) -> Option<u32> {
    for i in 0..props.memory_type_count {
        if (memory_type_bits & (1 << i)) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(property_flags)
        {
            return Some(i);
        }
    }
    None
}

fn map_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    flags
}

fn map_texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::COLOR_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::INPUT_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::INPUT_ATTACHMENT;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

fn map_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
        TextureFormat::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
    }
}

fn map_load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

fn map_binding_kind(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::DynamicUniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
        BindingKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        BindingKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
    }
}

fn map_stages(stages: StageFlags) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(StageFlags::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(StageFlags::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    flags
}

/// Layout, access mask, and pipeline stage for one layout state.
fn layout_info(layout: ImageLayout) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        ImageLayout::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        ImageLayout::TransferSrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::TransferDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::ShaderRead => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ImageLayout::ColorAttachment => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::General => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
    }
}

fn vertex_input(
    layout: VertexLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let binding = |binding, stride, input_rate| vk::VertexInputBindingDescription {
        binding,
        stride,
        input_rate,
    };
    let attr = |location, binding, format, offset| vk::VertexInputAttributeDescription {
        location,
        binding,
        format,
        offset,
    };
    match layout {
        VertexLayout::None => (Vec::new(), Vec::new()),
        VertexLayout::Patch => (
            vec![binding(0, 32, vk::VertexInputRate::VERTEX)],
            vec![
                attr(0, 0, vk::Format::R32G32B32A32_SFLOAT, 0),
                attr(1, 0, vk::Format::R32G32B32A32_SFLOAT, 16),
            ],
        ),
        VertexLayout::Triangle => (
            vec![binding(0, 12, vk::VertexInputRate::VERTEX)],
            vec![attr(0, 0, vk::Format::R32G32B32_SFLOAT, 0)],
        ),
        VertexLayout::ImageRect => (
            vec![binding(0, 16, vk::VertexInputRate::VERTEX)],
            vec![attr(0, 0, vk::Format::R32G32B32A32_SFLOAT, 0)],
        ),
        VertexLayout::ImageMesh => (
            vec![
                binding(0, 8, vk::VertexInputRate::VERTEX),
                binding(1, 8, vk::VertexInputRate::VERTEX),
            ],
            vec![
                attr(0, 0, vk::Format::R32G32_SFLOAT, 0),
                attr(1, 1, vk::Format::R32G32_SFLOAT, 0),
            ],
        ),
        VertexLayout::GradientSpan => (
            vec![binding(0, 16, vk::VertexInputRate::INSTANCE)],
            vec![attr(0, 0, vk::Format::R32G32B32A32_UINT, 0)],
        ),
        VertexLayout::TessSpan => (
            vec![binding(0, 64, vk::VertexInputRate::INSTANCE)],
            vec![
                attr(0, 0, vk::Format::R32G32B32A32_SFLOAT, 0),
                attr(1, 0, vk::Format::R32G32B32A32_SFLOAT, 16),
                attr(2, 0, vk::Format::R32G32B32A32_SFLOAT, 32),
                attr(3, 0, vk::Format::R32G32B32A32_UINT, 48),
            ],
        ),
    }
}

fn map_clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::Uint(uint32) => vk::ClearValue {
            color: vk::ClearColorValue { uint32 },
        },
    }
}

fn full_color_range(mip_levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Device for VkDevice {
    type Buffer = VkBuffer;
    type Texture = VkImage;
    type TextureView = vk::ImageView;
    type Sampler = vk::Sampler;
    type ShaderModule = vk::ShaderModule;
    type DescriptorSetLayout = vk::DescriptorSetLayout;
    type PipelineLayout = vk::PipelineLayout;
    type DescriptorPool = vk::DescriptorPool;
    type DescriptorSet = vk::DescriptorSet;
    type RenderPass = vk::RenderPass;
    type Framebuffer = vk::Framebuffer;
    type Pipeline = vk::Pipeline;
    type Fence = vk::Fence;
    type CmdBuf = VkCmdBuf;

    fn capabilities(&self) -> GpuCapabilities {
        self.caps
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<VkBuffer> {
        unsafe {
            let device = &self.device.device;
            let buffer = device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size.max(1))
                    .usage(map_buffer_usage(usage))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )?;
            let mem_flags = if usage.contains(BufferUsage::MAP_WRITE) {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            } else {
                vk::MemoryPropertyFlags::DEVICE_LOCAL
            };
            let requirements = device.get_buffer_memory_requirements(buffer);
            let memory = match self.alloc_bound_memory(requirements, mem_flags) {
                Ok(memory) => memory,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            device.bind_buffer_memory(buffer, memory, 0)?;
            Ok(VkBuffer { buffer, memory })
        }
    }

    unsafe fn destroy_buffer(&self, buffer: &VkBuffer) {
        let device = &self.device.device;
        device.destroy_buffer(buffer.buffer, None);
        device.free_memory(buffer.memory, None);
    }

    unsafe fn map_buffer(&self, buffer: &VkBuffer, offset: u64, size: u64) -> Result<*mut u8> {
        let ptr = self.device.device.map_memory(
            buffer.memory,
            offset,
            size,
            vk::MemoryMapFlags::empty(),
        )?;
        Ok(ptr as *mut u8)
    }

    unsafe fn unmap_buffer(&self, buffer: &VkBuffer, _offset: u64, _size: u64) {
        self.device.device.unmap_memory(buffer.memory);
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<VkImage> {
        unsafe {
            let device = &self.device.device;
            let format = map_format(desc.format);
            let image = device.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(format)
                    .extent(vk::Extent3D {
                        width: desc.width,
                        height: desc.height,
                        depth: 1,
                    })
                    .mip_levels(desc.mip_levels)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(map_texture_usage(desc.usage))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                None,
            )?;
            let requirements = device.get_image_memory_requirements(image);
            let memory =
                match self.alloc_bound_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                {
                    Ok(memory) => memory,
                    Err(e) => {
                        device.destroy_image(image, None);
                        return Err(e);
                    }
                };
            device.bind_image_memory(image, memory, 0)?;
            Ok(VkImage {
                image,
                memory,
                format,
                mip_levels: desc.mip_levels,
            })
        }
    }

    unsafe fn destroy_texture(&self, texture: &VkImage) {
        let device = &self.device.device;
        device.destroy_image(texture.image, None);
        device.free_memory(texture.memory, None);
    }

    fn create_texture_view(&self, texture: &VkImage) -> Result<vk::ImageView> {
        unsafe {
            let view = self.device.device.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(texture.image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(texture.format)
                    .subresource_range(full_color_range(texture.mip_levels)),
                None,
            )?;
            Ok(view)
        }
    }

    unsafe fn destroy_texture_view(&self, view: &vk::ImageView) {
        self.device.device.destroy_image_view(*view, None);
    }

    fn create_sampler(&self, params: SamplerParams) -> Result<vk::Sampler> {
        let (mipmap_mode, max_lod) = match params {
            SamplerParams::Linear => (vk::SamplerMipmapMode::NEAREST, 0.25),
            SamplerParams::LinearMipmap => (vk::SamplerMipmapMode::LINEAR, vk::LOD_CLAMP_NONE),
        };
        unsafe {
            let sampler = self.device.device.create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .mipmap_mode(mipmap_mode)
                    .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .max_lod(max_lod),
                None,
            )?;
            Ok(sampler)
        }
    }

    unsafe fn destroy_sampler(&self, sampler: &vk::Sampler) {
        self.device.device.destroy_sampler(*sampler, None);
    }

    fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule> {
        unsafe {
            let module = self
                .device
                .device
                .create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(spirv), None)?;
            Ok(module)
        }
    }

    unsafe fn destroy_shader_module(&self, module: &vk::ShaderModule) {
        self.device.device.destroy_shader_module(*module, None);
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(map_binding_kind(b.kind))
                    .descriptor_count(1)
                    .stage_flags(map_stages(b.stages))
                    .build()
            })
            .collect::<Vec<_>>();
        unsafe {
            let layout = self.device.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings),
                None,
            )?;
            Ok(layout)
        }
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: &vk::DescriptorSetLayout) {
        self.device
            .device
            .destroy_descriptor_set_layout(*layout, None);
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[&vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout> {
        let layouts = set_layouts.iter().map(|l| **l).collect::<Vec<_>>();
        unsafe {
            let layout = self.device.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts),
                None,
            )?;
            Ok(layout)
        }
    }

    unsafe fn destroy_pipeline_layout(&self, layout: &vk::PipelineLayout) {
        self.device.device.destroy_pipeline_layout(*layout, None);
    }

    fn create_descriptor_pool(&self, limits: &DescriptorPoolLimits) -> Result<vk::DescriptorPool> {
        let mut sizes = Vec::new();
        let mut push = |ty, descriptor_count| {
            if descriptor_count > 0 {
                sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count,
                });
            }
        };
        push(vk::DescriptorType::UNIFORM_BUFFER, limits.uniform_buffers);
        push(
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            limits.dynamic_uniform_buffers,
        );
        push(vk::DescriptorType::STORAGE_BUFFER, limits.storage_buffers);
        push(vk::DescriptorType::SAMPLED_IMAGE, limits.sampled_textures);
        push(vk::DescriptorType::SAMPLER, limits.samplers);
        push(
            vk::DescriptorType::INPUT_ATTACHMENT,
            limits.input_attachments,
        );
        push(vk::DescriptorType::STORAGE_IMAGE, limits.storage_textures);
        unsafe {
            let pool = self.device.device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(limits.max_sets)
                    .pool_sizes(&sizes),
                None,
            )?;
            Ok(pool)
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: &vk::DescriptorPool) {
        self.device.device.destroy_descriptor_pool(*pool, None);
    }

    fn allocate_descriptor_set(
        &self,
        pool: &vk::DescriptorPool,
        layout: &vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [*layout];
        unsafe {
            let sets = self.device.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(*pool)
                    .set_layouts(&layouts),
            )?;
            Ok(sets[0])
        }
    }

    unsafe fn reset_descriptor_pool(&self, pool: &vk::DescriptorPool) {
        let _ = self
            .device
            .device
            .reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty());
    }

    fn update_buffer_bindings(
        &self,
        set: vk::DescriptorSet,
        first_binding: u32,
        kind: BindingKind,
        bindings: &[BufferBinding<'_, Self>],
    ) {
        // `u64::MAX` is VK_WHOLE_SIZE, so the size maps through unchanged.
        let infos = bindings
            .iter()
            .map(|b| vk::DescriptorBufferInfo {
                buffer: b.buffer.buffer,
                offset: b.offset,
                range: b.size,
            })
            .collect::<Vec<_>>();
        let writes = infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(first_binding + i as u32)
                    .descriptor_type(map_binding_kind(kind))
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect::<Vec<_>>();
        unsafe {
            self.device.device.update_descriptor_sets(&writes, &[]);
        }
    }

    fn update_texture_bindings(
        &self,
        set: vk::DescriptorSet,
        first_binding: u32,
        kind: BindingKind,
        bindings: &[TextureBinding<'_, Self>],
    ) {
        let infos = bindings
            .iter()
            .map(|b| vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: *b.view,
                image_layout: layout_info(b.layout).0,
            })
            .collect::<Vec<_>>();
        let writes = infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(first_binding + i as u32)
                    .descriptor_type(map_binding_kind(kind))
                    .image_info(std::slice::from_ref(info))
                    .build()
            })
            .collect::<Vec<_>>();
        unsafe {
            self.device.device.update_descriptor_sets(&writes, &[]);
        }
    }

    fn update_sampler_bindings(
        &self,
        set: vk::DescriptorSet,
        first_binding: u32,
        samplers: &[&vk::Sampler],
    ) {
        let infos = samplers
            .iter()
            .map(|s| vk::DescriptorImageInfo {
                sampler: **s,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            })
            .collect::<Vec<_>>();
        let writes = infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(first_binding + i as u32)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(std::slice::from_ref(info))
                    .build()
            })
            .collect::<Vec<_>>();
        unsafe {
            self.device.device.update_descriptor_sets(&writes, &[]);
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc<'_>) -> Result<vk::RenderPass> {
        let in_pass_layout = |general: bool| {
            if general {
                vk::ImageLayout::GENERAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            }
        };
        let attachments = desc
            .attachments
            .iter()
            .map(|a| {
                let layout = in_pass_layout(a.general_layout);
                vk::AttachmentDescription::builder()
                    .format(map_format(a.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(map_load_op(a.load_op))
                    .store_op(if a.store {
                        vk::AttachmentStoreOp::STORE
                    } else {
                        vk::AttachmentStoreOp::DONT_CARE
                    })
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    // A loaded attachment arrives already transitioned; the
                    // contents of anything else may be discarded.
                    .initial_layout(if a.load_op == LoadOp::Load {
                        layout
                    } else {
                        vk::ImageLayout::UNDEFINED
                    })
                    .final_layout(layout)
                    .build()
            })
            .collect::<Vec<_>>();

        let color_refs = desc
            .attachments
            .iter()
            .enumerate()
            .map(|(i, a)| {
                if desc.unused_color_mask & (1 << i) != 0 {
                    vk::AttachmentReference {
                        attachment: vk::ATTACHMENT_UNUSED,
                        layout: vk::ImageLayout::UNDEFINED,
                    }
                } else {
                    vk::AttachmentReference {
                        attachment: i as u32,
                        layout: in_pass_layout(a.general_layout),
                    }
                }
            })
            .collect::<Vec<_>>();
        let input_refs = if desc.reads_color_attachments {
            desc.attachments
                .iter()
                .enumerate()
                .filter(|(i, _)| desc.unused_color_mask & (1 << i) == 0)
                .map(|(i, a)| vk::AttachmentReference {
                    attachment: i as u32,
                    layout: in_pass_layout(a.general_layout),
                })
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .input_attachments(&input_refs);
        if desc.rasterization_ordered {
            subpass = subpass.flags(SUBPASS_RASTER_ORDER_COLOR_ACCESS);
        }
        let subpasses = [subpass.build()];

        let dependencies;
        let mut info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses);
        if desc.by_region_self_dependency {
            dependencies = [vk::SubpassDependency::builder()
                .src_subpass(0)
                .dst_subpass(0)
                .src_stage_mask(
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                        | vk::PipelineStageFlags::FRAGMENT_SHADER,
                )
                .src_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::SHADER_WRITE,
                )
                .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_access_mask(
                    vk::AccessFlags::INPUT_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
                )
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build()];
            info = info.dependencies(&dependencies);
        }
        unsafe {
            let render_pass = self.device.device.create_render_pass(&info, None)?;
            Ok(render_pass)
        }
    }

    unsafe fn destroy_render_pass(&self, render_pass: &vk::RenderPass) {
        self.device.device.destroy_render_pass(*render_pass, None);
    }

    fn create_framebuffer(
        &self,
        render_pass: &vk::RenderPass,
        attachments: &[&vk::ImageView],
        width: u32,
        height: u32,
    ) -> Result<vk::Framebuffer> {
        let views = attachments.iter().map(|v| **v).collect::<Vec<_>>();
        unsafe {
            let framebuffer = self.device.device.create_framebuffer(
                &vk::FramebufferCreateInfo::builder()
                    .render_pass(*render_pass)
                    .attachments(&views)
                    .width(width)
                    .height(height)
                    .layers(1),
                None,
            )?;
            Ok(framebuffer)
        }
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: &vk::Framebuffer) {
        self.device.device.destroy_framebuffer(*framebuffer, None);
    }

    fn create_render_pipeline(&self, desc: &RenderPipelineDesc<'_, Self>) -> Result<vk::Pipeline> {
        let entry_name = unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"main\0") };

        // Boolean specialization constants, one u32 per constant id.
        let toggle_data: [u32; 6];
        let toggle_entries: [vk::SpecializationMapEntry; 6];
        let specialization;
        let mut stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(*desc.vertex)
                .name(entry_name)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(*desc.fragment)
                .name(entry_name)
                .build(),
        ];
        if let Some(toggles) = desc.feature_toggles {
            toggle_data = toggles.map(u32::from);
            toggle_entries = std::array::from_fn(|i| vk::SpecializationMapEntry {
                constant_id: i as u32,
                offset: (i * 4) as u32,
                size: 4,
            });
            specialization = vk::SpecializationInfo::builder()
                .map_entries(&toggle_entries)
                .data(bytemuck::cast_slice(&toggle_data))
                .build();
            for stage in &mut stages {
                stage.p_specialization_info = &specialization;
            }
        }

        let (vertex_bindings, vertex_attrs) = vertex_input(desc.vertex_layout);
        let vertex_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attrs);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(
            match desc.topology {
                Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
                Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            },
        );

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(if desc.wireframe {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            })
            .cull_mode(if desc.cull_back_faces {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            .front_face(if desc.clockwise_front_face {
                vk::FrontFace::CLOCKWISE
            } else {
                vk::FrontFace::COUNTER_CLOCKWISE
            })
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // Blending happens in the shaders; only the write mask varies, and
        // only on the render target slot.
        let target_write_mask = if desc.color_writes_disabled {
            vk::ColorComponentFlags::empty()
        } else {
            vk::ColorComponentFlags::RGBA
        };
        let blend_attachments = (0..desc.color_attachment_count)
            .map(|i| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .blend_enable(false)
                    .color_write_mask(if i == 0 {
                        target_write_mask
                    } else {
                        vk::ColorComponentFlags::RGBA
                    })
                    .build()
            })
            .collect::<Vec<_>>();
        let mut blend_state =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);
        if desc.rasterization_ordered_attachments {
            blend_state = blend_state.flags(BLEND_RASTER_ORDER_ACCESS);
        }

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_state)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&blend_state)
            .dynamic_state(&dynamic_state)
            .layout(*desc.pipeline_layout)
            .render_pass(*desc.render_pass)
            .subpass(0)
            .build();
        unsafe {
            let pipelines = self
                .device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| Error::Vulkan(err))?;
            Ok(pipelines[0])
        }
    }

    unsafe fn destroy_pipeline(&self, pipeline: &vk::Pipeline) {
        self.device.device.destroy_pipeline(*pipeline, None);
    }

    fn wait_fence(&self, fence: &vk::Fence) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[*fence], true, u64::MAX)?;
        }
        Ok(())
    }
}

impl CmdBuf<VkDevice> for VkCmdBuf {
    fn begin_render_pass(
        &mut self,
        render_pass: &vk::RenderPass,
        framebuffer: &vk::Framebuffer,
        render_area: Rect,
        clear_values: &[ClearValue],
    ) {
        let clear_values = clear_values
            .iter()
            .map(|v| map_clear_value(*v))
            .collect::<Vec<_>>();
        unsafe {
            self.device.device.cmd_begin_render_pass(
                self.cmd_buf,
                &vk::RenderPassBeginInfo::builder()
                    .render_pass(*render_pass)
                    .framebuffer(*framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D {
                            x: render_area.x,
                            y: render_area.y,
                        },
                        extent: vk::Extent2D {
                            width: render_area.width,
                            height: render_area.height,
                        },
                    })
                    .clear_values(&clear_values),
                vk::SubpassContents::INLINE,
            );
        }
    }

    fn end_render_pass(&mut self) {
        unsafe {
            self.device.device.cmd_end_render_pass(self.cmd_buf);
        }
    }

    fn bind_pipeline(&mut self, pipeline: &vk::Pipeline) {
        unsafe {
            self.device.device.cmd_bind_pipeline(
                self.cmd_buf,
                vk::PipelineBindPoint::GRAPHICS,
                *pipeline,
            );
        }
    }

    fn set_viewport_and_scissor(&mut self, rect: Rect) {
        unsafe {
            let device = &self.device.device;
            device.cmd_set_viewport(
                self.cmd_buf,
                0,
                &[vk::Viewport {
                    x: rect.x as f32,
                    y: rect.y as f32,
                    width: rect.width as f32,
                    height: rect.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.cmd_set_scissor(
                self.cmd_buf,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D {
                        x: rect.x,
                        y: rect.y,
                    },
                    extent: vk::Extent2D {
                        width: rect.width,
                        height: rect.height,
                    },
                }],
            );
        }
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: &vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                self.cmd_buf,
                vk::PipelineBindPoint::GRAPHICS,
                *layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: &VkBuffer) {
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(self.cmd_buf, slot, &[buffer.buffer], &[0]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: &VkBuffer) {
        unsafe {
            self.device.device.cmd_bind_index_buffer(
                self.cmd_buf,
                buffer.buffer,
                0,
                vk::IndexType::UINT16,
            );
        }
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.device.cmd_draw(
                self.cmd_buf,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.device.cmd_draw_indexed(
                self.cmd_buf,
                index_count,
                instance_count,
                first_index,
                0,
                first_instance,
            );
        }
    }

    fn texture_barrier(
        &mut self,
        texture: &VkImage,
        from: ImageLayout,
        to: ImageLayout,
        levels: std::ops::Range<u32>,
    ) {
        let (old_layout, src_access, src_stage) = layout_info(from);
        let (new_layout, dst_access, dst_stage) = layout_info(to);
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: levels.start,
                level_count: levels.end - levels.start,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.cmd_buf,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn attachment_read_barrier(&mut self) {
        // Matches the render pass's by-region self-dependency.
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::SHADER_WRITE,
            )
            .dst_access_mask(vk::AccessFlags::INPUT_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ)
            .build();
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.cmd_buf,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::BY_REGION,
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &VkBuffer,
        src_offset: u64,
        src_row_length: u32,
        dst: &VkImage,
        width: u32,
        height: u32,
    ) {
        let region = vk::BufferImageCopy {
            buffer_offset: src_offset,
            buffer_row_length: src_row_length,
            buffer_image_height: 0,
            image_subresource: color_layers(0),
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        unsafe {
            self.device.device.cmd_copy_buffer_to_image(
                self.cmd_buf,
                src.buffer,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn blit_mip(&mut self, texture: &VkImage, src_level: u32, src_width: u32, src_height: u32) {
        let dst_width = (src_width / 2).max(1);
        let dst_height = (src_height / 2).max(1);
        let blit = vk::ImageBlit {
            src_subresource: color_layers(src_level),
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: src_width as i32,
                    y: src_height as i32,
                    z: 1,
                },
            ],
            dst_subresource: color_layers(src_level + 1),
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dst_width as i32,
                    y: dst_height as i32,
                    z: 1,
                },
            ],
        };
        unsafe {
            self.device.device.cmd_blit_image(
                self.cmd_buf,
                texture.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }
    }

    fn clear_texture(&mut self, texture: &VkImage, value: ClearValue) {
        let clear = match value {
            ClearValue::Color(float32) => vk::ClearColorValue { float32 },
            ClearValue::Uint(uint32) => vk::ClearColorValue { uint32 },
        };
        unsafe {
            self.device.device.cmd_clear_color_image(
                self.cmd_buf,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[full_color_range(texture.mip_levels)],
            );
        }
    }
}
