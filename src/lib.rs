//! Flush orchestration and GPU resource lifecycle for pixel-local-storage
//! vector rendering.
//!
//! This crate owns the GPU-facing half of a PLS rasterizer: ring-buffered
//! upload buffers, deferred destruction of in-flight resources, descriptor
//! pool recycling, a pipeline/shader-variant cache, render-target auxiliary
//! plane management, and the flush-time pass sequence that ties them
//! together. Scene building and path tessellation happen upstream; this
//! layer takes the buffers they filled and turns them into recorded GPU
//! work.
//!
//! The engine core is generic over a backend [`Device`], so the lifecycle
//! logic is testable without a GPU. An `ash`-based Vulkan implementation is
//! provided behind the default `vulkan` feature.

use thiserror::Error;

mod buffer_ring;
mod context;
mod descriptors;
mod device;
mod image;
mod interlock;
mod pipeline;
mod pls;
mod purgatory;
mod render_target;
mod resource;
#[cfg(test)]
mod stub;
#[cfg(test)]
mod tests;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use buffer_ring::BufferRing;
pub use context::{PatchGeometryInfo, RenderContext, RingKind, StaticGeometry};
pub use descriptors::{DescriptorPoolManager, DescriptorSetPool};
pub use device::{
    AttachmentDesc, BindingKind, BufferBinding, BufferUsage, ClearValue, CmdBuf,
    DescriptorPoolLimits, Device, GpuCapabilities, ImageLayout, LayoutBinding, LoadOp, Rect,
    RenderPassDesc, RenderPipelineDesc, SamplerParams, StageFlags, TextureBinding, TextureDesc,
    TextureFormat, TextureUsage, Topology, VertexLayout,
};
pub use image::{ImageTexture, RenderBuffer};
pub use pipeline::{PipelineManager, ShaderSource, ShaderStagePair};
pub use pls::{
    DrawBatch, DrawType, FlushDescriptor, InterlockMode, LoadAction, ShaderFeatures,
    ShaderMiscFlags, BUFFER_RING_SIZE, GRAD_TEXTURE_WIDTH, TESS_TEXTURE_WIDTH,
};
pub use purgatory::{ResourcePurgatory, Retired};
pub use render_target::RenderTarget;
pub use resource::{Framebuffer, GpuBuffer, Sampler, Texture};

/// The common error type for the crate.
///
/// Backend failures are unrecoverable as far as the engine is concerned;
/// callers are expected to tear down the context when they see one.
#[derive(Error, Debug)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(String),
    /// The device lacks a capability the requested configuration needs.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[cfg(feature = "vulkan")]
    #[error(transparent)]
    Vulkan(#[from] ash::vk::Result),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
