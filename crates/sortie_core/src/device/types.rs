//! Device-side descriptors and command vocabulary.

use bitflags::bitflags;
use glam::UVec2;
use smallvec::SmallVec;

use super::handles::{
    CommandBufferId, DescriptorSetId, DescriptorSetLayoutId, NativeBuffer, NativeImage,
    NativeImageView, PipelineId, Semaphore, ShaderModuleId,
};

// ─── Memory ───────────────────────────────────────────────────────────────────

bitflags! {
    /// Properties of a device memory type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL     = 1 << 0;
        const HOST_VISIBLE     = 1 << 1;
        const HOST_COHERENT    = 1 << 2;
        const HOST_CACHED      = 1 << 3;
        const LAZILY_ALLOCATED = 1 << 4;
    }
}

/// One memory type exposed by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub properties: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// What the device needs to back a buffer or image.
///
/// `size` may exceed the size that was asked for at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Bit `i` set means memory type `i` is acceptable.
    pub memory_type_bits: u32,
}

// ─── Images & Samplers ────────────────────────────────────────────────────────

/// Creation parameters for a 2D image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub label: &'static str,
    pub extent: UVec2,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
    pub mip_level_count: u32,
    pub sample_count: u32,
}

impl ImageDesc {
    /// Single-mip, single-sample color target that can also be sampled.
    #[must_use]
    pub fn render_target(label: &'static str, extent: UVec2, format: wgpu::TextureFormat) -> Self {
        Self {
            label,
            extent,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            mip_level_count: 1,
            sample_count: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub address_mode: wgpu::AddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode: wgpu::AddressMode::ClampToEdge,
        }
    }
}

/// Image layouts the frame core transitions between.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

// ─── Commands ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

/// A single recorded command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginRendering {
        view: NativeImageView,
        extent: UVec2,
        clear: Option<[f32; 4]>,
    },
    EndRendering,
    BindPipeline(PipelineId),
    SetViewportScissor(UVec2),
    BindDescriptorSets {
        pipeline: PipelineId,
        first_set: u32,
        sets: SmallVec<[DescriptorSetId; 4]>,
    },
    PushConstants {
        pipeline: PipelineId,
        offset: u32,
        data: SmallVec<[u8; 32]>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    ImageBarrier {
        image: NativeImage,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    },
    CopyBuffer {
        src: NativeBuffer,
        dst: NativeBuffer,
        size: u64,
    },
    ExecuteSecondary(SmallVec<[CommandBufferId; 4]>),
}

/// One queue submission.
#[derive(Clone, Copy, Debug)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [CommandBufferId],
    pub wait_semaphores: &'a [Semaphore],
    pub signal_semaphores: &'a [Semaphore],
}

// ─── Pipelines ────────────────────────────────────────────────────────────────

/// A fullscreen-triangle graphics pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    pub label: &'static str,
    pub vertex: ShaderModuleId,
    pub fragment: ShaderModuleId,
    pub set_layouts: SmallVec<[DescriptorSetLayoutId; 4]>,
    pub push_constant_size: u32,
    pub color_format: wgpu::TextureFormat,
    pub additive_blend: bool,
}

// ─── Presentation ─────────────────────────────────────────────────────────────

/// Health of the presentation surface reported by acquire/present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceStatus {
    Optimal,
    /// Still usable, but should be rebuilt soon.
    Suboptimal,
    /// Unusable until rebuilt.
    OutOfDate,
}

impl SurfaceStatus {
    #[inline]
    #[must_use]
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub status: SurfaceStatus,
}

/// A presentable image owned by the surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceImage {
    pub image: NativeImage,
    pub view: NativeImageView,
}
