//! Device & Surface Interfaces
//!
//! The frame core never talks to a graphics API directly. Everything it needs
//! from the GPU goes through [`GpuDevice`], and everything it needs from the
//! windowing side goes through [`PresentSurface`].
//!
//! # Design
//!
//! - All methods take `&self`. Implementations synchronize internally, which
//!   lets one `Arc<dyn GpuDevice>` be shared by every component.
//! - Handles are plain `u64` newtypes ([`handles`]); `0` is the null handle.
//! - Destroy/free calls are infallible, mirroring native APIs.
//! - Surface health (`Suboptimal`, `OutOfDate`) is a status, not an error.
//!
//! [`headless::HeadlessDevice`] implements both traits in memory and is what
//! the tests and the soak demo run against.

mod descriptor;
mod handles;
pub mod headless;
mod types;

use std::ptr::NonNull;
use std::time::Duration;

use glam::UVec2;
use thiserror::Error;

pub use descriptor::{
    DescriptorCounts, DescriptorKind, DescriptorWrite, DescriptorWrites, LayoutBinding,
    PoolCapacity, aggregate_requirement,
};
pub use handles::{
    CommandBufferId, DescriptorPoolId, DescriptorSetId, DescriptorSetLayoutId, DeviceMemory, Fence,
    NativeBuffer, NativeImage, NativeImageView, NativeSampler, PipelineId, Semaphore,
    ShaderModuleId,
};
pub use types::{
    AcquiredImage, Command, CommandBufferLevel, GraphicsPipelineDesc, ImageDesc, ImageLayout,
    MemoryPropertyFlags, MemoryRequirements, MemoryType, SamplerDesc, SubmitInfo, SurfaceImage,
    SurfaceStatus,
};

/// Failure reported by a device or surface call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("no memory type satisfies the requested properties")]
    NoCompatibleMemoryType,

    #[error("invalid {kind} handle: {id:#x}")]
    InvalidHandle { kind: &'static str, id: u64 },

    /// The pool cannot satisfy the allocation (out of pool memory or fragmented).
    #[error("descriptor pool exhausted or fragmented")]
    FragmentedPool,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// The graphics device as seen by the frame core.
pub trait GpuDevice: Send + Sync {
    // ─── Memory ─────────────────────────────────────────────────────────────

    /// Memory types in device order; bit `i` of
    /// [`MemoryRequirements::memory_type_bits`] refers to entry `i`.
    fn memory_types(&self) -> &[MemoryType];

    /// First memory type allowed by `requirements` that has every flag in `flags`.
    fn memory_type_for(
        &self,
        requirements: &MemoryRequirements,
        flags: MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_types()
            .iter()
            .enumerate()
            .find(|(i, ty)| {
                *i < 32
                    && requirements.memory_type_bits & (1u32 << i) != 0
                    && ty.properties.contains(flags)
            })
            .map(|(i, _)| i as u32)
    }

    fn allocate_memory(&self, size: u64, memory_type: u32) -> DeviceResult<DeviceMemory>;
    fn free_memory(&self, memory: DeviceMemory);

    /// Maps `size` bytes starting at `offset`. The pointer stays valid until
    /// [`Self::unmap_memory`] or [`Self::free_memory`].
    fn map_memory(&self, memory: DeviceMemory, offset: u64, size: u64) -> DeviceResult<NonNull<u8>>;
    fn unmap_memory(&self, memory: DeviceMemory);
    fn flush_memory(&self, memory: DeviceMemory, offset: u64, size: u64) -> DeviceResult<()>;

    // ─── Buffers ────────────────────────────────────────────────────────────

    fn create_buffer(&self, size: u64, usage: wgpu::BufferUsages) -> DeviceResult<NativeBuffer>;
    fn buffer_memory_requirements(&self, buffer: NativeBuffer) -> DeviceResult<MemoryRequirements>;
    fn bind_buffer_memory(
        &self,
        buffer: NativeBuffer,
        memory: DeviceMemory,
        offset: u64,
    ) -> DeviceResult<()>;
    fn destroy_buffer(&self, buffer: NativeBuffer);

    // ─── Images ─────────────────────────────────────────────────────────────

    fn create_image(&self, desc: &ImageDesc) -> DeviceResult<NativeImage>;
    fn image_memory_requirements(&self, image: NativeImage) -> DeviceResult<MemoryRequirements>;
    fn bind_image_memory(
        &self,
        image: NativeImage,
        memory: DeviceMemory,
        offset: u64,
    ) -> DeviceResult<()>;
    fn create_image_view(
        &self,
        image: NativeImage,
        format: wgpu::TextureFormat,
    ) -> DeviceResult<NativeImageView>;
    fn destroy_image_view(&self, view: NativeImageView);
    fn destroy_image(&self, image: NativeImage);

    fn create_sampler(&self, desc: &SamplerDesc) -> DeviceResult<NativeSampler>;
    fn destroy_sampler(&self, sampler: NativeSampler);

    // ─── Synchronization ────────────────────────────────────────────────────

    fn create_fence(&self, signaled: bool) -> DeviceResult<Fence>;
    /// Blocks until `fence` signals. `None` waits without bound.
    fn wait_fence(&self, fence: Fence, timeout: Option<Duration>) -> DeviceResult<()>;
    fn reset_fence(&self, fence: Fence) -> DeviceResult<()>;
    fn destroy_fence(&self, fence: Fence);

    fn create_semaphore(&self) -> DeviceResult<Semaphore>;
    fn destroy_semaphore(&self, semaphore: Semaphore);

    // ─── Command Buffers ────────────────────────────────────────────────────

    fn allocate_command_buffer(&self, level: CommandBufferLevel) -> DeviceResult<CommandBufferId>;
    fn begin_command_buffer(&self, cmd: CommandBufferId) -> DeviceResult<()>;
    fn end_command_buffer(&self, cmd: CommandBufferId) -> DeviceResult<()>;
    fn reset_command_buffer(&self, cmd: CommandBufferId) -> DeviceResult<()>;
    fn record(&self, cmd: CommandBufferId, command: Command);
    fn free_command_buffer(&self, cmd: CommandBufferId);

    /// Submits to the graphics queue; `fence` signals when the GPU is done.
    fn submit(&self, info: &SubmitInfo<'_>, fence: Fence) -> DeviceResult<()>;

    // ─── Descriptors ────────────────────────────────────────────────────────

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> DeviceResult<DescriptorSetLayoutId>;
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutId);

    fn create_descriptor_pool(&self, capacity: &PoolCapacity) -> DeviceResult<DescriptorPoolId>;
    /// Returns every set allocated from `pool` back to it.
    fn reset_descriptor_pool(&self, pool: DescriptorPoolId) -> DeviceResult<()>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolId);

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
    ) -> DeviceResult<DescriptorSetId>;
    fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite]);

    // ─── Shaders & Pipelines ────────────────────────────────────────────────

    /// Loads a precompiled shader binary by path.
    fn load_shader_binary(&self, path: &str) -> DeviceResult<ShaderModuleId>;
    fn destroy_shader_module(&self, module: ShaderModuleId);

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> DeviceResult<PipelineId>;
    fn destroy_pipeline(&self, pipeline: PipelineId);

    fn wait_idle(&self) -> DeviceResult<()>;
}

/// The presentation engine (swapchain) as seen by the frame core.
pub trait PresentSurface: Send + Sync {
    /// Acquires the next presentable image; `signal` fires when it is ready.
    ///
    /// An `OutOfDate` result carries no usable image and does not signal.
    fn acquire_next_image(
        &self,
        timeout: Option<Duration>,
        signal: Semaphore,
    ) -> DeviceResult<AcquiredImage>;

    /// Queues image `index` for presentation once `wait` signals.
    fn present_image(&self, index: u32, wait: Semaphore) -> DeviceResult<SurfaceStatus>;

    fn image(&self, index: u32) -> Option<SurfaceImage>;
    fn image_count(&self) -> u32;
    fn extent(&self) -> UVec2;
    fn format(&self) -> wgpu::TextureFormat;

    /// Recreates the swapchain at `extent` and returns the extent actually used.
    fn rebuild(&self, extent: UVec2) -> DeviceResult<UVec2>;
}
