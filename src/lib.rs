//! # Sortie
//!
//! Lifetime management for GPU resources across frames in flight.
//!
//! The CPU records frame `k + 1` while the GPU still executes frame `k`.
//! Sortie makes sure nothing the GPU may still read is mutated or freed in
//! the meantime, while keeping steady-state allocation overhead near zero:
//!
//! - N rotating frame slots gated by fences ([`FrameScheduler`])
//! - reference-counted resources with deferred garbage collection
//!   ([`ResourceManager`])
//! - binding-set pools that grow on demand and cache sets by content
//!   ([`BindingSetAllocator`])
//! - render targets that keep their handle across resizes
//!   ([`RenderTargetPool`](render::post::RenderTargetPool))
//!
//! The graphics API is reached only through the [`GpuDevice`] and
//! [`PresentSurface`] traits. [`HeadlessDevice`](core::device::headless::HeadlessDevice)
//! implements both in memory.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sortie::prelude::*;
//!
//! let device = Arc::new(HeadlessDevice::new());
//! let mut renderer = FrameRenderer::new(device.clone(), device, FrameSettings::default())?;
//! renderer.add_post_effect(ToneMappingEffect::new())?;
//!
//! loop {
//!     renderer.render_frame(|ctx| {
//!         ctx.recorder.draw_fullscreen();
//!     })?;
//! }
//! ```

pub use sortie_core as core;
pub use sortie_render as render;

pub use sortie_core::{
    DeviceError, FrameSettings, GpuDevice, MAX_FRAMES_IN_FLIGHT, PresentSurface, Result,
    SortieError,
};
pub use sortie_render::{
    BindingSetAllocator, CommandRecorder, FrameContext, FrameOutcome, FrameRenderer,
    FrameScheduler, PostProcessChain, ResourceHandle, ResourceManager,
};

pub mod prelude {
    pub use glam::{UVec2, Vec2};
    pub use sortie_core::device::headless::HeadlessDevice;
    pub use sortie_core::device::{
        ImageDesc, LayoutBinding, PoolCapacity, SamplerDesc, SurfaceStatus,
    };
    pub use sortie_core::{FrameSettings, GpuDevice, PresentSurface, Result, SortieError};
    pub use sortie_render::binding::{BindingCacheKey, DescriptorSetLayout};
    pub use sortie_render::post::{
        BloomEffect, PostEffect, PostImage, PostProcessChain, RenderTargetPool, RtHandle, RtSpec,
        ToneMappingEffect,
    };
    pub use sortie_render::{
        BindingSetAllocator, CommandRecorder, FrameContext, FrameOutcome, FrameRenderer,
        FrameScheduler, ResourceHandle, ResourceManager,
    };
}
