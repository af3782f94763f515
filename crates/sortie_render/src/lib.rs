//! # Sortie Render
//!
//! The frame pipeline built on [`sortie_core`]:
//!
//! - [`resources`]: reference-counted GPU resources with deferred destruction
//! - [`binding`]: binding-set allocation from growable pool blocks with a
//!   content-keyed cache
//! - [`frame`]: command recorders, frame slots and the N-buffered
//!   [`FrameScheduler`]
//! - [`post`]: resolution-relative render targets and the post-process chain
//! - [`renderer`]: the top-level [`FrameRenderer`] loop
//!
//! # Lifetimes
//!
//! A resource referenced by a recording stays alive until the frame that
//! submitted the recording retires, even after [`ResourceManager::mark_delete`].
//! Binding sets live for one pool epoch, which ends when the owning slot's
//! fence signals.

pub mod binding;
pub mod frame;
pub mod post;
pub mod renderer;
pub mod resources;

pub use binding::{AllocatedSet, BindingCacheKey, BindingSetAllocator, DescriptorSetLayout};
pub use frame::{CommandRecorder, FrameScheduler, FrameSlot, RecorderId, SlotState};
pub use post::{
    BloomEffect, PostEffect, PostImage, PostProcessChain, RenderTargetPool, RtHandle, RtSpec,
    ToneMappingEffect,
};
pub use renderer::{FrameContext, FrameOutcome, FrameRenderer, RendererStatistics};
pub use resources::{ResourceHandle, ResourceManager, SharedResourceManager};
