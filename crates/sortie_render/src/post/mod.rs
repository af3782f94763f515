//! Post-processing: resolution-relative render targets, fullscreen pipelines
//! and the effect chain.

mod chain;
pub mod effects;
mod pipeline;
mod render_target;

pub use chain::PostProcessChain;
pub use effects::{BloomEffect, PostEffect, ToneMappingEffect};
pub use pipeline::{FULLSCREEN_VERTEX_SHADER, FullscreenPipelineDesc, PipelineFactory};
pub use render_target::{RenderTarget, RenderTargetPool, RtHandle, RtSpec};

use glam::UVec2;
use sortie_core::device::{NativeImage, NativeImageView};

use crate::resources::{ResourceHandle, ResourceManager};

/// An image read or written by a post-process pass.
///
/// `resource` is set for images owned by the [`ResourceManager`]; passes use
/// it to keep the image alive while the recording frame is in flight.
/// Surface images carry none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostImage {
    pub image: NativeImage,
    pub view: NativeImageView,
    pub extent: UVec2,
    pub format: wgpu::TextureFormat,
    pub resource: Option<ResourceHandle>,
}

impl PostImage {
    /// An image not tracked by the resource manager.
    #[must_use]
    pub fn external(
        image: NativeImage,
        view: NativeImageView,
        extent: UVec2,
        format: wgpu::TextureFormat,
    ) -> Self {
        Self {
            image,
            view,
            extent,
            format,
            resource: None,
        }
    }

    /// A managed image, if `handle` names a live one.
    #[must_use]
    pub fn from_resource(resources: &ResourceManager, handle: ResourceHandle) -> Option<Self> {
        let info = resources.image(handle)?;
        Some(Self {
            image: info.image,
            view: info.view,
            extent: info.desc.extent,
            format: info.desc.format,
            resource: Some(handle),
        })
    }
}
