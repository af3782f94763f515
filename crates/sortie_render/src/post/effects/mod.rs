//! Post-Process Effects
//!
//! Effects are fullscreen passes that read one image and write another. The
//! set of effects is closed, so they are modelled as the [`PostEffect`] enum
//! rather than trait objects.
//!
//! # Lifecycle
//!
//! ```text
//! init(setup)       layouts, sampler, pipelines, internal render targets
//! render(ctx, in, out)  record passes; `false` when nothing was recorded
//! on_resize(setup)  pipelines whose output format changed are rebuilt
//! shutdown(setup)   everything above is released
//! ```
//!
//! Internal render targets are registered with the chain's
//! [`RenderTargetPool`], so they follow resizes without effect involvement.

mod bloom;
mod tone_mapping;

pub use bloom::{BLOOM_MIP_COUNT, BLOOM_MIP_SCALES, BloomEffect};
pub use tone_mapping::ToneMappingEffect;

use std::sync::Arc;

use glam::UVec2;
use smallvec::SmallVec;
use sortie_core::device::{
    DescriptorKind, DescriptorSetId, DescriptorWrite, DescriptorWrites, DeviceResult, GpuDevice,
    ImageLayout, LayoutBinding, NativeSampler, PipelineId,
};

use super::{PipelineFactory, PostImage, RenderTargetPool};
use crate::binding::{BindingCacheKey, BindingSetAllocator, DescriptorSetLayout};
use crate::frame::CommandRecorder;
use crate::resources::{ResourceHandle, ResourceManager};

/// Everything an effect needs to create or release its GPU objects.
pub struct EffectSetup<'a> {
    pub device: &'a Arc<dyn GpuDevice>,
    pub pipelines: &'a mut PipelineFactory,
    pub targets: &'a mut RenderTargetPool,
    pub resources: &'a mut ResourceManager,
    /// Format of the chain's final output.
    pub output_format: wgpu::TextureFormat,
    /// Format of the ping/pong images between effects.
    pub intermediate_format: wgpu::TextureFormat,
    /// Format of effect-internal HDR targets.
    pub hdr_format: wgpu::TextureFormat,
}

impl EffectSetup<'_> {
    /// Formats an effect's final pass may write to.
    #[must_use]
    pub fn pass_formats(&self) -> SmallVec<[wgpu::TextureFormat; 2]> {
        let mut formats = SmallVec::new();
        formats.push(self.intermediate_format);
        if self.output_format != self.intermediate_format {
            formats.push(self.output_format);
        }
        formats
    }
}

/// Per-frame recording context.
pub struct RenderContext<'a> {
    pub recorder: &'a mut CommandRecorder,
    pub bindings: &'a mut BindingSetAllocator,
    pub resources: &'a mut ResourceManager,
    pub targets: &'a RenderTargetPool,
}

impl RenderContext<'_> {
    /// Keeps `image` alive until the recording frame retires.
    pub fn track(&mut self, image: &PostImage) {
        if let Some(handle) = image.resource {
            self.recorder.use_resource(self.resources, handle);
        }
    }

    pub fn track_handle(&mut self, handle: ResourceHandle) {
        self.recorder.use_resource(self.resources, handle);
    }

    /// A binding set sampling `inputs` in binding order, cached by content.
    pub fn sampled_set(
        &mut self,
        layout: &DescriptorSetLayout,
        sampler: NativeSampler,
        inputs: &[&PostImage],
    ) -> Option<DescriptorSetId> {
        let key = inputs
            .iter()
            .fold(BindingCacheKey::builder(layout).sampler(sampler), |key, input| {
                key.image(input.view)
            })
            .build();

        let allocated = self.bindings.allocate_descriptor_set(layout, Some(key))?;
        if allocated.fresh {
            let writes: DescriptorWrites = inputs
                .iter()
                .enumerate()
                .map(|(binding, input)| DescriptorWrite::CombinedImageSampler {
                    binding: binding as u32,
                    view: input.view,
                    sampler,
                })
                .collect();
            self.bindings.update_descriptor_set(allocated.set, &writes);
        }
        Some(allocated.set)
    }

    /// Records one fullscreen-triangle pass into `target`.
    pub fn fullscreen_pass<T: bytemuck::Pod>(
        &mut self,
        pipeline: PipelineId,
        set: DescriptorSetId,
        push: &T,
        target: &PostImage,
    ) {
        let rec = &mut *self.recorder;
        rec.begin_rendering(target.view, target.extent, Some([0.0; 4]));
        rec.set_viewport_scissor(target.extent);
        rec.bind_pipeline(pipeline);
        rec.bind_descriptor_sets(pipeline, 0, &[set]);
        rec.push_constants(pipeline, 0, push);
        rec.draw_fullscreen();
        rec.end_rendering();
    }

    /// Like [`Self::fullscreen_pass`], bracketed by the attachment and
    /// shader-read transitions of `target`.
    pub fn fullscreen_pass_to_texture<T: bytemuck::Pod>(
        &mut self,
        pipeline: PipelineId,
        set: DescriptorSetId,
        push: &T,
        target: &PostImage,
    ) {
        self.recorder
            .image_barrier(target.image, ImageLayout::Undefined, ImageLayout::ColorAttachment);
        self.fullscreen_pass(pipeline, set, push, target);
        self.recorder.image_barrier(
            target.image,
            ImageLayout::ColorAttachment,
            ImageLayout::ShaderReadOnly,
        );
    }
}

/// Fragment-stage layout sampling `count` combined image samplers at
/// bindings `0..count`.
pub(crate) fn sampled_layout(
    device: &Arc<dyn GpuDevice>,
    count: u32,
) -> DeviceResult<DescriptorSetLayout> {
    let bindings: Vec<LayoutBinding> = (0..count)
        .map(|binding| {
            LayoutBinding::new(
                binding,
                DescriptorKind::CombinedImageSampler,
                wgpu::ShaderStages::FRAGMENT,
            )
        })
        .collect();
    DescriptorSetLayout::new(Arc::clone(device), &bindings)
}

/// Pipelines of one pass keyed by the format they write.
#[derive(Debug, Default)]
pub(crate) struct FormatPipelines(SmallVec<[(wgpu::TextureFormat, PipelineId); 2]>);

impl FormatPipelines {
    pub(crate) fn get(&self, format: wgpu::TextureFormat) -> Option<PipelineId> {
        self.0.iter().find(|(f, _)| *f == format).map(|&(_, p)| p)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keeps exactly one pipeline per format in `formats`, building the
    /// missing ones with `build` and destroying the rest.
    pub(crate) fn sync(
        &mut self,
        pipelines: &mut PipelineFactory,
        formats: &[wgpu::TextureFormat],
        mut build: impl FnMut(&mut PipelineFactory, wgpu::TextureFormat) -> DeviceResult<PipelineId>,
    ) -> DeviceResult<()> {
        self.0.retain(|(format, pipeline)| {
            let keep = formats.contains(format);
            if !keep {
                pipelines.destroy_pipeline(*pipeline);
            }
            keep
        });
        for &format in formats {
            if self.get(format).is_none() {
                let pipeline = build(pipelines, format)?;
                self.0.push((format, pipeline));
            }
        }
        Ok(())
    }

    pub(crate) fn clear(&mut self, pipelines: &mut PipelineFactory) {
        for (_, pipeline) in self.0.drain(..) {
            pipelines.destroy_pipeline(pipeline);
        }
    }
}

#[inline]
pub(crate) fn texel_size(extent: UVec2) -> [f32; 2] {
    [1.0 / extent.x.max(1) as f32, 1.0 / extent.y.max(1) as f32]
}

// ============================================================================
// PostEffect
// ============================================================================

pub enum PostEffect {
    ToneMapping(ToneMappingEffect),
    Bloom(BloomEffect),
}

impl PostEffect {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ToneMapping(e) => e.name(),
            Self::Bloom(e) => e.name(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::ToneMapping(e) => e.is_enabled(),
            Self::Bloom(e) => e.is_enabled(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        match self {
            Self::ToneMapping(e) => e.set_enabled(enabled),
            Self::Bloom(e) => e.set_enabled(enabled),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        match self {
            Self::ToneMapping(e) => e.is_initialized(),
            Self::Bloom(e) => e.is_initialized(),
        }
    }

    pub fn init(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        match self {
            Self::ToneMapping(e) => e.init(setup),
            Self::Bloom(e) => e.init(setup),
        }
    }

    /// Records the effect from `input` into `output`.
    ///
    /// Returns `false` when the effect recorded nothing (uninitialized or a
    /// binding set could not be allocated).
    pub fn render(&mut self, ctx: &mut RenderContext<'_>, input: &PostImage, output: &PostImage) -> bool {
        match self {
            Self::ToneMapping(e) => e.render(ctx, input, output),
            Self::Bloom(e) => e.render(ctx, input, output),
        }
    }

    pub fn on_resize(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        match self {
            Self::ToneMapping(e) => e.on_resize(setup),
            Self::Bloom(e) => e.on_resize(setup),
        }
    }

    pub fn shutdown(&mut self, setup: &mut EffectSetup<'_>) {
        match self {
            Self::ToneMapping(e) => e.shutdown(setup),
            Self::Bloom(e) => e.shutdown(setup),
        }
    }

    #[must_use]
    pub fn as_tone_mapping(&self) -> Option<&ToneMappingEffect> {
        match self {
            Self::ToneMapping(e) => Some(e),
            Self::Bloom(_) => None,
        }
    }

    pub fn as_tone_mapping_mut(&mut self) -> Option<&mut ToneMappingEffect> {
        match self {
            Self::ToneMapping(e) => Some(e),
            Self::Bloom(_) => None,
        }
    }

    #[must_use]
    pub fn as_bloom(&self) -> Option<&BloomEffect> {
        match self {
            Self::Bloom(e) => Some(e),
            Self::ToneMapping(_) => None,
        }
    }

    pub fn as_bloom_mut(&mut self) -> Option<&mut BloomEffect> {
        match self {
            Self::Bloom(e) => Some(e),
            Self::ToneMapping(_) => None,
        }
    }
}

impl From<ToneMappingEffect> for PostEffect {
    fn from(effect: ToneMappingEffect) -> Self {
        Self::ToneMapping(effect)
    }
}

impl From<BloomEffect> for PostEffect {
    fn from(effect: BloomEffect) -> Self {
        Self::Bloom(effect)
    }
}

impl std::fmt::Debug for PostEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostEffect")
            .field("name", &self.name())
            .field("enabled", &self.is_enabled())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
