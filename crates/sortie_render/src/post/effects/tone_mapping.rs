use bytemuck::{Pod, Zeroable};
use sortie_core::device::{DeviceResult, SamplerDesc};

use super::{EffectSetup, FormatPipelines, RenderContext, sampled_layout};
use crate::binding::DescriptorSetLayout;
use crate::post::{FullscreenPipelineDesc, PostImage};
use crate::resources::ResourceHandle;

const FRAGMENT_SHADER: &str = "shaders/post/tonemapping.frag.spv";

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ToneMappingPush {
    exposure: f32,
    gamma: f32,
}

/// HDR → display tone mapping with exposure and gamma.
///
/// Usually the last effect of a chain. One pipeline exists per format the
/// effect may write (intermediate and output); they follow format changes on
/// resize.
pub struct ToneMappingEffect {
    enabled: bool,
    exposure: f32,
    gamma: f32,
    layout: Option<DescriptorSetLayout>,
    sampler: Option<ResourceHandle>,
    pipelines: FormatPipelines,
}

impl ToneMappingEffect {
    pub const NAME: &'static str = "ToneMapping";

    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            exposure: 1.0,
            gamma: 2.2,
            layout: None,
            sampler: None,
            pipelines: FormatPipelines::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        Self::NAME
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.pipelines.is_empty()
    }

    #[must_use]
    pub fn exposure(&self) -> f32 {
        self.exposure
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        self.exposure = exposure;
    }

    #[must_use]
    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    pub fn set_gamma(&mut self, gamma: f32) {
        self.gamma = gamma;
    }

    pub(super) fn init(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        if self.layout.is_none() {
            self.layout = Some(sampled_layout(setup.device, 1)?);
        }
        if self.sampler.is_none() {
            self.sampler = setup.resources.create_sampler(&SamplerDesc::default());
        }
        self.ensure_pipeline(setup)
    }

    fn ensure_pipeline(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };
        let set_layouts = [layout.id()];
        let formats = setup.pass_formats();
        self.pipelines.sync(setup.pipelines, &formats, |factory, format| {
            factory.create_pipeline(&FullscreenPipelineDesc {
                label: "tone_mapping",
                fragment_shader: FRAGMENT_SHADER,
                set_layouts: &set_layouts,
                push_constant_size: size_of::<ToneMappingPush>() as u32,
                output_format: format,
                additive_blend: false,
            })
        })
    }

    pub(super) fn render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        input: &PostImage,
        output: &PostImage,
    ) -> bool {
        let (Some(layout), Some(sampler_handle)) = (&self.layout, self.sampler) else {
            return false;
        };
        let Some(pipeline) = self.pipelines.get(output.format) else {
            log::warn!("Tone mapping has no pipeline for {:?}", output.format);
            return false;
        };
        let Some(sampler) = ctx.resources.sampler(sampler_handle) else {
            return false;
        };
        let Some(set) = ctx.sampled_set(layout, sampler, &[input]) else {
            log::warn!("Tone mapping skipped: no binding set available");
            return false;
        };

        ctx.track(input);
        ctx.track(output);
        ctx.track_handle(sampler_handle);

        let push = ToneMappingPush {
            exposure: self.exposure,
            gamma: self.gamma,
        };
        ctx.fullscreen_pass(pipeline, set, &push, output);
        true
    }

    pub(super) fn on_resize(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        if self.layout.is_some() {
            self.ensure_pipeline(setup)?;
        }
        Ok(())
    }

    pub(super) fn shutdown(&mut self, setup: &mut EffectSetup<'_>) {
        self.pipelines.clear(setup.pipelines);
        if let Some(sampler) = self.sampler.take() {
            setup.resources.mark_delete(sampler);
        }
        self.layout = None;
    }
}

impl Default for ToneMappingEffect {
    fn default() -> Self {
        Self::new()
    }
}
