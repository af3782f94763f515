//! Dual-Kawase Bloom
//!
//! # Algorithm
//!
//! ```text
//! input ──threshold──► down[0] ─► down[1] ─► down[2] ─► down[3] ─► down[4]
//!                                                                   │
//!            up[0] ◄──── up[1] ◄──── up[2] ◄──── up[3] ◄────────────┘
//!              │      (each up[i] blends the coarser level with down[i])
//!              ▼
//! composite(up[0], input) ──► output
//! ```
//!
//! 1. **Threshold**: bright-pass with a soft knee into the half-resolution mip.
//! 2. **Downsample**: Kawase filter, halving resolution at each level.
//! 3. **Upsample**: from the coarsest level back up; each step mixes the
//!    coarser result with the matching downsample level by `blend_factor`.
//! 4. **Composite**: adds `intensity × up[0]` to the input.
//!
//! All mip levels are render targets of the chain's pool, so they are
//! rebuilt on resize without involvement from the effect.

use bytemuck::{Pod, Zeroable};
use sortie_core::device::{DescriptorSetLayoutId, DeviceResult, PipelineId, SamplerDesc};

use super::{EffectSetup, FormatPipelines, RenderContext, sampled_layout, texel_size};
use crate::binding::DescriptorSetLayout;
use crate::post::{FullscreenPipelineDesc, PostImage, RtHandle, RtSpec};
use crate::resources::ResourceHandle;

/// Number of downsample levels.
pub const BLOOM_MIP_COUNT: usize = 5;

/// Scale of each downsample level relative to the base resolution. The
/// upsample levels reuse the first `BLOOM_MIP_COUNT - 1` scales.
pub const BLOOM_MIP_SCALES: [f32; BLOOM_MIP_COUNT] = [0.5, 0.25, 0.125, 0.0625, 0.03125];

const THRESHOLD_SHADER: &str = "shaders/post/bloom_threshold.frag.spv";
const DOWNSAMPLE_SHADER: &str = "shaders/post/bloom_kawase_down.frag.spv";
const UPSAMPLE_SHADER: &str = "shaders/post/bloom_kawase_up.frag.spv";
const COMPOSITE_SHADER: &str = "shaders/post/bloom_composite.frag.spv";

// ============================================================================
// Push constants
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ThresholdPush {
    threshold: f32,
    soft_knee: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct DownsamplePush {
    texel_size: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct UpsamplePush {
    /// Texel size of the coarser level.
    texel_size: [f32; 2],
    blend_factor: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct CompositePush {
    intensity: f32,
}

// ============================================================================
// BloomEffect
// ============================================================================

#[derive(Default)]
struct BloomPipelines {
    threshold: Option<PipelineId>,
    downsample: Option<PipelineId>,
    upsample: Option<PipelineId>,
    /// Writes the effect output, so it exists per pass format.
    composite: FormatPipelines,
}

pub struct BloomEffect {
    enabled: bool,
    threshold: f32,
    soft_knee: f32,
    intensity: f32,
    blend_factor: f32,

    // === GPU objects (created in init) ===
    single_layout: Option<DescriptorSetLayout>,
    dual_layout: Option<DescriptorSetLayout>,
    sampler: Option<ResourceHandle>,
    pipelines: BloomPipelines,
    down_mips: Vec<RtHandle>,
    up_mips: Vec<RtHandle>,
}

impl BloomEffect {
    pub const NAME: &'static str = "Bloom";

    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            threshold: 1.0,
            soft_knee: 0.5,
            intensity: 0.5,
            blend_factor: 0.7,
            single_layout: None,
            dual_layout: None,
            sampler: None,
            pipelines: BloomPipelines::default(),
            down_mips: Vec::new(),
            up_mips: Vec::new(),
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
        self.pipelines.threshold.is_some()
    }

    // === Parameters ===

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    #[must_use]
    pub fn soft_knee(&self) -> f32 {
        self.soft_knee
    }

    pub fn set_soft_knee(&mut self, soft_knee: f32) {
        self.soft_knee = soft_knee;
    }

    #[must_use]
    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn set_intensity(&mut self, intensity: f32) {
        self.intensity = intensity;
    }

    #[must_use]
    pub fn blend_factor(&self) -> f32 {
        self.blend_factor
    }

    pub fn set_blend_factor(&mut self, blend_factor: f32) {
        self.blend_factor = blend_factor;
    }

    /// Handles of the downsample levels, finest first.
    #[must_use]
    pub fn down_mips(&self) -> &[RtHandle] {
        &self.down_mips
    }

    /// Handles of the upsample levels, finest first.
    #[must_use]
    pub fn up_mips(&self) -> &[RtHandle] {
        &self.up_mips
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub(super) fn init(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        if self.single_layout.is_none() {
            self.single_layout = Some(sampled_layout(setup.device, 1)?);
        }
        if self.dual_layout.is_none() {
            self.dual_layout = Some(sampled_layout(setup.device, 2)?);
        }
        if self.sampler.is_none() {
            self.sampler = setup.resources.create_sampler(&SamplerDesc::default());
        }

        if self.down_mips.is_empty() {
            for (level, &scale) in BLOOM_MIP_SCALES.iter().enumerate() {
                let down = setup
                    .targets
                    .register_rt(RtSpec::new(scale, setup.hdr_format).with_label("bloom_down"));
                self.down_mips.push(down);
                if level + 1 < BLOOM_MIP_COUNT {
                    let up = setup
                        .targets
                        .register_rt(RtSpec::new(scale, setup.hdr_format).with_label("bloom_up"));
                    self.up_mips.push(up);
                }
            }
        }

        self.create_pipelines(setup)
    }

    fn create_pipelines(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        let (Some(single), Some(dual)) = (&self.single_layout, &self.dual_layout) else {
            return Ok(());
        };
        let single = [single.id()];
        let dual = [dual.id()];
        let hdr = setup.hdr_format;

        if self.pipelines.threshold.is_none() {
            let desc = hdr_pass("bloom_threshold", THRESHOLD_SHADER, &single, size_of::<ThresholdPush>(), hdr);
            self.pipelines.threshold = Some(setup.pipelines.create_pipeline(&desc)?);
        }
        if self.pipelines.downsample.is_none() {
            let desc = hdr_pass("bloom_downsample", DOWNSAMPLE_SHADER, &single, size_of::<DownsamplePush>(), hdr);
            self.pipelines.downsample = Some(setup.pipelines.create_pipeline(&desc)?);
        }
        if self.pipelines.upsample.is_none() {
            let desc = hdr_pass("bloom_upsample", UPSAMPLE_SHADER, &dual, size_of::<UpsamplePush>(), hdr);
            self.pipelines.upsample = Some(setup.pipelines.create_pipeline(&desc)?);
        }

        let formats = setup.pass_formats();
        self.pipelines.composite.sync(setup.pipelines, &formats, |factory, format| {
            factory.create_pipeline(&hdr_pass(
                "bloom_composite",
                COMPOSITE_SHADER,
                &dual,
                size_of::<CompositePush>(),
                format,
            ))
        })
    }

    pub(super) fn render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        input: &PostImage,
        output: &PostImage,
    ) -> bool {
        let (
            Some(single),
            Some(dual),
            Some(sampler_handle),
            Some(threshold_pipeline),
            Some(down_pipeline),
            Some(up_pipeline),
        ) = (
            &self.single_layout,
            &self.dual_layout,
            self.sampler,
            self.pipelines.threshold,
            self.pipelines.downsample,
            self.pipelines.upsample,
        )
        else {
            return false;
        };
        let Some(composite_pipeline) = self.pipelines.composite.get(output.format) else {
            log::warn!("Bloom has no composite pipeline for {:?}", output.format);
            return false;
        };
        let Some(sampler) = ctx.resources.sampler(sampler_handle) else {
            return false;
        };

        let down: Option<Vec<PostImage>> =
            self.down_mips.iter().map(|&h| ctx.targets.post_image(h)).collect();
        let up: Option<Vec<PostImage>> =
            self.up_mips.iter().map(|&h| ctx.targets.post_image(h)).collect();
        let (Some(down), Some(up)) = (down, up) else {
            log::warn!("Bloom skipped: mip targets are not built");
            return false;
        };

        ctx.track(input);
        ctx.track(output);
        ctx.track_handle(sampler_handle);
        for mip in down.iter().chain(&up) {
            ctx.track(mip);
        }

        // 1. Threshold: input → down[0]
        let Some(set) = ctx.sampled_set(single, sampler, &[input]) else {
            return Self::out_of_sets();
        };
        let push = ThresholdPush {
            threshold: self.threshold,
            soft_knee: self.soft_knee,
        };
        ctx.fullscreen_pass_to_texture(threshold_pipeline, set, &push, &down[0]);

        // 2. Downsample: down[i - 1] → down[i]
        for level in 1..down.len() {
            let src = &down[level - 1];
            let Some(set) = ctx.sampled_set(single, sampler, &[src]) else {
                return Self::out_of_sets();
            };
            let push = DownsamplePush {
                texel_size: texel_size(src.extent),
            };
            ctx.fullscreen_pass_to_texture(down_pipeline, set, &push, &down[level]);
        }

        // 3. Upsample: (coarser, down[i]) → up[i], coarsest first
        let mut coarser = down[down.len() - 1];
        for level in (0..up.len()).rev() {
            let Some(set) = ctx.sampled_set(dual, sampler, &[&coarser, &down[level]]) else {
                return Self::out_of_sets();
            };
            let push = UpsamplePush {
                texel_size: texel_size(coarser.extent),
                blend_factor: self.blend_factor,
            };
            ctx.fullscreen_pass_to_texture(up_pipeline, set, &push, &up[level]);
            coarser = up[level];
        }

        // 4. Composite: (up[0], input) → output
        let Some(set) = ctx.sampled_set(dual, sampler, &[&up[0], input]) else {
            return Self::out_of_sets();
        };
        let push = CompositePush {
            intensity: self.intensity,
        };
        ctx.fullscreen_pass(composite_pipeline, set, &push, output);
        true
    }

    fn out_of_sets() -> bool {
        log::warn!("Bloom aborted: no binding set available");
        false
    }

    /// Mip targets follow the pool; only the composite pipelines may need a
    /// new output format.
    pub(super) fn on_resize(&mut self, setup: &mut EffectSetup<'_>) -> DeviceResult<()> {
        if self.is_initialized() {
            self.create_pipelines(setup)?;
        }
        Ok(())
    }

    pub(super) fn shutdown(&mut self, setup: &mut EffectSetup<'_>) {
        let pipelines = std::mem::take(&mut self.pipelines);
        for pipeline in [pipelines.threshold, pipelines.downsample, pipelines.upsample]
            .into_iter()
            .flatten()
        {
            setup.pipelines.destroy_pipeline(pipeline);
        }
        let mut composite = pipelines.composite;
        composite.clear(setup.pipelines);

        for handle in self.down_mips.drain(..).chain(self.up_mips.drain(..)) {
            setup.targets.unregister(handle, setup.resources);
        }
        if let Some(sampler) = self.sampler.take() {
            setup.resources.mark_delete(sampler);
        }
        self.single_layout = None;
        self.dual_layout = None;
    }
}

fn hdr_pass<'a>(
    label: &'static str,
    fragment_shader: &'a str,
    set_layouts: &'a [DescriptorSetLayoutId],
    push_constant_size: usize,
    output_format: wgpu::TextureFormat,
) -> FullscreenPipelineDesc<'a> {
    FullscreenPipelineDesc {
        label,
        fragment_shader,
        set_layouts,
        push_constant_size: push_constant_size as u32,
        output_format,
        additive_blend: false,
    }
}

impl Default for BloomEffect {
    fn default() -> Self {
        Self::new()
    }
}
