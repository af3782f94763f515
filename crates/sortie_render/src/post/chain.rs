//! Post-Process Chain
//!
//! Runs the enabled effects in order, ping-ponging between two full-size
//! intermediate targets:
//!
//! ```text
//!   effects:  [A]        [B]         [C]
//!   input ──► A ──► ping ──► B ──► pong ──► C ──► output
//! ```
//!
//! The last enabled effect always writes the chain output. With a single
//! enabled effect it goes straight from input to output; with none the chain
//! records nothing.
//!
//! An effect that records nothing leaves the current image in place, so the
//! next effect writes whichever intermediate target it is not sampling.

use std::sync::Arc;

use glam::UVec2;
use sortie_core::device::{DeviceResult, GpuDevice, ImageLayout};
use sortie_core::errors::Result;
use sortie_core::settings::FrameSettings;

use super::effects::{EffectSetup, PostEffect, RenderContext};
use super::{PipelineFactory, PostImage, RenderTargetPool, RtHandle, RtSpec};
use crate::binding::BindingSetAllocator;
use crate::frame::CommandRecorder;
use crate::resources::ResourceManager;

pub struct PostProcessChain {
    device: Arc<dyn GpuDevice>,
    pipelines: PipelineFactory,
    targets: RenderTargetPool,
    effects: Vec<PostEffect>,

    ping: Option<RtHandle>,
    pong: Option<RtHandle>,

    extent: UVec2,
    output_format: wgpu::TextureFormat,
    intermediate_format: wgpu::TextureFormat,
    hdr_format: wgpu::TextureFormat,
    is_initialized: bool,
}

/// Builds an [`EffectSetup`] from disjoint chain fields so the effect list
/// can stay mutably borrowed.
macro_rules! effect_setup {
    ($chain:ident, $resources:expr) => {
        EffectSetup {
            device: &$chain.device,
            pipelines: &mut $chain.pipelines,
            targets: &mut $chain.targets,
            resources: &mut *$resources,
            output_format: $chain.output_format,
            intermediate_format: $chain.intermediate_format,
            hdr_format: $chain.hdr_format,
        }
    };
}

impl PostProcessChain {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>, settings: &FrameSettings) -> Self {
        Self {
            pipelines: PipelineFactory::new(Arc::clone(&device)),
            device,
            targets: RenderTargetPool::new(),
            effects: Vec::new(),
            ping: None,
            pong: None,
            extent: UVec2::ZERO,
            output_format: settings.default_render_target_format,
            intermediate_format: settings.default_render_target_format,
            hdr_format: settings.hdr_format,
            is_initialized: false,
        }
    }

    /// Registers the ping/pong targets, builds the pool at `extent` and
    /// initializes every effect added so far.
    ///
    /// An effect that fails to initialize stays in the chain and is skipped
    /// at execution time; the first such error is returned.
    pub fn init(
        &mut self,
        extent: UVec2,
        output_format: wgpu::TextureFormat,
        resources: &mut ResourceManager,
    ) -> Result<()> {
        self.extent = extent;
        self.output_format = output_format;

        if self.ping.is_none() {
            let spec = RtSpec::new(1.0, self.intermediate_format);
            self.ping = Some(self.targets.register_rt(spec.with_label("post_ping")));
            self.pong = Some(self.targets.register_rt(spec.with_label("post_pong")));
        }

        let mut first_error = None;
        for effect in &mut self.effects {
            let mut setup = effect_setup!(self, resources);
            if let Err(e) = effect.init(&mut setup) {
                log::error!("Post effect '{}' failed to initialize: {e}", effect.name());
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        self.targets.build(extent, resources);
        self.is_initialized = true;

        log::info!(
            "Post-process chain ready: {} effects, {}x{} {:?}",
            self.effects.len(),
            extent.x,
            extent.y,
            output_format
        );
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Effect management
    // ========================================================================

    /// Appends an effect, initializing it when the chain already is.
    ///
    /// Returns the effect's index.
    pub fn add_effect(
        &mut self,
        effect: impl Into<PostEffect>,
        resources: &mut ResourceManager,
    ) -> Result<usize> {
        let index = self.effects.len();
        self.insert_effect(index, effect, resources)?;
        Ok(index)
    }

    /// Inserts an effect at `index` (clamped to the chain length).
    pub fn insert_effect(
        &mut self,
        index: usize,
        effect: impl Into<PostEffect>,
        resources: &mut ResourceManager,
    ) -> Result<()> {
        let mut effect = effect.into();
        let index = index.min(self.effects.len());

        if self.is_initialized {
            let mut setup = effect_setup!(self, resources);
            let result = effect.init(&mut setup);
            self.targets.build(self.extent, resources);
            self.effects.insert(index, effect);
            result?;
        } else {
            self.effects.insert(index, effect);
        }
        Ok(())
    }

    /// Removes the first effect named `name` and releases its GPU objects.
    pub fn remove_effect(&mut self, name: &str, resources: &mut ResourceManager) -> Option<PostEffect> {
        let index = self.effects.iter().position(|e| e.name() == name)?;
        self.remove_effect_at(index, resources)
    }

    pub fn remove_effect_at(
        &mut self,
        index: usize,
        resources: &mut ResourceManager,
    ) -> Option<PostEffect> {
        if index >= self.effects.len() {
            return None;
        }
        let mut effect = self.effects.remove(index);
        let mut setup = effect_setup!(self, resources);
        effect.shutdown(&mut setup);
        Some(effect)
    }

    #[must_use]
    pub fn effect(&self, name: &str) -> Option<&PostEffect> {
        self.effects.iter().find(|e| e.name() == name)
    }

    pub fn effect_mut(&mut self, name: &str) -> Option<&mut PostEffect> {
        self.effects.iter_mut().find(|e| e.name() == name)
    }

    #[must_use]
    pub fn effects(&self) -> &[PostEffect] {
        &self.effects
    }

    #[must_use]
    pub fn has_enabled_effects(&self) -> bool {
        self.effects.iter().any(PostEffect::is_enabled)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Records every enabled effect from `input` to `output`.
    ///
    /// Returns how many effects recorded work.
    pub fn execute(
        &mut self,
        recorder: &mut CommandRecorder,
        bindings: &mut BindingSetAllocator,
        resources: &mut ResourceManager,
        input: &PostImage,
        output: &PostImage,
    ) -> usize {
        let enabled: Vec<usize> = self
            .effects
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_enabled())
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            return 0;
        }

        let ping = self.ping.and_then(|h| self.targets.post_image(h));
        let pong = self.pong.and_then(|h| self.targets.post_image(h));

        let mut ctx = RenderContext {
            recorder,
            bindings,
            resources,
            targets: &self.targets,
        };

        let mut rendered = 0;
        let mut current = *input;
        let last = enabled.len() - 1;

        for (step, &index) in enabled.iter().enumerate() {
            let effect = &mut self.effects[index];

            if step == last {
                rendered += usize::from(effect.render(&mut ctx, &current, output));
                break;
            }

            let target = match (ping, pong) {
                (Some(ping), Some(pong)) => Some(if current.image == ping.image { pong } else { ping }),
                _ => None,
            };
            let Some(target) = target else {
                log::warn!("Post chain intermediate targets are missing; skipping '{}'", effect.name());
                continue;
            };

            ctx.recorder
                .image_barrier(target.image, ImageLayout::Undefined, ImageLayout::ColorAttachment);
            let ok = effect.render(&mut ctx, &current, &target);
            ctx.recorder.image_barrier(
                target.image,
                ImageLayout::ColorAttachment,
                ImageLayout::ShaderReadOnly,
            );
            if ok {
                rendered += 1;
                current = target;
            }
        }
        rendered
    }

    // ========================================================================
    // Resize & shutdown
    // ========================================================================

    /// Rebuilds every render target at `extent` and lets effects follow a
    /// changed output format.
    pub fn on_resize(
        &mut self,
        extent: UVec2,
        output_format: wgpu::TextureFormat,
        resources: &mut ResourceManager,
    ) -> Result<()> {
        self.extent = extent;
        self.output_format = output_format;
        if !self.is_initialized {
            return Ok(());
        }
        self.targets.rebuild(extent, resources);

        let mut result: DeviceResult<()> = Ok(());
        for effect in &mut self.effects {
            let mut setup = effect_setup!(self, resources);
            if let Err(e) = effect.on_resize(&mut setup) {
                log::error!("Post effect '{}' failed to resize: {e}", effect.name());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result.map_err(Into::into)
    }

    /// Shuts down every effect and releases all targets and pipelines.
    ///
    /// Target images are only marked for deletion; they are destroyed by the
    /// next garbage collection once no frame references them.
    pub fn shutdown(&mut self, resources: &mut ResourceManager) {
        for mut effect in self.effects.drain(..) {
            let mut setup = effect_setup!(self, resources);
            effect.shutdown(&mut setup);
        }
        self.targets.shutdown(resources);
        self.pipelines.shutdown();
        self.ping = None;
        self.pong = None;
        self.is_initialized = false;
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    #[must_use]
    pub fn extent(&self) -> UVec2 {
        self.extent
    }

    #[must_use]
    pub fn output_format(&self) -> wgpu::TextureFormat {
        self.output_format
    }

    #[must_use]
    pub fn targets(&self) -> &RenderTargetPool {
        &self.targets
    }

    #[must_use]
    pub fn pipelines(&self) -> &PipelineFactory {
        &self.pipelines
    }

    /// The two intermediate targets, once initialized.
    #[must_use]
    pub fn ping_pong(&self) -> Option<(RtHandle, RtHandle)> {
        self.ping.zip(self.pong)
    }
}
