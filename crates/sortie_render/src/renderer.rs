//! Frame Renderer
//!
//! The top-level frame loop tying the scheduler, the resource manager, the
//! post-process chain and the presentation surface together.
//!
//! # Frame Flow
//!
//! ```text
//! render_frame(record)
//!   ├─ pending rebuild? ─────────────► rebuild_swapchain()
//!   ├─ scheduler.begin_frame()           (the only blocking point)
//!   ├─ surface.acquire_next_image(image_ready)
//!   │     OutOfDate  → flag rebuild, return Skipped
//!   │     Suboptimal → flag rebuild, continue
//!   ├─ record(&mut FrameContext)
//!   ├─ scheduler.submit_and_advance(image_ready) → render_finished
//!   └─ surface.present_image(render_finished)
//!         Suboptimal / OutOfDate → flag rebuild
//! ```
//!
//! A rebuild never touches retired frame state: it drains the device, rebuilds
//! the swapchain and lets the post chain rebuild its render targets. Images
//! replaced by the rebuild are collected by the regular deferred GC.

use std::sync::Arc;

use glam::UVec2;
use sortie_core::device::{DeviceError, GpuDevice, ImageLayout, PresentSurface, SurfaceStatus};
use sortie_core::errors::{Result, SortieError};
use sortie_core::settings::FrameSettings;

use crate::binding::BindingSetAllocator;
use crate::frame::{CommandRecorder, FrameScheduler};
use crate::post::{PostEffect, PostImage, PostProcessChain};
use crate::resources::ResourceManager;

/// What happened to one call of [`FrameRenderer::render_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and queued for presentation.
    Presented { frame_number: u64, image_index: u32 },
    /// The surface had no usable image; nothing was recorded or submitted.
    Skipped,
}

impl FrameOutcome {
    #[must_use]
    pub fn is_presented(&self) -> bool {
        matches!(self, Self::Presented { .. })
    }
}

/// Counters kept by the renderer across its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RendererStatistics {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub swapchain_rebuilds: u64,
}

/// Everything the recording closure of a frame may use.
pub struct FrameContext<'a> {
    pub recorder: &'a mut CommandRecorder,
    pub bindings: &'a mut BindingSetAllocator,
    pub resources: &'a mut ResourceManager,
    pub post: &'a mut PostProcessChain,
    /// The acquired surface image, in `ColorAttachment` layout.
    pub target: PostImage,
    pub extent: UVec2,
    pub image_index: u32,
    pub frame_number: u64,
}

impl FrameContext<'_> {
    /// Runs the post chain from `input` into the surface image.
    ///
    /// Returns the number of effects that recorded work.
    pub fn run_post(&mut self, input: &PostImage) -> usize {
        self.post
            .execute(self.recorder, self.bindings, self.resources, input, &self.target)
    }
}

pub struct FrameRenderer {
    // Field order is drop order: everything holding device objects goes
    // before the resource manager.
    post: PostProcessChain,
    scheduler: FrameScheduler,
    resources: ResourceManager,
    surface: Arc<dyn PresentSurface>,
    device: Arc<dyn GpuDevice>,

    settings: FrameSettings,
    requested_extent: Option<UVec2>,
    needs_rebuild: bool,
    stats: RendererStatistics,
    is_shut_down: bool,
}

impl FrameRenderer {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        surface: Arc<dyn PresentSurface>,
        settings: FrameSettings,
    ) -> Result<Self> {
        let scheduler = FrameScheduler::new(Arc::clone(&device), &settings)?;
        let mut resources = ResourceManager::new(Arc::clone(&device));
        let mut post = PostProcessChain::new(Arc::clone(&device), &settings);
        post.init(surface.extent(), surface.format(), &mut resources)?;

        let extent = surface.extent();
        log::info!(
            "Frame renderer ready: {}x{} {:?}, {} frames in flight",
            extent.x,
            extent.y,
            surface.format(),
            settings.frames_in_flight
        );

        Ok(Self {
            post,
            scheduler,
            resources,
            surface,
            device,
            settings,
            requested_extent: None,
            needs_rebuild: false,
            stats: RendererStatistics::default(),
            is_shut_down: false,
        })
    }

    // ========================================================================
    // Frame loop
    // ========================================================================

    /// Records, submits and presents one frame.
    ///
    /// Any `Err` is fatal for the frame loop, except [`SortieError::ShutDown`]
    /// after [`shutdown`](Self::shutdown).
    pub fn render_frame(&mut self, record: impl FnOnce(&mut FrameContext<'_>)) -> Result<FrameOutcome> {
        if self.is_shut_down {
            return Err(SortieError::ShutDown);
        }
        if self.needs_rebuild {
            self.rebuild_swapchain()?;
        }

        let frame_number = self.scheduler.frame_count();
        let slot = self.scheduler.begin_frame(&mut self.resources)?;
        let image_ready = slot.image_ready();

        let acquired = match self
            .surface
            .acquire_next_image(self.settings.acquire_timeout, image_ready)
        {
            Ok(acquired) => acquired,
            Err(DeviceError::Timeout(waited)) => {
                log::warn!("Surface acquire timed out after {waited:?}; skipping frame {frame_number}");
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::Skipped);
            }
            Err(e) => {
                log::error!("Surface acquire failed: {e}");
                return Err(SortieError::Present(e));
            }
        };

        match acquired.status {
            SurfaceStatus::OutOfDate => {
                log::debug!("Surface out of date on acquire; skipping frame {frame_number}");
                self.needs_rebuild = true;
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::Skipped);
            }
            SurfaceStatus::Suboptimal => self.needs_rebuild = true,
            SurfaceStatus::Optimal => {}
        }

        let index = acquired.index;
        let Some(image) = self.surface.image(index) else {
            return Err(SortieError::Present(DeviceError::InvalidHandle {
                kind: "surface image",
                id: u64::from(index),
            }));
        };
        let extent = self.surface.extent();
        let target = PostImage::external(image.image, image.view, extent, self.surface.format());

        let (recorder, bindings) = slot.split_mut();
        recorder.image_barrier(target.image, ImageLayout::Undefined, ImageLayout::ColorAttachment);
        let mut ctx = FrameContext {
            recorder,
            bindings,
            resources: &mut self.resources,
            post: &mut self.post,
            target,
            extent,
            image_index: index,
            frame_number,
        };
        record(&mut ctx);
        ctx.recorder
            .image_barrier(target.image, ImageLayout::ColorAttachment, ImageLayout::PresentSrc);

        let render_finished = self.scheduler.submit_and_advance(Some(image_ready))?;

        match self.surface.present_image(index, render_finished) {
            Ok(status) if status.needs_rebuild() => {
                log::debug!("Surface reported {status:?} on present; rebuild scheduled");
                self.needs_rebuild = true;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Present of frame {frame_number} failed: {e}");
                return Err(SortieError::Present(e));
            }
        }

        self.stats.frames_presented += 1;
        Ok(FrameOutcome::Presented {
            frame_number,
            image_index: index,
        })
    }

    /// Drains the device, rebuilds the swapchain and resizes the post chain.
    pub fn rebuild_swapchain(&mut self) -> Result<()> {
        if self.is_shut_down {
            return Err(SortieError::ShutDown);
        }
        self.scheduler.wait_device_idle(&mut self.resources)?;

        let wanted = self.requested_extent.take().unwrap_or_else(|| self.surface.extent());
        let extent = self.surface.rebuild(wanted)?;
        self.post
            .on_resize(extent, self.surface.format(), &mut self.resources)?;

        self.needs_rebuild = false;
        self.stats.swapchain_rebuilds += 1;
        log::info!("Swapchain rebuilt at {}x{}", extent.x, extent.y);
        Ok(())
    }

    /// Schedules a rebuild at `width × height` before the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.requested_extent = Some(UVec2::new(width, height));
        self.needs_rebuild = true;
    }

    /// Appends a post effect to the chain, initializing it.
    pub fn add_post_effect(&mut self, effect: impl Into<PostEffect>) -> Result<usize> {
        self.post.add_effect(effect, &mut self.resources)
    }

    /// Drains all in-flight work and releases every GPU object.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.is_shut_down {
            return Ok(());
        }
        self.scheduler.shutdown(&mut self.resources)?;
        self.post.shutdown(&mut self.resources);
        let collected = self.resources.garbage_collect();
        self.is_shut_down = true;

        log::info!(
            "Frame renderer shut down: {} presented, {} skipped, {} rebuilds, {collected} resources collected",
            self.stats.frames_presented,
            self.stats.frames_skipped,
            self.stats.swapchain_rebuilds
        );
        Ok(())
    }

    /// Logs renderer counters and the current slot's allocator statistics.
    pub fn log_statistics(&self) {
        let res = self.resources.stats();
        log::info!(
            "Renderer: {} frames ({} presented, {} skipped), {} rebuilds",
            self.scheduler.frame_count(),
            self.stats.frames_presented,
            self.stats.frames_skipped,
            self.stats.swapchain_rebuilds
        );
        log::info!(
            "Resources: {} live, {} pending delete, {} created, {} destroyed",
            res.live,
            res.pending_delete,
            res.created,
            res.destroyed
        );
        if !self.scheduler.is_shut_down() {
            self.scheduler.current_slot().bindings().log_statistics();
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[must_use]
    pub fn surface(&self) -> &Arc<dyn PresentSurface> {
        &self.surface
    }

    #[must_use]
    pub fn settings(&self) -> &FrameSettings {
        &self.settings
    }

    #[must_use]
    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resources
    }

    #[must_use]
    pub fn post(&self) -> &PostProcessChain {
        &self.post
    }

    /// The post chain together with the resource manager its mutating
    /// operations need.
    pub fn post_mut(&mut self) -> (&mut PostProcessChain, &mut ResourceManager) {
        (&mut self.post, &mut self.resources)
    }

    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    #[must_use]
    pub fn statistics(&self) -> RendererStatistics {
        self.stats
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.scheduler.frame_count()
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Frame renderer shutdown during drop failed: {e}");
        }
    }
}
