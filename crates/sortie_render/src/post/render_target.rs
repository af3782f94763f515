//! Render Target Pool
//!
//! Resolution-relative render targets addressed by stable handles.
//!
//! # Design
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                  RenderTargetPool                         │
//! │                                                           │
//! │  targets: SlotMap<RtHandle, RenderTarget>                 │
//! │                                                           │
//! │  register_rt(spec) → RtHandle   (no image yet)            │
//! │  build(base)       → images at max(1, round(base·scale))  │
//! │  rebuild(base)     → mark old images deleted, build again │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A handle stays valid for the lifetime of the pool; only the backing image
//! behind it changes. Old images are *not* destroyed on rebuild. They are
//! marked for deletion in the [`ResourceManager`] and collected once no
//! in-flight frame references them.
//!
//! Identical specs are never deduplicated: every registration owns its image.

use glam::{UVec2, Vec2};
use slotmap::{SlotMap, new_key_type};
use sortie_core::device::{ImageDesc, NativeImage, NativeImageView};

use super::PostImage;
use crate::resources::{ResourceHandle, ResourceManager};

new_key_type! {
    /// Stable handle to a pooled render target.
    pub struct RtHandle;
}

/// How a render target relates to the base resolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RtSpec {
    pub scale: Vec2,
    pub format: wgpu::TextureFormat,
    pub label: &'static str,
}

impl RtSpec {
    /// Uniform `scale` on both axes.
    #[must_use]
    pub fn new(scale: f32, format: wgpu::TextureFormat) -> Self {
        Self {
            scale: Vec2::splat(scale),
            format,
            label: "render_target",
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// `max(1, round(base * scale))` per axis.
    #[must_use]
    pub fn extent_for(&self, base: UVec2) -> UVec2 {
        (base.as_vec2() * self.scale).round().max(Vec2::ONE).as_uvec2()
    }
}

impl Default for RtSpec {
    fn default() -> Self {
        Self::new(1.0, wgpu::TextureFormat::Rgba16Float)
    }
}

#[derive(Debug)]
pub struct RenderTarget {
    spec: RtSpec,
    resource: Option<ResourceHandle>,
    image: NativeImage,
    view: NativeImageView,
    width: u32,
    height: u32,
}

impl RenderTarget {
    #[must_use]
    pub fn spec(&self) -> &RtSpec {
        &self.spec
    }

    #[must_use]
    pub fn resource(&self) -> Option<ResourceHandle> {
        self.resource
    }

    #[must_use]
    pub fn image(&self) -> NativeImage {
        self.image
    }

    #[must_use]
    pub fn view(&self) -> NativeImageView {
        self.view
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.resource.is_some()
    }

    fn clear_backing(&mut self) -> Option<ResourceHandle> {
        self.image = NativeImage::NULL;
        self.view = NativeImageView::NULL;
        self.resource.take()
    }
}

pub struct RenderTargetPool {
    targets: SlotMap<RtHandle, RenderTarget>,
    base: UVec2,
}

impl RenderTargetPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            targets: SlotMap::with_key(),
            base: UVec2::ZERO,
        }
    }

    /// Registers a target. It has no image until the next build.
    pub fn register_rt(&mut self, spec: RtSpec) -> RtHandle {
        self.targets.insert(RenderTarget {
            spec,
            resource: None,
            image: NativeImage::NULL,
            view: NativeImageView::NULL,
            width: 0,
            height: 0,
        })
    }

    /// Removes a target and marks its image for deferred deletion.
    pub fn unregister(&mut self, handle: RtHandle, resources: &mut ResourceManager) -> bool {
        match self.targets.remove(handle) {
            Some(mut target) => {
                if let Some(res) = target.clear_backing() {
                    resources.mark_delete(res);
                }
                true
            }
            None => false,
        }
    }

    /// Creates images for every target that has none, sized relative to `base`.
    ///
    /// Built targets are kept when `base` matches [`base_extent`](Self::base_extent);
    /// a different `base` rebuilds them all so every image stays sized
    /// against the reported base. A failed creation is logged and leaves that
    /// target invalid.
    pub fn build(&mut self, base: UVec2, resources: &mut ResourceManager) {
        if base != self.base && self.targets.values().any(|t| t.resource.is_some()) {
            self.rebuild(base, resources);
            return;
        }
        self.base = base;
        let mut failed = 0usize;

        for target in self.targets.values_mut() {
            if target.resource.is_some() {
                continue;
            }
            let extent = target.spec.extent_for(base);
            target.width = extent.x;
            target.height = extent.y;

            let desc = ImageDesc::render_target(target.spec.label, extent, target.spec.format);
            let Some(handle) = resources.create_image(&desc) else {
                failed += 1;
                continue;
            };
            if let Some(info) = resources.image(handle) {
                target.image = info.image;
                target.view = info.view;
                target.resource = Some(handle);
            }
        }

        if failed > 0 {
            log::error!(
                "{failed} render targets could not be built at {}x{}",
                base.x,
                base.y
            );
        }
    }

    /// Marks every current image for deletion and builds fresh ones at `base`.
    pub fn rebuild(&mut self, base: UVec2, resources: &mut ResourceManager) {
        for target in self.targets.values_mut() {
            if let Some(res) = target.clear_backing() {
                resources.mark_delete(res);
            }
        }
        log::debug!(
            "Rebuilding {} render targets at {}x{}",
            self.targets.len(),
            base.x,
            base.y
        );
        self.build(base, resources);
    }

    /// Marks every image for deletion and forgets all targets.
    pub fn shutdown(&mut self, resources: &mut ResourceManager) {
        for (_, mut target) in self.targets.drain() {
            if let Some(res) = target.clear_backing() {
                resources.mark_delete(res);
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn get(&self, handle: RtHandle) -> Option<&RenderTarget> {
        self.targets.get(handle)
    }

    #[must_use]
    pub fn size(&self, handle: RtHandle) -> Option<UVec2> {
        self.targets
            .get(handle)
            .map(|t| UVec2::new(t.width, t.height))
    }

    /// View of a valid target.
    #[must_use]
    pub fn image_view(&self, handle: RtHandle) -> Option<NativeImageView> {
        self.targets
            .get(handle)
            .filter(|t| t.is_valid())
            .map(RenderTarget::view)
    }

    #[must_use]
    pub fn is_valid(&self, handle: RtHandle) -> bool {
        self.targets.get(handle).is_some_and(RenderTarget::is_valid)
    }

    /// Target as an effect input/output, if valid.
    #[must_use]
    pub fn post_image(&self, handle: RtHandle) -> Option<PostImage> {
        let t = self.targets.get(handle).filter(|t| t.is_valid())?;
        Some(PostImage {
            image: t.image,
            view: t.view,
            extent: UVec2::new(t.width, t.height),
            format: t.spec.format,
            resource: t.resource,
        })
    }

    #[must_use]
    pub fn base_extent(&self) -> UVec2 {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Default for RenderTargetPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sortie_core::device::headless::HeadlessDevice;

    #[test]
    fn extent_rounds_and_clamps() {
        let half = RtSpec::new(0.5, wgpu::TextureFormat::Rgba16Float);
        assert_eq!(half.extent_for(UVec2::new(801, 600)), UVec2::new(401, 300));

        let tiny = RtSpec::new(0.03125, wgpu::TextureFormat::Rgba16Float);
        assert_eq!(tiny.extent_for(UVec2::new(16, 16)), UVec2::new(1, 1));
        assert_eq!(tiny.extent_for(UVec2::ZERO), UVec2::ONE);
    }

    #[test]
    fn registered_target_is_invalid_until_built() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = ResourceManager::new(device.clone());
        let mut pool = RenderTargetPool::new();

        let h = pool.register_rt(RtSpec::default());
        assert!(!pool.is_valid(h));
        assert!(pool.image_view(h).is_none());

        pool.build(UVec2::new(64, 32), &mut rm);
        assert!(pool.is_valid(h));
        assert_eq!(pool.size(h), Some(UVec2::new(64, 32)));
        assert_eq!(device.live().images, 1);
    }

    #[test]
    fn identical_specs_get_distinct_images() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = ResourceManager::new(device.clone());
        let mut pool = RenderTargetPool::new();

        let a = pool.register_rt(RtSpec::default());
        let b = pool.register_rt(RtSpec::default());
        pool.build(UVec2::new(8, 8), &mut rm);

        assert_ne!(pool.image_view(a), pool.image_view(b));
        assert_eq!(device.live().images, 2);
    }

    #[test]
    fn failed_build_leaves_target_invalid() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = ResourceManager::new(device.clone());
        let mut pool = RenderTargetPool::new();
        let h = pool.register_rt(RtSpec::default());

        device.fail_memory_allocations(1);
        pool.build(UVec2::new(8, 8), &mut rm);
        assert!(!pool.is_valid(h));

        pool.build(UVec2::new(8, 8), &mut rm);
        assert!(pool.is_valid(h));
    }

    #[test]
    fn unregister_marks_image() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = ResourceManager::new(device.clone());
        let mut pool = RenderTargetPool::new();
        let h = pool.register_rt(RtSpec::default());
        pool.build(UVec2::new(8, 8), &mut rm);
        let res = pool.get(h).unwrap().resource().unwrap();

        assert!(pool.unregister(h, &mut rm));
        assert!(rm.is_pending_delete(res));
        assert!(pool.get(h).is_none());
    }
}
