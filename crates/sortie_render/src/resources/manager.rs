//! Resource Manager
//!
//! Owns every tracked GPU object and decides when it may be physically
//! destroyed.
//!
//! # Lifetime rule
//!
//! A resource is destroyed only when **both** hold at collection time:
//!
//! 1. its owner called [`ResourceManager::mark_delete`], and
//! 2. no command recorder still references it (`ref_count == 0`).
//!
//! Recorders add themselves as users while recording and are removed when the
//! frame that submitted them retires, so a resource referenced by an
//! in-flight frame always survives until that frame's fence has signalled.
//!
//! ```text
//!   create ──► tracked (refs=0)
//!                 │  add_ref(rec)           remove_ref(rec)
//!                 ├────────────► refs>0 ───────────────┐
//!                 │                                    ▼
//!   mark_delete ──┴─► pending ──── garbage_collect (refs==0) ──► destroyed
//! ```

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use slotmap::{SlotMap, new_key_type};
use sortie_core::device::{
    DeviceMemory, GpuDevice, ImageDesc, MemoryPropertyFlags, NativeBuffer, NativeImage,
    NativeImageView, NativeSampler, SamplerDesc,
};

use crate::frame::RecorderId;

new_key_type! {
    /// Stable, generation-checked handle to a tracked GPU resource.
    pub struct ResourceHandle;
}

/// Resource manager shared between threads that record secondary buffers.
pub type SharedResourceManager = Arc<Mutex<ResourceManager>>;

// ─── Tracked resource ─────────────────────────────────────────────────────────

/// Persistent host mapping of a host-visible buffer.
#[derive(Debug)]
pub struct HostMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping points into device memory owned by the manager; it is
// only dereferenced through `&mut ResourceManager`, which serializes access.
unsafe impl Send for HostMapping {}
// SAFETY: see above; shared references never dereference the pointer.
unsafe impl Sync for HostMapping {}

impl HostMapping {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub enum ResourceKind {
    DeviceBuffer {
        buffer: NativeBuffer,
        memory: DeviceMemory,
        size: u64,
        allocation_size: u64,
    },
    HostBuffer {
        buffer: NativeBuffer,
        memory: DeviceMemory,
        size: u64,
        allocation_size: u64,
        coherent: bool,
        mapping: HostMapping,
    },
    Image {
        image: NativeImage,
        memory: DeviceMemory,
        view: NativeImageView,
        desc: ImageDesc,
    },
    Sampler {
        sampler: NativeSampler,
    },
}

impl ResourceKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceBuffer { .. } => "device buffer",
            Self::HostBuffer { .. } => "host buffer",
            Self::Image { .. } => "image",
            Self::Sampler { .. } => "sampler",
        }
    }
}

/// One tracked GPU object.
#[derive(Debug)]
pub struct GpuResource {
    kind: ResourceKind,
    users: FxHashSet<RecorderId>,
    pending_delete: bool,
}

impl GpuResource {
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Number of distinct recorders currently referencing this resource.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.users.len()
    }

    #[inline]
    #[must_use]
    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete
    }

    #[inline]
    #[must_use]
    pub fn is_collectable(&self) -> bool {
        self.pending_delete && self.users.is_empty()
    }
}

/// Image details returned by [`ResourceManager::image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub image: NativeImage,
    pub view: NativeImageView,
    pub desc: ImageDesc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub live: usize,
    pub pending_delete: usize,
    pub created: u64,
    pub destroyed: u64,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct ResourceManager {
    device: Arc<dyn GpuDevice>,
    resources: SlotMap<ResourceHandle, GpuResource>,
    created: u64,
    destroyed: u64,
}

impl ResourceManager {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            resources: SlotMap::with_key(),
            created: 0,
            destroyed: 0,
        }
    }

    #[must_use]
    pub fn into_shared(self) -> SharedResourceManager {
        Arc::new(Mutex::new(self))
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    fn track(&mut self, kind: ResourceKind) -> ResourceHandle {
        self.created += 1;
        self.resources.insert(GpuResource {
            kind,
            users: FxHashSet::default(),
            pending_delete: false,
        })
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Creates a buffer backed by GPU-local memory.
    ///
    /// The backing allocation is sized to the device's requirement, which may
    /// exceed `size`. Returns `None` (and logs) when no device-local memory
    /// type fits or allocation fails.
    pub fn create_device_buffer(
        &mut self,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Option<ResourceHandle> {
        let (buffer, memory, allocation_size) =
            self.allocate_buffer(size, usage, MemoryPropertyFlags::DEVICE_LOCAL)?;
        Some(self.track(ResourceKind::DeviceBuffer {
            buffer,
            memory,
            size,
            allocation_size,
        }))
    }

    /// Creates a persistently mapped host-visible buffer.
    ///
    /// With `coherent == false` writes must be published with
    /// [`Self::flush_host_buffer`].
    pub fn create_host_buffer(
        &mut self,
        size: u64,
        usage: wgpu::BufferUsages,
        coherent: bool,
    ) -> Option<ResourceHandle> {
        let mut flags = MemoryPropertyFlags::HOST_VISIBLE;
        if coherent {
            flags |= MemoryPropertyFlags::HOST_COHERENT;
        }
        let (buffer, memory, allocation_size) = self.allocate_buffer(size, usage, flags)?;

        let ptr = match self.device.map_memory(memory, 0, allocation_size) {
            Ok(ptr) => ptr,
            Err(e) => {
                log::warn!("Failed to map host buffer of {size} bytes: {e}");
                self.device.destroy_buffer(buffer);
                self.device.free_memory(memory);
                return None;
            }
        };
        let Ok(len) = usize::try_from(size) else {
            log::warn!("Host buffer of {size} bytes does not fit the address space");
            self.device.unmap_memory(memory);
            self.device.destroy_buffer(buffer);
            self.device.free_memory(memory);
            return None;
        };

        Some(self.track(ResourceKind::HostBuffer {
            buffer,
            memory,
            size,
            allocation_size,
            coherent,
            mapping: HostMapping { ptr, len },
        }))
    }

    fn allocate_buffer(
        &self,
        size: u64,
        usage: wgpu::BufferUsages,
        flags: MemoryPropertyFlags,
    ) -> Option<(NativeBuffer, DeviceMemory, u64)> {
        let device = &self.device;
        let buffer = match device.create_buffer(size, usage) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("Failed to create buffer of {size} bytes: {e}");
                return None;
            }
        };

        let memory = device
            .buffer_memory_requirements(buffer)
            .map_err(|e| log::warn!("Failed to query buffer requirements: {e}"))
            .ok()
            .and_then(|req| {
                let Some(ty) = device.memory_type_for(&req, flags) else {
                    log::warn!("No memory type with {flags:?} for a buffer of {size} bytes");
                    return None;
                };
                match device.allocate_memory(req.size, ty) {
                    Ok(mem) => Some((mem, req.size)),
                    Err(e) => {
                        log::warn!("Failed to allocate {} bytes of buffer memory: {e}", req.size);
                        None
                    }
                }
            });

        let Some((memory, allocation_size)) = memory else {
            device.destroy_buffer(buffer);
            return None;
        };

        if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
            log::warn!("Failed to bind buffer memory: {e}");
            device.destroy_buffer(buffer);
            device.free_memory(memory);
            return None;
        }

        Some((buffer, memory, allocation_size))
    }

    /// Creates a device-local image with bound memory and a default view.
    pub fn create_image(&mut self, desc: &ImageDesc) -> Option<ResourceHandle> {
        let device = Arc::clone(&self.device);
        let image = match device.create_image(desc) {
            Ok(i) => i,
            Err(e) => {
                log::warn!("Failed to create image '{}': {e}", desc.label);
                return None;
            }
        };

        let memory = device
            .image_memory_requirements(image)
            .ok()
            .and_then(|req| {
                let ty = device.memory_type_for(&req, MemoryPropertyFlags::DEVICE_LOCAL)?;
                device.allocate_memory(req.size, ty).ok()
            });
        let Some(memory) = memory else {
            log::warn!(
                "Failed to allocate memory for image '{}' ({}x{})",
                desc.label,
                desc.extent.x,
                desc.extent.y
            );
            device.destroy_image(image);
            return None;
        };

        let view = device
            .bind_image_memory(image, memory, 0)
            .and_then(|()| device.create_image_view(image, desc.format));
        let view = match view {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to finish image '{}': {e}", desc.label);
                device.destroy_image(image);
                device.free_memory(memory);
                return None;
            }
        };

        Some(self.track(ResourceKind::Image {
            image,
            memory,
            view,
            desc: *desc,
        }))
    }

    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> Option<ResourceHandle> {
        match self.device.create_sampler(desc) {
            Ok(sampler) => Some(self.track(ResourceKind::Sampler { sampler })),
            Err(e) => {
                log::warn!("Failed to create sampler: {e}");
                None
            }
        }
    }

    // ========================================================================
    // Host access
    // ========================================================================

    /// Mutable view of a host buffer's mapping (`size` bytes).
    pub fn mapped_mut(&mut self, handle: ResourceHandle) -> Option<&mut [u8]> {
        match &mut self.resources.get_mut(handle)?.kind {
            ResourceKind::HostBuffer { mapping, .. } => {
                // SAFETY: the mapping covers at least `len` bytes of live host
                // memory until the resource is destroyed, and the returned
                // slice borrows `self` mutably, so it cannot outlive it or alias.
                Some(unsafe { std::slice::from_raw_parts_mut(mapping.ptr.as_ptr(), mapping.len) })
            }
            _ => None,
        }
    }

    /// Copies `bytes` into a host buffer at `offset`. Returns `false` if the
    /// handle is not a host buffer or the range is out of bounds.
    pub fn write_host_buffer(&mut self, handle: ResourceHandle, offset: usize, bytes: &[u8]) -> bool {
        let Some(mapped) = self.mapped_mut(handle) else {
            return false;
        };
        let Some(dst) = offset
            .checked_add(bytes.len())
            .and_then(|end| mapped.get_mut(offset..end))
        else {
            return false;
        };
        dst.copy_from_slice(bytes);
        true
    }

    /// Makes host writes visible to the device. No-op for coherent buffers.
    pub fn flush_host_buffer(&mut self, handle: ResourceHandle) -> bool {
        match self.resources.get(handle).map(|r| &r.kind) {
            Some(ResourceKind::HostBuffer { coherent: true, .. }) => true,
            Some(ResourceKind::HostBuffer {
                memory,
                allocation_size,
                ..
            }) => match self.device.flush_memory(*memory, 0, *allocation_size) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to flush host buffer: {e}");
                    false
                }
            },
            _ => false,
        }
    }

    // ========================================================================
    // Reference counting & collection
    // ========================================================================

    /// Flags a resource for destruction once nothing references it.
    ///
    /// Nothing is freed here; see [`Self::garbage_collect`].
    pub fn mark_delete(&mut self, handle: ResourceHandle) {
        if let Some(res) = self.resources.get_mut(handle) {
            res.pending_delete = true;
        }
    }

    /// Records `recorder` as a user. Idempotent per recorder.
    ///
    /// Adding a reference to a resource already marked for deletion is a
    /// caller bug; it is not detected.
    pub fn add_ref(&mut self, handle: ResourceHandle, recorder: RecorderId) -> bool {
        match self.resources.get_mut(handle) {
            Some(res) => res.users.insert(recorder),
            None => false,
        }
    }

    /// Removes `recorder` from the users. Idempotent per recorder.
    pub fn remove_ref(&mut self, handle: ResourceHandle, recorder: RecorderId) -> bool {
        match self.resources.get_mut(handle) {
            Some(res) => res.users.remove(&recorder),
            None => false,
        }
    }

    /// Destroys every resource that is marked for deletion and unreferenced.
    ///
    /// Returns the number destroyed. O(n) in the number of tracked resources.
    pub fn garbage_collect(&mut self) -> usize {
        let doomed: Vec<ResourceHandle> = self
            .resources
            .iter()
            .filter(|(_, r)| r.is_collectable())
            .map(|(h, _)| h)
            .collect();

        for handle in &doomed {
            if let Some(res) = self.resources.remove(*handle) {
                destroy_native(self.device.as_ref(), res.kind);
            }
        }

        let count = doomed.len();
        if count > 0 {
            self.destroyed += count as u64;
            log::debug!(
                "Resource GC destroyed {count} objects, {} still tracked",
                self.resources.len()
            );
        }
        count
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn get(&self, handle: ResourceHandle) -> Option<&GpuResource> {
        self.resources.get(handle)
    }

    #[must_use]
    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.resources.contains_key(handle)
    }

    /// Native buffer of a device or host buffer.
    #[must_use]
    pub fn buffer(&self, handle: ResourceHandle) -> Option<NativeBuffer> {
        match self.resources.get(handle)?.kind {
            ResourceKind::DeviceBuffer { buffer, .. } | ResourceKind::HostBuffer { buffer, .. } => {
                Some(buffer)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn image(&self, handle: ResourceHandle) -> Option<ImageInfo> {
        match self.resources.get(handle)?.kind {
            ResourceKind::Image {
                image, view, desc, ..
            } => Some(ImageInfo { image, view, desc }),
            _ => None,
        }
    }

    #[must_use]
    pub fn sampler(&self, handle: ResourceHandle) -> Option<NativeSampler> {
        match self.resources.get(handle)?.kind {
            ResourceKind::Sampler { sampler } => Some(sampler),
            _ => None,
        }
    }

    /// Reference count of `handle`; 0 for unknown handles.
    #[must_use]
    pub fn ref_count(&self, handle: ResourceHandle) -> usize {
        self.resources.get(handle).map_or(0, GpuResource::ref_count)
    }

    #[must_use]
    pub fn is_pending_delete(&self, handle: ResourceHandle) -> bool {
        self.resources
            .get(handle)
            .is_some_and(GpuResource::is_pending_delete)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            live: self.resources.len(),
            pending_delete: self.resources.values().filter(|r| r.pending_delete).count(),
            created: self.created,
            destroyed: self.destroyed,
        }
    }
}

fn destroy_native(device: &dyn GpuDevice, kind: ResourceKind) {
    match kind {
        ResourceKind::DeviceBuffer { buffer, memory, .. } => {
            device.destroy_buffer(buffer);
            device.free_memory(memory);
        }
        ResourceKind::HostBuffer { buffer, memory, .. } => {
            device.unmap_memory(memory);
            device.destroy_buffer(buffer);
            device.free_memory(memory);
        }
        ResourceKind::Image {
            image, memory, view, ..
        } => {
            device.destroy_image_view(view);
            device.destroy_image(image);
            device.free_memory(memory);
        }
        ResourceKind::Sampler { sampler } => device.destroy_sampler(sampler),
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let mut still_referenced = 0usize;
        for (_, res) in self.resources.drain() {
            if res.ref_count() > 0 {
                still_referenced += 1;
                log::warn!(
                    "Destroying {} with {} outstanding references",
                    res.kind.name(),
                    res.ref_count()
                );
            }
            destroy_native(self.device.as_ref(), res.kind);
        }
        if still_referenced > 0 {
            log::warn!("{still_referenced} resources were still referenced at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_core::device::headless::HeadlessDevice;

    fn manager() -> (Arc<HeadlessDevice>, ResourceManager) {
        let device = Arc::new(HeadlessDevice::new());
        let rm = ResourceManager::new(device.clone());
        (device, rm)
    }

    #[test]
    fn device_buffer_is_tracked_unreferenced() {
        let (device, mut rm) = manager();
        let h = rm
            .create_device_buffer(100, wgpu::BufferUsages::VERTEX)
            .unwrap();

        assert_eq!(rm.ref_count(h), 0);
        assert!(!rm.is_pending_delete(h));
        assert_eq!(device.live().buffers, 1);
        match rm.get(h).unwrap().kind() {
            ResourceKind::DeviceBuffer {
                size,
                allocation_size,
                ..
            } => {
                assert_eq!(*size, 100);
                assert!(*allocation_size >= 100);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn refs_are_sets_per_recorder() {
        let (_device, mut rm) = manager();
        let h = rm.create_device_buffer(64, wgpu::BufferUsages::UNIFORM).unwrap();
        let a = RecorderId::next();
        let b = RecorderId::next();

        assert!(rm.add_ref(h, a));
        assert!(!rm.add_ref(h, a));
        assert!(rm.add_ref(h, b));
        assert_eq!(rm.ref_count(h), 2);

        assert!(rm.remove_ref(h, a));
        assert!(!rm.remove_ref(h, a));
        assert_eq!(rm.ref_count(h), 1);
    }

    #[test]
    fn gc_waits_for_last_reference() {
        let (device, mut rm) = manager();
        let h = rm.create_device_buffer(64, wgpu::BufferUsages::UNIFORM).unwrap();
        let rec = RecorderId::next();

        rm.add_ref(h, rec);
        rm.mark_delete(h);
        assert_eq!(rm.garbage_collect(), 0);
        assert!(rm.contains(h));

        rm.remove_ref(h, rec);
        assert_eq!(rm.garbage_collect(), 1);
        assert!(!rm.contains(h));
        assert_eq!(device.live().buffers, 0);
        assert_eq!(device.live().memory_allocations, 0);
    }

    #[test]
    fn unmarked_resources_survive_gc() {
        let (_device, mut rm) = manager();
        let h = rm.create_device_buffer(64, wgpu::BufferUsages::UNIFORM).unwrap();
        assert_eq!(rm.garbage_collect(), 0);
        assert!(rm.contains(h));
    }

    #[test]
    fn missing_memory_type_returns_none() {
        let device = Arc::new(HeadlessDevice::with_config(
            vec![sortie_core::device::MemoryType {
                properties: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            }],
            glam::UVec2::new(64, 64),
            2,
        ));
        let mut rm = ResourceManager::new(device.clone());

        assert!(rm.create_host_buffer(64, wgpu::BufferUsages::UNIFORM, true).is_none());
        assert_eq!(device.live().buffers, 0);
        assert!(rm.is_empty());
    }

    #[test]
    fn allocation_failure_cleans_up_buffer() {
        let (device, mut rm) = manager();
        device.fail_memory_allocations(1);
        assert!(rm.create_device_buffer(64, wgpu::BufferUsages::UNIFORM).is_none());
        assert_eq!(device.live().buffers, 0);
        assert!(rm.create_device_buffer(64, wgpu::BufferUsages::UNIFORM).is_some());
    }

    #[test]
    fn host_buffer_write_and_bounds() {
        let (_device, mut rm) = manager();
        let h = rm
            .create_host_buffer(16, wgpu::BufferUsages::UNIFORM, false)
            .unwrap();

        assert!(rm.write_host_buffer(h, 4, &[1, 2, 3, 4]));
        assert!(!rm.write_host_buffer(h, 14, &[0; 4]));
        assert_eq!(&rm.mapped_mut(h).unwrap()[4..8], &[1, 2, 3, 4]);
        assert!(rm.flush_host_buffer(h));
    }

    #[test]
    fn drop_destroys_everything() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let mut rm = ResourceManager::new(device.clone());
            rm.create_device_buffer(64, wgpu::BufferUsages::UNIFORM);
            rm.create_sampler(&SamplerDesc::default());
            rm.create_image(&ImageDesc::render_target(
                "rt",
                glam::UVec2::new(8, 8),
                wgpu::TextureFormat::Rgba8Unorm,
            ));
            assert_eq!(rm.len(), 3);
        }
        let live = device.live();
        assert_eq!(live.buffers, 0);
        assert_eq!(live.images, 0);
        assert_eq!(live.image_views, 0);
        assert_eq!(live.samplers, 0);
        assert_eq!(live.memory_allocations, 0);
    }
}
