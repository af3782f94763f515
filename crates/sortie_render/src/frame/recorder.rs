//! Command Recorder
//!
//! Wraps one native command buffer and remembers every tracked resource the
//! recorded commands touch. Those references keep the resources alive until
//! the frame that submitted the recording retires.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::UVec2;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use sortie_core::device::{
    Command, CommandBufferId, CommandBufferLevel, DescriptorSetId, DeviceResult, GpuDevice,
    ImageLayout, NativeImage, NativeImageView, PipelineId,
};

use crate::resources::{ResourceHandle, ResourceManager};

static NEXT_RECORDER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a recorder, used as the "user" key in
/// resource reference sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecorderId(u64);

impl RecorderId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_RECORDER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Initial,
    Recording,
    Executable,
}

impl RecorderState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Recording => "recording",
            Self::Executable => "executable",
        }
    }
}

pub struct CommandRecorder {
    device: Arc<dyn GpuDevice>,
    id: RecorderId,
    cmd: CommandBufferId,
    level: CommandBufferLevel,
    state: RecorderState,
    referenced: FxHashSet<ResourceHandle>,
}

impl CommandRecorder {
    pub fn new(device: Arc<dyn GpuDevice>, level: CommandBufferLevel) -> DeviceResult<Self> {
        let cmd = device.allocate_command_buffer(level)?;
        Ok(Self {
            device,
            id: RecorderId::next(),
            cmd,
            level,
            state: RecorderState::Initial,
            referenced: FxHashSet::default(),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> RecorderId {
        self.id
    }

    /// The native command buffer.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> CommandBufferId {
        self.cmd
    }

    #[inline]
    #[must_use]
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> RecorderState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// Resources referenced since the last release.
    pub fn referenced(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.referenced.iter().copied()
    }

    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.referenced.len()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    pub fn begin(&mut self) -> DeviceResult<()> {
        self.device.begin_command_buffer(self.cmd)?;
        self.state = RecorderState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> DeviceResult<()> {
        self.device.end_command_buffer(self.cmd)?;
        self.state = RecorderState::Executable;
        Ok(())
    }

    /// Returns the buffer to the initial state. References must have been
    /// released before.
    pub fn reset(&mut self) -> DeviceResult<()> {
        debug_assert!(
            self.referenced.is_empty(),
            "recorder reset with unreleased references"
        );
        self.device.reset_command_buffer(self.cmd)?;
        self.state = RecorderState::Initial;
        Ok(())
    }

    // ─── Resource tracking ──────────────────────────────────────────────────

    /// References `handle` for the rest of this recording. Repeated calls are
    /// counted once. Returns `false` for unknown handles.
    pub fn use_resource(&mut self, resources: &mut ResourceManager, handle: ResourceHandle) -> bool {
        if !resources.contains(handle) {
            return false;
        }
        if self.referenced.insert(handle) {
            resources.add_ref(handle, self.id);
        }
        true
    }

    /// Drops every reference taken since the last release and returns how many.
    pub fn release_references(&mut self, resources: &mut ResourceManager) -> usize {
        let count = self.referenced.len();
        for handle in self.referenced.drain() {
            resources.remove_ref(handle, self.id);
        }
        count
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    #[inline]
    fn push(&self, command: Command) {
        self.device.record(self.cmd, command);
    }

    pub fn begin_rendering(&mut self, view: NativeImageView, extent: UVec2, clear: Option<[f32; 4]>) {
        self.push(Command::BeginRendering {
            view,
            extent,
            clear,
        });
    }

    pub fn end_rendering(&mut self) {
        self.push(Command::EndRendering);
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.push(Command::BindPipeline(pipeline));
    }

    pub fn set_viewport_scissor(&mut self, extent: UVec2) {
        self.push(Command::SetViewportScissor(extent));
    }

    pub fn bind_descriptor_sets(&mut self, pipeline: PipelineId, first_set: u32, sets: &[DescriptorSetId]) {
        self.push(Command::BindDescriptorSets {
            pipeline,
            first_set,
            sets: SmallVec::from_slice(sets),
        });
    }

    pub fn push_constants<T: bytemuck::Pod>(&mut self, pipeline: PipelineId, offset: u32, value: &T) {
        self.push(Command::PushConstants {
            pipeline,
            offset,
            data: SmallVec::from_slice(bytemuck::bytes_of(value)),
        });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    /// One fullscreen triangle.
    pub fn draw_fullscreen(&mut self) {
        self.draw(3, 1);
    }

    pub fn image_barrier(&mut self, image: NativeImage, old_layout: ImageLayout, new_layout: ImageLayout) {
        self.push(Command::ImageBarrier {
            image,
            old_layout,
            new_layout,
        });
    }

    /// Copies `size` bytes between two tracked buffers and references both.
    pub fn copy_buffer(
        &mut self,
        resources: &mut ResourceManager,
        src: ResourceHandle,
        dst: ResourceHandle,
        size: u64,
    ) -> bool {
        let (Some(src_buf), Some(dst_buf)) = (resources.buffer(src), resources.buffer(dst)) else {
            log::warn!("copy_buffer with a handle that is not a live buffer");
            return false;
        };
        self.use_resource(resources, src);
        self.use_resource(resources, dst);
        self.push(Command::CopyBuffer {
            src: src_buf,
            dst: dst_buf,
            size,
        });
        true
    }

    pub fn execute_secondary(&mut self, buffers: &[CommandBufferId]) {
        if buffers.is_empty() {
            return;
        }
        self.push(Command::ExecuteSecondary(SmallVec::from_slice(buffers)));
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if !self.referenced.is_empty() {
            log::warn!(
                "Command recorder {} dropped with {} unreleased resource references",
                self.id.0,
                self.referenced.len()
            );
        }
        self.device.free_command_buffer(self.cmd);
    }
}

impl std::fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("id", &self.id)
            .field("cmd", &self.cmd)
            .field("level", &self.level)
            .field("state", &self.state)
            .field("referenced", &self.referenced.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_core::device::headless::HeadlessDevice;

    #[test]
    fn recorder_ids_are_unique() {
        let a = RecorderId::next();
        let b = RecorderId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn use_resource_refs_once_per_session() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = ResourceManager::new(device.clone());
        let mut rec = CommandRecorder::new(device.clone(), CommandBufferLevel::Primary).unwrap();
        let h = rm.create_device_buffer(16, wgpu::BufferUsages::UNIFORM).unwrap();

        assert!(rec.use_resource(&mut rm, h));
        assert!(rec.use_resource(&mut rm, h));
        assert_eq!(rm.ref_count(h), 1);
        assert_eq!(rec.reference_count(), 1);

        assert_eq!(rec.release_references(&mut rm), 1);
        assert_eq!(rm.ref_count(h), 0);
        assert_eq!(rec.reference_count(), 0);
    }

    #[test]
    fn copy_buffer_tracks_both_sides() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rm = ResourceManager::new(device.clone());
        let mut rec = CommandRecorder::new(device.clone(), CommandBufferLevel::Primary).unwrap();
        let src = rm.create_host_buffer(64, wgpu::BufferUsages::COPY_SRC, true).unwrap();
        let dst = rm.create_device_buffer(64, wgpu::BufferUsages::COPY_DST).unwrap();

        rec.begin().unwrap();
        assert!(rec.copy_buffer(&mut rm, src, dst, 64));
        rec.end().unwrap();

        assert_eq!(rm.ref_count(src), 1);
        assert_eq!(rm.ref_count(dst), 1);
        assert!(matches!(
            device.commands(rec.handle()).as_slice(),
            [Command::CopyBuffer { size: 64, .. }]
        ));
        rec.release_references(&mut rm);
    }

    #[test]
    fn push_constants_serializes_pod() {
        let device = Arc::new(HeadlessDevice::new());
        let mut rec = CommandRecorder::new(device.clone(), CommandBufferLevel::Secondary).unwrap();
        rec.begin().unwrap();
        rec.push_constants(PipelineId(9), 0, &[1.0f32, 2.2f32]);

        match &device.commands(rec.handle())[0] {
            Command::PushConstants { data, .. } => assert_eq!(data.len(), 8),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn drop_frees_native_buffer() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let _rec = CommandRecorder::new(device.clone(), CommandBufferLevel::Primary).unwrap();
            assert_eq!(device.live().command_buffers, 1);
        }
        assert_eq!(device.live().command_buffers, 0);
    }
}
