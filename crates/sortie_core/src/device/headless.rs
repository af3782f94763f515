//! Headless Device
//!
//! An in-memory implementation of [`GpuDevice`] and [`PresentSurface`].
//!
//! Nothing is rendered. Instead the device keeps a precise book of every
//! object it hands out, every command recorded, every submission and every
//! fence wait, so tests and soak runs can check lifetime behavior exactly.
//!
//! # GPU completion model
//!
//! A submission moves its fence to *pending*. The GPU "finishes" the work the
//! moment the CPU waits on that fence, so a wait on a pending fence always
//! succeeds. A wait on a fence that was never submitted would block forever;
//! with an unbounded timeout it is reported as an error instead.
//!
//! # Fault injection
//!
//! - [`HeadlessDevice::fail_memory_allocations`] fails the next N memory allocations
//! - [`HeadlessDevice::fail_descriptor_set_allocations`] fails the next N set allocations
//! - [`HeadlessDevice::fail_next_fence_wait`] makes the next fence wait report a lost device
//! - [`HeadlessDevice::fail_next_command_buffer_end`] / [`HeadlessDevice::fail_next_command_buffer_reset`]
//!   fail one command buffer transition
//! - [`HeadlessDevice::set_device_lost`] fails every queue-level call
//! - [`HeadlessDevice::queue_acquire_status`] / [`HeadlessDevice::queue_present_status`]
//!   script the surface health

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::time::Duration;

use glam::UVec2;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    AcquiredImage, Command, CommandBufferId, CommandBufferLevel, DescriptorCounts,
    DescriptorPoolId, DescriptorSetId, DescriptorSetLayoutId, DescriptorWrite, DeviceError,
    DeviceMemory, DeviceResult, Fence, GpuDevice, GraphicsPipelineDesc, ImageDesc, LayoutBinding,
    MemoryPropertyFlags, MemoryRequirements, MemoryType, NativeBuffer, NativeImage,
    NativeImageView, NativeSampler, PipelineId, PoolCapacity, PresentSurface, SamplerDesc,
    Semaphore, ShaderModuleId, SubmitInfo, SurfaceImage, SurfaceStatus, aggregate_requirement,
};

const BUFFER_ALIGNMENT: u64 = 256;
const IMAGE_ALIGNMENT: u64 = 4096;

// ============================================================================
// Public bookkeeping views
// ============================================================================

/// Number of live objects per type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: usize,
    pub images: usize,
    pub image_views: usize,
    pub samplers: usize,
    pub memory_allocations: usize,
    pub fences: usize,
    pub semaphores: usize,
    pub command_buffers: usize,
    pub descriptor_set_layouts: usize,
    pub descriptor_pools: usize,
    pub descriptor_sets: usize,
    pub shader_modules: usize,
    pub pipelines: usize,
}

/// Cumulative call counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub memory_allocations: u64,
    pub descriptor_pools_created: u64,
    pub descriptor_pool_resets: u64,
    pub descriptor_sets_allocated: u64,
    pub descriptor_set_updates: u64,
    pub shader_loads: u64,
    pub pipelines_created: u64,
    pub submits: u64,
    pub fence_waits: u64,
    pub acquires: u64,
    pub presents: u64,
    pub surface_rebuilds: u64,
    pub wait_idle_calls: u64,
    /// Commands recorded into a buffer that was not in the recording state.
    pub commands_out_of_state: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub command_buffers: Vec<CommandBufferId>,
    pub wait_semaphores: Vec<Semaphore>,
    pub signal_semaphores: Vec<Semaphore>,
    pub fence: Fence,
}

/// Recording state of a headless command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

struct MemoryRecord {
    size: u64,
    memory_type: u32,
    data: Box<[u8]>,
    mapped: bool,
}

struct BufferRecord {
    requirements: MemoryRequirements,
    memory: Option<DeviceMemory>,
}

struct ImageRecord {
    requirements: MemoryRequirements,
    memory: Option<DeviceMemory>,
}

struct CommandBufferRecord {
    level: CommandBufferLevel,
    state: RecordingState,
    commands: Vec<Command>,
}

struct PoolRecord {
    capacity: PoolCapacity,
    remaining: PoolCapacity,
    sets: Vec<DescriptorSetId>,
}

struct SetRecord {
    pool: DescriptorPoolId,
    writes: Vec<DescriptorWrite>,
}

struct SurfaceState {
    extent: UVec2,
    format: wgpu::TextureFormat,
    image_count: u32,
    images: Vec<SurfaceImage>,
    next_index: u32,
    acquire_statuses: VecDeque<SurfaceStatus>,
    present_statuses: VecDeque<SurfaceStatus>,
    presented: Vec<u32>,
}

#[derive(Default)]
struct Faults {
    failing_memory_allocations: u32,
    failing_set_allocations: u32,
    fail_next_fence_wait: bool,
    fail_next_end: bool,
    fail_next_reset: bool,
    device_lost: bool,
}

struct State {
    next_id: u64,
    buffers: FxHashMap<NativeBuffer, BufferRecord>,
    images: FxHashMap<NativeImage, ImageRecord>,
    image_views: FxHashMap<NativeImageView, NativeImage>,
    samplers: FxHashSet<NativeSampler>,
    memory: FxHashMap<DeviceMemory, MemoryRecord>,
    fences: FxHashMap<Fence, FenceState>,
    semaphores: FxHashSet<Semaphore>,
    command_buffers: FxHashMap<CommandBufferId, CommandBufferRecord>,
    layouts: FxHashMap<DescriptorSetLayoutId, DescriptorCounts>,
    pools: FxHashMap<DescriptorPoolId, PoolRecord>,
    sets: FxHashMap<DescriptorSetId, SetRecord>,
    shaders: FxHashMap<ShaderModuleId, String>,
    pipelines: FxHashSet<PipelineId>,
    submissions: Vec<SubmissionRecord>,
    fence_waits: Vec<Fence>,
    surface: SurfaceState,
    faults: Faults,
    stats: HeadlessStats,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn make_surface_images(&mut self) {
        let count = self.surface.image_count;
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let image = NativeImage(self.next_id());
            let view = NativeImageView(self.next_id());
            images.push(SurfaceImage { image, view });
        }
        self.surface.images = images;
        self.surface.next_index = 0;
    }

    fn check_alive(&self) -> DeviceResult<()> {
        if self.faults.device_lost {
            Err(DeviceError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

fn invalid(kind: &'static str, id: u64) -> DeviceError {
    DeviceError::InvalidHandle { kind, id }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment).max(1) * alignment
}

// ============================================================================
// HeadlessDevice
// ============================================================================

pub struct HeadlessDevice {
    memory_types: Vec<MemoryType>,
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// A device with device-local, host-coherent and host-cached memory types,
    /// and an 800×600 triple-buffered surface.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Self::default_memory_types(), UVec2::new(800, 600), 3)
    }

    #[must_use]
    pub fn with_config(memory_types: Vec<MemoryType>, extent: UVec2, image_count: u32) -> Self {
        let mut state = State {
            next_id: 0,
            buffers: FxHashMap::default(),
            images: FxHashMap::default(),
            image_views: FxHashMap::default(),
            samplers: FxHashSet::default(),
            memory: FxHashMap::default(),
            fences: FxHashMap::default(),
            semaphores: FxHashSet::default(),
            command_buffers: FxHashMap::default(),
            layouts: FxHashMap::default(),
            pools: FxHashMap::default(),
            sets: FxHashMap::default(),
            shaders: FxHashMap::default(),
            pipelines: FxHashSet::default(),
            submissions: Vec::new(),
            fence_waits: Vec::new(),
            surface: SurfaceState {
                extent: extent.max(UVec2::ONE),
                format: wgpu::TextureFormat::Bgra8UnormSrgb,
                image_count: image_count.max(1),
                images: Vec::new(),
                next_index: 0,
                acquire_statuses: VecDeque::new(),
                present_statuses: VecDeque::new(),
                presented: Vec::new(),
            },
            faults: Faults::default(),
            stats: HeadlessStats::default(),
        };
        state.make_surface_images();

        Self {
            memory_types,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn default_memory_types() -> Vec<MemoryType> {
        vec![
            MemoryType {
                properties: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                properties: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryType {
                properties: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            },
        ]
    }

    fn all_types_mask(&self) -> u32 {
        match self.memory_types.len() {
            0 => 0,
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }

    // ─── Fault injection ────────────────────────────────────────────────────

    pub fn fail_memory_allocations(&self, count: u32) {
        self.state.lock().faults.failing_memory_allocations = count;
    }

    pub fn fail_descriptor_set_allocations(&self, count: u32) {
        self.state.lock().faults.failing_set_allocations = count;
    }

    pub fn fail_next_fence_wait(&self) {
        self.state.lock().faults.fail_next_fence_wait = true;
    }

    /// Makes the next `end_command_buffer` fail; the buffer stays recording.
    pub fn fail_next_command_buffer_end(&self) {
        self.state.lock().faults.fail_next_end = true;
    }

    pub fn fail_next_command_buffer_reset(&self) {
        self.state.lock().faults.fail_next_reset = true;
    }

    pub fn set_device_lost(&self, lost: bool) {
        self.state.lock().faults.device_lost = lost;
    }

    /// Status reported by an upcoming acquire (FIFO); `Optimal` once drained.
    pub fn queue_acquire_status(&self, status: SurfaceStatus) {
        self.state.lock().surface.acquire_statuses.push_back(status);
    }

    /// Status reported by an upcoming present (FIFO); `Optimal` once drained.
    pub fn queue_present_status(&self, status: SurfaceStatus) {
        self.state.lock().surface.present_statuses.push_back(status);
    }

    // ─── Inspection ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn live(&self) -> LiveObjects {
        let s = self.state.lock();
        LiveObjects {
            buffers: s.buffers.len(),
            images: s.images.len(),
            image_views: s.image_views.len(),
            samplers: s.samplers.len(),
            memory_allocations: s.memory.len(),
            fences: s.fences.len(),
            semaphores: s.semaphores.len(),
            command_buffers: s.command_buffers.len(),
            descriptor_set_layouts: s.layouts.len(),
            descriptor_pools: s.pools.len(),
            descriptor_sets: s.sets.len(),
            shader_modules: s.shaders.len(),
            pipelines: s.pipelines.len(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    /// Every fence waited on, in order.
    #[must_use]
    pub fn fence_wait_log(&self) -> Vec<Fence> {
        self.state.lock().fence_waits.clone()
    }

    #[must_use]
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    #[must_use]
    pub fn commands(&self, cmd: CommandBufferId) -> Vec<Command> {
        self.state
            .lock()
            .command_buffers
            .get(&cmd)
            .map(|r| r.commands.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn recording_state(&self, cmd: CommandBufferId) -> Option<RecordingState> {
        self.state.lock().command_buffers.get(&cmd).map(|r| r.state)
    }

    #[must_use]
    pub fn descriptor_writes(&self, set: DescriptorSetId) -> Vec<DescriptorWrite> {
        self.state
            .lock()
            .sets
            .get(&set)
            .map(|r| r.writes.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_buffer_alive(&self, buffer: NativeBuffer) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }

    #[must_use]
    pub fn is_image_alive(&self, image: NativeImage) -> bool {
        self.state.lock().images.contains_key(&image)
    }

    #[must_use]
    pub fn is_fence_signaled(&self, fence: Fence) -> bool {
        matches!(
            self.state.lock().fences.get(&fence),
            Some(FenceState::Signaled)
        )
    }

    /// Image indices presented so far, in order.
    #[must_use]
    pub fn presented_images(&self) -> Vec<u32> {
        self.state.lock().surface.presented.clone()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// GpuDevice
// ============================================================================

impl GpuDevice for HeadlessDevice {
    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn allocate_memory(&self, size: u64, memory_type: u32) -> DeviceResult<DeviceMemory> {
        let ty = self
            .memory_types
            .get(memory_type as usize)
            .ok_or_else(|| invalid("memory type", u64::from(memory_type)))?;
        let host_visible = ty.properties.contains(MemoryPropertyFlags::HOST_VISIBLE);

        let mut s = self.state.lock();
        s.check_alive()?;
        if s.faults.failing_memory_allocations > 0 {
            s.faults.failing_memory_allocations -= 1;
            return Err(DeviceError::OutOfDeviceMemory);
        }

        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfHostMemory)?;
        let data = if host_visible {
            vec![0u8; len].into_boxed_slice()
        } else {
            Box::default()
        };

        let handle = DeviceMemory(s.next_id());
        s.memory.insert(
            handle,
            MemoryRecord {
                size,
                memory_type,
                data,
                mapped: false,
            },
        );
        s.stats.memory_allocations += 1;
        Ok(handle)
    }

    fn free_memory(&self, memory: DeviceMemory) {
        self.state.lock().memory.remove(&memory);
    }

    fn map_memory(&self, memory: DeviceMemory, offset: u64, size: u64) -> DeviceResult<NonNull<u8>> {
        let mut s = self.state.lock();
        let record = s
            .memory
            .get_mut(&memory)
            .ok_or_else(|| invalid("memory", memory.raw()))?;
        let ty = self.memory_types[record.memory_type as usize];
        if !ty.properties.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(DeviceError::Other("memory is not host visible".into()));
        }
        if offset.saturating_add(size) > record.size {
            return Err(DeviceError::Other(format!(
                "map range {offset}+{size} exceeds allocation of {} bytes",
                record.size
            )));
        }
        record.mapped = true;
        let start = offset as usize;
        NonNull::new(record.data[start..].as_mut_ptr())
            .ok_or_else(|| DeviceError::Other("null mapping".into()))
    }

    fn unmap_memory(&self, memory: DeviceMemory) {
        if let Some(record) = self.state.lock().memory.get_mut(&memory) {
            record.mapped = false;
        }
    }

    fn flush_memory(&self, memory: DeviceMemory, offset: u64, size: u64) -> DeviceResult<()> {
        let s = self.state.lock();
        let record = s
            .memory
            .get(&memory)
            .ok_or_else(|| invalid("memory", memory.raw()))?;
        if !record.mapped || offset.saturating_add(size) > record.size {
            return Err(DeviceError::Other("flush of unmapped range".into()));
        }
        Ok(())
    }

    fn create_buffer(&self, size: u64, _usage: wgpu::BufferUsages) -> DeviceResult<NativeBuffer> {
        let mask = self.all_types_mask();
        let mut s = self.state.lock();
        let handle = NativeBuffer(s.next_id());
        s.buffers.insert(
            handle,
            BufferRecord {
                requirements: MemoryRequirements {
                    size: align_up(size, BUFFER_ALIGNMENT),
                    alignment: BUFFER_ALIGNMENT,
                    memory_type_bits: mask,
                },
                memory: None,
            },
        );
        Ok(handle)
    }

    fn buffer_memory_requirements(&self, buffer: NativeBuffer) -> DeviceResult<MemoryRequirements> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.requirements)
            .ok_or_else(|| invalid("buffer", buffer.raw()))
    }

    fn bind_buffer_memory(
        &self,
        buffer: NativeBuffer,
        memory: DeviceMemory,
        offset: u64,
    ) -> DeviceResult<()> {
        let mut s = self.state.lock();
        let mem_size = s
            .memory
            .get(&memory)
            .map(|m| m.size)
            .ok_or_else(|| invalid("memory", memory.raw()))?;
        let record = s
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| invalid("buffer", buffer.raw()))?;
        if offset + record.requirements.size > mem_size {
            return Err(DeviceError::Other("memory too small for buffer".into()));
        }
        record.memory = Some(memory);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: NativeBuffer) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn create_image(&self, desc: &ImageDesc) -> DeviceResult<NativeImage> {
        if desc.extent.x == 0 || desc.extent.y == 0 {
            return Err(DeviceError::Other(format!(
                "zero-sized image '{}'",
                desc.label
            )));
        }
        let bytes_per_texel = u64::from(desc.format.block_copy_size(None).unwrap_or(4));
        let mut bytes = 0u64;
        for mip in 0..desc.mip_level_count.max(1) {
            let w = u64::from((desc.extent.x >> mip).max(1));
            let h = u64::from((desc.extent.y >> mip).max(1));
            bytes += w * h * bytes_per_texel;
        }
        bytes *= u64::from(desc.sample_count.max(1));

        let mask = self.all_types_mask();
        let mut s = self.state.lock();
        let handle = NativeImage(s.next_id());
        s.images.insert(
            handle,
            ImageRecord {
                requirements: MemoryRequirements {
                    size: align_up(bytes, IMAGE_ALIGNMENT),
                    alignment: IMAGE_ALIGNMENT,
                    memory_type_bits: mask,
                },
                memory: None,
            },
        );
        Ok(handle)
    }

    fn image_memory_requirements(&self, image: NativeImage) -> DeviceResult<MemoryRequirements> {
        self.state
            .lock()
            .images
            .get(&image)
            .map(|i| i.requirements)
            .ok_or_else(|| invalid("image", image.raw()))
    }

    fn bind_image_memory(
        &self,
        image: NativeImage,
        memory: DeviceMemory,
        offset: u64,
    ) -> DeviceResult<()> {
        let mut s = self.state.lock();
        let mem_size = s
            .memory
            .get(&memory)
            .map(|m| m.size)
            .ok_or_else(|| invalid("memory", memory.raw()))?;
        let record = s
            .images
            .get_mut(&image)
            .ok_or_else(|| invalid("image", image.raw()))?;
        if offset + record.requirements.size > mem_size {
            return Err(DeviceError::Other("memory too small for image".into()));
        }
        record.memory = Some(memory);
        Ok(())
    }

    fn create_image_view(
        &self,
        image: NativeImage,
        _format: wgpu::TextureFormat,
    ) -> DeviceResult<NativeImageView> {
        let mut s = self.state.lock();
        let bound = s
            .images
            .get(&image)
            .ok_or_else(|| invalid("image", image.raw()))?
            .memory
            .is_some();
        if !bound {
            return Err(DeviceError::Other("image has no memory bound".into()));
        }
        let view = NativeImageView(s.next_id());
        s.image_views.insert(view, image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: NativeImageView) {
        self.state.lock().image_views.remove(&view);
    }

    fn destroy_image(&self, image: NativeImage) {
        self.state.lock().images.remove(&image);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> DeviceResult<NativeSampler> {
        let mut s = self.state.lock();
        let sampler = NativeSampler(s.next_id());
        s.samplers.insert(sampler);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: NativeSampler) {
        self.state.lock().samplers.remove(&sampler);
    }

    // ─── Synchronization ────────────────────────────────────────────────────

    fn create_fence(&self, signaled: bool) -> DeviceResult<Fence> {
        let mut s = self.state.lock();
        let fence = Fence(s.next_id());
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        s.fences.insert(fence, state);
        Ok(fence)
    }

    fn wait_fence(&self, fence: Fence, timeout: Option<Duration>) -> DeviceResult<()> {
        let mut s = self.state.lock();
        s.check_alive()?;
        s.stats.fence_waits += 1;
        if std::mem::take(&mut s.faults.fail_next_fence_wait) {
            return Err(DeviceError::DeviceLost);
        }
        let state = s
            .fences
            .get_mut(&fence)
            .ok_or_else(|| invalid("fence", fence.raw()))?;
        match *state {
            FenceState::Pending | FenceState::Signaled => {
                *state = FenceState::Signaled;
                s.fence_waits.push(fence);
                Ok(())
            }
            FenceState::Unsignaled => match timeout {
                Some(t) => Err(DeviceError::Timeout(t)),
                None => Err(DeviceError::Other(
                    "unbounded wait on a fence with no pending submission".into(),
                )),
            },
        }
    }

    fn reset_fence(&self, fence: Fence) -> DeviceResult<()> {
        let mut s = self.state.lock();
        let state = s
            .fences
            .get_mut(&fence)
            .ok_or_else(|| invalid("fence", fence.raw()))?;
        if *state == FenceState::Pending {
            return Err(DeviceError::Other("reset of a fence still in use".into()));
        }
        *state = FenceState::Unsignaled;
        Ok(())
    }

    fn destroy_fence(&self, fence: Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn create_semaphore(&self) -> DeviceResult<Semaphore> {
        let mut s = self.state.lock();
        let semaphore = Semaphore(s.next_id());
        s.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    // ─── Command Buffers ────────────────────────────────────────────────────

    fn allocate_command_buffer(&self, level: CommandBufferLevel) -> DeviceResult<CommandBufferId> {
        let mut s = self.state.lock();
        let cmd = CommandBufferId(s.next_id());
        s.command_buffers.insert(
            cmd,
            CommandBufferRecord {
                level,
                state: RecordingState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: CommandBufferId) -> DeviceResult<()> {
        let mut s = self.state.lock();
        let record = s
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| invalid("command buffer", cmd.raw()))?;
        if record.state == RecordingState::Recording {
            return Err(DeviceError::Other("command buffer is already recording".into()));
        }
        record.commands.clear();
        record.state = RecordingState::Recording;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferId) -> DeviceResult<()> {
        let mut s = self.state.lock();
        if std::mem::take(&mut s.faults.fail_next_end) {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        let record = s
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| invalid("command buffer", cmd.raw()))?;
        if record.state != RecordingState::Recording {
            return Err(DeviceError::Other("end without begin".into()));
        }
        record.state = RecordingState::Executable;
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: CommandBufferId) -> DeviceResult<()> {
        let mut s = self.state.lock();
        if std::mem::take(&mut s.faults.fail_next_reset) {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        let record = s
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| invalid("command buffer", cmd.raw()))?;
        record.commands.clear();
        record.state = RecordingState::Initial;
        Ok(())
    }

    fn record(&self, cmd: CommandBufferId, command: Command) {
        let mut s = self.state.lock();
        let in_state = match s.command_buffers.get_mut(&cmd) {
            Some(record) if record.state == RecordingState::Recording => {
                record.commands.push(command);
                true
            }
            _ => false,
        };
        if !in_state {
            s.stats.commands_out_of_state += 1;
        }
    }

    fn free_command_buffer(&self, cmd: CommandBufferId) {
        self.state.lock().command_buffers.remove(&cmd);
    }

    fn submit(&self, info: &SubmitInfo<'_>, fence: Fence) -> DeviceResult<()> {
        let mut s = self.state.lock();
        s.check_alive()?;
        for cmd in info.command_buffers {
            let record = s
                .command_buffers
                .get(cmd)
                .ok_or_else(|| invalid("command buffer", cmd.raw()))?;
            if record.level != CommandBufferLevel::Primary {
                return Err(DeviceError::Other("secondary buffer submitted directly".into()));
            }
            if record.state != RecordingState::Executable {
                return Err(DeviceError::Other("submitted buffer is not executable".into()));
            }
        }
        for sem in info.wait_semaphores.iter().chain(info.signal_semaphores) {
            if !s.semaphores.contains(sem) {
                return Err(invalid("semaphore", sem.raw()));
            }
        }
        if !fence.is_null() {
            let state = s
                .fences
                .get_mut(&fence)
                .ok_or_else(|| invalid("fence", fence.raw()))?;
            if *state != FenceState::Unsignaled {
                return Err(DeviceError::Other("submit with a fence that is not reset".into()));
            }
            *state = FenceState::Pending;
        }
        s.submissions.push(SubmissionRecord {
            command_buffers: info.command_buffers.to_vec(),
            wait_semaphores: info.wait_semaphores.to_vec(),
            signal_semaphores: info.signal_semaphores.to_vec(),
            fence,
        });
        s.stats.submits += 1;
        Ok(())
    }

    // ─── Descriptors ────────────────────────────────────────────────────────

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> DeviceResult<DescriptorSetLayoutId> {
        let mut s = self.state.lock();
        let layout = DescriptorSetLayoutId(s.next_id());
        s.layouts.insert(layout, aggregate_requirement(bindings));
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutId) {
        self.state.lock().layouts.remove(&layout);
    }

    fn create_descriptor_pool(&self, capacity: &PoolCapacity) -> DeviceResult<DescriptorPoolId> {
        let mut s = self.state.lock();
        let pool = DescriptorPoolId(s.next_id());
        s.pools.insert(
            pool,
            PoolRecord {
                capacity: *capacity,
                remaining: *capacity,
                sets: Vec::new(),
            },
        );
        s.stats.descriptor_pools_created += 1;
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolId) -> DeviceResult<()> {
        let mut s = self.state.lock();
        let record = s
            .pools
            .get_mut(&pool)
            .ok_or_else(|| invalid("descriptor pool", pool.raw()))?;
        record.remaining = record.capacity;
        let sets = std::mem::take(&mut record.sets);
        for set in sets {
            s.sets.remove(&set);
        }
        s.stats.descriptor_pool_resets += 1;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolId) {
        let mut s = self.state.lock();
        if let Some(record) = s.pools.remove(&pool) {
            for set in record.sets {
                s.sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolId,
        layout: DescriptorSetLayoutId,
    ) -> DeviceResult<DescriptorSetId> {
        let mut s = self.state.lock();
        let required = *s
            .layouts
            .get(&layout)
            .ok_or_else(|| invalid("descriptor set layout", layout.raw()))?;
        if s.faults.failing_set_allocations > 0 {
            s.faults.failing_set_allocations -= 1;
            return Err(DeviceError::FragmentedPool);
        }
        let set = DescriptorSetId(s.next_id());
        let record = s
            .pools
            .get_mut(&pool)
            .ok_or_else(|| invalid("descriptor pool", pool.raw()))?;
        if !record.remaining.can_allocate(&required) {
            return Err(DeviceError::FragmentedPool);
        }
        record.remaining.consume(&required);
        record.sets.push(set);
        s.sets.insert(
            set,
            SetRecord {
                pool,
                writes: Vec::new(),
            },
        );
        s.stats.descriptor_sets_allocated += 1;
        Ok(set)
    }

    fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite]) {
        let mut s = self.state.lock();
        if let Some(record) = s.sets.get_mut(&set) {
            debug_assert!(!record.pool.is_null());
            for write in writes {
                record.writes.retain(|w| w.binding() != write.binding());
                record.writes.push(*write);
            }
            s.stats.descriptor_set_updates += 1;
        }
    }

    // ─── Shaders & Pipelines ────────────────────────────────────────────────

    fn load_shader_binary(&self, path: &str) -> DeviceResult<ShaderModuleId> {
        if path.is_empty() {
            return Err(DeviceError::Other("empty shader path".into()));
        }
        let mut s = self.state.lock();
        let module = ShaderModuleId(s.next_id());
        s.shaders.insert(module, path.to_owned());
        s.stats.shader_loads += 1;
        Ok(module)
    }

    fn destroy_shader_module(&self, module: ShaderModuleId) {
        self.state.lock().shaders.remove(&module);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> DeviceResult<PipelineId> {
        let mut s = self.state.lock();
        for module in [desc.vertex, desc.fragment] {
            if !s.shaders.contains_key(&module) {
                return Err(invalid("shader module", module.raw()));
            }
        }
        for layout in &desc.set_layouts {
            if !s.layouts.contains_key(layout) {
                return Err(invalid("descriptor set layout", layout.raw()));
            }
        }
        let pipeline = PipelineId(s.next_id());
        s.pipelines.insert(pipeline);
        s.stats.pipelines_created += 1;
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        let mut s = self.state.lock();
        s.check_alive()?;
        for state in s.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
        s.stats.wait_idle_calls += 1;
        Ok(())
    }
}

// ============================================================================
// PresentSurface
// ============================================================================

impl PresentSurface for HeadlessDevice {
    fn acquire_next_image(
        &self,
        _timeout: Option<Duration>,
        signal: Semaphore,
    ) -> DeviceResult<AcquiredImage> {
        let mut s = self.state.lock();
        s.check_alive()?;
        if !s.semaphores.contains(&signal) {
            return Err(invalid("semaphore", signal.raw()));
        }
        s.stats.acquires += 1;
        let status = s
            .surface
            .acquire_statuses
            .pop_front()
            .unwrap_or(SurfaceStatus::Optimal);
        let index = s.surface.next_index;
        if status != SurfaceStatus::OutOfDate {
            s.surface.next_index = (index + 1) % s.surface.image_count;
        }
        Ok(AcquiredImage { index, status })
    }

    fn present_image(&self, index: u32, wait: Semaphore) -> DeviceResult<SurfaceStatus> {
        let mut s = self.state.lock();
        s.check_alive()?;
        if index >= s.surface.image_count {
            return Err(invalid("swapchain image", u64::from(index)));
        }
        if !s.semaphores.contains(&wait) {
            return Err(invalid("semaphore", wait.raw()));
        }
        s.stats.presents += 1;
        s.surface.presented.push(index);
        Ok(s
            .surface
            .present_statuses
            .pop_front()
            .unwrap_or(SurfaceStatus::Optimal))
    }

    fn image(&self, index: u32) -> Option<SurfaceImage> {
        self.state.lock().surface.images.get(index as usize).copied()
    }

    fn image_count(&self) -> u32 {
        self.state.lock().surface.image_count
    }

    fn extent(&self) -> UVec2 {
        self.state.lock().surface.extent
    }

    fn format(&self) -> wgpu::TextureFormat {
        self.state.lock().surface.format
    }

    fn rebuild(&self, extent: UVec2) -> DeviceResult<UVec2> {
        let mut s = self.state.lock();
        s.check_alive()?;
        s.surface.extent = extent.max(UVec2::ONE);
        s.make_surface_images();
        s.stats.surface_rebuilds += 1;
        log::debug!(
            "Headless surface rebuilt at {}x{}",
            s.surface.extent.x,
            s.surface.extent.y
        );
        Ok(s.surface.extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DescriptorKind;

    #[test]
    fn memory_type_lookup_respects_flags() {
        let device = HeadlessDevice::new();
        let buffer = device.create_buffer(100, wgpu::BufferUsages::UNIFORM).unwrap();
        let req = device.buffer_memory_requirements(buffer).unwrap();

        assert_eq!(req.size, 256);
        assert_eq!(
            device.memory_type_for(&req, MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            device.memory_type_for(
                &req,
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
            ),
            Some(1)
        );
        assert_eq!(
            device.memory_type_for(&req, MemoryPropertyFlags::LAZILY_ALLOCATED),
            None
        );
    }

    #[test]
    fn wait_on_pending_fence_signals_it() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let cmd = device
            .allocate_command_buffer(CommandBufferLevel::Primary)
            .unwrap();
        device.begin_command_buffer(cmd).unwrap();
        device.record(cmd, Command::Draw { vertex_count: 3, instance_count: 1 });
        device.end_command_buffer(cmd).unwrap();

        let info = SubmitInfo {
            command_buffers: &[cmd],
            wait_semaphores: &[],
            signal_semaphores: &[],
        };
        device.submit(&info, fence).unwrap();
        assert!(!device.is_fence_signaled(fence));
        assert!(device.reset_fence(fence).is_err());

        device.wait_fence(fence, None).unwrap();
        assert!(device.is_fence_signaled(fence));
        assert_eq!(device.fence_wait_log(), vec![fence]);
        assert_eq!(device.commands(cmd).len(), 1);
    }

    #[test]
    fn unbounded_wait_without_submission_is_an_error() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert!(device.wait_fence(fence, None).is_err());
        assert_eq!(
            device.wait_fence(fence, Some(Duration::from_millis(1))),
            Err(DeviceError::Timeout(Duration::from_millis(1)))
        );
    }

    #[test]
    fn descriptor_pool_enforces_capacity_until_reset() {
        let device = HeadlessDevice::new();
        let layout = device
            .create_descriptor_set_layout(&[LayoutBinding::new(
                0,
                DescriptorKind::UniformBuffer,
                wgpu::ShaderStages::VERTEX,
            )])
            .unwrap();
        let pool = device
            .create_descriptor_pool(&PoolCapacity::new(
                1,
                DescriptorCounts::new().with(DescriptorKind::UniformBuffer, 1),
            ))
            .unwrap();

        device.allocate_descriptor_set(pool, layout).unwrap();
        assert_eq!(
            device.allocate_descriptor_set(pool, layout),
            Err(DeviceError::FragmentedPool)
        );
        device.reset_descriptor_pool(pool).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert_eq!(device.live().descriptor_sets, 1);
    }

    #[test]
    fn host_mapping_is_backed_by_real_bytes() {
        let device = HeadlessDevice::new();
        let memory = device.allocate_memory(512, 1).unwrap();
        let ptr = device.map_memory(memory, 0, 512).unwrap();
        // SAFETY: the allocation is 512 bytes and stays alive for the block.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), 512) };
        bytes[511] = 7;
        assert_eq!(bytes[511], 7);
        device.unmap_memory(memory);

        let device_local = device.allocate_memory(512, 0).unwrap();
        assert!(device.map_memory(device_local, 0, 512).is_err());
    }

    #[test]
    fn scripted_surface_statuses() {
        let device = HeadlessDevice::new();
        let sem = device.create_semaphore().unwrap();
        device.queue_acquire_status(SurfaceStatus::OutOfDate);

        let first = device.acquire_next_image(None, sem).unwrap();
        assert_eq!(first.status, SurfaceStatus::OutOfDate);
        let second = device.acquire_next_image(None, sem).unwrap();
        assert_eq!(second.status, SurfaceStatus::Optimal);
        assert_eq!(second.index, first.index);

        let new_extent = device.rebuild(UVec2::new(0, 10)).unwrap();
        assert_eq!(new_extent, UVec2::new(1, 10));
    }
}
