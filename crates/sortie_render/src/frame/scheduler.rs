//! Frame Scheduler
//!
//! Rotates N frame slots so the CPU can record frame `k + 1` while the GPU
//! still executes frame `k`.
//!
//! # Design
//!
//! ```text
//!   slot 0: Idle ─► Recording ─► Submitted ───────── wait ─► Idle ─► ...
//!   slot 1:              Idle ─► Recording ─► Submitted ── wait ─► ...
//!             frame 0          frame 1          frame 2 (reuses slot 0)
//! ```
//!
//! - [`FrameScheduler::wait_slot_finished`] is the only blocking point. It
//!   waits without bound on the fence of the slot's previous submission, then
//!   retires everything that submission kept alive: recorder references,
//!   binding sets, and the fence/semaphore pair.
//! - Slot reuse is gated purely by schedule order: slot `i` is reused `N`
//!   frames after it was submitted.
//! - Submitted frames cannot be cancelled; [`FrameScheduler::wait_device_idle`]
//!   is the only way to force completion.

use std::sync::Arc;

use smallvec::SmallVec;
use sortie_core::device::{CommandBufferId, CommandBufferLevel, GpuDevice, Semaphore, SubmitInfo};
use sortie_core::errors::{Result, SortieError};
use sortie_core::settings::FrameSettings;

use super::{CommandRecorder, FrameSlot, OnAirInfo, SlotState, SyncObjectPool};
use crate::binding::BindingSetAllocator;
use crate::resources::ResourceManager;

pub struct FrameScheduler {
    device: Arc<dyn GpuDevice>,
    slots: Vec<FrameSlot>,
    current: usize,
    sync: SyncObjectPool,
    /// Reset primary recorders ready for reuse.
    primary_pool: Vec<CommandRecorder>,
    /// Reset secondary recorders ready for reuse.
    secondary_pool: Vec<CommandRecorder>,
    frame_count: u64,
    retired_frames: u64,
    log_statistics_every: u64,
    is_shut_down: bool,
}

impl FrameScheduler {
    /// Creates `settings.frames_in_flight` slots, each with a begun primary
    /// recorder, a binding allocator and an image-ready semaphore.
    pub fn new(device: Arc<dyn GpuDevice>, settings: &FrameSettings) -> Result<Self> {
        settings.validate()?;
        let count = settings.frames_in_flight as usize;

        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            let mut recorder = CommandRecorder::new(Arc::clone(&device), CommandBufferLevel::Primary)?;
            recorder.begin()?;
            let image_ready = device.create_semaphore()?;
            slots.push(FrameSlot {
                index,
                recorder,
                bindings: BindingSetAllocator::new(Arc::clone(&device), settings.binding_pool),
                image_ready,
                state: SlotState::Idle,
                in_flight: None,
                pending_secondaries: Vec::new(),
                retire_count: 0,
            });
        }

        log::info!("Frame scheduler ready: {count} frames in flight");

        Ok(Self {
            sync: SyncObjectPool::new(Arc::clone(&device)),
            device,
            slots,
            current: 0,
            primary_pool: Vec::new(),
            secondary_pool: Vec::new(),
            frame_count: 0,
            retired_frames: 0,
            log_statistics_every: settings.log_statistics_every,
            is_shut_down: false,
        })
    }

    // ========================================================================
    // Accessors (never block)
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// # Panics
    ///
    /// After [`shutdown`](Self::shutdown), which removes every slot.
    #[inline]
    #[must_use]
    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    #[inline]
    pub fn current_slot_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// Primary recorder of the current slot.
    #[inline]
    pub fn recording_buffer(&mut self) -> &mut CommandRecorder {
        &mut self.slots[self.current].recorder
    }

    /// Binding allocator of the current slot.
    #[inline]
    pub fn binding_allocator(&mut self) -> &mut BindingSetAllocator {
        &mut self.slots[self.current].bindings
    }

    #[inline]
    #[must_use]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Frames submitted so far.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Submissions of slot `index` retired so far; 0 for unknown slots.
    #[must_use]
    pub fn retire_count(&self, index: usize) -> u64 {
        self.slots.get(index).map_or(0, FrameSlot::retire_count)
    }

    #[must_use]
    pub fn sync_pool(&self) -> &SyncObjectPool {
        &self.sync
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }

    // ========================================================================
    // Frame lifecycle
    // ========================================================================

    /// Waits until the current slot is free, then marks it `Recording`.
    pub fn begin_frame(&mut self, resources: &mut ResourceManager) -> Result<&mut FrameSlot> {
        self.ensure_running()?;
        let index = self.current;
        self.wait_slot_finished(index, resources)?;
        let slot = &mut self.slots[index];
        slot.state = SlotState::Recording;
        Ok(slot)
    }

    /// Blocks until slot `index`'s previous submission has finished on the
    /// GPU and retires it. No-op when the slot is not in flight.
    ///
    /// A failed wait is fatal and leaves the in-flight record untouched.
    /// Once the fence has signalled the slot is always retired; a recorder
    /// that fails to reset is dropped and the first such error is returned.
    ///
    /// # Panics
    ///
    /// If `index >= frames_in_flight()`.
    pub fn wait_slot_finished(&mut self, index: usize, resources: &mut ResourceManager) -> Result<()> {
        let slot = &mut self.slots[index];
        let Some(fence) = slot.in_flight.as_ref().map(OnAirInfo::finished_fence) else {
            return Ok(());
        };

        if let Err(source) = self.device.wait_fence(fence, None) {
            log::error!("Fence wait for frame slot {index} failed: {source}");
            return Err(SortieError::FenceWait { slot: index, source });
        }
        self.device.reset_fence(fence)?;

        let Some(info) = slot.in_flight.take() else {
            return Ok(());
        };
        let OnAirInfo {
            mut primary,
            secondaries,
            frame_number,
            render_finished,
            finished_fence,
            ..
        } = info;

        self.sync.free_fence(finished_fence);
        self.sync.free_semaphore(render_finished);

        let mut released = primary.release_references(resources);
        let mut reset = primary.reset();
        if reset.is_ok() {
            self.primary_pool.push(primary);
        }
        for mut secondary in secondaries {
            released += secondary.release_references(resources);
            match secondary.reset() {
                Ok(()) => self.secondary_pool.push(secondary),
                Err(e) => {
                    if reset.is_ok() {
                        reset = Err(e);
                    }
                }
            }
        }

        slot.bindings.reset_pool();
        let destroyed = resources.garbage_collect();

        slot.state = SlotState::Idle;
        slot.retire_count += 1;
        self.retired_frames += 1;
        log::debug!(
            "Retired frame {frame_number} in slot {index}: {released} references released, {destroyed} resources destroyed"
        );

        if self.log_statistics_every > 0 && self.retired_frames % self.log_statistics_every == 0 {
            log::info!("Frame statistics after {} retired frames:", self.retired_frames);
            slot.bindings.log_statistics();
        }

        if let Err(e) = &reset {
            log::error!("Command buffer reset failed while retiring slot {index}: {e}");
        }
        reset.map_err(Into::into)
    }

    /// Records a secondary command buffer for the current frame.
    ///
    /// The recorder comes from the secondary pool (or is allocated), is begun,
    /// handed to `record`, ended and queued for execution by the primary at
    /// submit time.
    pub fn record_secondary<R>(
        &mut self,
        resources: &mut ResourceManager,
        record: impl FnOnce(&mut CommandRecorder, &mut ResourceManager) -> R,
    ) -> Result<R> {
        self.ensure_running()?;
        let index = self.current;
        let state = self.slots[index].state;
        if state != SlotState::Recording {
            return Err(SortieError::SlotState {
                slot: index,
                expected: SlotState::Recording.name(),
                actual: state.name(),
            });
        }

        let mut recorder = match self.secondary_pool.pop() {
            Some(recorder) => recorder,
            None => CommandRecorder::new(Arc::clone(&self.device), CommandBufferLevel::Secondary)?,
        };
        recorder.begin()?;
        let out = record(&mut recorder, resources);
        recorder.end()?;

        self.slots[index].pending_secondaries.push(recorder);
        Ok(out)
    }

    /// Submits the current slot and advances to the next one.
    ///
    /// Queued secondaries are executed into the primary recorder, which is
    /// then ended and submitted waiting on `wait_semaphore`. The returned
    /// semaphore signals when rendering finishes. Submission failure is fatal.
    pub fn submit_and_advance(&mut self, wait_semaphore: Option<Semaphore>) -> Result<Semaphore> {
        self.ensure_running()?;
        let index = self.current;
        let state = self.slots[index].state;
        if state != SlotState::Recording {
            return Err(SortieError::SlotState {
                slot: index,
                expected: SlotState::Recording.name(),
                actual: state.name(),
            });
        }

        let mut fresh = self.take_primary()?;
        let fence = self.sync.acquire_fence()?;
        let render_finished = self.sync.acquire_semaphore()?;

        let slot = &mut self.slots[index];
        let secondaries = std::mem::take(&mut slot.pending_secondaries);
        let handles: SmallVec<[CommandBufferId; 8]> =
            secondaries.iter().map(CommandRecorder::handle).collect();
        slot.recorder.execute_secondary(&handles);

        let submitted = slot.recorder.end().map_err(SortieError::from).and_then(|()| {
            let waits: SmallVec<[Semaphore; 1]> = wait_semaphore.into_iter().collect();
            let submit = SubmitInfo {
                command_buffers: &[slot.recorder.handle()],
                wait_semaphores: &waits,
                signal_semaphores: &[render_finished],
            };
            self.device.submit(&submit, fence).map_err(SortieError::Submit)
        });
        if let Err(e) = submitted {
            log::error!("Submitting frame {} failed: {e}", self.frame_count);
            slot.pending_secondaries = secondaries;
            self.sync.free_fence(fence);
            self.sync.free_semaphore(render_finished);
            if fresh.reset().is_ok() {
                self.primary_pool.push(fresh);
            }
            return Err(e);
        }

        let primary = std::mem::replace(&mut slot.recorder, fresh);
        slot.in_flight = Some(OnAirInfo {
            primary,
            secondaries,
            frame_number: self.frame_count,
            wait_semaphore,
            render_finished,
            finished_fence: fence,
        });
        slot.state = SlotState::Submitted;

        self.frame_count += 1;
        self.current = (index + 1) % self.slots.len();
        Ok(render_finished)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down {
            return Err(SortieError::ShutDown);
        }
        Ok(())
    }

    /// A begun primary recorder, recycled when possible.
    fn take_primary(&mut self) -> Result<CommandRecorder> {
        let mut recorder = match self.primary_pool.pop() {
            Some(recorder) => recorder,
            None => CommandRecorder::new(Arc::clone(&self.device), CommandBufferLevel::Primary)?,
        };
        recorder.begin()?;
        Ok(recorder)
    }

    /// Retires every slot, then waits for the whole device.
    pub fn wait_device_idle(&mut self, resources: &mut ResourceManager) -> Result<()> {
        for index in 0..self.slots.len() {
            self.wait_slot_finished(index, resources)?;
        }
        self.device.wait_idle()?;
        Ok(())
    }

    /// Drains all work and releases every object the scheduler owns.
    ///
    /// The scheduler has no slots afterwards.
    pub fn shutdown(&mut self, resources: &mut ResourceManager) -> Result<()> {
        if self.is_shut_down {
            return Ok(());
        }
        self.wait_device_idle(resources)?;

        for mut slot in self.slots.drain(..) {
            slot.recorder.release_references(resources);
            for mut secondary in slot.pending_secondaries.drain(..) {
                secondary.release_references(resources);
            }
            slot.bindings.shutdown();
            self.device.destroy_semaphore(slot.image_ready);
        }
        self.primary_pool.clear();
        self.secondary_pool.clear();
        self.sync.destroy_all();
        self.current = 0;
        self.is_shut_down = true;

        let destroyed = resources.garbage_collect();
        log::info!(
            "Frame scheduler shut down after {} frames ({destroyed} resources collected)",
            self.frame_count
        );
        Ok(())
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if self.is_shut_down {
            return;
        }
        if self.slots.iter().any(FrameSlot::is_in_flight) {
            log::warn!("Frame scheduler dropped with frames in flight; waiting for the device");
            if let Err(e) = self.device.wait_idle() {
                log::error!("wait_idle during scheduler drop failed: {e}");
            }
        }
        for slot in self.slots.drain(..) {
            if let Some(info) = slot.in_flight {
                self.device.destroy_fence(info.finished_fence);
                self.device.destroy_semaphore(info.render_finished);
            }
            self.device.destroy_semaphore(slot.image_ready);
        }
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("frames_in_flight", &self.slots.len())
            .field("current", &self.current)
            .field("frame_count", &self.frame_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_core::device::headless::HeadlessDevice;

    fn scheduler(n: u32) -> (Arc<HeadlessDevice>, ResourceManager, FrameScheduler) {
        let device = Arc::new(HeadlessDevice::new());
        let rm = ResourceManager::new(device.clone());
        let settings = FrameSettings {
            frames_in_flight: n,
            ..Default::default()
        };
        let sched = FrameScheduler::new(device.clone(), &settings).unwrap();
        (device, rm, sched)
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let settings = FrameSettings {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(
            FrameScheduler::new(device, &settings),
            Err(SortieError::InvalidSettings(_))
        ));
    }

    #[test]
    fn submit_requires_recording_state() {
        let (_device, _rm, mut sched) = scheduler(2);
        let err = sched.submit_and_advance(None).unwrap_err();
        assert!(matches!(
            err,
            SortieError::SlotState {
                slot: 0,
                expected: "recording",
                actual: "idle"
            }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn submit_advances_and_marks_in_flight() {
        let (device, mut rm, mut sched) = scheduler(2);
        sched.begin_frame(&mut rm).unwrap();
        sched.recording_buffer().draw_fullscreen();
        sched.submit_and_advance(None).unwrap();

        assert_eq!(sched.current_index(), 1);
        assert_eq!(sched.frame_count(), 1);
        let slot0 = sched.slot(0).unwrap();
        assert_eq!(slot0.state(), SlotState::Submitted);
        assert!(slot0.is_in_flight());
        assert_eq!(slot0.in_flight().unwrap().frame_number(), 0);
        assert_eq!(device.stats().submits, 1);
        // Fresh primary already begun for the slot's next use.
        assert!(slot0.recorder().is_recording());
    }

    #[test]
    fn wait_on_idle_slot_is_noop() {
        let (device, mut rm, mut sched) = scheduler(3);
        sched.wait_slot_finished(2, &mut rm).unwrap();
        assert_eq!(device.stats().fence_waits, 0);
        assert_eq!(sched.retire_count(2), 0);
    }

    #[test]
    fn sync_objects_are_recycled() {
        let (_device, mut rm, mut sched) = scheduler(2);
        for _ in 0..10 {
            sched.begin_frame(&mut rm).unwrap();
            sched.submit_and_advance(None).unwrap();
        }
        assert_eq!(sched.sync_pool().created_fences(), 2);
        assert_eq!(sched.sync_pool().created_semaphores(), 2);
    }

    #[test]
    fn shutdown_releases_everything() {
        let (device, mut rm, mut sched) = scheduler(2);
        for _ in 0..3 {
            sched.begin_frame(&mut rm).unwrap();
            sched
                .record_secondary(&mut rm, |rec, _| rec.draw(3, 1))
                .unwrap();
            sched.submit_and_advance(None).unwrap();
        }
        sched.shutdown(&mut rm).unwrap();
        drop(sched);

        let live = device.live();
        assert_eq!(live.command_buffers, 0);
        assert_eq!(live.fences, 0);
        assert_eq!(live.semaphores, 0);
        assert_eq!(live.descriptor_pools, 0);
    }
}
