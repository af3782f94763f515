use sortie_core::device::{Fence, Semaphore};

use super::CommandRecorder;
use crate::binding::BindingSetAllocator;

/// Lifecycle of a frame slot: `Idle → Recording → Submitted → (wait) → Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

impl SlotState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Submitted => "submitted",
        }
    }
}

/// Everything a submitted frame needs kept alive until its fence signals.
pub struct OnAirInfo {
    pub(crate) primary: CommandRecorder,
    pub(crate) secondaries: Vec<CommandRecorder>,
    pub(crate) frame_number: u64,
    pub(crate) wait_semaphore: Option<Semaphore>,
    pub(crate) render_finished: Semaphore,
    pub(crate) finished_fence: Fence,
}

impl OnAirInfo {
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[must_use]
    pub fn primary(&self) -> &CommandRecorder {
        &self.primary
    }

    #[must_use]
    pub fn secondaries(&self) -> &[CommandRecorder] {
        &self.secondaries
    }

    #[must_use]
    pub fn wait_semaphore(&self) -> Option<Semaphore> {
        self.wait_semaphore
    }

    #[must_use]
    pub fn render_finished(&self) -> Semaphore {
        self.render_finished
    }

    #[must_use]
    pub fn finished_fence(&self) -> Fence {
        self.finished_fence
    }
}

/// One of the N rotating per-frame contexts.
pub struct FrameSlot {
    pub(crate) index: usize,
    pub(crate) recorder: CommandRecorder,
    pub(crate) bindings: BindingSetAllocator,
    pub(crate) image_ready: Semaphore,
    pub(crate) state: SlotState,
    pub(crate) in_flight: Option<OnAirInfo>,
    /// Secondary recordings queued for the frame being recorded.
    pub(crate) pending_secondaries: Vec<CommandRecorder>,
    pub(crate) retire_count: u64,
}

impl FrameSlot {
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The primary recorder of the frame being recorded in this slot.
    #[inline]
    #[must_use]
    pub fn recorder(&self) -> &CommandRecorder {
        &self.recorder
    }

    #[inline]
    pub fn recorder_mut(&mut self) -> &mut CommandRecorder {
        &mut self.recorder
    }

    #[inline]
    #[must_use]
    pub fn bindings(&self) -> &BindingSetAllocator {
        &self.bindings
    }

    #[inline]
    pub fn bindings_mut(&mut self) -> &mut BindingSetAllocator {
        &mut self.bindings
    }

    /// Recorder and binding allocator borrowed together.
    #[inline]
    pub fn split_mut(&mut self) -> (&mut CommandRecorder, &mut BindingSetAllocator) {
        (&mut self.recorder, &mut self.bindings)
    }

    /// Semaphore signalled by the surface when this slot's image is ready.
    #[inline]
    #[must_use]
    pub fn image_ready(&self) -> Semaphore {
        self.image_ready
    }

    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> Option<&OnAirInfo> {
        self.in_flight.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    #[must_use]
    pub fn pending_secondary_count(&self) -> usize {
        self.pending_secondaries.len()
    }

    /// How many submissions of this slot have been retired.
    #[inline]
    #[must_use]
    pub fn retire_count(&self) -> u64 {
        self.retire_count
    }
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight.is_some())
            .field("retire_count", &self.retire_count)
            .finish_non_exhaustive()
    }
}
