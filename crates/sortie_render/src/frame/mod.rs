//! Frames in flight: command recording, slot rotation and synchronization.

mod recorder;
mod scheduler;
mod slot;
mod sync;

pub use recorder::{CommandRecorder, RecorderId, RecorderState};
pub use scheduler::FrameScheduler;
pub use slot::{FrameSlot, OnAirInfo, SlotState};
pub use sync::SyncObjectPool;
