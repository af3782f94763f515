//! # Sortie Core
//!
//! Foundation types shared by every Sortie crate:
//!
//! - [`device`]: the [`GpuDevice`] / [`PresentSurface`] interfaces, native
//!   handle types, descriptor vocabulary and the in-memory
//!   [`HeadlessDevice`](device::headless::HeadlessDevice)
//! - [`errors`]: [`SortieError`] and the [`Result`] alias
//! - [`settings`]: [`FrameSettings`]

pub mod device;
pub mod errors;
pub mod settings;

pub use device::{DeviceError, GpuDevice, PresentSurface};
pub use errors::{Result, SortieError};
pub use settings::{FrameSettings, MAX_FRAMES_IN_FLIGHT};
