//! Frame Settings
//!
//! Configuration for the frame core: how many frames may be in flight, how
//! large each binding pool block is, and which formats intermediate render
//! targets use.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sortie_core::settings::FrameSettings;
//!
//! // Defaults: double-buffered, 200 sets per pool block, RGBA16F targets
//! let settings = FrameSettings::default();
//!
//! // Triple buffering with statistics every 600 frames
//! let settings = FrameSettings {
//!     frames_in_flight: 3,
//!     log_statistics_every: 600,
//!     ..Default::default()
//! };
//! settings.validate()?;
//! ```

use std::time::Duration;

use crate::device::PoolCapacity;
use crate::errors::{Result, SortieError};

/// Upper bound on [`FrameSettings::frames_in_flight`].
pub const MAX_FRAMES_IN_FLIGHT: u32 = 8;

/// Frame core configuration.
///
/// | Field | Default |
/// |-------|---------|
/// | `frames_in_flight` | 2 |
/// | `binding_pool` | 200 sets; 400 uniform buffers, 400 combined image samplers, 200 sampled images, 100 samplers, 100 storage buffers |
/// | `default_render_target_format` | `Rgba16Float` |
/// | `hdr_format` | `Rgba16Float` |
/// | `acquire_timeout` | `None` (unbounded) |
/// | `log_statistics_every` | 0 (never) |
///
/// The pool numbers are tuning defaults, not contracts.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSettings {
    /// Number of frame slots that may be recorded/executing concurrently.
    pub frames_in_flight: u32,

    /// Capacity of every newly created binding pool block.
    pub binding_pool: PoolCapacity,

    /// Format of render targets registered without an explicit format, and of
    /// the post-process ping/pong targets.
    pub default_render_target_format: wgpu::TextureFormat,

    /// Format of HDR intermediates (bloom mip chain).
    pub hdr_format: wgpu::TextureFormat,

    /// Timeout passed to the surface on image acquire.
    pub acquire_timeout: Option<Duration>,

    /// Log binding allocator statistics every K retired frames; 0 disables.
    pub log_statistics_every: u64,
}

impl FrameSettings {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames_in_flight: 2,
            binding_pool: PoolCapacity::default(),
            default_render_target_format: wgpu::TextureFormat::Rgba16Float,
            hdr_format: wgpu::TextureFormat::Rgba16Float,
            acquire_timeout: None,
            log_statistics_every: 0,
        }
    }

    /// Rejects configurations the frame core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(SortieError::InvalidSettings(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        if self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(SortieError::InvalidSettings(format!(
                "frames_in_flight must be at most {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.binding_pool.max_sets == 0 {
            return Err(SortieError::InvalidSettings(
                "binding_pool.max_sets must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self::new()
    }
}
