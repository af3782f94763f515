//! Error Types
//!
//! This module defines the error type used by the frame core.
//!
//! # Overview
//!
//! [`SortieError`] covers the failures that must reach the top-level frame
//! loop:
//! - synchronization failures (fence wait, queue submit)
//! - presentation failures
//! - invalid configuration
//!
//! Resource exhaustion is not an error: allocation APIs return
//! `Option` and log. Surface health (`Suboptimal`, `OutOfDate`) is a status
//! routed into the rebuild path.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sortie_core::errors::{Result, SortieError};
//!
//! fn frame() -> Result<()> {
//!     // Operations that may fail return Result
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::device::DeviceError;

/// The main error type for the frame core.
#[derive(Error, Debug)]
pub enum SortieError {
    // ========================================================================
    // Device Errors
    // ========================================================================
    /// A device call failed outside the frame-critical paths.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    // ========================================================================
    // Synchronization Errors
    // ========================================================================
    /// Waiting for a frame slot's fence failed. The slot's in-flight record
    /// is left intact.
    #[error("Fence wait failed for frame slot {slot}: {source}")]
    FenceWait {
        /// Index of the frame slot being waited on
        slot: usize,
        /// Underlying device failure
        source: DeviceError,
    },

    /// Queue submission failed.
    #[error("Queue submission failed: {0}")]
    Submit(DeviceError),

    // ========================================================================
    // Presentation Errors
    // ========================================================================
    /// Presenting or acquiring a surface image failed with a device error.
    #[error("Presentation failed: {0}")]
    Present(DeviceError),

    // ========================================================================
    // Configuration & State Errors
    // ========================================================================
    /// Settings rejected by validation.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// An operation found a frame slot in the wrong state.
    #[error("Frame slot {slot} is {actual}, expected {expected}")]
    SlotState {
        slot: usize,
        expected: &'static str,
        actual: &'static str,
    },

    /// The frame loop was used after `shutdown`.
    #[error("Frame loop is shut down")]
    ShutDown,
}

impl SortieError {
    /// Whether the frame loop must stop.
    ///
    /// Everything except a settings, slot-state or use-after-shutdown
    /// mistake is fatal: the GPU state can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidSettings(_) | Self::SlotState { .. } | Self::ShutDown
        )
    }
}

/// Alias for `Result<T, SortieError>`.
pub type Result<T> = std::result::Result<T, SortieError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SortieError::Submit(DeviceError::DeviceLost).is_fatal());
        assert!(
            SortieError::FenceWait {
                slot: 1,
                source: DeviceError::DeviceLost
            }
            .is_fatal()
        );
        assert!(!SortieError::InvalidSettings("n".into()).is_fatal());
        assert!(!SortieError::ShutDown.is_fatal());
    }

    #[test]
    fn device_errors_convert() {
        let err: SortieError = DeviceError::OutOfHostMemory.into();
        assert!(matches!(err, SortieError::Device(DeviceError::OutOfHostMemory)));
        assert_eq!(err.to_string(), "Device error: out of host memory");
    }
}
