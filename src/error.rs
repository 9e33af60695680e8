//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole acquisition
//! stack. Using the `thiserror` crate, it provides one consistent way to describe
//! everything that can go wrong, from configuration mistakes to a controller that
//! dropped off the USB bus halfway through a run.
//!
//! ## Error Hierarchy
//!
//! `DaqError` groups failures the same way the experiment treats them:
//!
//! - **Configuration** (`Config`, `InvalidConfig`): fatal at startup, reported before
//!   any hardware is touched. `InvalidConfig` always names the offending field.
//! - **Resource initialization** (`NoCamerasFound`, `ControllerNotConnected`, `Serial`):
//!   fatal, but the experiment still releases whatever it already acquired.
//! - **Transient** (`PinNotConfigured`, `ControllerDisconnected`, `ExposureSetFailed`,
//!   `FrameGrab`, `Csv`, `Storage`): logged where they happen and replaced by a safe
//!   default, so a single bad read never aborts a run.
//! - **Cancellation** (`Cancelled`): an operator interrupt. Not a failure; it routes
//!   through the same termination path that produces the final report.
//!
//! Hardware capability traits return `anyhow::Result` (see
//! [`crate::hardware::capabilities`]); the scheduler maps those into the variants
//! above at the seam.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but a value is not acceptable.
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        /// Dotted path of the offending field (e.g. `controller.input_pins`).
        field: String,
        /// Human readable explanation.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Access to a pin that was never configured.
    #[error("Pin {pin} is not configured as {direction}")]
    PinNotConfigured {
        /// Pin number.
        pin: u8,
        /// Expected direction ("input" or "output").
        direction: &'static str,
    },

    /// The controller channel is unavailable.
    #[error("Controller disconnected")]
    ControllerDisconnected,

    /// No controller could be opened at startup.
    #[error("Controller not connected: {0}")]
    ControllerNotConnected(String),

    /// Serial transport failure.
    #[error("Serial error: {0}")]
    Serial(String),

    /// Exposure could not be applied; the previous value stays in effect.
    #[error("Failed to set exposure: {0}")]
    ExposureSetFailed(String),

    /// Frame grab failed.
    #[error("Frame grab failed: {0}")]
    FrameGrab(String),

    /// Camera enumeration returned nothing.
    #[error("No cameras found")]
    NoCamerasFound,

    /// Image or table persistence failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Report could not be produced.
    #[error("Report error: {0}")]
    Report(String),

    /// Functionality compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Operator requested termination.
    #[error("Experiment cancelled by operator")]
    Cancelled,

    /// One or more teardown steps failed.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Build an [`DaqError::InvalidConfig`] for `field`.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for the operator-interrupt path.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DaqError::Cancelled)
    }

    /// True for errors that are logged and replaced by a safe default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaqError::PinNotConfigured { .. }
                | DaqError::ControllerDisconnected
                | DaqError::ExposureSetFailed(_)
                | DaqError::FrameGrab(_)
                | DaqError::Csv(_)
                | DaqError::Storage(_)
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
