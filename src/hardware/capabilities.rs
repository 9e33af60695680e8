//! Hardware Capabilities
//!
//! The two hardware seams the acquisition loop talks to:
//!
//! - [`DigitalPort`]: pin-level I/O on the external controller (a Firmata board in
//!   the field, [`crate::hardware::mock::MockDigitalPort`] in tests)
//! - [`FrameSource`]: N synchronized cameras with an exposure policy
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Keeps state behind interior mutability, so every method takes `&self`
//!
//! The scheduler maps `anyhow` failures into [`crate::error::DaqError`] at the call
//! site and decides there whether a failure is transient.

use anyhow::Result;
use async_trait::async_trait;

use crate::hardware::CameraFrame;

/// Capability: Digital pin I/O
///
/// Raw pin primitives of a microcontroller. Edge detection and pin naming live one
/// layer up in [`crate::signal::SignalController`].
///
/// # Contract
/// - Pins must be configured before use
/// - `read` returns `Ok(None)` until the device has reported a level for the pin
/// - `is_connected` turns false once the underlying channel is lost; it never turns
///   back on for the same instance
#[async_trait]
pub trait DigitalPort: Send + Sync {
    /// Configure `pin` as a digital input and enable level reporting
    async fn configure_input(&self, pin: u8) -> Result<()>;

    /// Configure `pin` as a digital output
    async fn configure_output(&self, pin: u8) -> Result<()>;

    /// Latest known level of an input pin
    async fn read(&self, pin: u8) -> Result<Option<bool>>;

    /// Drive an output pin
    async fn write(&self, pin: u8, level: bool) -> Result<()>;

    /// Whether the underlying channel is still usable
    fn is_connected(&self) -> bool;

    /// Release the channel
    async fn close(&self) -> Result<()>;

    /// Human readable identification (port name, firmware version)
    fn describe(&self) -> String {
        "digital port".to_string()
    }
}

/// Auto-exposure behaviour requested from the cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoExposure {
    /// Run one auto-exposure pass, then hold the result
    Once,
    /// Keep adjusting on every frame
    Continuous,
}

/// Capability: Synchronized multi-camera frame source
///
/// # Contract
/// - `initialize` opens every attached camera and returns how many were found
/// - `start_acquisition` starts background acquisition; grabs return the most
///   recently completed frame per camera
/// - `grab_frames` never blocks past the configured grab timeout and returns one
///   frame per camera that delivered in time (empty on total failure), each tagged
///   with its camera index
/// - Exposure values are in microseconds
/// - `close` is idempotent
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Open all cameras; returns the number of cameras found
    async fn initialize(&self) -> Result<usize>;

    /// Start background acquisition
    async fn start_acquisition(&self) -> Result<()>;

    /// Latest frame of each camera that delivered in time
    async fn grab_frames(&self) -> Result<Vec<CameraFrame>>;

    /// Disable auto-exposure and apply `exposure_us` to every camera
    async fn set_manual_exposure(&self, exposure_us: f64) -> Result<()>;

    /// Enable auto-exposure; returns the observed exposure (mean over cameras)
    async fn set_auto_exposure(&self, mode: AutoExposure) -> Result<f64>;

    /// Current exposure of each camera, if it can be read back
    async fn exposures(&self) -> Vec<Option<f64>>;

    /// Number of cameras currently open
    fn camera_count(&self) -> usize;

    /// Stop acquisition and close all cameras
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct LoopbackPort {
        levels: Mutex<HashMap<u8, bool>>,
    }

    #[async_trait]
    impl DigitalPort for LoopbackPort {
        async fn configure_input(&self, _pin: u8) -> Result<()> {
            Ok(())
        }

        async fn configure_output(&self, _pin: u8) -> Result<()> {
            Ok(())
        }

        async fn read(&self, pin: u8) -> Result<Option<bool>> {
            Ok(self.levels.lock().unwrap().get(&pin).copied())
        }

        async fn write(&self, pin: u8, level: bool) -> Result<()> {
            self.levels.lock().unwrap().insert(pin, level);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_digital_port_trait_object() {
        let port: Box<dyn DigitalPort> = Box::new(LoopbackPort {
            levels: Mutex::new(HashMap::new()),
        });

        assert_eq!(port.read(4).await.unwrap(), None);
        port.write(4, true).await.unwrap();
        assert_eq!(port.read(4).await.unwrap(), Some(true));
        assert_eq!(port.describe(), "digital port");
    }
}
