//! Edge-triggered digital signals.
//!
//! [`DigitalSignal`] is a pure state machine: feed it levels, get edges back. It does
//! not care whether the levels come from polling or from a notification stream.
//!
//! [`SignalController`] binds named signals to pins of a [`DigitalPort`] and turns
//! every transient failure (unconfigured pin, lost link, read error) into a logged
//! warning plus a safe default, so the poll loop never aborts on a bad read.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::DigitalPort;

/// Transition observed by [`DigitalSignal::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Level unchanged
    None,
    /// LOW to HIGH
    Rising,
    /// HIGH to LOW
    Falling,
}

/// Level history of one input pin.
#[derive(Debug, Clone)]
pub struct DigitalSignal {
    name: String,
    pin: u8,
    current: bool,
    previous: bool,
}

impl DigitalSignal {
    /// A signal whose history starts at `initial` (no edge pending).
    pub fn new(name: impl Into<String>, pin: u8, initial: bool) -> Self {
        Self {
            name: name.into(),
            pin,
            current: initial,
            previous: initial,
        }
    }

    /// Record a new level and report the transition from the previous one.
    ///
    /// Holding a level reports [`Edge::None`], so a level held HIGH fires once.
    pub fn update(&mut self, level: bool) -> Edge {
        self.previous = self.current;
        self.current = level;
        match (self.previous, self.current) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => Edge::None,
        }
    }

    /// Signal name, e.g. `DO_CAPTURE`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller pin
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Level seen by the last update
    pub fn level(&self) -> bool {
        self.current
    }

    /// Level before the last update
    pub fn previous_level(&self) -> bool {
        self.previous
    }
}

#[derive(Debug, Clone)]
struct OutputSignal {
    name: String,
    level: bool,
}

/// Named input and output pins on one controller.
pub struct SignalController {
    port: Arc<dyn DigitalPort>,
    inputs: BTreeMap<u8, DigitalSignal>,
    outputs: BTreeMap<u8, OutputSignal>,
    disconnect_reported: bool,
}

impl SignalController {
    /// Controller over `port` with no pins set up.
    pub fn new(port: Arc<dyn DigitalPort>) -> Self {
        Self {
            port,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            disconnect_reported: false,
        }
    }

    /// Configure the two inputs and two outputs of the run protocol.
    ///
    /// Outputs are driven LOW as part of setup.
    pub async fn from_config(
        port: Arc<dyn DigitalPort>,
        config: &ControllerConfig,
    ) -> AppResult<Self> {
        let mut controller = Self::new(port);
        controller
            .setup_input("DO_CAPTURE", config.input_pins.do_capture)
            .await?;
        controller
            .setup_input("DO_RUN_COMPLETE", config.input_pins.do_run_complete)
            .await?;
        controller
            .setup_output("DI_RUN", config.output_pins.di_run)
            .await?;
        controller
            .setup_output("DI_CAPTURE_COMPLETE", config.output_pins.di_capture_complete)
            .await?;
        Ok(controller)
    }

    /// Configure `pin` as an input and reset its edge history to the current level.
    pub async fn setup_input(&mut self, name: &str, pin: u8) -> AppResult<()> {
        self.port
            .configure_input(pin)
            .await
            .map_err(|e| self.map_port_error(e))?;
        let initial = match self.port.read(pin).await {
            Ok(level) => level.unwrap_or(false),
            Err(e) => {
                tracing::debug!(pin, error = %e, "No initial level, assuming LOW");
                false
            }
        };
        self.outputs.remove(&pin);
        self.inputs.insert(pin, DigitalSignal::new(name, pin, initial));
        tracing::info!(signal = name, pin, initial, "Input pin set up");
        Ok(())
    }

    /// Configure `pin` as an output and drive it LOW.
    pub async fn setup_output(&mut self, name: &str, pin: u8) -> AppResult<()> {
        self.port
            .configure_output(pin)
            .await
            .map_err(|e| self.map_port_error(e))?;
        self.inputs.remove(&pin);
        self.outputs.insert(
            pin,
            OutputSignal {
                name: name.to_string(),
                level: false,
            },
        );
        self.try_set_level(pin, false).await?;
        tracing::info!(signal = name, pin, "Output pin set up");
        Ok(())
    }

    fn map_port_error(&self, error: anyhow::Error) -> DaqError {
        if self.port.is_connected() {
            DaqError::Serial(error.to_string())
        } else {
            DaqError::ControllerDisconnected
        }
    }

    /// Read an input pin, surfacing every failure.
    ///
    /// A pin the device has not reported yet reads LOW.
    pub async fn try_read(&self, pin: u8) -> AppResult<bool> {
        if !self.inputs.contains_key(&pin) {
            return Err(DaqError::PinNotConfigured {
                pin,
                direction: "input",
            });
        }
        if !self.port.is_connected() {
            return Err(DaqError::ControllerDisconnected);
        }
        let level = self
            .port
            .read(pin)
            .await
            .map_err(|e| self.map_port_error(e))?;
        Ok(level.unwrap_or(false))
    }

    fn report(&mut self, pin: u8, error: &DaqError) {
        match error {
            DaqError::ControllerDisconnected => {
                if !self.disconnect_reported {
                    tracing::warn!(pin, "Controller disconnected, inputs read LOW");
                    self.disconnect_reported = true;
                } else {
                    tracing::debug!(pin, "Controller still disconnected");
                }
            }
            other => tracing::warn!(pin, error = %other, "Digital read failed"),
        }
    }

    async fn sample(&mut self, pin: u8) -> Option<bool> {
        match self.try_read(pin).await {
            Ok(level) => {
                if self.disconnect_reported {
                    tracing::info!(pin, "Controller connection restored");
                    self.disconnect_reported = false;
                }
                Some(level)
            }
            Err(e) => {
                self.report(pin, &e);
                None
            }
        }
    }

    /// Current level of an input pin; LOW on any failure.
    pub async fn read(&mut self, pin: u8) -> bool {
        self.sample(pin).await.unwrap_or(false)
    }

    async fn edge(&mut self, pin: u8) -> Edge {
        // A failed read leaves the history untouched.
        let Some(level) = self.sample(pin).await else {
            return Edge::None;
        };
        let Some(signal) = self.inputs.get_mut(&pin) else {
            return Edge::None;
        };
        let edge = signal.update(level);
        if edge != Edge::None {
            tracing::debug!(signal = signal.name(), pin, ?edge, "Edge detected");
        }
        edge
    }

    /// True exactly once per LOW to HIGH transition.
    ///
    /// Shares history with [`Self::check_falling_edge`]: calling both on the same pin
    /// in one tick consumes the transition in the first call.
    pub async fn check_rising_edge(&mut self, pin: u8) -> bool {
        self.edge(pin).await == Edge::Rising
    }

    /// True exactly once per HIGH to LOW transition.
    pub async fn check_falling_edge(&mut self, pin: u8) -> bool {
        self.edge(pin).await == Edge::Falling
    }

    /// Drive an output pin, surfacing every failure.
    pub async fn try_set_level(&mut self, pin: u8, level: bool) -> AppResult<()> {
        if !self.outputs.contains_key(&pin) {
            return Err(DaqError::PinNotConfigured {
                pin,
                direction: "output",
            });
        }
        if !self.port.is_connected() {
            return Err(DaqError::ControllerDisconnected);
        }
        self.port
            .write(pin, level)
            .await
            .map_err(|e| self.map_port_error(e))?;
        if let Some(output) = self.outputs.get_mut(&pin) {
            output.level = level;
            tracing::debug!(
                signal = %output.name,
                pin,
                level = if level { "HIGH" } else { "LOW" },
                "Output set"
            );
        }
        Ok(())
    }

    /// Drive an output pin; failures are logged.
    pub async fn set_level(&mut self, pin: u8, level: bool) {
        if let Err(e) = self.try_set_level(pin, level).await {
            tracing::warn!(pin, level, error = %e, "Digital write failed");
        }
    }

    /// Drive every owned output LOW. Every pin is attempted even if one fails.
    pub async fn force_outputs_low(&mut self) -> AppResult<()> {
        let pins: Vec<u8> = self.outputs.keys().copied().collect();
        let mut errors = Vec::new();
        for pin in pins {
            if let Err(e) = self.try_set_level(pin, false).await {
                tracing::error!(pin, error = %e, "Failed to drive output LOW");
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }

    /// Last level written to an output pin.
    pub fn output_level(&self, pin: u8) -> Option<bool> {
        self.outputs.get(&pin).map(|o| o.level)
    }

    /// Edge state of an input pin
    pub fn input(&self, pin: u8) -> Option<&DigitalSignal> {
        self.inputs.get(&pin)
    }

    /// Whether the port is still usable
    pub fn is_connected(&self) -> bool {
        self.port.is_connected()
    }

    /// Port identification for logs and reports
    pub fn describe(&self) -> String {
        self.port.describe()
    }

    /// Release the underlying port.
    pub async fn close(&mut self) -> AppResult<()> {
        self.port
            .close()
            .await
            .map_err(|e| DaqError::Serial(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockDigitalPort;
    use tracing_test::traced_test;

    async fn controller_with(port: &Arc<MockDigitalPort>) -> SignalController {
        let mut controller = SignalController::new(port.clone() as Arc<dyn DigitalPort>);
        controller.setup_input("DO_CAPTURE", 6).await.unwrap();
        controller.setup_output("DI_RUN", 2).await.unwrap();
        controller
    }

    #[test]
    fn test_update_reports_each_transition_once() {
        let mut signal = DigitalSignal::new("DO_CAPTURE", 6, false);
        let levels = [false, true, true, true, false, false, true, false];
        let edges: Vec<Edge> = levels.iter().map(|&l| signal.update(l)).collect();
        assert_eq!(
            edges,
            vec![
                Edge::None,
                Edge::Rising,
                Edge::None,
                Edge::None,
                Edge::Falling,
                Edge::None,
                Edge::Rising,
                Edge::Falling,
            ]
        );
        assert!(!signal.level());
        assert!(signal.previous_level());
    }

    #[test]
    fn test_initially_high_does_not_fire() {
        let mut signal = DigitalSignal::new("DO_RUN_COMPLETE", 7, true);
        assert_eq!(signal.update(true), Edge::None);
        assert_eq!(signal.update(false), Edge::Falling);
    }

    #[tokio::test]
    async fn test_rising_edge_once_per_transition() {
        let port = Arc::new(MockDigitalPort::new());
        let mut controller = controller_with(&port).await;

        assert!(!controller.check_rising_edge(6).await);
        port.set_input(6, true);
        assert!(controller.check_rising_edge(6).await);
        assert!(!controller.check_rising_edge(6).await);
        assert!(!controller.check_rising_edge(6).await);
        port.set_input(6, false);
        assert!(!controller.check_rising_edge(6).await);
        port.set_input(6, true);
        assert!(controller.check_rising_edge(6).await);
    }

    #[tokio::test]
    async fn test_setup_resets_history_to_current_level() {
        let port = Arc::new(MockDigitalPort::new());
        port.set_input(6, true);
        let mut controller = controller_with(&port).await;
        // Already HIGH at setup: not an edge.
        assert!(!controller.check_rising_edge(6).await);
        port.set_input(6, false);
        assert!(controller.check_falling_edge(6).await);
    }

    #[tokio::test]
    async fn test_outputs_start_low() {
        let port = Arc::new(MockDigitalPort::new());
        let mut controller = controller_with(&port).await;
        assert_eq!(port.output(2), Some(false));
        controller.set_level(2, true).await;
        assert_eq!(controller.output_level(2), Some(true));
        controller.force_outputs_low().await.unwrap();
        assert_eq!(port.output(2), Some(false));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unconfigured_pin_is_logged_not_fatal() {
        let port = Arc::new(MockDigitalPort::new());
        let mut controller = controller_with(&port).await;

        assert!(!controller.read(9).await);
        assert!(!controller.check_rising_edge(9).await);
        controller.set_level(9, true).await;
        assert!(matches!(
            controller.try_read(9).await,
            Err(DaqError::PinNotConfigured { pin: 9, .. })
        ));
        assert!(logs_contain("Pin 9 is not configured as input"));
        assert!(logs_contain("Pin 9 is not configured as output"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_disconnect_reads_low_and_freezes_history() {
        let port = Arc::new(MockDigitalPort::new());
        let mut controller = controller_with(&port).await;

        port.set_input(6, true);
        port.disconnect();
        assert!(!controller.read(6).await);
        assert!(!controller.check_rising_edge(6).await);
        assert!(matches!(
            controller.try_read(6).await,
            Err(DaqError::ControllerDisconnected)
        ));
        assert!(logs_contain("Controller disconnected"));

        // The transition that happened while disconnected is seen after reconnect.
        port.reconnect();
        assert!(controller.check_rising_edge(6).await);
    }

    #[tokio::test]
    async fn test_force_low_reports_failure_when_disconnected() {
        let port = Arc::new(MockDigitalPort::new());
        let mut controller = controller_with(&port).await;
        controller.setup_output("DI_CAPTURE_COMPLETE", 3).await.unwrap();
        port.disconnect();
        assert!(matches!(
            controller.force_outputs_low().await,
            Err(DaqError::ShutdownFailed(errors)) if errors.len() == 2
        ));
    }
}
