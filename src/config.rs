//! Experiment configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (e.g. `config/experiment.toml`)
//! 2. Environment variables prefixed with `DIC_DAQ_`, nested with `__`
//!    (e.g. `DIC_DAQ_TIMING__POLL_INTERVAL_MS=5`)
//!
//! Loading only checks shape. [`ExperimentConfig::validate`] must run before any
//! hardware is touched; every failure names the offending field.
//!
//! # Example
//! ```no_run
//! use dic_daq::config::ExperimentConfig;
//!
//! let config = ExperimentConfig::load_from("config/experiment.toml")?;
//! config.validate()?;
//! println!("Experiment: {}", config.experiment_name);
//! # Ok::<(), dic_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level experiment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Name used for the output folder and the capture log file
    pub experiment_name: String,
    /// Root folder for all experiment output
    pub output_folder: PathBuf,
    /// Number of samples visited per run
    pub number_of_samples: i64,
    /// Interval length in minutes (meaning depends on `interval_calculation_mode`)
    pub interval_minutes: f64,
    /// Interval accounting policy. Required: there is no default.
    pub interval_calculation_mode: IntervalPolicy,
    /// Number of runs to perform, `-1` for unbounded
    #[serde(default = "default_total_runs")]
    pub total_runs: i64,
    /// Power cameras down during breaks
    #[serde(default = "default_true")]
    pub turn_off_cameras_between_runs: bool,
    /// Camera settings
    pub camera: CameraConfig,
    /// Controller (microcontroller) settings
    pub controller: ControllerConfig,
    /// Poll and handshake timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// How the break between runs is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalPolicy {
    /// Run starts are `interval` apart; a long run shortens the following break.
    ConstantInterval,
    /// Every break lasts `interval`, whatever the run length.
    ConstantBreak,
}

impl std::fmt::Display for IntervalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntervalPolicy::ConstantInterval => write!(f, "constant_interval"),
            IntervalPolicy::ConstantBreak => write!(f, "constant_break"),
        }
    }
}

/// Exposure policy, selected once per experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureMode {
    /// Fixed exposure for the whole experiment
    Manual,
    /// Per-sample exposure learned on first capture, then held fixed
    SetOnce,
    /// Camera auto-exposes every frame
    Continuous,
}

impl std::fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExposureMode::Manual => write!(f, "Manual"),
            ExposureMode::SetOnce => write!(f, "SetOnce"),
            ExposureMode::Continuous => write!(f, "Continuous"),
        }
    }
}

/// Camera settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Exposure time in microseconds (required for `Manual`)
    #[serde(default)]
    pub exposure_time: Option<f64>,
    /// Exposure policy
    pub exposure_mode: ExposureMode,
    /// Maximum time a grab may block the scheduler
    #[serde(default = "default_grab_timeout")]
    pub grab_timeout_ms: u64,
    /// Number of cameras in the simulated rig (`--simulate`)
    #[serde(default = "default_simulated_cameras")]
    pub simulated_cameras: usize,
}

/// Controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Serial device path (e.g. `/dev/ttyACM0`, `COM3`)
    #[serde(default)]
    pub port: Option<String>,
    /// Scan serial ports for a known USB vendor instead of using `port`
    #[serde(default)]
    pub auto_detect_port: bool,
    /// Serial baud rate (StandardFirmata uses 57600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// USB vendor IDs accepted by auto-detection
    #[serde(default = "default_vendor_ids")]
    pub usb_vendor_ids: Vec<u16>,
    /// Time to let the board reset after the port is opened
    #[serde(default = "default_board_setup_wait")]
    pub board_setup_wait_ms: u64,
    /// Pins read from the controller
    pub input_pins: InputPins,
    /// Pins driven towards the controller
    pub output_pins: OutputPins,
}

/// Controller input pin mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InputPins {
    /// Rising edge: a sample is in position
    #[serde(rename = "DO_CAPTURE")]
    pub do_capture: u8,
    /// Held HIGH: the positioning pass is finished
    #[serde(rename = "DO_RUN_COMPLETE")]
    pub do_run_complete: u8,
}

/// Controller output pin mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutputPins {
    /// HIGH while a run is active
    #[serde(rename = "DI_RUN")]
    pub di_run: u8,
    /// Pulsed HIGH to acknowledge a capture
    #[serde(rename = "DI_CAPTURE_COMPLETE")]
    pub di_capture_complete: u8,
}

/// Poll and handshake timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Run poll loop tick
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Break wait tick
    #[serde(default = "default_break_poll_interval")]
    pub break_poll_interval_ms: u64,
    /// How long CAPTURE_COMPLETE is held HIGH
    #[serde(default = "default_handshake_settle")]
    pub handshake_settle_ms: u64,
    /// Reinitialize powered-down cameras once this many seconds remain in a break
    #[serde(default = "default_reinit_threshold")]
    pub reinit_threshold_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact, json
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_total_runs() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    2448
}

fn default_height() -> u32 {
    2048
}

fn default_grab_timeout() -> u64 {
    5000
}

fn default_simulated_cameras() -> usize {
    2
}

fn default_baud_rate() -> u32 {
    57600
}

fn default_vendor_ids() -> Vec<u16> {
    // Arduino LLC, Arduino SA
    vec![0x2341, 0x2A03]
}

fn default_board_setup_wait() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_break_poll_interval() -> u64 {
    1000
}

fn default_handshake_settle() -> u64 {
    1000
}

fn default_reinit_threshold() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            break_poll_interval_ms: default_break_poll_interval(),
            handshake_settle_ms: default_handshake_settle(),
            reinit_threshold_secs: default_reinit_threshold(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TimingConfig {
    /// Run poll tick as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Break wait tick as a `Duration`
    pub fn break_poll_interval(&self) -> Duration {
        Duration::from_millis(self.break_poll_interval_ms)
    }

    /// Handshake settle time as a `Duration`
    pub fn handshake_settle(&self) -> Duration {
        Duration::from_millis(self.handshake_settle_ms)
    }

    /// Reinit threshold as a `Duration`
    pub fn reinit_threshold(&self) -> Duration {
        Duration::from_secs(self.reinit_threshold_secs)
    }
}

impl ExperimentConfig {
    /// Load configuration from a specific file path, with `DIC_DAQ_` env overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DaqError::invalid_config(
                "config",
                format!("configuration file {} does not exist", path.display()),
            ));
        }
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DIC_DAQ_").split("__"))
            .extract()
            .map_err(DaqError::from)
    }

    /// Parse configuration from a TOML string (no env overrides)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(DaqError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if self.experiment_name.trim().is_empty() {
            return Err(DaqError::invalid_config(
                "experiment_name",
                "must not be empty",
            ));
        }

        if self.number_of_samples <= 0 {
            return Err(DaqError::invalid_config(
                "number_of_samples",
                format!("must be positive, got {}", self.number_of_samples),
            ));
        }

        if !self.interval_minutes.is_finite() || self.interval_minutes <= 0.0 {
            return Err(DaqError::invalid_config(
                "interval_minutes",
                format!("must be positive, got {}", self.interval_minutes),
            ));
        }

        if self.total_runs == 0 || self.total_runs < -1 {
            return Err(DaqError::invalid_config(
                "total_runs",
                format!("must be -1 (unbounded) or positive, got {}", self.total_runs),
            ));
        }

        if self.camera.exposure_mode == ExposureMode::Manual {
            match self.camera.exposure_time {
                Some(t) if t.is_finite() && t > 0.0 => {}
                Some(t) => {
                    return Err(DaqError::invalid_config(
                        "camera.exposure_time",
                        format!("must be positive in Manual mode, got {t}"),
                    ))
                }
                None => {
                    return Err(DaqError::invalid_config(
                        "camera.exposure_time",
                        "required when exposure_mode = \"Manual\"",
                    ))
                }
            }
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(DaqError::invalid_config(
                "camera.width",
                "frame dimensions must be non-zero",
            ));
        }

        if self.camera.simulated_cameras == 0 {
            return Err(DaqError::invalid_config(
                "camera.simulated_cameras",
                "must be at least 1",
            ));
        }

        if !self.controller.auto_detect_port && self.controller.port.is_none() {
            return Err(DaqError::invalid_config(
                "controller.port",
                "required unless auto_detect_port = true",
            ));
        }

        if self.timing.poll_interval_ms == 0 {
            return Err(DaqError::invalid_config(
                "timing.poll_interval_ms",
                "must be positive",
            ));
        }

        if self.timing.break_poll_interval_ms == 0 {
            return Err(DaqError::invalid_config(
                "timing.break_poll_interval_ms",
                "must be positive",
            ));
        }

        let pins = [
            ("controller.input_pins.DO_CAPTURE", self.controller.input_pins.do_capture),
            (
                "controller.input_pins.DO_RUN_COMPLETE",
                self.controller.input_pins.do_run_complete,
            ),
            ("controller.output_pins.DI_RUN", self.controller.output_pins.di_run),
            (
                "controller.output_pins.DI_CAPTURE_COMPLETE",
                self.controller.output_pins.di_capture_complete,
            ),
        ];
        let mut seen = HashSet::new();
        for (field, pin) in pins {
            if !seen.insert(pin) {
                return Err(DaqError::invalid_config(
                    field,
                    format!("pin {pin} is assigned more than once"),
                ));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(DaqError::invalid_config(
                "logging.level",
                format!(
                    "'{}' is not one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(DaqError::invalid_config(
                "logging.format",
                format!(
                    "'{}' is not one of: {}",
                    self.logging.format,
                    valid_formats.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Validated sample count
    pub fn num_samples(&self) -> usize {
        usize::try_from(self.number_of_samples).unwrap_or(0)
    }

    /// Run budget: `None` when unbounded
    pub fn run_budget(&self) -> Option<u64> {
        u64::try_from(self.total_runs).ok()
    }

    /// Interval as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_minutes.max(0.0) * 60.0)
    }

    /// Experiment base folder: `<output_folder>/<experiment_name>`
    pub fn base_folder(&self) -> PathBuf {
        self.output_folder.join(&self.experiment_name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_TOML: &str = r#"
        experiment_name = "mycelium_panel"
        output_folder = "data"
        number_of_samples = 3
        interval_minutes = 30
        interval_calculation_mode = "constant_interval"
        total_runs = -1

        [camera]
        exposure_mode = "SetOnce"

        [controller]
        port = "/dev/ttyACM0"

        [controller.input_pins]
        DO_CAPTURE = 6
        DO_RUN_COMPLETE = 7

        [controller.output_pins]
        DI_RUN = 2
        DI_CAPTURE_COMPLETE = 3
    "#;

    #[test]
    fn test_load_sample_config() {
        let config = ExperimentConfig::from_toml_str(SAMPLE_TOML).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_samples(), 3);
        assert_eq!(config.run_budget(), None);
        assert_eq!(config.interval(), Duration::from_secs(1800));
        assert_eq!(config.timing.handshake_settle(), Duration::from_secs(1));
        assert_eq!(config.controller.baud_rate, 57600);
        assert_eq!(config.camera.exposure_mode, ExposureMode::SetOnce);
        assert_eq!(
            config.interval_calculation_mode,
            IntervalPolicy::ConstantInterval
        );
    }

    #[test]
    fn test_interval_policy_is_required() {
        let toml = SAMPLE_TOML.replace(
            "interval_calculation_mode = \"constant_interval\"",
            "",
        );
        let err = ExperimentConfig::from_toml_str(&toml).unwrap_err();
        assert!(
            err.to_string().contains("interval_calculation_mode"),
            "{err}"
        );
    }

    #[test]
    fn test_missing_pin_mapping_is_reported() {
        let toml = SAMPLE_TOML.replace("DO_RUN_COMPLETE = 7", "");
        let err = ExperimentConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("DO_RUN_COMPLETE"), "{err}");
    }

    #[test]
    fn test_invalid_exposure_mode_is_rejected() {
        let toml = SAMPLE_TOML.replace("\"SetOnce\"", "\"Sometimes\"");
        assert!(ExperimentConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_non_positive_sample_count() {
        let toml = SAMPLE_TOML.replace("number_of_samples = 3", "number_of_samples = 0");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        match config.validate() {
            Err(DaqError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "number_of_samples")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_positive_interval() {
        let toml = SAMPLE_TOML.replace("interval_minutes = 30", "interval_minutes = 0");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        match config.validate() {
            Err(DaqError::InvalidConfig { field, .. }) => assert_eq!(field, "interval_minutes"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_manual_mode_requires_exposure() {
        let toml = SAMPLE_TOML.replace("\"SetOnce\"", "\"Manual\"");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        match config.validate() {
            Err(DaqError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "camera.exposure_time")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_pins() {
        let toml = SAMPLE_TOML.replace("DI_RUN = 2", "DI_RUN = 6");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        match config.validate() {
            Err(DaqError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "controller.output_pins.DI_RUN")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bounded_run_budget() {
        let toml = SAMPLE_TOML.replace("total_runs = -1", "total_runs = 4");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.run_budget(), Some(4));

        let toml = SAMPLE_TOML.replace("total_runs = -1", "total_runs = -3");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_required_without_auto_detect() {
        let toml = SAMPLE_TOML.replace("port = \"/dev/ttyACM0\"", "");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        assert!(config.validate().is_err());

        let toml = SAMPLE_TOML.replace("port = \"/dev/ttyACM0\"", "auto_detect_port = true");
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ExperimentConfig::load_from("/nonexistent/experiment.toml").unwrap_err();
        assert!(matches!(err, DaqError::InvalidConfig { .. }));
    }
}
