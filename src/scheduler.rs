//! Run scheduling: the capture loop, the capture handshake and the break.
//!
//! The [`RunScheduler`] is the only owner of run state (sample visits, the exposure
//! table, the next scheduled start). Hardware is lent to it through [`Resources`]
//! for the duration of each call.
//!
//! # State Machine
//!
//! ```text
//! Idle ──prompt──> AwaitingStart ──start──> RunActive ──DO_RUN_COMPLETE──> Draining
//!                                               ▲                             │
//!                                               │                             ▼
//!                                               └──────── break over ─── BreakActive
//!
//! any state ──cancel / budget spent / fatal error──> Terminated
//! ```
//!
//! # Interval policies
//!
//! - `constant_interval`: the next start is fixed when a run starts
//!   (`run_start + interval`); a long run eats into the break, down to zero.
//! - `constant_break`: the next start is fixed when the break starts
//!   (`break_start + interval`); every break has the same length.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::capture_log::{CaptureEvent, CaptureLogger};
use crate::config::{ExperimentConfig, ExposureMode, InputPins, IntervalPolicy, OutputPins};
use crate::error::{AppResult, DaqError};
use crate::exposure::{is_valid_exposure, ExposureCache, ExposureTable};
use crate::hardware::capabilities::{AutoExposure, FrameSource};
use crate::signal::SignalController;
use crate::status::{format_countdown, StatusLine};
use crate::storage::ImageStore;

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    /// Resources not yet handed over
    Idle,
    /// Waiting for the operator to start
    AwaitingStart,
    /// `DI_RUN` is HIGH and capture signals are served
    RunActive,
    /// Run-complete seen; persisting and lowering `DI_RUN`
    Draining,
    /// Waiting for the next scheduled start
    BreakActive,
    /// No further runs
    Terminated,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "Idle"),
            SchedulerState::AwaitingStart => write!(f, "AwaitingStart"),
            SchedulerState::RunActive => write!(f, "RunActive"),
            SchedulerState::Draining => write!(f, "Draining"),
            SchedulerState::BreakActive => write!(f, "BreakActive"),
            SchedulerState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Hardware and files the scheduler drives. Owned by the experiment.
pub struct Resources {
    /// Controller pins
    pub controller: SignalController,
    /// Camera rig
    pub cameras: Arc<dyn FrameSource>,
    /// Capture log of the experiment
    pub log: CaptureLogger,
    /// Per-sample image folders
    pub images: ImageStore,
    /// Present in SetOnce mode only
    pub exposure_cache: Option<ExposureCache>,
}

/// Everything the scheduler needs from the configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Capture signals served per run
    pub num_samples: usize,
    /// Run interval or break length, depending on `policy`
    pub interval: Duration,
    /// How `interval` is measured
    pub policy: IntervalPolicy,
    /// Exposure policy applied to the cameras
    pub exposure_mode: ExposureMode,
    /// Exposure in microseconds for Manual mode
    pub manual_exposure: Option<f64>,
    /// Close the cameras for each break
    pub turn_off_cameras: bool,
    /// Tick of the run loop
    pub poll_interval: Duration,
    /// Tick of the break countdown
    pub break_poll_interval: Duration,
    /// How long `DI_CAPTURE_COMPLETE` is held HIGH
    pub handshake_settle: Duration,
    /// Remaining break at which powered-down cameras are restarted
    pub reinit_threshold: Duration,
    /// Pins read by the scheduler
    pub inputs: InputPins,
    /// Pins driven by the scheduler
    pub outputs: OutputPins,
}

impl SchedulerSettings {
    /// Extract the scheduler's view of the configuration.
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            num_samples: config.num_samples(),
            interval: config.interval(),
            policy: config.interval_calculation_mode,
            exposure_mode: config.camera.exposure_mode,
            manual_exposure: config.camera.exposure_time,
            turn_off_cameras: config.turn_off_cameras_between_runs,
            poll_interval: config.timing.poll_interval(),
            break_poll_interval: config.timing.break_poll_interval(),
            handshake_settle: config.timing.handshake_settle(),
            reinit_threshold: config.timing.reinit_threshold(),
            inputs: config.controller.input_pins,
            outputs: config.controller.output_pins,
        }
    }
}

/// Result of one [`RunScheduler::execute_run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Zero-based run number
    pub run_index: u64,
    /// Capture signals served (one per sample)
    pub captures: usize,
    /// Image files written
    pub images: usize,
    /// Capture signals beyond the sample count
    pub ignored_signals: usize,
    /// Captures that produced no image
    pub failed_captures: usize,
    /// Samples whose exposure was learned in this run
    pub newly_learned: Vec<usize>,
    /// Wall-clock start
    pub started_at: DateTime<Local>,
    /// Time from `DI_RUN` HIGH to run-complete
    pub duration_secs: f64,
}

/// Result of one [`RunScheduler::enter_break`].
#[derive(Debug, Clone, Serialize)]
pub struct BreakSummary {
    /// Run the break follows
    pub after_run: u64,
    /// Break length at entry (zero when skipped)
    pub planned_secs: f64,
    /// Overrun of the scheduled start at entry, when the wait was skipped
    pub overrun_secs: f64,
    /// No wait because the next start had already passed
    pub skipped: bool,
    /// Cameras were brought back up during or after the break
    pub cameras_reinitialized: bool,
}

/// Result of one [`RunScheduler::handle_capture_signal`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    /// Sample the capture belonged to
    pub sample_index: usize,
    /// Images written; zero for a failed capture
    pub images: usize,
    /// Exposure in effect for the capture, if known
    pub exposure: Option<f64>,
}

/// Drives runs and breaks for one experiment.
pub struct RunScheduler {
    settings: SchedulerSettings,
    state: SchedulerState,
    run_count: u64,
    current_run: u64,
    visits: Vec<u64>,
    exposures: ExposureTable,
    next_run_start: Option<Instant>,
    cameras_on: bool,
    status: StatusLine,
}

impl RunScheduler {
    /// `exposures` is the table loaded from the cache (ignored outside SetOnce).
    pub fn new(settings: SchedulerSettings, exposures: ExposureTable) -> Self {
        let visits = vec![0; settings.num_samples];
        let exposures = if exposures.len() == settings.num_samples {
            exposures
        } else {
            ExposureTable::new(settings.num_samples)
        };
        Self {
            settings,
            state: SchedulerState::Idle,
            run_count: 0,
            current_run: 0,
            visits,
            exposures,
            next_run_start: None,
            cameras_on: false,
            status: StatusLine::disabled(),
        }
    }

    /// Report progress on `status` instead of staying quiet.
    pub fn with_status_line(mut self, status: StatusLine) -> Self {
        self.status = status;
        self
    }

    /// Settings in effect
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Current lifecycle state
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Runs completed so far.
    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    /// Successful captures per sample in this process.
    pub fn visit_counts(&self) -> &[u64] {
        &self.visits
    }

    /// Exposure table (all unknown outside SetOnce)
    pub fn exposures(&self) -> &ExposureTable {
        &self.exposures
    }

    /// Scheduled start of the next run, once known
    pub fn next_run_start(&self) -> Option<Instant> {
        self.next_run_start
    }

    /// Mark the scheduler as waiting for the operator.
    pub fn await_start(&mut self) {
        self.state = SchedulerState::AwaitingStart;
    }

    /// No further runs; clears the status line.
    pub fn terminate(&mut self) {
        self.status.finish();
        self.state = SchedulerState::Terminated;
    }

    /// Open the cameras, apply the exposure mode and start acquisition.
    pub async fn bring_up_cameras(&mut self, res: &mut Resources) -> AppResult<usize> {
        let found = res
            .cameras
            .initialize()
            .await
            .map_err(|e| DaqError::FrameGrab(format!("camera initialization failed: {e}")))?;
        if found == 0 {
            return Err(DaqError::NoCamerasFound);
        }
        self.apply_exposure_mode(res).await;
        res.cameras
            .start_acquisition()
            .await
            .map_err(|e| DaqError::FrameGrab(format!("failed to start acquisition: {e}")))?;
        self.cameras_on = true;
        info!(cameras = found, mode = %self.settings.exposure_mode, "Cameras initialized and grabbing");
        Ok(found)
    }

    async fn apply_exposure_mode(&self, res: &Resources) {
        match self.settings.exposure_mode {
            ExposureMode::Manual => {
                if let Some(exposure) = self.settings.manual_exposure {
                    match res.cameras.set_manual_exposure(exposure).await {
                        Ok(()) => info!(exposure_us = exposure, "Manual exposure applied"),
                        Err(e) => warn!(error = %DaqError::ExposureSetFailed(e.to_string()), "Keeping previous exposure"),
                    }
                }
            }
            ExposureMode::Continuous => {
                match res.cameras.set_auto_exposure(AutoExposure::Continuous).await {
                    Ok(observed) => info!(exposure_us = observed, "Continuous auto-exposure enabled"),
                    Err(e) => warn!(error = %DaqError::ExposureSetFailed(e.to_string()), "Keeping previous exposure"),
                }
            }
            // Resolved per capture
            ExposureMode::SetOnce => {}
        }
    }

    async fn power_down_cameras(&mut self, res: &Resources) {
        match res.cameras.close().await {
            Ok(()) => info!("Cameras turned off for the break"),
            Err(e) => warn!(error = %e, "Closing cameras for the break failed"),
        }
        self.cameras_on = false;
    }

    /// Perform one run: raise `DI_RUN`, serve capture signals until the controller
    /// reports run-complete, persist newly learned exposures, lower `DI_RUN`.
    ///
    /// Cancellation is returned as `Err(Cancelled)` after newly learned exposures were
    /// persisted; output pins are left for the caller's teardown.
    pub async fn execute_run(
        &mut self,
        res: &mut Resources,
        cancel: &CancelToken,
    ) -> AppResult<RunSummary> {
        cancel.check()?;
        let run_index = self.run_count;
        self.current_run = run_index;
        self.state = SchedulerState::RunActive;

        info!(run = run_index, "Signalling robot to start the run");
        res.controller
            .set_level(self.settings.outputs.di_run, true)
            .await;

        let started = Instant::now();
        let started_at = Local::now();
        if self.settings.policy == IntervalPolicy::ConstantInterval {
            self.next_run_start = Some(started + self.settings.interval);
        }

        let mut summary = RunSummary {
            run_index,
            captures: 0,
            images: 0,
            ignored_signals: 0,
            failed_captures: 0,
            newly_learned: Vec::new(),
            started_at,
            duration_secs: 0.0,
        };

        let polled = self.poll_run(res, cancel, &mut summary).await;
        self.state = SchedulerState::Draining;
        self.status.finish();

        summary.newly_learned = self.exposures.newly_learned().collect();
        self.persist_exposures(res);

        polled?;

        res.controller
            .set_level(self.settings.outputs.di_run, false)
            .await;
        summary.duration_secs = started.elapsed().as_secs_f64();
        self.run_count += 1;

        info!(
            run = run_index,
            captures = summary.captures,
            images = summary.images,
            ignored = summary.ignored_signals,
            failed = summary.failed_captures,
            duration_s = %format!("{:.1}", summary.duration_secs),
            "Run completed"
        );
        Ok(summary)
    }

    async fn poll_run(
        &mut self,
        res: &mut Resources,
        cancel: &CancelToken,
        summary: &mut RunSummary,
    ) -> AppResult<()> {
        let capture_pin = self.settings.inputs.do_capture;
        let complete_pin = self.settings.inputs.do_run_complete;
        let mut sample_index = 0;

        loop {
            cancel.check()?;
            self.status.show("Waiting for capture signal.");

            if res.controller.check_rising_edge(capture_pin).await {
                if sample_index >= self.settings.num_samples {
                    warn!(
                        run = self.current_run,
                        samples = self.settings.num_samples,
                        "More capture signals than samples, ignoring extra signal"
                    );
                    summary.ignored_signals += 1;
                } else {
                    self.status.finish();
                    let outcome = self.handle_capture_signal(res, sample_index, cancel).await?;
                    if outcome.images == 0 {
                        summary.failed_captures += 1;
                    }
                    summary.images += outcome.images;
                    sample_index += 1;
                    summary.captures = sample_index;
                }
            }

            if res.controller.read(complete_pin).await {
                self.status.finish();
                info!(run = self.current_run, "Robot signalled run completion");
                return Ok(());
            }

            cancel.sleep(self.settings.poll_interval).await?;
        }
    }

    fn persist_exposures(&mut self, res: &Resources) {
        if self.settings.exposure_mode != ExposureMode::SetOnce || !self.exposures.has_new_values() {
            return;
        }
        let Some(cache) = res.exposure_cache.as_ref() else {
            return;
        };
        match cache.save(&self.exposures) {
            Ok(()) => self.exposures.mark_persisted(),
            Err(e) => error!(error = %e, "Failed to save exposure table, will retry after next run"),
        }
    }

    /// Serve one capture signal: resolve exposure, grab, save and log, then
    /// acknowledge with a `DI_CAPTURE_COMPLETE` pulse.
    ///
    /// The acknowledgement is sent even when the grab failed. Only a cancellation
    /// during the pulse is returned as an error (after the pin was lowered).
    pub async fn handle_capture_signal(
        &mut self,
        res: &mut Resources,
        sample_index: usize,
        cancel: &CancelToken,
    ) -> AppResult<CaptureOutcome> {
        let run = self.current_run;
        info!(run, sample = sample_index, "Capture signal received");

        let exposure = self.resolve_exposure(res, sample_index).await;

        let at = Local::now();
        let frames = match res.cameras.grab_frames().await {
            Ok(frames) => frames,
            Err(e) => {
                error!(run, sample = sample_index, error = %DaqError::FrameGrab(e.to_string()), "Grab failed");
                Vec::new()
            }
        };

        let expected = res.cameras.camera_count();
        if !frames.is_empty() && frames.len() < expected {
            warn!(run, sample = sample_index, delivered = frames.len(), expected, "Some cameras delivered no frame");
        }

        let mut images = 0;
        if frames.is_empty() {
            error!(run, sample = sample_index, "No frames captured");
        } else {
            let visits = self.visits.get(sample_index).copied().unwrap_or(0);
            let seq = res.images.next_sequence(sample_index, visits);
            match res.images.save_frames(sample_index, seq, &at, &frames) {
                Ok(saved) => {
                    let per_camera = res.cameras.exposures().await;
                    for (camera, path) in &saved {
                        let logged = per_camera
                            .get(*camera)
                            .copied()
                            .flatten()
                            .filter(|e| is_valid_exposure(*e))
                            .or(exposure);
                        let event =
                            CaptureEvent::new(run, sample_index, *camera, logged, at, path);
                        res.log.append(&event);
                    }
                    images = saved.len();
                    if let Some(v) = self.visits.get_mut(sample_index) {
                        *v += 1;
                    }
                    info!(run, sample = sample_index, images, seq, "Images captured and logged");
                }
                Err(e) => error!(run, sample = sample_index, error = %e, "Saving images failed"),
            }
        }

        let ack = self.settings.outputs.di_capture_complete;
        res.controller.set_level(ack, true).await;
        let settled = cancel.sleep(self.settings.handshake_settle).await;
        res.controller.set_level(ack, false).await;
        settled?;

        Ok(CaptureOutcome {
            sample_index,
            images,
            exposure,
        })
    }

    async fn resolve_exposure(&mut self, res: &Resources, sample: usize) -> Option<f64> {
        match self.settings.exposure_mode {
            ExposureMode::Manual => self.settings.manual_exposure,
            ExposureMode::Continuous => None,
            ExposureMode::SetOnce => {
                if let Some(learned) = self.exposures.get(sample) {
                    if let Err(e) = res.cameras.set_manual_exposure(learned).await {
                        warn!(sample, error = %DaqError::ExposureSetFailed(e.to_string()), "Keeping previous exposure");
                    }
                    return Some(learned);
                }

                info!(sample, "SetOnce: auto-exposing");
                match res.cameras.set_auto_exposure(AutoExposure::Once).await {
                    Ok(observed) if !is_valid_exposure(observed) => {
                        warn!(
                            sample,
                            error = %DaqError::ExposureSetFailed(format!("camera reported exposure {observed}")),
                            "Auto-exposure failed, sample stays unlearned"
                        );
                        None
                    }
                    Ok(observed) => {
                        self.exposures.learn(sample, observed);
                        info!(sample, exposure_us = observed, "SetOnce: exposure learned");
                        if let Err(e) = res.cameras.set_manual_exposure(observed).await {
                            warn!(sample, error = %DaqError::ExposureSetFailed(e.to_string()), "Learned exposure not applied");
                        }
                        Some(observed)
                    }
                    Err(e) => {
                        warn!(
                            sample,
                            error = %DaqError::ExposureSetFailed(e.to_string()),
                            "Auto-exposure failed, sample stays unlearned"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Wait until the next scheduled run start.
    ///
    /// Cameras are powered down first if configured, and brought back once the
    /// remaining time is within the reinit threshold (or before returning, if the
    /// break was too short for that).
    pub async fn enter_break(
        &mut self,
        res: &mut Resources,
        cancel: &CancelToken,
    ) -> AppResult<BreakSummary> {
        cancel.check()?;
        self.state = SchedulerState::BreakActive;
        let after_run = self.run_count.saturating_sub(1);

        if self.settings.turn_off_cameras {
            self.power_down_cameras(res).await;
        } else {
            info!("Keeping cameras on during the break");
        }

        let entered = Instant::now();
        if self.settings.policy == IntervalPolicy::ConstantBreak {
            self.next_run_start = Some(entered + self.settings.interval);
        }
        let target = *self.next_run_start.get_or_insert(entered);

        let mut summary = BreakSummary {
            after_run,
            planned_secs: target.saturating_duration_since(entered).as_secs_f64(),
            overrun_secs: entered.saturating_duration_since(target).as_secs_f64(),
            skipped: false,
            cameras_reinitialized: false,
        };

        if target <= entered {
            warn!(
                overrun_s = %format!("{:.2}", summary.overrun_secs),
                "No break time left, scheduled next run start has passed. Continuing immediately"
            );
            summary.skipped = true;
        } else {
            let resume_at = Local::now()
                + chrono::Duration::from_std(target - entered).unwrap_or_else(|_| chrono::Duration::zero());
            info!(
                minutes = %format!("{:.2}", summary.planned_secs / 60.0),
                resume_at = %resume_at.format("%Y-%m-%d %H:%M:%S"),
                "Break started"
            );

            let waited = self.wait_until(res, target, cancel, &mut summary).await;
            self.status.finish();
            waited?;
            info!("Break time has ended");
        }

        if !self.cameras_on {
            self.reinitialize_cameras(res).await?;
            summary.cameras_reinitialized = true;
        }
        Ok(summary)
    }

    async fn wait_until(
        &mut self,
        res: &mut Resources,
        target: Instant,
        cancel: &CancelToken,
        summary: &mut BreakSummary,
    ) -> AppResult<()> {
        loop {
            let remaining = target.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }

            if !self.cameras_on && remaining <= self.settings.reinit_threshold {
                info!(
                    remaining_s = remaining.as_secs(),
                    threshold_s = self.settings.reinit_threshold.as_secs(),
                    "Remaining break below reinit threshold"
                );
                self.status.finish();
                self.reinitialize_cameras(res).await?;
                summary.cameras_reinitialized = true;
            }

            self.status
                .show(&format!("Break time remaining: {}", format_countdown(remaining)));
            cancel
                .sleep(remaining.min(self.settings.break_poll_interval))
                .await?;
        }
    }

    async fn reinitialize_cameras(&mut self, res: &mut Resources) -> AppResult<()> {
        info!("Re-initializing cameras");
        self.bring_up_cameras(res).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SchedulerState::BreakActive.to_string(), "BreakActive");
        assert_eq!(SchedulerState::AwaitingStart.to_string(), "AwaitingStart");
    }

    #[test]
    fn test_settings_from_config() {
        let config =
            ExperimentConfig::from_toml_str(crate::config::tests::SAMPLE_TOML).unwrap();
        let settings = SchedulerSettings::from_config(&config);
        assert_eq!(settings.num_samples, 3);
        assert_eq!(settings.interval, Duration::from_secs(1800));
        assert_eq!(settings.policy, IntervalPolicy::ConstantInterval);
        assert_eq!(settings.inputs.do_capture, 6);
        assert_eq!(settings.outputs.di_capture_complete, 3);
    }

    #[test]
    fn test_mismatched_table_is_replaced() {
        let config =
            ExperimentConfig::from_toml_str(crate::config::tests::SAMPLE_TOML).unwrap();
        let scheduler = RunScheduler::new(
            SchedulerSettings::from_config(&config),
            ExposureTable::new(5),
        );
        assert_eq!(scheduler.exposures().len(), 3);
        assert_eq!(scheduler.visit_counts(), &[0, 0, 0]);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }
}
