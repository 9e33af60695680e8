//! Experiment lifecycle.
//!
//! An [`Experiment`] owns the hardware (through [`Resources`]) and the
//! [`RunScheduler`]. It brings the cameras up, waits for the operator, alternates
//! runs and breaks until the run budget is spent, and then always tears down in
//! the same order:
//!
//! 1. force every owned output LOW
//! 2. close the frame source
//! 3. flush and close the capture log
//! 4. emit the report
//!
//! Each step is guarded on its own; a failing step is recorded in the report and
//! the next one still runs. Completion, an operator `quit`, Ctrl+C and fatal errors
//! all end up on this path.

use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::capture_log::CaptureLogger;
use crate::config::{ExperimentConfig, ExposureMode};
use crate::error::{AppResult, DaqError};
use crate::exposure::{ExposureCache, ExposureTable};
use crate::hardware::capabilities::{DigitalPort, FrameSource};
use crate::hardware::mock::{MockDigitalPort, MockFrameSource, SimulatedController};
use crate::report::{ExperimentReport, ReportInputs, ReportSink, TerminationReason};
use crate::scheduler::{BreakSummary, Resources, RunScheduler, RunSummary, SchedulerSettings};
use crate::signal::SignalController;
use crate::status::StatusLine;
use crate::storage::ImageStore;

/// Which parts of the rig are real.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareMode {
    /// Firmata controller and a camera driver
    Physical,
    /// Firmata controller with simulated cameras
    SimulatedCameras,
    /// Everything simulated, including the positioning robot
    Simulated,
}

/// Controller port and camera rig, plus the simulated robot when there is one.
pub struct Rig {
    /// Controller pins
    pub port: Arc<dyn DigitalPort>,
    /// Camera rig
    pub cameras: Arc<dyn FrameSource>,
    robot: Option<JoinHandle<usize>>,
}

impl Rig {
    /// Rig from hardware the caller already opened.
    pub fn from_parts(port: Arc<dyn DigitalPort>, cameras: Arc<dyn FrameSource>) -> Self {
        Self {
            port,
            cameras,
            robot: None,
        }
    }

    /// Open the rig described by `config`.
    ///
    /// No camera driver is linked into this build, so [`HardwareMode::Physical`]
    /// fails before the controller is opened.
    pub async fn open(config: &ExperimentConfig, mode: HardwareMode) -> AppResult<Self> {
        match mode {
            HardwareMode::Simulated => Ok(Self::simulated(config)),
            HardwareMode::SimulatedCameras => {
                let board = crate::hardware::firmata::connect(&config.controller).await?;
                Ok(Self::from_parts(
                    Arc::new(board),
                    Arc::new(simulated_cameras(config)),
                ))
            }
            HardwareMode::Physical => Err(DaqError::FeatureNotEnabled("camera_driver".into())),
        }
    }

    /// Mock controller with a robot task playing the other side of the handshake.
    pub fn simulated(config: &ExperimentConfig) -> Self {
        let port = Arc::new(MockDigitalPort::new());
        let robot = SimulatedController::new(
            Arc::clone(&port),
            config.controller.input_pins,
            config.controller.output_pins,
            config.num_samples(),
        )
        .spawn();
        info!(
            cameras = config.camera.simulated_cameras,
            samples = config.num_samples(),
            "Running against simulated hardware"
        );
        Self {
            port,
            cameras: Arc::new(simulated_cameras(config)),
            robot: Some(robot),
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        if let Some(robot) = self.robot.take() {
            robot.abort();
        }
    }
}

fn simulated_cameras(config: &ExperimentConfig) -> MockFrameSource {
    MockFrameSource::new(
        config.camera.simulated_cameras,
        config.camera.width,
        config.camera.height,
    )
    .with_grab_timeout(std::time::Duration::from_millis(config.camera.grab_timeout_ms))
}

/// How the experiment is started.
pub enum StartGate {
    /// Start without asking
    Immediate,
    /// Ask for `start` or `quit` on this input
    Prompt(Box<dyn AsyncBufRead + Send + Unpin>),
}

impl StartGate {
    /// Prompt on the process's standard input.
    pub fn stdin() -> Self {
        StartGate::Prompt(Box::new(tokio::io::BufReader::new(tokio::io::stdin())))
    }
}

/// Operator answer at the start prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// Operator typed `start`
    Start,
    /// Operator typed `quit` or closed the input
    Quit,
}

/// Ask until the operator types `start` or `quit`. End of input counts as `quit`.
pub async fn prompt_start<R>(input: &mut R, cancel: &CancelToken) -> AppResult<StartDecision>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = String::new();
    loop {
        println!("Type 'start' to begin the experiment or 'quit' to exit:");
        line.clear();
        let read = tokio::select! {
            read = input.read_line(&mut line) => read?,
            _ = cancel.cancelled() => return Err(DaqError::Cancelled),
        };
        if read == 0 {
            warn!("Input closed at the start prompt, treating as quit");
            return Ok(StartDecision::Quit);
        }
        match line.trim().to_lowercase().as_str() {
            "start" => return Ok(StartDecision::Start),
            "quit" => return Ok(StartDecision::Quit),
            other => println!("Unrecognized answer '{other}'."),
        }
    }
}

/// Create the output folder, capture log, sample folders and (SetOnce) exposure
/// cache, and configure the controller pins.
pub async fn build_resources(config: &ExperimentConfig, rig: &Rig) -> AppResult<Resources> {
    let base = config.base_folder();
    std::fs::create_dir_all(&base)?;
    info!(folder = ?base, "Output folder ready");

    let images = ImageStore::create(&base, config.num_samples())?;
    let log = CaptureLogger::open(base.join(format!("{}.csv", config.experiment_name)))?;
    let exposure_cache =
        (config.camera.exposure_mode == ExposureMode::SetOnce).then(|| ExposureCache::in_folder(&base));

    let controller = SignalController::from_config(Arc::clone(&rig.port), &config.controller).await?;
    info!(controller = %controller.describe(), "Controller pins configured");

    Ok(Resources {
        controller,
        cameras: Arc::clone(&rig.cameras),
        log,
        images,
        exposure_cache,
    })
}

/// Everything the experiment produced on its way out.
#[derive(Debug)]
pub struct ExperimentOutcome {
    /// Why the experiment ended
    pub termination: TerminationReason,
    /// Report as written by the sink
    pub report: ExperimentReport,
    /// Files written by the report sink (empty if it failed)
    pub report_files: Vec<PathBuf>,
}

/// One experiment from camera bring-up to report.
pub struct Experiment {
    config: ExperimentConfig,
    rig: Rig,
    resources: Resources,
    scheduler: RunScheduler,
    sink: Box<dyn ReportSink>,
    runs: Vec<RunSummary>,
    breaks: Vec<BreakSummary>,
}

impl Experiment {
    /// Prepare resources for `config` on `rig`. Loads the exposure table in
    /// SetOnce mode.
    pub async fn prepare(
        config: ExperimentConfig,
        rig: Rig,
        sink: Box<dyn ReportSink>,
    ) -> AppResult<Self> {
        let resources = build_resources(&config, &rig).await?;
        let table = resources
            .exposure_cache
            .as_ref()
            .map(|cache| cache.load(config.num_samples()))
            .unwrap_or_else(|| ExposureTable::new(config.num_samples()));
        let scheduler = RunScheduler::new(SchedulerSettings::from_config(&config), table);
        Ok(Self {
            config,
            rig,
            resources,
            scheduler,
            sink,
            runs: Vec::new(),
            breaks: Vec::new(),
        })
    }

    /// Show run and break progress on `status`.
    pub fn with_status_line(mut self, status: StatusLine) -> Self {
        self.scheduler = self.scheduler.with_status_line(status);
        self
    }

    /// Scheduler state, for inspection before `run`
    pub fn scheduler(&self) -> &RunScheduler {
        &self.scheduler
    }

    /// Hardware in use
    pub fn rig(&self) -> &Rig {
        &self.rig
    }

    /// Run to completion. Never returns early: every termination path tears down
    /// and emits the report.
    pub async fn run(mut self, gate: StartGate, cancel: &CancelToken) -> ExperimentOutcome {
        let start_time = Local::now();
        info!(
            experiment = %self.config.experiment_name,
            samples = self.config.num_samples(),
            policy = %self.config.interval_calculation_mode,
            "Experiment starting"
        );

        let termination = match self.drive(gate, cancel).await {
            Ok(StartDecision::Start) => TerminationReason::Completed,
            Ok(StartDecision::Quit) => TerminationReason::Aborted,
            Err(e) if e.is_cancellation() => {
                warn!("Experiment cancelled, shutting down");
                TerminationReason::Cancelled
            }
            Err(e) => {
                error!(error = %e, "Experiment failed, shutting down");
                TerminationReason::Failed {
                    error: e.to_string(),
                }
            }
        };
        self.scheduler.terminate();

        let shutdown_errors = self.teardown().await;
        self.finish(start_time, termination, shutdown_errors).await
    }

    async fn drive(&mut self, gate: StartGate, cancel: &CancelToken) -> AppResult<StartDecision> {
        self.scheduler.bring_up_cameras(&mut self.resources).await?;

        self.scheduler.await_start();
        if let StartGate::Prompt(mut input) = gate {
            if prompt_start(&mut *input, cancel).await? == StartDecision::Quit {
                info!("Operator quit before the first run");
                return Ok(StartDecision::Quit);
            }
        }

        let budget = self.config.run_budget();
        loop {
            let run = self
                .scheduler
                .execute_run(&mut self.resources, cancel)
                .await?;
            self.runs.push(run);

            if budget.is_some_and(|total| self.scheduler.run_count() >= total) {
                info!(runs = self.scheduler.run_count(), "All runs completed");
                return Ok(StartDecision::Start);
            }

            let pause = self
                .scheduler
                .enter_break(&mut self.resources, cancel)
                .await?;
            self.breaks.push(pause);
        }
    }

    async fn teardown(&mut self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.resources.controller.force_outputs_low().await {
            error!(error = %e, "Failed to drive outputs LOW");
            errors.push(format!("force outputs low: {e}"));
        }

        match self.resources.cameras.close().await {
            Ok(()) => info!("Cameras closed"),
            Err(e) => {
                error!(error = %e, "Failed to close cameras");
                errors.push(format!("close cameras: {e}"));
            }
        }

        if let Err(e) = self.resources.log.close() {
            error!(error = %e, "Failed to close capture log");
            errors.push(format!("close capture log: {e}"));
        }

        errors
    }

    async fn finish(
        mut self,
        start_time: DateTime<Local>,
        termination: TerminationReason,
        shutdown_errors: Vec<String>,
    ) -> ExperimentOutcome {
        let report = ExperimentReport::build(ReportInputs {
            config: &self.config,
            start_time,
            end_time: Local::now(),
            runs_performed: self.scheduler.run_count(),
            visit_counts: self.scheduler.visit_counts().to_vec(),
            learned_exposures: self.scheduler.exposures().values().to_vec(),
            output_folder: self.resources.images.base().to_path_buf(),
            termination: termination.clone(),
            runs: std::mem::take(&mut self.runs),
            breaks: std::mem::take(&mut self.breaks),
            shutdown_errors,
        });

        let report_files = match self.sink.emit(&report) {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "Failed to write experiment report");
                Vec::new()
            }
        };

        if let Err(e) = self.resources.controller.close().await {
            warn!(error = %e, "Controller close failed");
        }

        info!(
            termination = %termination,
            runs = report.runs_performed,
            images = report.total_captures,
            "Experiment finished"
        );
        ExperimentOutcome {
            termination,
            report,
            report_files,
        }
    }
}
