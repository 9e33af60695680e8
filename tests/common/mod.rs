//! Shared fixtures for the integration tests: a config writer, a simulated bench
//! (mock port, robot task, mock cameras) and a scheduler wired to it.

#![allow(dead_code)]

use dic_daq::config::ExperimentConfig;
use dic_daq::experiment::{build_resources, Rig};
use dic_daq::exposure::ExposureTable;
use dic_daq::hardware::mock::{MockDigitalPort, MockFrameSource, SimulatedController};
use dic_daq::scheduler::{Resources, RunScheduler, SchedulerSettings};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const DO_CAPTURE: u8 = 6;
pub const DO_RUN_COMPLETE: u8 = 7;
pub const DI_RUN: u8 = 2;
pub const DI_CAPTURE_COMPLETE: u8 = 3;

/// Knobs the tests vary; everything else is fixed.
pub struct TestSetup<'a> {
    pub samples: i64,
    pub interval_minutes: f64,
    pub policy: &'a str,
    pub exposure_mode: &'a str,
    pub total_runs: i64,
    pub cameras: usize,
    pub turn_off_cameras: bool,
}

impl Default for TestSetup<'_> {
    fn default() -> Self {
        Self {
            samples: 3,
            interval_minutes: 30.0,
            policy: "constant_interval",
            exposure_mode: "SetOnce",
            total_runs: -1,
            cameras: 1,
            turn_off_cameras: true,
        }
    }
}

impl TestSetup<'_> {
    pub fn config(&self, dir: &Path) -> ExperimentConfig {
        let toml = format!(
            r#"
            experiment_name = "bench"
            output_folder = "{folder}"
            number_of_samples = {samples}
            interval_minutes = {interval}
            interval_calculation_mode = "{policy}"
            total_runs = {runs}
            turn_off_cameras_between_runs = {turn_off}

            [camera]
            width = 16
            height = 8
            exposure_time = 2500.0
            exposure_mode = "{mode}"
            grab_timeout_ms = 500
            simulated_cameras = {cameras}

            [controller]
            port = "/dev/null"

            [controller.input_pins]
            DO_CAPTURE = {DO_CAPTURE}
            DO_RUN_COMPLETE = {DO_RUN_COMPLETE}

            [controller.output_pins]
            DI_RUN = {DI_RUN}
            DI_CAPTURE_COMPLETE = {DI_CAPTURE_COMPLETE}

            [timing]
            poll_interval_ms = 10
            break_poll_interval_ms = 1000
            handshake_settle_ms = 100
            reinit_threshold_secs = 30
            "#,
            folder = dir.display().to_string().replace('\\', "/"),
            samples = self.samples,
            interval = self.interval_minutes,
            policy = self.policy,
            runs = self.total_runs,
            turn_off = self.turn_off_cameras,
            mode = self.exposure_mode,
            cameras = self.cameras,
        );
        let config = ExperimentConfig::from_toml_str(&toml).unwrap();
        config.validate().unwrap();
        config
    }
}

/// Mock controller port with a robot task, and a mock camera rig.
pub struct Bench {
    pub port: Arc<MockDigitalPort>,
    pub cameras: Arc<MockFrameSource>,
    pub robot: JoinHandle<usize>,
}

impl Bench {
    /// Robot for `config`, adjusted by `robot`.
    pub fn new(
        config: &ExperimentConfig,
        cameras: MockFrameSource,
        robot: impl FnOnce(SimulatedController) -> SimulatedController,
    ) -> Self {
        let port = Arc::new(MockDigitalPort::new());
        let controller = SimulatedController::new(
            Arc::clone(&port),
            config.controller.input_pins,
            config.controller.output_pins,
            config.num_samples(),
        );
        Self {
            port,
            cameras: Arc::new(cameras),
            robot: robot(controller).spawn(),
        }
    }

    pub fn with_defaults(config: &ExperimentConfig) -> Self {
        let cameras = MockFrameSource::new(config.camera.simulated_cameras, 16, 8);
        Self::new(config, cameras, |robot| robot)
    }

    pub fn rig(&self) -> Rig {
        Rig::from_parts(self.port.clone(), self.cameras.clone())
    }
}

/// Scheduler and resources for `config` on `bench`, cameras already up.
pub async fn scheduler_on(config: &ExperimentConfig, bench: &Bench) -> (RunScheduler, Resources) {
    let mut res = build_resources(config, &bench.rig()).await.unwrap();
    let table = res
        .exposure_cache
        .as_ref()
        .map(|cache| cache.load(config.num_samples()))
        .unwrap_or_else(|| ExposureTable::new(config.num_samples()));
    let mut scheduler = RunScheduler::new(SchedulerSettings::from_config(config), table);
    scheduler.bring_up_cameras(&mut res).await.unwrap();
    (scheduler, res)
}

/// Rows of the capture log, header excluded.
pub fn capture_rows(config: &ExperimentConfig) -> Vec<Vec<String>> {
    let path = config.base_folder().join("bench.csv");
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

/// `.tif` files below the sample folder of `sample`.
pub fn image_files(config: &ExperimentConfig, sample: usize) -> Vec<String> {
    let dir = config.base_folder().join(format!("Sample_{sample}"));
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tif"))
        .collect();
    names.sort();
    names
}
