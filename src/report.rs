//! End-of-experiment report.
//!
//! Produced on every termination path (completion, operator quit, cancellation,
//! fatal error). [`FileReportSink`] writes it next to the data as JSON and as a
//! Markdown summary.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{CameraConfig, ControllerConfig, ExperimentConfig};
use crate::error::{AppResult, DaqError};
use crate::scheduler::{BreakSummary, RunSummary};

/// Why the experiment ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Run budget spent
    Completed,
    /// Operator answered `quit` at the start prompt
    Aborted,
    /// Operator interrupt
    Cancelled,
    /// Error that ended the experiment
    Failed {
        /// Error message
        error: String,
    },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Completed => write!(f, "completed"),
            TerminationReason::Aborted => write!(f, "aborted before start"),
            TerminationReason::Cancelled => write!(f, "cancelled by operator"),
            TerminationReason::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Summary of a finished experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    /// Name from the configuration
    pub experiment_name: String,
    /// Experiment start
    pub start_time: DateTime<Local>,
    /// Experiment end
    pub end_time: DateTime<Local>,
    /// Wall-clock length
    pub duration_secs: f64,
    /// Runs that completed
    pub runs_performed: u64,
    /// Configured interval
    pub interval_minutes: f64,
    /// How the interval was measured
    pub interval_policy: String,
    /// Samples per run
    pub number_of_samples: usize,
    /// Sum of visit counts
    pub total_captures: u64,
    /// Successful captures per sample
    pub visit_counts: Vec<u64>,
    /// Exposure table at the end
    pub learned_exposures: Vec<Option<f64>>,
    /// Base folder of the experiment
    pub output_folder: PathBuf,
    /// Size of the base folder
    pub folder_size_mb: f64,
    /// Camera settings
    pub camera: CameraConfig,
    /// Controller settings
    pub controller: ControllerConfig,
    /// Why the experiment ended
    pub termination: TerminationReason,
    /// One entry per completed run
    pub runs: Vec<RunSummary>,
    /// One entry per finished break
    pub breaks: Vec<BreakSummary>,
    /// Teardown steps that failed
    pub shutdown_errors: Vec<String>,
}

/// What the experiment knows when it ends.
#[derive(Debug, Clone)]
pub struct ReportInputs<'a> {
    /// Configuration the experiment ran with
    pub config: &'a ExperimentConfig,
    /// Experiment start
    pub start_time: DateTime<Local>,
    /// Experiment end
    pub end_time: DateTime<Local>,
    /// Runs that completed
    pub runs_performed: u64,
    /// Successful captures per sample
    pub visit_counts: Vec<u64>,
    /// Exposure table at the end
    pub learned_exposures: Vec<Option<f64>>,
    /// Base folder of the experiment
    pub output_folder: PathBuf,
    /// Why the experiment ended
    pub termination: TerminationReason,
    /// Run summaries
    pub runs: Vec<RunSummary>,
    /// Break summaries
    pub breaks: Vec<BreakSummary>,
    /// Teardown steps that failed
    pub shutdown_errors: Vec<String>,
}

impl ExperimentReport {
    /// Assemble the report; measures the output folder.
    pub fn build(inputs: ReportInputs<'_>) -> Self {
        let duration_secs = (inputs.end_time - inputs.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let folder_size_mb = folder_size_bytes(&inputs.output_folder) as f64 / (1024.0 * 1024.0);
        Self {
            experiment_name: inputs.config.experiment_name.clone(),
            start_time: inputs.start_time,
            end_time: inputs.end_time,
            duration_secs,
            runs_performed: inputs.runs_performed,
            interval_minutes: inputs.config.interval_minutes,
            interval_policy: inputs.config.interval_calculation_mode.to_string(),
            number_of_samples: inputs.config.num_samples(),
            total_captures: inputs.visit_counts.iter().sum(),
            visit_counts: inputs.visit_counts,
            learned_exposures: inputs.learned_exposures,
            output_folder: inputs.output_folder,
            folder_size_mb,
            camera: inputs.config.camera.clone(),
            controller: inputs.config.controller.clone(),
            termination: inputs.termination,
            runs: inputs.runs,
            breaks: inputs.breaks,
            shutdown_errors: inputs.shutdown_errors,
        }
    }

    /// Markdown rendering.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Experiment Report: {}\n", self.experiment_name);

        let _ = writeln!(md, "## Experiment Details\n");
        let _ = writeln!(md, "| Field | Value |\n|---|---|");
        let rows = [
            ("Start Time", self.start_time.format("%Y-%m-%d %H:%M:%S").to_string()),
            ("End Time", self.end_time.format("%Y-%m-%d %H:%M:%S").to_string()),
            ("Total Duration", format_duration(self.duration_secs)),
            ("Total Runs Performed", self.runs_performed.to_string()),
            ("Interval Between Runs (minutes)", self.interval_minutes.to_string()),
            ("Interval Policy", self.interval_policy.clone()),
            ("Number of Samples", self.number_of_samples.to_string()),
            ("Total Images Captured", self.total_captures.to_string()),
            ("Total Filesize", format!("{:.2} MB", self.folder_size_mb)),
            ("Output Folder", self.output_folder.display().to_string()),
            ("Termination", self.termination.to_string()),
        ];
        for (field, value) in rows {
            let _ = writeln!(md, "| {field} | {value} |");
        }

        let _ = writeln!(md, "\n## Camera Settings\n");
        let _ = writeln!(md, "| Field | Value |\n|---|---|");
        let _ = writeln!(md, "| Width | {} |", self.camera.width);
        let _ = writeln!(md, "| Height | {} |", self.camera.height);
        let _ = writeln!(
            md,
            "| Exposure Time (µs) | {} |",
            self.camera
                .exposure_time
                .map_or_else(|| "N/A".to_string(), |v| v.to_string())
        );
        let _ = writeln!(md, "| Exposure Mode | {} |", self.camera.exposure_mode);

        let _ = writeln!(md, "\n## Controller Settings\n");
        let _ = writeln!(md, "| Field | Value |\n|---|---|");
        let _ = writeln!(md, "| Auto Detect Port | {} |", self.controller.auto_detect_port);
        let _ = writeln!(
            md,
            "| Port | {} |",
            self.controller.port.as_deref().unwrap_or("N/A")
        );
        let inputs = &self.controller.input_pins;
        let outputs = &self.controller.output_pins;
        let _ = writeln!(
            md,
            "| Input Pins | DO_CAPTURE: {}, DO_RUN_COMPLETE: {} |",
            inputs.do_capture, inputs.do_run_complete
        );
        let _ = writeln!(
            md,
            "| Output Pins | DI_RUN: {}, DI_CAPTURE_COMPLETE: {} |",
            outputs.di_run, outputs.di_capture_complete
        );

        let _ = writeln!(md, "\n## Visit Counts per Sample\n");
        let _ = writeln!(md, "| Sample Index | Visit Count | Exposure (µs) |\n|---|---|---|");
        for (sample, visits) in self.visit_counts.iter().enumerate() {
            let exposure = self
                .learned_exposures
                .get(sample)
                .copied()
                .flatten()
                .map_or_else(|| "-".to_string(), |v| v.to_string());
            let _ = writeln!(md, "| {sample} | {visits} | {exposure} |");
        }

        if !self.shutdown_errors.is_empty() {
            let _ = writeln!(md, "\n## Shutdown Errors\n");
            for error in &self.shutdown_errors {
                let _ = writeln!(md, "- {error}");
            }
        }
        md
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Total size of all files below `folder`.
pub fn folder_size_bytes(folder: &Path) -> u64 {
    WalkDir::new(folder)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Destination for the final report.
pub trait ReportSink: Send + Sync {
    /// Emit the report; returns the files written, if any.
    fn emit(&self, report: &ExperimentReport) -> AppResult<Vec<PathBuf>>;
}

/// Writes `<stamp>_report.json` and `<stamp>_report.md` into a folder.
#[derive(Debug, Clone)]
pub struct FileReportSink {
    folder: PathBuf,
}

impl FileReportSink {
    /// Sink writing into `folder`.
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }
}

impl ReportSink for FileReportSink {
    fn emit(&self, report: &ExperimentReport) -> AppResult<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.folder)?;
        let stamp = report.start_time.format("%Y-%m-%d_%H-%M-%S");

        let json_path = self.folder.join(format!("{stamp}_report.json"));
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| DaqError::Report(format!("serialize report: {e}")))?;
        std::fs::write(&json_path, json)?;

        let md_path = self.folder.join(format!("{stamp}_report.md"));
        std::fs::write(&md_path, report.to_markdown())?;

        tracing::info!(path = ?json_path, "Experiment report written");
        Ok(vec![json_path, md_path])
    }
}
