//! Append-only CSV log of every saved image.
//!
//! One row per camera per capture, flushed as soon as it is written so a crash
//! loses at most the row being written. Reopening an existing log appends without
//! repeating the header.

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};
use crate::exposure::UNKNOWN_TOKEN;

/// Column names, in order.
pub const CAPTURE_LOG_HEADER: [&str; 7] = [
    "run_count",
    "sample_index",
    "camera_id",
    "exposure_time",
    "unix_timestamp",
    "datetime",
    "filename",
];

/// One saved image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureEvent {
    /// Zero-based run number
    pub run_count: u64,
    /// Sample position in the run
    pub sample_index: usize,
    /// Camera that delivered the image
    pub camera_id: usize,
    /// Exposure in microseconds, `None` when unknown
    #[serde(serialize_with = "serialize_exposure")]
    pub exposure_time: Option<f64>,
    /// Capture time in seconds since the Unix epoch
    pub unix_timestamp: f64,
    /// Capture time, local, human readable
    pub datetime: String,
    /// Image file name
    pub filename: String,
}

fn serialize_exposure<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_f64(*v),
        None => serializer.serialize_str(UNKNOWN_TOKEN),
    }
}

impl CaptureEvent {
    /// Event stamped with `at` (local time with microseconds).
    pub fn new(
        run_count: u64,
        sample_index: usize,
        camera_id: usize,
        exposure_time: Option<f64>,
        at: DateTime<Local>,
        filename: &Path,
    ) -> Self {
        Self {
            run_count,
            sample_index,
            camera_id,
            exposure_time,
            unix_timestamp: at.timestamp_micros() as f64 / 1e6,
            datetime: at.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            filename: filename.display().to_string(),
        }
    }
}

/// CSV capture log.
pub struct CaptureLogger {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows_written: u64,
}

impl CaptureLogger {
    /// Open `path` for appending, writing the header if the file is empty.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if empty {
            writer.write_record(CAPTURE_LOG_HEADER)?;
            writer.flush()?;
        }
        tracing::info!(path = ?path, new_file = empty, "Capture log opened");

        Ok(Self {
            path,
            writer: Some(writer),
            rows_written: 0,
        })
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False once closed
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Rows appended by this instance.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Append and flush one row.
    pub fn try_append(&mut self, event: &CaptureEvent) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage("capture log is closed".into()))?;
        writer.serialize(event)?;
        writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    /// Append one row; a failure is logged and otherwise ignored.
    pub fn append(&mut self, event: &CaptureEvent) {
        if let Err(e) = self.try_append(event) {
            tracing::error!(
                run = event.run_count,
                sample = event.sample_index,
                camera = event.camera_id,
                error = %e,
                "Failed to write capture log row"
            );
        }
    }

    /// Flush and close. Idempotent.
    pub fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            tracing::info!(path = ?self.path, rows = self.rows_written, "Capture log closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn event(run: u64, sample: usize, camera: usize, exposure: Option<f64>) -> CaptureEvent {
        let at = Local.with_ymd_and_hms(2024, 5, 17, 14, 30, 5).unwrap();
        CaptureEvent::new(
            run,
            sample,
            camera,
            exposure,
            at,
            Path::new("Sample_0/sample_0_20240517_143005_0000_0.tif"),
        )
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exp.csv");

        let mut log = CaptureLogger::open(&path).unwrap();
        log.try_append(&event(0, 0, 0, Some(1200.0))).unwrap();
        log.close().unwrap();

        let mut log = CaptureLogger::open(&path).unwrap();
        log.try_append(&event(1, 0, 1, None)).unwrap();
        log.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "run_count,sample_index,camera_id,exposure_time,unix_timestamp,datetime,filename"
        );
        assert!(lines[1].starts_with("0,0,0,1200.0,"));
        assert!(lines[2].starts_with("1,0,1,None,"));
        assert!(lines[1].contains("2024-05-17 14:30:05.000000"));
    }

    #[test]
    fn test_rows_are_flushed_immediately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exp.csv");
        let mut log = CaptureLogger::open(&path).unwrap();
        log.append(&event(0, 2, 0, Some(10.0)));

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(log.rows_written(), 1);
    }

    #[test]
    #[traced_test]
    fn test_append_after_close_is_logged() {
        let dir = TempDir::new().unwrap();
        let mut log = CaptureLogger::open(dir.path().join("exp.csv")).unwrap();
        log.close().unwrap();
        log.close().unwrap();
        log.append(&event(0, 0, 0, None));
        assert!(!log.is_open());
        assert_eq!(log.rows_written(), 0);
        assert!(logs_contain("capture log is closed"));
    }
}
