//! Image persistence.
//!
//! Layout under the experiment folder:
//!
//! ```text
//! <base>/Sample_<i>/sample_<i>_<YYYYmmdd_HHMMSS>_<seq:04>_<cam>.tif
//! ```
//!
//! `seq` continues from the highest sequence already on disk for that sample, so a
//! restarted experiment never overwrites earlier images.
//!
//! # Features
//!
//! TIFF encoding requires the `storage_tiff` feature (enabled by default). Without
//! it, [`write_tiff`] returns [`DaqError::FeatureNotEnabled`].

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{AppResult, DaqError};
use crate::hardware::{CameraFrame, Frame};

/// Folder name of sample `i`.
pub fn sample_folder_name(sample: usize) -> String {
    format!("Sample_{sample}")
}

/// File name of one camera image.
pub fn image_file_name(sample: usize, at: &DateTime<Local>, seq: u64, camera: usize) -> String {
    format!(
        "sample_{sample}_{}_{seq:04}_{camera}.tif",
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Sequence number encoded in an image file name of `sample`, if it is one.
fn parse_sequence(sample: usize, file_name: &str) -> Option<u64> {
    let rest = file_name
        .strip_prefix(&format!("sample_{sample}_"))?
        .strip_suffix(".tif")?;
    let mut parts = rest.rsplitn(3, '_');
    let _camera: usize = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    // Remaining part is the timestamp.
    parts.next()?;
    Some(seq)
}

/// Per-sample image folders with collision-free naming.
#[derive(Debug)]
pub struct ImageStore {
    base: PathBuf,
    sample_dirs: Vec<PathBuf>,
    disk_visits: Vec<u64>,
}

impl ImageStore {
    /// Create (or reopen) the sample folders under `base`.
    pub fn create(base: &Path, num_samples: usize) -> AppResult<Self> {
        let mut sample_dirs = Vec::with_capacity(num_samples);
        let mut disk_visits = Vec::with_capacity(num_samples);
        for sample in 0..num_samples {
            let dir = base.join(sample_folder_name(sample));
            std::fs::create_dir_all(&dir)?;
            let visits = existing_visits(&dir, sample);
            if visits > 0 {
                tracing::info!(sample, visits, "Continuing image sequence from disk");
            }
            sample_dirs.push(dir);
            disk_visits.push(visits);
        }
        tracing::debug!(base = ?base, samples = num_samples, "Sample folders ready");
        Ok(Self {
            base: base.to_path_buf(),
            sample_dirs,
            disk_visits,
        })
    }

    /// Experiment folder
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Folder of `sample`
    pub fn sample_dir(&self, sample: usize) -> Option<&Path> {
        self.sample_dirs.get(sample).map(PathBuf::as_path)
    }

    /// Visits of `sample` recorded on disk when the store was opened.
    pub fn disk_visits(&self, sample: usize) -> u64 {
        self.disk_visits.get(sample).copied().unwrap_or(0)
    }

    /// Sequence number for the next image set of `sample`.
    pub fn next_sequence(&self, sample: usize, visits_this_process: u64) -> u64 {
        self.disk_visits(sample) + visits_this_process
    }

    /// Write one image per frame, named after the camera that delivered it. Returns
    /// `(camera_id, path)` for every file written.
    ///
    /// Individual failures are logged; an error is returned only if nothing could be
    /// written.
    pub fn save_frames(
        &self,
        sample: usize,
        seq: u64,
        at: &DateTime<Local>,
        frames: &[CameraFrame],
    ) -> AppResult<Vec<(usize, PathBuf)>> {
        let dir = self
            .sample_dir(sample)
            .ok_or_else(|| DaqError::Storage(format!("no folder for sample {sample}")))?;

        let mut saved = Vec::with_capacity(frames.len());
        let mut last_error = None;
        for CameraFrame { camera, frame } in frames {
            let camera = *camera;
            let path = dir.join(image_file_name(sample, at, seq, camera));
            match write_tiff(frame, &path) {
                Ok(()) => {
                    tracing::info!(sample, camera, file = ?path.file_name(), "Saved image");
                    saved.push((camera, path));
                }
                Err(e) => {
                    tracing::error!(sample, camera, error = %e, "Failed to save image");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if saved.is_empty() => Err(e),
            _ => Ok(saved),
        }
    }
}

fn existing_visits(dir: &Path, sample: usize) -> u64 {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| parse_sequence(sample, entry.file_name().to_str()?))
        .max()
        .map_or(0, |seq| seq + 1)
}

/// Write a frame as an uncompressed grayscale TIFF.
///
/// # Bit Depth Handling
///
/// - 8-bit frames: written as 8-bit grayscale
/// - 12/16-bit frames: written as 16-bit grayscale
#[cfg(feature = "storage_tiff")]
pub fn write_tiff(frame: &Frame, path: &Path) -> AppResult<()> {
    use image::codecs::tiff::TiffEncoder;
    use image::{ExtendedColorType, ImageEncoder};
    use std::io::BufWriter;

    if frame.data.len() != frame.expected_len() {
        return Err(DaqError::Storage(format!(
            "Frame data size mismatch: expected {} bytes for {}x{} {}bit, got {} bytes",
            frame.expected_len(),
            frame.width,
            frame.height,
            frame.bit_depth,
            frame.data.len()
        )));
    }

    let file = std::fs::File::create(path)?;
    let encoder = TiffEncoder::new(BufWriter::new(file));

    let result = if frame.bit_depth > 8 {
        // Frame data is little endian; the encoder takes native endian samples.
        let bytes: Vec<u8> = frame
            .data
            .chunks_exact(2)
            .flat_map(|c| u16::from_le_bytes([c[0], c[1]]).to_ne_bytes())
            .collect();
        encoder.write_image(&bytes, frame.width, frame.height, ExtendedColorType::L16)
    } else {
        encoder.write_image(&frame.data, frame.width, frame.height, ExtendedColorType::L8)
    };

    result.map_err(|e| DaqError::Storage(format!("Failed to encode TIFF to {path:?}: {e}")))
}

/// TIFF output is unavailable without `storage_tiff`.
#[cfg(not(feature = "storage_tiff"))]
pub fn write_tiff(_frame: &Frame, _path: &Path) -> AppResult<()> {
    Err(DaqError::FeatureNotEnabled("storage_tiff".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 17, 14, 30, 5).unwrap()
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(
            image_file_name(2, &at(), 7, 1),
            "sample_2_20240517_143005_0007_1.tif"
        );
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence(2, "sample_2_20240517_143005_0007_1.tif"), Some(7));
        assert_eq!(parse_sequence(1, "sample_2_20240517_143005_0007_1.tif"), None);
        assert_eq!(parse_sequence(2, "sample_2_notes.txt"), None);
        assert_eq!(parse_sequence(2, "sample_2_x_0007_cam.tif"), None);
    }

    #[test]
    fn test_sequence_continues_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = ImageStore::create(dir.path(), 2).unwrap();
        assert_eq!(store.next_sequence(0, 0), 0);

        let sample_dir = store.sample_dir(0).unwrap().to_path_buf();
        for name in [
            "sample_0_20240101_000000_0000_0.tif",
            "sample_0_20240101_003000_0001_0.tif",
            "sample_0_20240101_003000_0001_1.tif",
        ] {
            std::fs::write(sample_dir.join(name), b"").unwrap();
        }

        let store = ImageStore::create(dir.path(), 2).unwrap();
        assert_eq!(store.disk_visits(0), 2);
        assert_eq!(store.disk_visits(1), 0);
        assert_eq!(store.next_sequence(0, 3), 5);
    }

    #[cfg(feature = "storage_tiff")]
    #[test]
    fn test_save_frames_writes_one_file_per_camera() {
        let dir = TempDir::new().unwrap();
        let store = ImageStore::create(dir.path(), 1).unwrap();
        let frames = vec![
            CameraFrame::new(0, Frame::from_u16(4, 2, &[1, 2, 3, 4, 5, 6, 7, 8])),
            CameraFrame::new(1, Frame::from_u8(4, 2, vec![9; 8])),
        ];

        let saved = store.save_frames(0, 0, &at(), &frames).unwrap();
        assert_eq!(saved.len(), 2);
        for (camera, path) in &saved {
            assert!(path.exists());
            assert!(path.ends_with(format!("Sample_0/sample_0_20240517_143005_0000_{camera}.tif")));
            assert!(std::fs::metadata(path).unwrap().len() > 0);
        }
    }

    #[cfg(feature = "storage_tiff")]
    #[test]
    fn test_missing_camera_keeps_file_names() {
        let dir = TempDir::new().unwrap();
        let store = ImageStore::create(dir.path(), 1).unwrap();
        let frames = vec![CameraFrame::new(1, Frame::from_u8(2, 2, vec![1; 4]))];

        let saved = store.save_frames(0, 3, &at(), &frames).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, 1);
        assert!(saved[0].1.ends_with("Sample_0/sample_0_20240517_143005_0003_1.tif"));
        assert!(!store
            .sample_dir(0)
            .unwrap()
            .join("sample_0_20240517_143005_0003_0.tif")
            .exists());
    }

    #[cfg(feature = "storage_tiff")]
    #[test]
    fn test_size_mismatch_is_error() {
        let dir = TempDir::new().unwrap();
        let store = ImageStore::create(dir.path(), 1).unwrap();
        let bad = Frame {
            width: 4,
            height: 4,
            bit_depth: 16,
            data: vec![0; 3],
        };
        assert!(matches!(
            store.save_frames(0, 0, &at(), &[CameraFrame::new(0, bad)]),
            Err(DaqError::Storage(_))
        ));
    }
}
