//! Per-sample exposure learned in SetOnce mode.
//!
//! The table lives in memory as [`ExposureTable`] and on disk as a two-column CSV
//! (`sample_index,exposure_time`) managed by [`ExposureCache`]. An unknown entry is
//! written as the literal `None` so that it survives a round trip distinct from any
//! number.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};

/// Token for an entry that has not been learned.
pub const UNKNOWN_TOKEN: &str = "None";

/// File name used inside the experiment folder.
pub const EXPOSURE_TABLE_FILE: &str = "exposure_table.csv";

/// Whether `exposure_us` can be stored in and read back from the table.
pub fn is_valid_exposure(exposure_us: f64) -> bool {
    exposure_us.is_finite() && exposure_us > 0.0
}

/// Sample index to exposure (microseconds), learned at most once per entry.
#[derive(Debug, Clone, Default)]
pub struct ExposureTable {
    values: Vec<Option<f64>>,
    newly_learned: BTreeSet<usize>,
}

impl PartialEq for ExposureTable {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl ExposureTable {
    /// All entries unknown.
    pub fn new(num_samples: usize) -> Self {
        Self {
            values: vec![None; num_samples],
            newly_learned: BTreeSet::new(),
        }
    }

    /// Table with the given entries (none marked as newly learned).
    pub fn from_values(values: Vec<Option<f64>>) -> Self {
        Self {
            values,
            newly_learned: BTreeSet::new(),
        }
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for a table without samples
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Learned exposure of `sample`, if any
    pub fn get(&self, sample: usize) -> Option<f64> {
        self.values.get(sample).copied().flatten()
    }

    /// Whether `sample` has a learned exposure
    pub fn is_known(&self, sample: usize) -> bool {
        self.get(sample).is_some()
    }

    /// Record a learned value. A known entry is never overwritten, and a value that
    /// is not a positive finite number is refused.
    ///
    /// Returns true if the entry was unknown and is now set.
    pub fn learn(&mut self, sample: usize, exposure_us: f64) -> bool {
        if !is_valid_exposure(exposure_us) {
            return false;
        }
        match self.values.get_mut(sample) {
            Some(slot) if slot.is_none() => {
                *slot = Some(exposure_us);
                self.newly_learned.insert(sample);
                true
            }
            _ => false,
        }
    }

    /// Every entry in sample order
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// Number of learned entries
    pub fn known_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Whether anything was learned since the last [`Self::mark_persisted`].
    pub fn has_new_values(&self) -> bool {
        !self.newly_learned.is_empty()
    }

    /// Samples learned since the last [`Self::mark_persisted`].
    pub fn newly_learned(&self) -> impl Iterator<Item = usize> + '_ {
        self.newly_learned.iter().copied()
    }

    /// Forget which entries are new, after a successful save.
    pub fn mark_persisted(&mut self) {
        self.newly_learned.clear();
    }
}

/// CSV persistence for an [`ExposureTable`].
#[derive(Debug, Clone)]
pub struct ExposureCache {
    path: PathBuf,
}

impl ExposureCache {
    /// Cache stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache stored as `exposure_table.csv` in `folder`.
    pub fn in_folder(folder: &Path) -> Self {
        Self::new(folder.join(EXPOSURE_TABLE_FILE))
    }

    /// Location of the CSV file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table for `num_samples` samples.
    ///
    /// A missing or unreadable file yields an all-unknown table. Malformed rows and
    /// rows outside `0..num_samples` are skipped with a warning.
    pub fn load(&self, num_samples: usize) -> ExposureTable {
        let mut table = ExposureTable::new(num_samples);
        if !self.path.exists() {
            tracing::info!(path = ?self.path, "No exposure table yet, all samples will be learned");
            return table;
        }

        let mut reader = match csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(&self.path)
        {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Exposure table unreadable, starting empty");
                return table;
            }
        };

        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(line = line + 2, error = %e, "Skipping malformed exposure row");
                    continue;
                }
            };
            match parse_row(&record, num_samples) {
                Ok((sample, value)) => table.values[sample] = value,
                Err(reason) => {
                    tracing::warn!(line = line + 2, reason = %reason, "Skipping malformed exposure row")
                }
            }
        }

        tracing::info!(
            path = ?self.path,
            known = table.known_count(),
            samples = num_samples,
            "Exposure table loaded"
        );
        table
    }

    /// Write the whole table, replacing the file atomically.
    pub fn save(&self, table: &ExposureTable) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("csv.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(["sample_index", "exposure_time"])?;
            for (sample, value) in table.values.iter().enumerate() {
                let value = match value {
                    Some(v) => v.to_string(),
                    None => UNKNOWN_TOKEN.to_string(),
                };
                writer.write_record([sample.to_string(), value])?;
            }
            let file = writer
                .into_inner()
                .map_err(|e| DaqError::Storage(format!("exposure table flush: {e}")))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        tracing::info!(path = ?self.path, known = table.known_count(), "Exposure table saved");
        Ok(())
    }
}

fn parse_row(record: &csv::StringRecord, num_samples: usize) -> Result<(usize, Option<f64>), String> {
    let index = record.get(0).ok_or("missing sample_index")?;
    let value = record.get(1).ok_or("missing exposure_time")?;

    let sample: usize = index
        .parse()
        .map_err(|_| format!("sample_index '{index}' is not an index"))?;
    if sample >= num_samples {
        return Err(format!("sample_index {sample} outside 0..{num_samples}"));
    }

    if value.is_empty() || value.eq_ignore_ascii_case(UNKNOWN_TOKEN) {
        return Ok((sample, None));
    }
    let exposure: f64 = value
        .parse()
        .map_err(|_| format!("exposure_time '{value}' is not a number"))?;
    if !is_valid_exposure(exposure) {
        return Err(format!("exposure_time {exposure} is not positive"));
    }
    Ok((sample, Some(exposure)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_learn_once() {
        let mut table = ExposureTable::new(3);
        assert!(table.learn(1, 1200.0));
        assert!(!table.learn(1, 900.0));
        assert_eq!(table.get(1), Some(1200.0));
        assert!(!table.learn(7, 100.0));
        assert_eq!(table.newly_learned().collect::<Vec<_>>(), vec![1]);
        table.mark_persisted();
        assert!(!table.has_new_values());
    }

    #[test]
    fn test_unstorable_values_are_refused() {
        let dir = TempDir::new().unwrap();
        let cache = ExposureCache::in_folder(dir.path());
        let mut table = ExposureTable::new(4);

        assert!(!table.learn(0, 0.0));
        assert!(!table.learn(1, f64::NAN));
        assert!(!table.learn(2, f64::INFINITY));
        assert!(table.learn(3, 12.5));
        assert!(!table.is_known(0));
        assert!(table.is_known(3));
        assert_eq!(table.newly_learned().collect::<Vec<_>>(), vec![3]);

        cache.save(&table).unwrap();
        assert_eq!(cache.load(4), table);
    }

    #[test]
    fn test_round_trip_keeps_unknown_entries() {
        let dir = TempDir::new().unwrap();
        let cache = ExposureCache::in_folder(dir.path());
        let table = ExposureTable::from_values(vec![Some(1200.5), None, Some(0.125), None]);

        cache.save(&table).unwrap();
        assert_eq!(cache.load(4), table);

        let text = fs::read_to_string(cache.path()).unwrap();
        assert!(text.starts_with("sample_index,exposure_time"));
        assert!(text.contains("1,None"));
        assert!(!dir.path().join("exposure_table.csv.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_empty_table() {
        let dir = TempDir::new().unwrap();
        let cache = ExposureCache::in_folder(dir.path());
        let table = cache.load(2);
        assert_eq!(table.values(), &[None, None]);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let cache = ExposureCache::in_folder(dir.path());
        fs::write(
            cache.path(),
            "sample_index,exposure_time\n0,1500\n1,abc\nx,2\n5,100\n2,-4\n3\n",
        )
        .unwrap();
        let table = cache.load(4);
        assert_eq!(table.values(), &[Some(1500.0), None, None, None]);
    }

    #[test]
    fn test_partial_table_resumes() {
        let dir = TempDir::new().unwrap();
        let cache = ExposureCache::in_folder(dir.path());
        cache
            .save(&ExposureTable::from_values(vec![Some(800.0)]))
            .unwrap();

        let mut table = cache.load(3);
        assert_eq!(table.known_count(), 1);
        assert!(!table.learn(0, 1.0));
        assert!(table.learn(2, 950.0));
        assert_eq!(table.values(), &[Some(800.0), None, Some(950.0)]);
    }
}
