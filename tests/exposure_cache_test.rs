//! Exposure table persistence.

use dic_daq::exposure::{ExposureCache, ExposureTable};
use tempfile::TempDir;

#[test]
fn table_survives_save_and_load_with_unknown_entries() {
    let dir = TempDir::new().unwrap();
    let cache = ExposureCache::in_folder(dir.path());
    let table = ExposureTable::from_values(vec![Some(1200.5), None, Some(3.0), None]);

    cache.save(&table).unwrap();
    let loaded = cache.load(4);

    assert_eq!(loaded, table);
    assert_eq!(loaded.known_count(), 2);
    assert!(!loaded.has_new_values());

    let text = std::fs::read_to_string(cache.path()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "sample_index,exposure_time");
    assert_eq!(lines[2], "1,None");
}

#[test]
fn missing_file_loads_all_unknown() {
    let dir = TempDir::new().unwrap();
    let cache = ExposureCache::in_folder(&dir.path().join("not_created_yet"));
    let table = cache.load(3);
    assert_eq!(table.values(), &[None, None, None]);
}

#[test]
fn partial_table_learns_only_missing_entries() {
    let dir = TempDir::new().unwrap();
    let cache = ExposureCache::in_folder(dir.path());
    cache
        .save(&ExposureTable::from_values(vec![Some(900.0), None, None]))
        .unwrap();

    let mut table = cache.load(3);
    assert!(!table.learn(0, 4000.0), "known entry must not be replaced");
    assert!(table.learn(2, 1500.0));
    assert_eq!(table.newly_learned().collect::<Vec<_>>(), vec![2]);

    cache.save(&table).unwrap();
    table.mark_persisted();
    let reloaded = cache.load(3);
    assert_eq!(reloaded.values(), &[Some(900.0), None, Some(1500.0)]);
}

#[test]
fn rows_outside_the_sample_range_are_skipped() {
    let dir = TempDir::new().unwrap();
    let cache = ExposureCache::in_folder(dir.path());
    std::fs::write(
        cache.path(),
        "sample_index,exposure_time\n0,1000\n7,2000\nx,3\n1,-5\n2,\n",
    )
    .unwrap();

    let table = cache.load(3);
    assert_eq!(table.values(), &[Some(1000.0), None, None]);
}
