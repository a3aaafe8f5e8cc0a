//! Configuration files and their effect on a pass

mod common;

use common::*;
use hammer2_bulkfree::{Bulkfree, BulkfreeConfig, BulkfreeError};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
buffer_bytes = 65536
min_buffer_bytes = 32768
memory_limit_bytes = 1073741824
max_depth = 8
saved_depth = 2
max_deferred = 128
rate_limit_tps = 0
visit_cache_entries = 1024
progress = false
"#,
    );
    let config = BulkfreeConfig::load(file.path()).unwrap();

    assert_eq!(config.buffer_bytes, 65536);
    assert_eq!(config.memory_limit_bytes, Some(GB));
    assert_eq!(config.max_depth, 8);
    assert_eq!(config.saved_depth, 2);
    assert_eq!(config.max_deferred, 128);
    assert_eq!(config.visit_cache_entries, 1024);
    assert!(!config.progress);

    let policy = config.deferral_policy();
    assert_eq!(policy.max_depth, 8);
    assert_eq!(policy.max_deferred, 128);
}

#[test]
fn test_partial_config_keeps_defaults() {
    let file = write_config("rate_limit_tps = 0\n");
    let config = BulkfreeConfig::load(file.path()).unwrap();
    let defaults = BulkfreeConfig::default();

    assert_eq!(config.rate_limit_tps, 0);
    assert_eq!(config.max_depth, defaults.max_depth);
    assert_eq!(config.buffer_bytes, defaults.buffer_bytes);
    assert_eq!(config.visit_cache_entries, defaults.visit_cache_entries);
}

#[test]
fn test_invalid_values_rejected() {
    for text in [
        "visit_cache_entries = 1000\n",
        "max_depth = 0\n",
        "max_depth = 4\nsaved_depth = 5\n",
        "max_deferred = 1\n",
        "min_buffer_bytes = 1024\n",
        "memory_limit_bytes = 65536\n",
    ] {
        let result = BulkfreeConfig::from_toml_str(text);
        assert!(
            matches!(result, Err(BulkfreeError::InvalidConfig(_))),
            "{:?} accepted",
            text
        );
    }
}

#[test]
fn test_malformed_toml_rejected() {
    let result = BulkfreeConfig::from_toml_str("max_depth = \"deep\"\n");
    assert!(matches!(result, Err(BulkfreeError::ConfigParse(_))));

    let missing = BulkfreeConfig::load("/nonexistent/bulkfree.toml");
    assert!(matches!(missing, Err(BulkfreeError::Io(_))));
}

#[test]
fn test_engine_rejects_invalid_config() {
    let store = volume(1);
    let config = BulkfreeConfig::default().with_visit_cache_entries(3);
    assert!(matches!(
        Bulkfree::new(store, config),
        Err(BulkfreeError::InvalidConfig(_))
    ));
}

#[test]
fn test_configured_buffer_drives_windows() {
    let store = volume(4);
    let file = write_config("buffer_bytes = 65536\nmin_buffer_bytes = 32768\nrate_limit_tps = 0\nprogress = false\n");
    let engine = engine(Arc::clone(&store), BulkfreeConfig::load(file.path()).unwrap());

    let report = engine.run_one_pass(0, 0).unwrap();
    assert_eq!(report.buffer_bytes, 65536);
    assert_eq!(report.windows, 2);
    assert!(report.complete());

    // An explicit budget overrides the configured one
    let report = engine.run_one_pass(0, 32768).unwrap();
    assert_eq!(report.windows, 4);
}

#[test]
fn test_memory_limit_shrinks_windows() {
    let store = volume(4);
    let config = test_config().with_memory_limit(128 * 1024);
    let engine = engine(Arc::clone(&store), config);

    let report = engine.run_one_pass(0, 0).unwrap();
    assert_eq!(report.buffer_bytes, 32768);
    assert_eq!(report.windows, 4);
}

#[test]
fn test_memory_limit_overrides_min_buffer() {
    let store = volume(4);
    // Default 1MB floor would describe the whole device in one window
    let config = BulkfreeConfig::default()
        .with_rate_limit(0)
        .with_progress(false)
        .with_memory_limit(256 * 1024);
    let engine = engine(Arc::clone(&store), config);

    let report = engine.run_one_pass(0, 0).unwrap();
    assert_eq!(report.buffer_bytes, 65536);
    assert_eq!(report.windows, 2);
    assert!(report.complete());
}
