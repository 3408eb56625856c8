mod common;

use std::io::Write;

use pipedb::config::DEFAULT_SCAN_WINDOW;
use pipedb::{EngineConfig, Error, Pipes};
use serde_json::json;

#[test]
fn yaml_file_with_env_substitution() {
    std::env::set_var("PIPEDB_CONFIG_TEST_WINDOW", "2");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "scan_window: ${{PIPEDB_CONFIG_TEST_WINDOW}}").unwrap();
    writeln!(file, "error_limit: 5").unwrap();

    let config = EngineConfig::from_yaml_file(file.path()).unwrap();
    std::env::remove_var("PIPEDB_CONFIG_TEST_WINDOW");

    assert_eq!(config.scan_window, 2);
    assert_eq!(config.error_limit, 5);
    assert_eq!(config.limit, 0);
}

#[test]
fn missing_file_is_a_config_error() {
    let err = EngineConfig::from_yaml_file(std::path::Path::new("/nonexistent/pipedb.yaml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn invalid_config_is_rejected_on_open() {
    let config = EngineConfig {
        scan_window: 0,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Pipes::open_in_memory_with_config(config),
        Err(Error::Config(_))
    ));
}

#[test]
fn tiny_scan_window_reads_everything() {
    let config = EngineConfig {
        scan_window: 1,
        ..EngineConfig::default()
    };
    let pipes = Pipes::open_in_memory_with_config(config).unwrap();
    let p = pipes.define("p").unwrap();
    p.append((0..25).map(|i| json!(i))).unwrap();

    assert_eq!(common::ids(&p), (1..=25).collect::<Vec<_>>());
    assert_eq!(p.last(3).map(|r| r.unwrap().id.as_raw()).collect::<Vec<_>>(), vec![25, 24, 23]);
    assert_eq!(pipes.config().scan_window, 1);
    assert_ne!(pipes.config().scan_window, DEFAULT_SCAN_WINDOW);
}
