#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Loading worker configuration from YAML files

mod common;

use brrtworker::error::ConfigError;
use brrtworker::{Worker, WorkerConfig};
use common::temp_files::write_yaml;
use std::path::PathBuf;

#[test]
fn test_from_yaml_file_full() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(
        &dir,
        "worker.yaml",
        r#"
name: billing
max_requests: 500
max_consecutive_failures: 3
stack_size: 131072
cache:
  max_entries: 1000
  sweep_interval: 10
inherit_process_env: false
env:
  APP_ENV: staging
default_headers:
  X-Served-By: billing
upload_dir: /var/tmp/uploads
"#,
    );

    let config = WorkerConfig::from_yaml_file(&path).unwrap();
    assert_eq!(config.name, "billing");
    assert_eq!(config.max_requests, 500);
    assert_eq!(config.max_consecutive_failures, 3);
    assert_eq!(config.stack_size, 131_072);
    assert_eq!(config.cache.max_entries, 1000);
    assert_eq!(config.cache.sweep_interval, 10);
    assert!(!config.inherit_process_env);
    assert_eq!(config.env.get("APP_ENV").map(String::as_str), Some("staging"));
    assert_eq!(
        config.upload_dir,
        Some(PathBuf::from("/var/tmp/uploads"))
    );
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(&dir, "partial.yaml", "max_requests: 7\n");
    let config = WorkerConfig::from_yaml_file(&path).unwrap();
    assert_eq!(config.max_requests, 7);
    assert_eq!(config.stack_size, brrtworker::config::DEFAULT_STACK_SIZE);
    assert_eq!(config.cache.sweep_interval, 64);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = WorkerConfig::from_yaml_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_invalid_values_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bad_header = write_yaml(&dir, "h.yaml", "default_headers:\n  \"Bad Header\": x\n");
    assert!(matches!(
        WorkerConfig::from_yaml_file(&bad_header).unwrap_err(),
        ConfigError::Invalid {
            field: "default_headers",
            ..
        }
    ));

    let bad_type = write_yaml(&dir, "t.yaml", "max_requests: lots\n");
    assert!(matches!(
        WorkerConfig::from_yaml_file(&bad_type).unwrap_err(),
        ConfigError::Parse(_)
    ));
}

#[test]
fn test_config_feeds_worker_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_yaml(
        &dir,
        "ctx.yaml",
        "inherit_process_env: false\nenv:\n  REGION: eu-west-1\n",
    );
    let config = WorkerConfig::from_yaml_file(&path).unwrap();
    let (worker, _units) = Worker::from_config(config).unwrap();
    assert_eq!(
        worker.context().env().get("REGION").as_deref(),
        Some("eu-west-1")
    );
    assert_eq!(worker.context().env().get("BRRTW_WORKER").as_deref(), Some("1"));
}

#[test]
fn test_yaml_roundtrip_through_to_yaml() {
    let config = WorkerConfig {
        name: "roundtrip".to_string(),
        env: [("A".to_string(), "1".to_string())].into_iter().collect(),
        ..WorkerConfig::default()
    };
    let yaml = config.to_yaml().unwrap();
    assert_eq!(WorkerConfig::from_yaml_str(&yaml).unwrap(), config);
}
