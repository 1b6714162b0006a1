//! Configuration files driving a query.

use std::io::Write;
use tempora_core::StreamEvent;
use tempora_runtime::codec::CheckpointFormat;
use tempora_runtime::config::{init_logging, ConfigError, EngineConfig, LoggingConfig};
use tempora_runtime::engine::QueryContainer;
use tempora_runtime::ingress::{DisorderMode, OnCompletedPolicy};

fn write_config(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
fn load_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "engine.yaml",
        r#"
ingress:
  disorder: drop
  punctuation_period: 10
checkpoint:
  retention: 7
pattern:
  max_live_instances: 64
"#,
    );

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.ingress.disorder, DisorderMode::Drop);
    assert_eq!(config.ingress.punctuation_period, Some(10));
    assert_eq!(config.ingress.on_completed, OnCompletedPolicy::EndOfStream);
    assert_eq!(config.checkpoint.retention, 7);
    assert_eq!(config.checkpoint.format, CheckpointFormat::Json);
    assert_eq!(config.pattern.max_live_instances, Some(64));
    assert_eq!(config.logging, LoggingConfig::default());
}

#[test]
fn load_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "engine.toml",
        r#"
[ingress]
disorder = "adjust"
reorder_latency = 25
on_completed = "flush"

[logging]
level = "debug"
json = true
"#,
    );

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.ingress.disorder, DisorderMode::Adjust);
    assert_eq!(config.ingress.reorder_latency, 25);
    assert_eq!(config.ingress.on_completed, OnCompletedPolicy::Flush);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::load(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::IoError(..)));
}

#[test]
fn configured_input_generates_punctuations() {
    let config = EngineConfig::from_yaml("ingress:\n  disorder: drop\n  punctuation_period: 10\n").unwrap();
    let mut container = QueryContainer::with_config(config);
    let (input, stream) = container.register_configured_input::<i64>("values").unwrap();
    let output = container.register_output(stream).unwrap();
    let mut process = container.start();

    for (t, v) in [(3, 1), (14, 2), (9, 3), (27, 4)] {
        process.push(&input, StreamEvent::point(t, v)).unwrap();
    }

    assert_eq!(
        process.drain(&output).unwrap(),
        vec![
            StreamEvent::point(3, 1),
            StreamEvent::punctuation(0),
            StreamEvent::point(14, 2),
            StreamEvent::punctuation(10),
            StreamEvent::point(27, 4),
            StreamEvent::punctuation(20),
        ]
    );
    assert_eq!(process.input_stats(&input).unwrap().dropped, 1);
}

#[test]
fn logging_installs_once() {
    let config = LoggingConfig {
        level: "warn".to_string(),
        json: false,
    };
    init_logging(&config).unwrap();
    assert!(matches!(init_logging(&config), Err(ConfigError::Logging(_))));
}
