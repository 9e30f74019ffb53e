use std::time::Duration;

use clap::Parser;
use tempfile::TempDir;

use soap_stream::{Cli, Config, ConfigManager};

use crate::common::test_helpers::{SERVICE_URL, action};

fn cli(extra: &[&str]) -> Cli {
    let mut args = vec!["soap-stream", "--url", SERVICE_URL, "--action", "GetItems"];
    args.extend_from_slice(extra);
    Cli::try_parse_from(args).unwrap()
}

#[tokio::test]
async fn test_cli_wins_over_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("soap-stream.toml");
    tokio::fs::write(
        &path,
        r#"
[network]
timeout_seconds = 15

[retry]
load_attempts = 3
max_timeout_seconds = 12.0

[parsing]
unit_tags = ["item"]
streaming_tags = ["log"]
"#,
    )
    .await
    .unwrap();

    let path_arg = path.to_string_lossy().to_string();
    let config = ConfigManager::load_config(&cli(&[
        "--config",
        &path_arg,
        "--attempts",
        "5",
        "--unit-tag",
        "entry",
    ]))
    .await
    .unwrap();

    assert_eq!(config.network.timeout_seconds, 15);
    assert_eq!(config.retry.load_attempts, 5);
    assert_eq!(config.retry.max_timeout(), Duration::from_secs(12));
    assert_eq!(config.parsing.unit_tags, vec!["entry"]);
    assert_eq!(config.parsing.streaming_tags, vec!["log"]);
}

#[tokio::test]
async fn test_invalid_file_values_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("soap-stream.json");
    tokio::fs::write(&path, r#"{ "retry": { "load_attempts": 1000 } }"#)
        .await
        .unwrap();

    let path_arg = path.to_string_lossy().to_string();
    assert!(ConfigManager::load_config(&cli(&["-c", &path_arg])).await.is_err());
}

#[test]
fn test_config_shapes_the_action() {
    let mut config = Config::default();
    config.retry.load_attempts = 4;
    config.retry.max_timeout_seconds = 2.5;
    config.parsing.unit_tags = vec!["item".to_string()];
    config.parsing.parse_units_async = true;

    let mut action = action();
    config.apply_to(&mut action);

    let policy = action.retry_policy();
    assert_eq!(policy.attempts_allowed(), 4);
    assert_eq!(action.max_timeout, Duration::from_millis(2500));
    assert_eq!(action.tags.unit_tags, vec!["item"]);
    assert!(action.parse_units_asynchronously);
    assert!(action.network_activity_indicator);
}
