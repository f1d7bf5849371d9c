use clap::Parser;
use prompt_workbench::config::*;
use std::path::PathBuf;

#[test]
fn test_default_constants() {
    assert_eq!(DEFAULT_PORT, 9880);
    assert_eq!(DB_FILE_NAME, "workbench.db");
    assert_eq!(DEFAULT_PASS_THRESHOLD, 0.6);
    assert_eq!(JUDGE_SCORE_MAX, 10.0);
    assert_eq!(DEFAULT_JUDGE_TEMPERATURE, 0.0);
}

#[test]
fn test_config_for_data_dir() {
    let config = WorkbenchConfig::for_data_dir(PathBuf::from("/tmp/workbench"));

    assert_eq!(config.data_dir, PathBuf::from("/tmp/workbench"));
    assert_eq!(config.db_path, PathBuf::from("/tmp/workbench/workbench.db"));
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.model_base_url, DEFAULT_MODEL_BASE_URL);
    assert!(config.api_key.is_none());
    assert!(config.log_dir.is_none());
}

#[test]
fn test_cli_args_all_flags() {
    let args = CliArgs::parse_from([
        "prompt-workbench",
        "-d",
        "/var/lib/workbench",
        "--port",
        "8123",
        "--model-base-url",
        "https://models.internal/v1",
        "--api-key",
        "sk-test",
        "--request-timeout-secs",
        "30",
        "-l",
        "/var/log/workbench",
    ]);
    let config = WorkbenchConfig::from_args(args);

    assert_eq!(config.port, 8123);
    assert_eq!(config.model_base_url, "https://models.internal/v1");
    assert_eq!(config.api_key.as_deref(), Some("sk-test"));
    assert_eq!(config.request_timeout_secs, 30);
    assert_eq!(config.db_path, PathBuf::from("/var/lib/workbench/workbench.db"));
    assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/workbench")));
}

#[test]
fn test_default_data_dir_is_named_after_app() {
    let args = CliArgs::parse_from(["prompt-workbench"]);
    let config = WorkbenchConfig::from_args(args);

    assert!(config.data_dir.ends_with("prompt-workbench"));
    assert!(config.db_path.ends_with("prompt-workbench/workbench.db"));
}

#[test]
fn test_messages_defined() {
    for message in [ABORTED_MESSAGE, INTERRUPTED_MESSAGE, JUDGE_FAILURE_FEEDBACK] {
        assert!(!message.is_empty());
    }
    assert_ne!(ABORTED_MESSAGE, INTERRUPTED_MESSAGE);
}
