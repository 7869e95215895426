use repo_cron::load_config::{load_config, parse_config, validate, Role};
use serial_test::serial;
use std::env;
use std::fs::write;
use tempfile::NamedTempFile;

const OVERRIDES: &[&str] = &[
    "REPO_CRON_TOPIC_URL",
    "REPO_CRON_SUBSCRIPTION_URL",
    "REPO_CRON_RESULTS_BUCKET_URL",
    "REPO_CRON_SHARD_SIZE",
    "REPO_CRON_COMPLETION_THRESHOLD",
    "REPO_CRON_IGNORE_RUNTIME_ERRORS",
];

fn clear_env() {
    for name in OVERRIDES {
        env::remove_var(name);
    }
}

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).unwrap();
    file
}

const WORKER_YAML: &str = r#"
subscription_url: "gcppubsub://projects/p/subscriptions/shards"
results_bucket_url: "gs://results"
raw_results_bucket_url: "gs://raw-results"
shard_size: 50
completion_threshold: 0.95
ignore_runtime_errors: true
queue:
  empty_backoff_secs: 3
"#;

#[tokio::test]
#[serial]
async fn test_load_config_reads_yaml_and_defaults() {
    clear_env();
    let file = config_file(WORKER_YAML);

    let config = load_config(file.path(), Role::Worker).expect("Config should load");

    assert_eq!(config.results_bucket_url.as_deref(), Some("gs://results"));
    assert_eq!(config.raw_results_bucket_url.as_deref(), Some("gs://raw-results"));
    assert_eq!(config.shard_size, 50);
    assert_eq!(config.completion_threshold, 0.95);
    assert!(config.ignore_runtime_errors);
    assert_eq!(config.queue.empty_backoff_secs, 3);
    // untouched queue settings keep their defaults
    assert_eq!(config.queue.ack_deadline_secs, 600);
    assert_eq!(config.webhook_url, None);
}

#[tokio::test]
#[serial]
async fn test_env_overrides_beat_yaml() {
    clear_env();
    let file = config_file(WORKER_YAML);
    env::set_var("REPO_CRON_RESULTS_BUCKET_URL", "s3://other");
    env::set_var("REPO_CRON_SHARD_SIZE", "7");
    env::set_var("REPO_CRON_IGNORE_RUNTIME_ERRORS", "false");

    let config = load_config(file.path(), Role::Worker);
    clear_env();
    let config = config.expect("Config should load");

    assert_eq!(config.results_bucket_url.as_deref(), Some("s3://other"));
    assert_eq!(config.shard_size, 7);
    assert!(!config.ignore_runtime_errors);
}

#[tokio::test]
#[serial]
async fn test_invalid_env_value_is_rejected() {
    clear_env();
    let file = config_file(WORKER_YAML);
    env::set_var("REPO_CRON_COMPLETION_THRESHOLD", "most");

    let result = load_config(file.path(), Role::Worker);
    clear_env();

    let err = result.unwrap_err().to_string();
    assert!(err.contains("REPO_CRON_COMPLETION_THRESHOLD"), "{err}");
}

#[tokio::test]
#[serial]
async fn test_missing_required_url_names_the_variable() {
    clear_env();
    let file = config_file("results_bucket_url: \"gs://results\"\n");

    let err = load_config(file.path(), Role::Controller).unwrap_err().to_string();
    assert!(err.contains("topic_url"), "{err}");
    assert!(err.contains("REPO_CRON_TOPIC_URL"), "{err}");
}

#[tokio::test]
#[serial]
async fn test_missing_file_is_an_error() {
    clear_env();
    assert!(load_config("does-not-exist.yaml", Role::Local).is_err());
}

#[test]
fn test_validation_per_role() {
    let config = parse_config(
        r#"
topic_url: "mem://shards"
results_bucket_url: "mem://results"
"#,
    )
    .unwrap();
    assert!(validate(&config, Role::Controller).is_ok());
    assert!(validate(&config, Role::Worker).is_err());
    assert!(validate(&config, Role::Transfer).is_err());
    assert!(validate(&config, Role::Local).is_ok());

    let with_warehouse = parse_config(
        r#"
results_bucket_url: "gs://results"
warehouse:
  project_id: p
  dataset: d
  table: t
"#,
    )
    .unwrap();
    assert!(validate(&with_warehouse, Role::Transfer).is_ok());

    let mut bad_threshold = with_warehouse.clone();
    bad_threshold.completion_threshold = 1.5;
    assert!(validate(&bad_threshold, Role::Transfer).is_err());

    let mut bad_shard_size = with_warehouse;
    bad_shard_size.shard_size = 0;
    assert!(validate(&bad_shard_size, Role::Transfer).is_err());
}

#[test]
fn test_empty_yaml_yields_defaults() {
    let config = parse_config("\n").unwrap();
    assert_eq!(config.shard_size, 100);
    assert_eq!(config.completion_threshold, 0.9);
    assert!(config.topic_url.is_none());
}
