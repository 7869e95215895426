/// `load_config` module: loads the YAML config file, applies `REPO_CRON_*`
/// environment overrides and validates the result for one process role.
///
/// This module is the only place where YAML and environment strings are
/// turned into the immutable [`CronConfig`] the core components receive.
///
/// # Precedence
/// environment variable > YAML value > built-in default
///
/// # Errors
/// All errors use `anyhow::Error` with context and surface at the CLI
/// boundary, where they end the process with a non-zero exit code.
use anyhow::{anyhow, bail, Context, Result};
use repo_cron_core::config::CronConfig;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, error, info};

pub const ENV_PREFIX: &str = "REPO_CRON_";

/// Which process the config is loaded for; each needs different settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Worker,
    Transfer,
    Local,
}

/// Read `path`, apply environment overrides and validate for `role`.
pub fn load_config<P: AsRef<Path>>(path: P, role: Role) -> Result<CronConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, ?role, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;
    let mut config = parse_config(&content)
        .with_context(|| format!("Failed to parse config YAML {path_ref:?}"))?;
    apply_env_overrides(&mut config)?;
    validate(&config, role)?;
    config.trace_loaded();
    Ok(config)
}

/// Parse YAML into a config; an empty document yields the defaults.
pub fn parse_config(content: &str) -> Result<CronConfig> {
    if content.trim().is_empty() {
        return Ok(CronConfig::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value `{raw}` for {ENV_PREFIX}{name}: {e}")),
        None => Ok(None),
    }
}

fn override_string(target: &mut Option<String>, name: &str) {
    if let Some(value) = env_var(name) {
        debug!(variable = %format!("{ENV_PREFIX}{name}"), "Applying environment override");
        *target = Some(value);
    }
}

/// Overwrite config values with any `REPO_CRON_*` variables that are set.
pub fn apply_env_overrides(config: &mut CronConfig) -> Result<()> {
    override_string(&mut config.topic_url, "TOPIC_URL");
    override_string(&mut config.subscription_url, "SUBSCRIPTION_URL");
    override_string(&mut config.results_bucket_url, "RESULTS_BUCKET_URL");
    override_string(&mut config.raw_results_bucket_url, "RAW_RESULTS_BUCKET_URL");
    override_string(&mut config.input_bucket_url, "INPUT_BUCKET_URL");
    override_string(&mut config.input_prefix, "INPUT_PREFIX");
    override_string(&mut config.webhook_url, "WEBHOOK_URL");
    if let Some(v) = env_parse("SHARD_SIZE")? {
        config.shard_size = v;
    }
    if let Some(v) = env_parse("COMPLETION_THRESHOLD")? {
        config.completion_threshold = v;
    }
    if let Some(v) = env_parse("IGNORE_RUNTIME_ERRORS")? {
        config.ignore_runtime_errors = v;
    }
    if let Some(v) = env_var("BUILD_VERSION") {
        config.build_version = v;
    }
    Ok(())
}

fn require(value: &Option<String>, key: &str) -> Result<()> {
    match value {
        Some(v) if !v.is_empty() => Ok(()),
        _ => {
            let variable = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            error!(setting = key, %variable, "Missing required setting");
            bail!("missing required setting `{key}` (set it in the config file or {variable})")
        }
    }
}

/// Check that everything `role` needs is present and in range.
pub fn validate(config: &CronConfig, role: Role) -> Result<()> {
    if config.shard_size == 0 {
        bail!("shard_size must be at least 1");
    }
    if !(0.0..=1.0).contains(&config.completion_threshold) {
        bail!(
            "completion_threshold must be between 0 and 1, got {}",
            config.completion_threshold
        );
    }
    match role {
        Role::Controller => {
            require(&config.topic_url, "topic_url")?;
            require(&config.results_bucket_url, "results_bucket_url")?;
        }
        Role::Worker => {
            require(&config.subscription_url, "subscription_url")?;
            require(&config.results_bucket_url, "results_bucket_url")?;
        }
        Role::Transfer => {
            require(&config.results_bucket_url, "results_bucket_url")?;
            if config.warehouse.is_none() {
                bail!("missing required `warehouse` section for transfer");
            }
        }
        // local mode falls back to in-memory queues and buckets
        Role::Local => {}
    }
    Ok(())
}
