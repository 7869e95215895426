use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::queue::{SubscriberOptions, DEFAULT_MAX_DELIVERY_ATTEMPTS};
use crate::worker::WorkerOptions;

fn default_shard_size() -> usize {
    100
}

fn default_threshold() -> f64 {
    0.9
}

fn default_build_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Immutable run configuration, built once at process start and handed to
/// each component's constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronConfig {
    /// Topic the controller publishes shards to.
    #[serde(default)]
    pub topic_url: Option<String>,
    /// Subscription workers pull shards from.
    #[serde(default)]
    pub subscription_url: Option<String>,
    #[serde(default)]
    pub results_bucket_url: Option<String>,
    #[serde(default)]
    pub raw_results_bucket_url: Option<String>,
    /// Read the repository list from this bucket when no input files are given.
    #[serde(default)]
    pub input_bucket_url: Option<String>,
    #[serde(default)]
    pub input_prefix: Option<String>,
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,
    #[serde(default = "default_threshold")]
    pub completion_threshold: f64,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub ignore_runtime_errors: bool,
    /// Recorded as `commit_sha` in every job's shard metadata.
    #[serde(default = "default_build_version")]
    pub build_version: String,
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,
    #[serde(default)]
    pub queue: QueueTiming,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            topic_url: None,
            subscription_url: None,
            results_bucket_url: None,
            raw_results_bucket_url: None,
            input_bucket_url: None,
            input_prefix: None,
            shard_size: default_shard_size(),
            completion_threshold: default_threshold(),
            webhook_url: None,
            ignore_runtime_errors: false,
            build_version: default_build_version(),
            warehouse: None,
            queue: QueueTiming::default(),
        }
    }
}

/// Destination of completed jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
    /// Table for `transfer --raw`.
    #[serde(default)]
    pub raw_table: Option<String>,
}

/// Queue timing, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTiming {
    pub empty_backoff_secs: u64,
    pub ack_deadline_secs: u64,
    pub extend_interval_secs: u64,
    pub max_transport_retries: u32,
    /// Deliveries of one shard before the in-process broker of `local` mode
    /// dead-letters it. Pub/Sub applies its own dead-letter policy.
    pub max_delivery_attempts: u32,
}

impl Default for QueueTiming {
    fn default() -> Self {
        let options = SubscriberOptions::default();
        Self {
            empty_backoff_secs: options.empty_backoff.as_secs(),
            ack_deadline_secs: options.ack_deadline.as_secs(),
            extend_interval_secs: options.extend_interval.as_secs(),
            max_transport_retries: options.max_transport_retries,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}

impl CronConfig {
    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            empty_backoff: Duration::from_secs(self.queue.empty_backoff_secs),
            ack_deadline: Duration::from_secs(self.queue.ack_deadline_secs),
            extend_interval: Duration::from_secs(self.queue.extend_interval_secs),
            max_transport_retries: self.queue.max_transport_retries,
        }
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.queue.ack_deadline_secs)
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            ignore_runtime_errors: self.ignore_runtime_errors,
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            topic_url = ?self.topic_url,
            subscription_url = ?self.subscription_url,
            results_bucket_url = ?self.results_bucket_url,
            raw_results_bucket_url = ?self.raw_results_bucket_url,
            shard_size = self.shard_size,
            completion_threshold = self.completion_threshold,
            webhook = self.webhook_url.is_some(),
            ignore_runtime_errors = self.ignore_runtime_errors,
            build_version = %self.build_version,
            "Loaded CronConfig"
        );
        debug!(?self, "CronConfig loaded (full debug)");
    }
}
