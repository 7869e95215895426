///
/// This module implements the CLI surface of repo-cron: command parsing and
/// the wiring of configuration, queue backend, buckets and collaborators for
/// each process role.
///
/// All pipeline logic (sharding, worker loop, summarizer, transfer) lives in
/// the [`repo-cron-core`] crate. This module is strictly glue.
///
/// ## Subcommands
/// - `controller`: read the repository list, publish shards, write metadata.
/// - `worker`: pull and process shards until the subscription shuts down.
/// - `transfer`: load completed jobs into the warehouse.
/// - `local`: controller, workers and a summary in one process, in memory.
///
/// For programmatic and integration use, call [`run`] with a constructed [`Cli`].
///
/// [`repo-cron-core`]: ../../repo-cron-core/
use crate::analyzer::GitProbeAnalyzer;
use crate::bigquery::{BigQueryWarehouse, TableRef};
use crate::load_config::{load_config, Role};
use crate::webhook::HttpWebhook;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use repo_cron_core::config::CronConfig;
use repo_cron_core::contract::{RepoAnalyzer, Webhook};
use repo_cron_core::controller::{publish_shards, write_shard_metadata, PublishSummary};
use repo_cron_core::data::job_timestamp;
use repo_cron_core::input::{iterator_from_bucket, iterator_from_files, NestedIterator};
use repo_cron_core::queue::{new_publisher, new_subscriber, MemoryBroker, QueueBackend};
use repo_cron_core::storage::Bucket;
use repo_cron_core::summary::summarize;
use repo_cron_core::transfer::transfer;
use repo_cron_core::worker::Worker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const LOCAL_QUEUE_URL: &str = "mem://shards";
const LOCAL_RESULTS_URL: &str = "mem://results";

/// CLI for repo-cron: sharded, queue-driven repository analysis.
#[derive(Parser)]
#[clap(
    name = "repo-cron",
    version,
    about = "Shard a repository list, analyze it with a pool of workers, and load finished jobs into BigQuery"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish the repository list as shards and record the job's shard count
    Controller {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Local CSV files to read instead of the configured input bucket
        #[clap(long = "input")]
        inputs: Vec<PathBuf>,
    },
    /// Pull shards and analyze them until the subscription shuts down
    Worker {
        #[clap(long)]
        config: PathBuf,
        /// Seconds to wait for `git ls-remote` per repository
        #[clap(long, default_value_t = 30)]
        git_timeout: u64,
    },
    /// Load every completed, not yet loaded job into the warehouse
    Transfer {
        #[clap(long)]
        config: PathBuf,
        /// Transfer the raw-result bucket into the raw table
        #[clap(long)]
        raw: bool,
    },
    /// Run controller, workers and a summary in one process on in-memory queues
    Local {
        #[clap(long)]
        config: PathBuf,
        #[clap(long = "input", required = true)]
        inputs: Vec<PathBuf>,
        #[clap(long, default_value_t = 4)]
        workers: usize,
        #[clap(long, default_value_t = 30)]
        git_timeout: u64,
    },
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Controller { config, inputs } => {
            let config = load_config(config, Role::Controller)?;
            run_controller(&config, &inputs).await.map(|_| ())
        }
        Commands::Worker {
            config,
            git_timeout,
        } => {
            let config = load_config(config, Role::Worker)?;
            run_worker(&config, Duration::from_secs(git_timeout)).await
        }
        Commands::Transfer { config, raw } => {
            let config = load_config(config, Role::Transfer)?;
            run_transfer(&config, raw).await
        }
        Commands::Local {
            config,
            inputs,
            workers,
            git_timeout,
        } => {
            let config = load_config(config, Role::Local)?;
            let analyzer = Arc::new(GitProbeAnalyzer::new("git", Duration::from_secs(git_timeout)));
            run_local(&config, &inputs, workers, analyzer).await
        }
    }
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| anyhow!("missing required setting `{key}`"))
}

fn open_optional(url: &Option<String>) -> Result<Option<Bucket>> {
    url.as_deref()
        .map(|u| Bucket::open(u).with_context(|| format!("Failed to open bucket {u}")))
        .transpose()
}

async fn read_inputs(config: &CronConfig, inputs: &[PathBuf]) -> Result<NestedIterator> {
    if !inputs.is_empty() {
        tracing::info!(files = inputs.len(), "Reading repository list from local files");
        return iterator_from_files(inputs).context("Failed to open input files");
    }
    let Some(url) = config.input_bucket_url.as_deref() else {
        bail!("no --input files given and no `input_bucket_url` configured");
    };
    let bucket = Bucket::open(url).with_context(|| format!("Failed to open input bucket {url}"))?;
    iterator_from_bucket(&bucket, config.input_prefix.as_deref())
        .await
        .context("Failed to read input bucket")
}

/// Publish every shard, then write the shard metadata.
async fn publish_job(
    config: &CronConfig,
    inputs: &[PathBuf],
    backend: &QueueBackend,
    topic_url: &str,
    results: &Bucket,
    raw_results: Option<&Bucket>,
) -> Result<PublishSummary> {
    let repos = read_inputs(config, inputs).await?;
    let job_time = job_timestamp(Utc::now());
    tracing::info!(command = "controller", job_time = %job_time, "Starting job");

    let mut publisher = new_publisher(backend, topic_url)?;
    let summary = publish_shards(repos, publisher.as_mut(), config.shard_size, job_time).await?;
    if summary.shard_count == 0 {
        tracing::warn!(job_time = %job_time, "Input contained no valid repositories");
    }
    write_shard_metadata(
        results,
        raw_results,
        job_time,
        summary.shard_count,
        &config.build_version,
    )
    .await?;
    Ok(summary)
}

pub async fn run_controller(config: &CronConfig, inputs: &[PathBuf]) -> Result<PublishSummary> {
    let backend = QueueBackend::from_env()?;
    let results = Bucket::open(required(&config.results_bucket_url, "results_bucket_url")?)?;
    let raw_results = open_optional(&config.raw_results_bucket_url)?;
    let summary = publish_job(
        config,
        inputs,
        &backend,
        required(&config.topic_url, "topic_url")?,
        &results,
        raw_results.as_ref(),
    )
    .await?;
    tracing::info!(command = "controller", ?summary, "Controller finished");
    Ok(summary)
}

pub async fn run_worker(config: &CronConfig, git_timeout: Duration) -> Result<()> {
    let backend = QueueBackend::from_env()?;
    let subscriber = new_subscriber(
        &backend,
        required(&config.subscription_url, "subscription_url")?,
        config.subscriber_options(),
    )?;
    let results = Bucket::open(required(&config.results_bucket_url, "results_bucket_url")?)?;
    let raw_results = open_optional(&config.raw_results_bucket_url)?;
    let analyzer = Arc::new(GitProbeAnalyzer::new("git", git_timeout));

    let mut worker = Worker::new(subscriber, analyzer, results, raw_results, config.worker_options());
    let stats = worker.run().await?;
    tracing::info!(command = "worker", ?stats, "Worker finished");
    Ok(())
}

pub async fn run_transfer(config: &CronConfig, raw: bool) -> Result<()> {
    let warehouse_config = config
        .warehouse
        .as_ref()
        .ok_or_else(|| anyhow!("missing required `warehouse` section"))?;
    let (bucket_url, table) = if raw {
        let url = required(&config.raw_results_bucket_url, "raw_results_bucket_url")?;
        let table = warehouse_config
            .raw_table
            .clone()
            .ok_or_else(|| anyhow!("`transfer --raw` needs `warehouse.raw_table`"))?;
        (url, table)
    } else {
        (
            required(&config.results_bucket_url, "results_bucket_url")?,
            warehouse_config.table.clone(),
        )
    };

    let bucket = Bucket::open(bucket_url)?;
    let warehouse = BigQueryWarehouse::from_env(TableRef {
        project_id: warehouse_config.project_id.clone(),
        dataset: warehouse_config.dataset.clone(),
        table,
    });
    let webhook = config
        .webhook_url
        .as_deref()
        .map(|url| HttpWebhook::new(reqwest::Client::new(), url));

    let report = transfer(
        &bucket,
        &warehouse,
        webhook.as_ref().map(|w| w as &dyn Webhook),
        config.completion_threshold,
    )
    .await?;
    tracing::info!(command = "transfer", raw, ?report, "Transfer finished");
    if report.has_failures() {
        bail!("{} job(s) failed to transfer", report.failed.len());
    }
    Ok(())
}

/// Run a whole job in one process: the memory backend carries the shards and
/// the result buckets default to in-memory stores. Fails if any shard was
/// dead-lettered after exhausting its delivery attempts.
pub async fn run_local(
    config: &CronConfig,
    inputs: &[PathBuf],
    workers: usize,
    analyzer: Arc<dyn RepoAnalyzer>,
) -> Result<()> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    let broker = MemoryBroker::new(config.ack_deadline())
        .with_max_delivery_attempts(config.queue.max_delivery_attempts);
    let backend = QueueBackend::Memory(broker.clone());
    let results = Bucket::open(
        config
            .results_bucket_url
            .as_deref()
            .unwrap_or(LOCAL_RESULTS_URL),
    )?;
    let raw_results = open_optional(&config.raw_results_bucket_url)?;

    let summary = publish_job(
        config,
        inputs,
        &backend,
        LOCAL_QUEUE_URL,
        &results,
        raw_results.as_ref(),
    )
    .await?;
    broker.close();

    let mut pool = JoinSet::new();
    for id in 0..workers {
        let subscriber = new_subscriber(&backend, LOCAL_QUEUE_URL, config.subscriber_options())?;
        let mut worker = Worker::new(
            subscriber,
            analyzer.clone(),
            results.clone(),
            raw_results.clone(),
            config.worker_options(),
        );
        pool.spawn(async move { (id, worker.run().await) });
    }
    while let Some(joined) = pool.join_next().await {
        let (id, result) = joined.context("Worker task panicked")?;
        let stats = result.with_context(|| format!("Worker {id} failed"))?;
        tracing::info!(worker = id, ?stats, "Local worker finished");
    }

    let bucket_summary = summarize(&results).await?;
    if let Some(group) = bucket_summary.get(&summary.job_time) {
        tracing::info!(
            command = "local",
            job_time = %summary.job_time,
            expected = group.expected,
            created = group.created,
            completed = group.is_completed(config.completion_threshold),
            broker = ?broker.stats(),
            "Local run finished"
        );
    }
    let dead_lettered = broker.stats().dead_lettered;
    if dead_lettered > 0 {
        bail!("{dead_lettered} shard(s) exhausted their delivery attempts and were dead-lettered");
    }
    Ok(())
}
