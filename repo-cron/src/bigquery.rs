//! # BigQuery warehouse client
//!
//! Implements [`Warehouse`] over the BigQuery REST API: one `jobs.insert` load
//! job per job partition, then `jobs.get` polling until the job is done.
//!
//! Each load targets `<table>$YYYYMMDD` with `WRITE_TRUNCATE`, so repeating a
//! load replaces the partition instead of appending to it. A job still running
//! after the maximum wait counts as failed; the next transfer pass retries it.
//!
//! - Construct with [`BigQueryWarehouse::from_env`] in production
//!   (`BIGQUERY_ENDPOINT` overrides the API host, credentials come from the
//!   shared Google token source).
//! - Tests point [`BigQueryWarehouse::new`] at a mock server without auth.

use async_trait::async_trait;
use repo_cron_core::auth::TokenSource;
use repo_cron_core::contract::{CollaboratorError, LoadRequest, Warehouse};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const ENDPOINT_ENV: &str = "BIGQUERY_ENDPOINT";
const BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
}

pub struct BigQueryWarehouse {
    http: reqwest::Client,
    endpoint: String,
    auth: Option<Arc<TokenSource>>,
    table: TableRef,
    poll_interval: Duration,
    max_wait: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    #[serde(default)]
    status: JobStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<Value>,
}

impl BigQueryWarehouse {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        auth: Option<Arc<TokenSource>>,
        table: TableRef,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            auth,
            table,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn from_env(table: TableRef) -> Self {
        let http = reqwest::Client::new();
        let endpoint = std::env::var(ENDPOINT_ENV)
            .ok()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| BIGQUERY_ENDPOINT.to_string());
        let auth = Arc::new(TokenSource::from_env(http.clone()));
        tracing::info!(
            endpoint = %endpoint,
            project_id = %table.project_id,
            dataset = %table.dataset,
            table = %table.table,
            "Initialized BigQuery client"
        );
        Self::new(http, endpoint, Some(auth), table)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Give up on a load job that is not done after `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Body of the `jobs.insert` call for one partition load.
    pub fn load_job_body(&self, request: &LoadRequest) -> Value {
        json!({
            "configuration": {
                "load": {
                    "sourceUris": [request.source_uri],
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "destinationTable": {
                        "projectId": self.table.project_id,
                        "datasetId": self.table.dataset,
                        "tableId": format!("{}${}", self.table.table, request.partition.format("%Y%m%d")),
                    },
                    "writeDisposition": "WRITE_TRUNCATE",
                    "autodetect": true,
                }
            }
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Job, CollaboratorError> {
        let request = match &self.auth {
            Some(auth) => request.bearer_auth(auth.token().await?),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, "BigQuery API error");
            return Err(format!("BigQuery API error {status}: {body}").into());
        }
        Ok(response.json().await?)
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/jobs",
            self.endpoint, self.table.project_id
        )
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn load_partition(&self, request: LoadRequest) -> Result<(), CollaboratorError> {
        tracing::info!(
            source = %request.source_uri,
            partition = %request.partition,
            table = %self.table.table,
            "Starting BigQuery load job"
        );
        let body = self.load_job_body(&request);
        let mut job = self.send(self.http.post(self.jobs_url()).json(&body)).await?;
        let job_id = job.job_reference.job_id.clone();
        let location = job.job_reference.location.clone();
        let give_up_at = tokio::time::Instant::now() + self.max_wait;

        while job.status.state != "DONE" {
            if tokio::time::Instant::now() >= give_up_at {
                tracing::error!(
                    job_id = %job_id,
                    state = %job.status.state,
                    max_wait_secs = self.max_wait.as_secs(),
                    "Load job did not finish in time"
                );
                return Err(format!(
                    "load job {job_id} still {} after {:?}",
                    job.status.state, self.max_wait
                )
                .into());
            }
            tracing::debug!(job_id = %job_id, state = %job.status.state, "Waiting for load job");
            tokio::time::sleep(self.poll_interval).await;
            let mut get = self.http.get(format!("{}/{}", self.jobs_url(), job_id));
            if let Some(location) = &location {
                get = get.query(&[("location", location)]);
            }
            job = self.send(get).await?;
        }

        if let Some(error) = job.status.error_result {
            tracing::error!(job_id = %job_id, error = %error, "Load job failed");
            return Err(format!("load job {job_id} failed: {error}").into());
        }
        tracing::info!(job_id = %job_id, partition = %request.partition, "Load job finished");
        Ok(())
    }
}
