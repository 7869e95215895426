//! # contract: interfaces to the collaborators the pipeline does not own
//!
//! The batch pipeline drives three external systems through narrow traits so
//! that production clients, local stand-ins and test mocks are interchangeable:
//!
//! - [`RepoAnalyzer`]: the per-repository analysis callback run by workers.
//! - [`Warehouse`]: the downstream store that shard results are loaded into.
//! - [`Webhook`]: an optional notification sent after a job was loaded.
//!
//! ## Mocking & Testing
//! - Each trait is annotated for `mockall`; the mocks are exported behind the
//!   `test-export-mocks` feature so integration tests and dependent crates can
//!   use them.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::data::RepositoryDescriptor;

/// Output of analyzing one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    /// Row written to the primary results (one JSON line per repository).
    pub result: serde_json::Value,
    /// Optional detailed row for the raw results; `result` is used when absent.
    pub raw: Option<serde_json::Value>,
}

impl AnalysisOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self { result, raw: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The repository could not be reached (deleted, private, host down).
    #[error("repository unreachable: {0}")]
    Unreachable(String),
    /// The repository exists but cannot be analyzed by this worker.
    #[error("repository unsupported: {0}")]
    Unsupported(String),
    /// Anything else, including analyzer bugs.
    #[error("analysis failed: {0}")]
    Analysis(String),
}

impl ProcessError {
    /// Whether the worker should skip the repository and keep going.
    pub fn is_skippable(&self) -> bool {
        matches!(self, ProcessError::Unreachable(_) | ProcessError::Unsupported(_))
    }
}

/// The per-repository analysis callback.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RepoAnalyzer: Send + Sync {
    async fn process(&self, repo: &RepositoryDescriptor) -> Result<AnalysisOutput, ProcessError>;

    /// Called after a shard was acknowledged, e.g. to flush buffered metrics.
    async fn post_process(&self);
}

/// Boxed error for the downstream collaborators, like the other injected
/// contracts.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// One partition load: every shard result of a job into the job date's partition.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    /// Wildcard URI of the shard objects, e.g. `gs://b/2024.01.02/150405/shard-*`.
    pub source_uri: String,
    pub partition: NaiveDate,
    pub job_time: DateTime<Utc>,
}

/// The downstream warehouse. A load must fully overwrite the partition so
/// that repeating it is safe.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn load_partition(&self, request: LoadRequest) -> Result<(), CollaboratorError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Webhook: Send + Sync {
    /// Deliver the raw shard metadata of a freshly loaded job.
    async fn notify(&self, payload: Vec<u8>) -> Result<(), CollaboratorError>;
}
