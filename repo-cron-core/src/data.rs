//! Shared data model: repository descriptors, shard messages, shard metadata
//! and the object key layout used by every stage of the pipeline.
//!
//! Objects for one job live under `<YYYY.MM.DD>/<HHMMSS>/` relative to the
//! bucket root:
//!
//! ```text
//! 2024.01.02/150405/shard-0000000
//! 2024.01.02/150405/shard-0000001
//! 2024.01.02/150405/.shard_metadata
//! 2024.01.02/150405/.transfer_complete
//! ```

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Name of the per-job metadata object written by the controller.
pub const SHARD_METADATA_FILENAME: &str = ".shard_metadata";
/// Name of the presence-only marker written once a job was loaded downstream.
pub const TRANSFER_STATUS_FILENAME: &str = ".transfer_complete";
/// Prefix shared by every shard result object.
pub const SHARD_PREFIX: &str = "shard-";

const KEY_TIME_FORMAT: &str = "%Y.%m.%d/%H%M%S";

/// One repository to analyze.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Canonical `host/owner/repo` form.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<String>,
}

impl RepositoryDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            commit: None,
            metadata: Vec::new(),
        }
    }
}

/// A shard message: one bounded slice of a job's repository list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub job_time: DateTime<Utc>,
    pub shard_num: i32,
    #[serde(default)]
    pub repos: Vec<RepositoryDescriptor>,
}

impl BatchRequest {
    pub fn new(job_time: DateTime<Utc>, shard_num: i32) -> Self {
        Self {
            job_time,
            shard_num,
            repos: Vec::new(),
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a wire payload. Unknown fields are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Deterministic key of this shard's result object.
    pub fn result_key(&self) -> String {
        blob_key(&shard_filename(self.shard_num), self.job_time)
    }
}

/// Per-job record of how many shards the controller published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub num_shard: i32,
    pub shard_loc: String,
    pub commit_sha: String,
}

/// Truncate a timestamp to the second precision the key layout can express.
pub fn job_timestamp(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_nanosecond(0).unwrap_or(now)
}

/// `shard-0000042`
pub fn shard_filename(shard_num: i32) -> String {
    format!("{SHARD_PREFIX}{shard_num:07}")
}

/// Object key of `filename` for the job started at `job_time`. An empty
/// filename yields the job's directory prefix, with trailing slash.
pub fn blob_key(filename: &str, job_time: DateTime<Utc>) -> String {
    format!("{}/{}", job_time.format(KEY_TIME_FORMAT), filename)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("object key `{key}` does not match <YYYY.MM.DD>/<HHMMSS>/<name>")]
pub struct KeyError {
    pub key: String,
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4}\.\d{2}\.\d{2}/\d{6})/([^/]+)$").expect("static key pattern is valid")
    })
}

/// Split an object key into its job timestamp and object name.
pub fn parse_blob_key(key: &str) -> Result<(DateTime<Utc>, String), KeyError> {
    let err = || KeyError {
        key: key.to_string(),
    };
    let captures = key_pattern().captures(key).ok_or_else(err)?;
    let naive = NaiveDateTime::parse_from_str(&captures[1], KEY_TIME_FORMAT).map_err(|_| err())?;
    Ok((naive.and_utc(), captures[2].to_string()))
}
