//! Repository list input: CSV sources turned into a lazy sequence of
//! validated [`RepositoryDescriptor`]s.
//!
//! A source is CSV with a header row:
//!
//! ```text
//! repo,metadata
//! # comment lines are skipped
//! github.com/owner/repo,"tag-a,tag-b"
//! https://gitlab.com/group/project,
//! ```
//!
//! Each bad row produces one `Err` item; iteration continues afterwards.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};
use tracing::{debug, info};
use url::Url;

use crate::data::RepositoryDescriptor;
use crate::storage::{Bucket, StorageError};

/// Hosts the analyzers know how to talk to.
pub const SUPPORTED_HOSTS: &[&str] = &["github.com", "gitlab.com"];

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("unsupported host `{host}` for repo `{repo}`")]
    UnsupportedHost { repo: String, host: String },
    #[error("invalid repo url `{repo}`: {reason}")]
    InvalidUrl { repo: String, reason: String },
    #[error("input is missing the required `{0}` column")]
    MissingColumn(&'static str),
    #[error("malformed csv row: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to open input: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read input from bucket: {0}")]
    Storage(#[from] StorageError),
}

/// The item type every input iterator yields.
pub type InputItem = Result<RepositoryDescriptor, InputError>;

/// A boxed input iterator, as composed by [`NestedIterator`].
pub type RepoIter = Box<dyn Iterator<Item = InputItem> + Send>;

/// Validate a raw repo reference and return its canonical `host/owner/repo`.
pub fn parse_repo_url(raw: &str) -> Result<String, InputError> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| InputError::InvalidUrl {
        repo: raw.to_string(),
        reason: reason.to_string(),
    };
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(invalid("scheme must be http or https"));
    }
    let host = url
        .host_str()
        .ok_or_else(|| invalid("missing host"))?
        .trim_start_matches("www.")
        .to_ascii_lowercase();
    if !SUPPORTED_HOSTS.contains(&host.as_str()) {
        return Err(InputError::UnsupportedHost {
            repo: raw.to_string(),
            host,
        });
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let path_ok = match host.as_str() {
        "github.com" => segments.len() == 2,
        _ => segments.len() >= 2,
    };
    if !path_ok {
        return Err(invalid("expected <owner>/<repo> path"));
    }
    let path = segments.join("/");
    let path = path.strip_suffix(".git").unwrap_or(&path);
    Ok(format!("{host}/{path}"))
}

/// Iterator over one CSV source.
pub struct CsvIterator<R: Read> {
    records: StringRecordsIntoIter<R>,
    repo_col: usize,
    metadata_col: Option<usize>,
    commit_col: Option<usize>,
}

impl<R: Read> CsvIterator<R> {
    /// Read the header row; fails if the `repo` column is absent.
    pub fn new(reader: R) -> Result<Self, InputError> {
        let mut csv = ReaderBuilder::new()
            .comment(Some(b'#'))
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let position = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let repo_col = position("repo").ok_or(InputError::MissingColumn("repo"))?;
        Ok(Self {
            repo_col,
            metadata_col: position("metadata"),
            commit_col: position("commit"),
            records: csv.into_records(),
        })
    }

    fn descriptor(&self, record: &StringRecord) -> InputItem {
        let raw = record.get(self.repo_col).unwrap_or_default();
        let url = parse_repo_url(raw)?;
        let commit = self
            .commit_col
            .and_then(|i| record.get(i))
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let metadata = self
            .metadata_col
            .and_then(|i| record.get(i))
            .map(|m| {
                m.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(RepositoryDescriptor {
            url,
            commit,
            metadata,
        })
    }
}

impl<R: Read> Iterator for CsvIterator<R> {
    type Item = InputItem;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(match record {
            Ok(record) => self.descriptor(&record),
            Err(e) => Err(InputError::Csv(e)),
        })
    }
}

/// Chains several iterators, exhausting each before moving to the next.
pub struct NestedIterator {
    sources: VecDeque<RepoIter>,
}

impl NestedIterator {
    pub fn new(sources: Vec<RepoIter>) -> Self {
        Self {
            sources: sources.into(),
        }
    }
}

impl Iterator for NestedIterator {
    type Item = InputItem;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current) = self.sources.front_mut() {
            if let Some(item) = current.next() {
                return Some(item);
            }
            self.sources.pop_front();
        }
        None
    }
}

/// Open local CSV files as one sequence.
pub fn iterator_from_files<P: AsRef<Path>>(paths: &[P]) -> Result<NestedIterator, InputError> {
    let mut sources: Vec<RepoIter> = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        debug!(path = %path.display(), "Opening input file");
        let file = BufReader::new(File::open(path)?);
        sources.push(Box::new(CsvIterator::new(file)?));
    }
    Ok(NestedIterator::new(sources))
}

/// Every object under `prefix` in `bucket`, in key order, as one sequence.
pub async fn iterator_from_bucket(
    bucket: &Bucket,
    prefix: Option<&str>,
) -> Result<NestedIterator, InputError> {
    let mut keys = bucket.list_keys(prefix).await?;
    keys.sort();
    info!(bucket = %bucket.url(), prefix = ?prefix, files = keys.len(), "Reading input from bucket");
    let mut sources: Vec<RepoIter> = Vec::with_capacity(keys.len());
    for key in keys {
        let bytes = bucket.read(&key).await?;
        sources.push(Box::new(CsvIterator::new(Cursor::new(bytes))?));
    }
    Ok(NestedIterator::new(sources))
}
