//! Git reachability analyzer: the [`RepoAnalyzer`] the worker binary ships.
//!
//! Probes each repository with `git ls-remote` and records the resolved
//! commit. An unreachable repository is skipped, while failing to run git at
//! all fails the shard so another worker can retry it.

use async_trait::async_trait;
use chrono::Utc;
use repo_cron_core::contract::{AnalysisOutput, ProcessError, RepoAnalyzer};
use repo_cron_core::data::RepositoryDescriptor;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One advertised ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitRef {
    pub sha: String,
    pub name: String,
}

/// Parse `git ls-remote` output: one `<sha>\t<ref>` per line.
pub fn parse_ls_remote(stdout: &str) -> Vec<GitRef> {
    stdout
        .lines()
        .filter_map(|line| {
            let (sha, name) = line.split_once('\t')?;
            Some(GitRef {
                sha: sha.trim().to_string(),
                name: name.trim().to_string(),
            })
        })
        .collect()
}

fn looks_like_sha(reference: &str) -> bool {
    (7..=40).contains(&reference.len()) && reference.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct GitProbeAnalyzer {
    git: String,
    timeout: Duration,
    analyzed: AtomicU64,
    skipped: AtomicU64,
}

impl Default for GitProbeAnalyzer {
    fn default() -> Self {
        Self::new("git", DEFAULT_TIMEOUT)
    }
}

impl GitProbeAnalyzer {
    pub fn new(git: impl Into<String>, timeout: Duration) -> Self {
        Self {
            git: git.into(),
            timeout,
            analyzed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// `(analyzed, skipped)` since construction.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.analyzed.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        )
    }

    fn skip(&self, error: ProcessError) -> Result<AnalysisOutput, ProcessError> {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        Err(error)
    }
}

#[async_trait]
impl RepoAnalyzer for GitProbeAnalyzer {
    async fn process(&self, repo: &RepositoryDescriptor) -> Result<AnalysisOutput, ProcessError> {
        let url = format!("https://{}", repo.url);
        let reference = repo.commit.as_deref().unwrap_or("HEAD");
        debug!(repo = %repo.url, reference, "Probing repository");

        let mut command = Command::new(&self.git);
        command
            .args(["ls-remote", url.as_str(), reference])
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                return self.skip(ProcessError::Unreachable(format!(
                    "{url}: no answer within {:?}",
                    self.timeout
                )))
            }
            Ok(Err(e)) => {
                return Err(ProcessError::Analysis(format!("failed to run {}: {e}", self.git)))
            }
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return self.skip(ProcessError::Unreachable(format!("{url}: {}", stderr.trim())));
        }

        let refs = parse_ls_remote(&String::from_utf8_lossy(&output.stdout));
        let commit = match (refs.first(), repo.commit.as_deref()) {
            (Some(first), _) => first.sha.clone(),
            // ls-remote only matches ref names; a pinned sha is taken as given
            (None, Some(pinned)) if looks_like_sha(pinned) => pinned.to_string(),
            (None, _) => {
                warn!(repo = %repo.url, reference, "Reference not found");
                return self.skip(ProcessError::Unsupported(format!(
                    "{url}: reference `{reference}` not found"
                )));
            }
        };

        self.analyzed.fetch_add(1, Ordering::Relaxed);
        Ok(AnalysisOutput {
            result: json!({
                "repo": repo.url,
                "commit": commit,
                "metadata": repo.metadata,
                "date": Utc::now().to_rfc3339(),
            }),
            raw: Some(json!({ "repo": repo.url, "refs": refs })),
        })
    }

    async fn post_process(&self) {
        let (analyzed, skipped) = self.counters();
        info!(analyzed, skipped, "Analyzer counters");
    }
}
