//! Systems of record queried for ground truth.

use anyhow::Result;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{instrument, warn};

use super::gh_cli::GhCli;
use crate::git::GitCli;

/// State of a tracked change request (pull/merge request)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Open,
    Merged,
    Closed,
    Missing,
}

impl RequestState {
    pub fn from_gh(state: &str) -> Self {
        match state.to_uppercase().as_str() {
            "OPEN" => Self::Open,
            "MERGED" => Self::Merged,
            _ => Self::Closed,
        }
    }
}

/// Local and remote commit for one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHeads {
    pub local: String,
    pub remote: Option<String>,
}

impl BranchHeads {
    pub fn in_sync(&self) -> bool {
        self.remote.as_deref() == Some(self.local.as_str())
    }
}

/// Provider-agnostic access to version control and the issue tracker.
///
/// Every method answers from the external system itself; nothing here looks
/// at what the agent reported.
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    /// Provider name (e.g., "github")
    fn name(&self) -> &str;

    async fn repository_exists(&self, repo: &str) -> Result<bool>;

    async fn branch_exists(&self, remote: &str, branch: &str) -> Result<bool>;

    async fn branch_heads(&self, remote: &str, branch: &str) -> Result<BranchHeads>;

    async fn request_state(&self, repo: Option<&str>, number: u64) -> Result<RequestState>;

    async fn item_exists(&self, repo: Option<&str>, number: u64) -> Result<bool>;
}

/// git + GitHub, through the `git` and `gh` CLIs, with retry on transient errors
pub struct GitHubRecord {
    repo_path: PathBuf,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl GitHubRecord {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Create with custom retry settings
    pub fn with_retry_config(
        repo_path: impl Into<PathBuf>,
        max_retries: usize,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            max_retries,
            base_delay,
            max_delay,
        }
    }

    fn retry_strategy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }

    /// Network and rate-limit failures are worth another try; auth is not
    fn should_retry(err: &anyhow::Error) -> bool {
        let err_str = err.to_string().to_lowercase();

        if err_str.contains("401")
            || err_str.contains("403")
            || err_str.contains("unauthorized")
            || err_str.contains("not logged in")
        {
            return false;
        }

        err_str.contains("timeout")
            || err_str.contains("timed out")
            || err_str.contains("connection")
            || err_str.contains("temporary")
            || err_str.contains("rate limit")
            || err_str.contains("502")
            || err_str.contains("503")
            || err_str.contains("504")
    }
}

#[async_trait]
impl SystemOfRecord for GitHubRecord {
    fn name(&self) -> &str {
        "github"
    }

    #[instrument(skip(self))]
    async fn repository_exists(&self, repo: &str) -> Result<bool> {
        let op = || async { GhCli::repo_exists(repo, &self.repo_path).await };
        op.retry(self.retry_strategy())
            .when(Self::should_retry)
            .notify(|err, dur| warn!("Retrying repository_exists after {:?}: {}", dur, err))
            .await
    }

    #[instrument(skip(self))]
    async fn branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        let op = || async { GitCli::remote_branch_exists(&self.repo_path, remote, branch).await };
        op.retry(self.retry_strategy())
            .when(Self::should_retry)
            .notify(|err, dur| warn!("Retrying branch_exists after {:?}: {}", dur, err))
            .await
    }

    #[instrument(skip(self))]
    async fn branch_heads(&self, remote: &str, branch: &str) -> Result<BranchHeads> {
        let local = GitCli::rev_parse(&self.repo_path, branch).await?;
        let op = || async { GitCli::remote_head(&self.repo_path, remote, branch).await };
        let remote = op
            .retry(self.retry_strategy())
            .when(Self::should_retry)
            .notify(|err, dur| warn!("Retrying branch_heads after {:?}: {}", dur, err))
            .await?;
        Ok(BranchHeads { local, remote })
    }

    #[instrument(skip(self))]
    async fn request_state(&self, repo: Option<&str>, number: u64) -> Result<RequestState> {
        let op = || async { GhCli::pr_state(repo, number, &self.repo_path).await };
        op.retry(self.retry_strategy())
            .when(Self::should_retry)
            .notify(|err, dur| warn!("Retrying request_state after {:?}: {}", dur, err))
            .await
    }

    #[instrument(skip(self))]
    async fn item_exists(&self, repo: Option<&str>, number: u64) -> Result<bool> {
        let op = || async { GhCli::issue_exists(repo, number, &self.repo_path).await };
        op.retry(self.retry_strategy())
            .when(Self::should_retry)
            .notify(|err, dur| warn!("Retrying item_exists after {:?}: {}", dur, err))
            .await
    }
}
