//! External verification of step completion.
//!
//! For step kinds with a known ground-truth check the verifier asks the system
//! of record directly. The agent's self-report is never consulted here; the
//! supervisor combines both.

mod gh_cli;
mod record;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::plan::StepDescriptor;
use crate::state::RunState;

pub use gh_cli::GhCli;
pub use record::{BranchHeads, GitHubRecord, RequestState, SystemOfRecord};

/// Result of checking a step against ground truth
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    /// No ground-truth check exists for this kind of step
    NotApplicable,
}

impl Verdict {
    /// Pass and NotApplicable both allow completion
    pub fn allows_completion(&self) -> bool {
        !matches!(self, Self::Fail(_))
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Step kinds that have a ground-truth check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationKind {
    CreateRepository,
    CreateBranch,
    SyncHeads,
    MergeRequest,
    CloseRequest,
    EnsureItem,
}

impl VerificationKind {
    pub fn classify(command: &str) -> Option<Self> {
        match command.trim().to_lowercase().replace('-', "_").as_str() {
            "create_repo" | "create_repository" | "create_remote" => Some(Self::CreateRepository),
            "create_branch" => Some(Self::CreateBranch),
            "push" | "sync" | "sync_branch" => Some(Self::SyncHeads),
            "merge_pr" | "merge_request" => Some(Self::MergeRequest),
            "close_pr" => Some(Self::CloseRequest),
            "create_issue" | "ensure_issue" => Some(Self::EnsureItem),
            _ => None,
        }
    }
}

/// Anything that can confirm or veto a step. The supervisor depends on this
/// seam so tests can substitute their own ground truth.
#[async_trait]
pub trait StepVerifier: Send + Sync {
    async fn verify(&self, step: &StepDescriptor, state: &RunState) -> Verdict;
}

/// Verifier backed by a [`SystemOfRecord`]
pub struct Verifier {
    record: Arc<dyn SystemOfRecord>,
    default_remote: String,
}

impl Verifier {
    pub fn new(record: Arc<dyn SystemOfRecord>) -> Self {
        Self {
            record,
            default_remote: "origin".to_string(),
        }
    }

    pub fn with_default_remote(mut self, remote: impl Into<String>) -> Self {
        self.default_remote = remote.into();
        self
    }

    /// Argument from the step descriptor, falling back to a run artifact
    fn lookup(step: &StepDescriptor, state: &RunState, key: &str) -> Option<String> {
        step.argument(key)
            .or_else(|| state.artifacts.get(key).cloned())
    }

    fn lookup_number(step: &StepDescriptor, state: &RunState, key: &str) -> Result<u64, String> {
        let raw = Self::lookup(step, state, key)
            .ok_or_else(|| format!("missing '{key}' to verify against"))?;
        raw.trim_start_matches('#')
            .parse()
            .map_err(|_| format!("'{key}' is not a number: {raw}"))
    }

    async fn check(
        &self,
        kind: VerificationKind,
        step: &StepDescriptor,
        state: &RunState,
    ) -> Result<(), String> {
        let remote = Self::lookup(step, state, "remote").unwrap_or_else(|| self.default_remote.clone());
        let repo = Self::lookup(step, state, "repo");

        match kind {
            VerificationKind::CreateRepository => {
                let repo = repo.ok_or("missing 'repo' to verify against")?;
                match self.record.repository_exists(&repo).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("repository {repo} does not exist")),
                    Err(e) => Err(format!("could not query repository {repo}: {e}")),
                }
            }
            VerificationKind::CreateBranch => {
                let branch = Self::lookup(step, state, "branch")
                    .ok_or("missing 'branch' to verify against")?;
                match self.record.branch_exists(&remote, &branch).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("branch {branch} not found on {remote}")),
                    Err(e) => Err(format!("could not query {remote}: {e}")),
                }
            }
            VerificationKind::SyncHeads => {
                let branch = Self::lookup(step, state, "branch")
                    .ok_or("missing 'branch' to verify against")?;
                match self.record.branch_heads(&remote, &branch).await {
                    Ok(heads) if heads.in_sync() => Ok(()),
                    Ok(heads) => Err(format!(
                        "{remote}/{branch} is at {} but local is at {}",
                        heads.remote.as_deref().unwrap_or("<absent>"),
                        heads.local
                    )),
                    Err(e) => Err(format!("could not compare heads of {branch}: {e}")),
                }
            }
            VerificationKind::MergeRequest | VerificationKind::CloseRequest => {
                let number = Self::lookup_number(step, state, "pr_number")?;
                let request_state = self
                    .record
                    .request_state(repo.as_deref(), number)
                    .await
                    .map_err(|e| format!("could not query request #{number}: {e}"))?;
                let accepted = match kind {
                    VerificationKind::MergeRequest => request_state == RequestState::Merged,
                    _ => matches!(request_state, RequestState::Closed | RequestState::Merged),
                };
                if accepted {
                    Ok(())
                } else {
                    Err(format!("request #{number} is {request_state:?}"))
                }
            }
            VerificationKind::EnsureItem => {
                let number = Self::lookup_number(step, state, "issue_number")?;
                match self.record.item_exists(repo.as_deref(), number).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("item #{number} does not exist")),
                    Err(e) => Err(format!("could not query item #{number}: {e}")),
                }
            }
        }
    }
}

#[async_trait]
impl StepVerifier for Verifier {
    async fn verify(&self, step: &StepDescriptor, state: &RunState) -> Verdict {
        let Some(kind) = VerificationKind::classify(&step.command) else {
            debug!(step = %step.id, command = %step.command, "No ground-truth check for step");
            return Verdict::NotApplicable;
        };

        match self.check(kind, step, state).await {
            Ok(()) => {
                debug!(step = %step.id, ?kind, record = self.record.name(), "Step verified");
                Verdict::Pass
            }
            Err(reason) => {
                warn!(step = %step.id, ?kind, %reason, "Ground truth disagrees with step");
                Verdict::Fail(reason)
            }
        }
    }
}

/// Verifier that has no checks; every step is unverified
pub struct NoopVerifier;

#[async_trait]
impl StepVerifier for NoopVerifier {
    async fn verify(&self, _step: &StepDescriptor, _state: &RunState) -> Verdict {
        Verdict::NotApplicable
    }
}
