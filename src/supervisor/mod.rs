//! Step supervisor.
//!
//! Drives a plan one step at a time: every step is started in the ledger,
//! delegated to the execution agent, checked against ground truth and only
//! then recorded as complete. A failure halts the run; nothing is retried
//! without an explicit resume, rerun or applied fix.

mod execution;
mod machine;
mod runner;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::issues::{KnowledgeError, Solution, Suggestion};
use crate::ledger::{AutonomyLevel, InvalidRunId, LedgerError, RunId};
use crate::plan::{PlanError, StepDescriptor};
use crate::state::RunStatus;

pub use machine::{FailureKind, StepMachine, StepState, TransitionError};
pub use runner::Supervisor;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    RunId(#[from] InvalidRunId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("plan is for workflow '{plan}' but run was started from '{run}'")]
    PlanMismatch { plan: String, run: String },

    #[error("run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: RunId, status: RunStatus },

    #[error("run {run_id} is waiting for feedback on request {request_id}")]
    AwaitingFeedback { run_id: RunId, request_id: String },

    #[error("invalid resume point: {0}")]
    InvalidResumePoint(String),

    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("run {run_id} has no pending feedback request {request_id}")]
    UnknownFeedbackRequest { run_id: RunId, request_id: String },

    #[error("run {run_id} is {status}; fixes can only be applied to a halted run")]
    NotHalted { run_id: RunId, status: RunStatus },

    #[error("no issue knowledge base is configured")]
    NoIssueEngine,

    #[error("run {0} has already finished")]
    AlreadyFinished(RunId),
}

/// How steps are handed to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One step per delegation; the supervisor enforces order
    #[default]
    Sequential,
    /// All remaining steps of a phase in one delegation; order is the agent's
    Batched,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Matched against hook environment allow-lists
    pub environment: String,
    pub mode: ExecutionMode,
    /// Upper bound for one delegation
    pub step_timeout: Duration,
    /// Working directory for hooks; also used to derive the run scope
    pub base_dir: PathBuf,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            environment: "local".to_string(),
            mode: ExecutionMode::Sequential,
            step_timeout: Duration::from_secs(30 * 60),
            base_dir: PathBuf::from("."),
        }
    }
}

/// Options for a fresh run
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// External work item the run belongs to; defaults to the workflow id
    pub work_id: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub autonomy: AutonomyLevel,
    pub plan_path: Option<PathBuf>,
    /// `(organization, project)`; derived from the repository when absent
    pub scope: Option<(String, String)>,
}

/// Options for a lineage-linked rerun
#[derive(Debug, Clone, Default)]
pub struct RerunOptions {
    /// Phases before this one are recorded as skipped
    pub from_phase: Option<String>,
    /// Overrides merged over the parent's parameters
    pub parameters: BTreeMap<String, String>,
}

/// Everything an operator needs after a run stops on a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHalt {
    pub run_id: RunId,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub step_index: usize,
    /// Raw error text as recorded in the ledger
    pub error: String,
    pub kind: FailureKind,
    pub resume_command: String,
    /// Knowledge base id of the recorded error, if one is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Suggestion>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        run_id: RunId,
    },
    Halted(Box<RunHalt>),
    AwaitingFeedback {
        run_id: RunId,
        request_id: String,
        prompt: String,
    },
    /// Another caller cancelled the run while it was being driven
    Cancelled {
        run_id: RunId,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Completed { run_id }
            | Self::AwaitingFeedback { run_id, .. }
            | Self::Cancelled { run_id } => run_id,
            Self::Halted(halt) => &halt.run_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn halt(&self) -> Option<&RunHalt> {
        match self {
            Self::Halted(halt) => Some(halt),
            _ => None,
        }
    }
}

/// Result of applying a knowledge-base fix to a halted run
#[derive(Debug, Clone, PartialEq)]
pub struct FixOutcome {
    pub step: StepDescriptor,
    pub success: bool,
    pub error: Option<String>,
    /// Solution with its updated track record
    pub solution: Solution,
    /// Resume command for the failure the fix addressed
    pub resume_command: Option<String>,
}

pub fn resume_command(run_id: &RunId, phase: &str, step_index: usize) -> String {
    format!("runwarden resume {run_id} --phase {phase} --step {step_index}")
}
