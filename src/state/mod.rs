//! Materialized run state.
//!
//! `RunState` is never edited directly. It is produced by folding the run's
//! ledger with [`fold`] and advanced one event at a time with [`apply`].

mod projector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::ledger::RunId;

pub use projector::{apply, fold};

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    InProgress,
    AwaitingFeedback,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether an explicit resume may continue this run
    pub fn is_resumable(self) -> bool {
        !self.is_final()
    }

    /// No later workflow event changes a final status
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingFeedback => "awaiting_feedback",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Completed or deliberately skipped; resume passes over these
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub name: String,
    pub status: PhaseStatus,
    /// Step ids in the order they completed
    pub completed_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub phase: String,
    pub step_id: String,
    pub index: usize,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Whether ground truth confirmed the last completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

/// An error recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Where a halted run picks up again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub phase: String,
    pub step_index: usize,
}

/// Outstanding question for a human
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub request_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub resume_point: ResumePoint,
    pub requested_at: DateTime<Utc>,
}

/// A feedback answer, and the approval decision if one was made
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub request_id: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Handle of the injected context blob for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    #[serde(default)]
    pub phases: Vec<PhaseState>,
    /// Keyed by `phase/step_id`
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_feedback: Option<FeedbackRequest>,
    #[serde(default)]
    pub feedback: Vec<FeedbackRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run: Option<RunId>,
    pub last_event_id: u64,
    /// Events of kinds this version does not understand
    #[serde(default)]
    pub unrecognized_events: u64,
}

pub(crate) fn step_key(phase: &str, step_id: &str) -> String {
    format!("{phase}/{step_id}")
}

impl RunState {
    pub fn step(&self, phase: &str, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(&step_key(phase, step_id))
    }

    pub fn step_status(&self, phase: &str, step_id: &str) -> StepStatus {
        self.step(phase, step_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// The most recent error tied to a step
    pub fn last_step_failure(&self) -> Option<&RunError> {
        self.errors.iter().rev().find(|e| e.step.is_some())
    }

    /// Steps ordered as they appear in the ledger (phase, then index)
    pub fn steps_in_phase(&self, phase: &str) -> Vec<&StepRecord> {
        let mut steps: Vec<&StepRecord> =
            self.steps.values().filter(|s| s.phase == phase).collect();
        steps.sort_by_key(|s| s.index);
        steps
    }

    /// Most recent feedback answer for a request
    pub fn feedback_for(&self, request_id: &str) -> Option<&FeedbackRecord> {
        self.feedback.iter().rev().find(|f| f.request_id == request_id)
    }
}
