//! Event records stored in a run ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a ledger event.
///
/// Known kinds are listed explicitly. Anything else read from disk is kept as
/// `Other` so that newer ledgers survive a round trip through older code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    // Lifecycle
    WorkflowStart,
    WorkflowComplete,
    WorkflowError,
    WorkflowCancelled,
    WorkflowResumed,
    WorkflowRerun,
    // Phases
    PhaseStart,
    PhaseSkip,
    PhaseComplete,
    PhaseError,
    // Steps
    StepStart,
    StepComplete,
    StepError,
    StepRetry,
    StepSkip,
    // Human feedback
    FeedbackRequest,
    FeedbackReceived,
    DecisionPoint,
    ApprovalGranted,
    ApprovalDenied,
    // Artifacts
    ArtifactCreate,
    ArtifactModify,
    // Domain events reported by agents
    CommitCreate,
    BranchCreate,
    BranchPush,
    MergeRequestCreate,
    MergeRequestMerge,
    MergeRequestClose,
    IssueCreate,
    DeploymentStart,
    DeploymentComplete,
    /// Unrecognized kind, preserved verbatim
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkflowStart => "workflow_start",
            Self::WorkflowComplete => "workflow_complete",
            Self::WorkflowError => "workflow_error",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::WorkflowResumed => "workflow_resumed",
            Self::WorkflowRerun => "workflow_rerun",
            Self::PhaseStart => "phase_start",
            Self::PhaseSkip => "phase_skip",
            Self::PhaseComplete => "phase_complete",
            Self::PhaseError => "phase_error",
            Self::StepStart => "step_start",
            Self::StepComplete => "step_complete",
            Self::StepError => "step_error",
            Self::StepRetry => "step_retry",
            Self::StepSkip => "step_skip",
            Self::FeedbackRequest => "feedback_request",
            Self::FeedbackReceived => "feedback_received",
            Self::DecisionPoint => "decision_point",
            Self::ApprovalGranted => "approval_granted",
            Self::ApprovalDenied => "approval_denied",
            Self::ArtifactCreate => "artifact_create",
            Self::ArtifactModify => "artifact_modify",
            Self::CommitCreate => "commit_create",
            Self::BranchCreate => "branch_create",
            Self::BranchPush => "branch_push",
            Self::MergeRequestCreate => "merge_request_create",
            Self::MergeRequestMerge => "merge_request_merge",
            Self::MergeRequestClose => "merge_request_close",
            Self::IssueCreate => "issue_create",
            Self::DeploymentStart => "deployment_start",
            Self::DeploymentComplete => "deployment_complete",
            Self::Other(s) => s,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "workflow_start" => Self::WorkflowStart,
            "workflow_complete" => Self::WorkflowComplete,
            "workflow_error" => Self::WorkflowError,
            "workflow_cancelled" => Self::WorkflowCancelled,
            "workflow_resumed" => Self::WorkflowResumed,
            "workflow_rerun" => Self::WorkflowRerun,
            "phase_start" => Self::PhaseStart,
            "phase_skip" => Self::PhaseSkip,
            "phase_complete" => Self::PhaseComplete,
            "phase_error" => Self::PhaseError,
            "step_start" => Self::StepStart,
            "step_complete" => Self::StepComplete,
            "step_error" => Self::StepError,
            "step_retry" => Self::StepRetry,
            "step_skip" => Self::StepSkip,
            "feedback_request" => Self::FeedbackRequest,
            "feedback_received" => Self::FeedbackReceived,
            "decision_point" => Self::DecisionPoint,
            "approval_granted" => Self::ApprovalGranted,
            "approval_denied" => Self::ApprovalDenied,
            "artifact_create" => Self::ArtifactCreate,
            "artifact_modify" => Self::ArtifactModify,
            "commit_create" => Self::CommitCreate,
            "branch_create" => Self::BranchCreate,
            "branch_push" => Self::BranchPush,
            "merge_request_create" => Self::MergeRequestCreate,
            "merge_request_merge" => Self::MergeRequestMerge,
            "merge_request_close" => Self::MergeRequestClose,
            "issue_create" => Self::IssueCreate,
            "deployment_start" => Self::DeploymentStart,
            "deployment_complete" => Self::DeploymentComplete,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this kind is one the projector understands
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Whether agents may report this kind as a domain event
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Self::CommitCreate
                | Self::BranchCreate
                | Self::BranchPush
                | Self::MergeRequestCreate
                | Self::MergeRequestMerge
                | Self::MergeRequestClose
                | Self::IssueCreate
                | Self::DeploymentStart
                | Self::DeploymentComplete
        )
    }

    /// File-name safe form of the kind
    pub fn slug(&self) -> String {
        self.as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Supervisor,
    Agent,
    Verifier,
    Hook,
    Operator,
    IssueEngine,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Supervisor => "supervisor",
            Self::Agent => "agent",
            Self::Verifier => "verifier",
            Self::Hook => "hook",
            Self::Operator => "operator",
            Self::IssueEngine => "issue_engine",
        };
        f.write_str(s)
    }
}

/// An appended, immutable ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic, gapless, starting at 1
    pub event_id: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// 1-based position of the step within its phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default)]
    pub message: String,
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Ledger file name: zero-padded sequence then kind
    pub fn file_name(&self) -> String {
        format!("{:06}-{}.json", self.event_id, self.event_type.slug())
    }

    /// Look up a field in the event payload
    pub fn data_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data_field(key).and_then(serde_json::Value::as_str)
    }
}

/// An event that has not been appended yet; the ledger stamps id and time
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub source: EventSource,
    pub phase: Option<String>,
    pub step: Option<String>,
    pub step_index: Option<usize>,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(event_type: EventType, source: EventSource) -> Self {
        Self {
            event_type,
            source,
            phase: None,
            step: None,
            step_index: None,
            message: String::new(),
            data: None,
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn step(mut self, step: impl Into<String>, index: usize) -> Self {
        self.step = Some(step.into());
        self.step_index = Some(index);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub(crate) fn stamp(self, event_id: u64, timestamp: DateTime<Utc>) -> Event {
        Event {
            event_id,
            event_type: self.event_type,
            timestamp,
            phase: self.phase,
            step: self.step,
            step_index: self.step_index,
            message: self.message,
            source: self.source,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_types_round_trip_through_strings() {
        for t in [
            EventType::WorkflowStart,
            EventType::StepComplete,
            EventType::ApprovalDenied,
            EventType::MergeRequestMerge,
        ] {
            assert_eq!(EventType::parse(t.as_str()), t);
        }
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let json = r#"{"event_id":3,"type":"telemetry_ping","timestamp":"2024-01-01T00:00:00Z","message":"","source":"agent"}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, EventType::Other("telemetry_ping".to_string()));
        assert!(!event.event_type.is_known());

        let back = serde_json::to_string(&event).unwrap();
        assert!(back.contains(r#""type":"telemetry_ping""#));
    }

    #[test]
    fn test_file_name_is_zero_padded() {
        let event = NewEvent::new(EventType::StepStart, EventSource::Supervisor)
            .stamp(42, Utc::now());
        assert_eq!(event.file_name(), "000042-step_start.json");
    }

    #[test]
    fn test_slug_sanitizes_foreign_kinds() {
        let t = EventType::Other("Weird/Kind".to_string());
        assert_eq!(t.slug(), "weird_kind");
    }
}
