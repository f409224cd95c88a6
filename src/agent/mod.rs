//! Execution agent abstraction.
//!
//! The supervisor hands exactly one step at a time to an [`ExecutionAgent`]
//! and gets back a [`SelfReport`]. The report is a claim, not a fact: the
//! verifier decides whether the step really happened.

mod command;
mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::ledger::{EventType, RunId};
use crate::plan::StepDescriptor;

pub use command::CommandAgent;
pub use scripted::{ScriptedAgent, ScriptedResponse};

/// Errors from delegating a step to an agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to start agent: {0}")]
    Spawn(String),

    #[error("agent exited with {code} and no report: {stderr}")]
    Exit { code: String, stderr: String },

    #[error("agent produced no usable report: {0}")]
    InvalidReport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One step handed to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub run_id: RunId,
    pub step: StepDescriptor,
    /// Context blob contributed by context-injection hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Artifacts recorded so far in the run
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Run parameters (rerun overrides included)
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// 1 on first execution, higher after resumes
    pub attempt: u32,
}

/// A domain event the agent claims to have caused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The agent asking a human before it can continue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackAsk {
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// What the agent says happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfReport {
    pub step_id: String,
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub events: Vec<ReportedEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackAsk>,
}

impl SelfReport {
    pub fn success(step_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            summary: summary.into(),
            error: None,
            artifacts: BTreeMap::new(),
            events: Vec::new(),
            feedback: None,
        }
    }

    pub fn failure(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            step_id: step_id.into(),
            success: false,
            summary: String::new(),
            error: Some(error),
            artifacts: BTreeMap::new(),
            events: Vec::new(),
            feedback: None,
        }
    }

    pub fn with_artifact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.artifacts.insert(key.into(), value.into());
        self
    }

    /// Failure text for the ledger, falling back to the summary
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| {
                if self.summary.is_empty() {
                    "agent reported failure".to_string()
                } else {
                    self.summary.clone()
                }
            })
    }
}

/// Something that carries out steps.
///
/// `execute` is the only entry point used by the standard loop. The batched
/// entry point exists for the weaker agent-sequenced mode and defaults to
/// calling `execute` in order.
#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: StepRequest) -> Result<SelfReport, AgentError>;

    async fn execute_batch(
        &self,
        requests: Vec<StepRequest>,
    ) -> Result<Vec<SelfReport>, AgentError> {
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            let report = self.execute(request).await?;
            let failed = !report.success;
            reports.push(report);
            if failed {
                break;
            }
        }
        Ok(reports)
    }
}
