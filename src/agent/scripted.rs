//! Deterministic in-process agent for tests and dry runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{AgentError, ExecutionAgent, SelfReport, StepRequest};

/// Canned behaviour for one execution of a step
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Report(SelfReport),
    Error(String),
    /// Never answers; exercises delegation timeouts
    Hang,
}

/// Answers from per-step queues; unscripted steps succeed
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    responses: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<Vec<StepRequest>>,
    batches: Mutex<usize>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next execution of `step_id`
    pub fn script(&self, step_id: &str, response: ScriptedResponse) -> &Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses
                .entry(step_id.to_string())
                .or_default()
                .push_back(response);
        }
        self
    }

    pub fn fail(&self, step_id: &str, error: &str) -> &Self {
        self.script(
            step_id,
            ScriptedResponse::Report(SelfReport::failure(step_id, error)),
        )
    }

    pub fn hang(&self, step_id: &str) -> &Self {
        self.script(step_id, ScriptedResponse::Hang)
    }

    /// Step ids in the order they were delegated
    pub fn executed(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|r| r.step.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn batch_calls(&self) -> usize {
        self.batches.lock().map(|b| *b).unwrap_or_default()
    }

    fn next_response(&self, step_id: &str) -> Option<ScriptedResponse> {
        self.responses
            .lock()
            .ok()?
            .get_mut(step_id)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl ExecutionAgent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: StepRequest) -> Result<SelfReport, AgentError> {
        let step_id = request.step.id.clone();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request);
        }
        match self.next_response(&step_id) {
            Some(ScriptedResponse::Report(report)) => Ok(report),
            Some(ScriptedResponse::Error(message)) => Err(AgentError::Spawn(message)),
            Some(ScriptedResponse::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AgentError::InvalidReport("agent hung".to_string()))
            }
            None => Ok(SelfReport::success(&step_id, format!("{step_id} done"))),
        }
    }

    async fn execute_batch(
        &self,
        requests: Vec<StepRequest>,
    ) -> Result<Vec<SelfReport>, AgentError> {
        if let Ok(mut batches) = self.batches.lock() {
            *batches += 1;
        }
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            reports.push(self.execute(request).await?);
        }
        Ok(reports)
    }
}
