//! Deterministic projection of ledger events into [`RunState`].
//!
//! Only event contents are consulted (never the wall clock), so folding the
//! same ledger twice always yields the same state.

use crate::ledger::{Event, EventType};

use super::{
    step_key, FeedbackRecord, FeedbackRequest, PhaseState, PhaseStatus, ResumePoint, RunError,
    RunState, RunStatus, StepRecord, StepStatus,
};

/// Fold a full event sequence from an empty state
pub fn fold<'a>(events: impl IntoIterator<Item = &'a Event>) -> RunState {
    events.into_iter().fold(RunState::default(), apply)
}

/// Advance `state` by one event.
///
/// Events at or below `last_event_id` were already applied and are ignored,
/// which makes replay idempotent.
pub fn apply(mut state: RunState, event: &Event) -> RunState {
    if event.event_id <= state.last_event_id {
        return state;
    }
    state.last_event_id = event.event_id;
    state.updated_at = Some(event.timestamp);
    if state.created_at.is_none() {
        state.created_at = Some(event.timestamp);
    }

    match &event.event_type {
        EventType::WorkflowStart => {
            state.status = RunStatus::InProgress;
            if let Some(run_id) = event.data_str("run_id").and_then(|s| s.parse().ok()) {
                state.run_id = Some(run_id);
            }
            if let Some(workflow) = event.data_str("workflow_id") {
                state.workflow_id = Some(workflow.to_string());
            }
        }
        EventType::WorkflowResumed => {
            if !state.status.is_final() {
                state.status = RunStatus::InProgress;
                state.pending_feedback = None;
            }
        }
        EventType::WorkflowRerun => {
            if let Some(parent) = event.data_str("parent").and_then(|s| s.parse().ok()) {
                state.parent_run = Some(parent);
            }
        }
        EventType::WorkflowComplete => {
            if !state.status.is_final() {
                state.status = RunStatus::Completed;
            }
        }
        EventType::WorkflowError => {
            if !state.status.is_final() {
                state.status = RunStatus::Failed;
            }
            record_error(&mut state, event);
        }
        EventType::WorkflowCancelled => {
            if !state.status.is_final() {
                state.status = RunStatus::Cancelled;
                state.pending_feedback = None;
            }
        }

        EventType::PhaseStart => {
            if let Some(name) = &event.phase {
                set_phase_status(&mut state, name, PhaseStatus::InProgress);
                state.current_phase = Some(name.clone());
                state.current_step_index = None;
                if let Some(context) = event.data_str("context") {
                    state.context = Some(context.to_string());
                }
            }
        }
        EventType::PhaseSkip => {
            if let Some(name) = &event.phase {
                set_phase_status(&mut state, name, PhaseStatus::Skipped);
            }
        }
        EventType::PhaseComplete => {
            if let Some(name) = &event.phase {
                set_phase_status(&mut state, name, PhaseStatus::Completed);
            }
        }
        EventType::PhaseError => {
            if let Some(name) = &event.phase {
                set_phase_status(&mut state, name, PhaseStatus::Failed);
            }
            record_error(&mut state, event);
        }

        EventType::StepStart => {
            if let Some((phase, step, index)) = step_ref(event) {
                let record = state
                    .steps
                    .entry(step_key(phase, step))
                    .or_insert_with(|| new_record(phase, step, index));
                record.status = StepStatus::InProgress;
                record.attempts += 1;
                record.last_error = None;
                record.verified = None;
                state.current_phase = Some(phase.to_string());
                state.current_step_index = Some(index);
            }
        }
        EventType::StepComplete => {
            if let Some((phase, step, _)) = step_ref(event) {
                // A completion only counts for a step that is actually running
                let Some(record) = state.steps.get_mut(&step_key(phase, step)) else {
                    return state;
                };
                if record.status != StepStatus::InProgress {
                    return state;
                }
                record.status = StepStatus::Completed;
                record.verified = event
                    .data_field("verified")
                    .and_then(serde_json::Value::as_bool);
                if let Some(p) = state.phases.iter_mut().find(|p| p.name == phase) {
                    if !p.completed_steps.iter().any(|s| s == step) {
                        p.completed_steps.push(step.to_string());
                    }
                }
            }
        }
        EventType::StepError => {
            if let Some((phase, step, _)) = step_ref(event) {
                if let Some(record) = state.steps.get_mut(&step_key(phase, step)) {
                    record.status = StepStatus::Failed;
                    record.last_error = Some(event.message.clone());
                }
                if let Some(p) = state.phases.iter_mut().find(|p| p.name == phase) {
                    p.completed_steps.retain(|s| s != step);
                }
            }
            if !state.status.is_final() {
                state.status = RunStatus::Failed;
            }
            record_error(&mut state, event);
        }
        EventType::StepRetry => {
            if let Some((phase, step, _)) = step_ref(event) {
                if let Some(record) = state.steps.get_mut(&step_key(phase, step)) {
                    if record.status != StepStatus::Completed {
                        record.status = StepStatus::NotStarted;
                    }
                }
            }
        }
        EventType::StepSkip => {
            if let Some((phase, step, index)) = step_ref(event) {
                let record = state
                    .steps
                    .entry(step_key(phase, step))
                    .or_insert_with(|| new_record(phase, step, index));
                if record.status != StepStatus::Completed {
                    record.status = StepStatus::Skipped;
                }
            }
        }

        EventType::FeedbackRequest => {
            if let Some(request) = feedback_request(event) {
                if !state.status.is_final() {
                    state.pending_feedback = Some(request);
                    state.status = RunStatus::AwaitingFeedback;
                }
            }
        }
        EventType::FeedbackReceived => {
            let request_id = event.data_str("request_id").unwrap_or_default();
            let matches_pending = state
                .pending_feedback
                .as_ref()
                .is_some_and(|p| p.request_id == request_id);
            if matches_pending {
                state.feedback.push(FeedbackRecord {
                    request_id: request_id.to_string(),
                    response: event.data_str("response").unwrap_or_default().to_string(),
                    approved: None,
                    received_at: event.timestamp,
                });
                state.pending_feedback = None;
                if state.status == RunStatus::AwaitingFeedback {
                    state.status = RunStatus::Pending;
                }
            }
        }
        EventType::ApprovalGranted | EventType::ApprovalDenied => {
            let granted = event.event_type == EventType::ApprovalGranted;
            if let Some(request_id) = event.data_str("request_id") {
                if let Some(record) = state
                    .feedback
                    .iter_mut()
                    .rev()
                    .find(|f| f.request_id == request_id)
                {
                    record.approved = Some(granted);
                }
            }
        }
        EventType::DecisionPoint => {}

        EventType::ArtifactCreate | EventType::ArtifactModify => {
            if let (Some(key), Some(value)) = (event.data_str("key"), event.data_str("value")) {
                state.artifacts.insert(key.to_string(), value.to_string());
            }
        }

        EventType::CommitCreate
        | EventType::BranchCreate
        | EventType::BranchPush
        | EventType::MergeRequestCreate
        | EventType::MergeRequestMerge
        | EventType::MergeRequestClose
        | EventType::IssueCreate
        | EventType::DeploymentStart
        | EventType::DeploymentComplete => {}

        EventType::Other(_) => state.unrecognized_events += 1,
    }

    state
}

fn step_ref(event: &Event) -> Option<(&str, &str, usize)> {
    Some((
        event.phase.as_deref()?,
        event.step.as_deref()?,
        event.step_index.unwrap_or(0),
    ))
}

fn new_record(phase: &str, step: &str, index: usize) -> StepRecord {
    StepRecord {
        phase: phase.to_string(),
        step_id: step.to_string(),
        index,
        status: StepStatus::NotStarted,
        attempts: 0,
        last_error: None,
        verified: None,
    }
}

fn set_phase_status(state: &mut RunState, name: &str, status: PhaseStatus) {
    if let Some(phase) = state.phases.iter_mut().find(|p| p.name == name) {
        phase.status = status;
    } else {
        state.phases.push(PhaseState {
            name: name.to_string(),
            status,
            completed_steps: Vec::new(),
        });
    }
}

fn record_error(state: &mut RunState, event: &Event) {
    state.errors.push(RunError {
        event_id: event.event_id,
        timestamp: event.timestamp,
        phase: event.phase.clone(),
        step: event.step.clone(),
        step_index: event.step_index,
        message: event.message.clone(),
        kind: event.data_str("kind").map(str::to_string),
    });
}

fn feedback_request(event: &Event) -> Option<FeedbackRequest> {
    let request_id = event.data_str("request_id")?.to_string();
    let options = event
        .data_field("options")
        .and_then(serde_json::Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| o.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let phase = event
        .data_str("resume_phase")
        .map(str::to_string)
        .or_else(|| event.phase.clone())?;
    let step_index = event
        .data_field("resume_step_index")
        .and_then(serde_json::Value::as_u64)
        .map(|i| i as usize)
        .or(event.step_index)?;

    Some(FeedbackRequest {
        request_id,
        prompt: event.message.clone(),
        options,
        resume_point: ResumePoint { phase, step_index },
        requested_at: event.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventSource, NewEvent};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Script {
        events: Vec<Event>,
    }

    impl Script {
        fn new() -> Self {
            Self { events: Vec::new() }
        }

        fn push(&mut self, event: NewEvent) -> &mut Self {
            let id = self.events.len() as u64 + 1;
            let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, id as u32).unwrap();
            self.events.push(event.stamp(id, ts));
            self
        }

        fn ev(t: EventType) -> NewEvent {
            NewEvent::new(t, EventSource::Supervisor)
        }

        fn start_phase(&mut self, phase: &str) -> &mut Self {
            self.push(Self::ev(EventType::PhaseStart).phase(phase))
        }

        fn step(&mut self, t: EventType, phase: &str, step: &str, index: usize) -> &mut Self {
            self.push(Self::ev(t).phase(phase).step(step, index))
        }
    }

    fn happy_path() -> Vec<Event> {
        let mut s = Script::new();
        s.push(
            Script::ev(EventType::WorkflowStart)
                .data(json!({"run_id": "acme/widgets/r1", "workflow_id": "ship"})),
        )
        .start_phase("build")
        .step(EventType::StepStart, "build", "compile", 1)
        .step(EventType::StepComplete, "build", "compile", 1)
        .step(EventType::StepStart, "build", "test", 2)
        .step(EventType::StepComplete, "build", "test", 2)
        .push(Script::ev(EventType::PhaseComplete).phase("build"))
        .push(Script::ev(EventType::WorkflowComplete));
        s.events.clone()
    }

    #[test]
    fn test_fold_happy_path() {
        let state = fold(&happy_path());
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.workflow_id.as_deref(), Some("ship"));
        assert_eq!(state.run_id.as_ref().unwrap().to_string(), "acme/widgets/r1");
        assert_eq!(state.step_status("build", "compile"), StepStatus::Completed);
        assert_eq!(
            state.phase("build").unwrap().completed_steps,
            vec!["compile".to_string(), "test".to_string()]
        );
        assert_eq!(state.last_event_id, 8);
    }

    #[test]
    fn test_fold_is_deterministic() {
        let events = happy_path();
        assert_eq!(fold(&events), fold(&events));
    }

    #[test]
    fn test_incremental_matches_full_fold() {
        let events = happy_path();
        let mut state = RunState::default();
        for e in &events {
            state = apply(state, e);
        }
        assert_eq!(state, fold(&events));
    }

    #[test]
    fn test_replaying_an_event_is_a_noop() {
        let events = happy_path();
        let state = fold(&events);
        let again = apply(state.clone(), &events[3]);
        assert_eq!(state, again);
    }

    #[test]
    fn test_completion_without_start_is_ignored() {
        let mut s = Script::new();
        s.push(Script::ev(EventType::WorkflowStart))
            .start_phase("build")
            .step(EventType::StepComplete, "build", "compile", 1);
        let state = fold(&s.events);
        assert_eq!(state.step_status("build", "compile"), StepStatus::NotStarted);
        assert!(state.phase("build").unwrap().completed_steps.is_empty());
    }

    #[test]
    fn test_step_error_fails_run() {
        let mut s = Script::new();
        s.push(Script::ev(EventType::WorkflowStart))
            .start_phase("build")
            .step(EventType::StepStart, "build", "compile", 1)
            .push(
                Script::ev(EventType::StepError)
                    .phase("build")
                    .step("compile", 1)
                    .message("linker exploded")
                    .data(json!({"kind": "agent_reported"})),
            );
        let state = fold(&s.events);
        assert_eq!(state.status, RunStatus::Failed);
        let record = state.step("build", "compile").unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("linker exploded"));
        let failure = state.last_step_failure().unwrap();
        assert_eq!(failure.step_index, Some(1));
        assert_eq!(failure.kind.as_deref(), Some("agent_reported"));
    }

    #[test]
    fn test_resume_reopens_failed_step() {
        let mut s = Script::new();
        s.push(Script::ev(EventType::WorkflowStart))
            .start_phase("build")
            .step(EventType::StepStart, "build", "compile", 1)
            .step(EventType::StepError, "build", "compile", 1)
            .push(Script::ev(EventType::WorkflowResumed))
            .step(EventType::StepStart, "build", "compile", 1)
            .step(EventType::StepComplete, "build", "compile", 1);
        let state = fold(&s.events);
        assert_eq!(state.status, RunStatus::InProgress);
        let record = state.step("build", "compile").unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempts, 2);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_unknown_events_are_counted_and_ignored() {
        let mut s = Script::new();
        s.push(Script::ev(EventType::WorkflowStart))
            .push(Script::ev(EventType::Other("future_thing".to_string())));
        let state = fold(&s.events);
        assert_eq!(state.status, RunStatus::InProgress);
        assert_eq!(state.unrecognized_events, 1);
        assert_eq!(state.last_event_id, 2);
    }

    #[test]
    fn test_feedback_cycle() {
        let mut s = Script::new();
        s.push(Script::ev(EventType::WorkflowStart))
            .start_phase("review")
            .step(EventType::StepStart, "review", "approve", 1)
            .push(
                Script::ev(EventType::FeedbackRequest)
                    .phase("review")
                    .step("approve", 1)
                    .message("Ship it?")
                    .data(json!({"request_id": "fb-1", "options": ["yes", "no"]})),
            );
        let waiting = fold(&s.events);
        assert_eq!(waiting.status, RunStatus::AwaitingFeedback);
        let pending = waiting.pending_feedback.as_ref().unwrap();
        assert_eq!(pending.options, vec!["yes", "no"]);
        assert_eq!(pending.resume_point.step_index, 1);

        s.push(
            Script::ev(EventType::FeedbackReceived)
                .data(json!({"request_id": "other", "response": "no"})),
        );
        assert_eq!(fold(&s.events).status, RunStatus::AwaitingFeedback);

        s.push(
            Script::ev(EventType::FeedbackReceived)
                .data(json!({"request_id": "fb-1", "response": "yes"})),
        )
        .push(Script::ev(EventType::ApprovalGranted).data(json!({"request_id": "fb-1"})));
        let state = fold(&s.events);
        assert_eq!(state.status, RunStatus::Pending);
        assert!(state.pending_feedback.is_none());
        let record = state.feedback_for("fb-1").unwrap();
        assert_eq!(record.response, "yes");
        assert_eq!(record.approved, Some(true));
    }

    #[test]
    fn test_cancelled_run_stays_cancelled() {
        let mut s = Script::new();
        s.push(Script::ev(EventType::WorkflowStart))
            .start_phase("build")
            .step(EventType::StepStart, "build", "compile", 1)
            .push(Script::ev(EventType::WorkflowCancelled))
            .step(EventType::StepComplete, "build", "compile", 1)
            .push(Script::ev(EventType::PhaseComplete).phase("build"))
            .push(Script::ev(EventType::WorkflowComplete))
            .push(Script::ev(EventType::WorkflowResumed))
            .push(Script::ev(EventType::WorkflowError).message("late failure"));
        let state = fold(&s.events);
        assert_eq!(state.status, RunStatus::Cancelled);
        assert_eq!(state.last_event_id, 9);
    }

    #[test]
    fn test_completed_run_is_not_reopened() {
        let mut events = happy_path();
        let next = events.len() as u64 + 1;
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        events.push(Script::ev(EventType::WorkflowCancelled).stamp(next, ts));
        events.push(Script::ev(EventType::WorkflowResumed).stamp(next + 1, ts));
        assert_eq!(fold(&events).status, RunStatus::Completed);
    }

    #[test]
    fn test_step_error_after_completion_clears_completed_step() {
        let mut s = Script::new();
        s.push(Script::ev(EventType::WorkflowStart))
            .start_phase("build")
            .step(EventType::StepStart, "build", "compile", 1)
            .step(EventType::StepComplete, "build", "compile", 1)
            .push(
                Script::ev(EventType::StepError)
                    .phase("build")
                    .step("compile", 1)
                    .message("post_step hook 'lint' failed: dirty tree")
                    .data(json!({"kind": "hook_blocked"})),
            );
        let state = fold(&s.events);
        assert_eq!(state.step_status("build", "compile"), StepStatus::Failed);
        assert!(state.phase("build").unwrap().completed_steps.is_empty());
    }

    #[test]
    fn test_artifacts_are_collected() {
        let mut s = Script::new();
        s.push(
            Script::ev(EventType::ArtifactCreate).data(json!({"key": "pr_number", "value": "7"})),
        )
        .push(
            Script::ev(EventType::ArtifactModify).data(json!({"key": "pr_number", "value": "8"})),
        );
        let state = fold(&s.events);
        assert_eq!(state.artifacts.get("pr_number").map(String::as_str), Some("8"));
    }
}
