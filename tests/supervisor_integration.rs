//! End-to-end supervisor tests.
//!
//! Every test drives a real ledger in a temp directory with the in-process
//! `ScriptedAgent` and a stub verifier, so no external agent or git remote
//! is needed.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use runwarden::agent::{
    AgentError, ExecutionAgent, FeedbackAsk, ScriptedAgent, ScriptedResponse, SelfReport,
    StepRequest,
};
use runwarden::capability::{
    Capability, CapabilityError, CapabilityInput, CapabilityOutput, CapabilityRegistry,
};
use runwarden::hooks::{FailureMode, Hook, HookAction, HookRunner, HooksConfig, LifecyclePoint};
use runwarden::issues::{Automation, IssueEngine, MemoryKnowledgeStore, NewSolution};
use runwarden::ledger::{EventSource, EventType, Ledger, NewEvent, RunId};
use runwarden::plan::{Plan, StepDescriptor};
use runwarden::state::{self, PhaseStatus, ResumePoint, RunState, RunStatus, StepStatus};
use runwarden::supervisor::{
    ExecutionMode, FailureKind, RerunOptions, RunOutcome, StartOptions, Supervisor,
    SupervisorError, SupervisorSettings,
};
use runwarden::verify::{StepVerifier, Verdict};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Vetoes the listed step ids; passes everything else
struct StubVerifier {
    veto: Vec<&'static str>,
}

impl StubVerifier {
    fn passing() -> Arc<Self> {
        Arc::new(Self { veto: Vec::new() })
    }

    fn vetoing(veto: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self { veto })
    }
}

#[async_trait]
impl StepVerifier for StubVerifier {
    async fn verify(&self, step: &StepDescriptor, _state: &RunState) -> Verdict {
        if self.veto.contains(&step.id.as_str()) {
            Verdict::Fail(format!("no remote branch for {}", step.id))
        } else {
            Verdict::Pass
        }
    }
}

struct Harness {
    dir: TempDir,
    agent: Arc<ScriptedAgent>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            agent: Arc::new(ScriptedAgent::new()),
        }
    }

    fn ledger(&self) -> Ledger {
        Ledger::new(self.dir.path().join("runs"))
    }

    fn settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            environment: "local".to_string(),
            mode: ExecutionMode::Sequential,
            step_timeout: Duration::from_millis(200),
            base_dir: self.dir.path().to_path_buf(),
        }
    }

    fn supervisor(&self, verifier: Arc<dyn StepVerifier>) -> Supervisor {
        Supervisor::new(self.ledger(), self.agent.clone(), verifier).with_settings(self.settings())
    }
}

fn options() -> StartOptions {
    StartOptions {
        scope: Some(("acme".to_string(), "payments".to_string())),
        ..StartOptions::default()
    }
}

fn three_step_plan() -> Plan {
    Plan::from_json_str(
        r#"{
            "workflow_id": "release",
            "phases": [
                {"name": "build", "steps": [
                    {"id": "compile", "command": "make build"},
                    {"id": "test", "command": "make test"},
                    {"id": "package", "command": "make dist"}
                ]}
            ]
        }"#,
    )
    .unwrap()
}

fn two_phase_plan() -> Plan {
    Plan::from_json_str(
        r#"{
            "workflow_id": "ship",
            "phases": [
                {"name": "build", "steps": [
                    {"id": "compile", "command": "make build"},
                    {"id": "test", "command": "make test"}
                ]},
                {"name": "deploy", "steps": [
                    {"id": "migrate", "command": "db-migrate", "arguments": {"resource_type": "database"}},
                    {"id": "push", "command": "git push"}
                ]}
            ]
        }"#,
    )
    .unwrap()
}

fn halted(outcome: &RunOutcome) -> &runwarden::supervisor::RunHalt {
    outcome.halt().expect("expected a halted run")
}

fn event_types(supervisor: &Supervisor, run_id: &RunId) -> Vec<EventType> {
    supervisor
        .events(run_id)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

// ─── Failure and resume ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_timeout_halts_then_resume_completes() {
    let h = Harness::new();
    h.agent.hang("test");
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.phase, "build");
    assert_eq!(halt.step.as_deref(), Some("test"));
    assert_eq!(halt.step_index, 2);
    assert_eq!(halt.kind, FailureKind::Timeout);
    assert!(halt.resume_command.ends_with("--phase build --step 2"));
    assert_eq!(h.agent.executed(), vec!["compile", "test"]);

    let run_id = outcome.run_id().clone();
    let state = supervisor.status(&run_id).unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.step_status("build", "compile"), StepStatus::Completed);
    assert_eq!(state.step_status("build", "test"), StepStatus::Failed);
    assert_eq!(state.step_status("build", "package"), StepStatus::NotStarted);

    // The step error carries everything needed to resume
    let step_error = supervisor
        .events(&run_id)
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == EventType::StepError)
        .unwrap();
    let resume = step_error.data_field("resume").unwrap();
    assert_eq!(resume["phase"], "build");
    assert_eq!(resume["step_index"], 2);
    assert_eq!(resume["run_id"], run_id.to_string());

    let outcome = supervisor.resume(&plan, &run_id, "build", 2).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.agent.executed(), vec!["compile", "test", "test", "package"]);

    let state = supervisor.status(&run_id).unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.step("build", "compile").unwrap().attempts, 1);
    assert_eq!(state.step("build", "test").unwrap().attempts, 2);
    assert!(event_types(&supervisor, &run_id).contains(&EventType::WorkflowResumed));
}

#[tokio::test]
async fn test_reported_failure_halts_without_retry() {
    let h = Harness::new();
    h.agent.fail("compile", "linker error");
    let supervisor = h.supervisor(StubVerifier::passing());

    let outcome = supervisor.start(&three_step_plan(), options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.kind, FailureKind::AgentReported);
    assert_eq!(halt.error, "linker error");
    assert_eq!(h.agent.executed(), vec!["compile"]);

    let types = event_types(&supervisor, outcome.run_id());
    assert!(!types.contains(&EventType::StepComplete));
    assert_eq!(types.last(), Some(&EventType::WorkflowError));
}

#[tokio::test]
async fn test_resume_cannot_skip_incomplete_steps() {
    let h = Harness::new();
    h.agent.fail("test", "flaky");
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let run_id = outcome.run_id().clone();

    let err = supervisor.resume(&plan, &run_id, "build", 3).await.unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidResumePoint(_)));

    let err = supervisor.resume(&plan, &run_id, "build", 9).await.unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidResumePoint(_)));

    let err = supervisor.resume(&plan, &run_id, "nope", 1).await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownPhase(_)));

    // Nothing was executed by the rejected attempts
    assert_eq!(h.agent.executed(), vec!["compile", "test"]);
}

#[tokio::test]
async fn test_resume_from_earlier_point_does_not_repeat_completed_steps() {
    let h = Harness::new();
    h.agent.fail("push", "rejected");
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = two_phase_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let run_id = outcome.run_id().clone();
    assert_eq!(halted(&outcome).phase, "deploy");
    assert_eq!(halted(&outcome).step_index, 2);

    let outcome = supervisor.resume(&plan, &run_id, "build", 1).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(
        h.agent.executed(),
        vec!["compile", "test", "migrate", "push", "push"]
    );
}

#[tokio::test]
async fn test_completed_run_is_not_resumable() {
    let h = Harness::new();
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    assert!(outcome.is_completed());

    let err = supervisor
        .resume(&plan, outcome.run_id(), "build", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NotResumable { .. }));
}

#[tokio::test]
async fn test_resume_rejects_a_different_plan() {
    let h = Harness::new();
    h.agent.fail("compile", "boom");
    let supervisor = h.supervisor(StubVerifier::passing());

    let outcome = supervisor.start(&three_step_plan(), options()).await.unwrap();
    let err = supervisor
        .resume(&two_phase_plan(), outcome.run_id(), "build", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::PlanMismatch { .. }));
}

// ─── Verification ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_verifier_veto_overrides_claimed_success() {
    let h = Harness::new();
    let supervisor = h.supervisor(StubVerifier::vetoing(vec!["push"]));

    let outcome = supervisor.start(&two_phase_plan(), options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.kind, FailureKind::VerificationVeto);
    assert_eq!(halt.step.as_deref(), Some("push"));
    assert!(halt.error.contains("no remote branch"));

    let run_id = outcome.run_id();
    let state = supervisor.status(run_id).unwrap();
    assert_eq!(state.step_status("deploy", "push"), StepStatus::Failed);
    assert_eq!(state.step("build", "compile").unwrap().verified, Some(true));

    let events = supervisor.events(run_id).unwrap();
    assert!(!events
        .iter()
        .any(|e| e.event_type == EventType::StepComplete && e.step.as_deref() == Some("push")));
    let step_error = events
        .iter()
        .find(|e| e.event_type == EventType::StepError)
        .unwrap();
    assert_eq!(step_error.data_field("self_reported_success"), Some(&serde_json::json!(true)));
    assert_eq!(step_error.data_field("kind"), Some(&serde_json::json!("verification_veto")));
}

// ─── Ledger and projection ───────────────────────────────────────────────────

#[tokio::test]
async fn test_persisted_state_matches_replay() {
    let h = Harness::new();
    h.agent.fail("migrate", "lock timeout");
    let supervisor = h.supervisor(StubVerifier::passing());

    let outcome = supervisor.start(&two_phase_plan(), options()).await.unwrap();
    let run_id = outcome.run_id();
    let events = supervisor.events(run_id).unwrap();

    let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, (1..=events.len() as u64).collect::<Vec<_>>());

    let persisted = h.ledger().read_state(run_id).unwrap().unwrap();
    assert_eq!(persisted, state::fold(&events));
    assert_eq!(state::fold(&events), state::fold(&events));
}

#[tokio::test]
async fn test_phase_boundaries_are_ordered() {
    let h = Harness::new();
    let supervisor = h.supervisor(StubVerifier::passing());

    let outcome = supervisor.start(&two_phase_plan(), options()).await.unwrap();
    let types = event_types(&supervisor, outcome.run_id());
    let complete_build = types
        .iter()
        .position(|t| *t == EventType::PhaseComplete)
        .unwrap();
    let start_deploy = types
        .iter()
        .rposition(|t| *t == EventType::PhaseStart)
        .unwrap();
    assert!(complete_build < start_deploy);
    assert_eq!(types.first(), Some(&EventType::WorkflowStart));
    assert_eq!(types.last(), Some(&EventType::WorkflowComplete));
}

// ─── Rerun ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rerun_links_lineage_and_leaves_parent_untouched() {
    let h = Harness::new();
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = two_phase_plan();

    let first = supervisor.start(&plan, options()).await.unwrap();
    let parent = first.run_id().clone();
    let parent_events = supervisor.events(&parent).unwrap();

    let mut overrides = std::collections::BTreeMap::new();
    overrides.insert("target".to_string(), "staging".to_string());
    let second = supervisor
        .rerun(
            &plan,
            &parent,
            RerunOptions {
                from_phase: Some("deploy".to_string()),
                parameters: overrides,
            },
        )
        .await
        .unwrap();
    assert!(second.is_completed());
    let child = second.run_id().clone();
    assert_ne!(child, parent);
    assert_eq!(child.organization(), "acme");
    assert_eq!(child.project(), "payments");

    assert_eq!(supervisor.events(&parent).unwrap(), parent_events);

    let metadata = h.ledger().read_metadata(&child).unwrap();
    let lineage = metadata.lineage.unwrap();
    assert_eq!(lineage.parent, parent);
    assert_eq!(lineage.root, parent);
    assert_eq!(lineage.generation, 1);
    assert_eq!(metadata.parameters.get("target").map(String::as_str), Some("staging"));

    let state = supervisor.status(&child).unwrap();
    assert_eq!(state.parent_run.as_ref(), Some(&parent));
    assert_eq!(state.phase("build").unwrap().status, PhaseStatus::Skipped);
    assert_eq!(state.phase("deploy").unwrap().status, PhaseStatus::Completed);

    let third = supervisor
        .rerun(&plan, &child, RerunOptions::default())
        .await
        .unwrap();
    let lineage = h
        .ledger()
        .read_metadata(third.run_id())
        .unwrap()
        .lineage
        .unwrap();
    assert_eq!(lineage.parent, child);
    assert_eq!(lineage.root, parent);
    assert_eq!(lineage.generation, 2);
}

#[tokio::test]
async fn test_rerun_rejects_unknown_phase() {
    let h = Harness::new();
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = two_phase_plan();
    let first = supervisor.start(&plan, options()).await.unwrap();

    let err = supervisor
        .rerun(
            &plan,
            first.run_id(),
            RerunOptions {
                from_phase: Some("verify".to_string()),
                ..RerunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownPhase(_)));
}

// ─── Feedback and cancellation ───────────────────────────────────────────────

#[tokio::test]
async fn test_agent_feedback_request_pauses_until_answered() {
    let h = Harness::new();
    let mut ask = SelfReport::success("test", "");
    ask.feedback = Some(FeedbackAsk {
        prompt: "Snapshot changed; accept?".to_string(),
        options: vec!["yes".to_string(), "no".to_string()],
    });
    h.agent.script("test", ScriptedResponse::Report(ask));
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let RunOutcome::AwaitingFeedback {
        run_id, request_id, ..
    } = outcome
    else {
        panic!("expected awaiting feedback, got {outcome:?}");
    };
    assert_eq!(
        supervisor.status(&run_id).unwrap().status,
        RunStatus::AwaitingFeedback
    );

    let err = supervisor.resume(&plan, &run_id, "build", 2).await.unwrap_err();
    assert!(matches!(err, SupervisorError::AwaitingFeedback { .. }));

    let err = supervisor
        .provide_feedback(&run_id, "not-a-request", "yes", None)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownFeedbackRequest { .. }));

    let point = supervisor
        .provide_feedback(&run_id, &request_id, "yes", Some(true))
        .unwrap();
    assert_eq!(point.phase, "build");
    assert_eq!(point.step_index, 2);

    let state = supervisor.status(&run_id).unwrap();
    assert!(state.pending_feedback.is_none());
    assert_eq!(state.feedback_for(&request_id).unwrap().approved, Some(true));

    let outcome = supervisor
        .resume(&plan, &run_id, &point.phase, point.step_index)
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.agent.executed(), vec!["compile", "test", "test", "package"]);
}

#[tokio::test]
async fn test_operator_feedback_request_on_halted_run() {
    let h = Harness::new();
    h.agent.fail("package", "disk full");
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let run_id = outcome.run_id();
    let point = ResumePoint {
        phase: "build".to_string(),
        step_index: 3,
    };
    let request_id = supervisor
        .request_feedback(run_id, "Free space and retry?", &[], &point)
        .unwrap();
    assert_eq!(
        supervisor.status(run_id).unwrap().pending_feedback.unwrap().resume_point,
        point
    );

    let answered = supervisor
        .provide_feedback(run_id, &request_id, "not yet", Some(false))
        .unwrap();
    assert_eq!(answered, point);

    let state = supervisor.status(run_id).unwrap();
    assert_eq!(state.feedback_for(&request_id).unwrap().approved, Some(false));
    let types = event_types(&supervisor, run_id);
    assert!(types.ends_with(&[EventType::FeedbackReceived, EventType::ApprovalDenied]));
}

#[tokio::test]
async fn test_cancel_is_final() {
    let h = Harness::new();
    h.agent.fail("compile", "boom");
    let supervisor = h.supervisor(StubVerifier::passing());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let run_id = outcome.run_id();

    let state = supervisor.cancel(run_id, "abandoned").unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);

    let err = supervisor.resume(&plan, run_id, "build", 1).await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotResumable { .. }));
    let err = supervisor.cancel(run_id, "again").unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyFinished(_)));
}

// ─── Knowledge base ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_known_fix_is_suggested_and_applied() {
    let h = Harness::new();
    let message = "connection refused by 10.0.4.17:5432";
    h.agent.fail("migrate", message);
    h.agent.fail("migrate", message);
    let engine = IssueEngine::new(Arc::new(MemoryKnowledgeStore::new()));
    let supervisor = h
        .supervisor(StubVerifier::passing())
        .with_issue_engine(engine.clone());
    let plan = two_phase_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let run_id = outcome.run_id().clone();
    let halt = halted(&outcome);
    assert!(halt.suggestion.is_none());
    let issue_id = halt.issue_id.clone().unwrap();

    let solution = engine
        .add_solution(
            &issue_id,
            NewSolution {
                description: "Restart the database proxy".to_string(),
                category: "network".to_string(),
                remediation_steps: vec!["restart proxy".to_string()],
                automation: Some(Automation {
                    capability: "db".to_string(),
                    operation: "restart-proxy".to_string(),
                    arguments: serde_json::Map::new(),
                }),
            },
        )
        .unwrap();

    // Same failure again, now with a known solution
    let outcome = supervisor.resume(&plan, &run_id, "deploy", 1).await.unwrap();
    let halt = halted(&outcome);
    let suggestion = halt.suggestion.as_ref().unwrap();
    assert_eq!(suggestion.solution.solution_id, solution.solution_id);
    assert!(event_types(&supervisor, &run_id).contains(&EventType::DecisionPoint));
    assert_eq!(engine.get(&issue_id).unwrap().unwrap().occurrence_count, 2);

    let fix = supervisor
        .apply_fix(&run_id, &issue_id, &solution.solution_id)
        .await
        .unwrap();
    assert!(fix.success);
    assert_eq!(fix.step.phase, "remediation");
    assert_eq!(fix.step.command, "restart-proxy");
    assert_eq!(fix.solution.success_rate.attempts, 1);
    assert_eq!(fix.solution.success_rate.successes, 1);
    assert!(fix
        .resume_command
        .as_deref()
        .unwrap()
        .ends_with("--phase deploy --step 1"));
    assert_eq!(
        h.agent.executed().last().map(String::as_str),
        Some(fix.step.id.as_str())
    );

    // The run waits for the operator after a fix
    let state = supervisor.status(&run_id).unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(
        state.step_status("remediation", &fix.step.id),
        StepStatus::Completed
    );

    let outcome = supervisor.resume(&plan, &run_id, "deploy", 1).await.unwrap();
    assert!(outcome.is_completed());
}

#[tokio::test]
async fn test_apply_fix_requires_engine_and_halted_run() {
    let h = Harness::new();
    let supervisor = h.supervisor(StubVerifier::passing());
    let outcome = supervisor.start(&three_step_plan(), options()).await.unwrap();

    let err = supervisor
        .apply_fix(outcome.run_id(), "issue", "solution")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NoIssueEngine));

    let supervisor = h
        .supervisor(StubVerifier::passing())
        .with_issue_engine(IssueEngine::new(Arc::new(MemoryKnowledgeStore::new())));
    let err = supervisor
        .apply_fix(outcome.run_id(), "issue", "solution")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NotHalted { .. }));
}

// ─── Batched mode ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batched_mode_delegates_once_per_phase() {
    let h = Harness::new();
    let mut settings = h.settings();
    settings.mode = ExecutionMode::Batched;
    let supervisor = h.supervisor(StubVerifier::passing()).with_settings(settings);

    let outcome = supervisor.start(&two_phase_plan(), options()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.agent.batch_calls(), 2);

    let start = supervisor
        .events(outcome.run_id())
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == EventType::WorkflowStart)
        .unwrap();
    assert_eq!(
        start.data_str("ordering_guarantee"),
        Some("agent-sequenced")
    );
}

#[tokio::test]
async fn test_batched_mode_halts_at_first_failed_report() {
    let h = Harness::new();
    h.agent.fail("test", "3 failures");
    let mut settings = h.settings();
    settings.mode = ExecutionMode::Batched;
    let supervisor = h.supervisor(StubVerifier::passing()).with_settings(settings);

    let outcome = supervisor.start(&three_step_plan(), options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.step.as_deref(), Some("test"));

    let state = supervisor.status(outcome.run_id()).unwrap();
    assert_eq!(state.step_status("build", "compile"), StepStatus::Completed);
    assert_eq!(state.step_status("build", "test"), StepStatus::Failed);
    assert_eq!(state.step_status("build", "package"), StepStatus::InProgress);
}

// ─── Hooks ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_blocking_pre_step_hook_stops_before_delegation() {
    let h = Harness::new();
    let hooks = HooksConfig::default().with_hooks(
        LifecyclePoint::PreStep,
        vec![Hook::script("gate", "exit 3", Duration::from_secs(5))],
    );
    let supervisor = h.supervisor(StubVerifier::passing()).with_hooks(hooks);

    let outcome = supervisor.start(&three_step_plan(), options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.kind, FailureKind::HookBlocked);
    assert!(halt.error.contains("gate"));
    assert!(h.agent.executed().is_empty());
}

#[tokio::test]
async fn test_hooks_for_other_environments_and_optional_hooks_do_not_block() {
    let h = Harness::new();
    let mut prod_only = Hook::script("prod-gate", "exit 1", Duration::from_secs(5));
    prod_only.environments = vec!["prod".to_string()];
    let mut optional = Hook::script("lint", "exit 1", Duration::from_secs(5));
    optional.required = false;
    let hooks = HooksConfig::default()
        .with_hooks(LifecyclePoint::PrePhase, vec![prod_only])
        .with_hooks(LifecyclePoint::PostStep, vec![optional]);
    let supervisor = h.supervisor(StubVerifier::passing()).with_hooks(hooks);

    let outcome = supervisor.start(&three_step_plan(), options()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.agent.executed().len(), 3);
}

#[tokio::test]
async fn test_blocking_pre_phase_hook_records_phase_error() {
    let h = Harness::new();
    let hooks = HooksConfig::default().with_hooks(
        LifecyclePoint::PrePhase,
        vec![Hook::script("freeze", "exit 1", Duration::from_secs(5))],
    );
    let supervisor = h.supervisor(StubVerifier::passing()).with_hooks(hooks);

    let outcome = supervisor.start(&two_phase_plan(), options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.phase, "build");
    assert_eq!(halt.step_index, 1);

    let state = supervisor.status(outcome.run_id()).unwrap();
    assert_eq!(state.phase("build").unwrap().status, PhaseStatus::Failed);
    assert_eq!(state.status, RunStatus::Failed);
}

// ─── Writers outside the running supervisor ─────────────────────────────────

#[derive(Clone, Copy)]
enum Interference {
    Cancel,
    AskFeedback,
    Annotate,
}

/// Agent during whose step a second supervisor on the same ledger acts on
/// the run, the way a separate `runwarden` process would
struct InterferingAgent {
    ledger_root: PathBuf,
    during: &'static str,
    action: Interference,
    executed: Mutex<Vec<String>>,
}

impl InterferingAgent {
    fn new(h: &Harness, during: &'static str, action: Interference) -> Arc<Self> {
        Arc::new(Self {
            ledger_root: h.dir.path().join("runs"),
            during,
            action,
            executed: Mutex::new(Vec::new()),
        })
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionAgent for InterferingAgent {
    fn name(&self) -> &str {
        "interfering"
    }

    async fn execute(&self, request: StepRequest) -> Result<SelfReport, AgentError> {
        self.executed.lock().unwrap().push(request.step.id.clone());
        if request.step.id == self.during {
            let other = Supervisor::new(
                Ledger::new(&self.ledger_root),
                Arc::new(ScriptedAgent::new()),
                StubVerifier::passing(),
            );
            match self.action {
                Interference::Cancel => {
                    other.cancel(&request.run_id, "release pulled").unwrap();
                }
                Interference::AskFeedback => {
                    let point = ResumePoint {
                        phase: request.step.phase.clone(),
                        step_index: request.step.index,
                    };
                    other
                        .request_feedback(&request.run_id, "Is staging drained?", &[], &point)
                        .unwrap();
                }
                Interference::Annotate => {
                    other
                        .ledger()
                        .append(
                            &request.run_id,
                            NewEvent::new(EventType::ArtifactCreate, EventSource::Operator)
                                .data(serde_json::json!({"key": "ticket", "value": "OPS-7"})),
                        )
                        .unwrap();
                }
            }
        }
        Ok(SelfReport::success(&request.step.id, "done"))
    }
}

fn supervisor_with(h: &Harness, agent: Arc<dyn ExecutionAgent>) -> Supervisor {
    Supervisor::new(h.ledger(), agent, StubVerifier::passing()).with_settings(h.settings())
}

fn assert_persisted_matches_replay(h: &Harness, supervisor: &Supervisor, run_id: &RunId) {
    let events = supervisor.events(run_id).unwrap();
    let persisted = h.ledger().read_state(run_id).unwrap().unwrap();
    assert_eq!(persisted, state::fold(&events));
}

#[tokio::test]
async fn test_cancel_while_step_runs_stops_the_run() {
    let h = Harness::new();
    let agent = InterferingAgent::new(&h, "compile", Interference::Cancel);
    let supervisor = supervisor_with(&h, agent.clone());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
    assert_eq!(agent.executed(), vec!["compile"]);

    let run_id = outcome.run_id();
    let types = event_types(&supervisor, run_id);
    assert_eq!(types.last(), Some(&EventType::WorkflowCancelled));
    assert!(!types.contains(&EventType::StepComplete));
    assert!(!types.contains(&EventType::WorkflowComplete));

    assert_eq!(supervisor.status(run_id).unwrap().status, RunStatus::Cancelled);
    assert_persisted_matches_replay(&h, &supervisor, run_id);

    let err = supervisor.resume(&plan, run_id, "build", 1).await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotResumable { .. }));
}

#[tokio::test]
async fn test_feedback_request_while_step_runs_pauses_the_run() {
    let h = Harness::new();
    let agent = InterferingAgent::new(&h, "test", Interference::AskFeedback);
    let supervisor = supervisor_with(&h, agent.clone());
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let RunOutcome::AwaitingFeedback {
        run_id,
        request_id,
        prompt,
    } = outcome
    else {
        panic!("expected the run to wait for feedback, got {outcome:?}");
    };
    assert_eq!(prompt, "Is staging drained?");
    assert_eq!(agent.executed(), vec!["compile", "test"]);

    let state = supervisor.status(&run_id).unwrap();
    assert_eq!(state.status, RunStatus::AwaitingFeedback);
    assert_eq!(state.step_status("build", "test"), StepStatus::InProgress);
    assert_persisted_matches_replay(&h, &supervisor, &run_id);

    let point = supervisor
        .provide_feedback(&run_id, &request_id, "drained", Some(true))
        .unwrap();
    assert_eq!(point.step_index, 2);
    let outcome = supervisor
        .resume(&plan, &run_id, &point.phase, point.step_index)
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(agent.executed(), vec!["compile", "test", "test", "package"]);
}

#[tokio::test]
async fn test_foreign_events_are_folded_into_running_state() {
    let h = Harness::new();
    let agent = InterferingAgent::new(&h, "compile", Interference::Annotate);
    let supervisor = supervisor_with(&h, agent.clone());

    let outcome = supervisor.start(&three_step_plan(), options()).await.unwrap();
    assert!(outcome.is_completed());
    let run_id = outcome.run_id();

    let state = supervisor.status(run_id).unwrap();
    assert_eq!(state.artifacts.get("ticket").map(String::as_str), Some("OPS-7"));
    assert_eq!(state.last_event_id, supervisor.events(run_id).unwrap().len() as u64);
    assert_persisted_matches_replay(&h, &supervisor, run_id);
}

// ─── Post-step hooks and capabilities ───────────────────────────────────────

#[tokio::test]
async fn test_blocking_post_step_hook_withdraws_completion() {
    let h = Harness::new();
    let hooks = HooksConfig::default().with_hooks(
        LifecyclePoint::PostStep,
        vec![Hook::script(
            "tree-clean",
            "test \"$RUNWARDEN_STEP\" != test",
            Duration::from_secs(5),
        )],
    );
    let supervisor = h.supervisor(StubVerifier::passing()).with_hooks(hooks);
    let plan = three_step_plan();

    let outcome = supervisor.start(&plan, options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.step.as_deref(), Some("test"));
    assert_eq!(halt.kind, FailureKind::HookBlocked);

    let run_id = outcome.run_id().clone();
    let state = supervisor.status(&run_id).unwrap();
    assert_eq!(state.step_status("build", "test"), StepStatus::Failed);
    assert_eq!(
        state.phase("build").unwrap().completed_steps,
        vec!["compile".to_string()]
    );
}

/// Release gate that answers from a fixed verdict and counts its calls
struct ReleaseGate {
    open: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl Capability for ReleaseGate {
    fn name(&self) -> &str {
        "release-gate"
    }

    async fn invoke(&self, input: &CapabilityInput) -> Result<CapabilityOutput, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(input.parameters["window"], "weekday");
        Ok(CapabilityOutput {
            success: self.open,
            message: if self.open { "open" } else { "change freeze" }.to_string(),
        })
    }
}

fn gate_hooks() -> HooksConfig {
    HooksConfig::default().with_hooks(
        LifecyclePoint::PrePhase,
        vec![Hook {
            name: "gate".to_string(),
            action: HookAction::Capability {
                capability: "release-gate".to_string(),
                parameters: serde_json::json!({"window": "weekday"}),
            },
            required: true,
            timeout: Duration::from_secs(5),
            environments: Vec::new(),
            failure_mode: FailureMode::Stop,
        }],
    )
}

fn gated_supervisor(h: &Harness, gate: Arc<ReleaseGate>) -> Supervisor {
    let mut registry = CapabilityRegistry::new();
    registry.register(gate);
    h.supervisor(StubVerifier::passing())
        .with_hooks(gate_hooks())
        .with_hook_runner(HookRunner::new(registry))
}

#[tokio::test]
async fn test_capability_hook_runs_through_registered_capability() {
    let h = Harness::new();
    let gate = Arc::new(ReleaseGate {
        open: true,
        calls: AtomicUsize::new(0),
    });
    let supervisor = gated_supervisor(&h, gate.clone());

    let outcome = supervisor.start(&two_phase_plan(), options()).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_closed_capability_gate_halts_phase() {
    let h = Harness::new();
    let gate = Arc::new(ReleaseGate {
        open: false,
        calls: AtomicUsize::new(0),
    });
    let supervisor = gated_supervisor(&h, gate.clone());

    let outcome = supervisor.start(&two_phase_plan(), options()).await.unwrap();
    let halt = halted(&outcome);
    assert_eq!(halt.phase, "build");
    assert_eq!(halt.kind, FailureKind::HookBlocked);
    assert!(halt.error.contains("change freeze"));
    assert!(h.agent.executed().is_empty());
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
}
