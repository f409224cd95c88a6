use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use super::execution::{RunContext, StepResult};
use super::{
    resume_command, ExecutionMode, FixOutcome, RerunOptions, RunOutcome, StartOptions,
    SupervisorError, SupervisorSettings,
};
use crate::agent::ExecutionAgent;
use crate::hooks::{HookRunner, HooksConfig};
use crate::issues::IssueEngine;
use crate::ledger::{
    derive_scope, Event, EventSource, EventType, Ledger, Lineage, NewEvent, RunId, RunMetadata,
};
use crate::plan::{PhasePlan, Plan, REMEDIATION_PHASE};
use crate::state::{self, PhaseStatus, ResumePoint, RunState, RunStatus};
use crate::verify::StepVerifier;

/// Coordinates the ledger, agent, verifier, hooks and knowledge base
pub struct Supervisor {
    pub(super) ledger: Ledger,
    pub(super) agent: Arc<dyn ExecutionAgent>,
    pub(super) verifier: Arc<dyn StepVerifier>,
    pub(super) hooks: HooksConfig,
    pub(super) hook_runner: HookRunner,
    pub(super) issues: Option<IssueEngine>,
    pub(super) settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        ledger: Ledger,
        agent: Arc<dyn ExecutionAgent>,
        verifier: Arc<dyn StepVerifier>,
    ) -> Self {
        Self {
            ledger,
            agent,
            verifier,
            hooks: HooksConfig::default(),
            hook_runner: HookRunner::default(),
            issues: None,
            settings: SupervisorSettings::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: HooksConfig) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_hook_runner(mut self, runner: HookRunner) -> Self {
        self.hook_runner = runner;
        self
    }

    pub fn with_issue_engine(mut self, engine: IssueEngine) -> Self {
        self.issues = Some(engine);
        self
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn ensure_exists(&self, run_id: &RunId) -> Result<(), SupervisorError> {
        if self.ledger.exists(run_id) {
            Ok(())
        } else {
            Err(SupervisorError::RunNotFound(run_id.clone()))
        }
    }

    fn check_plan(plan: &Plan, metadata: &RunMetadata) -> Result<(), SupervisorError> {
        plan.validate()?;
        if plan.workflow_id == metadata.workflow_id {
            Ok(())
        } else {
            Err(SupervisorError::PlanMismatch {
                plan: plan.workflow_id.clone(),
                run: metadata.workflow_id.clone(),
            })
        }
    }

    /// Payload for workflow_start / workflow_resumed
    fn entry_data(&self, run_id: &RunId, workflow_id: &str) -> serde_json::Value {
        let mut data = json!({
            "run_id": run_id.to_string(),
            "workflow_id": workflow_id,
            "mode": self.settings.mode,
            "environment": self.settings.environment,
        });
        if self.settings.mode == ExecutionMode::Batched {
            warn!(
                %run_id,
                "Batched mode: step ordering is left to the agent and not enforced by the supervisor"
            );
            data["ordering_guarantee"] = json!("agent-sequenced");
        }
        data
    }

    /// Current state, folded from the ledger
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn status(&self, run_id: &RunId) -> Result<RunState, SupervisorError> {
        self.ensure_exists(run_id)?;
        let events = self.ledger.read_all(run_id)?;
        Ok(state::fold(&events))
    }

    pub fn events(&self, run_id: &RunId) -> Result<Vec<Event>, SupervisorError> {
        self.ensure_exists(run_id)?;
        Ok(self.ledger.read_all(run_id)?)
    }

    /// Create a run for `plan` and drive it until it completes or stops
    #[instrument(skip(self, plan, options), fields(workflow = %plan.workflow_id))]
    pub async fn start(
        &self,
        plan: &Plan,
        options: StartOptions,
    ) -> Result<RunOutcome, SupervisorError> {
        plan.validate()?;
        let (organization, project) = match options.scope {
            Some(scope) => scope,
            None => derive_scope(&self.settings.base_dir).await,
        };
        let run_id = RunId::generate(&organization, &project)?;
        let metadata = RunMetadata {
            run_id: run_id.clone(),
            work_id: options
                .work_id
                .unwrap_or_else(|| plan.workflow_id.clone()),
            workflow_id: plan.workflow_id.clone(),
            autonomy_level: options.autonomy,
            created_at: Utc::now(),
            lineage: None,
            parameters: options.parameters,
            plan_path: options.plan_path,
        };
        self.ledger.create_run(&metadata)?;
        info!(%run_id, steps = plan.total_steps(), "Starting run");

        let mut ctx = RunContext::new(plan, metadata, RunState::default());
        let data = self.entry_data(&run_id, &plan.workflow_id);
        self.record(
            &mut ctx,
            NewEvent::new(EventType::WorkflowStart, EventSource::Supervisor)
                .message(format!("workflow {} started", plan.workflow_id))
                .data(data),
        )?;
        self.drive(&mut ctx, 0).await
    }

    /// Continue a halted or interrupted run from an explicit position.
    ///
    /// Completed steps at or after the position are not executed again.
    #[instrument(skip(self, plan), fields(run_id = %run_id))]
    pub async fn resume(
        &self,
        plan: &Plan,
        run_id: &RunId,
        phase: &str,
        step_index: usize,
    ) -> Result<RunOutcome, SupervisorError> {
        self.ensure_exists(run_id)?;
        let metadata = self.ledger.read_metadata(run_id)?;
        Self::check_plan(plan, &metadata)?;
        let state = self.status(run_id)?;

        if !state.status.is_resumable() {
            return Err(SupervisorError::NotResumable {
                run_id: run_id.clone(),
                status: state.status,
            });
        }
        if let Some(pending) = &state.pending_feedback {
            return Err(SupervisorError::AwaitingFeedback {
                run_id: run_id.clone(),
                request_id: pending.request_id.clone(),
            });
        }
        let first_phase = Self::check_resume_point(plan, &state, phase, step_index)?;

        let mut ctx = RunContext::new(plan, metadata, state);
        let mut data = self.entry_data(run_id, &plan.workflow_id);
        data["phase"] = json!(phase);
        data["step_index"] = json!(step_index);
        self.record(
            &mut ctx,
            NewEvent::new(EventType::WorkflowResumed, EventSource::Operator)
                .phase(phase)
                .message(format!("resumed at {phase} step {step_index}"))
                .data(data),
        )?;
        info!(%run_id, phase, step_index, "Resuming run");
        self.drive(&mut ctx, first_phase).await
    }

    /// Every step before the position must already be done
    fn check_resume_point(
        plan: &Plan,
        state: &RunState,
        phase: &str,
        step_index: usize,
    ) -> Result<usize, SupervisorError> {
        let position = plan
            .phase_position(phase)
            .ok_or_else(|| SupervisorError::UnknownPhase(phase.to_string()))?;
        if plan.step_at(phase, step_index).is_none() {
            return Err(SupervisorError::InvalidResumePoint(format!(
                "phase '{phase}' has no step {step_index}"
            )));
        }

        let skipped = |name: &str| {
            state
                .phase(name)
                .is_some_and(|p| p.status == PhaseStatus::Skipped)
        };
        let earlier_phases = plan.phases[..position]
            .iter()
            .filter(|p| !skipped(&p.name))
            .flat_map(|p| p.steps.iter());
        let earlier_in_phase = plan.phases[position]
            .steps
            .iter()
            .take(step_index.saturating_sub(1));

        if let Some(incomplete) = earlier_phases
            .chain(earlier_in_phase)
            .find(|s| !state.step_status(&s.phase, &s.id).is_done())
        {
            return Err(SupervisorError::InvalidResumePoint(format!(
                "step '{}' in phase '{}' has not completed",
                incomplete.id, incomplete.phase
            )));
        }
        Ok(position)
    }

    /// Start a new run linked to `run_id`; the parent ledger is left untouched
    #[instrument(skip(self, plan, options), fields(parent = %run_id))]
    pub async fn rerun(
        &self,
        plan: &Plan,
        run_id: &RunId,
        options: RerunOptions,
    ) -> Result<RunOutcome, SupervisorError> {
        self.ensure_exists(run_id)?;
        let parent = self.ledger.read_metadata(run_id)?;
        Self::check_plan(plan, &parent)?;
        let first_phase = match &options.from_phase {
            Some(name) => plan
                .phase_position(name)
                .ok_or_else(|| SupervisorError::UnknownPhase(name.clone()))?,
            None => 0,
        };

        let lineage = match &parent.lineage {
            Some(l) => Lineage {
                parent: run_id.clone(),
                root: l.root.clone(),
                generation: l.generation + 1,
            },
            None => Lineage {
                parent: run_id.clone(),
                root: run_id.clone(),
                generation: 1,
            },
        };
        let mut parameters = parent.parameters.clone();
        parameters.extend(options.parameters);

        let new_id = RunId::generate(run_id.organization(), run_id.project())?;
        let metadata = RunMetadata {
            run_id: new_id.clone(),
            work_id: parent.work_id.clone(),
            workflow_id: parent.workflow_id.clone(),
            autonomy_level: parent.autonomy_level,
            created_at: Utc::now(),
            lineage: Some(lineage.clone()),
            parameters,
            plan_path: parent.plan_path.clone(),
        };
        self.ledger.create_run(&metadata)?;
        info!(run_id = %new_id, generation = lineage.generation, "Starting rerun");

        let mut ctx = RunContext::new(plan, metadata, RunState::default());
        let data = self.entry_data(&new_id, &plan.workflow_id);
        self.record(
            &mut ctx,
            NewEvent::new(EventType::WorkflowStart, EventSource::Supervisor)
                .message(format!("workflow {} started", plan.workflow_id))
                .data(data),
        )?;
        self.record(
            &mut ctx,
            NewEvent::new(EventType::WorkflowRerun, EventSource::Operator)
                .message(format!("rerun of {run_id}"))
                .data(json!({
                    "parent": lineage.parent.to_string(),
                    "root": lineage.root.to_string(),
                    "generation": lineage.generation,
                    "from_phase": options.from_phase,
                })),
        )?;
        for skipped in &plan.phases[..first_phase] {
            self.record(
                &mut ctx,
                NewEvent::new(EventType::PhaseSkip, EventSource::Supervisor)
                    .phase(&skipped.name)
                    .message(format!("phase {} skipped by rerun", skipped.name)),
            )?;
        }
        self.drive(&mut ctx, first_phase).await
    }

    #[instrument(skip(self, reason), fields(run_id = %run_id))]
    pub fn cancel(&self, run_id: &RunId, reason: &str) -> Result<RunState, SupervisorError> {
        let mut state = self.status(run_id)?;
        if state.status.is_final() {
            return Err(SupervisorError::AlreadyFinished(run_id.clone()));
        }
        self.commit(
            run_id,
            &mut state,
            NewEvent::new(EventType::WorkflowCancelled, EventSource::Operator).message(reason),
        )?;
        info!(%run_id, reason, "Run cancelled");
        Ok(state)
    }

    /// Ask a human before the run continues at `resume_point`
    #[instrument(skip(self, prompt, options), fields(run_id = %run_id))]
    pub fn request_feedback(
        &self,
        run_id: &RunId,
        prompt: &str,
        options: &[String],
        resume_point: &ResumePoint,
    ) -> Result<String, SupervisorError> {
        let mut state = self.status(run_id)?;
        if state.status.is_final() {
            return Err(SupervisorError::AlreadyFinished(run_id.clone()));
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        self.commit(
            run_id,
            &mut state,
            NewEvent::new(EventType::FeedbackRequest, EventSource::Supervisor)
                .phase(&resume_point.phase)
                .message(prompt)
                .data(json!({
                    "request_id": request_id,
                    "options": options,
                    "resume_phase": resume_point.phase,
                    "resume_step_index": resume_point.step_index,
                })),
        )?;
        Ok(request_id)
    }

    /// Answer a pending request; the run then waits for an explicit resume
    #[instrument(skip(self, response), fields(run_id = %run_id))]
    pub fn provide_feedback(
        &self,
        run_id: &RunId,
        request_id: &str,
        response: &str,
        approved: Option<bool>,
    ) -> Result<ResumePoint, SupervisorError> {
        let mut state = self.status(run_id)?;
        let Some(pending) = state
            .pending_feedback
            .clone()
            .filter(|p| p.request_id == request_id)
        else {
            return Err(SupervisorError::UnknownFeedbackRequest {
                run_id: run_id.clone(),
                request_id: request_id.to_string(),
            });
        };

        self.commit(
            run_id,
            &mut state,
            NewEvent::new(EventType::FeedbackReceived, EventSource::Operator)
                .message(response)
                .data(json!({ "request_id": request_id, "response": response })),
        )?;
        if let Some(approved) = approved {
            let kind = if approved {
                EventType::ApprovalGranted
            } else {
                EventType::ApprovalDenied
            };
            self.commit(
                run_id,
                &mut state,
                NewEvent::new(kind, EventSource::Operator)
                    .data(json!({ "request_id": request_id })),
            )?;
        }
        info!(%run_id, request_id, ?approved, "Feedback recorded");
        Ok(pending.resume_point)
    }

    /// Run an automatable knowledge-base fix against a halted run.
    ///
    /// The fix goes through the same machine, hooks and verifier as a plan
    /// step. The run stays halted; the operator resumes it afterwards.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn apply_fix(
        &self,
        run_id: &RunId,
        issue_id: &str,
        solution_id: &str,
    ) -> Result<FixOutcome, SupervisorError> {
        let engine = self.issues.as_ref().ok_or(SupervisorError::NoIssueEngine)?;
        let state = self.status(run_id)?;
        if state.status != RunStatus::Failed {
            return Err(SupervisorError::NotHalted {
                run_id: run_id.clone(),
                status: state.status,
            });
        }
        let resume = state
            .errors
            .iter()
            .rev()
            .filter(|e| e.phase.as_deref() != Some(REMEDIATION_PHASE))
            .find_map(|e| Some(resume_command(run_id, e.phase.as_deref()?, e.step_index?)));

        let step = engine.proposed_fix(issue_id, solution_id)?;
        let metadata = self.ledger.read_metadata(run_id)?;
        let plan = Plan {
            workflow_id: metadata.workflow_id.clone(),
            description: None,
            phases: vec![PhasePlan {
                name: REMEDIATION_PHASE.to_string(),
                steps: vec![step.clone()],
            }],
        };
        let mut ctx = RunContext::new(&plan, metadata, state);
        self.record(
            &mut ctx,
            NewEvent::new(EventType::DecisionPoint, EventSource::Operator)
                .phase(REMEDIATION_PHASE)
                .message(format!("applying fix: {}", step.display_name()))
                .data(json!({ "issue_id": issue_id, "solution_id": solution_id })),
        )?;

        let started = Instant::now();
        let (success, error) = match self.run_step(&mut ctx, &step).await? {
            StepResult::Completed => (true, None),
            StepResult::Failed(failure) => (false, Some(failure.error)),
            StepResult::Stopped(RunOutcome::Cancelled { .. }) => {
                (false, Some("run was cancelled while the fix ran".to_string()))
            }
            StepResult::Stopped(_) => {
                (false, Some("fix is waiting for operator feedback".to_string()))
            }
        };
        let solution = engine.record_attempt(issue_id, solution_id, success, started.elapsed())?;
        info!(%run_id, solution_id, success, "Fix applied");

        Ok(FixOutcome {
            step,
            success,
            error,
            solution,
            resume_command: resume,
        })
    }
}
