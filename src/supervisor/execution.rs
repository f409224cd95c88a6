//! The step loop.

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::machine::{FailureKind, StepMachine, StepState};
use super::runner::Supervisor;
use super::{resume_command, ExecutionMode, RunHalt, RunOutcome, SupervisorError};
use crate::agent::{SelfReport, StepRequest};
use crate::hooks::{HookContext, HookOutcome, HookStatus, LifecyclePoint};
use crate::issues::{IssueQuery, Suggestion};
use crate::ledger::{Event, EventSource, EventType, NewEvent, RunId, RunMetadata};
use crate::plan::{PhasePlan, Plan, StepDescriptor};
use crate::state::{self, PhaseStatus, RunState, RunStatus};
use crate::verify::Verdict;

/// A run being driven by the supervisor
pub(super) struct RunContext<'a> {
    pub run_id: RunId,
    pub plan: &'a Plan,
    pub metadata: RunMetadata,
    pub state: RunState,
    /// Injected by the current phase's context hooks
    pub phase_context: Option<String>,
}

impl<'a> RunContext<'a> {
    pub fn new(plan: &'a Plan, metadata: RunMetadata, state: RunState) -> Self {
        Self {
            run_id: metadata.run_id.clone(),
            plan,
            metadata,
            state,
            phase_context: None,
        }
    }
}

/// Where and why a run stopped
pub(super) struct Failure {
    pub phase: String,
    pub step: Option<String>,
    pub step_index: usize,
    pub error: String,
    pub kind: FailureKind,
    /// Hint for the knowledge base lookup
    pub resource_type: Option<String>,
}

pub(super) enum StepResult {
    Completed,
    Failed(Failure),
    /// Waiting for feedback, or cancelled from outside
    Stopped(RunOutcome),
}

enum PhaseResult {
    Completed,
    Stopped(RunOutcome),
}

fn join_context(a: Option<&str>, b: Option<&str>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(format!("{a}\n\n{b}")),
        (Some(c), None) | (None, Some(c)) => Some(c.to_string()),
        (None, None) => None,
    }
}

impl Supervisor {
    /// Append an event and advance the materialized state.
    ///
    /// If another writer appended in between, the state is refolded from the
    /// ledger so it never skips their events.
    pub(super) fn commit(
        &self,
        run_id: &RunId,
        state: &mut RunState,
        event: NewEvent,
    ) -> Result<Event, SupervisorError> {
        let event = self.ledger.append(run_id, event)?;
        if event.event_id == state.last_event_id + 1 {
            *state = state::apply(std::mem::take(state), &event);
        } else {
            debug!(%run_id, event_id = event.event_id, "Ledger moved underneath us; refolding");
            *state = state::fold(&self.ledger.read_all(run_id)?);
        }
        self.ledger.write_state(run_id, state)?;
        Ok(event)
    }

    /// Pick up events other writers appended; stop if they cancelled the run
    /// or asked for feedback
    pub(super) fn interrupted_elsewhere(
        &self,
        ctx: &mut RunContext<'_>,
    ) -> Result<Option<RunOutcome>, SupervisorError> {
        if self.ledger.sequence(&ctx.run_id)? == ctx.state.last_event_id {
            return Ok(None);
        }
        ctx.state = state::fold(&self.ledger.read_all(&ctx.run_id)?);
        self.ledger.write_state(&ctx.run_id, &ctx.state)?;

        match (ctx.state.status, &ctx.state.pending_feedback) {
            (RunStatus::Cancelled, _) => {
                info!(run_id = %ctx.run_id, "Run was cancelled; stopping");
                Ok(Some(RunOutcome::Cancelled {
                    run_id: ctx.run_id.clone(),
                }))
            }
            (RunStatus::AwaitingFeedback, Some(pending)) => {
                info!(run_id = %ctx.run_id, request_id = %pending.request_id, "Feedback requested; stopping");
                Ok(Some(RunOutcome::AwaitingFeedback {
                    run_id: ctx.run_id.clone(),
                    request_id: pending.request_id.clone(),
                    prompt: pending.prompt.clone(),
                }))
            }
            _ => Ok(None),
        }
    }

    pub(super) fn record(
        &self,
        ctx: &mut RunContext<'_>,
        event: NewEvent,
    ) -> Result<Event, SupervisorError> {
        self.commit(&ctx.run_id, &mut ctx.state, event)
    }

    async fn run_hooks(
        &self,
        ctx: &RunContext<'_>,
        point: LifecyclePoint,
        phase: Option<&str>,
        step: Option<&str>,
    ) -> HookOutcome {
        let context = HookContext {
            run_id: ctx.run_id.to_string(),
            phase: phase.map(str::to_string),
            step: step.map(str::to_string),
            base_dir: self.settings.base_dir.clone(),
            extra: ctx.metadata.parameters.clone(),
        };
        let outcome = self
            .hook_runner
            .run(self.hooks.get(point), point, &self.settings.environment, &context)
            .await;
        for warning in &outcome.warnings {
            warn!(run_id = %ctx.run_id, %point, "{warning}");
        }
        outcome
    }

    fn is_done(ctx: &RunContext<'_>, step: &StepDescriptor) -> bool {
        ctx.state.step_status(&step.phase, &step.id).is_done()
    }

    fn first_incomplete(ctx: &RunContext<'_>, phase: &PhasePlan) -> usize {
        phase
            .steps
            .iter()
            .find(|s| !Self::is_done(ctx, s))
            .map_or(phase.steps.len().max(1), |s| s.index)
    }

    /// Run phases from `first_phase` to the end of the plan
    pub(super) async fn drive(
        &self,
        ctx: &mut RunContext<'_>,
        first_phase: usize,
    ) -> Result<RunOutcome, SupervisorError> {
        let plan = ctx.plan;

        let pre_run = self.run_hooks(ctx, LifecyclePoint::PreRun, None, None).await;
        if let HookStatus::BlockingFailure { hook, reason } = pre_run.status {
            if let Some(phase) = plan.phases.get(first_phase) {
                let failure = Failure {
                    phase: phase.name.clone(),
                    step: None,
                    step_index: Self::first_incomplete(ctx, phase),
                    error: format!("pre_run hook '{hook}' failed: {reason}"),
                    kind: FailureKind::HookBlocked,
                    resource_type: None,
                };
                return self.halt(ctx, failure).await;
            }
        }

        for phase in &plan.phases[first_phase.min(plan.phases.len())..] {
            let status = ctx.state.phase(&phase.name).map(|p| p.status);
            if matches!(status, Some(PhaseStatus::Completed | PhaseStatus::Skipped)) {
                debug!(phase = %phase.name, "Phase already settled; skipping");
                continue;
            }
            if let Some(outcome) = self.interrupted_elsewhere(ctx)? {
                return Ok(outcome);
            }
            if let PhaseResult::Stopped(outcome) = self.run_phase(ctx, phase).await? {
                return Ok(outcome);
            }
        }

        if let Some(outcome) = self.interrupted_elsewhere(ctx)? {
            return Ok(outcome);
        }

        self.record(
            ctx,
            NewEvent::new(EventType::WorkflowComplete, EventSource::Supervisor)
                .message(format!("workflow {} completed", plan.workflow_id)),
        )?;
        let post_run = self.run_hooks(ctx, LifecyclePoint::PostRun, None, None).await;
        if !post_run.is_ok() {
            warn!(run_id = %ctx.run_id, "post_run hooks failed after completion");
        }
        info!(run_id = %ctx.run_id, workflow = %plan.workflow_id, "Run completed");
        Ok(RunOutcome::Completed {
            run_id: ctx.run_id.clone(),
        })
    }

    async fn run_phase(
        &self,
        ctx: &mut RunContext<'_>,
        phase: &PhasePlan,
    ) -> Result<PhaseResult, SupervisorError> {
        let pre = self
            .run_hooks(ctx, LifecyclePoint::PrePhase, Some(&phase.name), None)
            .await;
        if let HookStatus::BlockingFailure { hook, reason } = &pre.status {
            let failure = Failure {
                phase: phase.name.clone(),
                step: None,
                step_index: Self::first_incomplete(ctx, phase),
                error: format!("pre_phase hook '{hook}' failed: {reason}"),
                kind: FailureKind::HookBlocked,
                resource_type: None,
            };
            return self.phase_halt(ctx, failure).await;
        }

        ctx.phase_context = pre.injected_context.clone();
        let mut start = NewEvent::new(EventType::PhaseStart, EventSource::Supervisor)
            .phase(&phase.name)
            .message(format!("phase {} started", phase.name));
        if let Some(context) = &ctx.phase_context {
            start = start.data(json!({ "context": context }));
        }
        self.record(ctx, start)?;

        let result = match self.settings.mode {
            ExecutionMode::Sequential => self.run_steps(ctx, phase).await?,
            ExecutionMode::Batched => self.run_batch(ctx, phase).await?,
        };
        match result {
            StepResult::Completed => {}
            StepResult::Failed(failure) => {
                return Ok(PhaseResult::Stopped(self.halt(ctx, failure).await?))
            }
            StepResult::Stopped(outcome) => return Ok(PhaseResult::Stopped(outcome)),
        }

        self.record(
            ctx,
            NewEvent::new(EventType::PhaseComplete, EventSource::Supervisor)
                .phase(&phase.name)
                .message(format!("phase {} completed", phase.name)),
        )?;

        let post = self
            .run_hooks(ctx, LifecyclePoint::PostPhase, Some(&phase.name), None)
            .await;
        if let HookStatus::BlockingFailure { hook, reason } = &post.status {
            let failure = Failure {
                phase: phase.name.clone(),
                step: None,
                step_index: phase.steps.len().max(1),
                error: format!("post_phase hook '{hook}' failed: {reason}"),
                kind: FailureKind::HookBlocked,
                resource_type: None,
            };
            return self.phase_halt(ctx, failure).await;
        }
        ctx.phase_context = None;
        Ok(PhaseResult::Completed)
    }

    async fn phase_halt(
        &self,
        ctx: &mut RunContext<'_>,
        failure: Failure,
    ) -> Result<PhaseResult, SupervisorError> {
        self.record(
            ctx,
            NewEvent::new(EventType::PhaseError, EventSource::Hook)
                .phase(&failure.phase)
                .message(&failure.error)
                .data(json!({ "kind": failure.kind })),
        )?;
        Ok(PhaseResult::Stopped(self.halt(ctx, failure).await?))
    }

    async fn run_steps(
        &self,
        ctx: &mut RunContext<'_>,
        phase: &PhasePlan,
    ) -> Result<StepResult, SupervisorError> {
        for step in &phase.steps {
            if Self::is_done(ctx, step) {
                debug!(phase = %phase.name, step = %step.id, "Step already completed; skipping");
                continue;
            }
            if let Some(outcome) = self.interrupted_elsewhere(ctx)? {
                return Ok(StepResult::Stopped(outcome));
            }
            match self.run_step(ctx, step).await? {
                StepResult::Completed => {}
                other => return Ok(other),
            }
        }
        Ok(StepResult::Completed)
    }

    fn begin_step(
        &self,
        ctx: &mut RunContext<'_>,
        step: &StepDescriptor,
        machine: &mut StepMachine,
    ) -> Result<(), SupervisorError> {
        machine.start()?;
        self.record(
            ctx,
            NewEvent::new(EventType::StepStart, EventSource::Supervisor)
                .phase(&step.phase)
                .step(&step.id, step.index)
                .message(format!("step {} started", step.display_name()))
                .data(json!({ "command": step.command })),
        )?;
        Ok(())
    }

    fn request_for(
        ctx: &RunContext<'_>,
        step: &StepDescriptor,
        injected: Option<&str>,
    ) -> StepRequest {
        StepRequest {
            run_id: ctx.run_id.clone(),
            step: step.clone(),
            context: join_context(ctx.phase_context.as_deref(), injected),
            artifacts: ctx.state.artifacts.clone(),
            parameters: ctx.metadata.parameters.clone(),
            attempt: ctx
                .state
                .step(&step.phase, &step.id)
                .map_or(1, |r| r.attempts),
        }
    }

    /// Start, delegate, verify and settle one step
    pub(super) async fn run_step(
        &self,
        ctx: &mut RunContext<'_>,
        step: &StepDescriptor,
    ) -> Result<StepResult, SupervisorError> {
        let mut machine = StepMachine::new();
        self.begin_step(ctx, step, &mut machine)?;

        let pre = self
            .run_hooks(ctx, LifecyclePoint::PreStep, Some(&step.phase), Some(&step.id))
            .await;
        if let HookStatus::BlockingFailure { hook, reason } = &pre.status {
            let error = format!("pre_step hook '{hook}' failed: {reason}");
            return self.fail_step(ctx, step, &mut machine, FailureKind::HookBlocked, error);
        }

        let request = Self::request_for(ctx, step, pre.injected_context.as_deref());
        debug!(run_id = %ctx.run_id, step = %step.id, attempt = request.attempt, "Delegating step");
        let report = match tokio::time::timeout(
            self.settings.step_timeout,
            self.agent.execute(request),
        )
        .await
        {
            Err(_) => {
                let error = format!(
                    "agent did not answer within {}s",
                    self.settings.step_timeout.as_secs()
                );
                return self.fail_step(ctx, step, &mut machine, FailureKind::Timeout, error);
            }
            Ok(Err(e)) => {
                return self.fail_step(
                    ctx,
                    step,
                    &mut machine,
                    FailureKind::DelegationError,
                    e.to_string(),
                );
            }
            Ok(Ok(report)) => report,
        };

        self.settle(ctx, step, &mut machine, report).await
    }

    /// Record what the agent reported, verify it and close the step
    async fn settle(
        &self,
        ctx: &mut RunContext<'_>,
        step: &StepDescriptor,
        machine: &mut StepMachine,
        report: SelfReport,
    ) -> Result<StepResult, SupervisorError> {
        // A cancel or feedback request that arrived while the agent worked
        // discards its report
        if let Some(outcome) = self.interrupted_elsewhere(ctx)? {
            return Ok(StepResult::Stopped(outcome));
        }
        if report.step_id != step.id {
            let error = format!(
                "agent reported on step '{}' while '{}' was running",
                report.step_id, step.id
            );
            return self.fail_step(ctx, step, machine, FailureKind::DelegationError, error);
        }

        for reported in &report.events {
            if !reported.event_type.is_domain() {
                warn!(step = %step.id, kind = %reported.event_type, "Ignoring non-domain event from agent");
                continue;
            }
            let mut event = NewEvent::new(reported.event_type.clone(), EventSource::Agent)
                .phase(&step.phase)
                .step(&step.id, step.index)
                .message(&reported.message);
            if let Some(data) = &reported.data {
                event = event.data(data.clone());
            }
            self.record(ctx, event)?;
        }
        for (key, value) in &report.artifacts {
            let kind = if ctx.state.artifacts.contains_key(key) {
                EventType::ArtifactModify
            } else {
                EventType::ArtifactCreate
            };
            self.record(
                ctx,
                NewEvent::new(kind, EventSource::Agent)
                    .phase(&step.phase)
                    .step(&step.id, step.index)
                    .message(format!("artifact {key}"))
                    .data(json!({ "key": key, "value": value })),
            )?;
        }

        if let Some(ask) = &report.feedback {
            let request_id = uuid::Uuid::new_v4().to_string();
            self.record(
                ctx,
                NewEvent::new(EventType::FeedbackRequest, EventSource::Agent)
                    .phase(&step.phase)
                    .step(&step.id, step.index)
                    .message(&ask.prompt)
                    .data(json!({
                        "request_id": request_id,
                        "options": ask.options,
                        "resume_phase": step.phase,
                        "resume_step_index": step.index,
                    })),
            )?;
            info!(run_id = %ctx.run_id, step = %step.id, %request_id, "Agent asked for feedback");
            return Ok(StepResult::Stopped(RunOutcome::AwaitingFeedback {
                run_id: ctx.run_id.clone(),
                request_id,
                prompt: ask.prompt.clone(),
            }));
        }

        let verdict = if report.success {
            self.verifier.verify(step, &ctx.state).await
        } else {
            Verdict::NotApplicable
        };

        if let StepState::Failed(kind) = machine.complete(&report, &verdict)? {
            let error = match (&kind, &verdict) {
                (FailureKind::VerificationVeto, Verdict::Fail(reason)) => {
                    warn!(
                        run_id = %ctx.run_id,
                        step = %step.id,
                        %reason,
                        "Discrepancy: agent reported success but verification failed"
                    );
                    format!("verification failed: {reason}")
                }
                _ => report.error_message(),
            };
            return self.record_step_error(ctx, step, kind, error, report.success);
        }

        if verdict == Verdict::NotApplicable {
            warn!(step = %step.id, command = %step.command, "Step completed unverified");
        }
        self.record(
            ctx,
            NewEvent::new(EventType::StepComplete, EventSource::Supervisor)
                .phase(&step.phase)
                .step(&step.id, step.index)
                .message(if report.summary.is_empty() {
                    format!("step {} completed", step.display_name())
                } else {
                    report.summary.clone()
                })
                .data(json!({ "verified": verdict.is_verified() })),
        )?;

        let post = self
            .run_hooks(ctx, LifecyclePoint::PostStep, Some(&step.phase), Some(&step.id))
            .await;
        if let HookStatus::BlockingFailure { hook, reason } = &post.status {
            // The step's outcome is not accepted until its post_step hooks pass
            machine.reject(FailureKind::HookBlocked)?;
            let error = format!("post_step hook '{hook}' failed: {reason}");
            return self.record_step_error(ctx, step, FailureKind::HookBlocked, error, true);
        }
        Ok(StepResult::Completed)
    }

    fn fail_step(
        &self,
        ctx: &mut RunContext<'_>,
        step: &StepDescriptor,
        machine: &mut StepMachine,
        kind: FailureKind,
        error: String,
    ) -> Result<StepResult, SupervisorError> {
        machine.fail(kind)?;
        self.record_step_error(ctx, step, kind, error, false)
    }

    fn record_step_error(
        &self,
        ctx: &mut RunContext<'_>,
        step: &StepDescriptor,
        kind: FailureKind,
        error: String,
        self_reported_success: bool,
    ) -> Result<StepResult, SupervisorError> {
        self.record(
            ctx,
            NewEvent::new(EventType::StepError, EventSource::Supervisor)
                .phase(&step.phase)
                .step(&step.id, step.index)
                .message(&error)
                .data(json!({
                    "kind": kind,
                    "self_reported_success": self_reported_success,
                    "resume": {
                        "run_id": ctx.run_id.to_string(),
                        "phase": step.phase,
                        "step_index": step.index,
                        "command": resume_command(&ctx.run_id, &step.phase, step.index),
                    },
                })),
        )?;
        Ok(StepResult::Failed(Failure {
            phase: step.phase.clone(),
            step: Some(step.id.clone()),
            step_index: step.index,
            error,
            kind,
            resource_type: Some(
                step.argument("resource_type")
                    .unwrap_or_else(|| step.command.clone()),
            ),
        }))
    }

    /// Agent-sequenced execution of every pending step in a phase
    async fn run_batch(
        &self,
        ctx: &mut RunContext<'_>,
        phase: &PhasePlan,
    ) -> Result<StepResult, SupervisorError> {
        let pending: Vec<&StepDescriptor> = phase
            .steps
            .iter()
            .filter(|s| !Self::is_done(ctx, s))
            .collect();
        if pending.is_empty() {
            return Ok(StepResult::Completed);
        }

        let mut machines = Vec::with_capacity(pending.len());
        for step in &pending {
            let mut machine = StepMachine::new();
            self.begin_step(ctx, step, &mut machine)?;
            machines.push(machine);
        }

        let mut requests = Vec::with_capacity(pending.len());
        for (step, machine) in pending.iter().zip(machines.iter_mut()) {
            let pre = self
                .run_hooks(ctx, LifecyclePoint::PreStep, Some(&step.phase), Some(&step.id))
                .await;
            if let HookStatus::BlockingFailure { hook, reason } = &pre.status {
                let error = format!("pre_step hook '{hook}' failed: {reason}");
                return self.fail_step(ctx, step, machine, FailureKind::HookBlocked, error);
            }
            requests.push(Self::request_for(ctx, step, pre.injected_context.as_deref()));
        }

        let budget = self
            .settings
            .step_timeout
            .saturating_mul(u32::try_from(pending.len()).unwrap_or(u32::MAX));
        let mut reports =
            match tokio::time::timeout(budget, self.agent.execute_batch(requests)).await {
                Err(_) => {
                    let error = format!("agent did not answer batch within {}s", budget.as_secs());
                    return self.fail_step(
                        ctx,
                        pending[0],
                        &mut machines[0],
                        FailureKind::Timeout,
                        error,
                    );
                }
                Ok(Err(e)) => {
                    return self.fail_step(
                        ctx,
                        pending[0],
                        &mut machines[0],
                        FailureKind::DelegationError,
                        e.to_string(),
                    );
                }
                Ok(Ok(reports)) => reports,
            };

        // Verified and logged in plan order, whatever order the agent used
        for (step, machine) in pending.iter().zip(machines.iter_mut()) {
            let Some(position) = reports.iter().position(|r| r.step_id == step.id) else {
                let error = format!("agent returned no report for step '{}'", step.id);
                return self.fail_step(ctx, step, machine, FailureKind::DelegationError, error);
            };
            let report = reports.remove(position);
            match self.settle(ctx, step, machine, report).await? {
                StepResult::Completed => {}
                other => return Ok(other),
            }
        }
        Ok(StepResult::Completed)
    }

    /// Record the run failure, consult the knowledge base and stop
    pub(super) async fn halt(
        &self,
        ctx: &mut RunContext<'_>,
        failure: Failure,
    ) -> Result<RunOutcome, SupervisorError> {
        let command = resume_command(&ctx.run_id, &failure.phase, failure.step_index);
        self.record(
            ctx,
            NewEvent::new(EventType::WorkflowError, EventSource::Supervisor)
                .phase(&failure.phase)
                .message(&failure.error)
                .data(json!({
                    "kind": failure.kind,
                    "step": failure.step,
                    "resume": {
                        "run_id": ctx.run_id.to_string(),
                        "phase": failure.phase,
                        "step_index": failure.step_index,
                        "command": command,
                    },
                })),
        )?;

        let (issue_id, suggestion) = self.consult_issues(&failure);
        if let Some(suggestion) = &suggestion {
            self.record(
                ctx,
                NewEvent::new(EventType::DecisionPoint, EventSource::IssueEngine)
                    .phase(&failure.phase)
                    .message(format!("suggested fix: {}", suggestion.solution.description))
                    .data(json!({
                        "issue_id": suggestion.issue_id,
                        "solution_id": suggestion.solution.solution_id,
                        "rank": suggestion.rank,
                    })),
            )?;
        }

        let on_error = self
            .run_hooks(
                ctx,
                LifecyclePoint::OnError,
                Some(&failure.phase),
                failure.step.as_deref(),
            )
            .await;
        if !on_error.is_ok() {
            warn!(run_id = %ctx.run_id, "on_error hooks failed");
        }

        error!(
            run_id = %ctx.run_id,
            phase = %failure.phase,
            step = ?failure.step,
            kind = %failure.kind,
            error = %failure.error,
            resume = %command,
            "Run halted"
        );
        Ok(RunOutcome::Halted(Box::new(RunHalt {
            run_id: ctx.run_id.clone(),
            phase: failure.phase,
            step: failure.step,
            step_index: failure.step_index,
            error: failure.error,
            kind: failure.kind,
            resume_command: command,
            issue_id,
            suggestion,
        })))
    }

    /// Knowledge base lookups are advisory; their errors never stop a halt
    fn consult_issues(&self, failure: &Failure) -> (Option<String>, Option<Suggestion>) {
        let Some(engine) = &self.issues else {
            return (None, None);
        };
        let mut query =
            IssueQuery::new(&failure.error).with_environment(&self.settings.environment);
        if let Some(resource_type) = &failure.resource_type {
            query = query.with_resource_type(resource_type);
        }

        let issue_id = match engine.record_error(&query) {
            Ok(issue) => Some(issue.issue_id),
            Err(e) => {
                warn!(error = %e, "Could not record error in knowledge base");
                None
            }
        };
        let suggestion = match engine.search(&query) {
            Ok(result) => result.top,
            Err(e) => {
                warn!(error = %e, "Could not search knowledge base");
                None
            }
        };
        (issue_id, suggestion)
    }
}
