//! Per-step state machine.
//!
//! Every step the supervisor runs goes through a fresh [`StepMachine`]; the
//! only way to `Completed` is a successful report that ground truth does not
//! contradict.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::agent::SelfReport;
use crate::verify::Verdict;

/// Why a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The agent said it failed
    AgentReported,
    /// The agent said it succeeded but the verifier disagreed
    VerificationVeto,
    /// The agent could not be reached or answered garbage
    DelegationError,
    Timeout,
    /// A blocking hook at the step boundary failed
    HookBlocked,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentReported => "agent_reported",
            Self::VerificationVeto => "verification_veto",
            Self::DelegationError => "delegation_error",
            Self::Timeout => "timeout",
            Self::HookBlocked => "hook_blocked",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    InProgress,
    Completed,
    Failed(FailureKind),
}

impl StepState {
    fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} a step that is {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub action: &'static str,
}

#[derive(Debug, Clone)]
pub struct StepMachine {
    state: StepState,
}

impl Default for StepMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StepMachine {
    pub fn new() -> Self {
        Self {
            state: StepState::NotStarted,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    fn require(&self, expected: StepState, action: &'static str) -> Result<(), TransitionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.state.name(),
                action,
            })
        }
    }

    pub fn start(&mut self) -> Result<StepState, TransitionError> {
        self.require(StepState::NotStarted, "start")?;
        self.state = StepState::InProgress;
        Ok(self.state)
    }

    /// Settle a running step from the agent's report and the verdict
    pub fn complete(
        &mut self,
        report: &SelfReport,
        verdict: &Verdict,
    ) -> Result<StepState, TransitionError> {
        self.require(StepState::InProgress, "complete")?;
        self.state = if !report.success {
            StepState::Failed(FailureKind::AgentReported)
        } else if !verdict.allows_completion() {
            StepState::Failed(FailureKind::VerificationVeto)
        } else {
            StepState::Completed
        };
        Ok(self.state)
    }

    pub fn fail(&mut self, kind: FailureKind) -> Result<StepState, TransitionError> {
        self.require(StepState::InProgress, "fail")?;
        self.state = StepState::Failed(kind);
        Ok(self.state)
    }

    /// Withdraw a completion that a post-step check refused
    pub fn reject(&mut self, kind: FailureKind) -> Result<StepState, TransitionError> {
        self.require(StepState::Completed, "reject")?;
        self.state = StepState::Failed(kind);
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> StepMachine {
        let mut machine = StepMachine::new();
        machine.start().unwrap();
        machine
    }

    #[test]
    fn test_success_with_pass_completes() {
        let mut m = running();
        let state = m.complete(&SelfReport::success("a", "ok"), &Verdict::Pass).unwrap();
        assert_eq!(state, StepState::Completed);
    }

    #[test]
    fn test_unverifiable_success_completes() {
        let mut m = running();
        let state = m
            .complete(&SelfReport::success("a", "ok"), &Verdict::NotApplicable)
            .unwrap();
        assert_eq!(state, StepState::Completed);
    }

    #[test]
    fn test_verifier_vetoes_claimed_success() {
        let mut m = running();
        let state = m
            .complete(
                &SelfReport::success("a", "pushed"),
                &Verdict::Fail("remote head differs".to_string()),
            )
            .unwrap();
        assert_eq!(state, StepState::Failed(FailureKind::VerificationVeto));
    }

    #[test]
    fn test_reported_failure_wins_over_verdict() {
        let mut m = running();
        let state = m
            .complete(&SelfReport::failure("a", "boom"), &Verdict::Pass)
            .unwrap();
        assert_eq!(state, StepState::Failed(FailureKind::AgentReported));
    }

    #[test]
    fn test_illegal_transitions() {
        let mut m = StepMachine::new();
        assert!(m.complete(&SelfReport::success("a", ""), &Verdict::Pass).is_err());
        assert!(m.fail(FailureKind::Timeout).is_err());

        m.start().unwrap();
        let err = m.start().unwrap_err();
        assert_eq!(err.from, "in_progress");

        m.fail(FailureKind::Timeout).unwrap();
        assert_eq!(m.state(), StepState::Failed(FailureKind::Timeout));
        assert!(m.fail(FailureKind::DelegationError).is_err());
        assert!(m.start().is_err());
        assert!(m.reject(FailureKind::HookBlocked).is_err());
    }

    #[test]
    fn test_completed_step_can_be_rejected() {
        let mut m = running();
        assert!(m.reject(FailureKind::HookBlocked).is_err());

        m.complete(&SelfReport::success("a", "ok"), &Verdict::Pass).unwrap();
        let state = m.reject(FailureKind::HookBlocked).unwrap();
        assert_eq!(state, StepState::Failed(FailureKind::HookBlocked));
        assert!(m.reject(FailureKind::HookBlocked).is_err());
    }
}
