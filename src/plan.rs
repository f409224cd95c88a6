//! Static step plans supplied by the surrounding tool.
//!
//! A plan is an ordered list of phases, each an ordered list of step
//! descriptors. The supervisor only ever reads it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Phase name reserved for remediation steps proposed by the issue engine
pub const REMEDIATION_PHASE: &str = "remediation";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan: {0}")]
    Parse(String),
    #[error("invalid plan: {0}")]
    Invalid(String),
}

/// Read-only description of one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Command or capability the agent should carry out
    pub command: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
    /// Owning phase, filled in when the plan is loaded
    #[serde(default)]
    pub phase: String,
    /// 1-based position within the phase, filled in when the plan is loaded
    #[serde(default)]
    pub index: usize,
}

impl StepDescriptor {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// String form of an argument; numbers and booleans are stringified
    pub fn argument(&self, key: &str) -> Option<String> {
        match self.arguments.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub phases: Vec<PhasePlan>,
}

impl Plan {
    /// Load a plan from a `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let contents = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    pub fn from_json_str(contents: &str) -> Result<Self, PlanError> {
        let plan: Plan =
            serde_json::from_str(contents).map_err(|e| PlanError::Parse(e.to_string()))?;
        plan.normalized()
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, PlanError> {
        let plan: Plan =
            serde_yaml::from_str(contents).map_err(|e| PlanError::Parse(e.to_string()))?;
        plan.normalized()
    }

    /// Fill in phase and index on every step, then validate
    pub fn normalized(mut self) -> Result<Self, PlanError> {
        for phase in &mut self.phases {
            for (i, step) in phase.steps.iter_mut().enumerate() {
                step.phase = phase.name.clone();
                step.index = i + 1;
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.workflow_id.trim().is_empty() {
            return Err(PlanError::Invalid("workflow_id is empty".to_string()));
        }
        if self.phases.is_empty() {
            return Err(PlanError::Invalid("plan has no phases".to_string()));
        }

        let mut phase_names = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(PlanError::Invalid("phase with empty name".to_string()));
            }
            if phase.name == REMEDIATION_PHASE {
                return Err(PlanError::Invalid(format!(
                    "phase name '{REMEDIATION_PHASE}' is reserved"
                )));
            }
            if !phase_names.insert(phase.name.as_str()) {
                return Err(PlanError::Invalid(format!(
                    "duplicate phase '{}'",
                    phase.name
                )));
            }

            let mut step_ids = HashSet::new();
            for step in &phase.steps {
                if step.id.trim().is_empty() || step.command.trim().is_empty() {
                    return Err(PlanError::Invalid(format!(
                        "step in phase '{}' is missing an id or command",
                        phase.name
                    )));
                }
                if step.id.contains('/') {
                    return Err(PlanError::Invalid(format!(
                        "step id '{}' may not contain '/'",
                        step.id
                    )));
                }
                if !step_ids.insert(step.id.as_str()) {
                    return Err(PlanError::Invalid(format!(
                        "duplicate step '{}' in phase '{}'",
                        step.id, phase.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Step at a 1-based index within a phase
    pub fn step_at(&self, phase: &str, index: usize) -> Option<&StepDescriptor> {
        let phase = self.phase(phase)?;
        index.checked_sub(1).and_then(|i| phase.steps.get(i))
    }

    /// Steps in plan order
    pub fn steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }
}
