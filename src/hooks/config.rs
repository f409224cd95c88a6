//! Hook declarations and their normalization.
//!
//! Configuration may mix bare legacy command strings with typed objects.
//! Everything is converted to [`Hook`] once, at load time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::HookError;

/// Points in the run lifecycle where hooks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePoint {
    PreRun,
    PostRun,
    PrePhase,
    PostPhase,
    PreStep,
    PostStep,
    OnError,
}

impl LifecyclePoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreRun => "pre_run",
            Self::PostRun => "post_run",
            Self::PrePhase => "pre_phase",
            Self::PostPhase => "post_phase",
            Self::PreStep => "pre_step",
            Self::PostStep => "post_step",
            Self::OnError => "on_error",
        }
    }
}

impl fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecyclePoint {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .flat_map(|c| {
                if c.is_ascii_uppercase() {
                    vec!['_', c.to_ascii_lowercase()]
                } else if c == '-' {
                    vec!['_']
                } else {
                    vec![c]
                }
            })
            .collect();
        match normalized.trim_start_matches('_') {
            "pre_run" => Ok(Self::PreRun),
            "post_run" => Ok(Self::PostRun),
            "pre_phase" => Ok(Self::PrePhase),
            "post_phase" => Ok(Self::PostPhase),
            "pre_step" => Ok(Self::PreStep),
            "post_step" => Ok(Self::PostStep),
            "on_error" => Ok(Self::OnError),
            _ => Err(HookError::InvalidDeclaration(format!(
                "unknown lifecycle point '{s}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Stop,
    Warn,
}

/// What a hook does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// External command run through the shell
    Script { command: String },
    /// Delegation to a named capability
    Capability {
        capability: String,
        parameters: serde_json::Value,
    },
    /// Document references folded into the next phase's context
    ContextInjection {
        prompt: String,
        documents: Vec<String>,
    },
}

impl HookAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Script { .. } => "script",
            Self::Capability { .. } => "capability",
            Self::ContextInjection { .. } => "context-injection",
        }
    }
}

/// A normalized hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub name: String,
    pub action: HookAction,
    pub required: bool,
    pub timeout: Duration,
    /// Empty means every environment
    pub environments: Vec<String>,
    pub failure_mode: FailureMode,
}

impl Hook {
    pub fn script(name: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            action: HookAction::Script {
                command: command.into(),
            },
            required: true,
            timeout,
            environments: Vec::new(),
            failure_mode: FailureMode::Stop,
        }
    }

    /// Failures of this hook halt the enclosing operation
    pub fn is_blocking(&self) -> bool {
        self.required && self.failure_mode == FailureMode::Stop
    }

    pub fn applies_to(&self, environment: &str) -> bool {
        self.environments.is_empty() || self.environments.iter().any(|e| e == environment)
    }
}

/// A hook entry as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawHook {
    Legacy(String),
    Typed(TypedHook),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RawHookKind {
    Script,
    Capability,
    #[serde(alias = "context_injection", alias = "context")]
    ContextInjection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedHook {
    #[serde(rename = "type")]
    pub kind: RawHookKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "command")]
    pub path: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub required: Option<bool>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default, alias = "failure_mode")]
    pub failure_mode: Option<FailureMode>,
}

impl RawHook {
    /// Convert to a [`Hook`]. `position` names anonymous hooks.
    pub fn normalize(
        self,
        point: LifecyclePoint,
        position: usize,
        default_timeout: Duration,
    ) -> Result<Hook, HookError> {
        let fallback_name = || format!("{point}-{}", position + 1);
        match self {
            RawHook::Legacy(command) => {
                if command.trim().is_empty() {
                    return Err(HookError::InvalidDeclaration(format!(
                        "{point} hook {} is an empty command",
                        position + 1
                    )));
                }
                Ok(Hook::script(fallback_name(), command, default_timeout))
            }
            RawHook::Typed(typed) => {
                let name = typed.name.clone().unwrap_or_else(fallback_name);
                let action = match typed.kind {
                    RawHookKind::Script => HookAction::Script {
                        command: typed.path.clone().ok_or_else(|| {
                            HookError::InvalidDeclaration(format!(
                                "script hook '{name}' has no path"
                            ))
                        })?,
                    },
                    RawHookKind::Capability => HookAction::Capability {
                        capability: typed
                            .capability
                            .clone()
                            .or_else(|| typed.name.clone())
                            .ok_or_else(|| {
                                HookError::InvalidDeclaration(
                                    "capability hook without a capability name".to_string(),
                                )
                            })?,
                        parameters: typed.parameters.clone().unwrap_or(serde_json::Value::Null),
                    },
                    RawHookKind::ContextInjection => {
                        let prompt = typed.prompt.clone().unwrap_or_default();
                        let documents: Vec<String> = typed.path.clone().into_iter().collect();
                        if prompt.is_empty() && documents.is_empty() {
                            return Err(HookError::InvalidDeclaration(format!(
                                "context-injection hook '{name}' has neither prompt nor path"
                            )));
                        }
                        HookAction::ContextInjection { prompt, documents }
                    }
                };
                Ok(Hook {
                    name,
                    action,
                    required: typed.required.unwrap_or(true),
                    timeout: typed
                        .timeout
                        .map(Duration::from_secs)
                        .unwrap_or(default_timeout),
                    environments: typed.environments,
                    failure_mode: typed.failure_mode.unwrap_or_default(),
                })
            }
        }
    }
}

/// Normalized hooks keyed by lifecycle point, in declared order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HooksConfig {
    hooks: BTreeMap<LifecyclePoint, Vec<Hook>>,
}

impl HooksConfig {
    pub fn from_raw(
        raw: BTreeMap<String, Vec<RawHook>>,
        default_timeout: Duration,
    ) -> Result<Self, HookError> {
        let mut hooks = BTreeMap::new();
        for (key, entries) in raw {
            let point: LifecyclePoint = key.parse()?;
            let normalized = entries
                .into_iter()
                .enumerate()
                .map(|(i, raw)| raw.normalize(point, i, default_timeout))
                .collect::<Result<Vec<_>, _>>()?;
            hooks.insert(point, normalized);
        }
        Ok(Self { hooks })
    }

    /// Load from a JSON or YAML document shaped `{point: [hook, ...]}`
    pub fn load(path: &Path, default_timeout: Duration) -> Result<Self, HookError> {
        let contents = std::fs::read_to_string(path)?;
        let raw: BTreeMap<String, Vec<RawHook>> =
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                serde_json::from_str(&contents)?
            } else {
                serde_yaml::from_str(&contents)
                    .map_err(|e| HookError::InvalidDeclaration(e.to_string()))?
            };
        Self::from_raw(raw, default_timeout)
    }

    pub fn with_hooks(mut self, point: LifecyclePoint, hooks: Vec<Hook>) -> Self {
        self.hooks.insert(point, hooks);
        self
    }

    /// Points declared in `other` replace the same points here
    pub fn merge(mut self, other: HooksConfig) -> Self {
        self.hooks.extend(other.hooks);
        self
    }

    pub fn get(&self, point: LifecyclePoint) -> &[Hook] {
        self.hooks.get(&point).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }

    /// Every hook with its lifecycle point
    pub fn iter(&self) -> impl Iterator<Item = (LifecyclePoint, &Hook)> {
        self.hooks
            .iter()
            .flat_map(|(point, hooks)| hooks.iter().map(move |h| (*point, h)))
    }
}
