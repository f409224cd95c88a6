//! Named external capabilities that hooks can delegate to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("unknown capability: {0}")]
    Unknown(String),
    #[error("capability {name} failed: {message}")]
    Failed { name: String, message: String },
}

/// What a capability is handed when invoked
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityInput {
    /// Lifecycle context (run id, phase, step, environment)
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// An external capability, e.g. a linter service or a notification sink
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, input: &CapabilityInput) -> Result<CapabilityOutput, CapabilityError>;
}

/// Capability served by an external program.
///
/// The input is written to stdin as JSON; the last JSON line on stdout is
/// the output. A program that prints no JSON succeeds or fails by exit code.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandCapability {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn failed(&self, message: impl Into<String>) -> CapabilityError {
        CapabilityError::Failed {
            name: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Capability for CommandCapability {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, input), fields(capability = %self.name))]
    async fn invoke(&self, input: &CapabilityInput) -> Result<CapabilityOutput, CapabilityError> {
        let payload = serde_json::to_vec(input).map_err(|e| self.failed(e.to_string()))?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.failed(format!("{}: {e}", self.program)))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Capability closed stdin early");
            }
            drop(stdin);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.failed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reported = stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| serde_json::from_str::<CapabilityOutput>(line).ok())
            .next_back();
        if let Some(out) = reported {
            return Ok(out);
        }
        if output.status.success() {
            return Ok(CapabilityOutput {
                success: true,
                message: stdout.trim().to_string(),
            });
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| format!("exit {c}"));
        Err(self.failed(if stderr.is_empty() {
            code
        } else {
            format!("{code}: {stderr}")
        }))
    }
}

/// Capabilities by name
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub async fn invoke(
        &self,
        name: &str,
        input: &CapabilityInput,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let capability = self
            .get(name)
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;
        capability.invoke(input).await
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .finish()
    }
}
