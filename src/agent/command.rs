//! Agent backed by an external command.
//!
//! The request is written to the command's stdin as JSON. The command
//! answers with JSON report lines on stdout; anything else it prints is
//! treated as noise.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{AgentError, ExecutionAgent, SelfReport, StepRequest};

#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn invoke(&self, payload: Vec<u8>, step: &str) -> Result<Output, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("RUNWARDEN_STEP", step)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {e}", self.program)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // An agent may exit without reading its input
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Agent closed stdin early");
            }
            drop(stdin);
        }
        Ok(child.wait_with_output().await?)
    }
}

/// All report lines on stdout, in order
fn parse_reports(stdout: &str) -> Vec<SelfReport> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<SelfReport>(line).ok())
        .collect()
}

fn exit_error(output: &Output) -> AgentError {
    AgentError::Exit {
        code: output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| format!("exit code {c}")),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

#[async_trait]
impl ExecutionAgent for CommandAgent {
    fn name(&self) -> &str {
        &self.program
    }

    #[instrument(skip(self, request), fields(agent = %self.program, step = %request.step.id))]
    async fn execute(&self, request: StepRequest) -> Result<SelfReport, AgentError> {
        let payload =
            serde_json::to_vec(&request).map_err(|e| AgentError::InvalidReport(e.to_string()))?;
        let output = self.invoke(payload, &request.step.id).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // Last report line wins
        match parse_reports(&stdout).pop() {
            Some(report) => {
                if !output.status.success() {
                    warn!(status = ?output.status.code(), "Agent exited non-zero but left a report");
                }
                Ok(report)
            }
            None if !output.status.success() => Err(exit_error(&output)),
            None => Err(AgentError::InvalidReport(format!(
                "no JSON report on stdout for step {}",
                request.step.id
            ))),
        }
    }

    #[instrument(skip(self, requests), fields(agent = %self.program, count = requests.len()))]
    async fn execute_batch(
        &self,
        requests: Vec<StepRequest>,
    ) -> Result<Vec<SelfReport>, AgentError> {
        let label = requests
            .iter()
            .map(|r| r.step.id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let payload =
            serde_json::to_vec(&requests).map_err(|e| AgentError::InvalidReport(e.to_string()))?;
        let output = self.invoke(payload, &label).await?;
        let reports = parse_reports(&String::from_utf8_lossy(&output.stdout));
        if reports.is_empty() && !output.status.success() {
            return Err(exit_error(&output));
        }
        Ok(reports)
    }
}
