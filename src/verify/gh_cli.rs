//! GitHub CLI (`gh`) wrapper for read-only ground-truth queries.
//!
//! Uses the `gh` CLI (https://cli.github.com) so authentication is handled by
//! `gh auth login` rather than tokens in configuration.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::record::RequestState;

/// GitHub CLI wrapper
pub struct GhCli;

impl GhCli {
    /// Execute a gh command and return stdout
    async fn run_gh(args: &[&str], cwd: Option<&Path>) -> Result<String> {
        debug!(?args, "Running gh command");

        let mut cmd = Command::new("gh");
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.context("Failed to execute gh command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "gh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether a repository exists and is visible to the authenticated user
    #[instrument(skip(cwd))]
    pub async fn repo_exists(repo: &str, cwd: &Path) -> Result<bool> {
        match Self::run_gh(&["repo", "view", repo, "--json", "name"], Some(cwd)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// State of a pull request
    #[instrument(skip(cwd))]
    pub async fn pr_state(repo: Option<&str>, number: u64, cwd: &Path) -> Result<RequestState> {
        let num = number.to_string();
        let mut args = vec!["pr", "view", num.as_str(), "--json", "number,state"];
        if let Some(repo) = repo {
            args.push("--repo");
            args.push(repo);
        }

        let output = match Self::run_gh(&args, Some(cwd)).await {
            Ok(output) => output,
            Err(e) if is_not_found(&e) => return Ok(RequestState::Missing),
            Err(e) => return Err(e),
        };
        let response: GhStateResponse =
            serde_json::from_str(&output).context("Failed to parse PR view response")?;
        Ok(RequestState::from_gh(&response.state))
    }

    /// Whether an issue exists (open or closed)
    #[instrument(skip(cwd))]
    pub async fn issue_exists(repo: Option<&str>, number: u64, cwd: &Path) -> Result<bool> {
        let num = number.to_string();
        let mut args = vec!["issue", "view", num.as_str(), "--json", "number,state"];
        if let Some(repo) = repo {
            args.push("--repo");
            args.push(repo);
        }

        match Self::run_gh(&args, Some(cwd)).await {
            Ok(output) => {
                let response: GhStateResponse = serde_json::from_str(&output)
                    .context("Failed to parse issue view response")?;
                Ok(response.number == number)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("could not resolve")
        || msg.contains("not found")
        || msg.contains("no pull requests found")
}

#[derive(Debug, Deserialize)]
struct GhStateResponse {
    number: u64,
    state: String,
}
