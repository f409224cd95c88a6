//! Git CLI wrapper for read-only repository queries.
//!
//! Uses the git CLI directly (rather than libgit2) so the answers match what
//! the execution agent sees when it shells out to git itself.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Low-level git command wrapper
pub struct GitCli;

impl GitCli {
    /// Execute a git command and return stdout
    async fn run_git(args: &[&str], cwd: &Path) -> Result<String> {
        debug!(?args, ?cwd, "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute git command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Get the URL of a named remote
    #[instrument(skip_all, fields(path = %path.display(), remote))]
    pub async fn remote_url(path: &Path, remote: &str) -> Result<String> {
        Self::run_git(&["remote", "get-url", remote], path).await
    }

    /// Get the remote URL for origin
    pub async fn get_remote_url(path: &Path) -> Result<String> {
        Self::remote_url(path, "origin").await
    }

    /// Resolve a revision to a commit SHA
    #[instrument(skip_all, fields(path = %path.display(), rev))]
    pub async fn rev_parse(path: &Path, rev: &str) -> Result<String> {
        Self::run_git(&["rev-parse", "--verify", rev], path).await
    }

    /// Commit SHA of a branch on the remote, or None if the branch is absent.
    ///
    /// Asks the remote directly rather than trusting remote-tracking refs,
    /// which may be stale.
    #[instrument(skip_all, fields(path = %path.display(), remote, branch))]
    pub async fn remote_head(path: &Path, remote: &str, branch: &str) -> Result<Option<String>> {
        let refname = format!("refs/heads/{branch}");
        let output = Self::run_git(&["ls-remote", remote, &refname], path).await?;
        Ok(parse_ls_remote(&output, &refname))
    }

    /// Check if a branch exists on remote
    pub async fn remote_branch_exists(path: &Path, remote: &str, branch: &str) -> Result<bool> {
        Ok(Self::remote_head(path, remote, branch).await?.is_some())
    }
}

/// Find the SHA for an exact ref in `git ls-remote` output
fn parse_ls_remote(output: &str, refname: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let sha = parts.next()?;
        let name = parts.next()?;
        (name == refname).then(|| sha.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo() -> Option<TempDir> {
        let dir = TempDir::new().unwrap();
        let ok = Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir.path())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        ok.then_some(dir)
    }

    #[test]
    fn test_parse_ls_remote_exact_match() {
        let output = "abc123\trefs/heads/main\ndef456\trefs/heads/main-old\n";
        assert_eq!(
            parse_ls_remote(output, "refs/heads/main"),
            Some("abc123".to_string())
        );
        assert_eq!(parse_ls_remote(output, "refs/heads/dev"), None);
    }

    #[tokio::test]
    async fn test_missing_remote_is_an_error() {
        let Some(repo) = init_repo().await else {
            eprintln!("Skipping test: git not available");
            return;
        };
        assert!(GitCli::get_remote_url(repo.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_url_reads_configured_origin() {
        let Some(repo) = init_repo().await else {
            eprintln!("Skipping test: git not available");
            return;
        };
        Command::new("git")
            .args(["remote", "add", "origin", "https://github.com/acme/widgets.git"])
            .current_dir(repo.path())
            .status()
            .await
            .unwrap();
        let url = GitCli::get_remote_url(repo.path()).await.unwrap();
        assert_eq!(url, "https://github.com/acme/widgets.git");
    }
}
