//! Run identity and immutable run metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::git::GitCli;

/// Hierarchical run identifier: `{organization}/{project}/{unique-id}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId {
    organization: String,
    project: String,
    unique: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid run id '{0}': expected organization/project/unique-id")]
pub struct InvalidRunId(pub String);

impl RunId {
    pub fn new(organization: &str, project: &str, unique: &str) -> Result<Self, InvalidRunId> {
        let raw = format!("{organization}/{project}/{unique}");
        if [organization, project, unique]
            .iter()
            .all(|segment| is_safe_segment(segment))
        {
            Ok(Self {
                organization: organization.to_string(),
                project: project.to_string(),
                unique: unique.to_string(),
            })
        } else {
            Err(InvalidRunId(raw))
        }
    }

    /// Generate a fresh id for the given organization and project.
    ///
    /// The unique part is `YYYYMMDD-HHMMSS-<8 hex>` so ids sort by creation time.
    pub fn generate(organization: &str, project: &str) -> Result<Self, InvalidRunId> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let short = Uuid::new_v4().simple().to_string();
        Self::new(
            &sanitize_segment(organization),
            &sanitize_segment(project),
            &format!("{stamp}-{}", &short[..8]),
        )
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn unique(&self) -> &str {
        &self.unique
    }

    /// Relative directory for this run under a ledger root
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.organization)
            .join(&self.project)
            .join(&self.unique)
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "local".to_string()
    } else {
        cleaned
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.project, self.unique)
    }
}

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [org, project, unique] => Self::new(org, project, unique),
            _ => Err(InvalidRunId(s.to_string())),
        }
    }
}

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.to_string()
    }
}

/// Organization and project derived from a git remote, or the local
/// directory name when there is no usable remote.
pub async fn derive_scope(repo_path: &Path) -> (String, String) {
    if let Ok(url) = GitCli::get_remote_url(repo_path).await {
        if let Some((owner, repo)) = parse_remote_url(&url) {
            return (owner, repo);
        }
    }

    let project = repo_path
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "workspace".to_string());
    ("local".to_string(), sanitize_segment(&project))
}

/// Parse `owner/repo` out of an https or ssh git remote URL
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    let trimmed = url.trim().trim_end_matches('/').trim_end_matches(".git");
    let path = if let Some(rest) = trimmed.split_once("://").map(|(_, r)| r) {
        rest.split_once('/').map(|(_, p)| p)?
    } else if let Some((_, p)) = trimmed.split_once(':') {
        p
    } else {
        return None;
    };

    let mut segments = path.rsplit('/');
    let repo = segments.next()?;
    let owner = segments.next()?;
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((sanitize_segment(owner), sanitize_segment(repo)))
}

/// Lineage link between a rerun and the run it was derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent: RunId,
    pub root: RunId,
    pub generation: u32,
}

/// Written once at run creation, never modified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub work_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub autonomy_level: AutonomyLevel,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Path of the plan file the run was started from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<PathBuf>,
}

/// How much the agent is trusted to act without a human in the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Human approves at decision points
    #[default]
    Supervised,
    /// Agent runs steps back to back
    Autonomous,
}
