//! Knowledge base storage with per-issue compare-and-swap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::debug;

use super::model::{Issue, Statistics};
use super::KnowledgeError;
use crate::ledger::{write_json_atomic, FileLock};

const DOCUMENT_VERSION: &str = "1.0";

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq)]
pub enum CasResult {
    /// Stored with its new revision
    Swapped(Issue),
    /// The stored revision was not the expected one
    Conflict,
}

/// Issue storage keyed by content-addressed id.
///
/// `compare_and_swap` with `expected = None` only succeeds when the issue
/// does not exist yet; otherwise the stored revision must equal `expected`.
pub trait KnowledgeStore: Send + Sync {
    fn get(&self, issue_id: &str) -> Result<Option<Issue>, KnowledgeError>;

    fn list(&self) -> Result<Vec<Issue>, KnowledgeError>;

    fn compare_and_swap(
        &self,
        expected: Option<u64>,
        issue: Issue,
    ) -> Result<CasResult, KnowledgeError>;
}

fn swap_into(
    issues: &mut BTreeMap<String, Issue>,
    expected: Option<u64>,
    mut issue: Issue,
) -> CasResult {
    let current = issues.get(&issue.issue_id).map(|i| i.revision);
    if current != expected {
        debug!(issue_id = %issue.issue_id, ?current, ?expected, "Knowledge base CAS conflict");
        return CasResult::Conflict;
    }
    issue.revision = expected.map_or(1, |r| r + 1);
    issues.insert(issue.issue_id.clone(), issue.clone());
    CasResult::Swapped(issue)
}

/// In-memory store, for tests and short-lived processes
#[derive(Debug, Default)]
pub struct MemoryKnowledgeStore {
    issues: RwLock<BTreeMap<String, Issue>>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KnowledgeStore for MemoryKnowledgeStore {
    fn get(&self, issue_id: &str) -> Result<Option<Issue>, KnowledgeError> {
        let issues = self.issues.read().map_err(|_| KnowledgeError::LockPoisoned)?;
        Ok(issues.get(issue_id).cloned())
    }

    fn list(&self) -> Result<Vec<Issue>, KnowledgeError> {
        let issues = self.issues.read().map_err(|_| KnowledgeError::LockPoisoned)?;
        Ok(issues.values().cloned().collect())
    }

    fn compare_and_swap(
        &self,
        expected: Option<u64>,
        issue: Issue,
    ) -> Result<CasResult, KnowledgeError> {
        let mut issues = self.issues.write().map_err(|_| KnowledgeError::LockPoisoned)?;
        Ok(swap_into(&mut issues, expected, issue))
    }
}

/// On-disk knowledge base document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub version: String,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub statistics: Statistics,
}

impl KnowledgeDocument {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: DOCUMENT_VERSION.to_string(),
            created: now,
            last_updated: now,
            issues: Vec::new(),
            statistics: Statistics::default(),
        }
    }
}

/// Single JSON document, rewritten atomically on every successful swap.
///
/// Swaps hold an advisory lock on `.<name>.lock` beside the document, so
/// several `runwarden` processes can share one knowledge base.
#[derive(Debug)]
pub struct FileKnowledgeStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileKnowledgeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.path.with_file_name(format!(".{name}.lock"))
    }

    fn ensure_parent(&self) -> Result<(), KnowledgeError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| KnowledgeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<FileLock, KnowledgeError> {
        self.ensure_parent()?;
        let path = self.lock_path();
        FileLock::acquire(&path).map_err(|source| KnowledgeError::Io { path, source })
    }

    /// Read the whole document; a missing file is an empty knowledge base
    pub fn load(&self) -> Result<KnowledgeDocument, KnowledgeError> {
        if !self.path.exists() {
            return Ok(KnowledgeDocument::empty());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|source| {
            KnowledgeError::Io {
                path: self.path.clone(),
                source,
            }
        })?;
        serde_json::from_str(&contents).map_err(|source| KnowledgeError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, mut document: KnowledgeDocument) -> Result<(), KnowledgeError> {
        self.ensure_parent()?;
        document.last_updated = Utc::now();
        document.statistics = Statistics::compute(&document.issues);
        write_json_atomic(&self.path, &document)?;
        Ok(())
    }
}

impl KnowledgeStore for FileKnowledgeStore {
    fn get(&self, issue_id: &str) -> Result<Option<Issue>, KnowledgeError> {
        let _guard = self.guard.lock().map_err(|_| KnowledgeError::LockPoisoned)?;
        Ok(self
            .load()?
            .issues
            .into_iter()
            .find(|i| i.issue_id == issue_id))
    }

    fn list(&self) -> Result<Vec<Issue>, KnowledgeError> {
        let _guard = self.guard.lock().map_err(|_| KnowledgeError::LockPoisoned)?;
        Ok(self.load()?.issues)
    }

    fn compare_and_swap(
        &self,
        expected: Option<u64>,
        issue: Issue,
    ) -> Result<CasResult, KnowledgeError> {
        let _guard = self.guard.lock().map_err(|_| KnowledgeError::LockPoisoned)?;
        // Held from load to save so no other process swaps in between
        let _file_lock = self.lock()?;
        let mut document = self.load()?;
        let mut issues: BTreeMap<String, Issue> = document
            .issues
            .drain(..)
            .map(|i| (i.issue_id.clone(), i))
            .collect();

        let result = swap_into(&mut issues, expected, issue);
        if matches!(result, CasResult::Swapped(_)) {
            document.issues = issues.into_values().collect();
            self.save(document)?;
        }
        Ok(result)
    }
}
