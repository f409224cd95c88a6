//! Issue resolution knowledge base.
//!
//! Errors are normalized and fingerprinted into [`Issue`]s; documented
//! [`Solution`]s are ranked by match score and track record. The engine only
//! proposes fixes; applying one goes through the supervisor like any other
//! step.

mod engine;
mod model;
mod normalize;
mod store;

use std::path::PathBuf;
use thiserror::Error;

use crate::ledger::LedgerError;

pub use engine::{IssueEngine, IssueQuery, NewSolution, SearchResult, Suggestion};
pub use model::{
    Automation, CategoryCount, ErrorDescriptor, Issue, Solution, Statistics, SuccessRate,
};
pub use normalize::{categorize, issue_id, normalize, solution_id, ErrorCategory};
pub use store::{
    CasResult, FileKnowledgeStore, KnowledgeDocument, KnowledgeStore, MemoryKnowledgeStore,
};

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed knowledge base at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Storage(#[from] LedgerError),
    #[error("issue {0} not found")]
    IssueNotFound(String),
    #[error("solution {solution_id} not found on issue {issue_id}")]
    SolutionNotFound {
        issue_id: String,
        solution_id: String,
    },
    #[error("solution {0} has no automation descriptor")]
    NotAutomatable(String),
    #[error("gave up updating issue {issue_id} after {attempts} conflicting writes")]
    Contention { issue_id: String, attempts: usize },
    #[error("knowledge base lock poisoned")]
    LockPoisoned,
}
