use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::model::{Automation, ErrorDescriptor, Issue, Solution, Statistics, SuccessRate};
use super::normalize::{categorize, issue_id, normalize, solution_id};
use super::store::{CasResult, KnowledgeStore};
use super::KnowledgeError;
use crate::plan::{StepDescriptor, REMEDIATION_PHASE};

/// Optimistic update attempts before giving up
const MAX_CAS_ATTEMPTS: usize = 32;

const EXACT_MATCH_SCORE: u32 = 10;
const CODE_MATCH_SCORE: u32 = 5;
const RESOURCE_MATCH_SCORE: u32 = 3;
const ENVIRONMENT_MATCH_SCORE: u32 = 2;
const CATEGORY_MATCH_SCORE: u32 = 1;

/// An error to look up or record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueQuery {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

impl IssueQuery {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            message: self.message.clone(),
            normalized: normalize(&self.message),
            code: self.code.clone(),
            resource_type: self.resource_type.clone().unwrap_or_default(),
            environment: self.environment.clone(),
            category: categorize(&self.message),
        }
    }
}

/// A documented remediation to attach to an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSolution {
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub remediation_steps: Vec<String>,
    #[serde(default)]
    pub automation: Option<Automation>,
}

/// A ranked candidate solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub issue_id: String,
    pub solution: Solution,
    pub score: u32,
    /// `score + percentage / 100`
    pub rank: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub top: Option<Suggestion>,
    pub alternates: Vec<Suggestion>,
}

impl SearchResult {
    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }
}

fn score(candidate: &ErrorDescriptor, query: &ErrorDescriptor) -> u32 {
    let mut score = 0;
    if candidate.normalized == query.normalized {
        score += EXACT_MATCH_SCORE;
    }
    if let (Some(a), Some(b)) = (&candidate.code, &query.code) {
        if a.eq_ignore_ascii_case(b) {
            score += CODE_MATCH_SCORE;
        }
    }
    if !query.resource_type.is_empty() && candidate.resource_type == query.resource_type {
        score += RESOURCE_MATCH_SCORE;
    }
    if candidate.environment.is_some() && candidate.environment == query.environment {
        score += ENVIRONMENT_MATCH_SCORE;
    }
    if candidate.category == query.category {
        score += CATEGORY_MATCH_SCORE;
    }
    score
}

fn by_rank(a: &Suggestion, b: &Suggestion) -> Ordering {
    b.rank
        .partial_cmp(&a.rank)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.solution.solution_id.cmp(&b.solution.solution_id))
}

/// Searches, records and learns from errors
#[derive(Clone)]
pub struct IssueEngine {
    store: Arc<dyn KnowledgeStore>,
}

impl std::fmt::Debug for IssueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueEngine").finish_non_exhaustive()
    }
}

impl IssueEngine {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, issue_id: &str) -> Result<Option<Issue>, KnowledgeError> {
        self.store.get(issue_id)
    }

    /// Rank every known solution against `query`
    #[instrument(skip(self, query), fields(code = ?query.code))]
    pub fn search(&self, query: &IssueQuery) -> Result<SearchResult, KnowledgeError> {
        let wanted = query.descriptor();
        let mut ranked: Vec<Suggestion> = Vec::new();
        for issue in self.store.list()? {
            let score = score(&issue.error, &wanted);
            if score == 0 || issue.solutions.is_empty() {
                continue;
            }
            for solution in &issue.solutions {
                ranked.push(Suggestion {
                    issue_id: issue.issue_id.clone(),
                    rank: f64::from(score) + solution.success_rate.percentage / 100.0,
                    score,
                    solution: solution.clone(),
                });
            }
        }
        ranked.sort_by(by_rank);
        debug!(candidates = ranked.len(), "Knowledge base searched");

        let mut ranked = ranked.into_iter();
        Ok(SearchResult {
            top: ranked.next(),
            alternates: ranked.collect(),
        })
    }

    /// Read-modify-write one issue with optimistic retry
    fn update<T>(
        &self,
        issue_id: &str,
        mut change: impl FnMut(&mut Issue) -> Result<T, KnowledgeError>,
    ) -> Result<(Issue, T), KnowledgeError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .get(issue_id)?
                .ok_or_else(|| KnowledgeError::IssueNotFound(issue_id.to_string()))?;
            let expected = current.revision;
            let mut next = current;
            let value = change(&mut next)?;
            match self.store.compare_and_swap(Some(expected), next)? {
                CasResult::Swapped(stored) => return Ok((stored, value)),
                CasResult::Conflict => debug!(issue_id, attempt, "Retrying issue update"),
            }
        }
        Err(KnowledgeError::Contention {
            issue_id: issue_id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Record an occurrence; the first sighting creates a zero-solution issue
    #[instrument(skip(self, query))]
    pub fn record_error(&self, query: &IssueQuery) -> Result<Issue, KnowledgeError> {
        let descriptor = query.descriptor();
        let id = issue_id(&descriptor.normalized, &descriptor.resource_type);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let (expected, next) = match self.store.get(&id)? {
                Some(mut existing) => {
                    existing.occurrence_count += 1;
                    existing.last_seen = now;
                    (Some(existing.revision), existing)
                }
                None => {
                    info!(issue_id = %id, category = %descriptor.category, "Recording new issue");
                    (
                        None,
                        Issue {
                            issue_id: id.clone(),
                            revision: 0,
                            first_seen: now,
                            last_seen: now,
                            occurrence_count: 1,
                            error: descriptor.clone(),
                            solutions: Vec::new(),
                            tags: Vec::new(),
                            related: Vec::new(),
                        },
                    )
                }
            };
            if let CasResult::Swapped(stored) = self.store.compare_and_swap(expected, next)? {
                return Ok(stored);
            }
        }
        Err(KnowledgeError::Contention {
            issue_id: id,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Attach a solution; adding the same description twice is a no-op
    #[instrument(skip(self, solution))]
    pub fn add_solution(
        &self,
        issue_id: &str,
        solution: NewSolution,
    ) -> Result<Solution, KnowledgeError> {
        let id = solution_id(issue_id, &solution.description);
        let (_, added) = self.update(issue_id, |issue| {
            if let Some(existing) = issue.solution(&id) {
                return Ok(existing.clone());
            }
            let added = Solution {
                solution_id: id.clone(),
                description: solution.description.clone(),
                category: solution.category.clone(),
                remediation_steps: solution.remediation_steps.clone(),
                automation: solution.automation.clone(),
                success_rate: SuccessRate::default(),
                avg_resolution_time: None,
                first_used: None,
                last_used: None,
            };
            issue.solutions.push(added.clone());
            Ok(added)
        })?;
        Ok(added)
    }

    /// Learn from one attempt at applying a solution
    #[instrument(skip(self))]
    pub fn record_attempt(
        &self,
        issue_id: &str,
        solution_id: &str,
        success: bool,
        duration: Duration,
    ) -> Result<Solution, KnowledgeError> {
        let (_, solution) = self.update(issue_id, |issue| {
            let solution = issue.solution_mut(solution_id).ok_or_else(|| {
                KnowledgeError::SolutionNotFound {
                    issue_id: issue_id.to_string(),
                    solution_id: solution_id.to_string(),
                }
            })?;
            solution.record_attempt(success, duration.as_secs_f64(), Utc::now());
            Ok(solution.clone())
        })?;
        info!(
            issue_id,
            solution_id,
            success,
            percentage = solution.success_rate.percentage,
            "Recorded resolution attempt"
        );
        Ok(solution)
    }

    pub fn statistics(&self) -> Result<Statistics, KnowledgeError> {
        Ok(Statistics::compute(&self.store.list()?))
    }

    /// Step descriptor for an automatable solution, in the remediation phase
    pub fn proposed_fix(
        &self,
        issue_id: &str,
        solution_id: &str,
    ) -> Result<StepDescriptor, KnowledgeError> {
        let issue = self
            .store
            .get(issue_id)?
            .ok_or_else(|| KnowledgeError::IssueNotFound(issue_id.to_string()))?;
        let solution =
            issue
                .solution(solution_id)
                .ok_or_else(|| KnowledgeError::SolutionNotFound {
                    issue_id: issue_id.to_string(),
                    solution_id: solution_id.to_string(),
                })?;
        let automation = solution
            .automation
            .as_ref()
            .ok_or_else(|| KnowledgeError::NotAutomatable(solution_id.to_string()))?;

        let mut arguments = automation.arguments.clone();
        arguments.insert("capability".to_string(), automation.capability.clone().into());
        arguments.insert("issue_id".to_string(), issue_id.into());
        arguments.insert("solution_id".to_string(), solution_id.into());

        Ok(StepDescriptor {
            id: format!("fix-{solution_id}"),
            name: solution.description.clone(),
            command: automation.operation.clone(),
            arguments,
            phase: REMEDIATION_PHASE.to_string(),
            index: 1,
        })
    }
}
