use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::normalize::ErrorCategory;

/// The error an issue was fingerprinted from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Raw message as first seen
    pub message: String,
    pub normalized: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default)]
    pub category: ErrorCategory,
}

/// Attempt counters; `attempts == successes + failures`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SuccessRate {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    /// 0-100
    pub percentage: f64,
}

impl SuccessRate {
    pub fn record(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.percentage = f64::from(self.successes) * 100.0 / f64::from(self.attempts);
    }
}

/// Target of an automatable fix; turned into a remediation step, never
/// executed by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub capability: String,
    pub operation: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub solution_id: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub remediation_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<Automation>,
    #[serde(default)]
    pub success_rate: SuccessRate,
    /// Seconds, averaged over successful attempts only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_resolution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Solution {
    pub fn is_automatable(&self) -> bool {
        self.automation.is_some()
    }

    /// Update counters and timing after one attempt
    pub fn record_attempt(&mut self, success: bool, seconds: f64, at: DateTime<Utc>) {
        self.success_rate.record(success);
        if success {
            let n = f64::from(self.success_rate.successes);
            let previous = self.avg_resolution_time.unwrap_or(0.0);
            self.avg_resolution_time = Some(previous + (seconds - previous) / n);
        }
        if self.first_used.is_none() {
            self.first_used = Some(at);
        }
        self.last_used = Some(at);
    }
}

/// A deduplicated, previously seen error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    /// Bumped by the store on every successful compare-and-swap
    #[serde(default)]
    pub revision: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u32,
    pub error: ErrorDescriptor,
    #[serde(default)]
    pub solutions: Vec<Solution>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub related: Vec<String>,
}

impl Issue {
    pub fn solution(&self, solution_id: &str) -> Option<&Solution> {
        self.solutions.iter().find(|s| s.solution_id == solution_id)
    }

    pub fn solution_mut(&mut self, solution_id: &str) -> Option<&mut Solution> {
        self.solutions
            .iter_mut()
            .find(|s| s.solution_id == solution_id)
    }
}

/// Category with how many issues fall in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: ErrorCategory,
    pub count: usize,
}

/// Aggregate view over the whole knowledge base
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_issues: usize,
    /// Successful attempts across every solution
    pub total_resolutions: u32,
    /// Seconds, weighted by successful attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_resolution_time: Option<f64>,
    pub most_common_categories: Vec<CategoryCount>,
    /// Share (0-1) of solutions that carry an automation descriptor
    pub automation_rate: f64,
}

const TOP_CATEGORIES: usize = 5;

impl Statistics {
    pub fn compute(issues: &[Issue]) -> Self {
        let mut categories: BTreeMap<ErrorCategory, usize> = BTreeMap::new();
        let mut total_resolutions = 0u32;
        let mut weighted_time = 0.0;
        let mut solutions = 0usize;
        let mut automated = 0usize;

        for issue in issues {
            *categories.entry(issue.error.category).or_default() += 1;
            for solution in &issue.solutions {
                solutions += 1;
                if solution.is_automatable() {
                    automated += 1;
                }
                let successes = solution.success_rate.successes;
                total_resolutions += successes;
                if let Some(avg) = solution.avg_resolution_time {
                    weighted_time += avg * f64::from(successes);
                }
            }
        }

        let mut most_common: Vec<CategoryCount> = categories
            .into_iter()
            .map(|(category, count)| CategoryCount { category, count })
            .collect();
        // Stable sort keeps category order for ties
        most_common.sort_by(|a, b| b.count.cmp(&a.count));
        most_common.truncate(TOP_CATEGORIES);

        Self {
            total_issues: issues.len(),
            total_resolutions,
            avg_resolution_time: (total_resolutions > 0)
                .then(|| weighted_time / f64::from(total_resolutions)),
            most_common_categories: most_common,
            automation_rate: if solutions == 0 {
                0.0
            } else {
                automated as f64 / solutions as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution() -> Solution {
        Solution {
            solution_id: "s".to_string(),
            description: "grant role".to_string(),
            category: "permission".to_string(),
            remediation_steps: Vec::new(),
            automation: None,
            success_rate: SuccessRate::default(),
            avg_resolution_time: None,
            first_used: None,
            last_used: None,
        }
    }

    #[test]
    fn test_attempt_counters_stay_consistent() {
        let mut s = solution();
        let now = Utc::now();
        s.record_attempt(true, 10.0, now);
        s.record_attempt(false, 99.0, now);
        s.record_attempt(true, 20.0, now);
        let rate = s.success_rate;
        assert_eq!(rate.attempts, rate.successes + rate.failures);
        assert_eq!(rate.attempts, 3);
        assert!((rate.percentage - 200.0 / 3.0).abs() < 1e-9);
        // Failures do not count towards resolution time
        assert_eq!(s.avg_resolution_time, Some(15.0));
        assert_eq!(s.first_used, Some(now));
    }

    #[test]
    fn test_success_never_lowers_percentage() {
        let mut rate = SuccessRate::default();
        for outcome in [false, true, false, false, true] {
            rate.record(outcome);
            let before = rate.percentage;
            let mut next = rate;
            next.record(true);
            assert!(next.percentage >= before);
        }
    }
}
