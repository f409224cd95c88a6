//! Error text normalization, fingerprinting and categorization.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Variable tokens and their placeholders, applied in order
static PLACEHOLDERS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r#"arn:aws[a-z\-]*:[^\s"',]+"#, "<arn>"),
        (
            r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<uuid>",
        ),
        (
            r"\b\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(\.\d+)?(z|[+\-]\d{2}:?\d{2})?",
            "<timestamp>",
        ),
        (r"\b\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}", "<timestamp>"),
        (r"\b\d{4}-\d{2}-\d{2}\b", "<date>"),
        (r"\b\d{2}:\d{2}:\d{2}(\.\d+)?\b", "<time>"),
        (
            r"\b(request[ _\-]?id|req[_\-]id|correlation[ _\-]?id|trace[ _\-]?id)(\s*[:=]\s*|\s+)[a-z0-9\-]+",
            "$1: <request-id>",
        ),
        (r"\b\d{12}\b", "<account>"),
        (r"\b\d{1,3}(\.\d{1,3}){3}(:\d+)?\b", "<ip>"),
        (r"\b[0-9a-f]{16,}\b", "<hex>"),
        (r"\b\d{5,}\b", "<n>"),
    ]
    .into_iter()
    .map(|(pattern, placeholder)| (Regex::new(pattern).unwrap(), placeholder))
    .collect()
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Canonical form of an error message: lower-cased, variable tokens
/// replaced, whitespace collapsed
pub fn normalize(message: &str) -> String {
    let mut text = message.to_lowercase();
    for (pattern, placeholder) in PLACEHOLDERS.iter() {
        text = pattern.replace_all(&text, *placeholder).into_owned();
    }
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Content-addressed issue id
pub fn issue_id(normalized: &str, resource_type: &str) -> String {
    short_hash(&format!("{normalized}|{resource_type}"))
}

/// Content-addressed solution id
pub fn solution_id(issue_id: &str, description: &str) -> String {
    short_hash(&format!("{issue_id}|{description}"))
}

/// Coarse domain classification; only affects search and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Permission,
    Configuration,
    Resource,
    State,
    Network,
    Quota,
    #[default]
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::Configuration => "configuration",
            Self::Resource => "resource",
            Self::State => "state",
            Self::Network => "network",
            Self::Quota => "quota",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Permission,
        &[
            "access denied",
            "accessdenied",
            "permission",
            "forbidden",
            "unauthorized",
            "not authorized",
            "authentication",
            "credentials",
        ],
    ),
    (
        ErrorCategory::Quota,
        &[
            "quota",
            "limit exceeded",
            "limitexceeded",
            "rate limit",
            "throttl",
            "too many requests",
        ],
    ),
    (
        ErrorCategory::Network,
        &[
            "timed out",
            "timeout",
            "connection refused",
            "connection reset",
            "could not resolve",
            "dns",
            "unreachable",
            "network",
        ],
    ),
    (
        ErrorCategory::Resource,
        &[
            "not found",
            "notfound",
            "does not exist",
            "no such",
            "already exists",
            "alreadyexists",
        ],
    ),
    (
        ErrorCategory::State,
        &[
            "conflict",
            "in use",
            "locked",
            "invalid state",
            "dependency",
            "in progress",
            "not ready",
        ],
    ),
    (
        ErrorCategory::Configuration,
        &[
            "invalid",
            "config",
            "missing required",
            "malformed",
            "parameter",
            "unsupported",
        ],
    ),
];

/// Keyword classification; first matching category wins
pub fn categorize(message: &str) -> ErrorCategory {
    let text = message.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map_or(ErrorCategory::Unknown, |(category, _)| *category)
}
