//! Resolution of document references for context-injection hooks.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

/// Largest document a single reference may pull in
pub const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 64 * 1024;

// `@` must start the prompt or follow whitespace or an opening bracket, so
// `ops@example.com` is not a reference
static DOC_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s(\[])@([A-Za-z0-9_./\-]+\.[A-Za-z0-9]+)")
        .expect("document reference pattern")
});

/// Combined context and the references that were refused
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedContext {
    pub blob: String,
    pub rejected: Vec<String>,
}

/// Resolves `@relative/path.ext` references under a base directory
#[derive(Debug, Clone)]
pub struct ContextResolver {
    base_dir: PathBuf,
    max_bytes: u64,
}

impl ContextResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// References found in a prompt, in order of appearance, deduplicated
    pub fn references(prompt: &str) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        for cap in DOC_REF.captures_iter(prompt) {
            let r = cap[1].to_string();
            if !refs.contains(&r) {
                refs.push(r);
            }
        }
        refs
    }

    /// Expand a prompt plus explicit documents into one context blob
    pub fn resolve(&self, prompt: &str, documents: &[String]) -> ResolvedContext {
        let mut resolved = ResolvedContext::default();
        let mut sections = Vec::new();
        if !prompt.trim().is_empty() {
            sections.push(prompt.trim().to_string());
        }

        let mut refs = Self::references(prompt);
        for doc in documents {
            if !refs.contains(doc) {
                refs.push(doc.clone());
            }
        }

        for reference in refs {
            match self.read_document(&reference) {
                Ok(contents) => sections.push(format!("## {reference}\n\n{}", contents.trim_end())),
                Err(reason) => {
                    tracing::warn!(reference = %reference, %reason, "Rejected context reference");
                    resolved.rejected.push(format!("{reference}: {reason}"));
                }
            }
        }

        resolved.blob = sections.join("\n\n");
        resolved
    }

    fn read_document(&self, reference: &str) -> Result<String, String> {
        let relative = Path::new(reference);
        if relative.is_absolute() {
            return Err("absolute paths are not allowed".to_string());
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err("path escapes the base directory".to_string());
        }

        let base = self
            .base_dir
            .canonicalize()
            .map_err(|e| format!("base directory unavailable: {e}"))?;
        let full = base
            .join(relative)
            .canonicalize()
            .map_err(|e| format!("cannot open: {e}"))?;
        // Symlinks may still point outside the base
        if !full.starts_with(&base) {
            return Err("path escapes the base directory".to_string());
        }

        let size = std::fs::metadata(&full)
            .map_err(|e| format!("cannot stat: {e}"))?
            .len();
        if size > self.max_bytes {
            return Err(format!("{size} bytes exceeds limit of {}", self.max_bytes));
        }
        std::fs::read_to_string(&full).map_err(|e| format!("cannot read: {e}"))
    }
}
