//! Lifecycle hooks.
//!
//! Hooks are declared externally (configuration or a hooks file), normalized
//! once into [`Hook`] values, and executed by [`HookRunner`] at lifecycle
//! boundaries. Required hooks in `stop` mode halt the enclosing operation;
//! everything else only produces warnings.

mod config;
mod context;
mod runner;

use thiserror::Error;

pub use config::{
    FailureMode, Hook, HookAction, HooksConfig, LifecyclePoint, RawHook, RawHookKind, TypedHook,
};
pub use context::{ContextResolver, ResolvedContext};
pub use runner::{HookContext, HookOutcome, HookResult, HookRunner, HookStatus, HookTrace};

/// Errors that can occur while loading hook declarations
#[derive(Debug, Error)]
pub enum HookError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid hook declaration: {0}")]
    InvalidDeclaration(String),
}
