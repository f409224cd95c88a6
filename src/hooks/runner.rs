//! Sequential hook execution for one lifecycle point.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::config::{Hook, HookAction, LifecyclePoint};
use super::context::{ContextResolver, DEFAULT_MAX_DOCUMENT_BYTES};
use crate::capability::{CapabilityInput, CapabilityRegistry};

/// Values exposed to hooks about where the run is
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub run_id: String,
    pub phase: Option<String>,
    pub step: Option<String>,
    /// Working directory for scripts and base for document references
    pub base_dir: PathBuf,
    pub extra: BTreeMap<String, String>,
}

impl HookContext {
    fn as_map(&self, point: LifecyclePoint, environment: &str) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert("run_id".to_string(), self.run_id.clone());
        map.insert("lifecycle_point".to_string(), point.to_string());
        map.insert("environment".to_string(), environment.to_string());
        if let Some(phase) = &self.phase {
            map.insert("phase".to_string(), phase.clone());
        }
        if let Some(step) = &self.step {
            map.insert("step".to_string(), step.clone());
        }
        map
    }
}

/// How one hook ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    Success,
    Failed(String),
    TimedOut,
    /// Context-injection hooks are never executed
    Injected { rejected: Vec<String> },
}

impl HookResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Injected { .. })
    }

    fn describe(&self) -> String {
        match self {
            Self::Success => "succeeded".to_string(),
            Self::Failed(reason) => reason.clone(),
            Self::TimedOut => "timed out".to_string(),
            Self::Injected { .. } => "injected".to_string(),
        }
    }
}

/// Record of one executed hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTrace {
    pub name: String,
    pub kind: &'static str,
    pub result: HookResult,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStatus {
    Ok,
    BlockingFailure { hook: String, reason: String },
}

/// Outcome of running every hook at a lifecycle point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub point: LifecyclePoint,
    pub status: HookStatus,
    /// Hooks that actually ran; environment-filtered hooks are absent
    pub executed: Vec<HookTrace>,
    pub warnings: Vec<String>,
    /// Combined blob from context-injection hooks
    pub injected_context: Option<String>,
}

impl HookOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == HookStatus::Ok
    }

    pub fn executed_names(&self) -> Vec<&str> {
        self.executed.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Runs hooks in declared order, stopping at the first blocking failure
#[derive(Debug, Clone, Default)]
pub struct HookRunner {
    capabilities: CapabilityRegistry,
    max_document_bytes: Option<u64>,
}

impl HookRunner {
    pub fn new(capabilities: CapabilityRegistry) -> Self {
        Self {
            capabilities,
            max_document_bytes: None,
        }
    }

    pub fn with_max_document_bytes(mut self, max: u64) -> Self {
        self.max_document_bytes = Some(max);
        self
    }

    #[instrument(skip(self, hooks, context), fields(run_id = %context.run_id, count = hooks.len()))]
    pub async fn run(
        &self,
        hooks: &[Hook],
        point: LifecyclePoint,
        environment: &str,
        context: &HookContext,
    ) -> HookOutcome {
        let mut outcome = HookOutcome {
            point,
            status: HookStatus::Ok,
            executed: Vec::new(),
            warnings: Vec::new(),
            injected_context: None,
        };
        let mut injected = Vec::new();
        let vars = context.as_map(point, environment);

        for hook in hooks {
            if !hook.applies_to(environment) {
                debug!(hook = %hook.name, environment, "Skipping hook outside its environments");
                continue;
            }

            let started = Instant::now();
            let result = match &hook.action {
                HookAction::Script { command } => {
                    self.run_script(command, hook.timeout, context, &vars).await
                }
                HookAction::Capability {
                    capability,
                    parameters,
                } => {
                    self.run_capability(capability, parameters, hook.timeout, &vars)
                        .await
                }
                HookAction::ContextInjection { prompt, documents } => {
                    let resolved = ContextResolver::new(&context.base_dir)
                        .with_max_bytes(
                            self.max_document_bytes
                                .unwrap_or(DEFAULT_MAX_DOCUMENT_BYTES),
                        )
                        .resolve(prompt, documents);
                    if !resolved.blob.is_empty() {
                        injected.push(resolved.blob);
                    }
                    HookResult::Injected {
                        rejected: resolved.rejected,
                    }
                }
            };

            if let HookResult::Injected { rejected } = &result {
                for r in rejected {
                    outcome
                        .warnings
                        .push(format!("hook '{}' rejected reference {r}", hook.name));
                }
            }

            let success = result.is_success();
            let reason = result.describe();
            outcome.executed.push(HookTrace {
                name: hook.name.clone(),
                kind: hook.action.kind(),
                result,
                duration: started.elapsed(),
            });

            if success {
                debug!(hook = %hook.name, %point, "Hook succeeded");
                continue;
            }

            if hook.is_blocking() {
                warn!(hook = %hook.name, %point, %reason, "Blocking hook failed");
                outcome.status = HookStatus::BlockingFailure {
                    hook: hook.name.clone(),
                    reason,
                };
                break;
            }

            warn!(hook = %hook.name, %point, %reason, "Non-blocking hook failed");
            outcome
                .warnings
                .push(format!("hook '{}' failed: {reason}", hook.name));
        }

        if !injected.is_empty() {
            outcome.injected_context = Some(injected.join("\n\n"));
        }
        info!(
            %point,
            executed = outcome.executed.len(),
            ok = outcome.is_ok(),
            "Lifecycle hooks finished"
        );
        outcome
    }

    async fn run_script(
        &self,
        command: &str,
        timeout: Duration,
        context: &HookContext,
        vars: &BTreeMap<String, String>,
    ) -> HookResult {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !context.base_dir.as_os_str().is_empty() {
            cmd.current_dir(&context.base_dir);
        }
        for (key, value) in vars {
            cmd.env(format!("RUNWARDEN_{}", key.to_uppercase()), value);
        }

        match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => HookResult::TimedOut,
            Ok(Err(e)) => HookResult::Failed(format!("failed to spawn: {e}")),
            Ok(Ok(output)) if output.status.success() => HookResult::Success,
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                HookResult::Failed(format!("exit {code}: {}", stderr.trim()))
            }
        }
    }

    async fn run_capability(
        &self,
        name: &str,
        parameters: &serde_json::Value,
        timeout: Duration,
        vars: &BTreeMap<String, String>,
    ) -> HookResult {
        let input = CapabilityInput {
            context: vars.clone(),
            parameters: parameters.clone(),
        };
        match tokio::time::timeout(timeout, self.capabilities.invoke(name, &input)).await {
            Err(_) => HookResult::TimedOut,
            Ok(Err(e)) => HookResult::Failed(e.to_string()),
            Ok(Ok(output)) if output.success => HookResult::Success,
            Ok(Ok(output)) => HookResult::Failed(output.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityError, CapabilityOutput};
    use crate::hooks::config::FailureMode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn context(dir: &TempDir) -> HookContext {
        HookContext {
            run_id: "acme/widgets/r1".to_string(),
            phase: Some("build".to_string()),
            step: None,
            base_dir: dir.path().to_path_buf(),
            extra: BTreeMap::new(),
        }
    }

    fn script(name: &str, command: &str, required: bool) -> Hook {
        let mut hook = Hook::script(name, command, TIMEOUT);
        hook.required = required;
        hook
    }

    #[tokio::test]
    async fn test_blocking_failure_short_circuits() {
        let dir = TempDir::new().unwrap();
        let hooks = vec![
            script("critical", "exit 1", true),
            script("optional", "touch ran-second", false),
        ];
        let outcome = HookRunner::default()
            .run(&hooks, LifecyclePoint::PrePhase, "test", &context(&dir))
            .await;

        assert!(matches!(
            outcome.status,
            HookStatus::BlockingFailure { ref hook, .. } if hook == "critical"
        ));
        assert_eq!(outcome.executed_names(), vec!["critical"]);
        assert!(!dir.path().join("ran-second").exists());
    }

    #[tokio::test]
    async fn test_optional_failure_is_a_warning() {
        let dir = TempDir::new().unwrap();
        let hooks = vec![
            script("optional", "exit 3", false),
            script("after", "true", true),
        ];
        let outcome = HookRunner::default()
            .run(&hooks, LifecyclePoint::PostStep, "test", &context(&dir))
            .await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.executed.len(), 2);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("exit 3"));
    }

    #[tokio::test]
    async fn test_warn_mode_downgrades_required_hook() {
        let dir = TempDir::new().unwrap();
        let mut hook = script("lint", "exit 1", true);
        hook.failure_mode = FailureMode::Warn;
        let outcome = HookRunner::default()
            .run(&[hook], LifecyclePoint::PreStep, "test", &context(&dir))
            .await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_environment_filter_skips_hook() {
        let dir = TempDir::new().unwrap();
        let mut prod_only = script("deploy-check", "exit 1", true);
        prod_only.environments = vec!["prod".to_string()];
        let outcome = HookRunner::default()
            .run(&[prod_only], LifecyclePoint::PrePhase, "test", &context(&dir))
            .await;
        assert!(outcome.is_ok());
        assert!(outcome.executed.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_blocks() {
        let dir = TempDir::new().unwrap();
        let mut slow = script("slow", "sleep 5", true);
        slow.timeout = Duration::from_millis(100);
        let outcome = HookRunner::default()
            .run(&[slow], LifecyclePoint::PreRun, "test", &context(&dir))
            .await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.executed[0].result, HookResult::TimedOut);
    }

    #[tokio::test]
    async fn test_script_sees_context_env() {
        let dir = TempDir::new().unwrap();
        let hook = script(
            "env",
            "test \"$RUNWARDEN_PHASE\" = build && test \"$RUNWARDEN_ENVIRONMENT\" = staging",
            true,
        );
        let outcome = HookRunner::default()
            .run(&[hook], LifecyclePoint::PrePhase, "staging", &context(&dir))
            .await;
        assert!(outcome.is_ok());
    }

    struct Counting {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl Capability for Counting {
        fn name(&self) -> &str {
            "counter"
        }

        async fn invoke(
            &self,
            input: &CapabilityInput,
        ) -> Result<CapabilityOutput, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(input.context.get("phase").map(String::as_str), Some("build"));
            Ok(CapabilityOutput {
                success: self.succeed,
                message: "nope".to_string(),
            })
        }
    }

    fn capability_hook(name: &str) -> Hook {
        Hook {
            name: name.to_string(),
            action: HookAction::Capability {
                capability: name.to_string(),
                parameters: serde_json::Value::Null,
            },
            required: true,
            timeout: TIMEOUT,
            environments: Vec::new(),
            failure_mode: FailureMode::Stop,
        }
    }

    #[tokio::test]
    async fn test_capability_hook_delegates() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            succeed: false,
        });
        let mut registry = CapabilityRegistry::new();
        registry.register(counter.clone());

        let outcome = HookRunner::new(registry)
            .run(
                &[capability_hook("counter")],
                LifecyclePoint::PostPhase,
                "test",
                &context(&dir),
            )
            .await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome.status,
            HookStatus::BlockingFailure { ref reason, .. } if reason == "nope"
        ));
    }

    #[tokio::test]
    async fn test_unknown_capability_fails() {
        let dir = TempDir::new().unwrap();
        let outcome = HookRunner::default()
            .run(
                &[capability_hook("missing")],
                LifecyclePoint::PostPhase,
                "test",
                &context(&dir),
            )
            .await;
        assert!(matches!(
            outcome.status,
            HookStatus::BlockingFailure { ref reason, .. } if reason == "unknown capability: missing"
        ));
    }

    #[tokio::test]
    async fn test_context_injection_always_succeeds() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("guide.md"), "Be careful.").unwrap();
        let hook = Hook {
            name: "guide".to_string(),
            action: HookAction::ContextInjection {
                prompt: "Follow @guide.md".to_string(),
                documents: vec!["../escape.md".to_string()],
            },
            required: true,
            timeout: TIMEOUT,
            environments: Vec::new(),
            failure_mode: FailureMode::Stop,
        };
        let outcome = HookRunner::default()
            .run(&[hook], LifecyclePoint::PrePhase, "test", &context(&dir))
            .await;
        assert!(outcome.is_ok());
        let blob = outcome.injected_context.unwrap();
        assert!(blob.contains("Be careful."));
        assert_eq!(outcome.warnings.len(), 1);
    }
}
