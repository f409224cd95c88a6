use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{CapabilityRegistry, CommandCapability};
use crate::hooks::{HookAction, HooksConfig, RawHook};
use crate::supervisor::{ExecutionMode, SupervisorSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub agent: AgentConfig,
    pub supervisor: SupervisorConfig,
    /// Inline hook declarations keyed by lifecycle point
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<RawHook>>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    /// Programs that capability hooks delegate to, keyed by capability name
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the per-run ledgers
    pub ledger: String,
    /// Directory for log files
    pub logs: String,
    /// Optional hooks document (JSON or YAML), merged after inline hooks
    #[serde(default)]
    pub hooks_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Program that executes delegated steps
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Maximum seconds a single delegation may take (default: 1800 = 30 min)
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
}

fn default_step_timeout() -> u64 {
    1800 // 30 minutes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Environment name matched against hook allow-lists
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Timeout for hooks that do not declare their own (default: 60)
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_secs: u64,
    /// Check step results against git/GitHub through the `gh` CLI
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_environment() -> String {
    "local".to_string()
}

fn default_hook_timeout() -> u64 {
    60
}

fn default_verify() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write logs to a file under the logs path instead of stderr
    #[serde(default)]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Disable to run without consulting the issue knowledge base
    #[serde(default = "default_knowledge_enabled")]
    pub enabled: bool,
    /// Knowledge base document
    #[serde(default = "default_knowledge_path")]
    pub path: String,
}

fn default_knowledge_enabled() -> bool {
    true
}

fn default_knowledge_path() -> String {
    ".runwarden/knowledge.json".to_string()
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_knowledge_enabled(),
            path: default_knowledge_path(),
        }
    }
}

impl Config {
    /// Project-local config file
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".runwarden/config.toml")
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so runwarden works without config files
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let project_config = Self::project_config_path();
        if project_config.exists() {
            builder = builder.add_source(config::File::from(project_config));
        }

        // User config in ~/.config/runwarden/ (optional global overrides)
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("runwarden").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables, e.g. RUNWARDEN__AGENT__COMMAND
        builder = builder.add_source(
            config::Environment::with_prefix("RUNWARDEN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Save config to .runwarden/config.toml
    pub fn save(&self) -> Result<()> {
        let config_path = Self::project_config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create runwarden config directory")?;
        }

        let toml_str =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;

        Ok(())
    }

    fn absolute(path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        Self::absolute(&self.paths.ledger)
    }

    pub fn logs_path(&self) -> PathBuf {
        Self::absolute(&self.paths.logs)
    }

    pub fn knowledge_path(&self) -> PathBuf {
        Self::absolute(&self.knowledge.path)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.hook_timeout_secs)
    }

    /// Inline hooks, with the hooks file's points replacing inline ones
    pub fn load_hooks(&self) -> Result<HooksConfig> {
        let mut hooks = HooksConfig::from_raw(self.hooks.clone(), self.hook_timeout())
            .context("Invalid hook declaration in configuration")?;
        if let Some(file) = &self.paths.hooks_file {
            let path = Self::absolute(file);
            let from_file = HooksConfig::load(&path, self.hook_timeout())
                .with_context(|| format!("Failed to load hooks from {}", path.display()))?;
            hooks = hooks.merge(from_file);
        }
        Ok(hooks)
    }

    /// Command-backed capabilities declared under `[capabilities]`
    pub fn capability_registry(&self) -> CapabilityRegistry {
        let base_dir = std::env::current_dir().unwrap_or_default();
        let mut registry = CapabilityRegistry::new();
        for (name, declared) in &self.capabilities {
            registry.register(Arc::new(
                CommandCapability::new(name, &declared.command, declared.args.clone())
                    .with_working_dir(&base_dir),
            ));
        }
        registry
    }

    /// Fail fast on capability hooks that nothing can serve
    pub fn check_capabilities(hooks: &HooksConfig, registry: &CapabilityRegistry) -> Result<()> {
        for (point, hook) in hooks.iter() {
            if let HookAction::Capability { capability, .. } = &hook.action {
                if !registry.contains(capability) {
                    bail!(
                        "{point} hook '{}' uses capability '{capability}', which is not declared under [capabilities]",
                        hook.name
                    );
                }
            }
        }
        Ok(())
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            environment: self.supervisor.environment.clone(),
            mode: self.supervisor.mode,
            step_timeout: Duration::from_secs(self.agent.timeout_secs),
            base_dir: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                ledger: ".runwarden/runs".to_string(),
                logs: ".runwarden/logs".to_string(),
                hooks_file: None,
            },
            agent: AgentConfig {
                command: "runwarden-agent".to_string(),
                args: Vec::new(),
                timeout_secs: default_step_timeout(),
            },
            supervisor: SupervisorConfig {
                environment: default_environment(),
                mode: ExecutionMode::Sequential,
                hook_timeout_secs: default_hook_timeout(),
                verify: default_verify(),
            },
            hooks: BTreeMap::new(),
            logging: LoggingConfig::default(),
            knowledge: KnowledgeConfig::default(),
            capabilities: BTreeMap::new(),
        }
    }
}
